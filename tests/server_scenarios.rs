//! End-to-end scenarios over a real TCP socket.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use ghoti::cluster::{Cluster, ClusterError, EmptyCluster};
use ghoti::config::{Config, SlotConfig, SlotKind};
use ghoti::conn::Dialect;
use ghoti::Server;

fn slot(kind: SlotKind) -> SlotConfig {
    SlotConfig {
        kind,
        timeout: None,
        bucket_size: None,
        refresh_rate: None,
        period: None,
        tokens_per_req: None,
        initial_value: None,
        users: BTreeMap::new(),
    }
}

fn base_config() -> Config {
    let mut config = Config::default();
    config.addr = "127.0.0.1:0".to_string();

    config.slots.insert(0, slot(SlotKind::SimpleMemory));
    config.slots.insert(1, slot(SlotKind::SimpleMemory));
    config.slots.insert(2, slot(SlotKind::SimpleMemory));

    let mut lease = slot(SlotKind::TimeoutMemory);
    lease.timeout = Some(1);
    config.slots.insert(3, lease);

    let mut guarded = slot(SlotKind::SimpleMemory);
    guarded.users.insert("pepe".to_string(), "r".to_string());
    guarded.users.insert("bobby".to_string(), "w".to_string());
    guarded.users.insert("sammy".to_string(), "a".to_string());
    config.slots.insert(4, guarded);

    config.slots.insert(7, slot(SlotKind::Atomic));

    for (name, password) in [
        ("pepe", "passw0rd"),
        ("bobby", "otherPassw0rd"),
        ("sammy", "samPassw0rd"),
    ] {
        config.users.insert(
            name.to_string(),
            ghoti::auth::User {
                name: name.to_string(),
                password: password.to_string(),
            },
        );
    }

    config
}

fn run_server(config: Config) -> (Server, SocketAddr) {
    let server = Server::start(&config, Arc::new(EmptyCluster::new())).expect("server start");
    let addr = server.local_addr().expect("server addr");
    (server, addr)
}

/// A test client with a persistent reader, so consecutive server lines are
/// never lost to a throwaway buffer.
struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).expect("connect to server");
        let reader = BufReader::new(stream.try_clone().expect("clone stream"));
        Client { stream, reader }
    }

    fn send(&mut self, request: &str) -> String {
        self.stream
            .write_all(request.as_bytes())
            .expect("send request");
        self.read_line()
    }

    fn write(&mut self, request: &str) {
        self.stream
            .write_all(request.as_bytes())
            .expect("send request");
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response");
        line
    }

    fn assert_closed(&mut self) {
        self.stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 1];
        match self.reader.read(&mut buf) {
            Ok(0) => {}
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
                ) => {}
            other => panic!("expected closed connection, got {other:?}"),
        }
    }
}

#[test]
fn write_then_read_memory_slot() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("w000Hello\n"), "v000Hello\n");
    assert_eq!(conn.send("r000\n"), "v000Hello\n");
    server.stop();
}

#[test]
fn repeated_write_matches_single_write() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("w001same\n"), "v001same\n");
    assert_eq!(conn.send("w001same\n"), "v001same\n");
    assert_eq!(conn.send("r001\n"), "v001same\n");
    server.stop();
}

#[test]
fn unknown_command_is_a_parse_error() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("a000Hello\n"), "exxx001\n");
    server.stop();
}

#[test]
fn short_frame_is_a_parse_error() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("r0\n"), "exxx001\n");
    server.stop();
}

#[test]
fn join_command_is_not_dispatched() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("j000\n"), "exxx001\n");
    server.stop();
}

#[test]
fn missing_slot_is_reported_with_its_number() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("r100\n"), "e100005\n");
    server.stop();
}

#[test]
fn username_is_acknowledged() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("upepe\n"), "vpepe\n");
    server.stop();
}

#[test]
fn invalid_username_errors_and_disconnects() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("upepe!\n"), "exxx002\n");
    conn.assert_closed();
    server.stop();
}

#[test]
fn password_without_username_errors_and_disconnects() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("p000\n"), "exxx003\n");
    conn.assert_closed();
    server.stop();
}

#[test]
fn wrong_password_errors_and_disconnects() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("upepe\n"), "vpepe\n");
    assert_eq!(conn.send("p12345\n"), "exxx004\n");
    conn.assert_closed();
    server.stop();
}

#[test]
fn unauthenticated_access_to_guarded_slot_is_denied() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("r004\n"), "e004008\n");
    assert_eq!(conn.send("w004Something\n"), "e004006\n");
    server.stop();
}

#[test]
fn read_only_user_can_read_but_not_write() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("upepe\n"), "vpepe\n");
    assert_eq!(conn.send("ppassw0rd\n"), "vpepe\n");
    assert_eq!(conn.send("r004\n"), "v004\n");
    assert_eq!(conn.send("w004Something\n"), "e004006\n");
    server.stop();
}

#[test]
fn write_only_user_can_write_but_not_read() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("ubobby\n"), "vbobby\n");
    assert_eq!(conn.send("potherPassw0rd\n"), "vbobby\n");
    assert_eq!(conn.send("r004\n"), "e004008\n");
    assert_eq!(conn.send("w004Something\n"), "v004Something\n");
    server.stop();
}

#[test]
fn admin_user_can_do_both() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("usammy\n"), "vsammy\n");
    assert_eq!(conn.send("psamPassw0rd\n"), "vsammy\n");
    assert_eq!(conn.send("w004Everything\n"), "v004Everything\n");
    assert_eq!(conn.send("r004\n"), "v004Everything\n");
    server.stop();
}

#[test]
fn quit_closes_the_connection() {
    let (server, addr) = run_server(base_config());
    let mut conn = Client::connect(addr);

    conn.write("q\n");
    conn.assert_closed();
    server.stop();
}

#[test]
fn lease_rejects_other_writers_until_expiry() {
    let (server, addr) = run_server(base_config());
    let mut owner = Client::connect(addr);
    let mut other = Client::connect(addr);

    assert_eq!(owner.send("w003Own\n"), "v003Own\n");
    assert_eq!(other.send("w003Other\n"), "e003007\n");
    assert_eq!(other.send("r003\n"), "v003Own\n");

    thread::sleep(Duration::from_millis(1100));
    assert_eq!(other.send("w003Other\n"), "v003Other\n");
    server.stop();
}

#[test]
fn atomic_slot_increments_across_connections() {
    let (server, addr) = run_server(base_config());
    let mut first = Client::connect(addr);
    let mut second = Client::connect(addr);

    assert_eq!(first.send("r007\n"), "v0071\n");
    assert_eq!(second.send("r007\n"), "v0072\n");
    assert_eq!(first.send("r007\n"), "v0073\n");
    assert_eq!(first.send("w00741\n"), "v00741\n");
    assert_eq!(second.send("r007\n"), "v00742\n");
    server.stop();
}

#[test]
fn token_bucket_exhausts_after_ten_reads() {
    let mut config = base_config();
    let mut bucket = slot(SlotKind::TokenBucket);
    bucket.bucket_size = Some(200);
    bucket.refresh_rate = Some(100);
    bucket.period = Some("second".to_string());
    bucket.tokens_per_req = Some(20);
    config.slots.insert(10, bucket);

    let (server, addr) = run_server(config);
    let mut conn = Client::connect(addr);

    // Wait for a refill window, then align just past a second boundary so
    // the eleven reads below land inside a single window.
    thread::sleep(Duration::from_millis(1000));
    let in_second = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .subsec_millis(),
    );
    thread::sleep(Duration::from_millis(
        (1030u64.saturating_sub(in_second)).max(30),
    ));

    for _ in 0..10 {
        assert_eq!(conn.send("r010\n"), "v01020\n");
    }
    assert_eq!(conn.send("r010\n"), "v0100\n");
    server.stop();
}

#[test]
fn broadcast_write_reaches_all_connections() {
    let mut config = base_config();
    config.slots.insert(5, slot(SlotKind::Broadcast));

    let (server, addr) = run_server(config);
    let mut sender = Client::connect(addr);
    let mut listener_one = Client::connect(addr);
    let mut listener_two = Client::connect(addr);

    // Make sure all three connections are registered before fanning out.
    assert_eq!(listener_one.send("r000\n"), "v000\n");
    assert_eq!(listener_two.send("r000\n"), "v000\n");
    assert_eq!(sender.send("r000\n"), "v000\n");

    // The sender sees the broadcast frame first, then its own write result
    // carrying the delivery summary.
    assert_eq!(sender.send("w005News\n"), "a005News\n");
    assert_eq!(sender.read_line(), "v0053/3/0\n");
    assert_eq!(listener_one.read_line(), "a005News\n");
    assert_eq!(listener_two.read_line(), "a005News\n");

    // The slot remembers the last published value.
    assert_eq!(listener_one.send("r005\n"), "v005News\n");
    server.stop();
}

#[test]
fn telnet_dialect_requires_crlf_frames() {
    let mut config = base_config();
    config.protocol = Dialect::Telnet;

    let (server, addr) = run_server(config);
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("w000Hi\n"), "exxx001\n");
    assert_eq!(conn.send("w000Hi\r\n"), "v000Hi\n");
    assert_eq!(conn.send("r000\r\n"), "v000Hi\n");
    server.stop();
}

struct Follower;

impl Cluster for Follower {
    fn start(&self) -> Result<(), ClusterError> {
        Ok(())
    }
    fn shutdown(&self) -> Result<(), ClusterError> {
        Ok(())
    }
    fn is_leader(&self) -> bool {
        false
    }
    fn leader_id(&self) -> String {
        "node1".to_string()
    }
    fn join(&self, _node_id: &str, _addr: &str) -> Result<(), ClusterError> {
        Ok(())
    }
    fn remove(&self, _node_id: &str) -> Result<(), ClusterError> {
        Ok(())
    }
}

#[test]
fn followers_redirect_to_the_leader() {
    let config = base_config();
    let server = Server::start(&config, Arc::new(Follower)).expect("server start");
    let addr = server.local_addr().expect("server addr");
    let mut conn = Client::connect(addr);

    assert_eq!(conn.send("w000x\n"), "exxx000node1\n");
    assert_eq!(conn.send("r000\n"), "exxx000node1\n");
    // Quit still works on a follower.
    conn.write("q\n");
    conn.assert_closed();
    server.stop();
}
