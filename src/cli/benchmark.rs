//! The `benchmark` command: a fire-and-forget load generator.
//!
//! Opens a pool of persistent connections and pushes a 5% write / 95% read
//! mix over slots 000 and 001, printing throughput as it goes. Responses
//! are intentionally not read; the server's event pipeline absorbs or
//! drops them under its own flow control.

use std::io::Write;
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use clap::Args;
use rand::Rng;

use crate::config::DEFAULT_ADDR;

#[derive(Args, Debug)]
pub struct BenchmarkArgs {
    /// The host:port address of the server to benchmark.
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Number of concurrent connections to open.
    #[arg(long, default_value_t = 1000)]
    pub connections: usize,

    /// Number of full rounds over the connection pool.
    #[arg(long, default_value_t = 10_000)]
    pub rounds: usize,
}

pub fn execute(args: BenchmarkArgs) -> i32 {
    println!("Starting connections..");
    let mut conns = Vec::with_capacity(args.connections);
    for i in 0..args.connections {
        match connect(&args.addr) {
            Ok(conn) => conns.push(conn),
            Err(err) => {
                println!("Error to connect {i}: {err}");
            }
        }
        thread::sleep(Duration::from_millis(1));
    }

    if conns.is_empty() {
        println!("No connections could be established against {}", args.addr);
        return 1;
    }
    println!("Enabled {} connections", conns.len());

    let mut rng = rand::thread_rng();
    let start = Instant::now();
    for round in 0..args.rounds {
        if round % 100 == 0 && round > 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let calls = round * conns.len();
            println!(
                "Executed {calls} calls, elapsed {elapsed:.3} seconds, {:.1} tps",
                calls as f64 / elapsed
            );
        }

        for conn in &mut conns {
            let request: &[u8] = if rng.gen_range(0..100) < 5 {
                if rng.gen_range(0..10) < 5 {
                    b"w000test\n"
                } else {
                    b"w001test\n"
                }
            } else if rng.gen_range(0..10) < 5 {
                b"r000\n"
            } else {
                b"r001\n"
            };
            let _ = conn.write_all(request);
        }
    }

    0
}

fn connect(addr: &str) -> std::io::Result<TcpStream> {
    use std::net::ToSocketAddrs;
    let resolved = addr.to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "unresolvable address")
    })?;
    TcpStream::connect_timeout(&resolved, Duration::from_secs(10))
}
