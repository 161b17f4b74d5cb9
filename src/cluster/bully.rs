//! Bully leader election over the membership control plane.
//!
//! The leader is the node with the highest id among the peer set. A
//! follower probes the leader's heartbeat endpoint every two seconds; on
//! failure it challenges every higher-id peer with `/election`. Any answer
//! means a higher node is alive and will take over; silence means this
//! node declares itself leader and announces via `/coordinator`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;

use super::membership::MembershipServer;
use super::{
    validate_node_id, Cluster, ClusterConfig, ClusterError, ControlPlane, JoinOutcome,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(2);
const ELECTION_TIMEOUT: Duration = Duration::from_secs(3);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

struct BullyState {
    peers: BTreeMap<String, String>,
    leader: String,
    advertised_addr: String,
    up: bool,
}

struct BullyShared {
    node_id: String,
    user: String,
    pass: String,
    manager_join: Option<String>,
    state: RwLock<BullyState>,
    http: reqwest::blocking::Client,
    shutdown: AtomicBool,
    electing: AtomicBool,
}

pub struct BullyCluster {
    shared: Arc<BullyShared>,
    manager_addr: String,
    server: Mutex<Option<MembershipServer>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl BullyCluster {
    pub fn new(config: ClusterConfig) -> Result<BullyCluster, ClusterError> {
        validate_node_id(&config.node)?;
        if config.user.len() < 4 || config.pass.len() < 4 {
            return Err(ClusterError::WeakCredentials);
        }

        let http = reqwest::blocking::Client::builder()
            .timeout(ELECTION_TIMEOUT)
            .build()?;

        let shared = Arc::new(BullyShared {
            node_id: config.node.clone(),
            user: config.user.clone(),
            pass: config.pass.clone(),
            manager_join: config.manager_join.clone(),
            state: RwLock::new(BullyState {
                peers: BTreeMap::new(),
                leader: String::new(),
                advertised_addr: String::new(),
                up: true,
            }),
            http,
            shutdown: AtomicBool::new(false),
            electing: AtomicBool::new(false),
        });

        Ok(BullyCluster {
            shared,
            manager_addr: config.manager_addr,
            server: Mutex::new(None),
            heartbeat: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// The membership server's resolved address, once started. Useful when
    /// the configured manager address binds port zero.
    pub fn manager_addr(&self) -> Option<std::net::SocketAddr> {
        self.server
            .lock()
            .expect("bully server lock poisoned")
            .as_ref()
            .map(|server| server.local_addr())
    }
}

impl Cluster for BullyCluster {
    fn start(&self) -> Result<(), ClusterError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let handler: Arc<dyn ControlPlane> = Arc::clone(&self.shared) as Arc<dyn ControlPlane>;
        let server = MembershipServer::start(
            &self.manager_addr,
            handler,
            &self.shared.user,
            &self.shared.pass,
        )?;
        let advertised = server.local_addr().to_string();
        self.shared.write_state().advertised_addr = advertised.clone();
        *self.server.lock().expect("bully server lock poisoned") = Some(server);

        match self.shared.manager_join.clone() {
            None => {
                let mut state = self.shared.write_state();
                state.leader = self.shared.node_id.clone();
                drop(state);
                tracing::info!(node = %self.shared.node_id, "bootstrapped as solo cluster leader");
            }
            Some(join_addr) => {
                tracing::info!(node = %self.shared.node_id, join = %join_addr, "requesting to join cluster");
                let outcome = self.shared.request_join(&join_addr, &advertised)?;
                let mut state = self.shared.write_state();
                for (id, addr) in outcome.peers {
                    if id != self.shared.node_id {
                        state.peers.insert(id, addr);
                    }
                }
                state.leader = outcome.leader;
            }
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || shared.heartbeat_loop());
        *self.heartbeat.lock().expect("bully heartbeat lock poisoned") = Some(handle);

        Ok(())
    }

    fn shutdown(&self) -> Result<(), ClusterError> {
        self.shared.write_state().up = false;
        self.shared.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self
            .heartbeat
            .lock()
            .expect("bully heartbeat lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
        if let Some(server) = self.server.lock().expect("bully server lock poisoned").take() {
            server.stop();
        }
        Ok(())
    }

    fn is_leader(&self) -> bool {
        ControlPlane::is_leader(self.shared.as_ref())
    }

    fn leader_id(&self) -> String {
        self.shared.read_state().leader.clone()
    }

    fn join(&self, node_id: &str, addr: &str) -> Result<(), ClusterError> {
        ControlPlane::join(self.shared.as_ref(), node_id, addr).map(|_| ())
    }

    fn remove(&self, node_id: &str) -> Result<(), ClusterError> {
        ControlPlane::remove(self.shared.as_ref(), node_id)
    }
}

impl BullyShared {
    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, BullyState> {
        self.state.read().expect("bully state lock poisoned")
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, BullyState> {
        self.state.write().expect("bully state lock poisoned")
    }

    fn request_join(&self, join_addr: &str, my_addr: &str) -> Result<JoinOutcome, ClusterError> {
        #[derive(Debug, Deserialize)]
        struct JoinResponse {
            #[serde(default)]
            peers: BTreeMap<String, String>,
            #[serde(default)]
            leader: String,
        }

        let response = self
            .http
            .post(format!("http://{join_addr}/join"))
            .basic_auth(&self.user, Some(&self.pass))
            .json(&json!({ "id": self.node_id, "addr": my_addr }))
            .send()
            .map_err(|err| ClusterError::JoinFailed {
                addr: join_addr.to_string(),
                reason: err.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ClusterError::JoinFailed {
                addr: join_addr.to_string(),
                reason: format!("response status: {}", response.status()),
            });
        }

        let body: JoinResponse = response.json().map_err(|err| ClusterError::JoinFailed {
            addr: join_addr.to_string(),
            reason: format!("invalid response body: {err}"),
        })?;

        tracing::info!(leader = %body.leader, peers = body.peers.len(), "joined cluster");
        Ok(JoinOutcome {
            peers: body.peers,
            leader: body.leader,
        })
    }

    fn heartbeat_loop(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let wake = Instant::now() + HEARTBEAT_INTERVAL;
            while Instant::now() < wake {
                if self.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                thread::sleep(SHUTDOWN_POLL);
            }

            let (leader, leader_addr) = {
                let state = self.read_state();
                (state.leader.clone(), state.peers.get(&state.leader).cloned())
            };

            if leader == self.node_id {
                continue;
            }

            let alive = match leader_addr {
                Some(addr) => self.probe_heartbeat(&addr),
                None => false,
            };

            if !alive {
                tracing::warn!(leader = %leader, "leader heartbeat failed, starting election");
                self.run_election();
            }
        }
    }

    fn probe_heartbeat(&self, addr: &str) -> bool {
        self.http
            .get(format!("http://{addr}/heartbeat"))
            .timeout(HEARTBEAT_TIMEOUT)
            .send()
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }

    fn run_election(&self) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        if self.electing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.election_round();
        self.electing.store(false, Ordering::SeqCst);
    }

    fn election_round(&self) {
        let (higher, all_peers) = {
            let state = self.read_state();
            let higher: Vec<(String, String)> = state
                .peers
                .iter()
                .filter(|(id, _)| id.as_str() > self.node_id.as_str())
                .map(|(id, addr)| (id.clone(), addr.clone()))
                .collect();
            let all: Vec<(String, String)> = state
                .peers
                .iter()
                .map(|(id, addr)| (id.clone(), addr.clone()))
                .collect();
            (higher, all)
        };

        for (id, addr) in &higher {
            match self.post_control(addr, "/election", ELECTION_TIMEOUT) {
                Ok(true) => {
                    tracing::info!(peer = %id, "higher node answered election, standing down");
                    return;
                }
                Ok(false) | Err(_) => {
                    tracing::debug!(peer = %id, "no election answer from higher node");
                }
            }
        }

        self.write_state().leader = self.node_id.clone();
        tracing::info!(node = %self.node_id, "no higher node answered, taking leadership");

        for (id, addr) in &all_peers {
            match self.post_control(addr, "/coordinator", HEARTBEAT_TIMEOUT) {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    tracing::warn!(peer = %id, "failed to announce coordinator");
                }
            }
        }
    }

    fn post_control(
        &self,
        addr: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<bool, reqwest::Error> {
        let response = self
            .http
            .post(format!("http://{addr}{path}"))
            .basic_auth(&self.user, Some(&self.pass))
            .json(&json!({ "id": self.node_id }))
            .timeout(timeout)
            .send()?;
        Ok(response.status().is_success())
    }
}

impl ControlPlane for BullyShared {
    fn join(&self, node_id: &str, addr: &str) -> Result<JoinOutcome, ClusterError> {
        validate_node_id(node_id)?;
        tracing::info!(node_id = %node_id, node_addr = %addr, "request to join cluster received");

        let mut state = self.write_state();
        state.peers.insert(node_id.to_string(), addr.to_string());

        let mut peers = state.peers.clone();
        peers.insert(self.node_id.clone(), state.advertised_addr.clone());
        Ok(JoinOutcome {
            peers,
            leader: state.leader.clone(),
        })
    }

    fn remove(&self, node_id: &str) -> Result<(), ClusterError> {
        let mut state = self.write_state();
        if state.peers.remove(node_id).is_none() {
            tracing::debug!(node_id = %node_id, "remove for unknown node ignored");
        } else {
            tracing::info!(node_id = %node_id, "node removed from cluster");
        }
        Ok(())
    }

    fn is_leader(&self) -> bool {
        self.read_state().leader == self.node_id
    }

    fn election_challenge(self: Arc<Self>, from: &str) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        tracing::debug!(from = %from, "answering election challenge with own election");
        thread::spawn(move || self.run_election());
    }

    fn coordinator(&self, leader: &str) {
        self.write_state().leader = leader.to_string();
    }

    fn is_up(&self) -> bool {
        !self.shutdown.load(Ordering::Relaxed) && self.read_state().up
    }
}
