//! Cluster membership and leadership.
//!
//! The data plane needs exactly two answers from the cluster: "am I the
//! leader" and "who is". Both must be answerable without blocking on
//! network I/O, so every implementation keeps its view in local state and
//! updates it from background threads.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

mod bully;
mod empty;
mod membership;

pub use bully::BullyCluster;
pub use empty::EmptyCluster;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
    #[error("join request to {addr} failed: {reason}")]
    JoinFailed { addr: String, reason: String },
    #[error("membership server failed to start: {0}")]
    MembershipStart(String),
    #[error("cluster user or password is too short")]
    WeakCredentials,
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Static cluster settings for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConfig {
    pub node: String,
    pub bind: String,
    pub user: String,
    pub pass: String,
    pub manager_type: String,
    pub manager_addr: String,
    pub manager_join: Option<String>,
}

pub trait Cluster: Send + Sync {
    /// Start the node's cluster machinery. Safe to call once per process;
    /// a second call is a no-op.
    fn start(&self) -> Result<(), ClusterError>;
    /// Stop background threads and release the control-plane listener.
    fn shutdown(&self) -> Result<(), ClusterError>;
    /// Whether this node currently believes it is the leader. Never blocks
    /// on network I/O.
    fn is_leader(&self) -> bool;
    /// The known leader's node id, or empty when unknown.
    fn leader_id(&self) -> String;
    /// Add a node to the peer set.
    fn join(&self, node_id: &str, addr: &str) -> Result<(), ClusterError>;
    /// Remove a node from the peer set.
    fn remove(&self, node_id: &str) -> Result<(), ClusterError>;
}

/// What a `/join` reply carries so the joining node can seed its view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JoinOutcome {
    pub peers: BTreeMap<String, String>,
    pub leader: String,
}

/// Operations the membership HTTP server needs from its cluster.
pub(crate) trait ControlPlane: Send + Sync {
    fn join(&self, node_id: &str, addr: &str) -> Result<JoinOutcome, ClusterError>;
    fn remove(&self, node_id: &str) -> Result<(), ClusterError>;
    fn is_leader(&self) -> bool;
    /// A lower-id node challenged us; answer by running our own election.
    fn election_challenge(self: Arc<Self>, from: &str);
    /// A peer declared itself leader.
    fn coordinator(&self, leader: &str);
    /// False once shutdown has begun; drives the heartbeat status code.
    fn is_up(&self) -> bool;
}

pub(crate) const MAX_NODE_ID_LEN: usize = 20;

pub(crate) fn validate_node_id(node_id: &str) -> Result<(), ClusterError> {
    if node_id.is_empty() || node_id.len() > MAX_NODE_ID_LEN {
        return Err(ClusterError::InvalidNodeId(node_id.to_string()));
    }
    Ok(())
}
