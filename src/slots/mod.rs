//! Slot engine: the typed data cells behind the wire protocol.
//!
//! A node exposes a fixed universe of [`SLOT_COUNT`] positions; each
//! configured position holds one slot whose behavior is chosen at startup
//! and immutable for the process lifetime. Every slot owns its own mutual
//! exclusion, so per-slot operations are linearizable and lock ordering
//! across slots never arises.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;

use crate::auth::User;
use crate::conn::ConnId;

mod atomic;
mod broadcast;
mod leaky_bucket;
mod memory;
mod ticker;
mod timeout;
mod token_bucket;

pub use atomic::CounterSlot;
pub use broadcast::BroadcastSlot;
pub use leaky_bucket::LeakyBucketSlot;
pub use memory::MemorySlot;
pub use ticker::TickerSlot;
pub use timeout::TimeoutSlot;
pub use token_bucket::{Period, TokenBucketSlot};

/// Number of addressable slot positions on a node.
pub const SLOT_COUNT: usize = 1000;

/// The configured slot universe: one optional slot per position.
pub type SlotTable = Vec<Option<Arc<dyn Slot>>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("permission denied to write slot")]
    LeaseHeld,
    #[error("this kind of slot cannot be used to write")]
    ReadOnly,
    #[error("data must be an integer")]
    NotAnInteger,
    #[error("data cannot be negative")]
    NegativeValue,
    #[error("timeout value must be bigger than zero")]
    InvalidTimeout,
    #[error("bucket size must be bigger than zero")]
    InvalidBucketSize,
    #[error("refresh rate cannot be zero")]
    InvalidRefreshRate,
    #[error("refresh rate cannot be bigger than the bucket size")]
    RefreshRateTooLarge,
    #[error("tokens per request cannot be zero")]
    InvalidTokensPerRequest,
    #[error("tokens per request cannot be bigger than the bucket size")]
    TokensPerRequestTooLarge,
    #[error("invalid period for token bucket slot: {0}")]
    InvalidPeriod(String),
    #[error("broadcast failed: {0}")]
    Broadcast(String),
}

/// The slot contract. Reads never fail; writes fail on malformed input,
/// a held lease, a read-only kind, or a failed broadcast.
pub trait Slot: Send + Sync {
    fn read(&self) -> String;
    fn write(&self, data: &str, origin: ConnId) -> Result<String, SlotError>;
    fn can_read(&self, user: Option<&User>) -> bool;
    fn can_write(&self, user: Option<&User>) -> bool;
}

/// Fan-out seam used by the broadcast slot; implemented by the connection
/// manager.
pub trait Broadcaster: Send + Sync {
    /// Deliver `line` to every connected client and report the outcome as
    /// the `received/sent/errors` triple.
    fn broadcast(&self, line: &str) -> Result<String, BroadcastError>;
}

#[derive(Debug, Error)]
#[error("{reason}")]
pub struct BroadcastError {
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capability {
    Read,
    Write,
    All,
}

impl Capability {
    fn parse(raw: &str) -> Option<Capability> {
        match raw {
            "r" => Some(Capability::Read),
            "w" => Some(Capability::Write),
            "a" => Some(Capability::All),
            _ => None,
        }
    }

    fn allows_read(self) -> bool {
        matches!(self, Capability::Read | Capability::All)
    }

    fn allows_write(self) -> bool {
        matches!(self, Capability::Write | Capability::All)
    }
}

/// Per-slot access control list.
///
/// An empty map grants everyone everything. A non-empty map grants only
/// the listed names their parsed capability; entries with an unknown
/// capability string stay listed but grant nothing.
#[derive(Debug, Clone, Default)]
pub struct AccessMap {
    grants: BTreeMap<String, Option<Capability>>,
}

impl AccessMap {
    pub fn from_config(users: &BTreeMap<String, String>) -> AccessMap {
        let grants = users
            .iter()
            .map(|(name, cap)| (name.clone(), Capability::parse(cap)))
            .collect();
        AccessMap { grants }
    }

    pub fn allows_read(&self, user: Option<&User>) -> bool {
        self.check(user, Capability::allows_read)
    }

    pub fn allows_write(&self, user: Option<&User>) -> bool {
        self.check(user, Capability::allows_write)
    }

    fn check(&self, user: Option<&User>, allowed: impl Fn(Capability) -> bool) -> bool {
        if self.grants.is_empty() {
            return true;
        }
        let Some(user) = user else {
            return false;
        };
        matches!(self.grants.get(&user.name), Some(Some(cap)) if allowed(*cap))
    }
}

/// Milliseconds since the unix epoch divided by the refresh rate; the time
/// bucket used by the leaky-bucket and ticker slots.
pub(crate) fn current_window_millis(rate_ms: i64) -> i64 {
    let now_ms = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    i64::try_from(now_ms).unwrap_or(i64::MAX) / rate_ms
}

/// Parse the non-negative base-10 integer accepted by slot writes.
pub(crate) fn parse_slot_integer(data: &str) -> Result<i64, SlotError> {
    let value: i64 = data.parse().map_err(|_| SlotError::NotAnInteger)?;
    if value < 0 {
        return Err(SlotError::NegativeValue);
    }
    Ok(value)
}
