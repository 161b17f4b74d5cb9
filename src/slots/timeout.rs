//! Leased memory slot: the last successful writer owns the cell until its
//! lease expires.
//!
//! Identity is the writing connection, not a user: the use case is short
//! exclusive leases tied to a live socket. A dropped connection simply
//! stops refreshing and forfeits the lease at the next expiry.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::auth::User;
use crate::conn::ConnId;

use super::{AccessMap, Slot, SlotError};

#[derive(Debug)]
struct Lease {
    value: String,
    owner: Option<ConnId>,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
pub struct TimeoutSlot {
    access: AccessMap,
    window: Duration,
    lease: Mutex<Lease>,
}

impl TimeoutSlot {
    pub fn new(timeout_secs: u64, users: &BTreeMap<String, String>) -> Result<TimeoutSlot, SlotError> {
        if timeout_secs < 1 {
            return Err(SlotError::InvalidTimeout);
        }
        Ok(TimeoutSlot {
            access: AccessMap::from_config(users),
            window: Duration::from_secs(timeout_secs),
            lease: Mutex::new(Lease {
                value: String::new(),
                owner: None,
                expires_at: None,
            }),
        })
    }
}

impl Slot for TimeoutSlot {
    fn read(&self) -> String {
        // Reads never extend the lease.
        self.lease.lock().expect("timeout slot lock poisoned").value.clone()
    }

    fn write(&self, data: &str, origin: ConnId) -> Result<String, SlotError> {
        let now = Instant::now();
        let mut lease = self.lease.lock().expect("timeout slot lock poisoned");

        let expired = match lease.expires_at {
            None => true,
            Some(expires_at) => now > expires_at,
        };

        if expired || lease.owner == Some(origin) {
            lease.owner = Some(origin);
            lease.value = data.to_string();
            lease.expires_at = Some(now + self.window);
            return Ok(lease.value.clone());
        }

        Err(SlotError::LeaseHeld)
    }

    fn can_read(&self, user: Option<&User>) -> bool {
        self.access.allows_read(user)
    }

    fn can_write(&self, user: Option<&User>) -> bool {
        self.access.allows_write(user)
    }
}
