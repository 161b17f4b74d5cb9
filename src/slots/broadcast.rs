//! Broadcast slot: a write fans out to every connected client.
//!
//! The slot stores the last written value for reads; the write result is
//! the connection manager's `received/sent/errors` delivery summary rather
//! than the stored value.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::auth::User;
use crate::conn::ConnId;

use super::{AccessMap, Broadcaster, Slot, SlotError};

pub struct BroadcastSlot {
    access: AccessMap,
    slot_label: String,
    value: RwLock<String>,
    manager: Arc<dyn Broadcaster>,
}

impl BroadcastSlot {
    pub fn new(
        users: &BTreeMap<String, String>,
        manager: Arc<dyn Broadcaster>,
        slot: usize,
    ) -> BroadcastSlot {
        BroadcastSlot {
            access: AccessMap::from_config(users),
            slot_label: format!("{slot:03}"),
            value: RwLock::new(String::new()),
            manager,
        }
    }
}

impl Slot for BroadcastSlot {
    fn read(&self) -> String {
        self.value.read().expect("broadcast slot lock poisoned").clone()
    }

    fn write(&self, data: &str, _origin: ConnId) -> Result<String, SlotError> {
        {
            let mut value = self.value.write().expect("broadcast slot lock poisoned");
            *value = data.to_string();
        }

        let line = format!("a{}{}", self.slot_label, data);
        self.manager
            .broadcast(&line)
            .map_err(|err| SlotError::Broadcast(err.to_string()))
    }

    fn can_read(&self, user: Option<&User>) -> bool {
        self.access.allows_read(user)
    }

    fn can_write(&self, user: Option<&User>) -> bool {
        self.access.allows_write(user)
    }
}
