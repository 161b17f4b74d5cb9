//! Plain memory slot: one string value, last writer wins.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::auth::User;
use crate::conn::ConnId;

use super::{AccessMap, Slot, SlotError};

pub struct MemorySlot {
    access: AccessMap,
    value: RwLock<String>,
}

impl MemorySlot {
    pub fn new(users: &BTreeMap<String, String>) -> MemorySlot {
        MemorySlot {
            access: AccessMap::from_config(users),
            value: RwLock::new(String::new()),
        }
    }
}

impl Slot for MemorySlot {
    fn read(&self) -> String {
        self.value.read().expect("memory slot lock poisoned").clone()
    }

    fn write(&self, data: &str, _origin: ConnId) -> Result<String, SlotError> {
        let mut value = self.value.write().expect("memory slot lock poisoned");
        *value = data.to_string();
        Ok(value.clone())
    }

    fn can_read(&self, user: Option<&User>) -> bool {
        self.access.allows_read(user)
    }

    fn can_write(&self, user: Option<&User>) -> bool {
        self.access.allows_write(user)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::origin;
    use super::*;

    #[test]
    fn empty_until_first_write() {
        let slot = MemorySlot::new(&BTreeMap::new());
        assert_eq!(slot.read(), "");
    }

    #[test]
    fn last_writer_wins() {
        let slot = MemorySlot::new(&BTreeMap::new());
        assert_eq!(slot.write("one", origin()).unwrap(), "one");
        assert_eq!(slot.write("two", origin()).unwrap(), "two");
        assert_eq!(slot.read(), "two");
    }

    #[test]
    fn repeated_write_is_idempotent() {
        let slot = MemorySlot::new(&BTreeMap::new());
        slot.write("same", origin()).unwrap();
        slot.write("same", origin()).unwrap();
        assert_eq!(slot.read(), "same");
    }
}
