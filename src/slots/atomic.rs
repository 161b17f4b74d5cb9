//! Monotonic counter slot.
//!
//! Every read increments and returns the counter, so reads mutate and use
//! the exclusive lock. At `i64::MAX` the counter wraps to zero before the
//! increment-and-return.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::auth::User;
use crate::conn::ConnId;

use super::{parse_slot_integer, AccessMap, Slot, SlotError};

pub struct CounterSlot {
    access: AccessMap,
    value: Mutex<i64>,
}

impl CounterSlot {
    pub fn new(users: &BTreeMap<String, String>) -> CounterSlot {
        CounterSlot {
            access: AccessMap::from_config(users),
            value: Mutex::new(0),
        }
    }
}

impl Slot for CounterSlot {
    fn read(&self) -> String {
        let mut value = self.value.lock().expect("counter slot lock poisoned");
        if *value == i64::MAX {
            *value = 0;
        } else {
            *value += 1;
        }
        value.to_string()
    }

    fn write(&self, data: &str, _origin: ConnId) -> Result<String, SlotError> {
        let requested = parse_slot_integer(data)?;
        let mut value = self.value.lock().expect("counter slot lock poisoned");
        *value = requested;
        Ok(requested.to_string())
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
    fn reads_increment() {
        let slot = CounterSlot::new(&BTreeMap::new());
        assert_eq!(slot.read(), "1");
        assert_eq!(slot.read(), "2");
        assert_eq!(slot.read(), "3");
    }

    #[test]
    fn write_sets_without_incrementing() {
        let slot = CounterSlot::new(&BTreeMap::new());
        assert_eq!(slot.write("41", origin()).unwrap(), "41");
        assert_eq!(slot.read(), "42");
    }

    #[test]
    fn wraps_to_zero_at_max() {
        let slot = CounterSlot::new(&BTreeMap::new());
        slot.write(&i64::MAX.to_string(), origin()).unwrap();
        assert_eq!(slot.read(), "0");
        assert_eq!(slot.read(), "1");
    }

    #[test]
    fn rejects_bad_values() {
        let slot = CounterSlot::new(&BTreeMap::new());
        assert_eq!(slot.write("nope", origin()), Err(SlotError::NotAnInteger));
        assert_eq!(slot.write("-1", origin()), Err(SlotError::NegativeValue));
    }
}
