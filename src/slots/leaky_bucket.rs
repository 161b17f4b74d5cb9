//! Leaky bucket slot: admission control that drains one unit per window.
//!
//! A read admits one request: it returns `"1"` and raises the level unless
//! the bucket is full, in which case it returns `"0"`. The level drains by
//! the number of windows elapsed since the previous read. Writes are
//! forbidden.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::auth::User;
use crate::conn::ConnId;

use super::{current_window_millis, AccessMap, Slot, SlotError};

#[derive(Debug)]
struct Level {
    value: i64,
    window: i64,
}

#[derive(Debug)]
pub struct LeakyBucketSlot {
    access: AccessMap,
    size: i64,
    rate_ms: i64,
    level: Mutex<Level>,
}

impl LeakyBucketSlot {
    pub fn new(
        bucket_size: u64,
        refresh_rate_ms: u64,
        users: &BTreeMap<String, String>,
    ) -> Result<LeakyBucketSlot, SlotError> {
        if bucket_size < 1 {
            return Err(SlotError::InvalidBucketSize);
        }
        if refresh_rate_ms < 1 {
            return Err(SlotError::InvalidRefreshRate);
        }
        let rate_ms = i64::try_from(refresh_rate_ms).map_err(|_| SlotError::InvalidRefreshRate)?;
        let size = i64::try_from(bucket_size).map_err(|_| SlotError::InvalidBucketSize)?;
        Ok(LeakyBucketSlot {
            access: AccessMap::from_config(users),
            size,
            rate_ms,
            level: Mutex::new(Level {
                value: 0,
                window: current_window_millis(rate_ms),
            }),
        })
    }
}

impl Slot for LeakyBucketSlot {
    fn read(&self) -> String {
        let mut level = self.level.lock().expect("leaky bucket lock poisoned");

        let current = current_window_millis(self.rate_ms);
        let drained = current - level.window;
        level.window = current;
        if drained > self.size {
            level.value = 0;
        } else {
            level.value = (level.value - drained).max(0);
        }

        if level.value == self.size {
            return "0".to_string();
        }
        level.value = (level.value + 1).min(self.size);
        "1".to_string()
    }

    fn write(&self, _data: &str, _origin: ConnId) -> Result<String, SlotError> {
        Err(SlotError::ReadOnly)
    }

    fn can_read(&self, user: Option<&User>) -> bool {
        self.access.allows_read(user)
    }

    fn can_write(&self, _user: Option<&User>) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{origin, user};
    use super::*;

    use std::thread;
    use std::time::Duration;

    #[test]
    fn validates_parameters() {
        let users = BTreeMap::new();
        assert_eq!(
            LeakyBucketSlot::new(0, 10, &users).unwrap_err(),
            SlotError::InvalidBucketSize
        );
        assert_eq!(
            LeakyBucketSlot::new(10, 0, &users).unwrap_err(),
            SlotError::InvalidRefreshRate
        );
    }

    #[test]
    fn admits_until_full_then_rejects() {
        // One-minute window: nothing drains during the test.
        let slot = LeakyBucketSlot::new(3, 60_000, &BTreeMap::new()).unwrap();
        assert_eq!(slot.read(), "1");
        assert_eq!(slot.read(), "1");
        assert_eq!(slot.read(), "1");
        assert_eq!(slot.read(), "0");
        assert_eq!(slot.read(), "0");
    }

    #[test]
    fn drains_one_unit_per_window() {
        let slot = LeakyBucketSlot::new(1, 100, &BTreeMap::new()).unwrap();
        // Fill the one-slot bucket, then let at least one window pass; the
        // drained unit makes room for another admission.
        assert_eq!(slot.read(), "1");
        thread::sleep(Duration::from_millis(250));
        assert_eq!(slot.read(), "1");
    }

    #[test]
    fn writes_are_forbidden() {
        let slot = LeakyBucketSlot::new(3, 1000, &BTreeMap::new()).unwrap();
        assert_eq!(slot.write("1", origin()), Err(SlotError::ReadOnly));
        assert!(!slot.can_write(Some(&user("anyone"))));
    }
}
