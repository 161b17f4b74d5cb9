//! Ticker slot: a countdown that loses one unit per refresh window.
//!
//! Reads report the current count after draining the windows elapsed since
//! the last observation (floored at zero). Writes set the count and realign
//! the window to now.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::auth::User;
use crate::conn::ConnId;

use super::{current_window_millis, parse_slot_integer, AccessMap, Slot, SlotError};

#[derive(Debug)]
struct Count {
    value: i64,
    window: i64,
}

#[derive(Debug)]
pub struct TickerSlot {
    access: AccessMap,
    rate_ms: i64,
    count: Mutex<Count>,
}

impl TickerSlot {
    pub fn new(
        refresh_rate_ms: u64,
        initial_value: u64,
        users: &BTreeMap<String, String>,
    ) -> Result<TickerSlot, SlotError> {
        if refresh_rate_ms < 1 {
            return Err(SlotError::InvalidRefreshRate);
        }
        let rate_ms = i64::try_from(refresh_rate_ms).map_err(|_| SlotError::InvalidRefreshRate)?;
        let value = i64::try_from(initial_value).map_err(|_| SlotError::NotAnInteger)?;
        Ok(TickerSlot {
            access: AccessMap::from_config(users),
            rate_ms,
            count: Mutex::new(Count {
                value,
                window: current_window_millis(rate_ms),
            }),
        })
    }
}

impl Slot for TickerSlot {
    fn read(&self) -> String {
        let mut count = self.count.lock().expect("ticker slot lock poisoned");

        let current = current_window_millis(self.rate_ms);
        let drained = current - count.window;
        count.window = current;
        count.value = (count.value - drained).max(0);

        count.value.to_string()
    }

    fn write(&self, data: &str, _origin: ConnId) -> Result<String, SlotError> {
        let requested = parse_slot_integer(data)?;
        let mut count = self.count.lock().expect("ticker slot lock poisoned");
        count.window = current_window_millis(self.rate_ms);
        count.value = requested;
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

    use std::thread;
    use std::time::Duration;

    #[test]
    fn validates_refresh_rate() {
        assert_eq!(
            TickerSlot::new(0, 5, &BTreeMap::new()).unwrap_err(),
            SlotError::InvalidRefreshRate
        );
    }

    #[test]
    fn holds_value_within_one_window() {
        // One-minute window: no decay during the test.
        let slot = TickerSlot::new(60_000, 5, &BTreeMap::new()).unwrap();
        assert_eq!(slot.read(), "5");
        assert_eq!(slot.read(), "5");
    }

    #[test]
    fn decays_and_floors_at_zero() {
        let slot = TickerSlot::new(20, 2, &BTreeMap::new()).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(slot.read(), "0");
    }

    #[test]
    fn write_resets_count_and_window() {
        let slot = TickerSlot::new(60_000, 1, &BTreeMap::new()).unwrap();
        assert_eq!(slot.write("9", origin()).unwrap(), "9");
        assert_eq!(slot.read(), "9");
        assert_eq!(slot.write("bad", origin()), Err(SlotError::NotAnInteger));
        assert_eq!(slot.write("-2", origin()), Err(SlotError::NegativeValue));
    }
}
