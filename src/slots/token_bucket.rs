//! Token bucket slot: a rate limiter refilled once per period window.
//!
//! Windows are integer seconds-since-epoch divided by the period length,
//! so every node observing the same clock agrees on the window boundary.
//! Reads take tokens; writes are forbidden.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::auth::User;
use crate::conn::ConnId;

use super::{AccessMap, Slot, SlotError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Second,
    Minute,
    Hour,
}

impl Period {
    pub fn parse(raw: &str) -> Result<Period, SlotError> {
        match raw {
            "second" => Ok(Period::Second),
            "minute" => Ok(Period::Minute),
            "hour" => Ok(Period::Hour),
            other => Err(SlotError::InvalidPeriod(other.to_string())),
        }
    }

    fn secs(self) -> u64 {
        match self {
            Period::Second => 1,
            Period::Minute => 60,
            Period::Hour => 3600,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u64,
    window: u64,
}

#[derive(Debug)]
pub struct TokenBucketSlot {
    access: AccessMap,
    size: u64,
    rate: u64,
    tokens_per_req: u64,
    period_secs: u64,
    bucket: Mutex<Bucket>,
}

impl TokenBucketSlot {
    pub fn new(
        period: Period,
        bucket_size: u64,
        refresh_rate: u64,
        tokens_per_req: u64,
        users: &BTreeMap<String, String>,
    ) -> Result<TokenBucketSlot, SlotError> {
        if bucket_size < 1 {
            return Err(SlotError::InvalidBucketSize);
        }
        if refresh_rate < 1 {
            return Err(SlotError::InvalidRefreshRate);
        }
        if refresh_rate > bucket_size {
            return Err(SlotError::RefreshRateTooLarge);
        }
        if tokens_per_req < 1 {
            return Err(SlotError::InvalidTokensPerRequest);
        }
        if tokens_per_req > bucket_size {
            return Err(SlotError::TokensPerRequestTooLarge);
        }

        let period_secs = period.secs();
        Ok(TokenBucketSlot {
            access: AccessMap::from_config(users),
            size: bucket_size,
            rate: refresh_rate,
            tokens_per_req,
            period_secs,
            bucket: Mutex::new(Bucket {
                tokens: refresh_rate,
                window: current_window(period_secs),
            }),
        })
    }
}

fn current_window(period_secs: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    now / period_secs
}

impl Slot for TokenBucketSlot {
    fn read(&self) -> String {
        let mut bucket = self.bucket.lock().expect("token bucket lock poisoned");

        let current = current_window(self.period_secs);
        if current != bucket.window {
            bucket.window = current;
            bucket.tokens = self.size.min(bucket.tokens + self.rate);
        }

        let taken = bucket.tokens.min(self.tokens_per_req);
        bucket.tokens -= taken;
        taken.to_string()
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
