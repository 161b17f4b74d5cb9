use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::auth::{AuthError, User};
use crate::cluster::ClusterConfig;
use crate::conn::Dialect;
use crate::slots::{
    BroadcastError, BroadcastSlot, Broadcaster, CounterSlot, LeakyBucketSlot, MemorySlot, Period,
    Slot, SlotError, SlotTable, TickerSlot, TimeoutSlot, TokenBucketSlot, SLOT_COUNT,
};

pub const DEFAULT_ADDR: &str = "localhost:9090";
pub const DEFAULT_CLUSTER_BIND: &str = "localhost:25873";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file found in /etc/ghoti, $HOME/.ghoti or the current directory")]
    NotFound,
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("unrecognized configuration key: {0}")]
    UnknownKey(String),
    #[error("invalid slot key, expected slot_NNN: {0}")]
    InvalidSlotKey(String),
    #[error("invalid slot {slot:03}: {source}")]
    InvalidSlot {
        slot: usize,
        #[source]
        source: SlotError,
    },
    #[error("invalid user {name}: {source}")]
    InvalidUser {
        name: String,
        #[source]
        source: AuthError,
    },
    #[error("cluster node name must be at most 20 characters")]
    NodeIdTooLong,
    #[error("cluster node name is empty")]
    EmptyNodeId,
    #[error("cluster user and password must each be at least 4 characters")]
    WeakClusterCredentials,
    #[error("unsupported cluster manager type: {0}")]
    UnsupportedManager(String),
    #[error("invalid value for {key}: {value}")]
    InvalidEnvValue { key: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(raw: &str) -> Option<LogLevel> {
        match raw {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Option<LogFormat> {
        match raw {
            "text" => Some(LogFormat::Text),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Seconds between metric snapshots.
    pub interval: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: false,
            interval: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    SimpleMemory,
    TimeoutMemory,
    Atomic,
    TokenBucket,
    LeakyBucket,
    Ticker,
    Broadcast,
}

/// One `slot_NNN` section of the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotConfig {
    pub kind: SlotKind,
    /// Lease seconds for `timeout_memory`.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub bucket_size: Option<u64>,
    /// Tokens per window for `token_bucket`; window millis for
    /// `leaky_bucket` and `ticker`.
    #[serde(default)]
    pub refresh_rate: Option<u64>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub tokens_per_req: Option<u64>,
    #[serde(default)]
    pub initial_value: Option<u64>,
    #[serde(default)]
    pub users: BTreeMap<String, String>,
}

impl SlotConfig {
    /// Construct the slot this section describes.
    pub fn build(
        &self,
        slot: usize,
        broadcaster: &Arc<dyn Broadcaster>,
    ) -> Result<Arc<dyn Slot>, SlotError> {
        let users = &self.users;
        let built: Arc<dyn Slot> = match self.kind {
            SlotKind::SimpleMemory => Arc::new(MemorySlot::new(users)),
            SlotKind::TimeoutMemory => {
                Arc::new(TimeoutSlot::new(self.timeout.unwrap_or(0), users)?)
            }
            SlotKind::Atomic => Arc::new(CounterSlot::new(users)),
            SlotKind::TokenBucket => {
                let period = Period::parse(self.period.as_deref().unwrap_or(""))?;
                Arc::new(TokenBucketSlot::new(
                    period,
                    self.bucket_size.unwrap_or(0),
                    self.refresh_rate.unwrap_or(0),
                    self.tokens_per_req.unwrap_or(0),
                    users,
                )?)
            }
            SlotKind::LeakyBucket => Arc::new(LeakyBucketSlot::new(
                self.bucket_size.unwrap_or(0),
                self.refresh_rate.unwrap_or(0),
                users,
            )?),
            SlotKind::Ticker => Arc::new(TickerSlot::new(
                self.refresh_rate.unwrap_or(0),
                self.initial_value.unwrap_or(0),
                users,
            )?),
            SlotKind::Broadcast => {
                Arc::new(BroadcastSlot::new(users, Arc::clone(broadcaster), slot))
            }
        };
        Ok(built)
    }

    /// Check the section without keeping the constructed slot.
    pub fn validate(&self) -> Result<(), SlotError> {
        let broadcaster: Arc<dyn Broadcaster> = Arc::new(NoopBroadcaster);
        self.build(0, &broadcaster).map(|_| ())
    }
}

/// Stand-in fan-out used while validating configuration before the
/// connection manager exists.
struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn broadcast(&self, _line: &str) -> Result<String, BroadcastError> {
        Ok("0/0/0".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub protocol: Dialect,
    pub slots: BTreeMap<usize, SlotConfig>,
    pub users: BTreeMap<String, User>,
    pub cluster: Option<ClusterConfig>,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: DEFAULT_ADDR.to_string(),
            protocol: Dialect::Standard,
            slots: BTreeMap::new(),
            users: BTreeMap::new(),
            cluster: None,
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Cross-field checks applied after loading.
    pub fn verify(&self) -> Result<(), ConfigError> {
        for (&slot, section) in &self.slots {
            section
                .validate()
                .map_err(|source| ConfigError::InvalidSlot { slot, source })?;
        }

        if let Some(cluster) = &self.cluster {
            if cluster.node.is_empty() {
                return Err(ConfigError::EmptyNodeId);
            }
            if cluster.node.len() > 20 {
                return Err(ConfigError::NodeIdTooLong);
            }
            if cluster.user.len() < 4 || cluster.pass.len() < 4 {
                return Err(ConfigError::WeakClusterCredentials);
            }
            if cluster.manager_type != "bully" {
                return Err(ConfigError::UnsupportedManager(cluster.manager_type.clone()));
            }
        }

        Ok(())
    }

    /// Materialize the slot universe.
    pub fn build_slots(&self, broadcaster: &Arc<dyn Broadcaster>) -> Result<SlotTable, ConfigError> {
        let mut table: SlotTable = (0..SLOT_COUNT).map(|_| None).collect();
        for (&slot, section) in &self.slots {
            if slot >= SLOT_COUNT {
                return Err(ConfigError::InvalidSlotKey(format!("slot_{slot}")));
            }
            let built = section
                .build(slot, broadcaster)
                .map_err(|source| ConfigError::InvalidSlot { slot, source })?;
            table[slot] = Some(built);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_config(kind: SlotKind) -> SlotConfig {
        SlotConfig {
            kind,
            timeout: None,
            bucket_size: None,
            refresh_rate: None,
            period: None,
            tokens_per_req: None,
            initial_value: None,
            users: BTreeMap::new(),
        }
    }

    #[test]
    fn default_config_verifies() {
        Config::default().verify().unwrap();
    }

    #[test]
    fn verify_rejects_invalid_slot_sections() {
        let mut config = Config::default();
        config.slots.insert(3, slot_config(SlotKind::TimeoutMemory));
        let err = config.verify().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSlot { slot: 3, .. }));
    }

    #[test]
    fn verify_rejects_bad_cluster_sections() {
        let mut config = Config::default();
        config.cluster = Some(ClusterConfig {
            node: "n".repeat(21),
            bind: DEFAULT_CLUSTER_BIND.to_string(),
            user: "user1".to_string(),
            pass: "pass1".to_string(),
            manager_type: "bully".to_string(),
            manager_addr: "localhost:7000".to_string(),
            manager_join: None,
        });
        assert!(matches!(config.verify(), Err(ConfigError::NodeIdTooLong)));

        let cluster = config.cluster.as_mut().unwrap();
        cluster.node = "node1".to_string();
        cluster.pass = "abc".to_string();
        assert!(matches!(
            config.verify(),
            Err(ConfigError::WeakClusterCredentials)
        ));

        let cluster = config.cluster.as_mut().unwrap();
        cluster.pass = "passw0rd".to_string();
        cluster.manager_type = "join_server".to_string();
        assert!(matches!(
            config.verify(),
            Err(ConfigError::UnsupportedManager(_))
        ));
    }

    #[test]
    fn build_slots_fills_only_configured_positions() {
        let mut config = Config::default();
        config.slots.insert(0, slot_config(SlotKind::SimpleMemory));
        config.slots.insert(999, slot_config(SlotKind::Atomic));

        let broadcaster: Arc<dyn Broadcaster> = Arc::new(NoopBroadcaster);
        let table = config.build_slots(&broadcaster).unwrap();
        assert_eq!(table.len(), SLOT_COUNT);
        assert!(table[0].is_some());
        assert!(table[1].is_none());
        assert!(table[999].is_some());
    }

    #[test]
    fn token_bucket_section_builds_with_all_parameters() {
        let mut section = slot_config(SlotKind::TokenBucket);
        section.bucket_size = Some(200);
        section.refresh_rate = Some(100);
        section.period = Some("second".to_string());
        section.tokens_per_req = Some(20);
        section.validate().unwrap();

        section.period = Some("fortnight".to_string());
        assert!(matches!(
            section.validate(),
            Err(SlotError::InvalidPeriod(_))
        ));
    }
}
