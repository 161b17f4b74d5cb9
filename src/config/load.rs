//! Config file discovery, YAML parsing, and environment overrides.
//!
//! The file is `config.yaml` (or `config.yml`) in `/etc/ghoti`,
//! `$HOME/.ghoti`, or the current directory, first hit wins. Environment
//! variables prefixed `GHOTI_` override file values; CLI flags override
//! both (applied by the run command).

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::auth;
use crate::cluster::ClusterConfig;
use crate::conn::Dialect;

use super::schema::{
    Config, ConfigError, LogFormat, LogLevel, LoggingConfig, MetricsConfig, SlotConfig,
    DEFAULT_CLUSTER_BIND,
};

const CONFIG_FILE_NAMES: [&str; 2] = ["config.yaml", "config.yml"];

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    addr: Option<String>,
    protocol: Option<Dialect>,
    users: Option<BTreeMap<String, String>>,
    cluster: Option<ClusterFileConfig>,
    log: Option<LoggingConfig>,
    metrics: Option<MetricsConfig>,
    /// Everything else must be a `slot_NNN` section.
    #[serde(flatten)]
    rest: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClusterFileConfig {
    node: String,
    #[serde(default)]
    bind: Option<String>,
    user: String,
    pass: String,
    manager: ManagerFileConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManagerFileConfig {
    #[serde(rename = "type")]
    kind: String,
    addr: String,
    #[serde(default)]
    join: Option<String>,
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/ghoti")];
    if let Ok(home) = env::var("HOME") {
        paths.push(PathBuf::from(home).join(".ghoti"));
    }
    paths.push(PathBuf::from("."));
    paths
}

fn find_config_file() -> Option<PathBuf> {
    for dir in search_paths() {
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Load the config from the standard search paths plus the environment.
pub fn load() -> Result<Config, ConfigError> {
    let path = find_config_file().ok_or(ConfigError::NotFound)?;
    load_file(&path)
}

/// Load one specific config file plus the environment.
pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let file: FileConfig =
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

    let mut config = build_config(file)?;
    apply_env_overrides(&mut config)?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

fn build_config(file: FileConfig) -> Result<Config, ConfigError> {
    let mut config = Config::default();

    if let Some(addr) = file.addr {
        config.addr = addr;
    }
    if let Some(protocol) = file.protocol {
        config.protocol = protocol;
    }
    if let Some(log) = file.log {
        config.logging = log;
    }
    if let Some(metrics) = file.metrics {
        config.metrics = metrics;
    }

    for (key, value) in file.rest {
        let slot = parse_slot_key(&key)?;
        let section: SlotConfig =
            serde_yaml::from_value(value).map_err(|source| ConfigError::Parse {
                path: key.clone(),
                source,
            })?;
        config.slots.insert(slot, section);
    }

    if let Some(users) = file.users {
        for (name, password) in users {
            let user = auth::get_user(&name, &password)
                .map_err(|source| ConfigError::InvalidUser { name, source })?;
            config.users.insert(user.name.clone(), user);
        }
    }

    if let Some(cluster) = file.cluster {
        config.cluster = Some(ClusterConfig {
            node: cluster.node,
            bind: cluster
                .bind
                .unwrap_or_else(|| DEFAULT_CLUSTER_BIND.to_string()),
            user: cluster.user,
            pass: cluster.pass,
            manager_type: cluster.manager.kind,
            manager_addr: cluster.manager.addr,
            manager_join: cluster.manager.join,
        });
    }

    Ok(config)
}

fn parse_slot_key(key: &str) -> Result<usize, ConfigError> {
    let Some(digits) = key.strip_prefix("slot_") else {
        return Err(ConfigError::UnknownKey(key.to_string()));
    };
    if digits.len() != 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ConfigError::InvalidSlotKey(key.to_string()));
    }
    let mut slot = 0usize;
    for b in digits.bytes() {
        slot = slot * 10 + usize::from(b - b'0');
    }
    Ok(slot)
}

/// Apply `GHOTI_`-prefixed environment overrides.
pub fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Ok(addr) = env::var("GHOTI_ADDR") {
        if !addr.trim().is_empty() {
            config.addr = addr.trim().to_string();
        }
    }

    if let Ok(protocol) = env::var("GHOTI_PROTOCOL") {
        config.protocol = match protocol.as_str() {
            "standard" => Dialect::Standard,
            "telnet" => Dialect::Telnet,
            other => {
                return Err(ConfigError::InvalidEnvValue {
                    key: "GHOTI_PROTOCOL".to_string(),
                    value: other.to_string(),
                })
            }
        };
    }

    if let Ok(level) = env::var("GHOTI_LOG_LEVEL") {
        config.logging.level =
            LogLevel::parse(&level).ok_or_else(|| ConfigError::InvalidEnvValue {
                key: "GHOTI_LOG_LEVEL".to_string(),
                value: level.clone(),
            })?;
    }

    if let Ok(format) = env::var("GHOTI_LOG_FORMAT") {
        config.logging.format =
            LogFormat::parse(&format).ok_or_else(|| ConfigError::InvalidEnvValue {
                key: "GHOTI_LOG_FORMAT".to_string(),
                value: format.clone(),
            })?;
    }

    if let Ok(enabled) = env::var("GHOTI_METRICS_ENABLED") {
        config.metrics.enabled = match enabled.as_str() {
            "1" | "true" => true,
            "0" | "false" => false,
            other => {
                return Err(ConfigError::InvalidEnvValue {
                    key: "GHOTI_METRICS_ENABLED".to_string(),
                    value: other.to_string(),
                })
            }
        };
    }

    Ok(())
}
