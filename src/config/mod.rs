//! Server configuration: schema, YAML loading, and env overrides.

mod load;
mod schema;

pub use load::{apply_env_overrides, load, load_file};
pub use schema::{
    Config, ConfigError, LogFormat, LogLevel, LoggingConfig, MetricsConfig, SlotConfig, SlotKind,
    DEFAULT_ADDR, DEFAULT_CLUSTER_BIND,
};
