#![forbid(unsafe_code)]

pub mod auth;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod conn;
mod error;
pub mod errors;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod slots;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers wire together.
pub use crate::cluster::{BullyCluster, Cluster, EmptyCluster};
pub use crate::config::Config;
pub use crate::server::Server;
