//! Crate-level convenience error: a thin wrapper over the per-module
//! errors, not a replacement for them.

use thiserror::Error;

use crate::auth::AuthError;
use crate::cluster::ClusterError;
use crate::config::ConfigError;
use crate::conn::ConnError;
use crate::protocol::ProtocolError;
use crate::slots::SlotError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Slot(#[from] SlotError),
}
