//! Daemon error types

use sker_core::{ConfigError, IndexError};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("failed to spawn daemon process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pid file {}: {content:?}", .path.display())]
    InvalidPid { path: PathBuf, content: String },

    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode stats: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("control socket error: {0}")]
    Ipc(String),

    #[error("daemon task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl DaemonError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DaemonError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = DaemonError> = std::result::Result<T, E>;
