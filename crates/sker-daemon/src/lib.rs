//! Sker Daemon - Background Context Watcher
//!
//! Features:
//! - Always-running background process, one per user
//! - File watching with notify (FSEvents on macOS, inotify on Linux)
//! - Debounced batches applied to the project context
//! - Health, resource and counter monitoring
//! - Unix socket for CLI communication

pub mod client;
pub mod control;
pub mod error;
pub mod monitor;
pub mod process;
pub mod server;
pub mod watcher;

pub use client::DaemonClient;
pub use control::{CliDaemon, CommandResult, StartOptions, StopOptions, WatchOptions, HOME_ENV};
pub use error::DaemonError;
pub use monitor::{
    DaemonMonitor, DaemonStats, DaemonStatus, HealthStatus, MonitorConfig, MonitorEvent,
    ResourceLimits,
};
pub use process::DaemonPaths;
pub use server::{DaemonRequest, DaemonResponse, DaemonServer, ShutdownHandle};
pub use watcher::ProjectWatcher;
