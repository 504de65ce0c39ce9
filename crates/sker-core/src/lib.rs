//! Sker Core - Context Watching Engine
//!
//! Features:
//! - Change debouncer: merges bursts of file events into stable batches
//! - Layered watch config: global defaults overridden per project
//! - Context indexer: BLAKE3-hashed project view persisted in sled
//! - Parallel file processing with Rayon
//! - Respects .gitignore patterns

pub mod config;
pub mod debouncer;
pub mod event;
pub mod filter;
pub mod indexer;

pub use config::{
    merge_configs, ConfigError, ContextWatcherConfig, GlobalWatchConfig, ProjectRegistry,
    ProjectWatchConfig, RuntimeWatchConfig, WatchConfigManager,
};
pub use debouncer::{ChangeDebouncer, DebouncerConfig, DebouncerConfigUpdate, DebouncerError};
pub use event::{ChangeType, DebouncedBatch, FileChangeEvent};
pub use filter::PathMatcher;
pub use indexer::{
    ClearSummary, ContextIndexer, FsContextIndexer, IndexError, RefreshOptions, RefreshSummary,
};
