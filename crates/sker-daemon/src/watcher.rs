//! Project Watcher - real-time file system monitoring
//!
//! Uses notify crate (FSEvents on macOS, inotify on Linux)
//! Feeds project-relative change events into a debouncer

use crate::error::Result;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sker_core::config::RuntimeWatchConfig;
use sker_core::indexer::relative_key;
use sker_core::{ChangeDebouncer, ChangeType, FileChangeEvent, PathMatcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decides which paths under a project root are reported
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: PathBuf,
    matcher: PathMatcher,
}

impl PathFilter {
    pub fn new(root: impl AsRef<Path>, config: &RuntimeWatchConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut matcher = PathMatcher::new(&config.watch_patterns, &config.ignore_patterns)?
            .with_max_depth(Some(config.max_depth));
        if config.respect_gitignore {
            matcher = matcher.with_gitignore(&root);
        }

        Ok(Self { root, matcher })
    }

    /// Project-relative key for a path, or `None` when it is filtered out
    pub fn accept(&self, path: &Path) -> Option<String> {
        let relative = relative_key(&self.root, path)?;
        self.matcher
            .matches(&relative, path.is_dir())
            .then_some(relative)
    }
}

/// Map one notify event onto (path, change) pairs
pub fn classify(event: &Event) -> Vec<(PathBuf, ChangeType)> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeType::Add,
        EventKind::Remove(_) => ChangeType::Unlink,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // [from, to]
            return event
                .paths
                .iter()
                .cloned()
                .zip([ChangeType::Unlink, ChangeType::Add])
                .collect();
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeType::Unlink,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeType::Add,
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => ChangeType::Change,
        _ => return Vec::new(),
    };

    event.paths.iter().map(|p| (p.clone(), kind)).collect()
}

/// Watches one project root
pub struct ProjectWatcher {
    root: PathBuf,
    project_id: String,
    filter: Arc<PathFilter>,
    watcher: Option<RecommendedWatcher>,
}

impl ProjectWatcher {
    pub fn new(root: impl AsRef<Path>, config: &RuntimeWatchConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let filter = PathFilter::new(&root, config)?;

        Ok(Self {
            root,
            project_id: config.project_name.clone(),
            filter: Arc::new(filter),
            watcher: None,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start watching, pushing every accepted change into `debouncer`
    pub fn start(&mut self, debouncer: Arc<ChangeDebouncer>) -> Result<()> {
        let filter = Arc::clone(&self.filter);
        let project_id = self.project_id.clone();

        let handler = move |result: notify::Result<Event>| match result {
            Ok(event) => {
                for (path, kind) in classify(&event) {
                    // Directories are walked by the indexer, not tracked here
                    if kind != ChangeType::Unlink && path.is_dir() {
                        continue;
                    }
                    if let Some(relative) = filter.accept(&path) {
                        debug!("File change: {} ({:?})", relative, kind);
                        let change = FileChangeEvent::new(kind, relative, project_id.clone());
                        debouncer.add_change(change);
                    }
                }
            }
            Err(e) => {
                warn!("Watch error: {:?}", e);
            }
        };

        let config = Config::default().with_poll_interval(Duration::from_millis(100));
        let mut watcher = RecommendedWatcher::new(handler, config)?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        self.watcher = Some(watcher);

        info!("File watcher started for {} at {:?}", self.project_id, self.root);
        Ok(())
    }

    /// Stop watching
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!("File watcher stopped for {}", self.project_id);
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }
}

impl Drop for ProjectWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
