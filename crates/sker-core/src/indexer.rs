//! Context Indexer - per-project file view kept in sync with the disk
//!
//! Features:
//! - BLAKE3 content hashes, computed in parallel with Rayon
//! - Respects .gitignore (optional) and glob include/exclude patterns
//! - Persisted to a sled DB under `<project>/.sker/context.db`
//! - Incremental updates from debounced batches

use crate::event::{ChangeType, DebouncedBatch};
use crate::filter::PathMatcher;
use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const STORE_DIR: &str = ".sker";
const STORE_NAME: &str = "context.db";

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("project path does not exist: {}", .0.display())]
    NotFound(PathBuf),
    #[error("project path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("context store error: {0}")]
    Store(#[from] sled::Error),
    #[error("context entry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Options for a full rescan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOptions {
    /// Count every file as processed, even when its hash is unchanged
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default = "default_true")]
    pub respect_gitignore: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            force: false,
            patterns: Vec::new(),
            exclude: Vec::new(),
            max_depth: None,
            respect_gitignore: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub files_processed: usize,
    pub files_removed: usize,
    pub total_files: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearSummary {
    pub items_cleared: usize,
}

/// One indexed file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub hash: String,
    pub size: u64,
    pub mime: String,
}

/// The indexing subsystem as seen by the daemon and the CLI
pub trait ContextIndexer: Send + Sync {
    /// Rescan a project directory into the context view
    fn refresh(
        &self,
        project: &Path,
        options: &RefreshOptions,
    ) -> Result<RefreshSummary, IndexError>;

    /// Drop everything indexed for a project
    fn clear(&self, project: &Path) -> Result<ClearSummary, IndexError>;

    /// Apply one debounced batch. Returns the number of entries touched.
    fn apply_batch(&self, project: &Path, batch: &DebouncedBatch) -> Result<usize, IndexError>;
}

/// Filesystem-backed indexer with one sled store per project
#[derive(Default)]
pub struct FsContextIndexer {
    stores: Mutex<HashMap<PathBuf, sled::Db>>,
}

impl FsContextIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, project: &Path) -> Result<sled::Db, IndexError> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(db) = stores.get(project) {
            return Ok(db.clone());
        }

        let dir = project.join(STORE_DIR);
        fs::create_dir_all(&dir)?;
        let db = sled::open(dir.join(STORE_NAME))?;
        stores.insert(project.to_path_buf(), db.clone());
        Ok(db)
    }

    /// Indexed entry for a project-relative path
    pub fn entry(&self, project: &Path, relative: &str) -> Result<Option<FileEntry>, IndexError> {
        match self.store(project)?.get(relative.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Number of files currently indexed for a project
    pub fn len(&self, project: &Path) -> Result<usize, IndexError> {
        Ok(self.store(project)?.len())
    }

    fn scan(
        &self,
        project: &Path,
        options: &RefreshOptions,
    ) -> Result<Vec<(String, FileEntry)>, IndexError> {
        // Depth and .gitignore are handled by the walker itself
        let matcher = PathMatcher::new(&options.patterns, &options.exclude)?;

        let files: Vec<(String, PathBuf)> = WalkBuilder::new(project)
            .hidden(false)
            .require_git(false)
            .ignore(options.respect_gitignore)
            .git_ignore(options.respect_gitignore)
            .git_global(options.respect_gitignore)
            .git_exclude(options.respect_gitignore)
            .max_depth(options.max_depth)
            .build()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .filter_map(|e| {
                let relative = relative_key(project, e.path())?;
                matcher
                    .matches(&relative, false)
                    .then(|| (relative, e.into_path()))
            })
            .collect();

        Ok(files
            .par_iter()
            .filter_map(|(relative, path)| Some((relative.clone(), hash_entry(path).ok()?)))
            .collect())
    }
}

impl ContextIndexer for FsContextIndexer {
    fn refresh(
        &self,
        project: &Path,
        options: &RefreshOptions,
    ) -> Result<RefreshSummary, IndexError> {
        ensure_dir(project)?;
        let start = Instant::now();

        let scanned = self.scan(project, options)?;
        let db = self.store(project)?;

        let mut batch = sled::Batch::default();
        let mut seen = HashSet::with_capacity(scanned.len());
        let mut files_processed = 0;

        for (relative, entry) in &scanned {
            seen.insert(relative.clone());
            let unchanged = match db.get(relative.as_bytes())? {
                Some(old) => serde_json::from_slice::<FileEntry>(&old)
                    .map(|old| old.hash == entry.hash)
                    .unwrap_or(false),
                None => false,
            };

            if options.force || !unchanged {
                batch.insert(relative.as_bytes(), serde_json::to_vec(entry)?);
                files_processed += 1;
            }
        }

        let mut files_removed = 0;
        for key in db.iter().keys() {
            let key = key?;
            let stale = !seen.contains(&*String::from_utf8_lossy(&key));
            if stale {
                batch.remove(key);
                files_removed += 1;
            }
        }

        db.apply_batch(batch)?;
        db.flush()?;

        let elapsed = start.elapsed();
        info!(
            "Refreshed {:?}: {} processed, {} removed, {} total in {:?}",
            project,
            files_processed,
            files_removed,
            scanned.len(),
            elapsed
        );

        Ok(RefreshSummary {
            files_processed,
            files_removed,
            total_files: scanned.len(),
            elapsed,
        })
    }

    fn clear(&self, project: &Path) -> Result<ClearSummary, IndexError> {
        ensure_dir(project)?;
        let db = self.store(project)?;
        let items_cleared = db.len();
        db.clear()?;
        db.flush()?;

        info!("Cleared {} context entries for {:?}", items_cleared, project);
        Ok(ClearSummary { items_cleared })
    }

    fn apply_batch(&self, project: &Path, batch: &DebouncedBatch) -> Result<usize, IndexError> {
        let db = self.store(project)?;
        let mut touched = 0;

        for change in &batch.changes {
            let key = change.path.as_bytes();
            match change.change_type {
                ChangeType::Add | ChangeType::Change => {
                    match hash_entry(&project.join(&change.path)) {
                        Ok(entry) => {
                            db.insert(key, serde_json::to_vec(&entry)?)?;
                            touched += 1;
                        }
                        Err(e) => {
                            // Gone again before we got to it
                            debug!("Skipping {}: {}", change.path, e);
                            if db.remove(key)?.is_some() {
                                touched += 1;
                            }
                        }
                    }
                }
                ChangeType::Unlink => {
                    if db.remove(key)?.is_some() {
                        touched += 1;
                    }
                }
            }
        }

        db.flush()?;
        debug!("Applied batch {} to {:?}: {} entries", batch.id, project, touched);
        Ok(touched)
    }
}

fn ensure_dir(project: &Path) -> Result<(), IndexError> {
    if !project.exists() {
        return Err(IndexError::NotFound(project.to_path_buf()));
    }
    if !project.is_dir() {
        return Err(IndexError::NotADirectory(project.to_path_buf()));
    }
    Ok(())
}

/// Project-relative path with `/` separators
pub fn relative_key(project: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(project).ok()?;
    let key = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    (!key.is_empty()).then_some(key)
}

fn hash_entry(path: &Path) -> std::io::Result<FileEntry> {
    let content = fs::read(path)?;
    Ok(FileEntry {
        hash: blake3::hash(&content).to_hex().to_string(),
        size: content.len() as u64,
        mime: mime_for(path).to_string(),
    })
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "rs" => "text/x-rust",
        "ts" | "tsx" => "text/typescript",
        "js" | "mjs" | "cjs" | "jsx" => "text/javascript",
        "json" => "application/json",
        "md" => "text/markdown",
        "toml" => "application/toml",
        "yaml" | "yml" => "application/yaml",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "py" => "text/x-python",
        "go" => "text/x-go",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}
