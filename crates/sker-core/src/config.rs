//! Watch Configuration - project and global settings
//!
//! Files:
//! - `<project>/sker.json`      per-project watcher settings
//! - `~/.skerrc.json`           machine-wide daemon settings and defaults
//! - `~/.sker/projects.json`    registry of watched project roots
//!
//! Loading reads raw JSON, validates every rule (collecting all
//! violations), overlays the file onto the documented defaults and only
//! then deserializes. A missing file yields the defaults; a malformed one
//! is an error.

use crate::debouncer::{DebouncerConfig, DEFAULT_BATCH_SIZE, DEFAULT_DEBOUNCE_MS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const PROJECT_CONFIG_FILE: &str = "sker.json";
pub const GLOBAL_CONFIG_FILE: &str = ".skerrc.json";
pub const SKER_DIR: &str = ".sker";
pub const REGISTRY_FILE: &str = "projects.json";

pub const DEFAULT_MAX_DEPTH: usize = 10;
pub const DEFAULT_CACHE_SIZE: u64 = 1000;
pub const DEFAULT_COMPRESSION_LEVEL: u8 = 6;
pub const DEFAULT_MAX_MEMORY_MB: u64 = 512;
pub const DEFAULT_MAX_CPU_PERCENT: f64 = 80.0;
pub const DEFAULT_GC_INTERVAL_MS: u64 = 300_000;

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {what}: {}", .violations.join("; "))]
    Validation {
        what: &'static str,
        violations: Vec<String>,
    },
    #[error("failed to encode config: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("could not determine home directory")]
    NoHomeDir,
}

impl ConfigError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Every violation when this is a validation failure
    pub fn violations(&self) -> &[String] {
        match self {
            ConfigError::Validation { violations, .. } => violations,
            _ => &[],
        }
    }
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Project config
// ---------------------------------------------------------------------------

/// Per-project settings stored in `sker.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectWatchConfig {
    pub name: String,
    #[serde(default)]
    pub context_watcher: ContextWatcherConfig,
}

impl ProjectWatchConfig {
    /// Default config for a project root, named after its directory
    pub fn default_for(project: &Path) -> Self {
        let name = project
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());

        Self {
            name,
            context_watcher: ContextWatcherConfig::default(),
        }
    }
}

/// Watcher settings. Unset tunables fall back to the global defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextWatcherConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_watch_patterns")]
    pub watch_patterns: Vec<String>,
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
    #[serde(default = "default_true")]
    pub respect_gitignore: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<u8>,
}

fn default_true() -> bool {
    true
}

fn default_watch_patterns() -> Vec<String> {
    vec!["**/*".to_string()]
}

fn default_ignore_patterns() -> Vec<String> {
    ["node_modules/**", ".git/**", "dist/**", "build/**", "target/**", ".sker/**"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

impl Default for ContextWatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            watch_patterns: default_watch_patterns(),
            ignore_patterns: default_ignore_patterns(),
            debounce_ms: None,
            batch_size: None,
            max_depth: None,
            respect_gitignore: true,
            cache_size: None,
            compression_level: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Global config
// ---------------------------------------------------------------------------

/// Machine-wide settings stored in `~/.skerrc.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalWatchConfig {
    pub daemon: DaemonSettings,
    pub defaults: GlobalDefaults,
    pub performance: PerformanceSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSettings {
    pub enabled: bool,
    pub auto_start: bool,
    pub log_level: String,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
    pub socket_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalDefaults {
    pub context_watcher: WatcherDefaults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherDefaults {
    pub debounce_ms: u64,
    pub batch_size: usize,
    pub max_depth: usize,
    pub cache_size: u64,
}

impl Default for WatcherDefaults {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSettings {
    #[serde(rename = "maxMemoryMB")]
    pub max_memory_mb: u64,
    pub max_cpu_percent: f64,
    pub gc_interval: u64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            max_cpu_percent: DEFAULT_MAX_CPU_PERCENT,
            gc_interval: DEFAULT_GC_INTERVAL_MS,
        }
    }
}

impl GlobalWatchConfig {
    /// Defaults with daemon files placed under `<home>/.sker`
    pub fn default_for(home: &Path) -> Self {
        let dir = home.join(SKER_DIR);
        Self {
            daemon: DaemonSettings {
                enabled: true,
                auto_start: false,
                log_level: "info".to_string(),
                log_file: dir.join("daemon.log"),
                pid_file: dir.join("daemon.pid"),
                socket_path: dir.join("daemon.sock"),
            },
            defaults: GlobalDefaults {
                context_watcher: WatcherDefaults::default(),
            },
            performance: PerformanceSettings::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime (merged) config
// ---------------------------------------------------------------------------

/// Effective watcher settings for one project. Computed, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeWatchConfig {
    pub project_name: String,
    pub enabled: bool,
    pub watch_patterns: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub debounce_ms: u64,
    pub batch_size: usize,
    pub max_depth: usize,
    pub respect_gitignore: bool,
    pub cache_size: u64,
    pub compression_level: u8,
}

impl RuntimeWatchConfig {
    pub fn debouncer_config(&self) -> DebouncerConfig {
        DebouncerConfig {
            debounce_ms: self.debounce_ms,
            batch_size: self.batch_size,
        }
    }
}

/// Project values win; omitted ones come from `global.defaults.contextWatcher`
pub fn merge_configs(
    global: &GlobalWatchConfig,
    project: &ProjectWatchConfig,
) -> RuntimeWatchConfig {
    let defaults = &global.defaults.context_watcher;
    let watcher = &project.context_watcher;

    RuntimeWatchConfig {
        project_name: project.name.clone(),
        enabled: watcher.enabled,
        watch_patterns: watcher.watch_patterns.clone(),
        ignore_patterns: watcher.ignore_patterns.clone(),
        debounce_ms: watcher.debounce_ms.unwrap_or(defaults.debounce_ms),
        batch_size: watcher.batch_size.unwrap_or(defaults.batch_size),
        max_depth: watcher.max_depth.unwrap_or(defaults.max_depth),
        respect_gitignore: watcher.respect_gitignore,
        cache_size: watcher.cache_size.unwrap_or(defaults.cache_size),
        compression_level: watcher.compression_level.unwrap_or(DEFAULT_COMPRESSION_LEVEL),
    }
}

// ---------------------------------------------------------------------------
// Project registry
// ---------------------------------------------------------------------------

/// Project roots the daemon should consider watching
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectRegistry {
    #[serde(default)]
    projects: BTreeSet<PathBuf>,
}

impl ProjectRegistry {
    /// Returns true when the project was not registered before
    pub fn register(&mut self, project: impl Into<PathBuf>) -> bool {
        self.projects.insert(project.into())
    }

    pub fn unregister(&mut self, project: &Path) -> bool {
        self.projects.remove(project)
    }

    pub fn contains(&self, project: &Path) -> bool {
        self.projects.contains(project)
    }

    pub fn projects(&self) -> impl Iterator<Item = &PathBuf> {
        self.projects.iter()
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Sole owner of config file I/O
#[derive(Debug, Clone)]
pub struct WatchConfigManager {
    home: PathBuf,
}

impl WatchConfigManager {
    /// Manager rooted at the current user's home directory
    pub fn new() -> Result<Self> {
        dirs::home_dir().map(Self::with_home).ok_or(ConfigError::NoHomeDir)
    }

    /// Manager rooted at an explicit home directory
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn project_config_path(project: &Path) -> PathBuf {
        project.join(PROJECT_CONFIG_FILE)
    }

    pub fn global_config_path(&self) -> PathBuf {
        self.home.join(GLOBAL_CONFIG_FILE)
    }

    pub fn sker_dir(&self) -> PathBuf {
        self.home.join(SKER_DIR)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.sker_dir().join(REGISTRY_FILE)
    }

    /// Create `~/.sker` if needed
    pub fn ensure_sker_directory(&self) -> Result<PathBuf> {
        let dir = self.sker_dir();
        fs::create_dir_all(&dir).map_err(|e| ConfigError::io(&dir, e))?;
        Ok(dir)
    }

    pub fn load_project_config(&self, project: &Path) -> Result<ProjectWatchConfig> {
        let path = Self::project_config_path(project);
        let defaults = ProjectWatchConfig::default_for(project);

        match read_json(&path)? {
            None => {
                debug!("No project config at {:?}, using defaults", path);
                Ok(defaults)
            }
            Some(raw) => {
                check(validate_project_value(&raw), "project config")?;
                let merged = overlay(serde_json::to_value(&defaults)?, raw);
                serde_json::from_value(merged).map_err(|source| ConfigError::Parse { path, source })
            }
        }
    }

    pub fn save_project_config(&self, project: &Path, config: &ProjectWatchConfig) -> Result<()> {
        self.validate_project_config(config)?;
        let path = Self::project_config_path(project);
        write_json(&path, config)?;
        info!("Project config saved to {:?}", path);
        Ok(())
    }

    pub fn load_global_config(&self) -> Result<GlobalWatchConfig> {
        Self::load_global_config_from(&self.home)
    }

    /// Load the global config of an arbitrary home directory
    pub fn load_global_config_from(home: &Path) -> Result<GlobalWatchConfig> {
        let path = home.join(GLOBAL_CONFIG_FILE);
        let defaults = GlobalWatchConfig::default_for(home);

        match read_json(&path)? {
            None => Ok(defaults),
            Some(raw) => {
                check(validate_global_value(&raw), "global config")?;
                let merged = overlay(serde_json::to_value(&defaults)?, raw);
                serde_json::from_value(merged).map_err(|source| ConfigError::Parse { path, source })
            }
        }
    }

    pub fn save_global_config(&self, config: &GlobalWatchConfig) -> Result<()> {
        self.validate_global_config(config)?;
        let path = self.global_config_path();
        write_json(&path, config)?;
        info!("Global config saved to {:?}", path);
        Ok(())
    }

    pub fn validate_project_config(&self, config: &ProjectWatchConfig) -> Result<()> {
        check(validate_project_value(&serde_json::to_value(config)?), "project config")
    }

    pub fn validate_global_config(&self, config: &GlobalWatchConfig) -> Result<()> {
        check(validate_global_value(&serde_json::to_value(config)?), "global config")
    }

    /// Load both layers and merge them for one project
    pub fn load_runtime_config(&self, project: &Path) -> Result<RuntimeWatchConfig> {
        let global = self.load_global_config()?;
        let project = self.load_project_config(project)?;
        Ok(merge_configs(&global, &project))
    }

    pub fn load_registry(&self) -> Result<ProjectRegistry> {
        let path = self.registry_path();
        match read_json(&path)? {
            None => Ok(ProjectRegistry::default()),
            Some(raw) => {
                serde_json::from_value(raw).map_err(|source| ConfigError::Parse { path, source })
            }
        }
    }

    pub fn save_registry(&self, registry: &ProjectRegistry) -> Result<()> {
        self.ensure_sker_directory()?;
        write_json(&self.registry_path(), registry)
    }

    /// Add a project root to the registry, persisting only on change
    pub fn register_project(&self, project: &Path) -> Result<bool> {
        let mut registry = self.load_registry()?;
        let added = registry.register(project);
        if added {
            self.save_registry(&registry)?;
            info!("Registered project {:?}", project);
        }
        Ok(added)
    }
}

fn read_json(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
    }
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content).map_err(|e| ConfigError::io(path, e))
}

/// Recursively lay `top` over `base`. Objects merge key by key, anything
/// else replaces. A `null` leaf leaves the base value untouched.
fn overlay(base: Value, top: Value) -> Value {
    match (base, top) {
        (Value::Object(mut base), Value::Object(top)) => {
            for (key, value) in top {
                let merged = match base.remove(&key) {
                    Some(existing) => overlay(existing, value),
                    None => value,
                };
                if !merged.is_null() {
                    base.insert(key, merged);
                }
            }
            Value::Object(base)
        }
        (base, Value::Null) => base,
        (_, top) => top,
    }
}

fn check(violations: Vec<String>, what: &'static str) -> Result<()> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation { what, violations })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Collects violations against a raw JSON document
struct Rules {
    violations: Vec<String>,
}

impl Rules {
    fn new() -> Self {
        Self { violations: Vec::new() }
    }

    fn fail(&mut self, path: &str, message: impl AsRef<str>) {
        self.violations.push(format!("{}: {}", path, message.as_ref()));
    }

    fn object<'a>(
        &mut self,
        path: &str,
        value: Option<&'a Value>,
    ) -> Option<&'a Map<String, Value>> {
        match value {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => {
                self.fail(path, "must be an object");
                None
            }
        }
    }

    fn boolean(&mut self, path: &str, value: Option<&Value>) {
        if let Some(v) = present(value) {
            if !v.is_boolean() {
                self.fail(path, "must be a boolean");
            }
        }
    }

    fn string(&mut self, path: &str, value: Option<&Value>) -> Option<String> {
        match present(value) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
            Some(Value::String(_)) => {
                self.fail(path, "must not be empty");
                None
            }
            Some(_) => {
                self.fail(path, "must be a string");
                None
            }
            None => None,
        }
    }

    fn string_list(&mut self, path: &str, value: Option<&Value>) {
        match present(value) {
            Some(Value::Array(items)) => {
                if items.iter().any(|item| !item.is_string()) {
                    self.fail(path, "must contain only strings");
                }
            }
            Some(_) => self.fail(path, "must be an array of strings"),
            None => {}
        }
    }

    /// Integer within `[min, max]` (max optional)
    fn integer(&mut self, path: &str, value: Option<&Value>, min: i64, max: Option<i64>) {
        let Some(v) = present(value) else { return };

        let n = match v {
            Value::Number(n) if n.is_i64() || n.is_u64() => n.as_i64().unwrap_or(i64::MAX),
            Value::Number(_) => return self.fail(path, "must be an integer"),
            _ => return self.fail(path, "must be a number"),
        };

        match max {
            Some(max) if n < min || n > max => {
                self.fail(path, format!("must be between {} and {}, got {}", min, max, n))
            }
            None if n < min => self.fail(path, format!("must be >= {}, got {}", min, n)),
            _ => {}
        }
    }

    fn number(&mut self, path: &str, value: Option<&Value>, min: f64, max: f64) {
        let Some(v) = present(value) else { return };
        match v.as_f64() {
            Some(n) if n < min || n > max => {
                self.fail(path, format!("must be between {} and {}, got {}", min, max, n))
            }
            Some(_) => {}
            None => self.fail(path, "must be a number"),
        }
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// Every structural rule for a project config document
pub fn validate_project_value(raw: &Value) -> Vec<String> {
    let mut rules = Rules::new();

    let Some(root) = raw.as_object() else {
        rules.fail("$", "project config must be a JSON object");
        return rules.violations;
    };

    rules.string("name", root.get("name"));

    if let Some(watcher) = rules.object("contextWatcher", root.get("contextWatcher")) {
        rules.boolean("contextWatcher.enabled", watcher.get("enabled"));
        rules.string_list("contextWatcher.watchPatterns", watcher.get("watchPatterns"));
        rules.string_list("contextWatcher.ignorePatterns", watcher.get("ignorePatterns"));
        rules.integer("contextWatcher.debounceMs", watcher.get("debounceMs"), 0, None);
        rules.integer("contextWatcher.batchSize", watcher.get("batchSize"), 1, None);
        rules.integer("contextWatcher.maxDepth", watcher.get("maxDepth"), 1, None);
        rules.boolean("contextWatcher.respectGitignore", watcher.get("respectGitignore"));
        rules.integer("contextWatcher.cacheSize", watcher.get("cacheSize"), 0, None);
        rules.integer(
            "contextWatcher.compressionLevel",
            watcher.get("compressionLevel"),
            0,
            Some(9),
        );
    }

    rules.violations
}

/// Every structural rule for a global config document
pub fn validate_global_value(raw: &Value) -> Vec<String> {
    let mut rules = Rules::new();

    let Some(root) = raw.as_object() else {
        rules.fail("$", "global config must be a JSON object");
        return rules.violations;
    };

    if let Some(daemon) = rules.object("daemon", root.get("daemon")) {
        rules.boolean("daemon.enabled", daemon.get("enabled"));
        rules.boolean("daemon.autoStart", daemon.get("autoStart"));
        if let Some(level) = rules.string("daemon.logLevel", daemon.get("logLevel")) {
            if !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
                rules.fail("daemon.logLevel", format!("must be one of {}", LOG_LEVELS.join(", ")));
            }
        }
        rules.string("daemon.logFile", daemon.get("logFile"));
        rules.string("daemon.pidFile", daemon.get("pidFile"));
        rules.string("daemon.socketPath", daemon.get("socketPath"));
    }

    if let Some(defaults) = rules.object("defaults", root.get("defaults")) {
        let watcher = rules.object("defaults.contextWatcher", defaults.get("contextWatcher"));
        if let Some(watcher) = watcher {
            rules.integer("defaults.contextWatcher.debounceMs", watcher.get("debounceMs"), 0, None);
            rules.integer("defaults.contextWatcher.batchSize", watcher.get("batchSize"), 1, None);
            rules.integer("defaults.contextWatcher.maxDepth", watcher.get("maxDepth"), 1, None);
            rules.integer("defaults.contextWatcher.cacheSize", watcher.get("cacheSize"), 0, None);
        }
    }

    if let Some(perf) = rules.object("performance", root.get("performance")) {
        rules.integer("performance.maxMemoryMB", perf.get("maxMemoryMB"), 1, None);
        rules.number("performance.maxCpuPercent", perf.get("maxCpuPercent"), 0.0, 100.0);
        rules.integer("performance.gcInterval", perf.get("gcInterval"), 0, None);
    }

    rules.violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager() -> (TempDir, WatchConfigManager) {
        let home = TempDir::new().unwrap();
        let manager = WatchConfigManager::with_home(home.path());
        (home, manager)
    }

    #[test]
    fn test_missing_files_fall_back_to_defaults() {
        let (home, manager) = manager();
        let project = home.path().join("my-app");
        fs::create_dir_all(&project).unwrap();

        let config = manager.load_project_config(&project).unwrap();
        assert_eq!(config.name, "my-app");
        assert!(!config.context_watcher.enabled);
        assert!(config.context_watcher.debounce_ms.is_none());

        let global = manager.load_global_config().unwrap();
        assert_eq!(global.defaults.context_watcher.debounce_ms, DEFAULT_DEBOUNCE_MS);
        assert!(global.daemon.pid_file.starts_with(home.path()));
    }

    #[test]
    fn test_malformed_file_is_hard_error() {
        let (home, manager) = manager();
        fs::write(home.path().join(PROJECT_CONFIG_FILE), "{ not json").unwrap();

        let err = manager.load_project_config(home.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validation_reports_every_violation() {
        let raw = json!({
            "name": 7,
            "contextWatcher": {
                "enabled": "yes",
                "debounceMs": -5,
                "batchSize": 0,
                "compressionLevel": 12,
                "watchPatterns": ["src/**", 3]
            }
        });

        let violations = validate_project_value(&raw);
        assert_eq!(violations.len(), 6, "{:?}", violations);
        assert!(violations.iter().any(|v| v.starts_with("contextWatcher.debounceMs")));
        assert!(violations.iter().any(|v| v.starts_with("contextWatcher.compressionLevel")));
    }

    #[test]
    fn test_global_validation_ranges() {
        let raw = json!({
            "daemon": { "logLevel": "loud" },
            "performance": { "maxCpuPercent": 150, "maxMemoryMB": 0 }
        });

        let violations = validate_global_value(&raw);
        assert_eq!(violations.len(), 3, "{:?}", violations);

        let err = check(violations, "global config").unwrap_err();
        assert_eq!(err.violations().len(), 3);
        assert!(err.to_string().contains("performance.maxCpuPercent"));
    }

    #[test]
    fn test_invalid_file_rejected_on_load() {
        let (home, manager) = manager();
        fs::write(
            manager.global_config_path(),
            r#"{"defaults": {"contextWatcher": {"batchSize": 0}}}"#,
        )
        .unwrap();

        let err = manager.load_global_config().unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
        drop(home);
    }

    #[test]
    fn test_partial_global_file_keeps_other_defaults() {
        let (_home, manager) = manager();
        fs::write(
            manager.global_config_path(),
            r#"{"defaults": {"contextWatcher": {"debounceMs": 80}}}"#,
        )
        .unwrap();

        let global = manager.load_global_config().unwrap();
        assert_eq!(global.defaults.context_watcher.debounce_ms, 80);
        assert_eq!(global.defaults.context_watcher.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(global.performance.max_memory_mb, DEFAULT_MAX_MEMORY_MB);
    }

    #[test]
    fn test_merge_prefers_project_values() {
        let (home, _) = manager();
        let mut global = GlobalWatchConfig::default_for(home.path());
        global.defaults.context_watcher.debounce_ms = 80;
        global.defaults.context_watcher.batch_size = 25;

        let mut project = ProjectWatchConfig::default_for(Path::new("/work/site"));
        project.context_watcher.debounce_ms = Some(200);

        let runtime = merge_configs(&global, &project);
        assert_eq!(runtime.debounce_ms, 200);
        assert_eq!(runtime.batch_size, 25);
        assert_eq!(runtime.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(runtime.compression_level, DEFAULT_COMPRESSION_LEVEL);
        assert_eq!(runtime.project_name, "site");
    }

    #[test]
    fn test_project_config_save_and_reload() {
        let (home, manager) = manager();
        let mut config = ProjectWatchConfig::default_for(home.path());
        config.context_watcher.enabled = true;
        config.context_watcher.batch_size = Some(10);

        manager.save_project_config(home.path(), &config).unwrap();
        let path = WatchConfigManager::project_config_path(home.path());
        let saved = fs::read_to_string(path).unwrap();
        assert!(saved.contains("\"batchSize\": 10"));
        assert!(!saved.contains("debounceMs"));

        let loaded = manager.load_project_config(home.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_save_rejects_invalid_config() {
        let (home, manager) = manager();
        let mut config = ProjectWatchConfig::default_for(home.path());
        config.context_watcher.compression_level = Some(42);

        assert!(manager.save_project_config(home.path(), &config).is_err());
        assert!(!WatchConfigManager::project_config_path(home.path()).exists());
    }

    #[test]
    fn test_zero_max_depth_rejected() {
        let raw = json!({ "contextWatcher": { "maxDepth": 0 } });
        let violations = validate_project_value(&raw);
        assert_eq!(violations.len(), 1, "{:?}", violations);
        assert!(violations[0].starts_with("contextWatcher.maxDepth"));

        let raw = json!({ "defaults": { "contextWatcher": { "maxDepth": 0 } } });
        assert_eq!(validate_global_value(&raw).len(), 1);

        let raw = json!({ "contextWatcher": { "maxDepth": 1 } });
        assert!(validate_project_value(&raw).is_empty());

        let (home, manager) = manager();
        let mut config = ProjectWatchConfig::default_for(home.path());
        config.context_watcher.max_depth = Some(0);
        assert!(manager.save_project_config(home.path(), &config).is_err());
    }

    #[test]
    fn test_registry_register_once() {
        let (home, manager) = manager();
        let project = home.path().join("repo");

        assert!(manager.register_project(&project).unwrap());
        assert!(!manager.register_project(&project).unwrap());

        let registry = manager.load_registry().unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&project));
    }

    #[test]
    fn test_overlay_ignores_null_leaves() {
        let merged = overlay(json!({"a": 1, "b": {"c": 2}}), json!({"a": null, "b": {"d": 3}}));
        assert_eq!(merged, json!({"a": 1, "b": {"c": 2, "d": 3}}));
    }
}
