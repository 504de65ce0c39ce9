//! CLI-side daemon control
//!
//! Lifecycle (start, stop, status), watch enable/disable and context
//! refresh/clear, each returning a uniform [`CommandResult`]. "Already in
//! the target state" is a failed result, never an `Err`.

use crate::client::DaemonClient;
use crate::error::{DaemonError, Result};
use crate::monitor::{DaemonMonitor, DaemonStats, DaemonStatus, MonitorConfig, ResourceLimits};
use crate::process::{self, DaemonPaths, Signal};
use crate::server::{DaemonRequest, DaemonResponse, DaemonServer, ShutdownHandle};
use serde::Serialize;
use serde_json::{json, Value};
use sker_core::config::GlobalWatchConfig;
use sker_core::{ContextIndexer, RefreshOptions, WatchConfigManager};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_TIMEOUT: Duration = Duration::from_secs(1);

/// Environment variable pointing a detached daemon at the controller's home
pub const HOME_ENV: &str = "SKER_HOME";

/// Outcome of one CLI operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Detach into a child process
    pub background: bool,
    /// Restart when already running
    pub force: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    /// SIGKILL without a grace period
    pub force: bool,
}

/// Overrides applied by `watch enable`
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    pub debounce_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub patterns: Vec<String>,
    pub exclude: Vec<String>,
}

pub struct CliDaemon {
    paths: DaemonPaths,
    config: WatchConfigManager,
    indexer: Arc<dyn ContextIndexer>,
    monitor: DaemonMonitor,
    limits: ResourceLimits,
    executable: Option<PathBuf>,
    stop_timeout: Duration,
    shutdown: Mutex<Option<ShutdownHandle>>,
    task: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl CliDaemon {
    pub fn new(
        paths: DaemonPaths,
        config: WatchConfigManager,
        indexer: Arc<dyn ContextIndexer>,
    ) -> Self {
        let limits = ResourceLimits::from_global(&GlobalWatchConfig::default_for(config.home()));
        Self {
            monitor: DaemonMonitor::new(MonitorConfig::new(&paths, limits)),
            paths,
            config,
            indexer,
            limits,
            executable: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            shutdown: Mutex::new(None),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Paths and limits from the global config under the manager's home
    pub fn from_config(
        config: WatchConfigManager,
        indexer: Arc<dyn ContextIndexer>,
    ) -> Result<Self> {
        let global = config.load_global_config()?;
        let paths = DaemonPaths::from_config(&global);
        Ok(Self::new(paths, config, indexer).with_limits(ResourceLimits::from_global(&global)))
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self.monitor = DaemonMonitor::new(MonitorConfig::new(&self.paths, limits));
        self
    }

    /// Binary re-executed for background mode. Defaults to the current one.
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub async fn get_daemon_status(&self) -> DaemonStatus {
        self.monitor.get_daemon_status().await
    }

    /// Counters of the running daemon, if it answers
    pub async fn daemon_stats(&self) -> Option<DaemonStats> {
        match self.forward(&DaemonRequest::Stats).await {
            Some(DaemonResponse::Stats(stats)) => Some(stats),
            _ => None,
        }
    }

    pub async fn start_daemon(&self, options: StartOptions) -> Result<CommandResult> {
        let status = self.get_daemon_status().await;

        if status.is_running {
            let pid = status.pid.unwrap_or_default();
            if !options.force {
                return Ok(CommandResult::failed(format!("Daemon is already running (PID {})", pid))
                    .with_details(serde_json::to_value(&status)?));
            }

            info!("Restarting daemon {}", pid);
            let stopped = self.stop_daemon(StopOptions::default()).await?;
            if !stopped.success {
                return Ok(stopped);
            }
        } else if let Some(pid) = status.pid {
            info!("Removing stale PID file for {}", pid);
            process::remove_file(&self.paths.pid_file).await?;
        }

        if options.background {
            self.spawn_background().await
        } else {
            self.run_in_process().await
        }
    }

    async fn spawn_background(&self) -> Result<CommandResult> {
        let executable = match &self.executable {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(DaemonError::Spawn)?,
        };

        let log_file = &self.paths.log_file;
        if let Some(parent) = log_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DaemonError::io(parent, e))?;
        }
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| DaemonError::io(log_file, e))?;
        let stderr = stdout.try_clone().map_err(|e| DaemonError::io(log_file, e))?;

        let mut command = std::process::Command::new(&executable);
        command
            .args(["daemon", "run"])
            .env(HOME_ENV, self.config.home())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        // Detach from the terminal's process group so Ctrl-C stays with the CLI
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = tokio::process::Command::from(command)
            .spawn()
            .map_err(DaemonError::Spawn)?;
        let Some(pid) = child.id() else {
            return Ok(CommandResult::failed("Daemon exited immediately after spawn"));
        };
        info!("Spawned daemon {} ({:?})", pid, executable);

        let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
        loop {
            if let Some(exit) = child.try_wait().map_err(DaemonError::Spawn)? {
                return Ok(CommandResult::failed(format!(
                    "Daemon exited during startup ({}); see {}",
                    exit,
                    log_file.display()
                )));
            }
            if process::read_pid(&self.paths.pid_file).await.ok().flatten() == Some(pid) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Daemon {} has not written its PID file yet", pid);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let message = format!("Daemon started in background (PID {})", pid);
        Ok(CommandResult::ok(message).with_details(json!({
            "pid": pid,
            "background": true,
            "logFile": log_file,
        })))
    }

    async fn run_in_process(&self) -> Result<CommandResult> {
        let pid = std::process::id();
        process::write_pid(&self.paths.pid_file, pid).await?;

        let server = DaemonServer::with_paths(
            self.paths.clone(),
            self.config.clone(),
            Arc::clone(&self.indexer),
            self.limits,
        );
        *lock(&self.shutdown) = Some(server.shutdown_handle());
        *self.task.lock().await = Some(tokio::spawn(server.run()));

        let message = format!("Daemon started in foreground (PID {})", pid);
        Ok(CommandResult::ok(message).with_details(json!({
            "pid": pid,
            "background": false,
        })))
    }

    /// Wait for a daemon started in this process to finish
    pub async fn wait(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        match task.take() {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }

    pub async fn stop_daemon(&self, options: StopOptions) -> Result<CommandResult> {
        let status = self.get_daemon_status().await;

        let pid = match status.pid {
            Some(pid) if status.is_running => pid,
            Some(_) => {
                process::remove_file(&self.paths.pid_file).await?;
                return Ok(CommandResult::failed("Daemon is not running (removed stale PID file)"));
            }
            None => return Ok(CommandResult::failed("Daemon is not running")),
        };

        if pid == std::process::id() {
            return self.stop_in_process(pid, options.force).await;
        }

        let mut forced = options.force;
        if options.force {
            self.signal(pid, Signal::Kill)?;
            process::wait_for_exit(pid, KILL_TIMEOUT).await;
        } else {
            self.signal(pid, Signal::Terminate)?;
            if !process::wait_for_exit(pid, self.stop_timeout).await {
                warn!("Daemon {} ignored SIGTERM for {:?}, killing", pid, self.stop_timeout);
                self.signal(pid, Signal::Kill)?;
                process::wait_for_exit(pid, KILL_TIMEOUT).await;
                forced = true;
            }
        }

        if process::is_process_alive(pid) {
            return Ok(CommandResult::failed(format!("Daemon (PID {}) did not exit", pid)));
        }

        // A killed daemon cannot clean up after itself
        process::remove_file(&self.paths.pid_file).await?;
        process::remove_file(&self.paths.socket_path).await?;

        Ok(CommandResult::ok(format!("Daemon stopped (PID {})", pid)).with_details(json!({
            "pid": pid,
            "forced": forced,
        })))
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        match process::send_signal(pid, signal) {
            Ok(()) => Ok(()),
            // Exited on its own in the meantime
            Err(_) if !process::is_process_alive(pid) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn stop_in_process(&self, pid: u32, force: bool) -> Result<CommandResult> {
        let handle = lock(&self.shutdown).take();
        let Some(shutdown) = handle else {
            // Our PID, but not our daemon
            process::remove_file(&self.paths.pid_file).await?;
            return Ok(CommandResult::failed("Daemon is not running (removed stale PID file)"));
        };
        shutdown.shutdown();

        // Blocks while `wait` holds the task, which ends once the server exits
        let task = self.task.lock().await.take();
        if let Some(mut task) = task {
            if force {
                task.abort();
                let _ = task.await;
            } else {
                match tokio::time::timeout(self.stop_timeout, &mut task).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => warn!("Daemon exited with error: {}", e),
                    Ok(Err(e)) => warn!("Daemon task failed: {}", e),
                    Err(_) => {
                        warn!("Daemon did not stop within {:?}, aborting", self.stop_timeout);
                        task.abort();
                        let _ = task.await;
                    }
                }
            }
        }

        process::remove_file(&self.paths.pid_file).await?;
        process::remove_file(&self.paths.socket_path).await?;

        Ok(CommandResult::ok(format!("Daemon stopped (PID {})", pid)).with_details(json!({
            "pid": pid,
            "forced": force,
        })))
    }

    // -----------------------------------------------------------------------
    // Watch control
    // -----------------------------------------------------------------------

    pub async fn enable_watch(&self, path: &Path, options: WatchOptions) -> Result<CommandResult> {
        let Some(root) = resolve_project(path) else {
            return Ok(missing_project(path));
        };

        let mut config = self.config.load_project_config(&root)?;
        let watcher = &mut config.context_watcher;
        watcher.enabled = true;
        if let Some(debounce_ms) = options.debounce_ms {
            watcher.debounce_ms = Some(debounce_ms);
        }
        if let Some(batch_size) = options.batch_size {
            watcher.batch_size = Some(batch_size);
        }
        if !options.patterns.is_empty() {
            watcher.watch_patterns = options.patterns;
        }
        for pattern in options.exclude {
            if !watcher.ignore_patterns.contains(&pattern) {
                watcher.ignore_patterns.push(pattern);
            }
        }

        self.config.save_project_config(&root, &config)?;
        self.config.register_project(&root)?;
        let runtime = self.config.load_runtime_config(&root)?;

        let mut message = format!("Watching enabled for {} ({})", config.name, root.display());
        if self.get_daemon_status().await.is_running {
            message.push_str("; restart the daemon to pick it up");
        }
        Ok(CommandResult::ok(message).with_details(serde_json::to_value(&runtime)?))
    }

    pub async fn disable_watch(&self, path: &Path) -> Result<CommandResult> {
        let Some(root) = resolve_project(path) else {
            return Ok(missing_project(path));
        };

        let not_enabled =
            || CommandResult::failed(format!("Watching is not enabled for {}", root.display()));
        if !WatchConfigManager::project_config_path(&root).exists() {
            return Ok(not_enabled());
        }

        let mut config = self.config.load_project_config(&root)?;
        if !config.context_watcher.enabled {
            return Ok(not_enabled());
        }
        config.context_watcher.enabled = false;
        self.config.save_project_config(&root, &config)?;

        let mut registry = self.config.load_registry()?;
        if registry.unregister(&root) {
            self.config.save_registry(&registry)?;
        }

        Ok(CommandResult::ok(format!("Watching disabled for {} ({})", config.name, root.display())))
    }

    // -----------------------------------------------------------------------
    // Context control
    // -----------------------------------------------------------------------

    /// Rescan a project, through the running daemon when there is one
    pub async fn refresh_context(
        &self,
        path: &Path,
        options: RefreshOptions,
    ) -> Result<CommandResult> {
        let Some(root) = resolve_project(path) else {
            return Ok(missing_project(path));
        };

        let runtime = self.config.load_runtime_config(&root)?;
        let mut options = options;
        if options.patterns.is_empty() {
            options.patterns = runtime.watch_patterns;
        }
        for pattern in runtime.ignore_patterns {
            if !options.exclude.contains(&pattern) {
                options.exclude.push(pattern);
            }
        }
        options.max_depth = options.max_depth.or(Some(runtime.max_depth));
        options.respect_gitignore &= runtime.respect_gitignore;

        let request = DaemonRequest::Refresh {
            path: root.clone(),
            options: options.clone(),
        };
        let (summary, via_daemon) = match self.forward(&request).await {
            Some(DaemonResponse::Refreshed(summary)) => (summary, true),
            Some(DaemonResponse::Error(e)) => {
                return Ok(CommandResult::failed(format!("Refresh failed: {}", e)));
            }
            Some(other) => return Err(unexpected(other)),
            None => {
                let indexer = Arc::clone(&self.indexer);
                let target = root.clone();
                let summary =
                    tokio::task::spawn_blocking(move || indexer.refresh(&target, &options)).await??;
                (summary, false)
            }
        };

        Ok(CommandResult::ok(format!(
            "Context refreshed: {} files processed in {}ms",
            summary.files_processed,
            summary.elapsed.as_millis()
        ))
        .with_details(json!({
            "filesProcessed": summary.files_processed,
            "filesRemoved": summary.files_removed,
            "totalFiles": summary.total_files,
            "elapsedMs": summary.elapsed.as_millis() as u64,
            "viaDaemon": via_daemon,
        })))
    }

    pub async fn clear_context(&self, path: &Path) -> Result<CommandResult> {
        let Some(root) = resolve_project(path) else {
            return Ok(missing_project(path));
        };

        let request = DaemonRequest::Clear { path: root.clone() };
        let summary = match self.forward(&request).await {
            Some(DaemonResponse::Cleared(summary)) => summary,
            Some(DaemonResponse::Error(e)) => {
                return Ok(CommandResult::failed(format!("Clear failed: {}", e)));
            }
            Some(other) => return Err(unexpected(other)),
            None => {
                let indexer = Arc::clone(&self.indexer);
                tokio::task::spawn_blocking(move || indexer.clear(&root)).await??
            }
        };

        Ok(
            CommandResult::ok(format!("Context cleared: {} items removed", summary.items_cleared))
                .with_details(json!({ "itemsCleared": summary.items_cleared })),
        )
    }

    /// Send a request to the daemon if its socket answers
    async fn forward(&self, request: &DaemonRequest) -> Option<DaemonResponse> {
        if !self.paths.socket_path.exists() {
            return None;
        }

        let mut client = match DaemonClient::connect(&self.paths.socket_path).await {
            Ok(client) => client,
            Err(e) => {
                debug!("Daemon socket not answering: {}", e);
                return None;
            }
        };
        let response = client.send_request(request).await;
        client.disconnect();

        match response {
            Ok(response) => Some(response),
            Err(e) => {
                warn!("Daemon request failed, handling locally: {}", e);
                None
            }
        }
    }
}

fn resolve_project(path: &Path) -> Option<PathBuf> {
    std::fs::canonicalize(path).ok().filter(|p| p.is_dir())
}

fn unexpected(response: DaemonResponse) -> DaemonError {
    DaemonError::Ipc(format!("unexpected response: {:?}", response))
}

fn missing_project(path: &Path) -> CommandResult {
    CommandResult::failed(format!("Project path does not exist: {}", path.display()))
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sker_core::FsContextIndexer;
    use tempfile::TempDir;

    fn daemon(home: &Path) -> CliDaemon {
        CliDaemon::new(
            DaemonPaths::in_dir(home.join(".sker")),
            WatchConfigManager::with_home(home),
            Arc::new(FsContextIndexer::new()),
        )
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let home = TempDir::new().unwrap();
        let daemon = daemon(home.path());

        let result = daemon.stop_daemon(StopOptions::default()).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("not running"));
    }

    #[tokio::test]
    async fn test_stop_removes_stale_pid_file() {
        let home = TempDir::new().unwrap();
        let daemon = daemon(home.path());
        process::write_pid(&daemon.paths().pid_file, 2_147_483_000).await.unwrap();

        let result = daemon.stop_daemon(StopOptions::default()).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("stale"));
        assert!(!daemon.paths().pid_file.exists());
    }

    #[tokio::test]
    async fn test_enable_watch_missing_path() {
        let home = TempDir::new().unwrap();
        let daemon = daemon(home.path());

        let result = daemon
            .enable_watch(&home.path().join("missing"), WatchOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("does not exist"));
    }

    #[tokio::test]
    async fn test_enable_then_disable_watch() {
        let home = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let daemon = daemon(home.path());

        let options = WatchOptions {
            debounce_ms: Some(150),
            exclude: vec!["*.log".into()],
            ..Default::default()
        };
        let result = daemon.enable_watch(project.path(), options).await.unwrap();
        assert!(result.success, "{}", result.message);
        assert_eq!(result.details.as_ref().unwrap()["debounceMs"], 150);

        let manager = WatchConfigManager::with_home(home.path());
        let root = project.path().canonicalize().unwrap();
        let saved = manager.load_project_config(&root).unwrap();
        assert!(saved.context_watcher.enabled);
        assert_eq!(saved.context_watcher.debounce_ms, Some(150));
        assert!(saved.context_watcher.ignore_patterns.contains(&"*.log".to_string()));
        assert!(manager.load_registry().unwrap().contains(&root));

        let result = daemon.disable_watch(project.path()).await.unwrap();
        assert!(result.success);
        assert!(!manager.load_project_config(&root).unwrap().context_watcher.enabled);
        assert!(!manager.load_registry().unwrap().contains(&root));

        let again = daemon.disable_watch(project.path()).await.unwrap();
        assert!(!again.success);
        assert!(again.message.contains("not enabled"));
    }

    #[tokio::test]
    async fn test_disable_watch_without_config() {
        let home = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let daemon = daemon(home.path());

        let result = daemon.disable_watch(project.path()).await.unwrap();
        assert!(!result.success);
        assert!(!WatchConfigManager::project_config_path(project.path()).exists());
    }

    #[tokio::test]
    async fn test_refresh_and_clear_without_daemon() {
        let home = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        std::fs::create_dir_all(project.path().join("src")).unwrap();
        std::fs::write(project.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(project.path().join("README.md"), "# demo").unwrap();
        let daemon = daemon(home.path());

        let result = daemon
            .refresh_context(project.path(), RefreshOptions::default())
            .await
            .unwrap();
        assert!(result.success);
        let details = result.details.unwrap();
        assert_eq!(details["filesProcessed"], 2);
        assert_eq!(details["viaDaemon"], false);

        let result = daemon.clear_context(project.path()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.details.unwrap()["itemsCleared"], 2);
    }
}
