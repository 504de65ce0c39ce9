//! Daemon Server - watch loop plus Unix socket IPC
//!
//! One debouncer and one watcher per enabled project. Debounced batches are
//! applied to the context indexer off the async runtime. The CLI talks to
//! the daemon over a JSON-line Unix socket.

use crate::error::{DaemonError, Result};
use crate::monitor::{DaemonMonitor, DaemonStats, MonitorConfig, ResourceLimits};
use crate::process::{self, DaemonPaths};
use crate::watcher::ProjectWatcher;
use serde::{Deserialize, Serialize};
use sker_core::{
    ChangeDebouncer, ClearSummary, ContextIndexer, DebouncedBatch, RefreshOptions, RefreshSummary,
    WatchConfigManager,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Request from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonRequest {
    /// Liveness check
    Ping,
    /// Get counters
    Stats,
    /// Rescan a project
    Refresh { path: PathBuf, options: RefreshOptions },
    /// Drop a project's context
    Clear { path: PathBuf },
    /// Shutdown
    Shutdown,
}

/// Response from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonResponse {
    Pong { pid: u32 },
    Stats(DaemonStats),
    Refreshed(RefreshSummary),
    Cleared(ClearSummary),
    Ok,
    Error(String),
}

/// Asks a running [`DaemonServer`] to wind down
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// State every connection handler needs
#[derive(Clone)]
struct Shared {
    indexer: Arc<dyn ContextIndexer>,
    monitor: Arc<DaemonMonitor>,
    shutdown: ShutdownHandle,
}

struct WatchedProject {
    root: PathBuf,
    watcher: ProjectWatcher,
    debouncer: Arc<ChangeDebouncer>,
}

/// Daemon server
pub struct DaemonServer {
    paths: DaemonPaths,
    config: WatchConfigManager,
    shared: Shared,
}

impl DaemonServer {
    /// Build a server from the global config under the manager's home
    pub fn new(config: WatchConfigManager, indexer: Arc<dyn ContextIndexer>) -> Result<Self> {
        let global = config.load_global_config()?;
        let monitor_config = MonitorConfig::from_global(&global);
        let paths = DaemonPaths::from_config(&global);
        Ok(Self::with_monitor(paths, config, indexer, monitor_config))
    }

    /// Build a server with explicit paths and limits
    pub fn with_paths(
        paths: DaemonPaths,
        config: WatchConfigManager,
        indexer: Arc<dyn ContextIndexer>,
        limits: ResourceLimits,
    ) -> Self {
        let monitor_config = MonitorConfig::new(&paths, limits);
        Self::with_monitor(paths, config, indexer, monitor_config)
    }

    fn with_monitor(
        paths: DaemonPaths,
        config: WatchConfigManager,
        indexer: Arc<dyn ContextIndexer>,
        monitor_config: MonitorConfig,
    ) -> Self {
        Self {
            paths,
            config,
            shared: Shared {
                indexer,
                monitor: Arc::new(DaemonMonitor::new(monitor_config)),
                shutdown: ShutdownHandle::new(),
            },
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shared.shutdown.clone()
    }

    pub fn monitor(&self) -> Arc<DaemonMonitor> {
        Arc::clone(&self.shared.monitor)
    }

    /// Run until a shutdown request, SIGTERM, Ctrl-C or the shutdown handle
    pub async fn run(self) -> Result<()> {
        let pid = std::process::id();
        process::write_pid(&self.paths.pid_file, pid).await?;

        let listener = self.bind().await?;
        info!("Daemon {} listening on: {:?}", pid, self.paths.socket_path);

        let monitor = Arc::clone(&self.shared.monitor);
        match monitor.load_stats().await {
            Ok(true) => debug!("Continuing from saved stats"),
            Ok(false) => {}
            Err(e) => warn!("Ignoring unreadable stats: {}", e),
        }

        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let indexer = Arc::clone(&self.shared.indexer);
        let worker = tokio::spawn(apply_batches(batch_rx, indexer, Arc::clone(&monitor)));

        let mut projects = self.start_projects(&batch_tx);
        drop(batch_tx);
        monitor.record_project_count(projects.len() as u64);
        monitor.start();

        self.serve(listener).await;

        info!("Shutting down daemon...");
        for project in &mut projects {
            project.watcher.stop();
            project.debouncer.stop().await;
        }
        // Last senders live in the debouncers' batch handlers
        drop(projects);
        if let Err(e) = worker.await {
            error!("Batch worker failed: {}", e);
        }

        monitor.stop().await;
        process::remove_file(&self.paths.socket_path).await?;
        if process::read_pid(&self.paths.pid_file).await.ok().flatten() == Some(pid) {
            process::remove_file(&self.paths.pid_file).await?;
        }

        info!("Daemon stopped");
        Ok(())
    }

    async fn bind(&self) -> Result<UnixListener> {
        let socket_path = &self.paths.socket_path;
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DaemonError::io(parent, e))?;
        }

        // Remove old socket if exists
        process::remove_file(socket_path).await?;
        UnixListener::bind(socket_path).map_err(|e| DaemonError::io(socket_path, e))
    }

    async fn serve(&self, listener: UnixListener) {
        let shutdown = self.shared.shutdown.clone();
        let mut terminate = terminate_signal();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let shared = self.shared.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, shared).await {
                                    error!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.wait() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
                _ = recv_terminate(&mut terminate) => {
                    info!("Received SIGTERM");
                    break;
                }
            }
        }
    }

    /// One debouncer and watcher per registered, enabled project
    fn start_projects(
        &self,
        batches: &mpsc::UnboundedSender<(PathBuf, DebouncedBatch)>,
    ) -> Vec<WatchedProject> {
        let registry = match self.config.load_registry() {
            Ok(registry) => registry,
            Err(e) => {
                error!("Failed to load project registry: {}", e);
                self.shared.monitor.record_error();
                return Vec::new();
            }
        };

        let mut projects = Vec::new();
        for root in registry.projects() {
            match self.start_project(root, batches) {
                Ok(Some(project)) => projects.push(project),
                Ok(None) => debug!("Watching disabled for {:?}", root),
                Err(e) => {
                    warn!("Skipping {:?}: {}", root, e);
                    self.shared.monitor.record_error();
                }
            }
        }

        info!("Watching {} project(s)", projects.len());
        projects
    }

    fn start_project(
        &self,
        root: &Path,
        batches: &mpsc::UnboundedSender<(PathBuf, DebouncedBatch)>,
    ) -> Result<Option<WatchedProject>> {
        let runtime = self.config.load_runtime_config(root)?;
        if !runtime.enabled {
            return Ok(None);
        }

        let debouncer = Arc::new(ChangeDebouncer::new(runtime.debouncer_config()));
        let tx = batches.clone();
        let project_root = root.to_path_buf();
        debouncer.on_batch(move |batch| {
            tx.send((project_root.clone(), batch.clone()))
                .map_err(|_| anyhow::anyhow!("batch worker has stopped"))
        });
        let monitor = Arc::clone(&self.shared.monitor);
        debouncer.on_error(move |e| {
            warn!("Batch handler failed: {}", e);
            monitor.record_error();
        });
        debouncer.start();

        let mut watcher = ProjectWatcher::new(root, &runtime)?;
        watcher.start(Arc::clone(&debouncer))?;

        // Catch up on anything that changed while the daemon was down
        let indexer = Arc::clone(&self.shared.indexer);
        let monitor = Arc::clone(&self.shared.monitor);
        let catch_up = root.to_path_buf();
        let options = RefreshOptions {
            patterns: runtime.watch_patterns.clone(),
            exclude: runtime.ignore_patterns.clone(),
            max_depth: Some(runtime.max_depth),
            respect_gitignore: runtime.respect_gitignore,
            ..Default::default()
        };
        tokio::task::spawn_blocking(move || match indexer.refresh(&catch_up, &options) {
            Ok(_) => monitor.record_context_update(),
            Err(e) => {
                warn!("Initial refresh of {:?} failed: {}", catch_up, e);
                monitor.record_error();
            }
        });

        Ok(Some(WatchedProject {
            root: root.to_path_buf(),
            watcher,
            debouncer,
        }))
    }
}

impl std::fmt::Debug for WatchedProject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchedProject").field("root", &self.root).finish()
    }
}

/// Apply batches in arrival order until every sender is gone
async fn apply_batches(
    mut rx: mpsc::UnboundedReceiver<(PathBuf, DebouncedBatch)>,
    indexer: Arc<dyn ContextIndexer>,
    monitor: Arc<DaemonMonitor>,
) {
    while let Some((root, batch)) = rx.recv().await {
        monitor.record_file_changes(batch.total_changes as u64);

        let indexer = Arc::clone(&indexer);
        let batch_id = batch.id.clone();
        let result = tokio::task::spawn_blocking(move || indexer.apply_batch(&root, &batch)).await;

        match result {
            Ok(Ok(touched)) => {
                debug!("Batch {} touched {} entries", batch_id, touched);
                monitor.record_context_update();
            }
            Ok(Err(e)) => {
                warn!("Batch {} failed: {}", batch_id, e);
                monitor.record_error();
            }
            Err(e) => {
                error!("Batch {} panicked: {}", batch_id, e);
                monitor.record_error();
            }
        }
    }
}

/// Handle a single connection, one JSON request per line
async fn handle_connection(mut stream: UnixStream, shared: Shared) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| DaemonError::Ipc(e.to_string()))?;
        if read == 0 {
            return Ok(());
        }

        let response = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => {
                debug!("Request: {:?}", request);
                dispatch(request, &shared).await
            }
            Err(e) => DaemonResponse::Error(format!("malformed request: {}", e)),
        };

        let response_json = serde_json::to_string(&response)?;
        writer
            .write_all(response_json.as_bytes())
            .await
            .map_err(|e| DaemonError::Ipc(e.to_string()))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| DaemonError::Ipc(e.to_string()))?;
    }
}

async fn dispatch(request: DaemonRequest, shared: &Shared) -> DaemonResponse {
    match request {
        DaemonRequest::Ping => DaemonResponse::Pong {
            pid: std::process::id(),
        },
        DaemonRequest::Stats => DaemonResponse::Stats(shared.monitor.get_stats()),
        DaemonRequest::Refresh { path, options } => {
            let indexer = Arc::clone(&shared.indexer);
            let result =
                tokio::task::spawn_blocking(move || indexer.refresh(&path, &options)).await;
            match result {
                Ok(Ok(summary)) => {
                    shared.monitor.record_context_update();
                    DaemonResponse::Refreshed(summary)
                }
                Ok(Err(e)) => {
                    shared.monitor.record_error();
                    DaemonResponse::Error(e.to_string())
                }
                Err(e) => DaemonResponse::Error(e.to_string()),
            }
        }
        DaemonRequest::Clear { path } => {
            let indexer = Arc::clone(&shared.indexer);
            match tokio::task::spawn_blocking(move || indexer.clear(&path)).await {
                Ok(Ok(summary)) => DaemonResponse::Cleared(summary),
                Ok(Err(e)) => DaemonResponse::Error(e.to_string()),
                Err(e) => DaemonResponse::Error(e.to_string()),
            }
        }
        DaemonRequest::Shutdown => {
            shared.shutdown.shutdown();
            DaemonResponse::Ok
        }
    }
}

#[cfg(unix)]
type TerminateSignal = Option<tokio::signal::unix::Signal>;

#[cfg(unix)]
fn terminate_signal() -> TerminateSignal {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(sig) => Some(sig),
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            None
        }
    }
}

#[cfg(unix)]
async fn recv_terminate(sig: &mut TerminateSignal) {
    match sig {
        Some(sig) => {
            sig.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
type TerminateSignal = ();

#[cfg(not(unix))]
fn terminate_signal() -> TerminateSignal {}

#[cfg(not(unix))]
async fn recv_terminate(_: &mut TerminateSignal) {
    std::future::pending::<()>().await
}
