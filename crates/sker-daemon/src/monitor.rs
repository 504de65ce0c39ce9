//! Daemon Monitor - liveness, health checks, resource usage and counters
//!
//! Status is always derived fresh from the PID file. Health checks combine
//! three independent tests (process, control socket, resources) and track
//! a failure streak. Counters persist to a JSON stats file.
//!
//! Events go out on a broadcast channel, so a slow or dropped subscriber
//! never affects the monitor.

use crate::error::{DaemonError, Result};
use crate::process::{self, DaemonPaths};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sker_core::config::GlobalWatchConfig;
use sker_core::event::now_millis;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Failed checks in a row before the daemon counts as unhealthy
pub const FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub max_memory_mb: f64,
    pub max_cpu_percent: f64,
}

impl ResourceLimits {
    pub fn from_global(config: &GlobalWatchConfig) -> Self {
        Self {
            max_memory_mb: config.performance.max_memory_mb as f64,
            max_cpu_percent: config.performance.max_cpu_percent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub pid_file: PathBuf,
    pub socket_path: PathBuf,
    pub stats_file: PathBuf,
    pub check_interval: Duration,
    pub limits: ResourceLimits,
}

impl MonitorConfig {
    pub fn new(paths: &DaemonPaths, limits: ResourceLimits) -> Self {
        Self {
            pid_file: paths.pid_file.clone(),
            socket_path: paths.socket_path.clone(),
            stats_file: paths.stats_file.clone(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            limits,
        }
    }

    pub fn from_global(config: &GlobalWatchConfig) -> Self {
        Self::new(&DaemonPaths::from_config(config), ResourceLimits::from_global(config))
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }
}

/// Point-in-time view of the daemon process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub is_running: bool,
    pub pid: Option<u32>,
    /// Milliseconds since the unix epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonStatus {
    fn stopped(pid: Option<u32>, error: impl Into<String>) -> Self {
        Self {
            is_running: false,
            pid,
            start_time: None,
            uptime: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    /// Process and socket fine, resources over their limits
    Warning,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub healthy: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CheckOutcome {
    fn pass(message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
            details,
        }
    }

    fn fail(message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
            details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthChecks {
    pub process: CheckOutcome,
    pub socket: CheckOutcome,
    pub resources: CheckOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub timestamp: i64,
    pub status: HealthState,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_check: Option<i64>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            is_healthy: true,
            consecutive_failures: 0,
            last_check: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStats {
    pub project_count: u64,
    pub file_changes: u64,
    pub context_updates: u64,
    pub errors: u64,
    /// Seconds since the monitor was created. Recomputed, never restored.
    #[serde(default)]
    pub uptime: u64,
    pub last_update: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub rss_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReport {
    pub pid: u32,
    pub within_limits: bool,
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    StatusChange(DaemonStatus),
    HealthChange {
        result: HealthCheckResult,
        status: HealthStatus,
    },
    StatsUpdate(DaemonStats),
}

#[derive(Debug, Default)]
struct Counters {
    project_count: u64,
    file_changes: u64,
    context_updates: u64,
    errors: u64,
    last_update: i64,
}

pub struct DaemonMonitor {
    config: MonitorConfig,
    created: Instant,
    system: Mutex<System>,
    health: Mutex<HealthStatus>,
    counters: Mutex<Counters>,
    last_running: Mutex<Option<bool>>,
    events: broadcast::Sender<MonitorEvent>,
    checking: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DaemonMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            created: Instant::now(),
            system: Mutex::new(System::new()),
            health: Mutex::new(HealthStatus::default()),
            counters: Mutex::new(Counters {
                last_update: now_millis(),
                ..Default::default()
            }),
            last_running: Mutex::new(None),
            events,
            checking: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Receive `statusChange`, `healthChange` and `statsUpdate` events
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MonitorEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Derive the daemon status from the PID file. Never fails: problems
    /// show up in `error`.
    pub async fn get_daemon_status(&self) -> DaemonStatus {
        let pid_file = &self.config.pid_file;

        let pid = match process::read_pid(pid_file).await {
            Ok(Some(pid)) => pid,
            Ok(None) => {
                let reason = format!("No PID file at {}", pid_file.display());
                return DaemonStatus::stopped(None, reason);
            }
            Err(e) => return DaemonStatus::stopped(None, e.to_string()),
        };

        if !process::is_process_alive(pid) {
            let reason = format!("Process {} does not exist (stale PID file)", pid);
            return DaemonStatus::stopped(Some(pid), reason);
        }

        let started = process::pid_file_written_at(pid_file).await;
        let start_time = started
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64);
        let uptime = started
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .map(|d| d.as_secs());

        DaemonStatus {
            is_running: true,
            pid: Some(pid),
            start_time,
            uptime,
            error: None,
        }
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// Run all three checks, update the failure streak and emit
    /// `HealthChange` whatever the outcome.
    pub async fn perform_health_check(&self) -> HealthCheckResult {
        let status = self.get_daemon_status().await;
        self.check_with_status(&status).await
    }

    async fn check_with_status(&self, status: &DaemonStatus) -> HealthCheckResult {
        let process = match (status.is_running, status.pid) {
            (true, Some(pid)) => CheckOutcome::pass(
                format!("Process {} is running", pid),
                Some(json!({ "pid": pid, "uptime": status.uptime })),
            ),
            _ => CheckOutcome::fail(
                status.error.clone().unwrap_or_else(|| "Daemon is not running".to_string()),
                status.pid.map(|pid| json!({ "pid": pid })),
            ),
        };

        let socket_path = &self.config.socket_path;
        let socket = match tokio::fs::metadata(socket_path).await {
            Ok(_) => {
                let detail = format!("Control socket present at {}", socket_path.display());
                CheckOutcome::pass(detail, None)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let detail = format!("Control socket not found at {}", socket_path.display());
                CheckOutcome::fail(detail, None)
            }
            Err(e) => CheckOutcome::fail(format!("Cannot stat control socket: {}", e), None),
        };

        let target = status.pid.filter(|_| status.is_running);
        let resources = match self.resource_report(target, &self.config.limits) {
            Some(report) => {
                let details = serde_json::to_value(&report).ok();
                if report.within_limits {
                    CheckOutcome::pass(
                        format!("{:.1} MB, {:.1}% CPU", report.memory_mb, report.cpu_percent),
                        details,
                    )
                } else {
                    CheckOutcome::fail(report.violations.join("; "), details)
                }
            }
            None => CheckOutcome::fail("Unable to sample process resources", None),
        };

        let state = if process.healthy && socket.healthy && resources.healthy {
            HealthState::Healthy
        } else if process.healthy && socket.healthy {
            HealthState::Warning
        } else {
            HealthState::Unhealthy
        };

        let result = HealthCheckResult {
            timestamp: now_millis(),
            status: state,
            checks: HealthChecks {
                process,
                socket,
                resources,
            },
        };

        let health = {
            let mut health = lock(&self.health);
            let was_healthy = health.is_healthy;

            if state == HealthState::Healthy {
                health.consecutive_failures = 0;
            } else {
                health.consecutive_failures += 1;
            }
            health.is_healthy = health.consecutive_failures < FAILURE_THRESHOLD;
            health.last_check = Some(result.timestamp);

            if was_healthy != health.is_healthy {
                info!(
                    "Daemon health changed: healthy={} after {} consecutive failures",
                    health.is_healthy, health.consecutive_failures
                );
            }
            health.clone()
        };

        if state != HealthState::Healthy {
            debug!("Health check {:?}: {:?}", state, result.checks);
        }

        self.emit(MonitorEvent::HealthChange {
            result: result.clone(),
            status: health,
        });
        result
    }

    pub fn get_health_status(&self) -> HealthStatus {
        lock(&self.health).clone()
    }

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    fn sample(&self, pid: Option<u32>) -> Option<(MemoryUsage, f64, u32)> {
        let raw = pid.unwrap_or_else(std::process::id);
        let pid = Pid::from_u32(raw);

        let mut sys = lock(&self.system);
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = sys.process(pid)?;

        let memory = MemoryUsage {
            rss_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
            rss_mb: process.memory() as f64 / (1024.0 * 1024.0),
        };
        Some((memory, process.cpu_usage() as f64, raw))
    }

    /// Memory of `pid`, or of this process when `None`
    pub fn get_memory_usage(&self, pid: Option<u32>) -> Option<MemoryUsage> {
        self.sample(pid).map(|(memory, _, _)| memory)
    }

    /// CPU percent of `pid` since the previous sample (0 on the first)
    pub fn get_cpu_usage(&self, pid: Option<u32>) -> Option<f64> {
        self.sample(pid).map(|(_, cpu, _)| cpu)
    }

    /// Compare the running daemon (or this process) against `limits`
    pub async fn check_resource_limits(&self, limits: &ResourceLimits) -> Option<ResourceReport> {
        let status = self.get_daemon_status().await;
        self.resource_report(status.pid.filter(|_| status.is_running), limits)
    }

    fn resource_report(&self, pid: Option<u32>, limits: &ResourceLimits) -> Option<ResourceReport> {
        let (memory, cpu_percent, pid) = self.sample(pid)?;
        let mut violations = Vec::new();

        if memory.rss_mb > limits.max_memory_mb {
            violations.push(format!(
                "memory {:.1} MB exceeds limit {:.0} MB",
                memory.rss_mb, limits.max_memory_mb
            ));
        }
        if cpu_percent > limits.max_cpu_percent {
            violations.push(format!(
                "cpu {:.1}% exceeds limit {:.0}%",
                cpu_percent, limits.max_cpu_percent
            ));
        }

        Some(ResourceReport {
            pid,
            within_limits: violations.is_empty(),
            memory_mb: memory.rss_mb,
            cpu_percent,
            violations,
        })
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    fn update_counters(&self, f: impl FnOnce(&mut Counters)) {
        {
            let mut counters = lock(&self.counters);
            f(&mut counters);
            counters.last_update = now_millis();
        }
        self.emit(MonitorEvent::StatsUpdate(self.get_stats()));
    }

    pub fn record_project_count(&self, count: u64) {
        self.update_counters(|c| c.project_count = count);
    }

    pub fn record_file_change(&self) {
        self.record_file_changes(1);
    }

    pub fn record_file_changes(&self, count: u64) {
        self.update_counters(|c| c.file_changes += count);
    }

    pub fn record_context_update(&self) {
        self.update_counters(|c| c.context_updates += 1);
    }

    pub fn record_error(&self) {
        self.update_counters(|c| c.errors += 1);
    }

    pub fn get_stats(&self) -> DaemonStats {
        let counters = lock(&self.counters);
        DaemonStats {
            project_count: counters.project_count,
            file_changes: counters.file_changes,
            context_updates: counters.context_updates,
            errors: counters.errors,
            uptime: self.created.elapsed().as_secs(),
            last_update: counters.last_update,
        }
    }

    pub fn reset_stats(&self) {
        self.update_counters(|c| {
            *c = Counters::default();
        });
    }

    pub async fn save_stats(&self) -> Result<()> {
        let path = &self.config.stats_file;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DaemonError::io(parent, e))?;
        }

        let content = serde_json::to_string_pretty(&self.get_stats())?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| DaemonError::io(path, e))?;
        debug!("Stats saved to {:?}", path);
        Ok(())
    }

    /// Restore counters from the stats file. Returns false when there is
    /// no file yet. `uptime` is never restored.
    pub async fn load_stats(&self) -> Result<bool> {
        let path = &self.config.stats_file;
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(DaemonError::io(path, e)),
        };

        let saved: DaemonStats = serde_json::from_str(&content)?;
        {
            let mut counters = lock(&self.counters);
            counters.project_count = saved.project_count;
            counters.file_changes = saved.file_changes;
            counters.context_updates = saved.context_updates;
            counters.errors = saved.errors;
            counters.last_update = saved.last_update;
        }

        info!("Restored stats from {:?}", path);
        self.emit(MonitorEvent::StatsUpdate(self.get_stats()));
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Continuous monitoring
    // -----------------------------------------------------------------------

    /// Poll status and health every `check_interval`. Checks never overlap.
    pub fn start(self: &Arc<Self>) {
        let mut task = lock(&self.task);
        if task.is_some() {
            return;
        }

        let monitor = Arc::downgrade(self);
        let period = self.config.check_interval;

        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.tick().await;
            }
        }));

        info!("Monitor started (every {:?})", period);
    }

    async fn tick(&self) {
        if self.checking.swap(true, Ordering::SeqCst) {
            debug!("Previous health check still running, skipping");
            return;
        }

        let status = self.get_daemon_status().await;
        let changed = {
            let mut last = lock(&self.last_running);
            let changed = *last != Some(status.is_running);
            *last = Some(status.is_running);
            changed
        };
        if changed {
            self.emit(MonitorEvent::StatusChange(status.clone()));
        }

        self.check_with_status(&status).await;

        if let Err(e) = self.save_stats().await {
            warn!("Failed to save stats: {}", e);
        }

        self.checking.store(false, Ordering::SeqCst);
    }

    /// Cancel the polling loop and persist counters
    pub async fn stop(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            self.checking.store(false, Ordering::SeqCst);

            if let Err(e) = self.save_stats().await {
                warn!("Failed to save stats: {}", e);
            }
            info!("Monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).is_some()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
