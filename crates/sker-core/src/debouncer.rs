//! Change Debouncer - coalesce bursts of file events into stable batches
//!
//! A single tokio task owns the pending map and the debounce deadline.
//! Callers only enqueue, so `add_change` is safe from any thread
//! (including notify's callback thread).
//!
//! Flush triggers:
//! - `debounce_ms` of quiet since the last added event
//! - pending map reaching `batch_size` entries
//! - explicit `flush()` or `stop()`

use crate::event::{DebouncedBatch, FileChangeEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_DEBOUNCE_MS: u64 = 100;
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Debounce parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebouncerConfig {
    pub debounce_ms: u64,
    pub batch_size: usize,
}

impl Default for DebouncerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Partial update for `ChangeDebouncer::update_config`
#[derive(Debug, Clone, Copy, Default)]
pub struct DebouncerConfigUpdate {
    pub debounce_ms: Option<u64>,
    pub batch_size: Option<usize>,
}

/// Raised to error subscribers when a batch subscriber misbehaves
#[derive(Debug, thiserror::Error)]
pub enum DebouncerError {
    #[error("batch subscriber #{index} failed on batch {batch_id}: {message}")]
    SubscriberFailed {
        index: usize,
        batch_id: String,
        message: String,
    },
    #[error("batch subscriber #{index} panicked on batch {batch_id}")]
    SubscriberPanicked { index: usize, batch_id: String },
}

type BatchHandler = Arc<dyn Fn(&DebouncedBatch) -> anyhow::Result<()> + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&DebouncerError) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    batch: Vec<BatchHandler>,
    error: Vec<ErrorHandler>,
}

enum Command {
    Add(FileChangeEvent),
    Reconfigure,
    Flush(oneshot::Sender<Option<DebouncedBatch>>),
    Stop(oneshot::Sender<()>),
}

/// Debouncer handle. Cheap to share behind an `Arc`.
pub struct ChangeDebouncer {
    config: Arc<RwLock<DebouncerConfig>>,
    subscribers: Arc<RwLock<Subscribers>>,
    pending: Arc<AtomicUsize>,
    sender: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeDebouncer {
    pub fn new(config: DebouncerConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            subscribers: Arc::new(RwLock::new(Subscribers::default())),
            pending: Arc::new(AtomicUsize::new(0)),
            sender: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Subscribe to emitted batches. An `Err` or panic from the handler is
    /// reported to error subscribers and does not stop the other handlers.
    pub fn on_batch<F>(&self, handler: F)
    where
        F: Fn(&DebouncedBatch) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        write(&self.subscribers).batch.push(Arc::new(handler));
    }

    /// Subscribe to subscriber failures
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&DebouncerError) + Send + Sync + 'static,
    {
        write(&self.subscribers).error.push(Arc::new(handler));
    }

    /// Spawn the debounce task. Must be called inside a tokio runtime.
    /// Calling it while already running does nothing.
    pub fn start(&self) {
        let mut sender = lock(&self.sender);
        if sender.is_some() {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            pending: HashMap::new(),
            deadline: None,
            config: Arc::clone(&self.config),
            subscribers: Arc::clone(&self.subscribers),
            pending_count: Arc::clone(&self.pending),
        };

        *lock(&self.task) = Some(tokio::spawn(actor.run(rx)));
        *sender = Some(tx);
        debug!("Debouncer started");
    }

    /// Flush whatever is pending, dispatch it, then shut the task down.
    /// Returns once subscribers have seen the final batch.
    pub async fn stop(&self) {
        let Some(tx) = lock(&self.sender).take() else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(Command::Stop(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }

        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!("Debouncer stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.sender).is_some()
    }

    /// Queue a change. Dropped silently while stopped.
    pub fn add_change(&self, event: FileChangeEvent) {
        match lock(&self.sender).as_ref() {
            Some(tx) => {
                let _ = tx.send(Command::Add(event));
            }
            None => debug!("Debouncer stopped, dropping change for {}", event.path),
        }
    }

    /// Flush immediately. Returns the emitted batch, or `None` when nothing
    /// was pending or the debouncer is stopped.
    pub async fn flush(&self) -> Option<DebouncedBatch> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let sender = lock(&self.sender);
            let tx = sender.as_ref()?;
            tx.send(Command::Flush(reply_tx)).ok()?;
        }
        reply_rx.await.ok().flatten()
    }

    pub fn get_config(&self) -> DebouncerConfig {
        *read(&self.config)
    }

    /// Apply a partial update and restart the pending timer
    pub fn update_config(&self, update: DebouncerConfigUpdate) {
        {
            let mut config = write(&self.config);
            if let Some(ms) = update.debounce_ms {
                config.debounce_ms = ms;
            }
            if let Some(size) = update.batch_size {
                config.batch_size = size.max(1);
            }
            debug!("Debouncer config: {:?}", *config);
        }

        if let Some(tx) = lock(&self.sender).as_ref() {
            let _ = tx.send(Command::Reconfigure);
        }
    }

    /// Number of distinct (project, path) keys waiting for the next flush
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Default for ChangeDebouncer {
    fn default() -> Self {
        Self::new(DebouncerConfig::default())
    }
}

impl Drop for ChangeDebouncer {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

struct Actor {
    pending: HashMap<(String, String), FileChangeEvent>,
    deadline: Option<Instant>,
    config: Arc<RwLock<DebouncerConfig>>,
    subscribers: Arc<RwLock<Subscribers>>,
    pending_count: Arc<AtomicUsize>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.deadline;
            let wake = deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Add(event)) => self.add(event),
                    Some(Command::Reconfigure) => self.reconfigure(),
                    Some(Command::Flush(reply)) => {
                        let batch = self.flush();
                        let _ = reply.send(batch);
                    }
                    Some(Command::Stop(ack)) => {
                        self.flush();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.flush();
                        break;
                    }
                },

                _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                    self.flush();
                }
            }
        }
    }

    fn add(&mut self, event: FileChangeEvent) {
        let key = event.key();
        match self.pending.get_mut(&key) {
            Some(existing) => {
                existing.change_type = existing.change_type.merge(event.change_type);
                existing.timestamp = existing.timestamp.max(event.timestamp);
            }
            None => {
                self.pending.insert(key, event);
            }
        }
        self.pending_count.store(self.pending.len(), Ordering::SeqCst);
        self.schedule();
    }

    fn reconfigure(&mut self) {
        if !self.pending.is_empty() {
            self.schedule();
        }
    }

    /// Size-triggered flush, otherwise (re)arm the single timer
    fn schedule(&mut self) {
        let config = *read(&self.config);
        if self.pending.len() >= config.batch_size {
            debug!("Batch size {} reached", config.batch_size);
            self.flush();
        } else {
            self.deadline = Some(Instant::now() + Duration::from_millis(config.debounce_ms));
        }
    }

    fn flush(&mut self) -> Option<DebouncedBatch> {
        self.deadline = None;
        if self.pending.is_empty() {
            return None;
        }

        let mut changes: Vec<FileChangeEvent> = self.pending.drain().map(|(_, e)| e).collect();
        self.pending_count.store(0, Ordering::SeqCst);
        changes.sort_by(|a, b| (&a.project_id, &a.path).cmp(&(&b.project_id, &b.path)));

        let batch = DebouncedBatch::from_changes(changes);
        info!(
            "Flushing batch {}: {} changes, {} files, {} projects",
            batch.id,
            batch.total_changes,
            batch.unique_files,
            batch.project_ids.len()
        );

        self.dispatch(&batch);
        Some(batch)
    }

    fn dispatch(&self, batch: &DebouncedBatch) {
        let (handlers, error_handlers) = {
            let subs = read(&self.subscribers);
            (subs.batch.clone(), subs.error.clone())
        };

        for (index, handler) in handlers.iter().enumerate() {
            let failure = match catch_unwind(AssertUnwindSafe(|| handler(batch))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => DebouncerError::SubscriberFailed {
                    index,
                    batch_id: batch.id.clone(),
                    message: format!("{:#}", e),
                },
                Err(_) => DebouncerError::SubscriberPanicked {
                    index,
                    batch_id: batch.id.clone(),
                },
            };

            warn!("{}", failure);
            for on_error in &error_handlers {
                let _ = catch_unwind(AssertUnwindSafe(|| on_error(&failure)));
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeType;
    use anyhow::anyhow;

    fn collecting(debouncer: &ChangeDebouncer) -> Arc<Mutex<Vec<DebouncedBatch>>> {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        debouncer.on_batch(move |batch| {
            sink.lock().unwrap().push(batch.clone());
            Ok(())
        });
        batches
    }

    fn event(kind: ChangeType, path: &str, ts: i64) -> FileChangeEvent {
        FileChangeEvent::new(kind, path, "web").with_timestamp(ts)
    }

    fn new_debouncer(debounce_ms: u64, batch_size: usize) -> ChangeDebouncer {
        ChangeDebouncer::new(DebouncerConfig {
            debounce_ms,
            batch_size,
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_merges_to_latest_transition() {
        let debouncer = new_debouncer(50, 100);
        let batches = collecting(&debouncer);
        debouncer.start();

        debouncer.add_change(event(ChangeType::Add, "a.ts", 10));
        debouncer.add_change(event(ChangeType::Change, "a.ts", 30));
        debouncer.add_change(event(ChangeType::Change, "a.ts", 20));
        debouncer.add_change(event(ChangeType::Unlink, "b.ts", 10));
        debouncer.add_change(event(ChangeType::Add, "b.ts", 11));
        debouncer.add_change(event(ChangeType::Add, "c.ts", 10));
        debouncer.add_change(event(ChangeType::Unlink, "c.ts", 12));

        tokio::time::sleep(Duration::from_millis(80)).await;

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let changes = &batches[0].changes;
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].path, "a.ts");
        assert_eq!(changes[0].change_type, ChangeType::Change);
        assert_eq!(changes[0].timestamp, 30);
        assert_eq!(changes[1].change_type, ChangeType::Add);
        assert_eq!(changes[2].change_type, ChangeType::Unlink);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_size_flushes_without_waiting() {
        let debouncer = new_debouncer(10_000, 3);
        let batches = collecting(&debouncer);
        debouncer.start();

        for path in ["a", "b", "c"] {
            debouncer.add_change(event(ChangeType::Change, path, 1));
        }
        settle().await;

        assert_eq!(batches.lock().unwrap().len(), 1);
        assert_eq!(batches.lock().unwrap()[0].total_changes, 3);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_resets_on_each_change() {
        let debouncer = new_debouncer(100, 50);
        let batches = collecting(&debouncer);
        debouncer.start();

        debouncer.add_change(event(ChangeType::Add, "a", 1));
        tokio::time::sleep(Duration::from_millis(60)).await;
        debouncer.add_change(event(ChangeType::Add, "b", 2));
        tokio::time::sleep(Duration::from_millis(60)).await;

        // 120ms since the first change, only 60ms since the last
        assert!(batches.lock().unwrap().is_empty());
        assert_eq!(debouncer.pending_count(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].unique_files, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_pending_and_drops_later_changes() {
        let debouncer = new_debouncer(10_000, 50);
        let batches = collecting(&debouncer);
        debouncer.start();

        debouncer.add_change(event(ChangeType::Add, "a", 1));
        debouncer.add_change(event(ChangeType::Add, "b", 1));
        debouncer.stop().await;

        assert_eq!(batches.lock().unwrap().len(), 1);
        assert!(!debouncer.is_running());

        debouncer.add_change(event(ChangeType::Add, "c", 1));
        assert_eq!(debouncer.pending_count(), 0);
        assert!(debouncer.flush().await.is_none());
        assert_eq!(batches.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_subscribers_are_isolated() {
        let debouncer = new_debouncer(10, 50);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let error_sink = Arc::clone(&errors);

        debouncer.on_batch(|_| Err(anyhow!("indexer offline")));
        debouncer.on_batch(|_| panic!("subscriber bug"));
        let batches = collecting(&debouncer);
        debouncer.on_error(move |e| error_sink.lock().unwrap().push(e.to_string()));
        debouncer.start();

        debouncer.add_change(event(ChangeType::Change, "a", 1));
        let flushed = debouncer.flush().await;

        assert!(flushed.is_some());
        assert_eq!(batches.lock().unwrap().len(), 1);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("indexer offline"));
        assert!(errors[1].contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrinking_batch_size_flushes_pending() {
        let debouncer = new_debouncer(10_000, 10);
        let batches = collecting(&debouncer);
        debouncer.start();

        debouncer.add_change(event(ChangeType::Add, "a", 1));
        debouncer.add_change(event(ChangeType::Add, "b", 1));
        settle().await;
        assert!(batches.lock().unwrap().is_empty());

        debouncer.update_config(DebouncerConfigUpdate {
            batch_size: Some(2),
            ..Default::default()
        });
        settle().await;

        assert_eq!(batches.lock().unwrap().len(), 1);
        assert_eq!(debouncer.get_config().batch_size, 2);
        assert_eq!(debouncer.get_config().debounce_ms, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_debounce_period_applies_to_pending_changes() {
        let debouncer = new_debouncer(100, 50);
        let batches = collecting(&debouncer);
        debouncer.start();

        debouncer.add_change(event(ChangeType::Add, "a", 1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        debouncer.update_config(DebouncerConfigUpdate {
            debounce_ms: Some(500),
            ..Default::default()
        });

        // Past the old 100ms deadline, well short of the new one
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(batches.lock().unwrap().is_empty());
        assert_eq!(debouncer.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(360)).await;
        assert_eq!(batches.lock().unwrap().len(), 1);

        // Shortening works the same way
        debouncer.add_change(event(ChangeType::Add, "b", 2));
        settle().await;
        debouncer.update_config(DebouncerConfigUpdate {
            debounce_ms: Some(20),
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(batches.lock().unwrap().len(), 2);
        assert_eq!(debouncer.get_config().debounce_ms, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_projects_and_paths_counted() {
        let debouncer = new_debouncer(10, 50);
        debouncer.start();

        debouncer.add_change(FileChangeEvent::new(ChangeType::Add, "src/lib.rs", "core"));
        debouncer.add_change(FileChangeEvent::new(ChangeType::Add, "src/lib.rs", "cli"));
        debouncer.add_change(FileChangeEvent::new(ChangeType::Change, "README.md", "cli"));

        let batch = debouncer.flush().await.unwrap();
        assert_eq!(batch.total_changes, 3);
        assert_eq!(batch.unique_files, 2);
        assert_eq!(batch.project_ids.iter().collect::<Vec<_>>(), vec!["cli", "core"]);
    }
}
