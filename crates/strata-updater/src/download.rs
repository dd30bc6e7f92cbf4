//! Concurrent download scheduler.
//!
//! Tasks are kept in an arena keyed by [`TaskId`] from the moment they are
//! queued until they reach a terminal state, when they are removed and
//! their final snapshot is handed to whoever holds a [`TaskHandle`].
//!
//! A background dispatch loop pulls queued task ids and runs each transfer
//! under a semaphore. Failed attempts are queued again with a fresh byte
//! counter until the retry budget is spent.
//!
//! # Task states
//!
//! ```text
//! Queued -> Downloading -> Verifying -> Completed
//!    |           |             |
//!    |           +------+------+--> (retry) Queued
//!    |                  +---------> Failed
//!    +--> Paused -> Queued
//! any non-terminal state --------> Cancelled
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DownloadConfig;
use crate::error::UpdateError;
use crate::hash::{self, HashAlgorithm};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const BATCH_METADATA_KEY: &str = "batch_id";

pub type TaskId = Uuid;

/// State of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DownloadStatus {
    Queued,
    Downloading,
    /// Held in the arena but skipped by the dispatch loop
    Paused,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

/// What to fetch and where to put it.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    pub expected_hash: Option<String>,
    pub expected_size: Option<u64>,
    /// Digest of `expected_hash`; the scheduler default when unset
    pub algorithm: Option<HashAlgorithm>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            expected_hash: None,
            expected_size: None,
            algorithm: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.expected_hash = Some(hash.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }
}

/// One unit of download work.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    pub id: TaskId,
    pub url: String,
    pub destination: PathBuf,
    pub expected_hash: Option<String>,
    pub actual_hash: Option<String>,
    pub hash_algorithm: HashAlgorithm,
    pub expected_size: Option<u64>,
    pub status: DownloadStatus,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bytes per second over the current attempt
    pub average_speed: f64,
    pub eta: Option<Duration>,
    pub metadata: BTreeMap<String, String>,
}

impl DownloadTask {
    /// Batch this task was queued with, if any.
    pub fn batch_id(&self) -> Option<Uuid> {
        self.metadata
            .get(BATCH_METADATA_KEY)
            .and_then(|id| id.parse().ok())
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.downloaded_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        }
    }

    fn request(&self) -> DownloadRequest {
        DownloadRequest {
            url: self.url.clone(),
            destination: self.destination.clone(),
            expected_hash: self.expected_hash.clone(),
            expected_size: self.expected_size,
            algorithm: Some(self.hash_algorithm),
        }
    }
}

/// Progress of one transfer.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadProgress {
    pub task_id: TaskId,
    pub batch_id: Option<Uuid>,
    pub downloaded: u64,
    /// Total size, 0 when unknown
    pub total: u64,
    pub elapsed: Duration,
    pub speed_bytes_per_sec: f64,
    /// Undefined while the speed is zero or the total is unknown
    pub eta: Option<Duration>,
}

impl DownloadProgress {
    /// Derive speed and ETA from the bytes moved so far.
    pub fn measure(
        task_id: TaskId,
        batch_id: Option<Uuid>,
        downloaded: u64,
        total: u64,
        elapsed: Duration,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 {
            downloaded as f64 / secs
        } else {
            0.0
        };
        let eta = if speed > 0.0 && total > 0 {
            Some(Duration::from_secs_f64(
                total.saturating_sub(downloaded) as f64 / speed,
            ))
        } else {
            None
        };
        Self {
            task_id,
            batch_id,
            downloaded,
            total,
            elapsed,
            speed_bytes_per_sec: speed,
            eta,
        }
    }

    /// Get download progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total as f64 * 100.0).min(100.0)
        }
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.downloaded)
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.downloaded >= self.total
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} ({:.1}%) at {}/s",
            format_bytes(self.downloaded),
            format_bytes(self.total),
            self.percentage(),
            format_bytes(self.speed_bytes_per_sec as u64)
        )?;
        if let Some(eta) = self.eta {
            write!(f, ", {}s remaining", eta.as_secs())?;
        }
        Ok(())
    }
}

/// Human-readable byte count using binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Scheduler-wide notifications.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Progress(DownloadProgress),
    Retrying { task: DownloadTask, attempt: u32 },
    Completed(DownloadTask),
    Failed(DownloadTask),
    Cancelled(DownloadTask),
}

/// Aggregate state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    PartiallyCompleted,
}

impl BatchStatus {
    /// Fold the terminal states of a batch's tasks.
    ///
    /// An empty batch counts as completed.
    pub fn aggregate(statuses: impl IntoIterator<Item = DownloadStatus>) -> BatchStatus {
        let (mut total, mut completed) = (0usize, 0usize);
        for status in statuses {
            total += 1;
            if status == DownloadStatus::Completed {
                completed += 1;
            }
        }
        if completed == total {
            BatchStatus::Completed
        } else if completed == 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::PartiallyCompleted
        }
    }
}

/// Byte progress across a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub percentage: f64,
}

/// Tasks queued together.
#[derive(Debug)]
pub struct DownloadBatch {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub concurrent_downloads: usize,
    /// Sum of the expected sizes, fixed at creation
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub status: BatchStatus,
    /// Snapshots: queued state until the batch is waited on, terminal after
    pub tasks: Vec<DownloadTask>,
    handles: Vec<TaskHandle>,
}

impl DownloadBatch {
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id).collect()
    }

    pub fn overall_progress(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.downloaded_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        }
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &DownloadTask> {
        self.tasks
            .iter()
            .filter(|t| t.status != DownloadStatus::Completed)
    }
}

/// Observer of one task; resolves to its terminal snapshot.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    rx: watch::Receiver<DownloadTask>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Latest published state of the task.
    pub fn snapshot(&self) -> DownloadTask {
        self.rx.borrow().clone()
    }

    /// Wait until the task is completed, failed or cancelled.
    pub async fn wait(&mut self) -> DownloadTask {
        loop {
            {
                let task = self.rx.borrow_and_update();
                if task.status.is_terminal() {
                    return task.clone();
                }
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

struct TaskSlot {
    task: DownloadTask,
    cancel: CancellationToken,
    watch: watch::Sender<DownloadTask>,
}

impl TaskSlot {
    fn publish(&self) -> DownloadTask {
        let snapshot = self.task.clone();
        self.watch.send_replace(snapshot.clone());
        snapshot
    }
}

enum Settled {
    Finished,
    Retry,
}

struct SchedulerInner {
    client: reqwest::Client,
    config: DownloadConfig,
    tasks: DashMap<TaskId, TaskSlot>,
    queue: mpsc::UnboundedSender<TaskId>,
    semaphore: Arc<Semaphore>,
    events: broadcast::Sender<DownloadEvent>,
    shutdown: CancellationToken,
}

/// Bounded-concurrency download queue.
pub struct DownloadScheduler {
    inner: Arc<SchedulerInner>,
    pending_queue: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TaskId>>>,
}

impl DownloadScheduler {
    pub fn new(client: reqwest::Client, config: DownloadConfig) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = SchedulerInner {
            client,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            tasks: DashMap::new(),
            queue,
            events,
            shutdown: CancellationToken::new(),
        };
        Self {
            inner: Arc::new(inner),
            pending_queue: std::sync::Mutex::new(Some(receiver)),
        }
    }

    /// Start the dispatch loop. Calling this again is a no-op.
    pub fn start(&self) {
        let receiver = match self.pending_queue.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(receiver) = receiver {
            tokio::spawn(dispatch_loop(self.inner.clone(), receiver));
        }
    }

    /// Cancel every task and stop the dispatch loop for good.
    pub fn stop(&self) {
        self.cancel_all();
        self.inner.shutdown.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    /// Queue one download.
    pub fn queue_download(&self, request: DownloadRequest) -> TaskHandle {
        self.register(request, None)
    }

    /// Queue several downloads as one batch.
    pub fn queue_batch(&self, requests: Vec<DownloadRequest>) -> DownloadBatch {
        let id = Uuid::new_v4();
        let total_bytes = requests.iter().filter_map(|r| r.expected_size).sum();
        let handles: Vec<TaskHandle> = requests
            .into_iter()
            .map(|request| self.register(request, Some(id)))
            .collect();
        let tasks = handles.iter().map(TaskHandle::snapshot).collect();

        info!(batch_id = %id, tasks = handles.len(), total_bytes, "Queued download batch");
        DownloadBatch {
            id,
            created_at: Utc::now(),
            concurrent_downloads: self.inner.config.max_concurrent,
            total_bytes,
            downloaded_bytes: 0,
            status: BatchStatus::Pending,
            tasks,
            handles,
        }
    }

    fn register(&self, request: DownloadRequest, batch_id: Option<Uuid>) -> TaskHandle {
        let id = Uuid::new_v4();
        let mut metadata = BTreeMap::new();
        if let Some(batch_id) = batch_id {
            metadata.insert(BATCH_METADATA_KEY.to_string(), batch_id.to_string());
        }
        let task = DownloadTask {
            id,
            url: request.url,
            destination: request.destination,
            expected_hash: request.expected_hash,
            actual_hash: None,
            hash_algorithm: request.algorithm.unwrap_or(self.inner.config.algorithm),
            expected_size: request.expected_size,
            status: DownloadStatus::Queued,
            total_bytes: request.expected_size.unwrap_or(0),
            downloaded_bytes: 0,
            retry_count: 0,
            max_retries: self.inner.config.max_retries.max(1),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            average_speed: 0.0,
            eta: None,
            metadata,
        };
        debug!(task_id = %id, url = %task.url, "Queued download");

        let (watch, rx) = watch::channel(task.clone());
        let slot = TaskSlot {
            task,
            cancel: self.inner.shutdown.child_token(),
            watch,
        };
        self.inner.tasks.insert(id, slot);
        let _ = self.inner.queue.send(id);
        TaskHandle { id, rx }
    }

    /// Download one file and wait for the outcome.
    pub async fn download_file(&self, request: DownloadRequest) -> Result<DownloadTask, UpdateError> {
        let mut handle = self.queue_download(request);
        self.start();
        let task = handle.wait().await;
        match task.status {
            DownloadStatus::Completed => Ok(task),
            DownloadStatus::Cancelled => Err(UpdateError::Cancelled),
            _ => Err(UpdateError::DownloadFailed {
                reason: task.error.clone().unwrap_or_else(|| "unknown error".into()),
                url: task.url,
            }),
        }
    }

    /// Queue `requests` as a batch and wait for every task to finish.
    pub async fn download_batch<F>(
        &self,
        requests: Vec<DownloadRequest>,
        on_progress: F,
        cancel: &CancellationToken,
    ) -> DownloadBatch
    where
        F: Fn(BatchProgress) + Send + Sync,
    {
        let events = self.subscribe();
        let batch = self.queue_batch(requests);
        self.wait_batch(batch, events, on_progress, cancel).await
    }

    async fn wait_batch<F>(
        &self,
        mut batch: DownloadBatch,
        mut events: broadcast::Receiver<DownloadEvent>,
        on_progress: F,
        cancel: &CancellationToken,
    ) -> DownloadBatch
    where
        F: Fn(BatchProgress) + Send + Sync,
    {
        self.start();
        batch.status = BatchStatus::InProgress;
        let ids = batch.task_ids();
        let handles = std::mem::take(&mut batch.handles);
        let waits = join_all(handles.into_iter().map(|mut h| async move { h.wait().await }));
        tokio::pin!(waits);

        let mut per_task: HashMap<TaskId, u64> = HashMap::new();
        let mut events_open = true;
        let mut cancel_sent = false;
        let finished = loop {
            tokio::select! {
                tasks = &mut waits => break tasks,
                event = events.recv(), if events_open => match event {
                    Ok(DownloadEvent::Progress(p)) if p.batch_id == Some(batch.id) => {
                        per_task.insert(p.task_id, p.downloaded);
                        let downloaded_bytes = per_task.values().sum();
                        let percentage = if batch.total_bytes == 0 {
                            0.0
                        } else {
                            (downloaded_bytes as f64 / batch.total_bytes as f64 * 100.0).min(100.0)
                        };
                        on_progress(BatchProgress {
                            batch_id: batch.id,
                            downloaded_bytes,
                            total_bytes: batch.total_bytes,
                            percentage,
                        });
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(batch_id = %batch.id, skipped, "Batch progress lagged");
                    }
                    Err(RecvError::Closed) => events_open = false,
                },
                _ = cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    for id in &ids {
                        self.cancel_task(*id);
                    }
                }
            }
        };

        batch.downloaded_bytes = finished.iter().map(|t| t.downloaded_bytes).sum();
        batch.status = BatchStatus::aggregate(finished.iter().map(|t| t.status));
        batch.tasks = finished;
        info!(batch_id = %batch.id, status = ?batch.status, "Download batch finished");
        batch
    }

    /// Cancel a task. Returns false when it is unknown or already finished.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        let idle = match self.inner.tasks.get(&id) {
            Some(slot) => {
                slot.cancel.cancel();
                matches!(slot.task.status, DownloadStatus::Queued | DownloadStatus::Paused)
            }
            None => return false,
        };
        if idle {
            self.inner.finish(id, DownloadStatus::Cancelled);
        }
        true
    }

    pub fn cancel_all(&self) {
        let ids: Vec<TaskId> = self.inner.tasks.iter().map(|slot| *slot.key()).collect();
        for id in ids {
            self.cancel_task(id);
        }
    }

    /// Hold a queued task. Running tasks cannot be paused.
    pub fn pause_task(&self, id: TaskId) -> bool {
        match self.inner.tasks.get_mut(&id) {
            Some(mut slot) if slot.task.status == DownloadStatus::Queued => {
                slot.task.status = DownloadStatus::Paused;
                slot.publish();
                true
            }
            _ => false,
        }
    }

    /// Queue a paused task again.
    pub fn resume_task(&self, id: TaskId) -> bool {
        let resumed = match self.inner.tasks.get_mut(&id) {
            Some(mut slot) if slot.task.status == DownloadStatus::Paused => {
                slot.task.status = DownloadStatus::Queued;
                slot.publish();
                true
            }
            _ => false,
        };
        if resumed {
            let _ = self.inner.queue.send(id);
        }
        resumed
    }

    /// Current state of a live task. Finished tasks are no longer tracked.
    pub fn task(&self, id: TaskId) -> Option<DownloadTask> {
        self.inner.tasks.get(&id).map(|slot| slot.task.clone())
    }

    pub fn tasks(&self) -> Vec<DownloadTask> {
        self.inner.tasks.iter().map(|slot| slot.task.clone()).collect()
    }

    /// Tasks currently transferring or verifying.
    pub fn active_count(&self) -> usize {
        self.count_where(|s| matches!(s, DownloadStatus::Downloading | DownloadStatus::Verifying))
    }

    pub fn queued_count(&self) -> usize {
        self.count_where(|s| s == DownloadStatus::Queued)
    }

    fn count_where(&self, predicate: impl Fn(DownloadStatus) -> bool) -> usize {
        self.inner
            .tasks
            .iter()
            .filter(|slot| predicate(slot.task.status))
            .count()
    }
}

impl Drop for DownloadScheduler {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn dispatch_loop(inner: Arc<SchedulerInner>, mut queue: mpsc::UnboundedReceiver<TaskId>) {
    let poll = Duration::from_millis(inner.config.poll_interval_ms.max(1));
    debug!("Download dispatch loop started");

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        let id = match tokio::time::timeout(poll, queue.recv()).await {
            Ok(Some(id)) => id,
            Ok(None) => break,
            Err(_) => continue,
        };
        if !inner.is_queued(id) {
            continue;
        }

        let permit = tokio::select! {
            permit = inner.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = inner.shutdown.cancelled() => break,
        };
        let worker = inner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            worker.run_queued(id).await;
        });
    }

    debug!("Download dispatch loop stopped");
}

impl SchedulerInner {
    fn is_queued(&self, id: TaskId) -> bool {
        self.tasks
            .get(&id)
            .map(|slot| slot.task.status == DownloadStatus::Queued)
            .unwrap_or(false)
    }

    async fn run_queued(self: Arc<Self>, id: TaskId) {
        let Some((request, cancel, batch_id)) = self.begin(id) else {
            return;
        };
        let result = self.transfer(id, batch_id, &request, &cancel).await;
        if let Some(Settled::Retry) = self.settle(id, &request, result) {
            self.requeue(id);
        }
    }

    /// Move a queued task to `Downloading`. `None` when it is no longer runnable.
    fn begin(&self, id: TaskId) -> Option<(DownloadRequest, CancellationToken, Option<Uuid>)> {
        let mut slot = self.tasks.get_mut(&id)?;
        if slot.task.status != DownloadStatus::Queued {
            return None;
        }
        slot.task.status = DownloadStatus::Downloading;
        slot.task.downloaded_bytes = 0;
        slot.task.started_at.get_or_insert_with(Utc::now);
        slot.publish();
        Some((slot.task.request(), slot.cancel.clone(), slot.task.batch_id()))
    }

    async fn transfer(
        &self,
        id: TaskId,
        batch_id: Option<Uuid>,
        request: &DownloadRequest,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let response = tokio::select! {
            response = self.client.get(&request.url).send() => response?,
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
        };
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Network {
                url: request.url.clone(),
                status: status.as_u16(),
            });
        }

        let total = response
            .content_length()
            .or(request.expected_size)
            .unwrap_or(0);
        self.update(id, |task| task.total_bytes = total);

        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&request.destination).await?;
        let mut writer = BufWriter::with_capacity(self.config.chunk_size_bytes, file);
        let mut stream = response.bytes_stream();

        let interval = Duration::from_millis(self.config.progress_interval_ms);
        let started = Instant::now();
        let mut last_report: Option<Instant> = None;
        let mut downloaded: u64 = 0;

        loop {
            let next = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if last_report.map_or(true, |at| at.elapsed() >= interval) {
                last_report = Some(Instant::now());
                self.report_progress(id, batch_id, downloaded, total, started.elapsed());
            }
        }
        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        self.report_progress(id, batch_id, downloaded, total.max(downloaded), started.elapsed());

        if let Some(expected) = &request.expected_hash {
            let algorithm = request.algorithm.unwrap_or(self.config.algorithm);
            self.update(id, |task| task.status = DownloadStatus::Verifying);
            let actual = hash::hash_file(&request.destination, algorithm).await?;
            self.update(id, |task| task.actual_hash = Some(actual.clone()));
            if !hash::hashes_match(expected, &actual) {
                return Err(UpdateError::HashMismatch {
                    path: request.destination.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    fn report_progress(
        &self,
        id: TaskId,
        batch_id: Option<Uuid>,
        downloaded: u64,
        total: u64,
        elapsed: Duration,
    ) {
        let progress = DownloadProgress::measure(id, batch_id, downloaded, total, elapsed);
        self.update(id, |task| {
            task.downloaded_bytes = downloaded;
            task.total_bytes = total;
            task.average_speed = progress.speed_bytes_per_sec;
            task.eta = progress.eta;
        });
        let _ = self.events.send(DownloadEvent::Progress(progress));
    }

    fn update(&self, id: TaskId, apply: impl FnOnce(&mut DownloadTask)) {
        if let Some(mut slot) = self.tasks.get_mut(&id) {
            apply(&mut slot.task);
            slot.publish();
        }
    }

    /// Record the outcome of an attempt.
    fn settle(
        &self,
        id: TaskId,
        request: &DownloadRequest,
        result: Result<(), UpdateError>,
    ) -> Option<Settled> {
        let error = match result {
            Ok(()) => {
                self.finish(id, DownloadStatus::Completed);
                return Some(Settled::Finished);
            }
            Err(UpdateError::Cancelled) => {
                self.finish(id, DownloadStatus::Cancelled);
                discard_partial(request);
                return Some(Settled::Finished);
            }
            Err(e) => e,
        };

        let cancelled = self.tasks.get(&id)?.cancel.is_cancelled();
        if cancelled {
            debug!(task_id = %id, error = %error, "Attempt failed after cancellation");
            self.finish(id, DownloadStatus::Cancelled);
            discard_partial(request);
            return Some(Settled::Finished);
        }

        let retry = {
            let mut slot = self.tasks.get_mut(&id)?;
            slot.task.retry_count += 1;
            slot.task.error = Some(error.to_string());
            warn!(
                task_id = %id,
                url = %slot.task.url,
                attempt = slot.task.retry_count,
                max_retries = slot.task.max_retries,
                error = %error,
                "Download attempt failed"
            );
            if slot.task.retry_count < slot.task.max_retries {
                slot.task.status = DownloadStatus::Queued;
                slot.task.downloaded_bytes = 0;
                Some((slot.publish(), slot.task.retry_count))
            } else {
                None
            }
        };

        match retry {
            Some((task, attempt)) => {
                let _ = self.events.send(DownloadEvent::Retrying { task, attempt });
                Some(Settled::Retry)
            }
            None => {
                self.finish(id, DownloadStatus::Failed);
                discard_partial(request);
                Some(Settled::Finished)
            }
        }
    }

    fn requeue(self: &Arc<Self>, id: TaskId) {
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        if delay.is_zero() {
            let _ = self.queue.send(id);
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inner.queue.send(id);
        });
    }

    /// Drop a task from the arena in a terminal state and announce it.
    fn finish(&self, id: TaskId, status: DownloadStatus) -> Option<DownloadTask> {
        let (_, mut slot) = self.tasks.remove(&id)?;
        slot.task.status = status;
        slot.task.completed_at = Some(Utc::now());
        let task = slot.publish();

        let event = match status {
            DownloadStatus::Completed => {
                info!(task_id = %id, url = %task.url, bytes = task.downloaded_bytes, "Download completed");
                DownloadEvent::Completed(task.clone())
            }
            DownloadStatus::Cancelled => {
                info!(task_id = %id, url = %task.url, "Download cancelled");
                DownloadEvent::Cancelled(task.clone())
            }
            _ => {
                warn!(task_id = %id, url = %task.url, error = ?task.error, "Download failed");
                DownloadEvent::Failed(task.clone())
            }
        };
        let _ = self.events.send(event);
        Some(task)
    }
}

fn discard_partial(request: &DownloadRequest) {
    if let Err(e) = std::fs::remove_file(&request.destination) {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %request.destination.display(), error = %e, "Could not remove partial download");
        }
    }
}
