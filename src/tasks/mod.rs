//! Task registry with progress broadcasting and cooperative control.
//!
//! Long-running jobs (heal batches) register here, report progress, and
//! call [`TaskMonitor::check`] between units of work. Users pause, resume or
//! cancel through the monitor; the job observes it at its next `check`.
//!
//! Every state change is published as a [`TaskEvent`]:
//!
//! ```json
//! {"type": "task_progress", "data": {"taskId": "…", "taskType": "heal",
//!  "state": "running", "progress": 40, "message": "…", "details": {}, "timestamp": 1700000000000}}
//! ```
//!
//! Broadcast is best-effort: a subscriber that falls behind skips the
//! events it missed. Only the most recent finished tasks stay queryable.
//!
//! # Usage
//!
//! ```ignore
//! let monitor = TaskMonitor::new();
//! let id = monitor.start("heal", "Starting");
//! for item in items {
//!     monitor.check(&id).await?;
//!     // ... work ...
//!     monitor.update(&id, pct, None, None);
//! }
//! monitor.finish(&id, "Done", None);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

/// Events kept for slow subscribers before they start skipping.
const EVENT_CAPACITY: usize = 256;

/// Finished tasks kept for [`TaskMonitor::get`]; older ones are dropped.
const FINISHED_RETAINED: usize = 32;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Paused,
    Cancelling,
    Completed,
    Error,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Snapshot of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: String,
    pub state: TaskState,
    /// 0-100, non-decreasing until a terminal state
    pub progress: u8,
    pub message: String,
    pub details: Value,
    /// Milliseconds since the epoch
    pub timestamp: i64,
}

/// Wire envelope for a task state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: TaskRecord,
}

impl TaskEvent {
    fn progress(record: TaskRecord) -> Self {
        Self {
            kind: "task_progress",
            data: record,
        }
    }
}

/// Raised by [`TaskMonitor::check`] once a cancel has been requested.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {task_id} cancelled")]
pub struct TaskCancelled {
    pub task_id: String,
}

/// Run-permit and cancel flag for one live task.
struct Control {
    permit: watch::Sender<bool>,
    cancelled: AtomicBool,
}

impl Control {
    fn new() -> Self {
        let (permit, _) = watch::channel(true);
        Self {
            permit,
            cancelled: AtomicBool::new(false),
        }
    }
}

struct Entry {
    record: TaskRecord,
    /// `None` once the task reached a terminal state
    control: Option<Arc<Control>>,
}

/// Registry of tasks. Share it behind an `Arc`.
pub struct TaskMonitor {
    tasks: Mutex<HashMap<String, Entry>>,
    /// Ids of terminal tasks, oldest first
    finished: Mutex<VecDeque<String>>,
    events: broadcast::Sender<TaskEvent>,
}

impl Default for TaskMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskMonitor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tasks: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            events,
        }
    }

    /// Subscribe to task events.
    pub fn subscribe(&self) -> TaskEvents {
        TaskEvents {
            rx: self.events.subscribe(),
        }
    }

    /// Current snapshot of a task.
    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.lock().get(task_id).map(|e| e.record.clone())
    }

    /// Ids of tasks that have not finished yet.
    pub fn active(&self) -> Vec<String> {
        self.tasks
            .lock()
            .values()
            .filter(|e| !e.record.state.is_terminal())
            .map(|e| e.record.task_id.clone())
            .collect()
    }

    /// Register a new running task and return its id.
    pub fn start(&self, task_type: &str, message: &str) -> String {
        let task_id = uuid::Uuid::new_v4().to_string();
        let record = TaskRecord {
            task_id: task_id.clone(),
            task_type: task_type.to_string(),
            state: TaskState::Running,
            progress: 0,
            message: message.to_string(),
            details: Value::Object(Default::default()),
            timestamp: now_millis(),
        };

        let mut tasks = self.tasks.lock();
        tasks.insert(
            task_id.clone(),
            Entry {
                record: record.clone(),
                control: Some(Arc::new(Control::new())),
            },
        );
        self.emit(record);
        drop(tasks);

        tracing::info!(target: "tasks", task_id = %task_id, task_type, "Task started");
        task_id
    }

    /// Report progress on a running task.
    ///
    /// Progress never decreases, and a paused or cancelling task keeps that
    /// state. Updates to unknown or finished tasks are ignored.
    pub fn update(
        &self,
        task_id: &str,
        progress: u8,
        message: Option<&str>,
        details: Option<Value>,
    ) -> bool {
        self.update_with_state(task_id, progress, message, details, TaskState::Running)
    }

    /// [`Self::update`] with an explicit state.
    pub fn update_with_state(
        &self,
        task_id: &str,
        progress: u8,
        message: Option<&str>,
        details: Option<Value>,
        state: TaskState,
    ) -> bool {
        self.mutate(task_id, |entry| {
            if entry.record.state.is_terminal() {
                return false;
            }
            let record = &mut entry.record;
            record.progress = record.progress.max(progress.min(100));
            if let Some(message) = message {
                record.message = message.to_string();
            }
            if let Some(details) = details {
                record.details = details;
            }
            let sticky = matches!(record.state, TaskState::Paused | TaskState::Cancelling);
            if !(sticky && state == TaskState::Running) {
                record.state = state;
            }
            true
        })
    }

    /// Mark a task completed at 100% and release its controls.
    pub fn finish(&self, task_id: &str, message: &str, details: Option<Value>) -> bool {
        let done = self.terminate(task_id, TaskState::Completed, message, details);
        if done {
            tracing::info!(target: "tasks", task_id, message, "Task completed");
            self.retire(task_id);
        }
        done
    }

    /// Mark a task failed and release its controls.
    pub fn error(&self, task_id: &str, message: &str) -> bool {
        let done = self.terminate(task_id, TaskState::Error, message, None);
        if done {
            tracing::error!(target: "tasks", task_id, message, "Task failed");
            self.retire(task_id);
        }
        done
    }

    /// Clear the run-permit; the task blocks at its next `check`.
    pub fn pause(&self, task_id: &str) -> bool {
        self.control(task_id, |entry, control| {
            control.permit.send_replace(false);
            if entry.record.state == TaskState::Running {
                entry.record.state = TaskState::Paused;
            }
        })
    }

    /// Set the run-permit again.
    pub fn resume(&self, task_id: &str) -> bool {
        self.control(task_id, |entry, control| {
            control.permit.send_replace(true);
            if entry.record.state == TaskState::Paused {
                entry.record.state = TaskState::Running;
            }
        })
    }

    /// Request cancellation. A paused task is woken so it can observe it.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.control(task_id, |entry, control| {
            control.cancelled.store(true, Ordering::SeqCst);
            control.permit.send_replace(true);
            entry.record.state = TaskState::Cancelling;
        })
    }

    /// Cooperation point.
    ///
    /// Fails with [`TaskCancelled`] if cancel was requested, otherwise waits
    /// until the task holds its run-permit. Unknown or finished tasks pass.
    pub async fn check(&self, task_id: &str) -> Result<(), TaskCancelled> {
        let control = {
            let tasks = self.tasks.lock();
            tasks.get(task_id).and_then(|e| e.control.clone())
        };
        let Some(control) = control else {
            return Ok(());
        };

        let cancelled = || {
            control.cancelled.load(Ordering::SeqCst).then(|| TaskCancelled {
                task_id: task_id.to_string(),
            })
        };

        let mut permit = control.permit.subscribe();
        loop {
            if let Some(e) = cancelled() {
                return Err(e);
            }
            if *permit.borrow_and_update() {
                return match cancelled() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
            }
            tracing::debug!(target: "tasks", task_id, "Paused, waiting for permit");
            if permit.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Queue a finished task and forget the oldest beyond [`FINISHED_RETAINED`].
    fn retire(&self, task_id: &str) {
        let evicted: Vec<String> = {
            let mut finished = self.finished.lock();
            finished.push_back(task_id.to_string());
            let excess = finished.len().saturating_sub(FINISHED_RETAINED);
            finished.drain(..excess).collect()
        };
        if evicted.is_empty() {
            return;
        }
        let mut tasks = self.tasks.lock();
        for id in &evicted {
            tasks.remove(id);
        }
        tracing::debug!(target: "tasks", evicted = evicted.len(), "Dropped old finished tasks");
    }

    fn emit(&self, record: TaskRecord) {
        // No subscribers is fine.
        let _ = self.events.send(TaskEvent::progress(record));
    }

    /// Apply `f` to an entry; emit when it reports a change. The lock is held
    /// across the send so events for one task stay in order.
    fn mutate(&self, task_id: &str, f: impl FnOnce(&mut Entry) -> bool) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(entry) = tasks.get_mut(task_id) else {
            return false;
        };
        if !f(entry) {
            return false;
        }
        entry.record.timestamp = now_millis();
        self.emit(entry.record.clone());
        true
    }

    fn control(&self, task_id: &str, f: impl FnOnce(&mut Entry, &Control)) -> bool {
        self.mutate(task_id, |entry| match entry.control.clone() {
            Some(control) => {
                f(entry, &control);
                true
            }
            None => false,
        })
    }

    fn terminate(
        &self,
        task_id: &str,
        state: TaskState,
        message: &str,
        details: Option<Value>,
    ) -> bool {
        self.mutate(task_id, |entry| {
            if entry.record.state.is_terminal() {
                return false;
            }
            if let Some(control) = entry.control.take() {
                // Wake anything still parked in `check`.
                control.permit.send_replace(true);
            }
            entry.record.state = state;
            entry.record.message = message.to_string();
            if state == TaskState::Completed {
                entry.record.progress = 100;
            }
            if let Some(details) = details {
                entry.record.details = details;
            }
            true
        })
    }
}

/// Subscriber handle that skips over events it was too slow to receive.
pub struct TaskEvents {
    rx: broadcast::Receiver<TaskEvent>,
}

impl TaskEvents {
    /// Next event, or `None` once the monitor is gone.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(target: "tasks", skipped, "Subscriber lagged, skipping events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt into a stream that ends when the monitor is dropped.
    pub fn into_stream(self) -> impl futures::Stream<Item = TaskEvent> {
        futures::stream::unfold(self, |mut events| async move {
            events.recv().await.map(|event| (event, events))
        })
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
