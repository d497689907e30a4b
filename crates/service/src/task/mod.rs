use relaygate_core::ids::generate_task_id;
use relaygate_core::pricing::PriceData;
use relaygate_core::storage::{now_ts, Task};
use relaygate_core::task::{format_progress, TaskStatus};
use relaygate_core::usage::Usage;
use serde::Serialize;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use crate::collaborators::{QuotaLedger, TaskStore};
use crate::errors::RelayError;
use crate::relay::reconciler::QuotaReservation;
use crate::runtime_config::ConfigStore;

pub mod budget;
pub mod executor;
pub mod poll;
pub mod query;
pub mod settle;
pub mod stream;
pub mod tracker;
pub mod worker;

pub use executor::TaskExecutor;
pub use query::TaskView;

/// Upstream execution started by strategy (a).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunHandle {
    pub execute_id: String,
    pub debug_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncStart {
    Started(RunHandle),
    /// The async endpoint cannot be used; the stream strategy takes over.
    Unavailable(String),
    /// Upstream accepted the call but refused to run it.
    Rejected(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    pub output: String,
    pub usage: Usage,
    pub execute_id: String,
    pub debug_url: String,
    /// Provider-reported credit cost, when the provider bills in credits.
    pub credits: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    Running,
    Succeeded(RunOutput),
    Failed(String),
}

/// One server-sent event, before provider decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Message {
        content: String,
        usage: Option<Usage>,
    },
    Done {
        execute_id: String,
        debug_url: String,
        usage: Option<Usage>,
    },
    Error(String),
    Ping,
    Other,
}

/// Terminal result of either execution strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    Succeeded(RunOutput),
    Failed(String),
}

/// Provider side of a background task. Both strategies must be supported:
/// async run + poll, and the streaming fallback.
pub trait TaskBackend: Send {
    fn start_async_run(&self) -> AsyncStart;

    /// One status query; `timeout` bounds this single call.
    fn poll_run(&self, run: &RunHandle, timeout: Duration) -> Result<PollState, String>;

    /// Opens the streaming run; `timeout` bounds the connect and every read.
    fn open_stream(&self, timeout: Duration) -> Result<Box<dyn BufRead + Send>, String>;

    fn decode_stream_event(&self, frame: &SseFrame) -> StreamEvent;
}

/// Everything the engine needs to persist and launch one background task.
pub struct TaskLaunch {
    pub user_id: i64,
    pub channel_id: i64,
    pub platform: String,
    pub action: String,
    pub group: String,
    pub model: String,
    pub price: PriceData,
    pub backend: Box<dyn TaskBackend>,
}

/// Caller-visible acknowledgement of an accepted task.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskSubmission {
    pub task_id: String,
    pub status: TaskStatus,
    pub submit_time: i64,
}

pub struct TaskEngine {
    store: Arc<dyn TaskStore>,
    ledger: Arc<dyn QuotaLedger>,
    config: Arc<ConfigStore>,
    executor: TaskExecutor,
}

impl TaskEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ledger: Arc<dyn QuotaLedger>,
        config: Arc<ConfigStore>,
    ) -> Self {
        let workers = config.snapshot().task_workers;
        Self {
            store,
            ledger,
            config,
            executor: TaskExecutor::new(workers),
        }
    }

    /// Persists the task and queues its worker. The reservation moves onto the
    /// task record once the row exists; before that, dropping it releases it.
    pub fn submit(
        &self,
        launch: TaskLaunch,
        reservation: QuotaReservation,
    ) -> Result<TaskSubmission, RelayError> {
        let now = now_ts();
        let mut task = Task {
            id: 0,
            task_id: generate_task_id(),
            user_id: launch.user_id,
            channel_id: launch.channel_id,
            platform: launch.platform,
            action: launch.action,
            group_name: launch.group,
            model: launch.model,
            status: TaskStatus::Submitted,
            progress: format_progress(0),
            data: "{}".to_string(),
            quota: 0,
            reserved_quota: reservation.amount(),
            settled: false,
            submit_time: now,
            start_time: 0,
            finish_time: 0,
            fail_reason: String::new(),
        };
        task.id = self
            .store
            .insert(&task)
            .map_err(|err| RelayError::local("task_persist_failed", err))?;
        reservation.hand_off();

        let submission = TaskSubmission {
            task_id: task.task_id.clone(),
            status: TaskStatus::Submitted,
            submit_time: now,
        };
        let ctx = self.worker_context();
        let job_ctx = ctx.clone();
        let job = worker::TaskJob {
            task: task.clone(),
            backend: launch.backend,
            price: launch.price,
        };
        let queued = self
            .executor
            .submit(&task.task_id, move || worker::run_task(&job_ctx, job));
        if !queued {
            worker::abandon_task(&ctx, task, "task queue unavailable");
            return Err(RelayError::local(
                "task_enqueue_failed",
                "background task queue is unavailable",
            ));
        }
        log::info!(
            "event=task_submitted task_id={} user_id={} channel_id={}",
            submission.task_id,
            launch.user_id,
            launch.channel_id
        );
        Ok(submission)
    }

    /// Read-only status projection for the task owner.
    pub fn query(&self, owner_id: i64, task_id: &str) -> Result<Option<TaskView>, String> {
        let task = self.store.get_by_task_id(owner_id, task_id.trim())?;
        Ok(task.as_ref().map(query::project))
    }

    fn worker_context(&self) -> worker::WorkerContext {
        worker::WorkerContext {
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            config: self.config.snapshot(),
        }
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.executor.is_pending(task_id)
    }
}
