use relaygate_core::storage::{now_ts, Task};
use relaygate_core::task::{format_progress, parse_progress, TaskStatus};
use relaygate_core::usage::Usage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{RunHandle, RunOutput};
use crate::collaborators::TaskStore;

/// Worker-owned payload stored in `tasks.data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskData {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub execute_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub debug_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub strategy: String,
}

impl TaskData {
    pub fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }
}

/// Sole writer of one task record. Progress only moves forward and terminal
/// statuses are final.
pub struct TaskTracker {
    store: Arc<dyn TaskStore>,
    task: Task,
    data: TaskData,
    progress: u32,
}

impl TaskTracker {
    pub fn new(store: Arc<dyn TaskStore>, task: Task) -> Self {
        let data = TaskData::parse(&task.data);
        let progress = parse_progress(&task.progress).unwrap_or(0);
        Self {
            store,
            task,
            data,
            progress,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn progress(&self) -> u32 {
        self.progress
    }

    pub fn is_terminal(&self) -> bool {
        self.task.status.is_terminal()
    }

    pub fn begin(&mut self) {
        if !self.transition(TaskStatus::InProgress) {
            return;
        }
        self.task.start_time = now_ts();
        self.persist();
    }

    pub fn record_run(&mut self, run: &RunHandle, strategy: &str) {
        self.data.execute_id = run.execute_id.clone();
        self.data.debug_url = run.debug_url.clone();
        self.data.strategy = strategy.to_string();
        self.persist();
    }

    pub fn set_strategy(&mut self, strategy: &str) {
        self.data.strategy = strategy.to_string();
    }

    /// Moves progress forward. A lower value is an integrity problem upstream:
    /// it is logged and the higher value kept.
    pub fn advance(&mut self, percent: u32) {
        let percent = percent.min(100);
        if percent < self.progress {
            log::warn!(
                "event=task_progress_regressed task_id={} from={} to={}",
                self.task.task_id,
                self.progress,
                percent
            );
            return;
        }
        if percent == self.progress || self.is_terminal() {
            return;
        }
        self.progress = percent;
        self.task.progress = format_progress(percent);
        self.persist();
    }

    pub fn succeed(&mut self, output: &RunOutput, usage: Usage, quota: i64) {
        if !self.transition(TaskStatus::Success) {
            return;
        }
        if !output.execute_id.is_empty() {
            self.data.execute_id = output.execute_id.clone();
        }
        if !output.debug_url.is_empty() {
            self.data.debug_url = output.debug_url.clone();
        }
        self.data.output = output.output.clone();
        self.data.usage = usage;
        self.progress = 100;
        self.task.progress = format_progress(100);
        self.task.quota = quota;
        self.task.finish_time = now_ts();
        self.persist();
        log::info!(
            "event=task_finished task_id={} status={} quota={}",
            self.task.task_id,
            self.task.status.as_str(),
            quota
        );
    }

    pub fn fail(&mut self, reason: &str) {
        if !self.transition(TaskStatus::Failure) {
            return;
        }
        self.task.fail_reason = reason.to_string();
        self.task.finish_time = now_ts();
        if self.task.start_time == 0 {
            self.task.start_time = self.task.finish_time;
        }
        self.persist();
        log::info!(
            "event=task_finished task_id={} status={} reason={}",
            self.task.task_id,
            self.task.status.as_str(),
            reason
        );
    }

    fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.task.status.can_transition_to(next) {
            log::warn!(
                "event=task_transition_rejected task_id={} from={} to={}",
                self.task.task_id,
                self.task.status.as_str(),
                next.as_str()
            );
            return false;
        }
        self.task.status = next;
        true
    }

    fn persist(&mut self) {
        self.task.data = match serde_json::to_string(&self.data) {
            Ok(data) => data,
            Err(err) => {
                log::warn!(
                    "event=task_data_encode_failed task_id={} err={}",
                    self.task.task_id,
                    err
                );
                return;
            }
        };
        match self.store.update(&self.task) {
            Ok(true) => {}
            Ok(false) => log::warn!(
                "event=task_update_skipped task_id={} reason=already_terminal",
                self.task.task_id
            ),
            Err(err) => log::warn!(
                "event=task_update_failed task_id={} err={}",
                self.task.task_id,
                err
            ),
        }
    }
}
