use relaygate_core::storage::Task;
use relaygate_core::task::{format_progress, TaskStatus};
use relaygate_core::usage::Usage;
use serde::Serialize;

use super::tracker::TaskData;

/// Caller-facing view of a task. Safe to build at any point of the lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: String,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub usage: Usage,
    pub submit_time: i64,
    pub start_time: i64,
    pub finish_time: i64,
    pub execute_id: String,
    pub debug_url: String,
    pub quota: i64,
}

pub fn project(task: &Task) -> TaskView {
    let data = TaskData::parse(&task.data);
    let not_started = task.status == TaskStatus::Submitted;
    TaskView {
        task_id: task.task_id.clone(),
        status: task.status,
        progress: if not_started {
            format_progress(0)
        } else {
            task.progress.clone()
        },
        output: if not_started { String::new() } else { data.output },
        error: (task.status == TaskStatus::Failure).then(|| task.fail_reason.clone()),
        usage: data.usage,
        submit_time: task.submit_time,
        start_time: task.start_time,
        finish_time: task.finish_time,
        execute_id: data.execute_id,
        debug_url: data.debug_url,
        quota: task.quota,
    }
}
