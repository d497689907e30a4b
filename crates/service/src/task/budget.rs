use std::time::{Duration, Instant};

use crate::runtime_config::DEFAULT_TASK_MAX_WAIT_SECS;

const MIN_CALL_TIMEOUT: Duration = Duration::from_millis(1);

/// Wall-clock allowance of one background task. Created when the worker picks
/// the task up and shared by the poll and stream strategies.
#[derive(Debug, Clone, Copy)]
pub struct TaskBudget {
    max_wait: Duration,
    deadline: Instant,
}

impl TaskBudget {
    /// A zero allowance falls back to the default; a task is never unbounded.
    pub fn start(max_wait: Duration) -> Self {
        let max_wait = if max_wait.is_zero() {
            Duration::from_secs(DEFAULT_TASK_MAX_WAIT_SECS)
        } else {
            max_wait
        };
        Self {
            max_wait,
            deadline: Instant::now() + max_wait,
        }
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn left(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_spent(&self) -> bool {
        self.left().is_zero()
    }

    /// Timeout for one upstream call made on behalf of the task.
    pub fn call_timeout(&self, configured: Duration) -> Duration {
        configured.min(self.left()).max(MIN_CALL_TIMEOUT)
    }

    /// Sleeps for `wait`, cut short at the deadline. False once nothing is left.
    pub fn pause(&self, wait: Duration) -> bool {
        let left = self.left();
        if left.is_zero() {
            return false;
        }
        let wait = wait.min(left);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        true
    }

    /// Failure reason recorded when the allowance runs out.
    pub fn timeout_reason(&self) -> String {
        let secs = self.max_wait.as_secs();
        if secs >= 60 {
            format!("workflow execution timed out (over {} minutes)", secs / 60)
        } else {
            format!("workflow execution timed out (over {} seconds)", secs.max(1))
        }
    }
}
