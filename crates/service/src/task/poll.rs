use rand::Rng;
use std::time::Duration;

use super::budget::TaskBudget;
use super::tracker::TaskTracker;
use super::{PollState, RunHandle, RunResult, TaskBackend};
use crate::runtime_config::RelayConfig;

pub const POLL_START_PROGRESS: u32 = 20;
pub const POLL_PROGRESS_STEP: u32 = 5;
pub const POLL_PROGRESS_CAP: u32 = 90;
const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 5;
/// Retry delays after failed status queries never exceed this many intervals.
const POLL_RETRY_CAP_INTERVALS: u32 = 4;

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub call_timeout: Duration,
}

impl PollSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            interval: config.task_poll_interval,
            call_timeout: config.status_timeout,
        }
    }

    /// Extra wait after `failures` consecutive failed status queries: the poll
    /// interval doubled per failure up to the cap, drawn with full jitter.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let cap = self.interval.saturating_mul(POLL_RETRY_CAP_INTERVALS);
        let ceiling = self.interval.saturating_mul(1 << failures.min(4)).min(cap);
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }
}

/// Polls the upstream status endpoint until a terminal status or the task's
/// budget runs out.
pub fn drive_poll(
    backend: &dyn TaskBackend,
    run: &RunHandle,
    tracker: &mut TaskTracker,
    settings: &PollSettings,
    budget: &TaskBudget,
) -> RunResult {
    let mut next_progress = POLL_START_PROGRESS;
    let mut consecutive_failures = 0_u32;
    let mut polls = 0_u32;

    loop {
        if !budget.pause(settings.interval) || budget.is_spent() {
            return RunResult::Failed(budget.timeout_reason());
        }

        polls += 1;
        match backend.poll_run(run, budget.call_timeout(settings.call_timeout)) {
            Ok(PollState::Running) => {
                consecutive_failures = 0;
                tracker.advance(next_progress);
                next_progress = (next_progress + POLL_PROGRESS_STEP).min(POLL_PROGRESS_CAP);
                log::debug!(
                    "event=task_poll_running task_id={} execute_id={} polls={}",
                    tracker.task().task_id,
                    run.execute_id,
                    polls
                );
            }
            Ok(PollState::Succeeded(mut output)) => {
                if output.execute_id.is_empty() {
                    output.execute_id = run.execute_id.clone();
                }
                if output.debug_url.is_empty() {
                    output.debug_url = run.debug_url.clone();
                }
                return RunResult::Succeeded(output);
            }
            Ok(PollState::Failed(reason)) => return RunResult::Failed(reason),
            Err(err) => {
                consecutive_failures += 1;
                log::warn!(
                    "event=task_poll_failed task_id={} execute_id={} failures={} err={}",
                    tracker.task().task_id,
                    run.execute_id,
                    consecutive_failures,
                    err
                );
                if consecutive_failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                    return RunResult::Failed(format!("query workflow status failed: {err}"));
                }
                if !budget.pause(settings.retry_delay(consecutive_failures)) {
                    return RunResult::Failed(budget.timeout_reason());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_with_failures_but_stays_capped() {
        let settings = PollSettings {
            interval: Duration::from_millis(100),
            call_timeout: Duration::from_secs(1),
        };
        for _ in 0..32 {
            assert!(settings.retry_delay(1) <= Duration::from_millis(200));
            assert!(settings.retry_delay(9) <= Duration::from_millis(400));
        }
        let immediate = PollSettings {
            interval: Duration::ZERO,
            ..settings
        };
        assert_eq!(immediate.retry_delay(3), Duration::ZERO);
    }
}
