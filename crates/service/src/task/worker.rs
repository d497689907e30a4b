use relaygate_core::pricing::PriceData;
use relaygate_core::storage::Task;
use std::any::Any;
use std::sync::Arc;

use super::budget::TaskBudget;
use super::poll::{drive_poll, PollSettings};
use super::settle::{release_reservation, settle_success};
use super::stream::drive_stream;
use super::tracker::TaskTracker;
use super::{AsyncStart, RunResult, TaskBackend};
use crate::collaborators::{QuotaLedger, TaskStore};
use crate::runtime_config::RelayConfig;

pub const STRATEGY_ASYNC_POLL: &str = "async_poll";
pub const STRATEGY_STREAM: &str = "stream";
const ASYNC_STARTED_PROGRESS: u32 = 10;

#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn TaskStore>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub config: Arc<RelayConfig>,
}

pub struct TaskJob {
    pub task: Task,
    pub backend: Box<dyn TaskBackend>,
    pub price: PriceData,
}

/// Drives one task to a terminal status. Never panics outward: a panic inside
/// either strategy becomes a Failure.
pub fn run_task(ctx: &WorkerContext, job: TaskJob) {
    let TaskJob {
        task,
        backend,
        price,
    } = job;
    let mut tracker = TaskTracker::new(ctx.store.clone(), task);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        execute(ctx, backend.as_ref(), &mut tracker)
    }))
    .unwrap_or_else(|panic| {
        let message = panic_message(panic.as_ref());
        log::warn!(
            "event=task_worker_panicked task_id={} err={}",
            tracker.task().task_id,
            message
        );
        RunResult::Failed(format!("task worker crashed: {message}"))
    });
    finish(ctx, &mut tracker, &price, result);
}

/// Fails a task that never reached a worker and returns its reservation.
pub fn abandon_task(ctx: &WorkerContext, task: Task, reason: &str) {
    let mut tracker = TaskTracker::new(ctx.store.clone(), task);
    finish(
        ctx,
        &mut tracker,
        &PriceData::default(),
        RunResult::Failed(reason.to_string()),
    );
}

fn execute(ctx: &WorkerContext, backend: &dyn TaskBackend, tracker: &mut TaskTracker) -> RunResult {
    tracker.begin();
    let budget = TaskBudget::start(ctx.config.task_max_wait);
    match backend.start_async_run() {
        AsyncStart::Started(run) => {
            tracker.record_run(&run, STRATEGY_ASYNC_POLL);
            tracker.advance(ASYNC_STARTED_PROGRESS);
            drive_poll(
                backend,
                &run,
                tracker,
                &PollSettings::from_config(&ctx.config),
                &budget,
            )
        }
        AsyncStart::Rejected(reason) => RunResult::Failed(reason),
        AsyncStart::Unavailable(reason) => {
            log::warn!(
                "event=task_async_unavailable task_id={} fallback=stream reason={}",
                tracker.task().task_id,
                reason
            );
            tracker.set_strategy(STRATEGY_STREAM);
            drive_stream(backend, tracker, &budget)
        }
    }
}

fn finish(ctx: &WorkerContext, tracker: &mut TaskTracker, price: &PriceData, result: RunResult) {
    match result {
        RunResult::Succeeded(output) => {
            let settled = settle_success(
                ctx.store.as_ref(),
                ctx.ledger.as_ref(),
                &ctx.config.usage_correction,
                tracker.task(),
                price,
                &output,
            );
            match settled {
                Ok(settlement) => tracker.succeed(&output, settlement.usage, settlement.quota),
                Err(err) => {
                    log::warn!(
                        "event=task_settlement_failed task_id={} err={}",
                        tracker.task().task_id,
                        err
                    );
                    release_hold(ctx, tracker);
                    tracker.fail(&format!("settlement failed: {err}"));
                }
            }
        }
        RunResult::Failed(reason) => {
            release_hold(ctx, tracker);
            tracker.fail(&reason);
        }
    }
}

/// Returns the task's hold unless some earlier step already settled it.
fn release_hold(ctx: &WorkerContext, tracker: &TaskTracker) {
    if let Err(err) = release_reservation(ctx.store.as_ref(), ctx.ledger.as_ref(), tracker.task()) {
        log::warn!(
            "event=task_release_failed task_id={} err={}",
            tracker.task().task_id,
            err
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
