use relaygate_core::pricing::PriceData;
use relaygate_core::storage::Task;
use relaygate_core::usage::{OutputUnitCorrection, Usage};
use serde_json::json;

use super::RunOutput;
use crate::collaborators::{QuotaLedger, TaskStore};
use crate::relay::reconciler::{record_consumption, ConsumptionEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub quota: i64,
    pub usage: Usage,
    /// False when another wake-up already settled this task.
    pub charged: bool,
}

/// Normalized usage with the configured output-unit correction applied.
pub fn final_usage(task_id: &str, output: &RunOutput, correction: &OutputUnitCorrection) -> Usage {
    let usage = output.usage.normalized();
    match correction.apply(usage, &output.output) {
        Some(corrected) => {
            log::info!(
                "event=usage_corrected task_id={} units={} text_tokens={} completion_before={} completion_after={}",
                task_id,
                corrected.units,
                corrected.text_tokens,
                usage.completion_tokens,
                corrected.usage.completion_tokens
            );
            corrected.usage
        }
        None => usage,
    }
}

/// Per-call price first, then provider credits, then token usage.
pub fn quota_for_run(price: &PriceData, usage: &Usage, credits: Option<f64>) -> i64 {
    if let Some(quota) = price.flat_quota() {
        return quota;
    }
    if let Some(credits) = credits.filter(|credits| *credits > 0.0) {
        return price.credit_quota(credits);
    }
    price.usage_quota(usage)
}

/// Charges a successful task exactly once, guarded by the task's settlement flag.
/// A ledger refusal returns the hold to the user and reports an error.
pub fn settle_success(
    store: &dyn TaskStore,
    ledger: &dyn QuotaLedger,
    correction: &OutputUnitCorrection,
    task: &Task,
    price: &PriceData,
    output: &RunOutput,
) -> Result<Settlement, String> {
    let usage = final_usage(&task.task_id, output, correction);
    let quota = quota_for_run(price, &usage, output.credits);
    if !store.claim_settlement(task.id)? {
        log::warn!(
            "event=task_settlement_duplicate task_id={} quota={}",
            task.task_id,
            quota
        );
        return Ok(Settlement {
            quota,
            usage,
            charged: false,
        });
    }
    if let Err(err) = ledger.settle(task.user_id, task.reserved_quota, quota) {
        log::warn!(
            "event=task_settle_failed task_id={} user_id={} reserved={} actual={} err={}",
            task.task_id,
            task.user_id,
            task.reserved_quota,
            quota,
            err
        );
        // The flag is already claimed, so nobody else will return the hold.
        if task.reserved_quota > 0 {
            ledger.release(task.user_id, task.reserved_quota).map_err(|release_err| {
                format!("settle quota failed: {err}; release failed: {release_err}")
            })?;
        }
        return Err(format!("settle quota failed: {err}"));
    }
    record_consumption(
        ledger,
        ConsumptionEntry {
            user_id: task.user_id,
            channel_id: task.channel_id,
            model: &task.model,
            group: &task.group_name,
            quota,
            usage,
            price,
            content: format!("async task {}", task.task_id),
            extra: Some(json!({
                "async": true,
                "task_id": task.task_id,
                "execute_id": output.execute_id,
                "credits": output.credits,
            })),
        },
    );
    Ok(Settlement {
        quota,
        usage,
        charged: true,
    })
}

/// Returns the task's reservation to the user. Shares the settlement flag with
/// `settle_success`, so a task is either charged or refunded, never both.
pub fn release_reservation(
    store: &dyn TaskStore,
    ledger: &dyn QuotaLedger,
    task: &Task,
) -> Result<bool, String> {
    if !store.claim_settlement(task.id)? {
        return Ok(false);
    }
    if task.reserved_quota > 0 {
        ledger.release(task.user_id, task.reserved_quota)?;
        log::info!(
            "event=task_reservation_released task_id={} user_id={} amount={}",
            task.task_id,
            task.user_id,
            task.reserved_quota
        );
    }
    Ok(true)
}
