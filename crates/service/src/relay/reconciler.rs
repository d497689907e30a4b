use relaygate_core::pricing::PriceData;
use relaygate_core::storage::{now_ts, ConsumeLog};
use relaygate_core::usage::Usage;
use serde_json::Value;
use std::sync::Arc;

use crate::collaborators::QuotaLedger;
use crate::errors::RelayError;
use crate::relay::pricing::pricing_breakdown;

/// Quota held for one operation. Exactly one of `commit`, `release` or
/// `hand_off` consumes it; dropping it unfinished releases the hold.
pub struct QuotaReservation {
    ledger: Arc<dyn QuotaLedger>,
    user_id: i64,
    amount: i64,
    finished: bool,
}

impl QuotaReservation {
    pub fn reserve(
        ledger: Arc<dyn QuotaLedger>,
        user_id: i64,
        amount: i64,
    ) -> Result<Self, RelayError> {
        let amount = amount.max(0);
        if amount > 0 {
            let reserved = ledger
                .reserve(user_id, amount)
                .map_err(|err| RelayError::local("quota_reserve_failed", err))?;
            if !reserved {
                return Err(RelayError::insufficient_quota(amount));
            }
        }
        Ok(Self {
            ledger,
            user_id,
            amount,
            finished: false,
        })
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    /// Converts the hold into the final charge; returns the balance delta applied
    /// on top of the hold (positive = refund). When the ledger refuses the
    /// settlement the hold is released and the caller is charged nothing.
    pub fn commit(mut self, actual: i64) -> Result<i64, String> {
        let actual = actual.max(0);
        self.ledger.settle(self.user_id, self.amount, actual)?;
        self.finished = true;
        Ok(self.amount - actual)
    }

    pub fn release(mut self) {
        self.finished = true;
        self.release_inner();
    }

    /// Transfers the hold to a background task, which settles or releases it later.
    pub fn hand_off(mut self) -> i64 {
        self.finished = true;
        self.amount
    }

    fn release_inner(&self) {
        if self.amount <= 0 {
            return;
        }
        if let Err(err) = self.ledger.release(self.user_id, self.amount) {
            log::warn!(
                "event=quota_release_failed user_id={} amount={} err={}",
                self.user_id,
                self.amount,
                err
            );
        }
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.release_inner();
        }
    }
}

pub struct ConsumptionEntry<'a> {
    pub user_id: i64,
    pub channel_id: i64,
    pub model: &'a str,
    pub group: &'a str,
    pub quota: i64,
    pub usage: Usage,
    pub price: &'a PriceData,
    pub content: String,
    /// Extra fields merged into the pricing breakdown (async flag, task id).
    pub extra: Option<Value>,
}

/// Writes the consumption log and bumps usage counters. Ledger write failures
/// are logged; the charge itself has already been applied.
pub fn record_consumption(ledger: &dyn QuotaLedger, entry: ConsumptionEntry<'_>) {
    let mut other = pricing_breakdown(entry.price);
    if let (Some(Value::Object(extra)), Value::Object(map)) = (entry.extra, &mut other) {
        map.extend(extra);
    }
    let log = ConsumeLog {
        user_id: entry.user_id,
        channel_id: entry.channel_id,
        model: entry.model.to_string(),
        group_name: entry.group.to_string(),
        quota: entry.quota,
        prompt_tokens: entry.usage.prompt_tokens,
        completion_tokens: entry.usage.completion_tokens,
        content: entry.content,
        other: other.to_string(),
        created_at: now_ts(),
    };
    if let Err(err) = ledger.record_consumption(&log) {
        log::warn!(
            "event=consume_log_failed user_id={} channel_id={} err={}",
            entry.user_id,
            entry.channel_id,
            err
        );
    }
    if entry.quota > 0 {
        if let Err(err) = ledger.update_usage_counters(entry.user_id, entry.channel_id, entry.quota)
        {
            log::warn!(
                "event=usage_counter_failed user_id={} channel_id={} err={}",
                entry.user_id,
                entry.channel_id,
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygate_core::storage::ErrorLog;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLedger {
        balance: Mutex<i64>,
        calls: Mutex<Vec<String>>,
        reject_settle: bool,
    }

    impl RecordingLedger {
        fn with_balance(balance: i64) -> Arc<Self> {
            Arc::new(Self {
                balance: Mutex::new(balance),
                calls: Mutex::new(Vec::new()),
                reject_settle: false,
            })
        }

        fn rejecting_settle(balance: i64) -> Arc<Self> {
            Arc::new(Self {
                balance: Mutex::new(balance),
                calls: Mutex::new(Vec::new()),
                reject_settle: true,
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls").clone()
        }

        fn balance(&self) -> i64 {
            *self.balance.lock().expect("balance")
        }
    }

    impl QuotaLedger for RecordingLedger {
        fn reserve(&self, _user_id: i64, amount: i64) -> Result<bool, String> {
            let mut balance = self.balance.lock().expect("balance");
            if *balance < amount {
                return Ok(false);
            }
            *balance -= amount;
            self.calls.lock().expect("calls").push(format!("reserve:{amount}"));
            Ok(true)
        }

        fn settle(&self, _user_id: i64, reserved: i64, actual: i64) -> Result<(), String> {
            if self.reject_settle {
                return Err("database is locked".to_string());
            }
            *self.balance.lock().expect("balance") += reserved - actual;
            self.calls
                .lock()
                .expect("calls")
                .push(format!("settle:{reserved}:{actual}"));
            Ok(())
        }

        fn release(&self, _user_id: i64, reserved: i64) -> Result<(), String> {
            *self.balance.lock().expect("balance") += reserved;
            self.calls.lock().expect("calls").push(format!("release:{reserved}"));
            Ok(())
        }

        fn record_consumption(&self, entry: &ConsumeLog) -> Result<(), String> {
            self.calls
                .lock()
                .expect("calls")
                .push(format!("log:{}", entry.quota));
            Ok(())
        }

        fn update_usage_counters(&self, _: i64, _: i64, amount: i64) -> Result<(), String> {
            self.calls.lock().expect("calls").push(format!("used:{amount}"));
            Ok(())
        }

        fn record_error(&self, _entry: &ErrorLog) -> Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn commit_refunds_or_debits_the_difference() {
        let ledger = RecordingLedger::with_balance(1000);
        let hold = QuotaReservation::reserve(ledger.clone(), 1, 500).expect("reserve");
        assert_eq!(hold.commit(430).expect("commit"), 70);
        assert_eq!(ledger.balance(), 570);

        let hold = QuotaReservation::reserve(ledger.clone(), 1, 500).expect("reserve");
        assert_eq!(hold.commit(560).expect("commit"), -60);
        assert_eq!(ledger.balance(), 10);
        assert_eq!(
            ledger.calls(),
            vec!["reserve:500", "settle:500:430", "reserve:500", "settle:500:560"]
        );
    }

    #[test]
    fn failed_commit_returns_the_hold() {
        let ledger = RecordingLedger::rejecting_settle(1000);
        let hold = QuotaReservation::reserve(ledger.clone(), 1, 500).expect("reserve");
        assert_eq!(ledger.balance(), 500);
        let err = hold.commit(430).expect_err("settle rejected");
        assert!(err.contains("locked"));
        assert_eq!(ledger.balance(), 1000);
        assert_eq!(ledger.calls(), vec!["reserve:500", "release:500"]);
    }

    #[test]
    fn drop_releases_exactly_once() {
        let ledger = RecordingLedger::with_balance(1000);
        {
            let _hold = QuotaReservation::reserve(ledger.clone(), 1, 300).expect("reserve");
        }
        let hold = QuotaReservation::reserve(ledger.clone(), 1, 200).expect("reserve");
        hold.release();
        assert_eq!(ledger.balance(), 1000);
        assert_eq!(
            ledger.calls(),
            vec!["reserve:300", "release:300", "reserve:200", "release:200"]
        );
    }

    #[test]
    fn zero_hold_and_hand_off_never_touch_ledger_on_drop() {
        let ledger = RecordingLedger::with_balance(100);
        QuotaReservation::reserve(ledger.clone(), 1, 0)
            .expect("reserve zero")
            .release();
        let hold = QuotaReservation::reserve(ledger.clone(), 1, 60).expect("reserve");
        assert_eq!(hold.hand_off(), 60);
        assert_eq!(ledger.calls(), vec!["reserve:60"]);
        assert_eq!(ledger.balance(), 40);
    }

    #[test]
    fn insufficient_balance_is_a_terminal_ledger_error() {
        let ledger = RecordingLedger::with_balance(10);
        let err = QuotaReservation::reserve(ledger.clone(), 1, 500)
            .err()
            .expect("insufficient");
        assert_eq!(err.code, "insufficient_user_quota");
        assert!(err.skip_retry);
        assert!(ledger.calls().is_empty());
    }

    #[test]
    fn consumption_record_carries_pricing_breakdown() {
        let ledger = RecordingLedger::with_balance(0);
        let price = PriceData::default();
        record_consumption(
            ledger.as_ref(),
            ConsumptionEntry {
                user_id: 1,
                channel_id: 2,
                model: "m1",
                group: "default",
                quota: 42,
                usage: Usage::new(10, 32, 42),
                price: &price,
                content: String::new(),
                extra: Some(serde_json::json!({"task_id": "task_x"})),
            },
        );
        assert_eq!(ledger.calls(), vec!["log:42", "used:42"]);
    }
}
