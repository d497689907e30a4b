use serde::Serialize;

use crate::usage::Usage;

pub const DEFAULT_QUOTA_PER_UNIT: f64 = 500_000.0;
/// Currency price of one provider credit.
pub const CREDIT_PRICE: f64 = 0.03125;

/// Pricing snapshot computed once per request and reused for the
/// reservation estimate and the final settlement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceData {
    pub model_ratio: f64,
    /// Flat per-call price in currency units; `None` means usage pricing.
    pub model_price: Option<f64>,
    pub group_ratio: f64,
    pub channel_ratio: f64,
    pub completion_ratio: f64,
    pub quota_per_unit: f64,
}

impl Default for PriceData {
    fn default() -> Self {
        Self {
            model_ratio: 1.0,
            model_price: None,
            group_ratio: 1.0,
            channel_ratio: 1.0,
            completion_ratio: 1.0,
            quota_per_unit: DEFAULT_QUOTA_PER_UNIT,
        }
    }
}

/// Rounds a raw cost to whole quota units. Any positive cost is at least one
/// unit; a zero ratio (free model) charges nothing.
fn to_billable_quota(raw: f64) -> i64 {
    if !raw.is_finite() || raw <= 0.0 {
        return 0;
    }
    (raw.round() as i64).max(1)
}

impl PriceData {
    pub fn is_flat(&self) -> bool {
        self.model_price.is_some_and(|price| price > 0.0)
    }

    pub fn flat_quota(&self) -> Option<i64> {
        let price = self.model_price.filter(|price| *price > 0.0)?;
        let raw = price * self.quota_per_unit * self.group_ratio * self.channel_ratio;
        Some(to_billable_quota(raw))
    }

    /// Usage-priced cost; completion units are weighted by the completion ratio.
    pub fn usage_quota(&self, usage: &Usage) -> i64 {
        let prompt = usage.prompt_tokens.max(0) as f64;
        let completion = usage.completion_tokens.max(0) as f64;
        let mut units = prompt + completion * self.completion_ratio;
        if prompt + completion <= 0.0 {
            units = usage.total_tokens.max(0) as f64;
        }
        let raw = units * self.model_ratio * self.group_ratio * self.channel_ratio;
        to_billable_quota(raw)
    }

    /// Actual cost of a finished operation.
    pub fn quota_for(&self, usage: &Usage) -> i64 {
        self.flat_quota().unwrap_or_else(|| self.usage_quota(usage))
    }

    /// Estimate held before dispatch; usage-priced calls reserve `estimated_units` worth.
    pub fn estimate(&self, estimated_units: i64) -> i64 {
        if let Some(flat) = self.flat_quota() {
            return flat;
        }
        let units = estimated_units.max(0) as f64;
        let raw = units * self.model_ratio * self.group_ratio * self.channel_ratio;
        to_billable_quota(raw)
    }

    pub fn credit_quota(&self, credits: f64) -> i64 {
        if !credits.is_finite() || credits <= 0.0 {
            return 0;
        }
        let raw =
            credits * CREDIT_PRICE * self.group_ratio * self.channel_ratio * self.quota_per_unit;
        to_billable_quota(raw)
    }
}
