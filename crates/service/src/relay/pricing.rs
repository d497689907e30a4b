use relaygate_core::pricing::PriceData;
use relaygate_core::storage::{Ability, Channel};
use serde_json::{json, Value};

use crate::runtime_config::RelayConfig;

/// Builds the request's pricing snapshot.
///
/// Per-call price precedence: configured model price, then the ability's
/// per-call quota (converted into price units), else usage pricing.
pub fn price_for(
    config: &RelayConfig,
    model: &str,
    group: &str,
    channel: &Channel,
    ability: Option<&Ability>,
) -> PriceData {
    let quota_per_unit = config.quota_per_unit;
    let ability_price = ability
        .and_then(|ability| ability.workflow_price)
        .filter(|quota| *quota > 0.0)
        .map(|quota| quota / quota_per_unit);
    let channel_ratio = if channel.channel_ratio > 0.0 {
        channel.channel_ratio
    } else {
        1.0
    };
    PriceData {
        model_ratio: config.model_ratio(model),
        model_price: config.model_price(model).or(ability_price),
        group_ratio: config.group_ratio(group),
        channel_ratio,
        completion_ratio: config.completion_ratio(model),
        quota_per_unit,
    }
}

/// Quota held before dispatch.
pub fn estimate_quota(config: &RelayConfig, price: &PriceData) -> i64 {
    price.estimate(config.pre_consumed_quota)
}

/// Pricing breakdown stored with every consumption record.
pub fn pricing_breakdown(price: &PriceData) -> Value {
    json!({
        "model_ratio": price.model_ratio,
        "model_price": price.model_price,
        "group_ratio": price.group_ratio,
        "channel_ratio": price.channel_ratio,
        "completion_ratio": price.completion_ratio,
        "per_call": price.is_flat(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygate_core::storage::CHANNEL_STATUS_ENABLED;
    use std::collections::HashMap;

    fn channel(ratio: f64) -> Channel {
        Channel {
            id: 1,
            name: "c1".to_string(),
            provider_type: 49,
            base_url: String::new(),
            keys: "pat".to_string(),
            multi_key_mode: "polling".to_string(),
            disabled_key_indexes: Vec::new(),
            status: CHANNEL_STATUS_ENABLED,
            auto_ban: true,
            channel_ratio: ratio,
            used_quota: 0,
            settings: "{}".to_string(),
            created_at: 0,
        }
    }

    fn ability(workflow_price: Option<f64>) -> Ability {
        Ability {
            group_name: "default".to_string(),
            model: "wf-1".to_string(),
            channel_id: 1,
            enabled: true,
            priority: 0,
            weight: 0,
            workflow_price,
        }
    }

    #[test]
    fn model_price_beats_ability_price() {
        let config = RelayConfig {
            model_prices: HashMap::from([("wf-1".to_string(), 0.01)]),
            group_ratios: HashMap::from([("vip".to_string(), 2.0)]),
            ..RelayConfig::default()
        };
        let price = price_for(&config, "wf-1", "vip", &channel(1.5), Some(&ability(Some(800.0))));
        assert_eq!(price.flat_quota(), Some(15_000));
        assert_eq!(estimate_quota(&config, &price), 15_000);
    }

    #[test]
    fn ability_price_is_per_call_quota() {
        let config = RelayConfig::default();
        let price = price_for(&config, "wf-1", "default", &channel(1.0), Some(&ability(Some(800.0))));
        assert_eq!(price.flat_quota(), Some(800));
    }

    #[test]
    fn usage_priced_estimate_uses_pre_consumed_quota() {
        let config = RelayConfig {
            pre_consumed_quota: 500,
            model_ratios: HashMap::from([("m1".to_string(), 2.0)]),
            ..RelayConfig::default()
        };
        let price = price_for(&config, "m1", "default", &channel(0.0), None);
        assert!(!price.is_flat());
        assert_eq!(price.channel_ratio, 1.0);
        assert_eq!(estimate_quota(&config, &price), 1000);
    }
}
