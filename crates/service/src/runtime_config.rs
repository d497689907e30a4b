use relaygate_core::pricing::DEFAULT_QUOTA_PER_UNIT;
use relaygate_core::usage::OutputUnitCorrection;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::lock_utils::{read_recover, write_recover};

const DEFAULT_RETRY_TIMES: u32 = 3;
const DEFAULT_PRE_CONSUMED_QUOTA: i64 = 500;
const DEFAULT_CHANNEL_FAULT_DISABLE_THRESHOLD: u32 = 1;
const DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_UPSTREAM_STATUS_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_UPSTREAM_DISPATCH_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_UPSTREAM_UPLOAD_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_TASK_WORKERS: usize = 4;
const DEFAULT_TASK_POLL_INTERVAL_MS: u64 = 5_000;
pub(crate) const DEFAULT_TASK_MAX_WAIT_SECS: u64 = 30 * 60;
const DEFAULT_TOKEN_REFRESH_MARGIN_SECS: u64 = 5 * 60;

const ENV_RETRY_TIMES: &str = "RELAYGATE_RETRY_TIMES";
const ENV_QUOTA_PER_UNIT: &str = "RELAYGATE_QUOTA_PER_UNIT";
const ENV_PRE_CONSUMED_QUOTA: &str = "RELAYGATE_PRE_CONSUMED_QUOTA";
const ENV_CHANNEL_FAULT_DISABLE_THRESHOLD: &str = "RELAYGATE_CHANNEL_FAULT_DISABLE_THRESHOLD";
const ENV_AUTOMATIC_DISABLE_CHANNEL_ENABLED: &str = "RELAYGATE_AUTOMATIC_DISABLE_CHANNEL_ENABLED";
const ENV_ERROR_LOG_ENABLED: &str = "RELAYGATE_ERROR_LOG_ENABLED";
const ENV_UPSTREAM_CONNECT_TIMEOUT_SECS: &str = "RELAYGATE_UPSTREAM_CONNECT_TIMEOUT_SECS";
const ENV_UPSTREAM_STATUS_TIMEOUT_MS: &str = "RELAYGATE_UPSTREAM_STATUS_TIMEOUT_MS";
const ENV_UPSTREAM_DISPATCH_TIMEOUT_MS: &str = "RELAYGATE_UPSTREAM_DISPATCH_TIMEOUT_MS";
const ENV_UPSTREAM_UPLOAD_TIMEOUT_MS: &str = "RELAYGATE_UPSTREAM_UPLOAD_TIMEOUT_MS";
const ENV_TASK_WORKERS: &str = "RELAYGATE_TASK_WORKERS";
const ENV_TASK_POLL_INTERVAL_MS: &str = "RELAYGATE_TASK_POLL_INTERVAL_MS";
const ENV_TASK_MAX_WAIT_SECS: &str = "RELAYGATE_TASK_MAX_WAIT_SECS";
const ENV_TOKEN_REFRESH_MARGIN_SECS: &str = "RELAYGATE_TOKEN_REFRESH_MARGIN_SECS";
const ENV_USAGE_CORRECTION_ENABLED: &str = "RELAYGATE_USAGE_CORRECTION_ENABLED";
const ENV_AUTO_GROUPS: &str = "RELAYGATE_AUTO_GROUPS";
const ENV_MODEL_PRICE_JSON: &str = "RELAYGATE_MODEL_PRICE_JSON";
const ENV_MODEL_RATIO_JSON: &str = "RELAYGATE_MODEL_RATIO_JSON";
const ENV_GROUP_RATIO_JSON: &str = "RELAYGATE_GROUP_RATIO_JSON";
const ENV_COMPLETION_RATIO_JSON: &str = "RELAYGATE_COMPLETION_RATIO_JSON";

/// Immutable settings snapshot. Components read one `Arc<RelayConfig>` per
/// operation; changes are made by swapping the whole snapshot in `ConfigStore`.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub retry_times: u32,
    pub quota_per_unit: f64,
    pub pre_consumed_quota: i64,
    pub channel_fault_disable_threshold: u32,
    pub automatic_disable_channel: bool,
    pub error_log_enabled: bool,
    pub upstream_connect_timeout: Duration,
    pub status_timeout: Duration,
    pub dispatch_timeout: Duration,
    pub upload_timeout: Duration,
    pub task_workers: usize,
    pub task_poll_interval: Duration,
    pub task_max_wait: Duration,
    pub token_refresh_margin: Duration,
    pub usage_correction: OutputUnitCorrection,
    pub auto_groups: Vec<String>,
    pub model_prices: HashMap<String, f64>,
    pub model_ratios: HashMap<String, f64>,
    pub group_ratios: HashMap<String, f64>,
    pub completion_ratios: HashMap<String, f64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_times: DEFAULT_RETRY_TIMES,
            quota_per_unit: DEFAULT_QUOTA_PER_UNIT,
            pre_consumed_quota: DEFAULT_PRE_CONSUMED_QUOTA,
            channel_fault_disable_threshold: DEFAULT_CHANNEL_FAULT_DISABLE_THRESHOLD,
            automatic_disable_channel: true,
            error_log_enabled: true,
            upstream_connect_timeout: Duration::from_secs(DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS),
            status_timeout: Duration::from_millis(DEFAULT_UPSTREAM_STATUS_TIMEOUT_MS),
            dispatch_timeout: Duration::from_millis(DEFAULT_UPSTREAM_DISPATCH_TIMEOUT_MS),
            upload_timeout: Duration::from_millis(DEFAULT_UPSTREAM_UPLOAD_TIMEOUT_MS),
            task_workers: DEFAULT_TASK_WORKERS,
            task_poll_interval: Duration::from_millis(DEFAULT_TASK_POLL_INTERVAL_MS),
            task_max_wait: Duration::from_secs(DEFAULT_TASK_MAX_WAIT_SECS),
            token_refresh_margin: Duration::from_secs(DEFAULT_TOKEN_REFRESH_MARGIN_SECS),
            usage_correction: OutputUnitCorrection::default(),
            auto_groups: vec!["default".to_string()],
            model_prices: HashMap::new(),
            model_ratios: HashMap::new(),
            group_ratios: HashMap::new(),
            completion_ratios: HashMap::new(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = EnvSource { lookup: &lookup };
        let defaults = Self::default();
        let mut usage_correction = defaults.usage_correction.clone();
        usage_correction.enabled =
            source.bool_or(ENV_USAGE_CORRECTION_ENABLED, usage_correction.enabled);
        Self {
            retry_times: source.parse_or(ENV_RETRY_TIMES, defaults.retry_times),
            quota_per_unit: source
                .parse_or(ENV_QUOTA_PER_UNIT, defaults.quota_per_unit)
                .max(1.0),
            pre_consumed_quota: source
                .parse_or(ENV_PRE_CONSUMED_QUOTA, defaults.pre_consumed_quota)
                .max(0),
            channel_fault_disable_threshold: source
                .parse_or(
                    ENV_CHANNEL_FAULT_DISABLE_THRESHOLD,
                    defaults.channel_fault_disable_threshold,
                )
                .max(1),
            automatic_disable_channel: source.bool_or(
                ENV_AUTOMATIC_DISABLE_CHANNEL_ENABLED,
                defaults.automatic_disable_channel,
            ),
            error_log_enabled: source.bool_or(ENV_ERROR_LOG_ENABLED, defaults.error_log_enabled),
            upstream_connect_timeout: Duration::from_secs(source.parse_or(
                ENV_UPSTREAM_CONNECT_TIMEOUT_SECS,
                DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS,
            )),
            status_timeout: Duration::from_millis(
                source.parse_or(ENV_UPSTREAM_STATUS_TIMEOUT_MS, DEFAULT_UPSTREAM_STATUS_TIMEOUT_MS),
            ),
            dispatch_timeout: Duration::from_millis(source.parse_or(
                ENV_UPSTREAM_DISPATCH_TIMEOUT_MS,
                DEFAULT_UPSTREAM_DISPATCH_TIMEOUT_MS,
            )),
            upload_timeout: Duration::from_millis(
                source.parse_or(ENV_UPSTREAM_UPLOAD_TIMEOUT_MS, DEFAULT_UPSTREAM_UPLOAD_TIMEOUT_MS),
            ),
            task_workers: source.parse_or(ENV_TASK_WORKERS, defaults.task_workers).max(1),
            task_poll_interval: Duration::from_millis(
                source.parse_or(ENV_TASK_POLL_INTERVAL_MS, DEFAULT_TASK_POLL_INTERVAL_MS),
            ),
            task_max_wait: Duration::from_secs(
                source.parse_or(ENV_TASK_MAX_WAIT_SECS, DEFAULT_TASK_MAX_WAIT_SECS),
            ),
            token_refresh_margin: Duration::from_secs(
                source.parse_or(ENV_TOKEN_REFRESH_MARGIN_SECS, DEFAULT_TOKEN_REFRESH_MARGIN_SECS),
            ),
            usage_correction,
            auto_groups: source
                .non_empty(ENV_AUTO_GROUPS)
                .map(|raw| parse_group_list(&raw))
                .filter(|groups| !groups.is_empty())
                .unwrap_or(defaults.auto_groups),
            model_prices: source.ratio_map(ENV_MODEL_PRICE_JSON),
            model_ratios: source.ratio_map(ENV_MODEL_RATIO_JSON),
            group_ratios: source.ratio_map(ENV_GROUP_RATIO_JSON),
            completion_ratios: source.ratio_map(ENV_COMPLETION_RATIO_JSON),
        }
    }

    pub fn model_price(&self, model: &str) -> Option<f64> {
        self.model_prices
            .get(model)
            .copied()
            .filter(|price| *price > 0.0)
    }

    pub fn model_ratio(&self, model: &str) -> f64 {
        self.model_ratios.get(model).copied().unwrap_or(1.0)
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratios.get(group).copied().unwrap_or(1.0)
    }

    pub fn completion_ratio(&self, model: &str) -> f64 {
        self.completion_ratios.get(model).copied().unwrap_or(1.0)
    }
}

pub struct ConfigStore {
    current: RwLock<Arc<RelayConfig>>,
}

impl ConfigStore {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<RelayConfig> {
        read_recover(&self.current, "relay_config").clone()
    }

    pub fn replace(&self, config: RelayConfig) {
        *write_recover(&self.current, "relay_config") = Arc::new(config);
    }

    pub fn reload_from_env(&self) {
        self.replace(RelayConfig::from_env());
    }
}

struct EnvSource<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvSource<'_, F> {
    fn non_empty(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse_or<T: std::str::FromStr>(&self, name: &str, default: T) -> T {
        self.non_empty(name)
            .and_then(|value| value.parse::<T>().ok())
            .unwrap_or(default)
    }

    fn bool_or(&self, name: &str, default: bool) -> bool {
        match self.non_empty(name).map(|value| value.to_ascii_lowercase()) {
            Some(value) if matches!(value.as_str(), "1" | "true" | "yes" | "on") => true,
            Some(value) if matches!(value.as_str(), "0" | "false" | "no" | "off") => false,
            _ => default,
        }
    }

    fn ratio_map(&self, name: &str) -> HashMap<String, f64> {
        let Some(raw) = self.non_empty(name) else {
            return HashMap::new();
        };
        match serde_json::from_str::<HashMap<String, f64>>(&raw) {
            Ok(map) => map,
            Err(err) => {
                log::warn!("event=config_parse_failed key={} err={}", name, err);
                HashMap::new()
            }
        }
    }
}

fn parse_group_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|group| !group.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_TEST_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        key: &'static str,
        original: Option<std::ffi::OsString>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let original = std::env::var_os(key);
            std::env::set_var(key, value);
            Self { key, original }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.original {
                std::env::set_var(self.key, value);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn lookup_values_override_defaults_and_garbage_falls_back() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            (ENV_RETRY_TIMES, "5"),
            (ENV_QUOTA_PER_UNIT, "not-a-number"),
            (ENV_TASK_WORKERS, "0"),
            (ENV_ERROR_LOG_ENABLED, "off"),
            (ENV_AUTO_GROUPS, " vip , default ,"),
            (ENV_GROUP_RATIO_JSON, "{\"vip\": 0.5}"),
            (ENV_MODEL_PRICE_JSON, "{broken"),
        ]));
        assert_eq!(config.retry_times, 5);
        assert_eq!(config.quota_per_unit, DEFAULT_QUOTA_PER_UNIT);
        assert_eq!(config.task_workers, 1);
        assert!(!config.error_log_enabled);
        assert_eq!(config.auto_groups, vec!["vip".to_string(), "default".to_string()]);
        assert_eq!(config.group_ratio("vip"), 0.5);
        assert_eq!(config.group_ratio("default"), 1.0);
        assert!(config.model_prices.is_empty());
    }

    #[test]
    fn store_swaps_whole_snapshot() {
        let store = ConfigStore::new(RelayConfig::default());
        let before = store.snapshot();
        store.replace(RelayConfig {
            retry_times: 9,
            ..RelayConfig::default()
        });
        let after = store.snapshot();
        assert_eq!(before.retry_times, DEFAULT_RETRY_TIMES);
        assert_eq!(after.retry_times, 9);
    }

    #[test]
    fn reload_from_env_reads_process_environment() {
        let _lock = ENV_TEST_LOCK.lock().expect("env lock");
        let _retry = EnvGuard::set(ENV_RETRY_TIMES, "7");
        let _interval = EnvGuard::set(ENV_TASK_POLL_INTERVAL_MS, "250");
        let store = ConfigStore::new(RelayConfig::default());
        store.reload_from_env();
        let config = store.snapshot();
        assert_eq!(config.retry_times, 7);
        assert_eq!(config.task_poll_interval, Duration::from_millis(250));
    }
}
