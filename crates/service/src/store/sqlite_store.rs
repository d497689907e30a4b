use relaygate_core::storage::{
    Ability, Channel, ConsumeLog, ErrorLog, Storage, Task, CHANNEL_STATUS_MANUALLY_DISABLED,
};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::collaborators::{
    ChannelCandidate, ChannelFaultReport, ChannelRegistry, QuotaLedger, TaskStore,
};
use crate::lock_utils::lock_recover;
use crate::relay::cooldown::CooldownTable;
use crate::relay::credentials::CredentialRotator;
use crate::relay::health::{HealthAction, HealthPolicy};
use crate::runtime_config::ConfigStore;

/// SQLite-backed channel registry, quota ledger and task store sharing one connection.
pub struct SqliteStore {
    storage: Mutex<Storage>,
    config: Arc<ConfigStore>,
    credentials: CredentialRotator,
    cooldown: CooldownTable,
    health: HealthPolicy,
}

impl SqliteStore {
    pub fn new(storage: Storage, config: Arc<ConfigStore>) -> Result<Self, String> {
        storage.init().map_err(|e| e.to_string())?;
        Ok(Self {
            storage: Mutex::new(storage),
            config,
            credentials: CredentialRotator::new(),
            cooldown: CooldownTable::new(),
            health: HealthPolicy::new(),
        })
    }

    pub fn open(path: impl AsRef<Path>, config: Arc<ConfigStore>) -> Result<Self, String> {
        let storage = Storage::open(path).map_err(|e| e.to_string())?;
        Self::new(storage, config)
    }

    pub fn open_in_memory(config: Arc<ConfigStore>) -> Result<Self, String> {
        let storage = Storage::open_in_memory().map_err(|e| e.to_string())?;
        Self::new(storage, config)
    }

    /// Direct access for administration and tests.
    pub fn storage(&self) -> MutexGuard<'_, Storage> {
        lock_recover(&self.storage, "sqlite_store")
    }

    /// Counts the fault, starts a cooldown and disables the channel or key once
    /// the health threshold is crossed.
    pub fn apply_fault(&self, report: &ChannelFaultReport) -> Result<HealthAction, String> {
        self.cooldown
            .mark_for_status(report.channel_id, report.status_code);
        let config = self.config.snapshot();
        let storage = self.storage();
        let action = self.health.handle_fault(&storage, report, &config)?;
        if matches!(
            action,
            HealthAction::ChannelDisabled | HealthAction::KeyDisabled { .. }
        ) {
            self.credentials.forget(report.channel_id);
        }
        Ok(action)
    }
}

impl ChannelRegistry for SqliteStore {
    fn list_candidates(&self, group: &str, model: &str) -> Result<Vec<ChannelCandidate>, String> {
        let storage = self.storage();
        let abilities = storage
            .list_enabled_abilities(group, model)
            .map_err(|e| e.to_string())?;
        let mut out = Vec::with_capacity(abilities.len());
        for ability in abilities {
            let Some(channel) = storage
                .find_channel(ability.channel_id)
                .map_err(|e| e.to_string())?
            else {
                continue;
            };
            if channel.is_enabled() {
                out.push(ChannelCandidate { channel, ability });
            }
        }
        Ok(out)
    }

    fn get_channel(&self, channel_id: i64) -> Result<Option<Channel>, String> {
        self.storage()
            .find_channel(channel_id)
            .map_err(|e| e.to_string())
    }

    fn find_ability(
        &self,
        group: &str,
        model: &str,
        channel_id: i64,
    ) -> Result<Option<Ability>, String> {
        self.storage()
            .find_ability(group, model, channel_id)
            .map_err(|e| e.to_string())
    }

    fn next_credential(&self, channel: &Channel) -> Option<(String, usize)> {
        self.credentials.next_credential(channel)
    }

    fn is_cooling_down(&self, channel_id: i64) -> bool {
        self.cooldown.is_cooling_down(channel_id)
    }

    fn mark_cooling_down(&self, channel_id: i64, status_code: u16) {
        self.cooldown.mark_for_status(channel_id, status_code);
    }

    fn report_fault(&self, report: &ChannelFaultReport) {
        match self.apply_fault(report) {
            Ok(HealthAction::Counted(count)) => log::debug!(
                "event=channel_fault_counted channel_id={} faults={}",
                report.channel_id,
                count
            ),
            Ok(_) => {}
            Err(err) => log::warn!(
                "event=channel_fault_report_failed channel_id={} err={}",
                report.channel_id,
                err
            ),
        }
    }

    fn report_success(&self, channel_id: i64) {
        self.cooldown.clear(channel_id);
        self.health.clear(channel_id);
    }

    fn disable_channel(&self, channel_id: i64, reason: &str) -> Result<bool, String> {
        let changed = self
            .storage()
            .disable_channel_if_enabled(channel_id, CHANNEL_STATUS_MANUALLY_DISABLED)
            .map_err(|e| e.to_string())?;
        if changed {
            self.credentials.forget(channel_id);
            log::info!(
                "event=channel_disabled channel_id={} reason={}",
                channel_id,
                reason
            );
        }
        Ok(changed)
    }

    fn enable_channel(&self, channel_id: i64) -> Result<bool, String> {
        let changed = self
            .storage()
            .enable_auto_disabled_channel(channel_id)
            .map_err(|e| e.to_string())?;
        if changed {
            self.cooldown.clear(channel_id);
            self.health.clear(channel_id);
            log::info!("event=channel_reenabled channel_id={}", channel_id);
        }
        Ok(changed)
    }
}

impl QuotaLedger for SqliteStore {
    fn reserve(&self, user_id: i64, amount: i64) -> Result<bool, String> {
        if amount <= 0 {
            return Ok(true);
        }
        self.storage()
            .reserve_user_quota(user_id, amount)
            .map_err(|e| e.to_string())
    }

    fn settle(&self, user_id: i64, reserved: i64, actual: i64) -> Result<(), String> {
        let delta = reserved - actual;
        if delta == 0 {
            return Ok(());
        }
        self.storage()
            .adjust_user_quota(user_id, delta)
            .map_err(|e| e.to_string())
    }

    fn release(&self, user_id: i64, reserved: i64) -> Result<(), String> {
        if reserved <= 0 {
            return Ok(());
        }
        self.storage()
            .adjust_user_quota(user_id, reserved)
            .map_err(|e| e.to_string())
    }

    fn record_consumption(&self, entry: &ConsumeLog) -> Result<(), String> {
        self.storage()
            .insert_consume_log(entry)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn update_usage_counters(
        &self,
        user_id: i64,
        channel_id: i64,
        amount: i64,
    ) -> Result<(), String> {
        let storage = self.storage();
        storage
            .add_user_used_quota(user_id, amount)
            .map_err(|e| e.to_string())?;
        storage
            .add_channel_used_quota(channel_id, amount)
            .map_err(|e| e.to_string())
    }

    fn record_error(&self, entry: &ErrorLog) -> Result<(), String> {
        self.storage()
            .insert_error_log(entry)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

impl TaskStore for SqliteStore {
    fn insert(&self, task: &Task) -> Result<i64, String> {
        self.storage().insert_task(task).map_err(|e| e.to_string())
    }

    fn update(&self, task: &Task) -> Result<bool, String> {
        self.storage().update_task(task).map_err(|e| e.to_string())
    }

    fn get_by_task_id(&self, owner_id: i64, task_id: &str) -> Result<Option<Task>, String> {
        self.storage()
            .find_user_task(owner_id, task_id)
            .map_err(|e| e.to_string())
    }

    fn get_by_internal_id(&self, task_id: &str) -> Result<Option<Task>, String> {
        self.storage().find_task(task_id).map_err(|e| e.to_string())
    }

    fn claim_settlement(&self, id: i64) -> Result<bool, String> {
        self.storage()
            .claim_task_settlement(id)
            .map_err(|e| e.to_string())
    }
}
