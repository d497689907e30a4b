use relaygate_core::storage::{Ability, Channel, ConsumeLog, ErrorLog, Task};

/// One enabled (ability, channel) pair serving a (group, model).
#[derive(Debug, Clone)]
pub struct ChannelCandidate {
    pub channel: Channel,
    pub ability: Ability,
}

#[derive(Debug, Clone)]
pub struct ChannelFaultReport {
    pub channel_id: i64,
    /// Credential index for multi-key channels.
    pub key_index: Option<usize>,
    pub status_code: u16,
    pub message: String,
}

/// Channel lookup, credential rotation and health bookkeeping.
pub trait ChannelRegistry: Send + Sync {
    /// Enabled abilities for (group, model) joined with their enabled channel,
    /// highest priority first.
    fn list_candidates(&self, group: &str, model: &str) -> Result<Vec<ChannelCandidate>, String>;
    fn get_channel(&self, channel_id: i64) -> Result<Option<Channel>, String>;
    fn find_ability(
        &self,
        group: &str,
        model: &str,
        channel_id: i64,
    ) -> Result<Option<Ability>, String>;
    /// Next usable credential and its index; `None` when every key is disabled.
    fn next_credential(&self, channel: &Channel) -> Option<(String, usize)>;
    fn is_cooling_down(&self, channel_id: i64) -> bool;
    /// Starts a cooldown after a transient upstream failure (429, 5xx).
    fn mark_cooling_down(&self, channel_id: i64, status_code: u16);
    fn report_fault(&self, report: &ChannelFaultReport);
    fn report_success(&self, channel_id: i64);
    fn disable_channel(&self, channel_id: i64, reason: &str) -> Result<bool, String>;
    fn enable_channel(&self, channel_id: i64) -> Result<bool, String>;
}

/// Per-user balances and per-channel usage counters. All balance changes are deltas.
pub trait QuotaLedger: Send + Sync {
    fn reserve(&self, user_id: i64, amount: i64) -> Result<bool, String>;
    /// Moves the balance by `reserved - actual`: refund when positive, extra debit when negative.
    fn settle(&self, user_id: i64, reserved: i64, actual: i64) -> Result<(), String>;
    fn release(&self, user_id: i64, reserved: i64) -> Result<(), String>;
    fn record_consumption(&self, entry: &ConsumeLog) -> Result<(), String>;
    fn update_usage_counters(&self, user_id: i64, channel_id: i64, amount: i64)
        -> Result<(), String>;
    fn record_error(&self, entry: &ErrorLog) -> Result<(), String>;
}

pub trait TaskStore: Send + Sync {
    fn insert(&self, task: &Task) -> Result<i64, String>;
    /// Returns false when the stored task is already terminal.
    fn update(&self, task: &Task) -> Result<bool, String>;
    fn get_by_task_id(&self, owner_id: i64, task_id: &str) -> Result<Option<Task>, String>;
    fn get_by_internal_id(&self, task_id: &str) -> Result<Option<Task>, String>;
    /// First caller for a task wins; later callers get false.
    fn claim_settlement(&self, id: i64) -> Result<bool, String>;
}
