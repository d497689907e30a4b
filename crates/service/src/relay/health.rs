use relaygate_core::storage::{Storage, CHANNEL_STATUS_AUTO_DISABLED};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::collaborators::ChannelFaultReport;
use crate::errors::mask_sensitive;
use crate::lock_utils::lock_recover;
use crate::runtime_config::RelayConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    /// Fault counted, threshold not reached (or auto-disable is off).
    Counted(u32),
    ChannelDisabled,
    KeyDisabled { index: usize },
    /// Another report already performed the transition.
    AlreadyDisabled,
    UnknownChannel,
}

/// Consecutive channel-fault counters; crossing the threshold disables the
/// channel (or one key of a pool) through a conditional update.
#[derive(Default)]
pub struct HealthPolicy {
    fault_counts: Mutex<HashMap<i64, u32>>,
}

impl HealthPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, channel_id: i64) -> u32 {
        let mut counts = lock_recover(&self.fault_counts, "channel_fault_counts");
        let count = counts.entry(channel_id).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn clear(&self, channel_id: i64) {
        lock_recover(&self.fault_counts, "channel_fault_counts").remove(&channel_id);
    }

    pub fn fault_count(&self, channel_id: i64) -> u32 {
        lock_recover(&self.fault_counts, "channel_fault_counts")
            .get(&channel_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn handle_fault(
        &self,
        storage: &Storage,
        report: &ChannelFaultReport,
        config: &RelayConfig,
    ) -> Result<HealthAction, String> {
        let count = self.bump(report.channel_id);
        let Some(channel) = storage
            .find_channel(report.channel_id)
            .map_err(|e| e.to_string())?
        else {
            self.clear(report.channel_id);
            return Ok(HealthAction::UnknownChannel);
        };
        if !config.automatic_disable_channel
            || !channel.auto_ban
            || count < config.channel_fault_disable_threshold.max(1)
        {
            return Ok(HealthAction::Counted(count));
        }
        let reason = mask_sensitive(&report.message);

        if let Some(index) = report.key_index.filter(|_| channel.is_multi_key()) {
            match storage
                .disable_channel_key(channel.id, index)
                .map_err(|e| e.to_string())?
            {
                Some(false) => {
                    self.clear(channel.id);
                    log::warn!(
                        "event=channel_key_auto_disabled channel_id={} key_index={} status={} reason={}",
                        channel.id,
                        index,
                        report.status_code,
                        reason
                    );
                    return Ok(HealthAction::KeyDisabled { index });
                }
                Some(true) => {
                    log::warn!(
                        "event=channel_keys_exhausted channel_id={} key_index={}",
                        channel.id,
                        index
                    );
                }
                None => return Ok(HealthAction::AlreadyDisabled),
            }
        }

        if storage
            .disable_channel_if_enabled(channel.id, CHANNEL_STATUS_AUTO_DISABLED)
            .map_err(|e| e.to_string())?
        {
            self.clear(channel.id);
            log::warn!(
                "event=channel_auto_disabled channel_id={} status={} faults={} reason={}",
                channel.id,
                report.status_code,
                count,
                reason
            );
            Ok(HealthAction::ChannelDisabled)
        } else {
            Ok(HealthAction::AlreadyDisabled)
        }
    }
}
