use relaygate_core::storage::{now_ts, ErrorLog};
use serde_json::json;

use crate::collaborators::QuotaLedger;
use crate::context::RequestContext;
use crate::errors::{FaultKind, RelayError};
use crate::runtime_config::RelayConfig;

fn qualifies_for_audit(config: &RelayConfig, err: &RelayError) -> bool {
    config.error_log_enabled && err.kind != FaultKind::Ledger
}

/// Persists a terminal relay failure. Never fails the caller: storage errors
/// are logged and dropped.
pub fn record_relay_error(
    ledger: &dyn QuotaLedger,
    config: &RelayConfig,
    ctx: &RequestContext,
    err: &RelayError,
) {
    if !qualifies_for_audit(config, err) {
        return;
    }
    let selected = ctx.selected.as_ref();
    let admin_info = json!({
        "use_channel": ctx.attempted_channels,
        "is_multi_key": selected.is_some_and(|s| s.is_multi_key()),
        "multi_key_index": selected.filter(|s| s.is_multi_key()).map(|s| s.key_index),
        "fault_kind": err.kind.as_str(),
    });
    let normalized = err.normalized();
    let entry = ErrorLog {
        user_id: ctx.request.user_id,
        token_id: ctx.request.token_id,
        channel_id: selected.map(|s| s.channel.id).unwrap_or(0),
        channel_name: selected.map(|s| s.channel.name.clone()).unwrap_or_default(),
        channel_type: selected.map(|s| s.channel.provider_type).unwrap_or(0),
        model: ctx.model.clone(),
        group_name: ctx.group.clone(),
        status_code: err.status_code as i64,
        error_type: err.kind.as_str().to_string(),
        error_code: normalized.code,
        content: normalized.message,
        admin_info: admin_info.to_string(),
        created_at: now_ts(),
    };
    if let Err(persist_err) = ledger.record_error(&entry) {
        log::warn!(
            "event=error_log_persist_failed user_id={} channel_id={} err={}",
            entry.user_id,
            entry.channel_id,
            persist_err
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_errors_and_disabled_switch_skip_audit() {
        let config = RelayConfig::default();
        assert!(!qualifies_for_audit(&config, &RelayError::insufficient_quota(5)));
        assert!(qualifies_for_audit(
            &config,
            &RelayError::upstream_status(502, "bad gateway")
        ));
        let off = RelayConfig {
            error_log_enabled: false,
            ..RelayConfig::default()
        };
        assert!(!qualifies_for_audit(
            &off,
            &RelayError::upstream_status(502, "bad gateway")
        ));
    }
}
