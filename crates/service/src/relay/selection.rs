use rand::Rng;
use relaygate_core::storage::{Ability, Channel};

use crate::collaborators::{ChannelCandidate, ChannelRegistry};
use crate::context::{RelayRequest, SelectedChannel};
use crate::errors::RelayError;
use crate::runtime_config::RelayConfig;

// Added to every ability weight so zero-weight channels stay reachable.
const WEIGHT_SMOOTHING: u64 = 10;

/// Resolves (group, model, attempt) into a concrete channel and credential.
///
/// A pinned channel short-circuits ability lookup. Otherwise candidates are
/// narrowed to unattempted, non-cooling channels (each filter is dropped when it
/// would empty the pool), restricted to the highest priority tier and drawn by weight.
pub fn select_channel(
    registry: &dyn ChannelRegistry,
    config: &RelayConfig,
    request: &RelayRequest,
    attempt: u32,
    attempted: &[i64],
) -> Result<SelectedChannel, RelayError> {
    if let Some(channel_id) = request.specific_channel_id {
        return select_pinned(registry, request, channel_id);
    }

    let groups: Vec<String> = if request.is_auto_group() {
        config.auto_groups.clone()
    } else {
        vec![request.group.trim().to_string()]
    };
    let model = request.model.trim();
    for group in groups {
        let candidates = registry
            .list_candidates(&group, model)
            .map_err(|err| RelayError::local("registry_unavailable", err))?;
        if candidates.is_empty() {
            continue;
        }
        let pool = narrow_pool(candidates, attempted, |id| registry.is_cooling_down(id));
        let Some(picked) = pick_weighted(&pool) else {
            continue;
        };
        let candidate = pool[picked].clone();
        log::debug!(
            "event=channel_selected attempt={} group={} model={} channel_id={} priority={}",
            attempt,
            group,
            model,
            candidate.channel.id,
            candidate.ability.priority
        );
        return with_credential(registry, candidate.channel, Some(candidate.ability), group);
    }
    Err(RelayError::no_available_channel(&request.group, model))
}

fn select_pinned(
    registry: &dyn ChannelRegistry,
    request: &RelayRequest,
    channel_id: i64,
) -> Result<SelectedChannel, RelayError> {
    let channel = registry
        .get_channel(channel_id)
        .map_err(|err| RelayError::local("registry_unavailable", err))?
        .filter(|channel| channel.is_enabled())
        .ok_or_else(|| {
            RelayError::client(
                403,
                "channel_unavailable",
                format!("specified channel {channel_id} is disabled or does not exist"),
            )
        })?;
    let group = request.group.trim().to_string();
    let ability = registry
        .find_ability(&group, request.model.trim(), channel_id)
        .map_err(|err| RelayError::local("registry_unavailable", err))?;
    with_credential(registry, channel, ability, group)
}

fn with_credential(
    registry: &dyn ChannelRegistry,
    channel: Channel,
    ability: Option<Ability>,
    resolved_group: String,
) -> Result<SelectedChannel, RelayError> {
    let Some((credential, key_index)) = registry.next_credential(&channel) else {
        return Err(RelayError::channel(
            503,
            "channel_keys_exhausted",
            format!("channel {} has no enabled credential", channel.id),
        ));
    };
    Ok(SelectedChannel {
        channel,
        ability,
        resolved_group,
        credential,
        key_index,
    })
}

pub(crate) fn narrow_pool<F>(
    candidates: Vec<ChannelCandidate>,
    attempted: &[i64],
    is_cooling_down: F,
) -> Vec<ChannelCandidate>
where
    F: Fn(i64) -> bool,
{
    let fresh: Vec<ChannelCandidate> = candidates
        .iter()
        .filter(|candidate| !attempted.contains(&candidate.channel.id))
        .cloned()
        .collect();
    let pool = if fresh.is_empty() { candidates } else { fresh };

    let available: Vec<ChannelCandidate> = pool
        .iter()
        .filter(|candidate| !is_cooling_down(candidate.channel.id))
        .cloned()
        .collect();
    let pool = if available.is_empty() { pool } else { available };

    let Some(top) = pool.iter().map(|candidate| candidate.ability.priority).max() else {
        return pool;
    };
    pool.into_iter()
        .filter(|candidate| candidate.ability.priority == top)
        .collect()
}

pub(crate) fn pick_weighted(pool: &[ChannelCandidate]) -> Option<usize> {
    match pool.len() {
        0 => None,
        1 => Some(0),
        _ => {
            let total: u64 = pool
                .iter()
                .map(|candidate| candidate.ability.weight as u64 + WEIGHT_SMOOTHING)
                .sum();
            let mut roll = rand::thread_rng().gen_range(0..total);
            for (index, candidate) in pool.iter().enumerate() {
                let weight = candidate.ability.weight as u64 + WEIGHT_SMOOTHING;
                if roll < weight {
                    return Some(index);
                }
                roll -= weight;
            }
            Some(pool.len() - 1)
        }
    }
}
