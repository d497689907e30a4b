use relaygate_core::storage::now_ts;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::lock_utils::lock_recover;

const DEFAULT_CHANNEL_COOLDOWN_SECS: i64 = 20;
const CHANNEL_COOLDOWN_429_SECS: i64 = 45;
const CHANNEL_COOLDOWN_5XX_SECS: i64 = 30;
const CHANNEL_RATE_LIMIT_COOLDOWN_LADDER_SECS: [i64; 4] = [CHANNEL_COOLDOWN_429_SECS, 300, 1800, 7200];
// A channel quiet for this long starts a fresh 429 ladder.
const CHANNEL_RATE_LIMIT_OFFENSE_FORGET_AFTER_SECS: i64 = 30 * 60;
const CHANNEL_COOLDOWN_CLEANUP_INTERVAL_SECS: i64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CooldownReason {
    Default,
    RateLimited,
    Upstream5xx,
}

pub fn cooldown_reason_for_status(status: u16) -> CooldownReason {
    match status {
        429 => CooldownReason::RateLimited,
        500..=599 => CooldownReason::Upstream5xx,
        _ => CooldownReason::Default,
    }
}

fn rate_limit_cooldown_secs_for_offense(offense_count: u32) -> i64 {
    let idx = offense_count
        .saturating_sub(1)
        .min((CHANNEL_RATE_LIMIT_COOLDOWN_LADDER_SECS.len() - 1) as u32) as usize;
    CHANNEL_RATE_LIMIT_COOLDOWN_LADDER_SECS[idx]
}

#[derive(Default)]
struct CooldownState {
    until: HashMap<i64, i64>,
    offense_counts: HashMap<i64, u32>,
    offense_last_at: HashMap<i64, i64>,
    last_cleanup_at: i64,
}

impl CooldownState {
    fn cooldown_secs_for_mark(&mut self, channel_id: i64, reason: CooldownReason, now: i64) -> i64 {
        match reason {
            CooldownReason::RateLimited => {
                if let Some(last) = self.offense_last_at.get(&channel_id).copied() {
                    if now.saturating_sub(last) > CHANNEL_RATE_LIMIT_OFFENSE_FORGET_AFTER_SECS {
                        self.offense_counts.remove(&channel_id);
                    }
                }
                let offense_count = self
                    .offense_counts
                    .entry(channel_id)
                    .and_modify(|count| *count = count.saturating_add(1))
                    .or_insert(1);
                self.offense_last_at.insert(channel_id, now);
                rate_limit_cooldown_secs_for_offense(*offense_count)
            }
            CooldownReason::Upstream5xx => CHANNEL_COOLDOWN_5XX_SECS,
            CooldownReason::Default => DEFAULT_CHANNEL_COOLDOWN_SECS,
        }
    }

    fn maybe_cleanup(&mut self, now: i64) {
        if self.last_cleanup_at != 0
            && now.saturating_sub(self.last_cleanup_at) < CHANNEL_COOLDOWN_CLEANUP_INTERVAL_SECS
        {
            return;
        }
        self.last_cleanup_at = now;
        self.until.retain(|_, until| *until > now);
        let stale: Vec<i64> = self
            .offense_last_at
            .iter()
            .filter(|(_, last)| now.saturating_sub(**last) > CHANNEL_RATE_LIMIT_OFFENSE_FORGET_AFTER_SECS)
            .map(|(channel_id, _)| *channel_id)
            .collect();
        for channel_id in stale {
            self.offense_last_at.remove(&channel_id);
            self.offense_counts.remove(&channel_id);
        }
    }
}

/// Short-lived "not capacity-available" marks for channels that just failed.
#[derive(Default)]
pub struct CooldownTable {
    state: Mutex<CooldownState>,
}

impl CooldownTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cooling_down(&self, channel_id: i64) -> bool {
        let mut state = lock_recover(&self.state, "channel_cooldown");
        let now = now_ts();
        match state.until.get(&channel_id).copied() {
            Some(until) if until > now => true,
            Some(_) => {
                state.until.remove(&channel_id);
                false
            }
            None => false,
        }
    }

    pub fn mark(&self, channel_id: i64, reason: CooldownReason) {
        let mut state = lock_recover(&self.state, "channel_cooldown");
        let now = now_ts();
        state.maybe_cleanup(now);
        let cooldown_until = now + state.cooldown_secs_for_mark(channel_id, reason, now);
        // Keep the later deadline when a shorter mark lands on a longer one.
        let entry = state.until.entry(channel_id).or_insert(cooldown_until);
        if cooldown_until > *entry {
            *entry = cooldown_until;
        }
    }

    pub fn mark_for_status(&self, channel_id: i64, status: u16) {
        self.mark(channel_id, cooldown_reason_for_status(status));
    }

    /// Success lifts the cooldown and steps the 429 ladder back by one.
    pub fn clear(&self, channel_id: i64) {
        let mut state = lock_recover(&self.state, "channel_cooldown");
        state.until.remove(&channel_id);
        let mut should_remove = false;
        if let Some(count) = state.offense_counts.get_mut(&channel_id) {
            if *count <= 1 {
                should_remove = true;
            } else {
                *count -= 1;
            }
        }
        if should_remove {
            state.offense_counts.remove(&channel_id);
            state.offense_last_at.remove(&channel_id);
        }
    }
}
