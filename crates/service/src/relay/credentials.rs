use rand::Rng;
use relaygate_core::storage::Channel;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::lock_utils::lock_recover;

const MULTI_KEY_MODE_RANDOM: &str = "random";

/// Rotation cursor per channel. Disabled indexes are skipped in both modes.
#[derive(Default)]
pub struct CredentialRotator {
    cursors: Mutex<HashMap<i64, usize>>,
}

impl CredentialRotator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_credential(&self, channel: &Channel) -> Option<(String, usize)> {
        let keys = channel.key_list();
        let usable: Vec<usize> = (0..keys.len())
            .filter(|index| !channel.is_key_disabled(*index))
            .collect();
        let index = match usable.len() {
            0 => return None,
            1 => usable[0],
            count if channel.multi_key_mode.trim() == MULTI_KEY_MODE_RANDOM => {
                usable[rand::thread_rng().gen_range(0..count)]
            }
            count => {
                let mut cursors = lock_recover(&self.cursors, "credential_cursors");
                let cursor = cursors.entry(channel.id).or_insert(0);
                let picked = usable[*cursor % count];
                *cursor = cursor.wrapping_add(1);
                picked
            }
        };
        Some((keys[index].to_string(), index))
    }

    pub fn forget(&self, channel_id: i64) {
        lock_recover(&self.cursors, "credential_cursors").remove(&channel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygate_core::storage::CHANNEL_STATUS_ENABLED;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn pool(mode: &str, disabled: Vec<usize>) -> Channel {
        Channel {
            id: 11,
            name: "pool".to_string(),
            provider_type: 1,
            base_url: "https://upstream.example".to_string(),
            keys: "key-0\nkey-1\nkey-2".to_string(),
            multi_key_mode: mode.to_string(),
            disabled_key_indexes: disabled,
            status: CHANNEL_STATUS_ENABLED,
            auto_ban: true,
            channel_ratio: 1.0,
            used_quota: 0,
            settings: "{}".to_string(),
            created_at: 0,
        }
    }

    #[test]
    fn polling_under_contention_never_hands_out_disabled_key() {
        let rotator = Arc::new(CredentialRotator::new());
        let channel = Arc::new(pool("polling", vec![1]));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let rotator = rotator.clone();
            let channel = channel.clone();
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..100 {
                    seen.push(rotator.next_credential(&channel).expect("credential").1);
                }
                seen
            }));
        }
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for handle in handles {
            for index in handle.join().expect("join") {
                *counts.entry(index).or_default() += 1;
            }
        }
        assert_eq!(counts.get(&1), None);
        assert_eq!(counts.get(&0), Some(&400));
        assert_eq!(counts.get(&2), Some(&400));
    }

    #[test]
    fn random_mode_skips_disabled_and_exhausted_pool_yields_none() {
        let rotator = CredentialRotator::new();
        let channel = pool("random", vec![0, 2]);
        for _ in 0..50 {
            assert_eq!(
                rotator.next_credential(&channel),
                Some(("key-1".to_string(), 1))
            );
        }
        let exhausted = pool("random", vec![0, 1, 2]);
        assert_eq!(rotator.next_credential(&exhausted), None);
    }
}
