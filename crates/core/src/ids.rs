use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Caller-visible id for an asynchronous task.
pub fn generate_task_id() -> String {
    let mut bytes = [0u8; 18];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "task_{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    )
}

pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Short stable digest of a secret-bearing value, safe to use in cache keys and logs.
pub fn fingerprint(value: &str) -> String {
    let digest = Sha256::digest(value.trim().as_bytes());
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_prefixed_and_unique() {
        let first = generate_task_id();
        let second = generate_task_id();
        assert!(first.starts_with("task_"));
        assert_eq!(first.len(), "task_".len() + 24);
        assert_ne!(first, second);
    }

    #[test]
    fn fingerprint_ignores_surrounding_whitespace() {
        assert_eq!(fingerprint("secret"), fingerprint("  secret\n"));
        assert_ne!(fingerprint("secret"), fingerprint("secret2"));
        assert_eq!(fingerprint("secret").len(), 16);
    }
}
