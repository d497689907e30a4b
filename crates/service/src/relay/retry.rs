use crate::errors::RelayError;

/// Decides whether a failed attempt should be retried on another channel.
///
/// Rules are evaluated in order; the first match wins. A pinned request stops
/// before the channel-fault rule so a faulty pinned channel is never swapped out.
pub fn should_retry(err: &RelayError, pinned: bool, remaining_attempts: u32) -> bool {
    if err.skip_retry {
        return false;
    }
    if pinned {
        return false;
    }
    if err.is_channel_fault() {
        return true;
    }
    if remaining_attempts == 0 {
        return false;
    }
    retryable_status(err.status_code)
}

fn retryable_status(status: u16) -> bool {
    match status {
        429 | 307 => true,
        // Gateway-class timeouts: the upstream already spent the budget.
        504 | 524 => false,
        500..=599 => true,
        400 | 408 => false,
        200..=299 => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_retry_and_pinned_always_stop() {
        let channel = RelayError::channel(401, "invalid_key", "bad key");
        assert!(!should_retry(&channel.clone().with_skip_retry(), false, 3));
        assert!(!should_retry(&channel, true, 3));
        assert!(!should_retry(&RelayError::client(400, "bad_request", "x"), false, 3));
    }

    #[test]
    fn channel_fault_retries_even_without_budget() {
        let err = RelayError::channel(403, "upstream_quota_exhausted", "quota");
        assert!(should_retry(&err, false, 0));
    }

    #[test]
    fn status_classification() {
        let status = |code| RelayError::upstream_status(code, "upstream failed");
        assert!(should_retry(&status(429), false, 2));
        assert!(should_retry(&status(307), false, 2));
        assert!(should_retry(&status(502), false, 2));
        assert!(!should_retry(&status(504), false, 2));
        assert!(!should_retry(&status(524), false, 2));
        assert!(!should_retry(&status(400), false, 2));
        assert!(!should_retry(&status(408), false, 2));
        assert!(!should_retry(&status(200), false, 2));
        assert!(should_retry(&status(404), false, 2));
        assert!(!should_retry(&status(502), false, 0));
    }
}
