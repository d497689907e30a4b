use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The channel itself is unusable right now (credential, upstream quota, misconfiguration).
    Channel,
    /// The caller's input was rejected.
    Client,
    /// No channel satisfies (group, model).
    Capacity,
    /// Balance or ledger failure.
    Ledger,
    /// An attempt or task ran past its budget.
    Timeout,
    /// Upstream answered with a non-success status; classified by status code.
    Upstream,
    /// Failure inside the gateway itself.
    Local,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::Channel => "channel_error",
            FaultKind::Client => "client_error",
            FaultKind::Capacity => "capacity_error",
            FaultKind::Ledger => "ledger_error",
            FaultKind::Timeout => "timeout_error",
            FaultKind::Upstream => "upstream_error",
            FaultKind::Local => "local_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayError {
    pub kind: FaultKind,
    pub status_code: u16,
    pub code: String,
    pub message: String,
    pub skip_retry: bool,
}

impl RelayError {
    fn new(kind: FaultKind, status_code: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code,
            code: code.to_string(),
            message: message.into(),
            skip_retry: false,
        }
    }

    pub fn channel(status_code: u16, code: &str, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Channel, status_code, code, message)
    }

    pub fn client(status_code: u16, code: &str, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Client, status_code, code, message).with_skip_retry()
    }

    pub fn no_available_channel(group: &str, model: &str) -> Self {
        Self::new(
            FaultKind::Capacity,
            503,
            "no_available_channel",
            format!("no available channel for model {model} under group {group}"),
        )
        .with_skip_retry()
    }

    pub fn insufficient_quota(needed: i64) -> Self {
        Self::new(
            FaultKind::Ledger,
            403,
            "insufficient_user_quota",
            format!("user quota is not enough, {needed} required"),
        )
        .with_skip_retry()
    }

    pub fn timeout(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Timeout, status_code, "upstream_timeout", message)
    }

    pub fn upstream_status(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Upstream, status_code, "bad_response_status_code", message)
    }

    pub fn local(code: &str, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Local, 500, code, message).with_skip_retry()
    }

    pub fn with_skip_retry(mut self) -> Self {
        self.skip_retry = true;
        self
    }

    pub fn is_channel_fault(&self) -> bool {
        self.kind == FaultKind::Channel
    }

    pub fn normalized(&self) -> NormalizedError {
        NormalizedError {
            status_code: self.status_code,
            code: self.code.clone(),
            message: mask_sensitive(&self.message),
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (status={}, code={}): {}",
            self.kind.as_str(),
            self.status_code,
            self.code,
            self.message
        )
    }
}

impl std::error::Error for RelayError {}

/// Caller-visible error shape; never carries raw upstream detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedError {
    pub status_code: u16,
    pub code: String,
    pub message: String,
}

impl fmt::Display for NormalizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status_code, self.message)
    }
}

impl std::error::Error for NormalizedError {}

const MASK_MIN_SECRET_LEN: usize = 20;
const MASK_MAX_LEN: usize = 1000;

fn looks_like_secret(word: &str) -> bool {
    if word.len() < MASK_MIN_SECRET_LEN {
        return false;
    }
    let mut has_alpha = false;
    let mut has_digit = false;
    for ch in word.chars() {
        if ch.is_ascii_alphabetic() {
            has_alpha = true;
        } else if ch.is_ascii_digit() {
            has_digit = true;
        } else if !matches!(ch, '-' | '_' | '.') {
            return false;
        }
    }
    has_alpha && has_digit
}

fn mask_word(word: &str) -> String {
    if let Some((base, _query)) = word.split_once('?') {
        if base.contains("://") {
            return format!("{base}?***");
        }
    }
    if looks_like_secret(word) {
        let prefix: String = word.chars().take(4).collect();
        return format!("{prefix}***");
    }
    word.to_string()
}

/// Strips credential-looking tokens and URL query strings, and bounds the length.
pub fn mask_sensitive(text: &str) -> String {
    let mut out = String::with_capacity(text.len().min(MASK_MAX_LEN));
    let mut word = String::new();
    for ch in text.chars() {
        if ch.is_whitespace() || matches!(ch, '"' | '\'' | ',' | '(' | ')' | '[' | ']' | '{' | '}') {
            out.push_str(&mask_word(&word));
            word.clear();
            out.push(ch);
        } else {
            word.push(ch);
        }
    }
    out.push_str(&mask_word(&word));
    if out.chars().count() > MASK_MAX_LEN {
        let truncated: String = out.chars().take(MASK_MAX_LEN).collect();
        return format!("{truncated}...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_keys_and_query_strings() {
        let masked = mask_sensitive(
            "invalid key sk-abcdef1234567890abcdef for https://api.example.com/v1?key=secret",
        );
        assert!(masked.contains("sk-a***"));
        assert!(!masked.contains("1234567890"));
        assert!(masked.contains("https://api.example.com/v1?***"));
        assert!(!masked.contains("secret"));
    }

    #[test]
    fn keeps_ordinary_words() {
        assert_eq!(
            mask_sensitive("upstream returned status 502: bad gateway"),
            "upstream returned status 502: bad gateway"
        );
    }

    #[test]
    fn truncates_very_long_details() {
        let masked = mask_sensitive(&"word ".repeat(400));
        assert!(masked.ends_with("..."));
        assert!(masked.chars().count() <= MASK_MAX_LEN + 3);
    }

    #[test]
    fn client_and_capacity_errors_never_retry() {
        assert!(RelayError::client(400, "invalid_request", "bad").skip_retry);
        assert!(RelayError::no_available_channel("default", "m1").skip_retry);
        assert!(RelayError::insufficient_quota(10).skip_retry);
        assert!(!RelayError::channel(401, "invalid_key", "bad key").skip_retry);
    }

    #[test]
    fn normalized_error_masks_message() {
        let err = RelayError::channel(401, "invalid_key", "key sk-abcdef1234567890abcdef rejected");
        let normalized = err.normalized();
        assert_eq!(normalized.status_code, 401);
        assert_eq!(normalized.code, "invalid_key");
        assert!(!normalized.message.contains("1234567890"));
    }
}
