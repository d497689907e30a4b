use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Submitted,
    InProgress,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Submitted => "SUBMITTED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SUBMITTED" | "NOT_START" | "QUEUED" => Some(TaskStatus::Submitted),
            "IN_PROGRESS" => Some(TaskStatus::InProgress),
            "SUCCESS" => Some(TaskStatus::Success),
            "FAILURE" => Some(TaskStatus::Failure),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    /// Terminal states are sinks; everything else may move forward or stay put.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Success | TaskStatus::Failure => false,
            TaskStatus::Submitted => true,
            TaskStatus::InProgress => next != TaskStatus::Submitted,
        }
    }
}

pub fn format_progress(percent: u32) -> String {
    format!("{}%", percent.min(100))
}

pub fn parse_progress(progress: &str) -> Option<u32> {
    let trimmed = progress.trim();
    let digits = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
    digits.parse::<u32>().ok().map(|value| value.min(100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_never_transition() {
        for next in [
            TaskStatus::Submitted,
            TaskStatus::InProgress,
            TaskStatus::Success,
            TaskStatus::Failure,
        ] {
            assert!(!TaskStatus::Success.can_transition_to(next));
            assert!(!TaskStatus::Failure.can_transition_to(next));
        }
        assert!(TaskStatus::Submitted.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::InProgress.can_transition_to(TaskStatus::Submitted));
    }

    #[test]
    fn status_round_trips_through_storage_text() {
        assert_eq!(TaskStatus::parse("in_progress"), Some(TaskStatus::InProgress));
        assert_eq!(TaskStatus::parse(TaskStatus::Failure.as_str()), Some(TaskStatus::Failure));
        assert_eq!(TaskStatus::parse("QUEUED"), Some(TaskStatus::Submitted));
        assert_eq!(TaskStatus::parse("weird"), None);
    }

    #[test]
    fn progress_text_is_clamped_percent() {
        assert_eq!(format_progress(45), "45%");
        assert_eq!(format_progress(140), "100%");
        assert_eq!(parse_progress("45%"), Some(45));
        assert_eq!(parse_progress(" 7 "), Some(7));
        assert_eq!(parse_progress(""), None);
        assert_eq!(parse_progress("abc%"), None);
    }
}
