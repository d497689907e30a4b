use relaygate_core::usage::Usage;
use std::io::BufRead;

use super::budget::TaskBudget;
use super::tracker::TaskTracker;
use super::{RunOutput, RunResult, SseFrame, StreamEvent, TaskBackend};

const STREAM_PROGRESS_STEP: u32 = 10;
const STREAM_PROGRESS_CAP: u32 = 90;

/// Splits a server-sent event stream into frames. A blank line ends a frame;
/// comment lines are skipped.
pub struct SseReader<R: BufRead> {
    inner: R,
    line: String,
}

impl<R: BufRead> SseReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: String::new(),
        }
    }

    pub fn next_frame(&mut self) -> Result<Option<SseFrame>, String> {
        let mut frame = SseFrame::default();
        let mut has_fields = false;
        loop {
            self.line.clear();
            let read = self
                .inner
                .read_line(&mut self.line)
                .map_err(|e| format!("read stream failed: {e}"))?;
            if read == 0 {
                return Ok(has_fields.then_some(frame));
            }
            let line = self.line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if has_fields {
                    return Ok(Some(frame));
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => {
                    frame.event = value.trim().to_string();
                    has_fields = true;
                }
                "data" => {
                    if !frame.data.is_empty() {
                        frame.data.push('\n');
                    }
                    frame.data.push_str(value);
                    has_fields = true;
                }
                _ => {}
            }
        }
    }
}

/// Runs the streaming strategy to completion, accumulating output and usage.
/// The stream is cut off once the task's budget is spent.
pub fn drive_stream(
    backend: &dyn TaskBackend,
    tracker: &mut TaskTracker,
    budget: &TaskBudget,
) -> RunResult {
    if budget.is_spent() {
        return RunResult::Failed(budget.timeout_reason());
    }
    let reader = match backend.open_stream(budget.left()) {
        Ok(reader) => reader,
        Err(err) => return stream_failure(budget, err),
    };
    let mut frames = SseReader::new(reader);
    let mut output = RunOutput::default();
    let mut progress = tracker.progress();

    loop {
        let frame = match frames.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => return stream_failure(budget, err),
        };
        if budget.is_spent() {
            return RunResult::Failed(budget.timeout_reason());
        }
        match backend.decode_stream_event(&frame) {
            StreamEvent::Message { content, usage } => {
                output.output.push_str(&content);
                if let Some(usage) = usage.filter(|usage| !usage.is_empty()) {
                    output.usage = usage.normalized();
                }
                progress = (progress + STREAM_PROGRESS_STEP).min(STREAM_PROGRESS_CAP);
                tracker.advance(progress);
            }
            StreamEvent::Done {
                execute_id,
                debug_url,
                usage,
            } => {
                output.execute_id = execute_id;
                output.debug_url = debug_url;
                if output.usage.total_tokens == 0 {
                    output.usage = usage.map(Usage::normalized).unwrap_or_default();
                }
                break;
            }
            StreamEvent::Error(message) => return RunResult::Failed(message),
            StreamEvent::Ping | StreamEvent::Other => {}
        }
    }

    if output.output.is_empty() {
        return RunResult::Failed("no output received from workflow stream".to_string());
    }
    RunResult::Succeeded(output)
}

/// Transport timeouts are bounded by the budget, so an error after the deadline
/// is reported as the task timing out.
fn stream_failure(budget: &TaskBudget, err: String) -> RunResult {
    if budget.is_spent() {
        return RunResult::Failed(budget.timeout_reason());
    }
    RunResult::Failed(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_split_on_blank_lines_and_join_data() {
        let raw = "id: 0\nevent: Message\ndata: {\"a\":1}\n\n: keepalive\n\nevent: Done\ndata: line1\ndata: line2\n\nevent: PING\n";
        let mut reader = SseReader::new(Cursor::new(raw.as_bytes()));
        let first = reader.next_frame().expect("read").expect("frame");
        assert_eq!(first.event, "Message");
        assert_eq!(first.data, "{\"a\":1}");
        let second = reader.next_frame().expect("read").expect("frame");
        assert_eq!(second.event, "Done");
        assert_eq!(second.data, "line1\nline2");
        let third = reader.next_frame().expect("read").expect("trailing frame");
        assert_eq!(third.event, "PING");
        assert!(reader.next_frame().expect("read").is_none());
    }

    #[test]
    fn crlf_lines_are_accepted() {
        let raw = "event: Error\r\ndata: {\"error_message\":\"x\"}\r\n\r\n";
        let mut reader = SseReader::new(Cursor::new(raw.as_bytes()));
        let frame = reader.next_frame().expect("read").expect("frame");
        assert_eq!(frame.event, "Error");
        assert_eq!(frame.data, "{\"error_message\":\"x\"}");
    }
}
