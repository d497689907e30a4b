use relaygate_core::usage::Usage;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::io::{BufRead, BufReader};
use std::time::Duration;

use super::transport::{self, classify_status, error_detail, join_url};
use super::{
    ChannelContext, DispatchAdapter, DispatchPlan, DispatchResult, ProviderRequest,
    ProviderResponse,
};
use crate::context::RelayRequest;
use crate::errors::RelayError;
use crate::task::{
    AsyncStart, PollState, RunHandle, RunOutput, SseFrame, StreamEvent, TaskBackend,
};

pub const ACTION_WORKFLOW_ASYNC: &str = "workflow-async";

const RUN_PATH: &str = "/v1/workflow/run";
const STREAM_RUN_PATH: &str = "/v1/workflow/stream_run";
// Authentication and permission business codes.
const AUTH_FAILURE_CODES: [i64; 2] = [4100, 4101];

#[derive(Debug, Default, Deserialize)]
struct WorkflowUsage {
    #[serde(default)]
    input_count: i64,
    #[serde(default)]
    output_count: i64,
    #[serde(default)]
    token_count: i64,
}

impl WorkflowUsage {
    fn to_usage(&self) -> Usage {
        Usage::new(self.input_count, self.output_count, self.token_count).normalized()
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    execute_id: String,
    #[serde(default)]
    debug_url: String,
    #[serde(default)]
    usage: Option<WorkflowUsage>,
    #[serde(default)]
    token: Value,
    #[serde(default)]
    cost: Value,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<HistoryRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryRecord {
    #[serde(default)]
    execute_id: String,
    #[serde(default)]
    execute_status: String,
    #[serde(default)]
    output: String,
    #[serde(default)]
    token: Value,
    #[serde(default)]
    cost: Value,
    #[serde(default)]
    error_message: String,
    #[serde(default)]
    debug_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct MessageEventData {
    #[serde(default)]
    content: String,
    #[serde(default)]
    usage: Option<WorkflowUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct DoneEventData {
    #[serde(default)]
    execute_id: String,
    #[serde(default)]
    debug_url: String,
    #[serde(default)]
    usage: Option<WorkflowUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEventData {
    #[serde(default)]
    error_code: Value,
    #[serde(default)]
    error_message: String,
}

/// Numbers arrive either as JSON numbers or as numeric strings.
fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn lenient_i64(value: &Value) -> i64 {
    lenient_f64(value).map(|number| number as i64).unwrap_or(0)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn token_only_usage(token: &Value) -> Usage {
    let tokens = lenient_i64(token).max(0);
    Usage::new(0, tokens, tokens)
}

/// Drops null and empty-string parameters; upstream rejects them.
fn workflow_parameters(body: &Value) -> Value {
    let Some(params) = body.get("parameters").and_then(Value::as_object) else {
        return Value::Object(Map::new());
    };
    let filtered: Map<String, Value> = params
        .iter()
        .filter(|(_, value)| match value {
            Value::Null => false,
            Value::String(text) => !text.trim().is_empty(),
            _ => true,
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Value::Object(filtered)
}

fn workflow_id(request: &RelayRequest) -> String {
    request
        .body
        .get("workflow_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .unwrap_or(request.model.trim())
        .to_string()
}

fn business_error(code: i64, msg: &str) -> RelayError {
    if AUTH_FAILURE_CODES.contains(&code) {
        return RelayError::channel(401, "workflow_auth_failed", format!("workflow error {code}: {msg}"));
    }
    RelayError::client(400, "workflow_failed", format!("workflow error {code}: {msg}"))
}

/// Workflow provider: synchronous runs inline, asynchronous runs as background tasks.
#[derive(Default)]
pub struct WorkflowAdapter {
    ctx: Option<ChannelContext>,
}

impl WorkflowAdapter {
    fn ctx(&self) -> Result<&ChannelContext, RelayError> {
        self.ctx
            .as_ref()
            .ok_or_else(|| RelayError::local("adapter_not_initialized", "adapter used before init"))
    }
}

impl DispatchAdapter for WorkflowAdapter {
    fn init(&mut self, ctx: ChannelContext) -> Result<(), RelayError> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn plan(&self, request: &RelayRequest) -> DispatchPlan {
        let async_flag = request
            .body
            .get("async")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if async_flag || request.action.trim() == ACTION_WORKFLOW_ASYNC {
            DispatchPlan::Deferred
        } else {
            DispatchPlan::Immediate
        }
    }

    fn build_request(&self, request: &RelayRequest) -> Result<ProviderRequest, RelayError> {
        let ctx = self.ctx()?;
        let workflow_id = workflow_id(request);
        if workflow_id.is_empty() {
            return Err(RelayError::client(400, "workflow_id_required", "workflow_id is required"));
        }
        let token = ctx.bearer_token()?;
        Ok(ProviderRequest {
            method: reqwest::Method::POST,
            url: join_url(ctx.base_url(), RUN_PATH),
            headers: vec![("Authorization".to_string(), format!("Bearer {token}"))],
            body: Some(json!({
                "workflow_id": workflow_id,
                "parameters": workflow_parameters(&request.body),
            })),
            timeout: ctx.config.dispatch_timeout,
        })
    }

    fn execute(&self, request: ProviderRequest) -> Result<ProviderResponse, RelayError> {
        transport::send(&self.ctx()?.http, request)
    }

    fn parse_response(&self, response: ProviderResponse) -> Result<DispatchResult, RelayError> {
        if response.status != 200 {
            return Err(classify_status(response.status, &response.body));
        }
        let parsed: RunResponse = serde_json::from_str(&response.body).map_err(|e| {
            RelayError::upstream_status(502, format!("workflow returned invalid JSON: {e}"))
        })?;
        if parsed.code != 0 {
            return Err(business_error(parsed.code, &parsed.msg));
        }
        let text = value_text(&parsed.data);
        let usage = match &parsed.usage {
            Some(usage) => usage.to_usage(),
            None => token_only_usage(&parsed.token),
        };
        Ok(DispatchResult {
            output: json!({
                "output": text,
                "execute_id": parsed.execute_id,
                "debug_url": parsed.debug_url,
                "cost": lenient_f64(&parsed.cost),
            }),
            text,
            usage,
        })
    }

    fn task_backend(&self, request: &RelayRequest) -> Result<Box<dyn TaskBackend>, RelayError> {
        let ctx = self.ctx()?;
        let workflow_id = workflow_id(request);
        if workflow_id.is_empty() {
            return Err(RelayError::client(400, "workflow_id_required", "workflow_id is required"));
        }
        Ok(Box::new(WorkflowTaskBackend {
            ctx: ctx.clone(),
            workflow_id,
            parameters: workflow_parameters(&request.body),
        }))
    }
}

/// Background driver for one workflow execution.
pub struct WorkflowTaskBackend {
    ctx: ChannelContext,
    workflow_id: String,
    parameters: Value,
}

impl WorkflowTaskBackend {
    fn history_url(&self, execute_id: &str) -> String {
        join_url(
            self.ctx.base_url(),
            &format!(
                "/v1/workflows/{}/run_histories/{}",
                urlencoding::encode(&self.workflow_id),
                urlencoding::encode(execute_id)
            ),
        )
    }

    fn authorized(&self, request: &mut ProviderRequest) -> Result<(), String> {
        let token = self.ctx.bearer_token().map_err(|err| err.message)?;
        request
            .headers
            .push(("Authorization".to_string(), format!("Bearer {token}")));
        Ok(())
    }
}

impl TaskBackend for WorkflowTaskBackend {
    fn start_async_run(&self) -> AsyncStart {
        let mut request = ProviderRequest {
            method: reqwest::Method::POST,
            url: join_url(self.ctx.base_url(), RUN_PATH),
            headers: Vec::new(),
            body: Some(json!({
                "workflow_id": self.workflow_id,
                "parameters": self.parameters,
                "is_async": true,
            })),
            timeout: self.ctx.config.dispatch_timeout,
        };
        if let Err(err) = self.authorized(&mut request) {
            return AsyncStart::Rejected(format!("obtain upstream token failed: {err}"));
        }
        let response = match transport::send(&self.ctx.http, request) {
            Ok(response) => response,
            Err(err) => return AsyncStart::Unavailable(err.message),
        };
        if response.status != 200 {
            return AsyncStart::Unavailable(format!(
                "HTTP {}: {}",
                response.status,
                error_detail(&response.body)
            ));
        }
        let parsed: RunResponse = match serde_json::from_str(&response.body) {
            Ok(parsed) => parsed,
            Err(err) => return AsyncStart::Unavailable(format!("invalid async start response: {err}")),
        };
        if parsed.code != 0 {
            return AsyncStart::Rejected(format!("workflow error {}: {}", parsed.code, parsed.msg));
        }
        let execute_id = parsed.execute_id.trim().to_string();
        if execute_id.is_empty() {
            return AsyncStart::Rejected("async run returned no execute_id".to_string());
        }
        AsyncStart::Started(RunHandle {
            execute_id,
            debug_url: parsed.debug_url,
        })
    }

    fn poll_run(&self, run: &RunHandle, timeout: Duration) -> Result<PollState, String> {
        let mut request = ProviderRequest {
            method: reqwest::Method::GET,
            url: self.history_url(&run.execute_id),
            headers: Vec::new(),
            body: None,
            timeout,
        };
        self.authorized(&mut request)?;
        let response = transport::send(&self.ctx.http, request).map_err(|err| err.message)?;
        if response.status != 200 {
            return Err(format!(
                "HTTP {}: {}",
                response.status,
                error_detail(&response.body)
            ));
        }
        let parsed: HistoryResponse = serde_json::from_str(&response.body)
            .map_err(|e| format!("invalid run history response: {e}"))?;
        if parsed.code != 0 {
            return Err(format!("workflow error {}: {}", parsed.code, parsed.msg));
        }
        let Some(record) = parsed.data.into_iter().next() else {
            return Ok(PollState::Running);
        };
        match record.execute_status.as_str() {
            "Success" => Ok(PollState::Succeeded(RunOutput {
                usage: token_only_usage(&record.token),
                credits: lenient_f64(&record.cost).filter(|credits| *credits > 0.0),
                output: record.output,
                execute_id: record.execute_id,
                debug_url: record.debug_url,
            })),
            "Fail" => Ok(PollState::Failed(if record.error_message.trim().is_empty() {
                "workflow execution failed".to_string()
            } else {
                record.error_message
            })),
            _ => Ok(PollState::Running),
        }
    }

    fn open_stream(&self, timeout: Duration) -> Result<Box<dyn BufRead + Send>, String> {
        let mut request = ProviderRequest {
            method: reqwest::Method::POST,
            url: join_url(self.ctx.base_url(), STREAM_RUN_PATH),
            headers: vec![("Accept".to_string(), "text/event-stream".to_string())],
            body: Some(json!({
                "workflow_id": self.workflow_id,
                "parameters": self.parameters,
            })),
            timeout,
        };
        self.authorized(&mut request)?;
        let response = transport::open_stream(&self.ctx.http, request)
            .map_err(|err| format!("HTTP {}: {}", err.status_code, err.message))?;
        Ok(Box::new(BufReader::new(response)))
    }

    fn decode_stream_event(&self, frame: &SseFrame) -> StreamEvent {
        match frame.event.as_str() {
            "Message" => match serde_json::from_str::<MessageEventData>(&frame.data) {
                Ok(data) => StreamEvent::Message {
                    content: data.content,
                    usage: data.usage.map(|usage| usage.to_usage()),
                },
                Err(err) => {
                    log::warn!("event=workflow_stream_bad_message err={}", err);
                    StreamEvent::Other
                }
            },
            "Done" => {
                let data: DoneEventData = serde_json::from_str(&frame.data).unwrap_or_default();
                StreamEvent::Done {
                    execute_id: data.execute_id,
                    debug_url: data.debug_url,
                    usage: data.usage.map(|usage| usage.to_usage()),
                }
            }
            "Error" => {
                let data: ErrorEventData = serde_json::from_str(&frame.data).unwrap_or_default();
                let message = if data.error_message.trim().is_empty() {
                    frame.data.clone()
                } else {
                    data.error_message
                };
                StreamEvent::Error(format!(
                    "workflow error {}: {}",
                    value_text(&data.error_code),
                    message
                ))
            }
            "PING" => StreamEvent::Ping,
            _ => StreamEvent::Other,
        }
    }
}
