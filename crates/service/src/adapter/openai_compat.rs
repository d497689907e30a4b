use relaygate_core::usage::Usage;
use serde_json::Value;

use super::transport::{self, classify_status, join_url};
use super::{
    timeout_for_action, ChannelContext, DispatchAdapter, DispatchResult, ProviderRequest,
    ProviderResponse,
};
use crate::context::RelayRequest;
use crate::errors::RelayError;

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const EMBEDDINGS_PATH: &str = "/v1/embeddings";

/// Chat/embeddings upstreams speaking the OpenAI wire format.
#[derive(Default)]
pub struct OpenAiCompatAdapter {
    ctx: Option<ChannelContext>,
}

impl OpenAiCompatAdapter {
    fn ctx(&self) -> Result<&ChannelContext, RelayError> {
        self.ctx
            .as_ref()
            .ok_or_else(|| RelayError::local("adapter_not_initialized", "adapter used before init"))
    }
}

fn parse_usage(value: &Value) -> Usage {
    let field = |name: &str| value.get(name).and_then(Value::as_i64).unwrap_or(0);
    Usage::new(
        field("prompt_tokens"),
        field("completion_tokens"),
        field("total_tokens"),
    )
    .normalized()
}

fn first_choice_text(body: &Value) -> String {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl DispatchAdapter for OpenAiCompatAdapter {
    fn init(&mut self, ctx: ChannelContext) -> Result<(), RelayError> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn build_request(&self, request: &RelayRequest) -> Result<ProviderRequest, RelayError> {
        let ctx = self.ctx()?;
        let path = if request.action.trim() == "embeddings" {
            EMBEDDINGS_PATH
        } else {
            CHAT_COMPLETIONS_PATH
        };
        let mut body = match &request.body {
            Value::Object(map) => Value::Object(map.clone()),
            Value::Null => Value::Object(Default::default()),
            _ => {
                return Err(RelayError::client(
                    400,
                    "invalid_request_body",
                    "request body must be a JSON object",
                ))
            }
        };
        body["model"] = Value::String(ctx.model.clone());
        let token = ctx.bearer_token()?;
        Ok(ProviderRequest {
            method: reqwest::Method::POST,
            url: join_url(ctx.base_url(), path),
            headers: vec![("Authorization".to_string(), format!("Bearer {token}"))],
            body: Some(body),
            timeout: timeout_for_action(&ctx.config, &request.action),
        })
    }

    fn execute(&self, request: ProviderRequest) -> Result<ProviderResponse, RelayError> {
        transport::send(&self.ctx()?.http, request)
    }

    fn parse_response(&self, response: ProviderResponse) -> Result<DispatchResult, RelayError> {
        if !(200..300).contains(&response.status) {
            return Err(classify_status(response.status, &response.body));
        }
        let body: Value = serde_json::from_str(&response.body).map_err(|e| {
            RelayError::upstream_status(502, format!("upstream returned invalid JSON: {e}"))
        })?;
        let usage = body.get("usage").map(parse_usage).unwrap_or_default();
        Ok(DispatchResult {
            text: first_choice_text(&body),
            usage,
            output: body,
        })
    }
}
