use relaygate_core::storage::Channel;
use relaygate_core::usage::Usage;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::context::RelayRequest;
use crate::errors::RelayError;
use crate::runtime_config::RelayConfig;
use crate::task::TaskBackend;
use crate::token_provider::TokenProvider;

pub mod openai_compat;
pub mod transport;
pub mod workflow;

pub const PROVIDER_OPENAI_COMPATIBLE: i64 = 1;
pub const PROVIDER_WORKFLOW: i64 = 49;

pub const AUTH_TYPE_PAT: &str = "pat";
pub const AUTH_TYPE_OAUTH: &str = "oauth";

/// Parsed `channels.settings` JSON.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelSettings {
    #[serde(default)]
    pub auth_type: String,
    #[serde(default)]
    pub proxy: String,
}

impl ChannelSettings {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::default();
        }
        serde_json::from_str(raw).unwrap_or_else(|err| {
            log::warn!("event=channel_settings_invalid err={}", err);
            Self::default()
        })
    }

    pub fn auth_type(&self) -> &str {
        match self.auth_type.trim() {
            "" => AUTH_TYPE_PAT,
            other => other,
        }
    }

    pub fn proxy(&self) -> Option<&str> {
        Some(self.proxy.trim()).filter(|proxy| !proxy.is_empty())
    }
}

/// Everything an adapter needs about the channel chosen for this attempt.
#[derive(Clone)]
pub struct ChannelContext {
    pub channel: Channel,
    pub settings: ChannelSettings,
    pub credential: String,
    pub key_index: usize,
    pub group: String,
    pub model: String,
    pub config: Arc<RelayConfig>,
    pub http: Client,
    pub tokens: Arc<TokenProvider>,
}

impl ChannelContext {
    pub fn base_url(&self) -> &str {
        self.channel.base_url.trim().trim_end_matches('/')
    }

    /// Bearer token for the upstream: the key itself, or an exchanged OAuth token.
    pub fn bearer_token(&self) -> Result<String, RelayError> {
        self.tokens.access_token(self)
    }
}

/// Per-attempt timeout: short for status-style reads, long for uploads.
pub fn timeout_for_action(config: &RelayConfig, action: &str) -> Duration {
    match action.trim() {
        "status" | "query" | "fetch" => config.status_timeout,
        "upload" | "files" | "image-edit" | "audio-transcription" => config.upload_timeout,
        _ => config.dispatch_timeout,
    }
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub output: Value,
    /// Plain-text rendering of the output, used by usage correction.
    pub text: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPlan {
    /// Completes within the inbound call.
    Immediate,
    /// Accepted as a background task; the caller gets a task id.
    Deferred,
}

/// One implementation per upstream provider dialect.
pub trait DispatchAdapter: Send {
    fn init(&mut self, ctx: ChannelContext) -> Result<(), RelayError>;

    fn plan(&self, _request: &RelayRequest) -> DispatchPlan {
        DispatchPlan::Immediate
    }

    fn build_request(&self, request: &RelayRequest) -> Result<ProviderRequest, RelayError>;

    fn execute(&self, request: ProviderRequest) -> Result<ProviderResponse, RelayError>;

    fn parse_response(&self, response: ProviderResponse) -> Result<DispatchResult, RelayError>;

    /// Background driver for a deferred request.
    fn task_backend(&self, _request: &RelayRequest) -> Result<Box<dyn TaskBackend>, RelayError> {
        Err(RelayError::client(
            400,
            "async_not_supported",
            "this channel does not support asynchronous execution",
        ))
    }
}

pub type AdapterFactory = Arc<dyn Fn() -> Box<dyn DispatchAdapter> + Send + Sync>;

/// Adapter lookup keyed by channel provider type.
#[derive(Clone)]
pub struct AdapterRegistry {
    factories: HashMap<i64, AdapterFactory>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(PROVIDER_OPENAI_COMPATIBLE, || {
            Box::new(openai_compat::OpenAiCompatAdapter::default())
        });
        registry.register(PROVIDER_WORKFLOW, || {
            Box::new(workflow::WorkflowAdapter::default())
        });
        registry
    }
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, provider_type: i64, factory: F)
    where
        F: Fn() -> Box<dyn DispatchAdapter> + Send + Sync + 'static,
    {
        self.factories.insert(provider_type, Arc::new(factory));
    }

    pub fn create(&self, provider_type: i64) -> Option<Box<dyn DispatchAdapter>> {
        self.factories.get(&provider_type).map(|factory| factory())
    }
}
