use relaygate_core::pricing::PriceData;
use relaygate_core::storage::{Ability, Channel};
use serde_json::Value;
use std::time::Instant;

pub const AUTO_GROUP: &str = "auto";

/// Inbound operation as handed to the engine by the routing surface.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub user_id: i64,
    pub token_id: Option<i64>,
    pub group: String,
    pub model: String,
    pub action: String,
    pub body: Value,
    /// Caller explicitly pinned one channel; no other channel is acceptable.
    pub specific_channel_id: Option<i64>,
}

impl RelayRequest {
    pub fn new(user_id: i64, group: &str, model: &str, body: Value) -> Self {
        Self {
            user_id,
            token_id: None,
            group: group.to_string(),
            model: model.to_string(),
            action: String::new(),
            body,
            specific_channel_id: None,
        }
    }

    pub fn is_auto_group(&self) -> bool {
        self.group.trim() == AUTO_GROUP
    }
}

#[derive(Debug, Clone)]
pub struct SelectedChannel {
    pub channel: Channel,
    pub ability: Option<Ability>,
    /// Concrete group that served the request (differs from the requested one for `auto`).
    pub resolved_group: String,
    pub credential: String,
    pub key_index: usize,
}

impl SelectedChannel {
    pub fn channel_id(&self) -> i64 {
        self.channel.id
    }

    pub fn is_multi_key(&self) -> bool {
        self.channel.is_multi_key()
    }
}

pub struct RequestContext {
    pub request: RelayRequest,
    pub group: String,
    pub model: String,
    pub selected: Option<SelectedChannel>,
    pub price: Option<PriceData>,
    pub attempted_channels: Vec<i64>,
    pub reserved_quota: i64,
    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(request: RelayRequest) -> Self {
        let group = request.group.trim().to_string();
        let model = request.model.trim().to_string();
        Self {
            request,
            group,
            model,
            selected: None,
            price: None,
            attempted_channels: Vec::new(),
            reserved_quota: 0,
            started_at: Instant::now(),
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.request.specific_channel_id.is_some()
    }

    pub fn record_attempt(&mut self, selected: SelectedChannel) {
        self.attempted_channels.push(selected.channel_id());
        self.group = selected.resolved_group.clone();
        self.selected = Some(selected);
    }

    /// Operator-facing attempt chain, e.g. `3->7->3`.
    pub fn channel_chain(&self) -> String {
        self.attempted_channels
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join("->")
    }

    pub fn display_group(&self) -> String {
        if self.request.is_auto_group() {
            format!("{AUTO_GROUP}({})", self.group)
        } else {
            self.group.clone()
        }
    }
}
