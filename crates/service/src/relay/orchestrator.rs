use relaygate_core::pricing::PriceData;
use relaygate_core::usage::Usage;
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::adapter::transport::build_client;
use crate::adapter::{AdapterRegistry, ChannelContext, ChannelSettings, DispatchPlan};
use crate::collaborators::{ChannelFaultReport, ChannelRegistry, QuotaLedger};
use crate::context::{RelayRequest, RequestContext, SelectedChannel};
use crate::errors::RelayError;
use crate::relay::audit::record_relay_error;
use crate::relay::pricing::{estimate_quota, price_for};
use crate::relay::reconciler::{record_consumption, ConsumptionEntry, QuotaReservation};
use crate::relay::retry::should_retry;
use crate::relay::selection::select_channel;
use crate::runtime_config::{ConfigStore, RelayConfig};
use crate::task::{TaskEngine, TaskLaunch, TaskSubmission};
use crate::token_provider::TokenProvider;

/// Collaborators one relay operation runs against.
pub struct RelayDeps {
    pub registry: Arc<dyn ChannelRegistry>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub config: Arc<ConfigStore>,
    pub adapters: AdapterRegistry,
    pub tokens: Arc<TokenProvider>,
    pub tasks: Arc<TaskEngine>,
    /// Shared client for channels without a proxy.
    pub http: Client,
}

/// Result of a synchronous dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct RelayResponse {
    pub output: Value,
    pub usage: Usage,
    pub quota: i64,
    pub channel_id: i64,
    pub group: String,
    pub attempts: Vec<i64>,
}

#[derive(Debug, Clone)]
pub enum RelayOutcome {
    Completed(RelayResponse),
    /// Accepted for background execution; progress is read through the task id.
    Submitted(TaskSubmission),
}

enum AttemptOutcome {
    Completed(RelayResponse),
    Submitted(TaskSubmission),
}

/// Runs one inbound operation through selection, dispatch and settlement.
///
/// Exactly one of commit or release happens on the reservation, or it is handed
/// to a background task that settles it later.
pub fn relay(deps: &RelayDeps, request: RelayRequest) -> Result<RelayOutcome, RelayError> {
    let config = deps.config.snapshot();
    let mut ctx = RequestContext::new(request);
    let mut reservation: Option<QuotaReservation> = None;
    let max_attempt = config.retry_times;
    let mut attempt = 0_u32;

    let err = loop {
        let result = run_attempt(deps, &config, &mut ctx, &mut reservation, attempt);
        let err = match result {
            Ok(AttemptOutcome::Completed(response)) => {
                log_chain(&ctx, "success");
                return Ok(RelayOutcome::Completed(response));
            }
            Ok(AttemptOutcome::Submitted(submission)) => {
                log_chain(&ctx, "submitted");
                return Ok(RelayOutcome::Submitted(submission));
            }
            Err(err) => err,
        };
        let err = if ctx.is_pinned() {
            err.with_skip_retry()
        } else {
            err
        };
        let remaining = max_attempt.saturating_sub(attempt);
        if attempt >= max_attempt || !should_retry(&err, ctx.is_pinned(), remaining) {
            break err;
        }
        log::warn!(
            "event=relay_retry attempt={} channel_id={} status={} code={}",
            attempt,
            ctx.attempted_channels.last().copied().unwrap_or(0),
            err.status_code,
            err.code
        );
        attempt += 1;
    };

    record_relay_error(deps.ledger.as_ref(), &config, &ctx, &err);
    if let Some(reservation) = reservation.take() {
        reservation.release();
    }
    log_chain(&ctx, "failed");
    Err(err)
}

fn run_attempt(
    deps: &RelayDeps,
    config: &Arc<RelayConfig>,
    ctx: &mut RequestContext,
    reservation: &mut Option<QuotaReservation>,
    attempt: u32,
) -> Result<AttemptOutcome, RelayError> {
    let selected = select_channel(
        deps.registry.as_ref(),
        config,
        &ctx.request,
        attempt,
        &ctx.attempted_channels,
    )?;
    ctx.record_attempt(selected.clone());

    let price = price_for(
        config,
        &ctx.model,
        &ctx.group,
        &selected.channel,
        selected.ability.as_ref(),
    );
    ctx.price = Some(price.clone());
    if reservation.is_none() {
        let held = QuotaReservation::reserve(
            deps.ledger.clone(),
            ctx.request.user_id,
            estimate_quota(config, &price),
        )?;
        ctx.reserved_quota = held.amount();
        *reservation = Some(held);
    }

    let mut adapter = deps
        .adapters
        .create(selected.channel.provider_type)
        .ok_or_else(|| {
            RelayError::local(
                "adapter_missing",
                format!(
                    "no adapter registered for provider type {}",
                    selected.channel.provider_type
                ),
            )
        })?;
    adapter.init(channel_context(deps, config, ctx, &selected)?)?;

    if adapter.plan(&ctx.request) == DispatchPlan::Deferred {
        let backend = adapter.task_backend(&ctx.request)?;
        let Some(held) = reservation.take() else {
            return Err(RelayError::local("reservation_missing", "quota reservation lost"));
        };
        let submission = deps.tasks.submit(
            TaskLaunch {
                user_id: ctx.request.user_id,
                channel_id: selected.channel_id(),
                platform: selected.channel.provider_type.to_string(),
                action: ctx.request.action.clone(),
                group: ctx.group.clone(),
                model: ctx.model.clone(),
                price,
                backend,
            },
            held,
        )?;
        return Ok(AttemptOutcome::Submitted(submission));
    }

    let dispatched = adapter
        .build_request(&ctx.request)
        .and_then(|request| adapter.execute(request))
        .and_then(|response| adapter.parse_response(response));
    let result = match dispatched {
        Ok(result) => result,
        Err(err) => {
            report_failure(deps, &selected, &err);
            return Err(err);
        }
    };
    deps.registry.report_success(selected.channel_id());

    let usage = config
        .usage_correction
        .apply(result.usage, &result.text)
        .map(|corrected| corrected.usage)
        .unwrap_or(result.usage);
    let mut quota = price.quota_for(&usage);
    let mut charged = true;
    if let Some(held) = reservation.take() {
        if let Err(err) = held.commit(quota) {
            log::warn!(
                "event=quota_commit_failed user_id={} channel_id={} quota={} err={}",
                ctx.request.user_id,
                selected.channel_id(),
                quota,
                err
            );
            quota = 0;
            charged = false;
        }
    }
    if charged {
        record_consumption(
            deps.ledger.as_ref(),
            ConsumptionEntry {
                user_id: ctx.request.user_id,
                channel_id: selected.channel_id(),
                model: &ctx.model,
                group: &ctx.group,
                quota,
                usage,
                price: &price,
                content: consumption_content(&price, ctx),
                extra: Some(json!({ "async": false })),
            },
        );
    }
    Ok(AttemptOutcome::Completed(RelayResponse {
        output: result.output,
        usage,
        quota,
        channel_id: selected.channel_id(),
        group: ctx.group.clone(),
        attempts: ctx.attempted_channels.clone(),
    }))
}

fn channel_context(
    deps: &RelayDeps,
    config: &Arc<RelayConfig>,
    ctx: &RequestContext,
    selected: &SelectedChannel,
) -> Result<ChannelContext, RelayError> {
    let base_url = selected.channel.base_url.trim();
    if let Err(err) = url::Url::parse(base_url) {
        return Err(RelayError::channel(
            502,
            "channel_base_url_invalid",
            format!("channel {} base url {base_url:?} is invalid: {err}", selected.channel_id()),
        ));
    }
    let settings = ChannelSettings::parse(&selected.channel.settings);
    let http = match settings.proxy() {
        Some(proxy) => build_client(config, Some(proxy)).map_err(|err| {
            RelayError::channel(502, "channel_proxy_invalid", format!("build client failed: {err}"))
        })?,
        None => deps.http.clone(),
    };
    Ok(ChannelContext {
        channel: selected.channel.clone(),
        settings,
        credential: selected.credential.clone(),
        key_index: selected.key_index,
        group: ctx.group.clone(),
        model: ctx.model.clone(),
        config: config.clone(),
        http,
        tokens: deps.tokens.clone(),
    })
}

/// Health side effects for a failed dispatch. Channel faults are reported on a
/// detached thread so the retry loop never waits on storage.
fn report_failure(deps: &RelayDeps, selected: &SelectedChannel, err: &RelayError) {
    if err.is_channel_fault() {
        if err.status_code == 401 {
            deps.tokens.invalidate_channel(selected.channel_id());
        }
        let report = ChannelFaultReport {
            channel_id: selected.channel_id(),
            key_index: selected.is_multi_key().then_some(selected.key_index),
            status_code: err.status_code,
            message: err.message.clone(),
        };
        let registry = deps.registry.clone();
        let spawned = std::thread::Builder::new()
            .name("relay-channel-health".to_string())
            .spawn(move || registry.report_fault(&report));
        if let Err(spawn_err) = spawned {
            log::warn!(
                "event=channel_health_spawn_failed channel_id={} err={}",
                selected.channel_id(),
                spawn_err
            );
        }
        return;
    }
    if err.status_code == 429 || (500..600).contains(&err.status_code) {
        deps.registry
            .mark_cooling_down(selected.channel_id(), err.status_code);
    }
}

fn consumption_content(price: &PriceData, ctx: &RequestContext) -> String {
    if price.is_flat() {
        format!("per-call price, group {}", ctx.display_group())
    } else {
        format!(
            "model ratio {:.2}, group {} ratio {:.2}",
            price.model_ratio,
            ctx.display_group(),
            price.group_ratio
        )
    }
}

fn log_chain(ctx: &RequestContext, outcome: &str) {
    if ctx.attempted_channels.len() > 1 {
        log::info!(
            "event=relay_retry_chain user_id={} model={} group={} outcome={} chain={}",
            ctx.request.user_id,
            ctx.model,
            ctx.display_group(),
            outcome,
            ctx.channel_chain()
        );
    }
}
