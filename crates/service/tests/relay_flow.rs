mod support;

use relaygate_core::storage::{CHANNEL_STATUS_AUTO_DISABLED, CHANNEL_STATUS_ENABLED};
use relaygate_service::adapter::PROVIDER_OPENAI_COMPATIBLE;
use relaygate_service::collaborators::ChannelRegistry;
use relaygate_service::relay::selection::select_channel;
use relaygate_service::{FaultKind, RelayConfig, RelayOutcome, RelayRequest};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use support::{
    add_channel, balance, channel, engine, engine_with_ledger, open_store, spawn_upstream,
    test_config, wait_until, SettleRejectingLedger, START_BALANCE, USER_ID,
};

const MODEL: &str = "m1";

fn chat_request() -> RelayRequest {
    RelayRequest::new(
        USER_ID,
        "default",
        MODEL,
        json!({"messages": [{"role": "user", "content": "hi"}]}),
    )
}

fn chat_completion(prompt: i64, completion: i64) -> String {
    json!({
        "choices": [{"message": {"role": "assistant", "content": "hello"}}],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion
        }
    })
    .to_string()
}

#[test]
fn selection_stays_in_top_tier_until_it_is_disabled() {
    let (store, config) = open_store(test_config());
    add_channel(&store, channel(1, PROVIDER_OPENAI_COMPATIBLE, "http://a"), MODEL, 10, 1);
    add_channel(&store, channel(2, PROVIDER_OPENAI_COMPATIBLE, "http://b"), MODEL, 10, 1);
    add_channel(&store, channel(3, PROVIDER_OPENAI_COMPATIBLE, "http://c"), MODEL, 5, 1);
    let snapshot = config.snapshot();
    let request = chat_request();

    let mut seen = HashSet::new();
    for _ in 0..200 {
        let selected = select_channel(store.as_ref(), &snapshot, &request, 0, &[]).expect("select");
        seen.insert(selected.channel.id);
    }
    assert!(!seen.contains(&3));
    assert!(seen.contains(&1) && seen.contains(&2));

    assert!(store.disable_channel(1, "maintenance").expect("disable a"));
    for _ in 0..20 {
        let selected = select_channel(store.as_ref(), &snapshot, &request, 0, &[]).expect("select");
        assert_eq!(selected.channel.id, 2);
    }

    assert!(store.disable_channel(2, "maintenance").expect("disable b"));
    let selected = select_channel(store.as_ref(), &snapshot, &request, 0, &[]).expect("select");
    assert_eq!(selected.channel.id, 3);
    assert_eq!(selected.resolved_group, "default");
}

#[test]
fn commit_refunds_or_debits_against_the_reservation() {
    let calls = AtomicUsize::new(0);
    let upstream = spawn_upstream(move |_, _, _| {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            (200, chat_completion(100, 330))
        } else {
            (200, chat_completion(200, 360))
        }
    });
    let (store, config) = open_store(test_config());
    add_channel(&store, channel(1, PROVIDER_OPENAI_COMPATIBLE, &upstream.base_url), MODEL, 0, 1);
    let engine = engine(&store, &config);

    let RelayOutcome::Completed(first) = engine.relay(chat_request()).expect("first relay") else {
        panic!("expected a synchronous completion");
    };
    assert_eq!(first.quota, 430);
    assert_eq!(balance(&store), START_BALANCE - 430);

    let RelayOutcome::Completed(second) = engine.relay(chat_request()).expect("second relay") else {
        panic!("expected a synchronous completion");
    };
    assert_eq!(second.quota, 560);
    assert_eq!(balance(&store), START_BALANCE - 430 - 560);

    let logs = store
        .storage()
        .list_consume_logs(USER_ID, 10)
        .expect("consume logs");
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|log| log.other.contains("\"channel_ratio\"")));
}

#[test]
fn refused_commit_returns_the_hold_and_logs_no_consumption() {
    let upstream = spawn_upstream(|_, _, _| (200, chat_completion(100, 330)));
    let (store, config) = open_store(test_config());
    add_channel(&store, channel(1, PROVIDER_OPENAI_COMPATIBLE, &upstream.base_url), MODEL, 0, 1);
    let ledger = Arc::new(SettleRejectingLedger {
        store: store.clone(),
    });
    let engine = engine_with_ledger(&store, &config, ledger);

    let RelayOutcome::Completed(response) = engine.relay(chat_request()).expect("relay") else {
        panic!("expected a synchronous completion");
    };
    assert_eq!(response.quota, 0);
    assert_eq!(balance(&store), START_BALANCE);
    assert!(store
        .storage()
        .list_consume_logs(USER_ID, 10)
        .expect("consume logs")
        .is_empty());
}

#[test]
fn channel_fault_fails_over_to_the_next_channel() {
    let broken = spawn_upstream(|_, _, _| (401, r#"{"error":{"message":"invalid api key"}}"#.to_string()));
    let healthy = spawn_upstream(|_, _, _| (200, chat_completion(10, 20)));
    let (store, config) = open_store(test_config());
    add_channel(&store, channel(1, PROVIDER_OPENAI_COMPATIBLE, &broken.base_url), MODEL, 10, 1);
    add_channel(&store, channel(2, PROVIDER_OPENAI_COMPATIBLE, &healthy.base_url), MODEL, 5, 1);
    let engine = engine(&store, &config);

    let RelayOutcome::Completed(response) = engine.relay(chat_request()).expect("relay") else {
        panic!("expected a synchronous completion");
    };
    assert_eq!(response.attempts, vec![1, 2]);
    assert_eq!(response.channel_id, 2);
    assert_eq!(response.quota, 30);
    assert_eq!(balance(&store), START_BALANCE - 30);
    assert!(wait_until(Duration::from_secs(3), || {
        store
            .get_channel(1)
            .ok()
            .flatten()
            .is_some_and(|channel| channel.status == CHANNEL_STATUS_AUTO_DISABLED)
    }));
}

#[test]
fn pinned_channel_fault_is_reported_but_not_reselected() {
    let broken = spawn_upstream(|_, _, _| (401, r#"{"error":{"message":"invalid api key"}}"#.to_string()));
    let spare = spawn_upstream(|_, _, _| (200, chat_completion(10, 20)));
    let (store, config) = open_store(test_config());
    add_channel(&store, channel(1, PROVIDER_OPENAI_COMPATIBLE, &broken.base_url), MODEL, 10, 1);
    add_channel(&store, channel(2, PROVIDER_OPENAI_COMPATIBLE, &spare.base_url), MODEL, 10, 1);
    let engine = engine(&store, &config);

    let mut request = chat_request();
    request.specific_channel_id = Some(1);
    let err = engine.relay(request).expect_err("pinned fault");
    assert_eq!(err.kind, FaultKind::Channel);
    assert!(err.skip_retry);
    assert_eq!(broken.hit_count(), 1);
    assert_eq!(spare.hit_count(), 0);
    assert_eq!(balance(&store), START_BALANCE);

    assert!(wait_until(Duration::from_secs(3), || {
        store
            .get_channel(1)
            .ok()
            .flatten()
            .is_some_and(|channel| channel.status == CHANNEL_STATUS_AUTO_DISABLED)
    }));
    let errors = store.storage().list_error_logs(10).expect("error logs");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].channel_id, 1);
    assert_eq!(errors[0].error_type, "channel_error");
    assert!(!errors[0].content.contains("sk-test-1"));
}

#[test]
fn retries_stop_at_the_configured_attempt_cap() {
    let upstream = spawn_upstream(|_, _, _| (500, r#"{"error":{"message":"upstream exploded"}}"#.to_string()));
    let (store, config) = open_store(RelayConfig {
        retry_times: 2,
        ..test_config()
    });
    for id in 1..=4 {
        add_channel(&store, channel(id, PROVIDER_OPENAI_COMPATIBLE, &upstream.base_url), MODEL, 0, 1);
    }
    let engine = engine(&store, &config);

    let err = engine.relay(chat_request()).expect_err("all attempts fail");
    assert_eq!(err.status_code, 500);
    assert_eq!(upstream.hit_count(), 3);
    assert_eq!(balance(&store), START_BALANCE);
    for id in 1..=4 {
        let channel = store.get_channel(id).expect("get").expect("exists");
        assert_eq!(channel.status, CHANNEL_STATUS_ENABLED);
    }
}

#[test]
fn client_errors_are_never_retried() {
    let first = spawn_upstream(|_, _, _| (400, r#"{"error":{"message":"bad messages"}}"#.to_string()));
    let second = spawn_upstream(|_, _, _| (200, chat_completion(1, 1)));
    let (store, config) = open_store(test_config());
    add_channel(&store, channel(1, PROVIDER_OPENAI_COMPATIBLE, &first.base_url), MODEL, 10, 1);
    add_channel(&store, channel(2, PROVIDER_OPENAI_COMPATIBLE, &second.base_url), MODEL, 5, 1);
    let engine = engine(&store, &config);

    let err = engine.relay(chat_request()).expect_err("client error");
    assert_eq!(err.status_code, 400);
    assert_eq!(err.normalized().message, "upstream status 400: bad messages");
    assert_eq!(first.hit_count(), 1);
    assert_eq!(second.hit_count(), 0);
    assert_eq!(balance(&store), START_BALANCE);
}

#[test]
fn insufficient_balance_aborts_before_dispatch() {
    let upstream = spawn_upstream(|_, _, _| (200, chat_completion(1, 1)));
    let (store, config) = open_store(RelayConfig {
        pre_consumed_quota: START_BALANCE + 1,
        ..test_config()
    });
    add_channel(&store, channel(1, PROVIDER_OPENAI_COMPATIBLE, &upstream.base_url), MODEL, 0, 1);
    let engine = engine(&store, &config);

    let err = engine.relay(chat_request()).expect_err("insufficient quota");
    assert_eq!(err.kind, FaultKind::Ledger);
    assert_eq!(upstream.hit_count(), 0);
    assert_eq!(balance(&store), START_BALANCE);
    assert!(store.storage().list_error_logs(10).expect("error logs").is_empty());
}

#[test]
fn unknown_model_is_a_capacity_fault() {
    let (store, config) = open_store(test_config());
    let engine = engine(&store, &config);
    let err = engine
        .relay(RelayRequest::new(USER_ID, "default", "missing-model", json!({})))
        .expect_err("no channel");
    assert_eq!(err.kind, FaultKind::Capacity);
    assert_eq!(err.code, "no_available_channel");
    assert_eq!(balance(&store), START_BALANCE);
}
