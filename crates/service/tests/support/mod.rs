#![allow(dead_code)]

use relaygate_core::storage::{
    now_ts, Ability, Channel, ConsumeLog, ErrorLog, User, CHANNEL_STATUS_ENABLED,
};
use relaygate_service::collaborators::QuotaLedger;
use relaygate_service::{ConfigStore, RelayConfig, RelayEngine, SqliteStore};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const USER_ID: i64 = 7;
pub const START_BALANCE: i64 = 10_000;

pub struct MockUpstream {
    pub base_url: String,
    pub hits: Arc<AtomicUsize>,
}

impl MockUpstream {
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Local upstream answering every request with `handler(method, url, body)`.
pub fn spawn_upstream<F>(handler: F) -> MockUpstream
where
    F: Fn(&str, &str, &str) -> (u16, String) + Send + 'static,
{
    let server = tiny_http::Server::http("127.0.0.1:0").expect("bind mock upstream");
    let addr = server.server_addr().to_ip().expect("mock upstream addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    std::thread::spawn(move || {
        for mut request in server.incoming_requests() {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut body = String::new();
            let _ = request.as_reader().read_to_string(&mut body);
            let method = request.method().to_string();
            let url = request.url().to_string();
            let (status, payload) = handler(&method, &url, &body);
            let content_type = if payload.starts_with("event:") {
                "text/event-stream"
            } else {
                "application/json"
            };
            let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes())
                .expect("content type header");
            let response = tiny_http::Response::from_string(payload)
                .with_status_code(status)
                .with_header(header);
            let _ = request.respond(response);
        }
    });
    MockUpstream {
        base_url: format!("http://{addr}"),
        hits,
    }
}

pub fn test_config() -> RelayConfig {
    RelayConfig {
        upstream_connect_timeout: Duration::from_secs(2),
        status_timeout: Duration::from_secs(2),
        dispatch_timeout: Duration::from_secs(5),
        task_workers: 2,
        task_poll_interval: Duration::from_millis(20),
        task_max_wait: Duration::from_secs(5),
        ..RelayConfig::default()
    }
}

pub fn open_store(config: RelayConfig) -> (Arc<SqliteStore>, Arc<ConfigStore>) {
    let config = Arc::new(ConfigStore::new(config));
    let store = Arc::new(SqliteStore::open_in_memory(config.clone()).expect("open store"));
    store
        .storage()
        .insert_user(&User {
            id: USER_ID,
            group_name: "default".to_string(),
            quota: START_BALANCE,
            used_quota: 0,
            request_count: 0,
        })
        .expect("insert user");
    (store, config)
}

pub fn engine(store: &Arc<SqliteStore>, config: &Arc<ConfigStore>) -> RelayEngine {
    RelayEngine::with_sqlite(store.clone(), config.clone()).expect("build engine")
}

/// Engine whose ledger is `ledger` while channels and tasks stay on `store`.
pub fn engine_with_ledger(
    store: &Arc<SqliteStore>,
    config: &Arc<ConfigStore>,
    ledger: Arc<dyn QuotaLedger>,
) -> RelayEngine {
    RelayEngine::new(store.clone(), ledger, store.clone(), config.clone()).expect("build engine")
}

/// SQLite-backed ledger that refuses every settlement.
pub struct SettleRejectingLedger {
    pub store: Arc<SqliteStore>,
}

impl QuotaLedger for SettleRejectingLedger {
    fn reserve(&self, user_id: i64, amount: i64) -> Result<bool, String> {
        self.store.reserve(user_id, amount)
    }

    fn settle(&self, _user_id: i64, _reserved: i64, _actual: i64) -> Result<(), String> {
        Err("ledger unavailable".to_string())
    }

    fn release(&self, user_id: i64, reserved: i64) -> Result<(), String> {
        self.store.release(user_id, reserved)
    }

    fn record_consumption(&self, entry: &ConsumeLog) -> Result<(), String> {
        self.store.record_consumption(entry)
    }

    fn update_usage_counters(&self, user_id: i64, channel_id: i64, amount: i64) -> Result<(), String> {
        self.store.update_usage_counters(user_id, channel_id, amount)
    }

    fn record_error(&self, entry: &ErrorLog) -> Result<(), String> {
        self.store.record_error(entry)
    }
}

pub fn channel(id: i64, provider_type: i64, base_url: &str) -> Channel {
    Channel {
        id,
        name: format!("channel-{id}"),
        provider_type,
        base_url: base_url.to_string(),
        keys: format!("sk-test-{id}"),
        multi_key_mode: "polling".to_string(),
        disabled_key_indexes: Vec::new(),
        status: CHANNEL_STATUS_ENABLED,
        auto_ban: true,
        channel_ratio: 1.0,
        used_quota: 0,
        settings: String::new(),
        created_at: now_ts(),
    }
}

pub fn add_channel(store: &SqliteStore, channel: Channel, model: &str, priority: i64, weight: u32) {
    let storage = store.storage();
    storage.insert_channel(&channel).expect("insert channel");
    storage
        .insert_ability(&Ability {
            group_name: "default".to_string(),
            model: model.to_string(),
            channel_id: channel.id,
            enabled: true,
            priority,
            weight,
            workflow_price: None,
        })
        .expect("insert ability");
}

pub fn balance(store: &SqliteStore) -> i64 {
    store
        .storage()
        .user_quota(USER_ID)
        .expect("read quota")
        .expect("user exists")
}

pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}
