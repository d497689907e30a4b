use rusqlite::{Connection, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::task::TaskStatus;

mod abilities;
mod channels;
mod logs;
mod tasks;
mod users;

pub const CHANNEL_STATUS_ENABLED: i64 = 1;
pub const CHANNEL_STATUS_MANUALLY_DISABLED: i64 = 2;
pub const CHANNEL_STATUS_AUTO_DISABLED: i64 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub provider_type: i64,
    pub base_url: String,
    /// Credential pool, one key per line.
    pub keys: String,
    /// `polling` or `random`.
    pub multi_key_mode: String,
    pub disabled_key_indexes: Vec<usize>,
    pub status: i64,
    pub auto_ban: bool,
    pub channel_ratio: f64,
    pub used_quota: i64,
    /// Free-form JSON settings (auth type, proxy, oauth config).
    pub settings: String,
    pub created_at: i64,
}

impl Channel {
    pub fn key_list(&self) -> Vec<&str> {
        self.keys
            .split('\n')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .collect()
    }

    pub fn is_multi_key(&self) -> bool {
        self.key_list().len() > 1
    }

    pub fn is_enabled(&self) -> bool {
        self.status == CHANNEL_STATUS_ENABLED
    }

    pub fn is_key_disabled(&self, index: usize) -> bool {
        self.disabled_key_indexes.contains(&index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ability {
    pub group_name: String,
    pub model: String,
    pub channel_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub weight: u32,
    /// Flat per-call price override for this (group, model, channel).
    pub workflow_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub group_name: String,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: i64,
    pub task_id: String,
    pub user_id: i64,
    pub channel_id: i64,
    pub platform: String,
    pub action: String,
    pub group_name: String,
    pub model: String,
    pub status: TaskStatus,
    pub progress: String,
    /// Opaque JSON payload owned by the worker (output, usage, upstream ids).
    pub data: String,
    pub quota: i64,
    /// Quota held by the submitting request and handed to the task.
    pub reserved_quota: i64,
    pub settled: bool,
    pub submit_time: i64,
    pub start_time: i64,
    pub finish_time: i64,
    pub fail_reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeLog {
    pub user_id: i64,
    pub channel_id: i64,
    pub model: String,
    pub group_name: String,
    pub quota: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub content: String,
    /// JSON pricing breakdown.
    pub other: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorLog {
    pub user_id: i64,
    pub token_id: Option<i64>,
    pub channel_id: i64,
    pub channel_name: String,
    pub channel_type: i64,
    pub model: String,
    pub group_name: String,
    pub status_code: i64,
    pub error_type: String,
    pub error_code: String,
    pub content: String,
    pub admin_info: String,
    pub created_at: i64,
}

pub struct Storage {
    conn: Connection,
}

pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

const MIGRATION_001_INIT: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    group_name TEXT NOT NULL DEFAULT 'default',
    quota INTEGER NOT NULL DEFAULT 0,
    used_quota INTEGER NOT NULL DEFAULT 0,
    request_count INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS channels (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    provider_type INTEGER NOT NULL,
    base_url TEXT NOT NULL,
    keys TEXT NOT NULL,
    multi_key_mode TEXT NOT NULL DEFAULT 'polling',
    disabled_key_indexes TEXT NOT NULL DEFAULT '[]',
    status INTEGER NOT NULL DEFAULT 1,
    auto_ban INTEGER NOT NULL DEFAULT 1,
    channel_ratio REAL NOT NULL DEFAULT 1.0,
    used_quota INTEGER NOT NULL DEFAULT 0,
    settings TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS abilities (
    group_name TEXT NOT NULL,
    model TEXT NOT NULL,
    channel_id INTEGER NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    priority INTEGER NOT NULL DEFAULT 0,
    weight INTEGER NOT NULL DEFAULT 0,
    workflow_price REAL,
    PRIMARY KEY (group_name, model, channel_id)
);
CREATE INDEX IF NOT EXISTS idx_abilities_channel ON abilities(channel_id);
";

const MIGRATION_002_TASKS: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL UNIQUE,
    user_id INTEGER NOT NULL,
    channel_id INTEGER NOT NULL,
    platform TEXT NOT NULL,
    action TEXT NOT NULL,
    group_name TEXT NOT NULL,
    model TEXT NOT NULL,
    status TEXT NOT NULL,
    progress TEXT NOT NULL DEFAULT '0%',
    data TEXT NOT NULL DEFAULT '{}',
    quota INTEGER NOT NULL DEFAULT 0,
    reserved_quota INTEGER NOT NULL DEFAULT 0,
    settled INTEGER NOT NULL DEFAULT 0,
    submit_time INTEGER NOT NULL,
    start_time INTEGER NOT NULL DEFAULT 0,
    finish_time INTEGER NOT NULL DEFAULT 0,
    fail_reason TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id, task_id);
";

const MIGRATION_003_LOGS: &str = "
CREATE TABLE IF NOT EXISTS consume_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    channel_id INTEGER NOT NULL,
    model TEXT NOT NULL,
    group_name TEXT NOT NULL,
    quota INTEGER NOT NULL,
    prompt_tokens INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    content TEXT NOT NULL DEFAULT '',
    other TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS error_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    token_id INTEGER,
    channel_id INTEGER NOT NULL,
    channel_name TEXT NOT NULL DEFAULT '',
    channel_type INTEGER NOT NULL DEFAULT 0,
    model TEXT NOT NULL DEFAULT '',
    group_name TEXT NOT NULL DEFAULT '',
    status_code INTEGER NOT NULL DEFAULT 0,
    error_type TEXT NOT NULL DEFAULT '',
    error_code TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL DEFAULT '',
    admin_info TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_consume_logs_user ON consume_logs(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_error_logs_channel ON error_logs(channel_id, created_at);
";

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
        )?;
        self.apply_migration("001_init", MIGRATION_001_INIT)?;
        self.apply_migration("002_tasks", MIGRATION_002_TASKS)?;
        self.apply_migration("003_logs", MIGRATION_003_LOGS)?;
        Ok(())
    }

    fn apply_migration(&self, version: &str, sql: &str) -> Result<()> {
        let applied: i64 = self.conn.query_row(
            "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
            [version],
            |row| row.get(0),
        )?;
        if applied > 0 {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            (version, now_ts()),
        )?;
        tx.commit()
    }
}

#[cfg(test)]
#[path = "../../tests/storage/migration_tests.rs"]
mod migration_tests;
