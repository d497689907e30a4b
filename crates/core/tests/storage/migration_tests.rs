use super::Storage;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_db_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("relaygate-{name}-{}-{nanos}.db", process::id()))
}

fn migration_count(storage: &Storage, version: &str) -> i64 {
    storage
        .conn
        .query_row(
            "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
            [version],
            |row| row.get(0),
        )
        .expect("count migration")
}

#[test]
fn init_tracks_schema_migrations_and_is_idempotent() {
    let storage = Storage::open_in_memory().expect("open in memory");
    storage.init().expect("first init");
    storage.init().expect("second init");

    for version in ["001_init", "002_tasks", "003_logs"] {
        assert_eq!(migration_count(&storage, version), 1, "{version}");
    }
}

#[test]
fn file_backed_storage_keeps_schema_across_reopen() {
    let path = temp_db_path("reopen");
    {
        let storage = Storage::open(&path).expect("open file");
        storage.init().expect("init");
    }
    let storage = Storage::open(&path).expect("reopen file");
    storage.init().expect("init again");
    assert_eq!(migration_count(&storage, "001_init"), 1);

    let tables: i64 = storage
        .conn
        .query_row(
            "SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'channels', 'abilities', 'tasks', 'consume_logs', 'error_logs')",
            [],
            |row| row.get(0),
        )
        .expect("count tables");
    assert_eq!(tables, 6);

    drop(storage);
    let _ = fs::remove_file(&path);
}
