use rusqlite::{OptionalExtension, Result, Row};

use super::{Storage, Task};
use crate::task::TaskStatus;

const TASK_COLUMNS: &str = "id, task_id, user_id, channel_id, platform, action, group_name, model, status,
    progress, data, quota, reserved_quota, settled, submit_time, start_time, finish_time, fail_reason";

impl Storage {
    pub fn insert_task(&self, task: &Task) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO tasks (task_id, user_id, channel_id, platform, action, group_name, model, status,
                progress, data, quota, reserved_quota, settled, submit_time, start_time, finish_time, fail_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            rusqlite::params![
                &task.task_id,
                task.user_id,
                task.channel_id,
                &task.platform,
                &task.action,
                &task.group_name,
                &task.model,
                task.status.as_str(),
                &task.progress,
                &task.data,
                task.quota,
                task.reserved_quota,
                task.settled as i64,
                task.submit_time,
                task.start_time,
                task.finish_time,
                &task.fail_reason,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Writes the mutable fields of a task. Rows already in a terminal status are
    /// left untouched and `false` is returned. The settlement flag is never written here.
    pub fn update_task(&self, task: &Task) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE tasks SET
                status = ?2,
                progress = ?3,
                data = ?4,
                quota = ?5,
                start_time = ?6,
                finish_time = ?7,
                fail_reason = ?8
             WHERE id = ?1 AND status NOT IN ('SUCCESS', 'FAILURE')",
            rusqlite::params![
                task.id,
                task.status.as_str(),
                &task.progress,
                &task.data,
                task.quota,
                task.start_time,
                task.finish_time,
                &task.fail_reason,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Flips the settlement flag; only the first caller for a task gets `true`.
    pub fn claim_task_settlement(&self, id: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE tasks SET settled = 1 WHERE id = ?1 AND settled = 0",
            [id],
        )?;
        Ok(changed > 0)
    }

    pub fn find_task(&self, task_id: &str) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1");
        self.conn.query_row(&sql, [task_id], map_task_row).optional()
    }

    pub fn find_user_task(&self, user_id: i64, task_id: &str) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ?1 AND task_id = ?2");
        self.conn
            .query_row(&sql, (user_id, task_id), map_task_row)
            .optional()
    }
}

fn map_task_row(row: &Row<'_>) -> Result<Task> {
    let status_raw: String = row.get(8)?;
    let status = TaskStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("unknown task status: {status_raw}").into(),
        )
    })?;
    let settled: i64 = row.get(13)?;
    Ok(Task {
        id: row.get(0)?,
        task_id: row.get(1)?,
        user_id: row.get(2)?,
        channel_id: row.get(3)?,
        platform: row.get(4)?,
        action: row.get(5)?,
        group_name: row.get(6)?,
        model: row.get(7)?,
        status,
        progress: row.get(9)?,
        data: row.get(10)?,
        quota: row.get(11)?,
        reserved_quota: row.get(12)?,
        settled: settled != 0,
        submit_time: row.get(14)?,
        start_time: row.get(15)?,
        finish_time: row.get(16)?,
        fail_reason: row.get(17)?,
    })
}
