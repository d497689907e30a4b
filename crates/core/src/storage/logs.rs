use rusqlite::Result;

use super::{ConsumeLog, ErrorLog, Storage};

impl Storage {
    pub fn insert_consume_log(&self, log: &ConsumeLog) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO consume_logs (user_id, channel_id, model, group_name, quota, prompt_tokens,
                completion_tokens, content, other, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            (
                log.user_id,
                log.channel_id,
                &log.model,
                &log.group_name,
                log.quota,
                log.prompt_tokens,
                log.completion_tokens,
                &log.content,
                &log.other,
                log.created_at,
            ),
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_error_log(&self, log: &ErrorLog) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO error_logs (user_id, token_id, channel_id, channel_name, channel_type, model,
                group_name, status_code, error_type, error_code, content, admin_info, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                log.user_id,
                log.token_id,
                log.channel_id,
                &log.channel_name,
                log.channel_type,
                &log.model,
                &log.group_name,
                log.status_code,
                &log.error_type,
                &log.error_code,
                &log.content,
                &log.admin_info,
                log.created_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_consume_logs(&self, user_id: i64, limit: i64) -> Result<Vec<ConsumeLog>> {
        let normalized_limit = if limit <= 0 { 200 } else { limit.min(1000) };
        let mut stmt = self.conn.prepare(
            "SELECT user_id, channel_id, model, group_name, quota, prompt_tokens, completion_tokens,
                content, other, created_at
             FROM consume_logs
             WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query((user_id, normalized_limit))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ConsumeLog {
                user_id: row.get(0)?,
                channel_id: row.get(1)?,
                model: row.get(2)?,
                group_name: row.get(3)?,
                quota: row.get(4)?,
                prompt_tokens: row.get(5)?,
                completion_tokens: row.get(6)?,
                content: row.get(7)?,
                other: row.get(8)?,
                created_at: row.get(9)?,
            });
        }
        Ok(out)
    }

    pub fn list_error_logs(&self, limit: i64) -> Result<Vec<ErrorLog>> {
        let normalized_limit = if limit <= 0 { 200 } else { limit.min(1000) };
        let mut stmt = self.conn.prepare(
            "SELECT user_id, token_id, channel_id, channel_name, channel_type, model, group_name,
                status_code, error_type, error_code, content, admin_info, created_at
             FROM error_logs
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
        )?;
        let mut rows = stmt.query([normalized_limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ErrorLog {
                user_id: row.get(0)?,
                token_id: row.get(1)?,
                channel_id: row.get(2)?,
                channel_name: row.get(3)?,
                channel_type: row.get(4)?,
                model: row.get(5)?,
                group_name: row.get(6)?,
                status_code: row.get(7)?,
                error_type: row.get(8)?,
                error_code: row.get(9)?,
                content: row.get(10)?,
                admin_info: row.get(11)?,
                created_at: row.get(12)?,
            });
        }
        Ok(out)
    }
}
