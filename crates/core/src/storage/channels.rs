use rusqlite::{OptionalExtension, Result, Row};

use super::{
    Channel, Storage, CHANNEL_STATUS_AUTO_DISABLED, CHANNEL_STATUS_ENABLED,
};

const CHANNEL_COLUMNS: &str = "id, name, provider_type, base_url, keys, multi_key_mode, disabled_key_indexes,
    status, auto_ban, channel_ratio, used_quota, settings, created_at";

impl Storage {
    pub fn insert_channel(&self, channel: &Channel) -> Result<()> {
        let disabled = encode_key_indexes(&channel.disabled_key_indexes);
        self.conn.execute(
            "INSERT INTO channels (id, name, provider_type, base_url, keys, multi_key_mode, disabled_key_indexes,
                status, auto_ban, channel_ratio, used_quota, settings, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                provider_type = excluded.provider_type,
                base_url = excluded.base_url,
                keys = excluded.keys,
                multi_key_mode = excluded.multi_key_mode,
                disabled_key_indexes = excluded.disabled_key_indexes,
                status = excluded.status,
                auto_ban = excluded.auto_ban,
                channel_ratio = excluded.channel_ratio,
                settings = excluded.settings",
            (
                channel.id,
                &channel.name,
                channel.provider_type,
                &channel.base_url,
                &channel.keys,
                &channel.multi_key_mode,
                disabled,
                channel.status,
                channel.auto_ban as i64,
                channel.channel_ratio,
                channel.used_quota,
                &channel.settings,
                channel.created_at,
            ),
        )?;
        Ok(())
    }

    pub fn find_channel(&self, id: i64) -> Result<Option<Channel>> {
        let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1");
        self.conn
            .query_row(&sql, [id], map_channel_row)
            .optional()
    }

    pub fn list_channels(&self) -> Result<Vec<Channel>> {
        let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(map_channel_row(row)?);
        }
        Ok(out)
    }

    /// Moves an enabled channel to `status`; returns false when it was not enabled,
    /// so concurrent disablers observe exactly one transition.
    pub fn disable_channel_if_enabled(&self, id: i64, status: i64) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE channels SET status = ?2 WHERE id = ?1 AND status = ?3",
            (id, status, CHANNEL_STATUS_ENABLED),
        )?;
        if changed > 0 {
            tx.execute("UPDATE abilities SET enabled = 0 WHERE channel_id = ?1", [id])?;
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Re-enables a channel only if the health mechanism disabled it;
    /// manual disables are left alone.
    pub fn enable_auto_disabled_channel(&self, id: i64) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE channels SET status = ?2, disabled_key_indexes = '[]' WHERE id = ?1 AND status = ?3",
            (id, CHANNEL_STATUS_ENABLED, CHANNEL_STATUS_AUTO_DISABLED),
        )?;
        if changed > 0 {
            tx.execute("UPDATE abilities SET enabled = 1 WHERE channel_id = ?1", [id])?;
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Marks one credential of a pool unusable. Returns `Some(all_disabled)` when
    /// the index was newly disabled, `None` when it already was (or is out of range).
    pub fn disable_channel_key(&self, id: i64, index: usize) -> Result<Option<bool>> {
        let tx = self.conn.unchecked_transaction()?;
        let current: Option<(String, String)> = tx
            .query_row(
                "SELECT keys, disabled_key_indexes FROM channels WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((keys, disabled_raw)) = current else {
            return Ok(None);
        };
        let key_count = keys
            .split('\n')
            .filter(|key| !key.trim().is_empty())
            .count();
        let mut disabled = decode_key_indexes(&disabled_raw);
        if index >= key_count || disabled.contains(&index) {
            return Ok(None);
        }
        disabled.push(index);
        disabled.sort_unstable();
        tx.execute(
            "UPDATE channels SET disabled_key_indexes = ?2 WHERE id = ?1",
            (id, encode_key_indexes(&disabled)),
        )?;
        tx.commit()?;
        Ok(Some(disabled.len() >= key_count))
    }

    pub fn add_channel_used_quota(&self, id: i64, quota: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE channels SET used_quota = used_quota + ?2 WHERE id = ?1",
            (id, quota),
        )?;
        Ok(())
    }
}

fn encode_key_indexes(indexes: &[usize]) -> String {
    serde_json::to_string(indexes).unwrap_or_else(|_| "[]".to_string())
}

fn decode_key_indexes(raw: &str) -> Vec<usize> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn map_channel_row(row: &Row<'_>) -> Result<Channel> {
    let disabled_raw: String = row.get(6)?;
    let auto_ban: i64 = row.get(8)?;
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        provider_type: row.get(2)?,
        base_url: row.get(3)?,
        keys: row.get(4)?,
        multi_key_mode: row.get(5)?,
        disabled_key_indexes: decode_key_indexes(&disabled_raw),
        status: row.get(7)?,
        auto_ban: auto_ban != 0,
        channel_ratio: row.get(9)?,
        used_quota: row.get(10)?,
        settings: row.get(11)?,
        created_at: row.get(12)?,
    })
}
