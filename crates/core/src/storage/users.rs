use rusqlite::{OptionalExtension, Result};

use super::{Storage, User};

impl Storage {
    pub fn insert_user(&self, user: &User) -> Result<()> {
        self.conn.execute(
            "INSERT INTO users (id, group_name, quota, used_quota, request_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                user.id,
                &user.group_name,
                user.quota,
                user.used_quota,
                user.request_count,
            ),
        )?;
        Ok(())
    }

    pub fn find_user(&self, id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, group_name, quota, used_quota, request_count FROM users WHERE id = ?1",
                [id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        group_name: row.get(1)?,
                        quota: row.get(2)?,
                        used_quota: row.get(3)?,
                        request_count: row.get(4)?,
                    })
                },
            )
            .optional()
    }

    pub fn user_quota(&self, id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT quota FROM users WHERE id = ?1", [id], |row| row.get(0))
            .optional()
    }

    /// Debits `amount` only if the balance covers it. Single statement so concurrent
    /// reservations from the same user can never overdraw.
    pub fn reserve_user_quota(&self, id: i64, amount: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE users SET quota = quota - ?2 WHERE id = ?1 AND quota >= ?2",
            (id, amount),
        )?;
        Ok(changed > 0)
    }

    /// Applies a signed delta: positive refunds, negative debits.
    pub fn adjust_user_quota(&self, id: i64, delta: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE users SET quota = quota + ?2 WHERE id = ?1",
            (id, delta),
        )?;
        Ok(())
    }

    pub fn add_user_used_quota(&self, id: i64, quota: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE users SET used_quota = used_quota + ?2, request_count = request_count + 1 WHERE id = ?1",
            (id, quota),
        )?;
        Ok(())
    }
}
