use rusqlite::{Result, Row};

use super::{Ability, Storage, CHANNEL_STATUS_ENABLED};

impl Storage {
    pub fn insert_ability(&self, ability: &Ability) -> Result<()> {
        self.conn.execute(
            "INSERT INTO abilities (group_name, model, channel_id, enabled, priority, weight, workflow_price)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(group_name, model, channel_id) DO UPDATE SET
                enabled = excluded.enabled,
                priority = excluded.priority,
                weight = excluded.weight,
                workflow_price = excluded.workflow_price",
            (
                &ability.group_name,
                &ability.model,
                ability.channel_id,
                ability.enabled as i64,
                ability.priority,
                ability.weight as i64,
                ability.workflow_price,
            ),
        )?;
        Ok(())
    }

    /// Enabled abilities for (group, model) whose channel is enabled,
    /// highest priority first.
    pub fn list_enabled_abilities(&self, group: &str, model: &str) -> Result<Vec<Ability>> {
        let mut stmt = self.conn.prepare(
            "SELECT a.group_name, a.model, a.channel_id, a.enabled, a.priority, a.weight, a.workflow_price
             FROM abilities a
             JOIN channels c ON c.id = a.channel_id
             WHERE a.group_name = ?1 AND a.model = ?2 AND a.enabled = 1 AND c.status = ?3
             ORDER BY a.priority DESC, a.channel_id ASC",
        )?;
        let mut rows = stmt.query((group, model, CHANNEL_STATUS_ENABLED))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(map_ability_row(row)?);
        }
        Ok(out)
    }

    pub fn find_ability(&self, group: &str, model: &str, channel_id: i64) -> Result<Option<Ability>> {
        let mut stmt = self.conn.prepare(
            "SELECT group_name, model, channel_id, enabled, priority, weight, workflow_price
             FROM abilities
             WHERE group_name = ?1 AND model = ?2 AND channel_id = ?3",
        )?;
        let mut rows = stmt.query((group, model, channel_id))?;
        match rows.next()? {
            Some(row) => Ok(Some(map_ability_row(row)?)),
            None => Ok(None),
        }
    }
}

fn map_ability_row(row: &Row<'_>) -> Result<Ability> {
    let enabled: i64 = row.get(3)?;
    let weight: i64 = row.get(5)?;
    Ok(Ability {
        group_name: row.get(0)?,
        model: row.get(1)?,
        channel_id: row.get(2)?,
        enabled: enabled != 0,
        priority: row.get(4)?,
        weight: weight.max(0) as u32,
        workflow_price: row.get(6)?,
    })
}
