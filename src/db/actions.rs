use super::{invalid_value, parse_opt_time, ts, Database};
use crate::errors::{EngineError, EngineResult};
use crate::models::{ActionConfig, RiskLevel, SaveActionConfigPayload};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

const ACTION_COLUMNS: &str = "id, project_id, action_key, agent_scope, is_enabled, requires_approval,
     auto_approve_low_risk, risk_level, max_per_day, max_per_hour, cooldown_minutes, times_used_today,
     times_used_this_hour, hour_window_start, times_used_total, last_used_at, last_reset_at, version";

/// Result of a gate evaluation: the value handed back to the caller and, when the
/// usage counters moved, the config carrying the new counter values.
#[derive(Debug)]
pub struct GateWrite<T> {
    pub outcome: T,
    pub counters: Option<ActionConfig>,
}

impl Database {
    /// Admin upsert keyed by (project, action, agent scope). Usage counters survive.
    pub fn save_action_config(&self, payload: &SaveActionConfigPayload) -> EngineResult<ActionConfig> {
        let scope = payload.agent_slug.clone().unwrap_or_default();
        let now = ts(Utc::now());
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO action_configs (
               id, project_id, action_key, agent_scope, is_enabled, requires_approval,
               auto_approve_low_risk, risk_level, max_per_day, max_per_hour, cooldown_minutes,
               created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
             ON CONFLICT(project_id, action_key, agent_scope) DO UPDATE SET
               is_enabled = excluded.is_enabled,
               requires_approval = excluded.requires_approval,
               auto_approve_low_risk = excluded.auto_approve_low_risk,
               risk_level = excluded.risk_level,
               max_per_day = excluded.max_per_day,
               max_per_hour = excluded.max_per_hour,
               cooldown_minutes = excluded.cooldown_minutes,
               version = version + 1,
               updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                payload.project_id,
                payload.action_key,
                scope,
                payload.is_enabled,
                payload.requires_approval,
                payload.auto_approve_low_risk,
                payload.risk_level.as_str(),
                payload.max_per_day,
                payload.max_per_hour,
                payload.cooldown_minutes,
                now,
            ],
        )?;

        let query = format!(
            "SELECT {} FROM action_configs WHERE project_id = ?1 AND action_key = ?2 AND agent_scope = ?3",
            ACTION_COLUMNS
        );
        conn.query_row(&query, params![payload.project_id, payload.action_key, scope], parse_action_row)
            .map_err(EngineError::from)
    }

    /// Exact lookup; `agent_slug = None` reads the agent-agnostic row.
    pub fn get_action_config(
        &self,
        project_id: &str,
        action_key: &str,
        agent_slug: Option<&str>,
    ) -> EngineResult<Option<ActionConfig>> {
        let conn = self.lock()?;
        let query = format!(
            "SELECT {} FROM action_configs WHERE project_id = ?1 AND action_key = ?2 AND agent_scope = ?3",
            ACTION_COLUMNS
        );
        conn.query_row(
            &query,
            params![project_id, action_key, agent_slug.unwrap_or_default()],
            parse_action_row,
        )
        .optional()
        .map_err(EngineError::from)
    }

    pub fn list_action_configs(&self, project_id: &str) -> EngineResult<Vec<ActionConfig>> {
        let conn = self.lock()?;
        let query = format!(
            "SELECT {} FROM action_configs WHERE project_id = ?1 ORDER BY action_key ASC, agent_scope ASC",
            ACTION_COLUMNS
        );
        let mut statement = conn.prepare(&query)?;
        let rows = statement
            .query_map([project_id], parse_action_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Runs one gate decision under a write lock. The config is resolved agent-specific
    /// first, then agent-agnostic; `decide` sees it and returns the outcome plus any
    /// counter changes, which are written only if the row version is unchanged.
    pub fn apply_gate<T, F>(
        &self,
        project_id: &str,
        action_key: &str,
        agent_slug: &str,
        decide: F,
    ) -> EngineResult<T>
    where
        F: FnOnce(Option<&ActionConfig>) -> GateWrite<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let config = resolve_action_config(&tx, project_id, action_key, agent_slug)?;
        let write = decide(config.as_ref());

        if let (Some(current), Some(updated)) = (config.as_ref(), write.counters.as_ref()) {
            let changed = tx.execute(
                "UPDATE action_configs SET
                   times_used_today = ?1, times_used_this_hour = ?2, hour_window_start = ?3,
                   times_used_total = ?4, last_used_at = ?5, last_reset_at = ?6,
                   version = version + 1, updated_at = ?7
                 WHERE id = ?8 AND version = ?9",
                params![
                    updated.times_used_today,
                    updated.times_used_this_hour,
                    updated.hour_window_start.map(ts),
                    updated.times_used_total,
                    updated.last_used_at.map(ts),
                    updated.last_reset_at.map(ts),
                    ts(Utc::now()),
                    current.id,
                    current.version,
                ],
            )?;
            if changed == 0 {
                return Err(EngineError::Conflict(format!(
                    "action config '{}' changed during evaluation",
                    current.id
                )));
            }
        }
        tx.commit()?;
        Ok(write.outcome)
    }

    /// Zeroes `times_used_today` for every config whose last reset falls on an earlier
    /// UTC day. Running it again on the same day changes nothing.
    pub fn reset_daily_action_counters(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let today = now.format("%Y-%m-%d").to_string();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE action_configs
             SET times_used_today = 0, last_reset_at = ?1, version = version + 1, updated_at = ?1
             WHERE last_reset_at IS NULL OR substr(last_reset_at, 1, 10) < ?2",
            params![ts(now), today],
        )?;
        Ok(changed)
    }
}

fn resolve_action_config(
    conn: &Connection,
    project_id: &str,
    action_key: &str,
    agent_slug: &str,
) -> EngineResult<Option<ActionConfig>> {
    let query = format!(
        "SELECT {} FROM action_configs
         WHERE project_id = ?1 AND action_key = ?2 AND agent_scope IN (?3, '')
         ORDER BY agent_scope = '' ASC LIMIT 1",
        ACTION_COLUMNS
    );
    conn.query_row(&query, params![project_id, action_key, agent_slug], parse_action_row)
        .optional()
        .map_err(EngineError::from)
}

fn parse_action_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionConfig> {
    let scope: String = row.get(3)?;
    Ok(ActionConfig {
        id: row.get(0)?,
        project_id: row.get(1)?,
        action_key: row.get(2)?,
        agent_slug: if scope.is_empty() { None } else { Some(scope) },
        is_enabled: row.get::<_, i32>(4)? != 0,
        requires_approval: row.get::<_, i32>(5)? != 0,
        auto_approve_low_risk: row.get::<_, i32>(6)? != 0,
        risk_level: parse_risk_level(&row.get::<_, String>(7)?)?,
        max_per_day: row.get(8)?,
        max_per_hour: row.get(9)?,
        cooldown_minutes: row.get(10)?,
        times_used_today: row.get(11)?,
        times_used_this_hour: row.get(12)?,
        hour_window_start: parse_opt_time(row.get(13)?)?,
        times_used_total: row.get(14)?,
        last_used_at: parse_opt_time(row.get(15)?)?,
        last_reset_at: parse_opt_time(row.get(16)?)?,
        version: row.get(17)?,
    })
}

pub(crate) fn parse_risk_level(raw: &str) -> rusqlite::Result<RiskLevel> {
    match raw {
        "low" => Ok(RiskLevel::Low),
        "medium" => Ok(RiskLevel::Medium),
        "high" => Ok(RiskLevel::High),
        "critical" => Ok(RiskLevel::Critical),
        other => Err(invalid_value("risk level", other)),
    }
}
