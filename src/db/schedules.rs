use super::{invalid_value, parse_opt_time, parse_time, ts, Database};
use crate::errors::{EngineError, EngineResult};
use crate::models::{SaveSchedulePayload, Schedule, ScheduleType};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

const SCHEDULE_COLUMNS: &str = "id, project_id, agent_slug, is_enabled, schedule_type, cron_expression, timezone,
     run_after_time, run_before_time, run_on_days_json, min_interval_minutes, max_runs_per_day,
     cooldown_after_error_minutes, priority, allow_concurrent, last_run_at, last_success_at,
     last_failure_at, consecutive_failures, total_runs, total_successes, created_at, updated_at";

impl Database {
    /// Admin upsert keyed by (project, agent). Run counters are never touched here.
    pub fn save_schedule(&self, payload: &SaveSchedulePayload) -> EngineResult<Schedule> {
        let now = ts(Utc::now());
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO agent_schedules (
               id, project_id, agent_slug, is_enabled, schedule_type, cron_expression, timezone,
               run_after_time, run_before_time, run_on_days_json, min_interval_minutes, max_runs_per_day,
               cooldown_after_error_minutes, priority, allow_concurrent, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
             ON CONFLICT(project_id, agent_slug) DO UPDATE SET
               is_enabled = excluded.is_enabled,
               schedule_type = excluded.schedule_type,
               cron_expression = excluded.cron_expression,
               timezone = excluded.timezone,
               run_after_time = excluded.run_after_time,
               run_before_time = excluded.run_before_time,
               run_on_days_json = excluded.run_on_days_json,
               min_interval_minutes = excluded.min_interval_minutes,
               max_runs_per_day = excluded.max_runs_per_day,
               cooldown_after_error_minutes = excluded.cooldown_after_error_minutes,
               priority = excluded.priority,
               allow_concurrent = excluded.allow_concurrent,
               updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                payload.project_id,
                payload.agent_slug,
                payload.is_enabled,
                payload.schedule_type.as_str(),
                payload.cron_expression,
                payload.timezone,
                payload.run_after_time,
                payload.run_before_time,
                serde_json::to_string(&payload.run_on_days)?,
                payload.min_interval_minutes,
                payload.max_runs_per_day,
                payload.cooldown_after_error_minutes,
                payload.priority,
                payload.allow_concurrent,
                now,
            ],
        )?;

        let query = format!(
            "SELECT {} FROM agent_schedules WHERE project_id = ?1 AND agent_slug = ?2",
            SCHEDULE_COLUMNS
        );
        conn.query_row(&query, params![payload.project_id, payload.agent_slug], parse_schedule_row)
            .map_err(EngineError::from)
    }

    pub fn get_schedule(&self, project_id: &str, agent_slug: &str) -> EngineResult<Option<Schedule>> {
        let conn = self.lock()?;
        let query = format!(
            "SELECT {} FROM agent_schedules WHERE project_id = ?1 AND agent_slug = ?2",
            SCHEDULE_COLUMNS
        );
        conn.query_row(&query, params![project_id, agent_slug], parse_schedule_row)
            .optional()
            .map_err(EngineError::from)
    }

    /// Schedules ordered by priority (highest first), then age (oldest first).
    pub fn list_schedules(&self, project_id: Option<&str>, enabled_only: bool) -> EngineResult<Vec<Schedule>> {
        let conn = self.lock()?;
        let mut query = format!("SELECT {} FROM agent_schedules WHERE 1 = 1", SCHEDULE_COLUMNS);
        let mut params_vec: Vec<String> = Vec::new();
        if let Some(project_id) = project_id {
            query.push_str(" AND project_id = ?");
            params_vec.push(project_id.to_string());
        }
        if enabled_only {
            query.push_str(" AND is_enabled = 1");
        }
        query.push_str(" ORDER BY priority DESC, created_at ASC, id ASC");

        let mut statement = conn.prepare(&query)?;
        let rows = statement
            .query_map(rusqlite::params_from_iter(params_vec.iter()), parse_schedule_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_schedule_enabled(&self, project_id: &str, agent_slug: &str, enabled: bool) -> EngineResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE agent_schedules SET is_enabled = ?1, updated_at = ?2 WHERE project_id = ?3 AND agent_slug = ?4",
            params![enabled, ts(Utc::now()), project_id, agent_slug],
        )?;
        Ok(changed > 0)
    }

    /// Run outcome bookkeeping, applied once per finished job and agent.
    pub fn record_schedule_outcome(
        &self,
        project_id: &str,
        agent_slug: &str,
        succeeded: bool,
        at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let conn = self.lock()?;
        let changed = if succeeded {
            conn.execute(
                "UPDATE agent_schedules
                 SET last_success_at = ?1, total_successes = total_successes + 1, consecutive_failures = 0
                 WHERE project_id = ?2 AND agent_slug = ?3",
                params![ts(at), project_id, agent_slug],
            )?
        } else {
            conn.execute(
                "UPDATE agent_schedules
                 SET last_failure_at = ?1, consecutive_failures = consecutive_failures + 1
                 WHERE project_id = ?2 AND agent_slug = ?3",
                params![ts(at), project_id, agent_slug],
            )?
        };
        Ok(changed > 0)
    }
}

pub(super) fn parse_schedule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Schedule> {
    let days_raw: String = row.get(9)?;
    Ok(Schedule {
        id: row.get(0)?,
        project_id: row.get(1)?,
        agent_slug: row.get(2)?,
        is_enabled: row.get::<_, i32>(3)? != 0,
        schedule_type: parse_schedule_type(&row.get::<_, String>(4)?)?,
        cron_expression: row.get(5)?,
        timezone: row.get(6)?,
        run_after_time: row.get(7)?,
        run_before_time: row.get(8)?,
        run_on_days: serde_json::from_str::<Vec<u8>>(&days_raw).unwrap_or_default(),
        min_interval_minutes: row.get(10)?,
        max_runs_per_day: row.get(11)?,
        cooldown_after_error_minutes: row.get(12)?,
        priority: row.get(13)?,
        allow_concurrent: row.get::<_, i32>(14)? != 0,
        last_run_at: parse_opt_time(row.get(15)?)?,
        last_success_at: parse_opt_time(row.get(16)?)?,
        last_failure_at: parse_opt_time(row.get(17)?)?,
        consecutive_failures: row.get(18)?,
        total_runs: row.get(19)?,
        total_successes: row.get(20)?,
        created_at: parse_time(&row.get::<_, String>(21)?)?,
        updated_at: parse_time(&row.get::<_, String>(22)?)?,
    })
}

fn parse_schedule_type(raw: &str) -> rusqlite::Result<ScheduleType> {
    match raw {
        "hourly" => Ok(ScheduleType::Hourly),
        "every_4h" => Ok(ScheduleType::Every4h),
        "every_8h" => Ok(ScheduleType::Every8h),
        "daily" => Ok(ScheduleType::Daily),
        "weekly" => Ok(ScheduleType::Weekly),
        "custom" => Ok(ScheduleType::Custom),
        other => Err(invalid_value("schedule type", other)),
    }
}
