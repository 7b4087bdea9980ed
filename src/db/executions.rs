use super::{invalid_value, parse_opt_time, parse_time, ts, Database};
use crate::errors::{EngineError, EngineResult};
use crate::models::{ExecutionEvent, ExecutionLog, ExecutionPhase, ExecutionStatus};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

const EXECUTION_COLUMNS: &str = "id, job_id, project_id, agent_slug, phase, status, should_act, do_nothing_reason,
     confidence_score, context_summary, github_data_used_json, output_data_json, actions_proposed,
     actions_executed, actions_approved, actions_rejected, actions_awaiting_approval, tasks_created,
     tasks_assigned, tokens_used, cost_usd, error_message, started_at, completed_at, duration_ms";

impl Database {
    pub fn insert_execution_log(&self, log: &ExecutionLog) -> EngineResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO execution_logs (
               id, job_id, project_id, agent_slug, phase, status, should_act, started_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                log.id,
                log.job_id,
                log.project_id,
                log.agent_slug,
                log.phase.as_str(),
                log.status.as_str(),
                log.should_act,
                ts(log.started_at),
            ],
        )?;
        Ok(())
    }

    pub fn set_execution_phase(&self, execution_id: &str, phase: ExecutionPhase) -> EngineResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE execution_logs SET phase = ?1 WHERE id = ?2 AND completed_at IS NULL",
            params![phase.as_str(), execution_id],
        )?;
        Ok(())
    }

    /// Writes the final state of an execution. A log that already carries a
    /// `completed_at` is never rewritten.
    pub fn finish_execution_log(&self, log: &ExecutionLog) -> EngineResult<bool> {
        let github_data = log
            .github_data_used
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE execution_logs SET
               phase = ?1, status = ?2, should_act = ?3, do_nothing_reason = ?4, confidence_score = ?5,
               context_summary = ?6, github_data_used_json = ?7, output_data_json = ?8,
               actions_proposed = ?9, actions_executed = ?10, actions_approved = ?11,
               actions_rejected = ?12, actions_awaiting_approval = ?13, tasks_created = ?14,
               tasks_assigned = ?15, tokens_used = ?16, cost_usd = ?17, error_message = ?18,
               completed_at = ?19, duration_ms = ?20
             WHERE id = ?21 AND completed_at IS NULL",
            params![
                log.phase.as_str(),
                log.status.as_str(),
                log.should_act,
                log.do_nothing_reason,
                log.confidence_score,
                log.context_summary,
                github_data,
                serde_json::to_string(&log.output_data)?,
                log.actions_proposed,
                log.actions_executed,
                log.actions_approved,
                log.actions_rejected,
                log.actions_awaiting_approval,
                log.tasks_created,
                log.tasks_assigned,
                log.tokens_used,
                log.cost_usd,
                log.error_message,
                log.completed_at.map(ts),
                log.duration_ms,
                log.id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_execution_log(&self, execution_id: &str) -> EngineResult<Option<ExecutionLog>> {
        let conn = self.lock()?;
        let query = format!("SELECT {} FROM execution_logs WHERE id = ?1", EXECUTION_COLUMNS);
        conn.query_row(&query, [execution_id], parse_execution_row)
            .optional()
            .map_err(EngineError::from)
    }

    pub fn list_execution_logs_for_job(&self, job_id: &str) -> EngineResult<Vec<ExecutionLog>> {
        let conn = self.lock()?;
        let query = format!(
            "SELECT {} FROM execution_logs WHERE job_id = ?1 ORDER BY started_at ASC, agent_slug ASC",
            EXECUTION_COLUMNS
        );
        let mut statement = conn.prepare(&query)?;
        let rows = statement
            .query_map([job_id], parse_execution_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent finished executions of an agent, newest first. Fed to agents as
    /// history so they can avoid repeating themselves.
    pub fn list_recent_execution_logs(&self, project_id: &str, agent_slug: &str, limit: u32) -> EngineResult<Vec<ExecutionLog>> {
        let conn = self.lock()?;
        let query = format!(
            "SELECT {} FROM execution_logs
             WHERE project_id = ?1 AND agent_slug = ?2 AND completed_at IS NOT NULL
             ORDER BY started_at DESC LIMIT ?3",
            EXECUTION_COLUMNS
        );
        let mut statement = conn.prepare(&query)?;
        let rows = statement
            .query_map(params![project_id, agent_slug, limit], parse_execution_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn insert_execution_event(
        &self,
        execution_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> EngineResult<ExecutionEvent> {
        let created_at = Utc::now();
        let id = Uuid::new_v4().to_string();

        let conn = self.lock()?;
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM execution_events WHERE execution_id = ?1",
            [execution_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO execution_events (id, execution_id, seq, event_type, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, execution_id, seq, event_type, serde_json::to_string(payload)?, ts(created_at)],
        )?;

        Ok(ExecutionEvent {
            id,
            execution_id: execution_id.to_string(),
            seq,
            event_type: event_type.to_string(),
            payload: payload.clone(),
            created_at,
        })
    }

    pub fn list_execution_events(&self, execution_id: &str) -> EngineResult<Vec<ExecutionEvent>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT id, execution_id, seq, event_type, payload_json, created_at
             FROM execution_events WHERE execution_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = statement
            .query_map([execution_id], |row| {
                let payload_raw: String = row.get(4)?;
                Ok(ExecutionEvent {
                    id: row.get(0)?,
                    execution_id: row.get(1)?,
                    seq: row.get(2)?,
                    event_type: row.get(3)?,
                    payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
                    created_at: parse_time(&row.get::<_, String>(5)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn parse_execution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionLog> {
    let github_raw: Option<String> = row.get(10)?;
    let output_raw: String = row.get(11)?;
    Ok(ExecutionLog {
        id: row.get(0)?,
        job_id: row.get(1)?,
        project_id: row.get(2)?,
        agent_slug: row.get(3)?,
        phase: parse_phase(&row.get::<_, String>(4)?)?,
        status: parse_execution_status(&row.get::<_, String>(5)?)?,
        should_act: row.get::<_, i32>(6)? != 0,
        do_nothing_reason: row.get(7)?,
        confidence_score: row.get(8)?,
        context_summary: row.get(9)?,
        github_data_used: github_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        output_data: serde_json::from_str(&output_raw).unwrap_or(serde_json::Value::Null),
        actions_proposed: row.get(12)?,
        actions_executed: row.get(13)?,
        actions_approved: row.get(14)?,
        actions_rejected: row.get(15)?,
        actions_awaiting_approval: row.get(16)?,
        tasks_created: row.get(17)?,
        tasks_assigned: row.get(18)?,
        tokens_used: row.get(19)?,
        cost_usd: row.get(20)?,
        error_message: row.get(21)?,
        started_at: parse_time(&row.get::<_, String>(22)?)?,
        completed_at: parse_opt_time(row.get(23)?)?,
        duration_ms: row.get(24)?,
    })
}

fn parse_phase(raw: &str) -> rusqlite::Result<ExecutionPhase> {
    match raw {
        "analyze" => Ok(ExecutionPhase::Analyze),
        "decide" => Ok(ExecutionPhase::Decide),
        "execute" => Ok(ExecutionPhase::Execute),
        "verify" => Ok(ExecutionPhase::Verify),
        "complete" => Ok(ExecutionPhase::Complete),
        other => Err(invalid_value("execution phase", other)),
    }
}

fn parse_execution_status(raw: &str) -> rusqlite::Result<ExecutionStatus> {
    match raw {
        "pending" => Ok(ExecutionStatus::Pending),
        "running" => Ok(ExecutionStatus::Running),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        "skipped" => Ok(ExecutionStatus::Skipped),
        "do_nothing" => Ok(ExecutionStatus::DoNothing),
        other => Err(invalid_value("execution status", other)),
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{test_database, AgentClaim, ClaimOutcome, Database};
    use crate::models::{ExecutionLog, ExecutionPhase, ExecutionStatus, Job, JobType, NewJob, TriggeredBy};
    use chrono::{Duration, Utc};

    fn seed_job(db: &Database) -> Job {
        let now = Utc::now();
        let new_job = NewJob {
            project_id: "proj-1".to_string(),
            job_type: JobType::SingleAgent,
            triggered_by: TriggeredBy::Manual,
            priority: 5,
            agent_slugs: vec!["triage".to_string()],
            scheduled_at: now,
            timeout_at: now + Duration::minutes(5),
            attempt_number: 1,
            max_attempts: 1,
            parent_job_id: None,
        };
        match db.claim_job(&new_job, &[AgentClaim::new("triage", false)], now).expect("claim") {
            ClaimOutcome::Inserted { job, .. } => job,
            ClaimOutcome::Blocked { .. } => panic!("claim blocked"),
        }
    }

    fn running_log(job: &Job) -> ExecutionLog {
        ExecutionLog {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job.id.clone(),
            project_id: job.project_id.clone(),
            agent_slug: "triage".to_string(),
            phase: ExecutionPhase::Analyze,
            status: ExecutionStatus::Running,
            should_act: false,
            do_nothing_reason: None,
            confidence_score: None,
            context_summary: None,
            github_data_used: None,
            output_data: serde_json::json!({}),
            actions_proposed: 0,
            actions_executed: 0,
            actions_approved: 0,
            actions_rejected: 0,
            actions_awaiting_approval: 0,
            tasks_created: 0,
            tasks_assigned: 0,
            tokens_used: 0,
            cost_usd: 0.0,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }

    #[test]
    fn finished_log_is_written_once() {
        let (_dir, db) = test_database();
        let job = seed_job(&db);
        let mut log = running_log(&job);
        db.insert_execution_log(&log).expect("insert");

        log.phase = ExecutionPhase::Complete;
        log.status = ExecutionStatus::DoNothing;
        log.do_nothing_reason = Some("no open issues".to_string());
        log.confidence_score = Some(0.9);
        log.completed_at = Some(Utc::now());
        assert!(db.finish_execution_log(&log).expect("finish"));

        log.status = ExecutionStatus::Failed;
        assert!(!db.finish_execution_log(&log).expect("rewrite"));

        let stored = db.get_execution_log(&log.id).expect("get").expect("exists");
        assert_eq!(stored.status, ExecutionStatus::DoNothing);
        assert_eq!(stored.actions_executed, 0);
        assert_eq!(stored.do_nothing_reason.as_deref(), Some("no open issues"));
        assert_eq!(db.list_recent_execution_logs("proj-1", "triage", 5).expect("recent").len(), 1);
    }

    #[test]
    fn do_nothing_with_executed_actions_is_rejected() {
        let (_dir, db) = test_database();
        let job = seed_job(&db);
        let mut log = running_log(&job);
        db.insert_execution_log(&log).expect("insert");

        log.status = ExecutionStatus::DoNothing;
        log.actions_executed = 1;
        log.completed_at = Some(Utc::now());
        assert!(db.finish_execution_log(&log).is_err());
    }

    #[test]
    fn events_are_sequenced_per_execution() {
        let (_dir, db) = test_database();
        let job = seed_job(&db);
        let log = running_log(&job);
        db.insert_execution_log(&log).expect("insert");

        db.insert_execution_event(&log.id, "phase.analyze", &serde_json::json!({})).expect("e1");
        let second = db
            .insert_execution_event(&log.id, "phase.decide", &serde_json::json!({ "shouldAct": false }))
            .expect("e2");
        assert_eq!(second.seq, 2);

        let events = db.list_execution_events(&log.id).expect("events");
        let types: Vec<_> = events.iter().map(|event| event.event_type.as_str()).collect();
        assert_eq!(types, vec!["phase.analyze", "phase.decide"]);
    }
}
