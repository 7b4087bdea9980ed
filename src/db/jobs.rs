use super::{invalid_value, parse_opt_time, parse_time, ts, Database};
use crate::errors::{EngineError, EngineResult};
use crate::models::{Job, JobAggregate, JobStatus, JobType, ListJobsFilters, NewJob, TriggeredBy};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, project_id, job_type, triggered_by, status, priority, agent_slugs_json,
     scheduled_at, started_at, completed_at, timeout_at, agents_executed, agents_succeeded,
     agents_failed, tasks_created, tasks_assigned, attempt_number, max_attempts, parent_job_id,
     error_message, created_at";

const ACTIVE_STATUSES: &str = "('pending', 'queued', 'running')";

/// One agent's admission conditions, re-checked inside the claim transaction.
#[derive(Debug, Clone)]
pub struct AgentClaim {
    pub agent_slug: String,
    /// Reject when another pending/queued/running job already covers this agent.
    pub exclusive: bool,
    /// Reject when this many non-retry jobs were created for the agent since the instant.
    pub daily_cap: Option<(DateTime<Utc>, u32)>,
    /// Compare-and-swap on the schedule's `last_run_at`; a mismatch means another
    /// tick already claimed this run.
    pub stamp_schedule: Option<ScheduleStamp>,
}

#[derive(Debug, Clone)]
pub struct ScheduleStamp {
    pub schedule_id: String,
    pub observed_last_run_at: Option<DateTime<Utc>>,
}

impl AgentClaim {
    pub fn new(agent_slug: &str, exclusive: bool) -> Self {
        Self {
            agent_slug: agent_slug.to_string(),
            exclusive,
            daily_cap: None,
            stamp_schedule: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Inserted {
        job: Job,
        skipped: Vec<(String, &'static str)>,
    },
    Blocked {
        skipped: Vec<(String, &'static str)>,
    },
}

impl Database {
    /// Atomic check-and-insert: agents whose claim conditions fail are dropped, the
    /// rest are covered by one new `pending` job. Nothing is written when every agent
    /// is rejected.
    pub fn claim_job(&self, new_job: &NewJob, claims: &[AgentClaim], now: DateTime<Utc>) -> EngineResult<ClaimOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut accepted = Vec::new();
        let mut skipped = Vec::new();
        for claim in claims {
            if claim.exclusive && has_active_job(&tx, &new_job.project_id, &claim.agent_slug)? {
                skipped.push((claim.agent_slug.clone(), "concurrent_job_active"));
                continue;
            }
            if let Some((since, cap)) = claim.daily_cap {
                if count_runs_since(&tx, &new_job.project_id, &claim.agent_slug, since)? >= cap {
                    skipped.push((claim.agent_slug.clone(), "daily_run_limit"));
                    continue;
                }
            }
            if let Some(stamp) = &claim.stamp_schedule {
                let changed = tx.execute(
                    "UPDATE agent_schedules
                     SET last_run_at = ?1, total_runs = total_runs + 1
                     WHERE id = ?2 AND last_run_at IS ?3",
                    params![ts(now), stamp.schedule_id, stamp.observed_last_run_at.map(ts)],
                )?;
                if changed == 0 {
                    skipped.push((claim.agent_slug.clone(), "schedule_already_claimed"));
                    continue;
                }
            }
            accepted.push(claim.agent_slug.clone());
        }

        if accepted.is_empty() {
            tx.commit()?;
            return Ok(ClaimOutcome::Blocked { skipped });
        }

        let job_type = if new_job.job_type == JobType::Batch && accepted.len() == 1 {
            JobType::SingleAgent
        } else {
            new_job.job_type
        };
        let job = Job {
            id: Uuid::new_v4().to_string(),
            project_id: new_job.project_id.clone(),
            job_type,
            triggered_by: new_job.triggered_by,
            status: JobStatus::Pending,
            priority: new_job.priority,
            agent_slugs: accepted,
            scheduled_at: new_job.scheduled_at,
            started_at: None,
            completed_at: None,
            timeout_at: Some(new_job.timeout_at),
            agents_executed: 0,
            agents_succeeded: 0,
            agents_failed: 0,
            tasks_created: 0,
            tasks_assigned: 0,
            attempt_number: new_job.attempt_number,
            max_attempts: new_job.max_attempts,
            parent_job_id: new_job.parent_job_id.clone(),
            error_message: None,
            created_at: now,
        };
        insert_job(&tx, &job)?;
        tx.commit()?;

        Ok(ClaimOutcome::Inserted { job, skipped })
    }

    pub fn get_job(&self, job_id: &str) -> EngineResult<Option<Job>> {
        let conn = self.lock()?;
        let query = format!("SELECT {} FROM orchestration_jobs WHERE id = ?1", JOB_COLUMNS);
        conn.query_row(&query, [job_id], parse_job_row)
            .optional()
            .map_err(EngineError::from)
    }

    pub fn list_jobs(&self, filters: &ListJobsFilters) -> EngineResult<Vec<Job>> {
        let conn = self.lock()?;
        let mut query = format!("SELECT {} FROM orchestration_jobs WHERE 1 = 1", JOB_COLUMNS);
        let mut params_vec: Vec<String> = Vec::new();

        if let Some(project_id) = &filters.project_id {
            query.push_str(" AND project_id = ?");
            params_vec.push(project_id.clone());
        }
        if let Some(status) = filters.status {
            query.push_str(" AND status = ?");
            params_vec.push(status.as_str().to_string());
        }
        query.push_str(" ORDER BY created_at DESC LIMIT ?");
        let limit = filters.limit.unwrap_or(100);

        let mut statement = conn.prepare(&query)?;
        let mut dyn_params: Vec<&dyn rusqlite::ToSql> = params_vec
            .iter()
            .map(|param| param as &dyn rusqlite::ToSql)
            .collect();
        dyn_params.push(&limit);

        let rows = statement
            .query_map(rusqlite::params_from_iter(dyn_params), parse_job_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Non-terminal jobs, oldest first. Used for startup recovery.
    pub fn list_open_jobs(&self) -> EngineResult<Vec<Job>> {
        let conn = self.lock()?;
        let query = format!(
            "SELECT {} FROM orchestration_jobs WHERE status IN {} ORDER BY scheduled_at ASC",
            JOB_COLUMNS, ACTIVE_STATUSES
        );
        let mut statement = conn.prepare(&query)?;
        let rows = statement
            .query_map([], parse_job_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The job and every retry descending from it, in attempt order.
    pub fn list_retry_chain(&self, root_job_id: &str) -> EngineResult<Vec<Job>> {
        let conn = self.lock()?;
        let query = format!(
            "WITH RECURSIVE chain(id) AS (
               SELECT id FROM orchestration_jobs WHERE id = ?1
               UNION ALL
               SELECT j.id FROM orchestration_jobs j JOIN chain c ON j.parent_job_id = c.id
             )
             SELECT {} FROM orchestration_jobs WHERE id IN (SELECT id FROM chain)
             ORDER BY attempt_number ASC, created_at ASC",
            JOB_COLUMNS
        );
        let mut statement = conn.prepare(&query)?;
        let rows = statement
            .query_map([root_job_id], parse_job_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn has_active_job_for_agent(&self, project_id: &str, agent_slug: &str) -> EngineResult<bool> {
        let conn = self.lock()?;
        has_active_job(&conn, project_id, agent_slug)
    }

    /// `pending -> queued`.
    pub fn mark_job_queued(&self, job_id: &str) -> EngineResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE orchestration_jobs SET status = 'queued' WHERE id = ?1 AND status = 'pending'",
            [job_id],
        )?;
        Ok(changed > 0)
    }

    /// `queued -> running`, stamping the start, the execution deadline and the
    /// engine instance that owns the run.
    pub fn mark_job_running(
        &self,
        job_id: &str,
        owner_id: &str,
        started_at: DateTime<Utc>,
        timeout_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE orchestration_jobs
             SET status = 'running', started_at = ?1, timeout_at = ?2, owner_id = ?3, heartbeat_at = ?1
             WHERE id = ?4 AND status = 'queued'",
            params![ts(started_at), ts(timeout_at), owner_id, job_id],
        )?;
        Ok(changed > 0)
    }

    /// Renews the owner's lease on a running job. False once the job left `running`.
    pub fn touch_running_job(&self, job_id: &str, owner_id: &str, at: DateTime<Utc>) -> EngineResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE orchestration_jobs SET heartbeat_at = ?1
             WHERE id = ?2 AND owner_id = ?3 AND status = 'running'",
            params![ts(at), job_id, owner_id],
        )?;
        Ok(changed > 0)
    }

    /// `running -> completed|failed` with aggregates. Returns false when the job left
    /// `running` in the meantime (timed out or cancelled); the result is then discarded.
    pub fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        aggregate: &JobAggregate,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        if !matches!(status, JobStatus::Completed | JobStatus::Failed) {
            return Err(EngineError::Internal(format!(
                "finish_job cannot move a job to '{}'",
                status.as_str()
            )));
        }
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE orchestration_jobs
             SET status = ?1, completed_at = ?2, agents_executed = ?3, agents_succeeded = ?4,
                 agents_failed = ?5, tasks_created = ?6, tasks_assigned = ?7, error_message = ?8
             WHERE id = ?9 AND status = 'running'",
            params![
                status.as_str(),
                ts(completed_at),
                aggregate.agents_executed,
                aggregate.agents_succeeded,
                aggregate.agents_failed,
                aggregate.tasks_created,
                aggregate.tasks_assigned,
                error_message,
                job_id
            ],
        )?;
        Ok(changed > 0)
    }

    /// Orchestration failure from any non-terminal state.
    pub fn fail_job(&self, job_id: &str, error_message: &str, at: DateTime<Utc>) -> EngineResult<bool> {
        let conn = self.lock()?;
        let query = format!(
            "UPDATE orchestration_jobs SET status = 'failed', completed_at = ?1, error_message = ?2
             WHERE id = ?3 AND status IN {}",
            ACTIVE_STATUSES
        );
        let changed = conn.execute(&query, params![ts(at), error_message, job_id])?;
        Ok(changed > 0)
    }

    pub fn cancel_job(&self, job_id: &str, at: DateTime<Utc>) -> EngineResult<bool> {
        let conn = self.lock()?;
        let query = format!(
            "UPDATE orchestration_jobs SET status = 'cancelled', completed_at = ?1, error_message = 'cancelled by request'
             WHERE id = ?2 AND status IN {}",
            ACTIVE_STATUSES
        );
        let changed = conn.execute(&query, params![ts(at), job_id])?;
        Ok(changed > 0)
    }

    /// Moves every non-terminal job whose deadline passed to `timeout` and returns them.
    pub fn sweep_timed_out_jobs(&self, now: DateTime<Utc>) -> EngineResult<Vec<Job>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let query = format!(
            "SELECT {} FROM orchestration_jobs
             WHERE status IN {} AND timeout_at IS NOT NULL AND timeout_at <= ?1",
            JOB_COLUMNS, ACTIVE_STATUSES
        );
        let expired = {
            let mut statement = tx.prepare(&query)?;
            let rows = statement
                .query_map([ts(now)], parse_job_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut swept = Vec::with_capacity(expired.len());
        for mut job in expired {
            let update = format!(
                "UPDATE orchestration_jobs
                 SET status = 'timeout', completed_at = ?1, error_message = 'job exceeded its deadline'
                 WHERE id = ?2 AND status IN {}",
                ACTIVE_STATUSES
            );
            if tx.execute(&update, params![ts(now), job.id])? > 0 {
                job.status = JobStatus::Timeout;
                job.completed_at = Some(now);
                job.error_message = Some("job exceeded its deadline".to_string());
                swept.push(job);
            }
        }
        tx.commit()?;
        Ok(swept)
    }

    /// Fails `running` jobs whose owner stopped renewing its lease before
    /// `stale_before`. Runs owned by a live engine are left alone.
    pub fn fail_abandoned_running_jobs(&self, stale_before: DateTime<Utc>, now: DateTime<Utc>) -> EngineResult<Vec<Job>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let query = format!(
            "SELECT {} FROM orchestration_jobs
             WHERE status = 'running' AND (heartbeat_at IS NULL OR heartbeat_at < ?1)",
            JOB_COLUMNS
        );
        let abandoned = {
            let mut statement = tx.prepare(&query)?;
            let rows = statement
                .query_map([ts(stale_before)], parse_job_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let message = "run abandoned by its engine";
        let mut failed = Vec::with_capacity(abandoned.len());
        for mut job in abandoned {
            let changed = tx.execute(
                "UPDATE orchestration_jobs SET status = 'failed', completed_at = ?1, error_message = ?2
                 WHERE id = ?3 AND status = 'running'",
                params![ts(now), message, job.id],
            )?;
            if changed > 0 {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.error_message = Some(message.to_string());
                failed.push(job);
            }
        }
        tx.commit()?;
        Ok(failed)
    }
}

fn insert_job(tx: &Transaction<'_>, job: &Job) -> EngineResult<()> {
    tx.execute(
        "INSERT INTO orchestration_jobs (
           id, project_id, job_type, triggered_by, status, priority, agent_slugs_json,
           scheduled_at, timeout_at, attempt_number, max_attempts, parent_job_id, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            job.id,
            job.project_id,
            job.job_type.as_str(),
            job.triggered_by.as_str(),
            job.status.as_str(),
            job.priority,
            serde_json::to_string(&job.agent_slugs)?,
            ts(job.scheduled_at),
            job.timeout_at.map(ts),
            job.attempt_number,
            job.max_attempts,
            job.parent_job_id,
            ts(job.created_at),
        ],
    )?;
    for (position, agent_slug) in job.agent_slugs.iter().enumerate() {
        tx.execute(
            "INSERT INTO job_agents (job_id, project_id, agent_slug, position) VALUES (?1, ?2, ?3, ?4)",
            params![job.id, job.project_id, agent_slug, position as i64],
        )?;
    }
    Ok(())
}

fn has_active_job(conn: &rusqlite::Connection, project_id: &str, agent_slug: &str) -> EngineResult<bool> {
    let query = format!(
        "SELECT 1 FROM job_agents ja JOIN orchestration_jobs j ON j.id = ja.job_id
         WHERE ja.project_id = ?1 AND ja.agent_slug = ?2 AND j.status IN {} LIMIT 1",
        ACTIVE_STATUSES
    );
    let found = conn
        .query_row(&query, params![project_id, agent_slug], |row| row.get::<_, i64>(0))
        .optional()?;
    Ok(found.is_some())
}

fn count_runs_since(
    conn: &rusqlite::Connection,
    project_id: &str,
    agent_slug: &str,
    since: DateTime<Utc>,
) -> EngineResult<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(1) FROM job_agents ja JOIN orchestration_jobs j ON j.id = ja.job_id
         WHERE ja.project_id = ?1 AND ja.agent_slug = ?2 AND j.created_at >= ?3
           AND j.status <> 'cancelled' AND j.job_type <> 'retry'",
        params![project_id, agent_slug, ts(since)],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn parse_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let agents_raw: String = row.get(6)?;
    Ok(Job {
        id: row.get(0)?,
        project_id: row.get(1)?,
        job_type: parse_job_type(&row.get::<_, String>(2)?)?,
        triggered_by: parse_triggered_by(&row.get::<_, String>(3)?)?,
        status: parse_job_status(&row.get::<_, String>(4)?)?,
        priority: row.get(5)?,
        agent_slugs: serde_json::from_str::<Vec<String>>(&agents_raw).unwrap_or_default(),
        scheduled_at: parse_time(&row.get::<_, String>(7)?)?,
        started_at: parse_opt_time(row.get(8)?)?,
        completed_at: parse_opt_time(row.get(9)?)?,
        timeout_at: parse_opt_time(row.get(10)?)?,
        agents_executed: row.get(11)?,
        agents_succeeded: row.get(12)?,
        agents_failed: row.get(13)?,
        tasks_created: row.get(14)?,
        tasks_assigned: row.get(15)?,
        attempt_number: row.get(16)?,
        max_attempts: row.get(17)?,
        parent_job_id: row.get(18)?,
        error_message: row.get(19)?,
        created_at: parse_time(&row.get::<_, String>(20)?)?,
    })
}

fn parse_job_type(raw: &str) -> rusqlite::Result<JobType> {
    match raw {
        "batch" => Ok(JobType::Batch),
        "single_agent" => Ok(JobType::SingleAgent),
        "github_analysis" => Ok(JobType::GithubAnalysis),
        "task_assignment" => Ok(JobType::TaskAssignment),
        "retry" => Ok(JobType::Retry),
        "manual" => Ok(JobType::Manual),
        other => Err(invalid_value("job type", other)),
    }
}

fn parse_triggered_by(raw: &str) -> rusqlite::Result<TriggeredBy> {
    match raw {
        "cron" => Ok(TriggeredBy::Cron),
        "webhook" => Ok(TriggeredBy::Webhook),
        "manual" => Ok(TriggeredBy::Manual),
        "api" => Ok(TriggeredBy::Api),
        "system" => Ok(TriggeredBy::System),
        "retry_scheduler" => Ok(TriggeredBy::RetryScheduler),
        other => Err(invalid_value("trigger", other)),
    }
}

fn parse_job_status(raw: &str) -> rusqlite::Result<JobStatus> {
    match raw {
        "pending" => Ok(JobStatus::Pending),
        "queued" => Ok(JobStatus::Queued),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "cancelled" => Ok(JobStatus::Cancelled),
        "timeout" => Ok(JobStatus::Timeout),
        other => Err(invalid_value("job status", other)),
    }
}
