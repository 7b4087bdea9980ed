use crate::db::{AgentClaim, ClaimOutcome, Database};
use crate::dispatch::{Dispatcher, ExecutorFuture, QueuedJob};
use crate::errors::{EngineError, EngineResult};
use crate::models::{
    EnqueueJobRequest, ExecutionLog, Job, JobAggregate, JobStatus, JobTarget, JobType, NewJob,
    TriggeredBy,
};
use crate::pipeline::ExecutionPipeline;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Weak};
use tokio::task::JoinSet;
use uuid::Uuid;

const DEFAULT_JOB_PRIORITY: i32 = 5;
const RUNNING_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
/// A running job whose heartbeat is older than this is treated as abandoned.
const RUN_LEASE_SECONDS: i64 = 30;

/// Allowed job status moves. Every status write in the database is conditional on
/// the prior status, so this table is what the stored history can contain.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    match from {
        JobStatus::Pending => matches!(
            to,
            JobStatus::Queued | JobStatus::Cancelled | JobStatus::Failed | JobStatus::Timeout
        ),
        JobStatus::Queued => matches!(
            to,
            JobStatus::Running | JobStatus::Cancelled | JobStatus::Failed | JobStatus::Timeout
        ),
        JobStatus::Running => matches!(
            to,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        ),
        JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout => false,
    }
}

/// Folds per-agent executions into job aggregates. A job completes when at least
/// one agent succeeded or legitimately did nothing.
pub fn aggregate_executions(logs: &[ExecutionLog]) -> (JobStatus, JobAggregate) {
    let mut aggregate = JobAggregate::default();
    for log in logs {
        aggregate.agents_executed += 1;
        if log.status.is_success() {
            aggregate.agents_succeeded += 1;
        } else {
            aggregate.agents_failed += 1;
        }
        aggregate.tasks_created = aggregate.tasks_created.saturating_add(log.tasks_created);
        aggregate.tasks_assigned = aggregate.tasks_assigned.saturating_add(log.tasks_assigned);
    }
    let status = if aggregate.agents_succeeded > 0 {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };
    (status, aggregate)
}

/// `base_minutes × 2^(attempt − 1)`.
pub fn retry_delay(base_minutes: u32, attempt_number: u32) -> Duration {
    let shift = attempt_number.saturating_sub(1);
    let multiplier: u64 = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
    let minutes = u64::from(base_minutes.max(1)).saturating_mul(multiplier);
    // Capped at one week so the chrono arithmetic cannot overflow.
    Duration::minutes(i64::try_from(minutes.min(7 * 24 * 60)).unwrap_or(7 * 24 * 60))
}

pub struct JobOrchestrator {
    db: Arc<Database>,
    pipeline: Arc<ExecutionPipeline>,
    dispatcher: Dispatcher,
    /// Stamped on every job this engine runs; other engines on the same store
    /// leave those runs alone while the heartbeat is fresh.
    instance_id: String,
}

impl JobOrchestrator {
    pub fn new(db: Arc<Database>, pipeline: Arc<ExecutionPipeline>, dispatcher: Dispatcher) -> Arc<Self> {
        let this = Arc::new(Self {
            db,
            pipeline,
            dispatcher,
            instance_id: Uuid::new_v4().to_string(),
        });

        let weak: Weak<Self> = Arc::downgrade(&this);
        this.dispatcher.set_executor(Arc::new(move |job_id: String| -> ExecutorFuture {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(strong) => strong.execute_job(job_id).await,
                    None => false,
                }
            })
        }));

        this
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Manual entry point: one agent or every enabled schedule of the project.
    pub async fn enqueue_job(&self, request: EnqueueJobRequest) -> EngineResult<Job> {
        let settings = self.db.get_settings()?;
        let now = Utc::now();

        let (agent_slugs, claims, schedule_priority) = match &request.target {
            JobTarget::Agent(agent_slug) => {
                let schedule = self.db.get_schedule(&request.project_id, agent_slug)?;
                let exclusive = schedule.as_ref().map_or(true, |schedule| !schedule.allow_concurrent);
                let priority = schedule.as_ref().map(|schedule| schedule.priority);
                (
                    vec![agent_slug.clone()],
                    vec![AgentClaim::new(agent_slug, exclusive)],
                    priority,
                )
            }
            JobTarget::Batch => {
                let schedules = self.db.list_schedules(Some(&request.project_id), true)?;
                if schedules.is_empty() {
                    return Err(EngineError::NotFound(format!(
                        "project '{}' has no enabled schedules",
                        request.project_id
                    )));
                }
                let claims = schedules
                    .iter()
                    .map(|schedule| AgentClaim::new(&schedule.agent_slug, !schedule.allow_concurrent))
                    .collect();
                let slugs = schedules.iter().map(|schedule| schedule.agent_slug.clone()).collect();
                (slugs, claims, schedules.iter().map(|schedule| schedule.priority).max())
            }
        };

        let job_type = request.job_type.unwrap_or(match request.target {
            JobTarget::Agent(_) => JobType::Manual,
            JobTarget::Batch => JobType::Batch,
        });
        let new_job = NewJob {
            project_id: request.project_id.clone(),
            job_type,
            triggered_by: request.triggered_by,
            priority: request.priority.or(schedule_priority).unwrap_or(DEFAULT_JOB_PRIORITY),
            agent_slugs,
            scheduled_at: now,
            timeout_at: now + settings.job_timeout(),
            attempt_number: 1,
            max_attempts: settings.default_max_attempts.max(1),
            parent_job_id: None,
        };

        match self.db.claim_job(&new_job, &claims, now)? {
            ClaimOutcome::Inserted { job, .. } => {
                tracing::info!(job_id = %job.id, project_id = %job.project_id, triggered_by = job.triggered_by.as_str(), "job enqueued");
                self.submit(&job).await?;
                Ok(job)
            }
            ClaimOutcome::Blocked { skipped } => {
                let agents: Vec<String> = skipped.into_iter().map(|(agent, _)| agent).collect();
                Err(EngineError::Conflict(format!(
                    "agents already have an active job: {}",
                    agents.join(", ")
                )))
            }
        }
    }

    /// Intake: `pending → queued`, then hand the job to the dispatcher. A job the
    /// dispatcher cannot accept fails as an orchestration failure; no retry is
    /// spawned for it since the queue is what is full.
    pub async fn submit(&self, job: &Job) -> EngineResult<()> {
        self.db.mark_job_queued(&job.id)?;
        let queued = QueuedJob {
            job_id: job.id.clone(),
            project_id: job.project_id.clone(),
            priority: job.priority,
            queued_at: Utc::now(),
            not_before: job.scheduled_at,
        };
        if let Err(error) = self.dispatcher.enqueue(queued).await {
            tracing::warn!(job_id = %job.id, error = %error, "dispatcher rejected job");
            self.fail_without_retry(&job.id, &error.to_string())?;
        }
        Ok(())
    }

    /// Dispatcher callback. Returns whether the job reached `completed`.
    ///
    /// The run itself is spawned so that a job passing its deadline releases the
    /// dispatcher slot; the detached run keeps going and its result is discarded by
    /// the conditional completion write.
    pub async fn execute_job(self: Arc<Self>, job_id: String) -> bool {
        let job = match self.claim_for_run(&job_id) {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(error) => {
                tracing::error!(job_id = %job_id, error = %error, "failed to start job");
                self.fail_with(&job_id, &error).await;
                return false;
            }
        };
        let deadline = job.timeout_at.unwrap_or_else(Utc::now);

        let orchestrator = self.clone();
        let mut run = tokio::spawn(async move { orchestrator.run_job(job).await });

        loop {
            let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                joined = &mut run => return matches!(joined, Ok(JobStatus::Completed)),
                _ = tokio::time::sleep(remaining.min(RUNNING_POLL_INTERVAL)) => {
                    if Utc::now() >= deadline {
                        tracing::warn!(job_id = %job_id, "job passed its deadline, releasing slot");
                        if let Err(error) = self.sweep_timeouts(Utc::now()).await {
                            tracing::error!(job_id = %job_id, error = %error, "timeout sweep failed");
                        }
                        return false;
                    }
                    // The heartbeat doubles as the status poll: a job swept or
                    // cancelled elsewhere releases its slot right away.
                    match self.db.touch_running_job(&job_id, &self.instance_id, Utc::now()) {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::info!(job_id = %job_id, "job left running, releasing slot");
                            return false;
                        }
                        Err(error) => {
                            tracing::warn!(job_id = %job_id, error = %error, "failed to renew job heartbeat");
                        }
                    }
                }
            }
        }
    }

    /// `queued → running` with a fresh deadline. `None` when the job was cancelled
    /// or otherwise left `queued` before a worker picked it up.
    fn claim_for_run(&self, job_id: &str) -> EngineResult<Option<Job>> {
        let settings = self.db.get_settings()?;
        let started_at = Utc::now();
        let timeout_at = started_at + settings.job_timeout();
        if !self.db.mark_job_running(job_id, &self.instance_id, started_at, timeout_at)? {
            tracing::debug!(job_id, "job no longer queued, skipping");
            return Ok(None);
        }
        self.db.get_job(job_id)
    }

    async fn run_job(self: Arc<Self>, job: Job) -> JobStatus {
        match self.run_agents(&job).await {
            Ok(None) => {
                tracing::warn!(job_id = %job.id, "job left running mid-batch, remaining agents skipped");
                self.stored_status(&job.id)
            }
            Ok(Some(logs)) => {
                let (status, aggregate) = aggregate_executions(&logs);
                let error_message = match (status, logs.is_empty()) {
                    (JobStatus::Failed, true) => Some("job has no agents in scope".to_string()),
                    (JobStatus::Failed, false) => Some("every agent execution failed".to_string()),
                    _ => None,
                };
                match self
                    .db
                    .finish_job(&job.id, status, &aggregate, error_message.as_deref(), Utc::now())
                {
                    Ok(true) => {
                        tracing::info!(
                            job_id = %job.id,
                            status = status.as_str(),
                            succeeded = aggregate.agents_succeeded,
                            failed = aggregate.agents_failed,
                            "job finished"
                        );
                        self.record_outcomes(&job, &logs);
                        if status == JobStatus::Failed {
                            self.schedule_retry(&job).await;
                        }
                        status
                    }
                    Ok(false) => {
                        tracing::warn!(job_id = %job.id, "job left running before completion, discarding result");
                        self.stored_status(&job.id)
                    }
                    Err(error) => {
                        tracing::error!(job_id = %job.id, error = %error, "failed to persist job result");
                        self.fail_with(&job.id, &error).await
                    }
                }
            }
            Err(error) => {
                tracing::error!(job_id = %job.id, error = %error, "job orchestration failed");
                self.fail_with(&job.id, &error).await
            }
        }
    }

    /// Orchestration failure from inside a run. Configuration errors fail the job
    /// without spawning a retry.
    async fn fail_with(&self, job_id: &str, error: &EngineError) -> JobStatus {
        let recorded = if error.is_retryable() {
            self.fail_job(job_id, &error.to_string()).await
        } else {
            self.fail_without_retry(job_id, &error.to_string())
        };
        if let Err(error) = recorded {
            tracing::error!(job_id, error = %error, "failed to record job failure");
        }
        JobStatus::Failed
    }

    fn fail_without_retry(&self, job_id: &str, message: &str) -> EngineResult<bool> {
        let now = Utc::now();
        if !self.db.fail_job(job_id, message, now)? {
            return Ok(false);
        }
        if let Some(job) = self.db.get_job(job_id)? {
            self.record_failure_for_all(&job, now);
        }
        Ok(true)
    }

    fn stored_status(&self, job_id: &str) -> JobStatus {
        self.db
            .get_job(job_id)
            .ok()
            .flatten()
            .map_or(JobStatus::Failed, |stored| stored.status)
    }

    /// Whether the job may still start agent work. A job found past its deadline
    /// is swept here so it ends as `timeout` rather than with a partial result.
    async fn still_running(&self, job_id: &str) -> EngineResult<bool> {
        let Some(current) = self.db.get_job(job_id)? else {
            return Ok(false);
        };
        if current.status != JobStatus::Running {
            return Ok(false);
        }
        let now = Utc::now();
        if current.timeout_at.is_some_and(|deadline| now >= deadline) {
            self.sweep_timeouts(now).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Agents run concurrently only when every involved schedule allows it. `None`
    /// when the job left `running` before every sequential agent got to start.
    async fn run_agents(&self, job: &Job) -> EngineResult<Option<Vec<ExecutionLog>>> {
        let mut concurrent = job.agent_slugs.len() > 1;
        for agent_slug in &job.agent_slugs {
            let allows = self
                .db
                .get_schedule(&job.project_id, agent_slug)?
                .is_some_and(|schedule| schedule.allow_concurrent);
            concurrent &= allows;
        }

        if concurrent {
            let mut set = JoinSet::new();
            for agent_slug in job.agent_slugs.clone() {
                let pipeline = self.pipeline.clone();
                let job = job.clone();
                set.spawn(async move { pipeline.run(&job, &agent_slug).await });
            }
            return drain_agent_runs(set).await.map(Some);
        }

        let mut logs = Vec::with_capacity(job.agent_slugs.len());
        for agent_slug in &job.agent_slugs {
            if !self.still_running(&job.id).await? {
                return Ok(None);
            }
            logs.push(self.pipeline.run(job, agent_slug).await?);
        }
        Ok(Some(logs))
    }

    fn record_outcomes(&self, job: &Job, logs: &[ExecutionLog]) {
        let at = Utc::now();
        for log in logs {
            if let Err(error) = self.db.record_schedule_outcome(&job.project_id, &log.agent_slug, log.status.is_success(), at) {
                tracing::warn!(job_id = %job.id, agent = %log.agent_slug, error = %error, "failed to record schedule outcome");
            }
        }
    }

    fn record_failure_for_all(&self, job: &Job, at: DateTime<Utc>) {
        for agent_slug in &job.agent_slugs {
            if let Err(error) = self.db.record_schedule_outcome(&job.project_id, agent_slug, false, at) {
                tracing::warn!(job_id = %job.id, agent = %agent_slug, error = %error, "failed to record schedule outcome");
            }
        }
    }

    /// Orchestration failure from any non-terminal state, followed by retry scheduling.
    pub async fn fail_job(&self, job_id: &str, message: &str) -> EngineResult<bool> {
        let now = Utc::now();
        if !self.db.fail_job(job_id, message, now)? {
            return Ok(false);
        }
        self.dispatcher.remove(job_id).await;
        if let Some(job) = self.db.get_job(job_id)? {
            self.record_failure_for_all(&job, now);
            self.schedule_retry(&job).await;
        }
        Ok(true)
    }

    pub async fn cancel_job(&self, job_id: &str) -> EngineResult<bool> {
        let Some(job) = self.db.get_job(job_id)? else {
            return Err(EngineError::NotFound(format!("job '{}' not found", job_id)));
        };
        if !can_transition(job.status, JobStatus::Cancelled) {
            return Ok(false);
        }
        let cancelled = self.db.cancel_job(job_id, Utc::now())?;
        if cancelled {
            self.dispatcher.remove(job_id).await;
            tracing::info!(job_id, project_id = %job.project_id, "job cancelled");
        }
        Ok(cancelled)
    }

    /// Moves overdue jobs to `timeout`, which frees their agents for the next tick.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> EngineResult<Vec<Job>> {
        let swept = self.db.sweep_timed_out_jobs(now)?;
        for job in &swept {
            tracing::warn!(job_id = %job.id, project_id = %job.project_id, "job timed out");
            self.dispatcher.remove(&job.id).await;
            self.record_failure_for_all(job, now);
        }
        Ok(swept)
    }

    /// Spawns the next attempt of a failed job when attempts remain. Returns the new job.
    pub async fn schedule_retry(&self, job: &Job) -> Option<Job> {
        match self.try_schedule_retry(job).await {
            Ok(retry) => retry,
            Err(error) => {
                tracing::error!(job_id = %job.id, error = %error, "failed to schedule retry");
                None
            }
        }
    }

    async fn try_schedule_retry(&self, job: &Job) -> EngineResult<Option<Job>> {
        let Some(current) = self.db.get_job(&job.id)? else {
            return Ok(None);
        };
        if current.status != JobStatus::Failed || current.attempt_number >= current.max_attempts {
            return Ok(None);
        }

        let settings = self.db.get_settings()?;
        let mut base_minutes: Option<u32> = None;
        let mut claims = Vec::with_capacity(current.agent_slugs.len());
        for agent_slug in &current.agent_slugs {
            let schedule = self.db.get_schedule(&current.project_id, agent_slug)?;
            if let Some(schedule) = &schedule {
                if schedule.cooldown_after_error_minutes > 0 {
                    base_minutes = Some(base_minutes.unwrap_or(0).max(schedule.cooldown_after_error_minutes));
                }
            }
            let exclusive = schedule.as_ref().map_or(true, |schedule| !schedule.allow_concurrent);
            claims.push(AgentClaim::new(agent_slug, exclusive));
        }
        let delay = retry_delay(base_minutes.unwrap_or(settings.retry_base_minutes), current.attempt_number);

        let now = Utc::now();
        let scheduled_at = now + delay;
        let new_job = NewJob {
            project_id: current.project_id.clone(),
            job_type: JobType::Retry,
            triggered_by: TriggeredBy::RetryScheduler,
            priority: current.priority,
            agent_slugs: current.agent_slugs.clone(),
            scheduled_at,
            timeout_at: scheduled_at + settings.job_timeout(),
            attempt_number: current.attempt_number + 1,
            max_attempts: current.max_attempts,
            parent_job_id: Some(current.id.clone()),
        };

        match self.db.claim_job(&new_job, &claims, now)? {
            ClaimOutcome::Inserted { job: retry, .. } => {
                tracing::info!(
                    job_id = %retry.id,
                    parent_job_id = %current.id,
                    attempt = retry.attempt_number,
                    max_attempts = retry.max_attempts,
                    delay_minutes = delay.num_minutes(),
                    "retry scheduled"
                );
                self.submit(&retry).await?;
                Ok(Some(retry))
            }
            ClaimOutcome::Blocked { .. } => {
                tracing::info!(job_id = %current.id, "retry skipped, agents already have an active job");
                Ok(None)
            }
        }
    }

    /// Fails jobs left `running` by an engine that stopped renewing its lease, and
    /// schedules their retries. Runs of live engines on the same store are untouched.
    pub async fn reap_abandoned_runs(&self, now: DateTime<Utc>) -> EngineResult<Vec<Job>> {
        let stale_before = now - Duration::seconds(RUN_LEASE_SECONDS);
        let abandoned = self.db.fail_abandoned_running_jobs(stale_before, now)?;
        for job in &abandoned {
            tracing::warn!(job_id = %job.id, project_id = %job.project_id, "job abandoned by its engine");
            self.record_failure_for_all(job, now);
            self.schedule_retry(job).await;
        }
        Ok(abandoned)
    }

    /// Startup recovery: abandoned runs are failed (and may retry); `pending` and
    /// `queued` jobs go back to the dispatcher.
    pub async fn recover(&self, now: DateTime<Utc>) -> EngineResult<()> {
        self.reap_abandoned_runs(now).await?;
        for job in self.db.list_open_jobs()? {
            if job.status == JobStatus::Running {
                continue;
            }
            self.submit(&job).await?;
        }
        Ok(())
    }
}

/// Waits for every agent of a concurrent batch, so no sibling is aborted halfway
/// through its execution log. The first error is returned after the set is empty.
async fn drain_agent_runs(mut set: JoinSet<EngineResult<ExecutionLog>>) -> EngineResult<Vec<ExecutionLog>> {
    let mut logs = Vec::with_capacity(set.len());
    let mut first_error: Option<EngineError> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(log)) => logs.push(log),
            Ok(Err(error)) => {
                tracing::error!(error = %error, "agent execution could not be recorded");
                first_error.get_or_insert(error);
            }
            Err(error) => {
                tracing::error!(error = %error, "agent task panicked");
                first_error.get_or_insert(EngineError::Orchestration(format!("agent task panicked: {}", error)));
            }
        }
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(logs),
    }
}

#[cfg(test)]
mod tests {
    use super::{aggregate_executions, can_transition, drain_agent_runs, retry_delay, JobOrchestrator};
    use crate::agent::{ActionOutcome, AgentCapability, AgentContext, AgentDecision, AgentRegistry, ProposedAction};
    use crate::db::{test_database, AgentClaim, ClaimOutcome, Database};
    use crate::dispatch::Dispatcher;
    use crate::errors::{EngineError, EngineResult};
    use crate::gatekeeper::ActionGatekeeper;
    use crate::models::{
        EnqueueJobRequest, ExecutionLog, ExecutionPhase, ExecutionStatus, Job, JobStatus, JobTarget, JobType, NewJob,
        TriggeredBy,
    };
    use crate::pipeline::ExecutionPipeline;
    use crate::velocity::VelocityCache;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::task::JoinSet;

    /// Cancels the job it runs in, as an operator would mid-batch.
    struct CancelsOwnJob {
        db: Arc<Database>,
    }

    #[async_trait]
    impl AgentCapability for CancelsOwnJob {
        async fn decide(&self, ctx: &AgentContext) -> anyhow::Result<AgentDecision> {
            self.db.cancel_job(&ctx.job_id, Utc::now())?;
            Ok(AgentDecision::do_nothing("nothing left to do", 0.5))
        }

        async fn execute(&self, _ctx: &AgentContext, _action: &ProposedAction) -> anyhow::Result<ActionOutcome> {
            anyhow::bail!("never acts")
        }
    }

    #[derive(Default)]
    struct Counting {
        decided: AtomicUsize,
    }

    #[async_trait]
    impl AgentCapability for Counting {
        async fn decide(&self, _ctx: &AgentContext) -> anyhow::Result<AgentDecision> {
            self.decided.fetch_add(1, Ordering::SeqCst);
            Ok(AgentDecision::do_nothing("quiet week", 0.5))
        }

        async fn execute(&self, _ctx: &AgentContext, _action: &ProposedAction) -> anyhow::Result<ActionOutcome> {
            anyhow::bail!("never acts")
        }
    }

    fn orchestrator(db: Arc<Database>) -> Arc<JobOrchestrator> {
        orchestrator_with(db, AgentRegistry::new())
    }

    fn orchestrator_with(db: Arc<Database>, agents: AgentRegistry) -> Arc<JobOrchestrator> {
        let pipeline = Arc::new(ExecutionPipeline::new(
            db.clone(),
            agents,
            ActionGatekeeper::new(db.clone()),
            VelocityCache::new(db.clone(), None),
        ));
        JobOrchestrator::new(db, pipeline, Dispatcher::new(2, 1, 64))
    }

    /// Inserts a batch job and moves it straight to `running`.
    fn running_batch(db: &Database, agents: &[&str], runtime: Duration) -> Job {
        let now = Utc::now();
        let new_job = NewJob {
            project_id: "proj-1".to_string(),
            job_type: JobType::Batch,
            triggered_by: TriggeredBy::Manual,
            priority: 5,
            agent_slugs: agents.iter().map(|agent| agent.to_string()).collect(),
            scheduled_at: now,
            timeout_at: now + runtime,
            attempt_number: 1,
            max_attempts: 1,
            parent_job_id: None,
        };
        let claims: Vec<AgentClaim> = agents.iter().map(|agent| AgentClaim::new(agent, true)).collect();
        let ClaimOutcome::Inserted { job, .. } = db.claim_job(&new_job, &claims, now).expect("claim") else {
            panic!("claim blocked");
        };
        assert!(db.mark_job_queued(&job.id).expect("queue"));
        assert!(db.mark_job_running(&job.id, "test-engine", now, now + runtime).expect("run"));
        db.get_job(&job.id).expect("load").expect("job")
    }

    fn manual(agent_slug: &str) -> EnqueueJobRequest {
        EnqueueJobRequest {
            project_id: "proj-1".to_string(),
            target: JobTarget::Agent(agent_slug.to_string()),
            triggered_by: TriggeredBy::Manual,
            job_type: None,
            priority: None,
        }
    }

    fn log(status: ExecutionStatus, tasks_created: u32) -> ExecutionLog {
        ExecutionLog {
            id: "exec".to_string(),
            job_id: "job".to_string(),
            project_id: "proj-1".to_string(),
            agent_slug: "triage".to_string(),
            phase: ExecutionPhase::Complete,
            status,
            should_act: status == ExecutionStatus::Completed,
            do_nothing_reason: None,
            confidence_score: Some(0.5),
            context_summary: None,
            github_data_used: None,
            output_data: serde_json::json!({}),
            actions_proposed: 0,
            actions_executed: 0,
            actions_approved: 0,
            actions_rejected: 0,
            actions_awaiting_approval: 0,
            tasks_created,
            tasks_assigned: 0,
            tokens_used: 0,
            cost_usd: 0.0,
            error_message: None,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            duration_ms: Some(1),
        }
    }

    #[test]
    fn state_machine_allows_only_forward_moves() {
        assert!(can_transition(JobStatus::Pending, JobStatus::Queued));
        assert!(can_transition(JobStatus::Queued, JobStatus::Running));
        assert!(can_transition(JobStatus::Running, JobStatus::Completed));
        assert!(can_transition(JobStatus::Queued, JobStatus::Cancelled));
        assert!(can_transition(JobStatus::Pending, JobStatus::Timeout));
        assert!(!can_transition(JobStatus::Pending, JobStatus::Running));
        assert!(!can_transition(JobStatus::Queued, JobStatus::Completed));
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled, JobStatus::Timeout] {
            assert!(!can_transition(terminal, JobStatus::Queued));
            assert!(!can_transition(terminal, JobStatus::Cancelled));
        }
    }

    #[test]
    fn do_nothing_counts_as_success() {
        let (status, aggregate) = aggregate_executions(&[
            log(ExecutionStatus::Failed, 0),
            log(ExecutionStatus::DoNothing, 0),
            log(ExecutionStatus::Completed, 2),
        ]);
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(aggregate.agents_executed, 3);
        assert_eq!(aggregate.agents_succeeded, 2);
        assert_eq!(aggregate.agents_failed, 1);
        assert_eq!(aggregate.tasks_created, 2);

        assert_eq!(aggregate_executions(&[log(ExecutionStatus::Failed, 0)]).0, JobStatus::Failed);
        assert_eq!(aggregate_executions(&[]).0, JobStatus::Failed);
    }

    #[test]
    fn retry_backoff_doubles_per_attempt() {
        assert_eq!(retry_delay(30, 1), Duration::minutes(30));
        assert_eq!(retry_delay(30, 2), Duration::minutes(60));
        assert_eq!(retry_delay(30, 3), Duration::minutes(120));
        assert_eq!(retry_delay(30, 80), Duration::minutes(7 * 24 * 60));
    }

    #[tokio::test]
    async fn failed_jobs_chain_retries_up_to_max_attempts() {
        let (_dir, db) = test_database();
        let db = Arc::new(db);
        let orchestrator = orchestrator(db.clone());
        let root = orchestrator.enqueue_job(manual("triage")).await.expect("enqueue");
        assert_eq!(root.job_type, JobType::Manual);

        let mut current = root.id.clone();
        for _ in 0..5 {
            assert!(orchestrator.fail_job(&current, "agent crashed").await.expect("fail"));
            let chain = db.list_retry_chain(&root.id).expect("chain");
            match chain.last() {
                Some(last) if last.id != current => current = last.id.clone(),
                _ => break,
            }
        }

        let chain = db.list_retry_chain(&root.id).expect("chain");
        let attempts: Vec<u32> = chain.iter().map(|job| job.attempt_number).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert!(chain.iter().all(|job| job.status == JobStatus::Failed));
        assert_eq!(chain[1].parent_job_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(chain[2].parent_job_id.as_deref(), Some(chain[1].id.as_str()));
        assert_eq!(chain[1].job_type, JobType::Retry);
        assert_eq!(chain[1].triggered_by, TriggeredBy::RetryScheduler);
        let first_failure = chain[0].completed_at.expect("root completed");
        let second_failure = chain[1].completed_at.expect("retry completed");
        assert!(chain[1].scheduled_at - first_failure >= Duration::minutes(5));
        assert!(chain[2].scheduled_at - second_failure >= Duration::minutes(10));
    }

    #[tokio::test]
    async fn cancelled_batch_starts_no_further_agents() {
        let (_dir, db) = test_database();
        let db = Arc::new(db);
        let later = Arc::new(Counting::default());
        let agents = AgentRegistry::new()
            .with("first", Arc::new(CancelsOwnJob { db: db.clone() }))
            .with("second", later.clone());
        let orchestrator = orchestrator_with(db.clone(), agents);
        let job = running_batch(&db, &["first", "second"], Duration::minutes(30));

        let outcome = orchestrator.run_agents(&job).await.expect("run agents");
        assert!(outcome.is_none());
        assert_eq!(later.decided.load(Ordering::SeqCst), 0);
        let logs = db.list_execution_logs_for_job(&job.id).expect("logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].agent_slug, "first");
    }

    #[tokio::test]
    async fn batch_past_its_deadline_ends_as_timeout_without_running_agents() {
        let (_dir, db) = test_database();
        let db = Arc::new(db);
        let later = Arc::new(Counting::default());
        let orchestrator = orchestrator_with(db.clone(), AgentRegistry::new().with("second", later.clone()));
        let job = running_batch(&db, &["second"], Duration::seconds(-1));

        assert!(orchestrator.run_agents(&job).await.expect("run agents").is_none());
        assert_eq!(later.decided.load(Ordering::SeqCst), 0);
        assert_eq!(db.get_job(&job.id).expect("load").expect("job").status, JobStatus::Timeout);
        assert!(db.list_execution_logs_for_job(&job.id).expect("logs").is_empty());
    }

    #[tokio::test]
    async fn concurrent_batch_waits_for_siblings_before_reporting_an_error() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut set: JoinSet<EngineResult<ExecutionLog>> = JoinSet::new();
        set.spawn(async { Err(EngineError::Internal("database is locked".to_string())) });
        let flag = finished.clone();
        set.spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(log(ExecutionStatus::Completed, 1))
        });

        let err = drain_agent_runs(set).await.expect_err("error surfaces");
        assert!(err.to_string().contains("database is locked"));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_frees_the_agent_for_a_new_manual_job() {
        let (_dir, db) = test_database();
        let db = Arc::new(db);
        let orchestrator = orchestrator(db.clone());

        let first = orchestrator.enqueue_job(manual("triage")).await.expect("first");
        let err = orchestrator.enqueue_job(manual("triage")).await.expect_err("agent busy");
        assert!(err.to_string().starts_with("CONFLICT"));
        assert_eq!(orchestrator.dispatcher().queued_len().await, 1);

        assert!(orchestrator.cancel_job(&first.id).await.expect("cancel"));
        assert!(!orchestrator.cancel_job(&first.id).await.expect("second cancel"));
        assert_eq!(orchestrator.dispatcher().queued_len().await, 0);
        let cancelled = db.get_job(&first.id).expect("load").expect("job");
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        orchestrator.enqueue_job(manual("triage")).await.expect("agent free again");
    }
}
