use agent_orchestrator::models::{
    EnqueueJobRequest, ExecutionStatus, Job, JobStatus, JobTarget, PeriodType, RiskLevel, SaveActionConfigPayload,
    SaveSchedulePayload, ScheduleType, TriggeredBy, VelocityMetrics,
};
use agent_orchestrator::{
    ActionOutcome, AgentCapability, AgentContext, AgentDecision, AgentRegistry, EngineCore, GithubAnalyzer,
    ProposedAction,
};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct TaskCreator {
    proposals: usize,
    executed: AtomicUsize,
}

#[async_trait]
impl AgentCapability for TaskCreator {
    async fn decide(&self, _ctx: &AgentContext) -> anyhow::Result<AgentDecision> {
        let actions = (0..self.proposals)
            .map(|_| ProposedAction::new("create_task", RiskLevel::Low))
            .collect();
        Ok(AgentDecision::act(actions, 0.8))
    }

    async fn execute(&self, _ctx: &AgentContext, _action: &ProposedAction) -> anyhow::Result<ActionOutcome> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(ActionOutcome {
            tasks_created: 1,
            ..ActionOutcome::default()
        })
    }
}

struct Idle;

#[async_trait]
impl AgentCapability for Idle {
    async fn decide(&self, ctx: &AgentContext) -> anyhow::Result<AgentDecision> {
        let reason = if ctx.velocity.is_some() { "velocity healthy" } else { "velocity unknown" };
        Ok(AgentDecision::do_nothing(reason, 0.6))
    }

    async fn execute(&self, _ctx: &AgentContext, _action: &ProposedAction) -> anyhow::Result<ActionOutcome> {
        anyhow::bail!("idle agent never acts")
    }
}

struct Stalled;

#[async_trait]
impl AgentCapability for Stalled {
    async fn decide(&self, _ctx: &AgentContext) -> anyhow::Result<AgentDecision> {
        tokio::time::sleep(std::time::Duration::from_secs(600)).await;
        Ok(AgentDecision::do_nothing("too late", 0.1))
    }

    async fn execute(&self, _ctx: &AgentContext, _action: &ProposedAction) -> anyhow::Result<ActionOutcome> {
        anyhow::bail!("stalled agent never acts")
    }
}

struct StaticAnalyzer;

#[async_trait]
impl GithubAnalyzer for StaticAnalyzer {
    async fn fetch_metrics(
        &self,
        _project_id: &str,
        _period_type: PeriodType,
        _period_start: NaiveDate,
    ) -> anyhow::Result<VelocityMetrics> {
        Ok(VelocityMetrics {
            commits_count: 21,
            prs_merged: 7,
            ..VelocityMetrics::default()
        })
    }
}

async fn engine_at(dir: &Path, agents: AgentRegistry) -> Arc<EngineCore> {
    EngineCore::new(dir.to_path_buf(), agents, Some(Arc::new(StaticAnalyzer)))
        .await
        .expect("engine")
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

async fn wait_for_terminal(engine: &EngineCore, job_id: &str) -> Job {
    for _ in 0..250 {
        if let Some(job) = engine.get_job(job_id).expect("load job") {
            if job.status.is_terminal() {
                return job;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("job {} did not reach a terminal status", job_id);
}

#[tokio::test]
async fn daily_run_limit_holds_back_second_tick() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path(), AgentRegistry::new()).await;

    let mut payload = SaveSchedulePayload::new("proj-1", "triage", ScheduleType::Hourly);
    payload.max_runs_per_day = Some(1);
    payload.allow_concurrent = true;
    engine.save_schedule(payload).expect("save schedule");

    let morning = Utc.with_ymd_and_hms(2026, 4, 9, 9, 0, 0).unwrap();
    let first = engine.tick(morning).await.expect("first tick");
    assert_eq!(first.enqueued.len(), 1);
    assert_eq!(first.enqueued[0].agent_slugs, vec!["triage".to_string()]);

    let soon_after = engine.tick(morning + Duration::minutes(5)).await.expect("tick five minutes later");
    assert!(soon_after.enqueued.is_empty());

    let second = engine.tick(morning + Duration::hours(2)).await.expect("second tick");
    assert!(second.enqueued.is_empty());
    assert!(second
        .skipped
        .iter()
        .any(|skip| skip.agent_slug == "triage" && skip.reason == "daily_run_limit"));

    let schedule = engine.get_schedule("proj-1", "triage").expect("load").expect("schedule");
    assert_eq!(schedule.last_run_at, Some(morning));
    assert_eq!(schedule.total_runs, 1);
}

#[tokio::test]
async fn overlapping_ticks_claim_a_schedule_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path(), AgentRegistry::new()).await;
    engine
        .save_schedule(SaveSchedulePayload::new("proj-1", "triage", ScheduleType::Hourly))
        .expect("save schedule");

    let other = engine_at(dir.path(), AgentRegistry::new()).await;
    let now = Utc::now();
    let (left, right) = tokio::join!(engine.tick(now), other.tick(now));
    let enqueued = left.expect("left tick").enqueued.len() + right.expect("right tick").enqueued.len();
    assert_eq!(enqueued, 1);
}

#[tokio::test]
async fn manual_job_runs_and_consumes_action_quota() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Arc::new(TaskCreator {
        proposals: 2,
        executed: AtomicUsize::new(0),
    });
    let engine = engine_at(dir.path(), AgentRegistry::new().with("planner", agent.clone())).await;

    let mut policy = SaveActionConfigPayload::new("proj-1", "create_task", RiskLevel::Low);
    policy.max_per_day = Some(1);
    engine.save_action_config(policy).expect("save policy");

    engine.start().expect("start");
    let job = engine.enqueue_job(manual("planner")).await.expect("enqueue");
    let finished = wait_for_terminal(&engine, &job.id).await;

    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.agents_executed, 1);
    assert_eq!(finished.agents_succeeded, 1);
    assert_eq!(finished.tasks_created, 1);
    assert_eq!(agent.executed.load(Ordering::SeqCst), 1);

    let logs = engine.list_execution_logs(&job.id).expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, ExecutionStatus::Completed);
    assert_eq!(logs[0].actions_proposed, 2);
    assert_eq!(logs[0].actions_executed, 1);
    assert_eq!(logs[0].actions_rejected, 1);
    assert!(logs[0].github_data_used.is_some());
    assert!(!engine.list_execution_events(&logs[0].id).expect("events").is_empty());

    let configs = engine.list_action_configs("proj-1").expect("configs");
    assert_eq!(configs[0].times_used_today, 1);
}

#[tokio::test]
async fn do_nothing_run_completes_the_job() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path(), AgentRegistry::new().with("watcher", Arc::new(Idle))).await;
    engine.start().expect("start");

    let job = engine.enqueue_job(manual("watcher")).await.expect("enqueue");
    let finished = wait_for_terminal(&engine, &job.id).await;
    assert_eq!(finished.status, JobStatus::Completed);

    let logs = engine.list_execution_logs(&job.id).expect("logs");
    assert_eq!(logs[0].status, ExecutionStatus::DoNothing);
    assert_eq!(logs[0].do_nothing_reason.as_deref(), Some("velocity healthy"));
    assert_eq!(logs[0].actions_executed, 0);
}

#[tokio::test]
async fn unregistered_agent_fails_the_job_and_schedules_a_retry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path(), AgentRegistry::new()).await;
    engine.start().expect("start");

    let job = engine.enqueue_job(manual("ghost")).await.expect("enqueue");
    let finished = wait_for_terminal(&engine, &job.id).await;
    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(finished.agents_failed, 1);

    let mut chain = Vec::new();
    for _ in 0..250 {
        chain = engine.list_retry_chain(&job.id).expect("chain");
        if chain.len() > 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1].attempt_number, 2);
    assert_eq!(chain[1].triggered_by, TriggeredBy::RetryScheduler);
    assert_eq!(chain[1].status, JobStatus::Queued);
}

#[tokio::test]
async fn timeout_sweep_releases_the_agent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path(), AgentRegistry::new()).await;

    let stuck = engine.enqueue_job(manual("triage")).await.expect("enqueue");
    assert!(engine.enqueue_job(manual("triage")).await.is_err());

    let swept = engine
        .sweep_timeouts(Utc::now() + Duration::hours(2))
        .await
        .expect("sweep");
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].id, stuck.id);
    assert_eq!(
        engine.get_job(&stuck.id).expect("load").expect("job").status,
        JobStatus::Timeout
    );

    engine.enqueue_job(manual("triage")).await.expect("agent free after timeout");
}

#[tokio::test]
async fn sweeping_a_running_job_frees_its_schedule() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path(), AgentRegistry::new().with("slow", Arc::new(Stalled))).await;
    engine
        .save_schedule(SaveSchedulePayload::new("proj-1", "slow", ScheduleType::Hourly))
        .expect("save schedule");

    let now = Utc::now();
    let first = engine.tick(now).await.expect("first tick");
    assert_eq!(first.enqueued.len(), 1);
    let job_id = first.enqueued[0].id.clone();

    engine.start().expect("start");
    let mut running = false;
    for _ in 0..250 {
        let job = engine.get_job(&job_id).expect("load").expect("job");
        if job.status == JobStatus::Running {
            running = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(running, "job never started");

    let blocked = engine.tick(now + Duration::hours(2)).await.expect("blocked tick");
    assert!(blocked.enqueued.is_empty());
    assert!(blocked.skipped.iter().any(|skip| skip.reason == "concurrent_job_active"));

    let swept = engine
        .sweep_timeouts(Utc::now() + Duration::hours(1))
        .await
        .expect("sweep");
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].status, JobStatus::Timeout);

    let schedule = engine.get_schedule("proj-1", "slow").expect("load").expect("schedule");
    assert_eq!(schedule.consecutive_failures, 1);

    let next = engine.tick(now + Duration::hours(4)).await.expect("next tick");
    assert_eq!(next.enqueued.len(), 1);
    assert_eq!(
        engine.get_job(&job_id).expect("load").expect("job").status,
        JobStatus::Timeout
    );
}

#[tokio::test]
async fn second_engine_leaves_a_live_run_alone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first = engine_at(dir.path(), AgentRegistry::new().with("slow", Arc::new(Stalled))).await;
    first.start().expect("start");
    let job = first.enqueue_job(manual("slow")).await.expect("enqueue");

    let mut running = false;
    for _ in 0..250 {
        if first.get_job(&job.id).expect("load").expect("job").status == JobStatus::Running {
            running = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(running, "job never started");

    let second = engine_at(dir.path(), AgentRegistry::new()).await;
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

    let current = second.get_job(&job.id).expect("load").expect("job");
    assert_eq!(current.status, JobStatus::Running);
    assert!(current.error_message.is_none());
    assert_eq!(second.list_retry_chain(&job.id).expect("chain").len(), 1);
    assert!(second.enqueue_job(manual("slow")).await.is_err());
}

#[tokio::test]
async fn queued_jobs_survive_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let job_id = {
        let engine = engine_at(dir.path(), AgentRegistry::new()).await;
        engine.enqueue_job(manual("watcher")).await.expect("enqueue").id
    };

    let engine = engine_at(dir.path(), AgentRegistry::new().with("watcher", Arc::new(Idle))).await;
    engine.start().expect("start");
    let finished = wait_for_terminal(&engine, &job_id).await;
    assert_eq!(finished.status, JobStatus::Completed);
}

#[tokio::test]
async fn velocity_is_cached_per_period() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path(), AgentRegistry::new()).await;
    let thursday = NaiveDate::from_ymd_opt(2026, 4, 9).unwrap();

    let first = engine
        .get_velocity("proj-1", PeriodType::Weekly, thursday)
        .await
        .expect("velocity")
        .expect("entry");
    assert_eq!(first.period_start, NaiveDate::from_ymd_opt(2026, 4, 6).unwrap());
    assert_eq!(first.velocity_score, 6.0);

    let monday = NaiveDate::from_ymd_opt(2026, 4, 6).unwrap();
    let again = engine
        .get_velocity("proj-1", PeriodType::Weekly, monday)
        .await
        .expect("velocity")
        .expect("entry");
    assert_eq!(again.id, first.id);

    assert_eq!(engine.invalidate_velocity("proj-1").expect("invalidate"), 1);
}
