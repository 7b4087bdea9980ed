use crate::agent::AgentRegistry;
use crate::db::{merge_json, Database};
use crate::dispatch::Dispatcher;
use crate::errors::{EngineError, EngineResult};
use crate::gatekeeper::{ActionGatekeeper, GateDecision};
use crate::models::{
    ActionConfig, EngineSettings, EnqueueJobRequest, ExecutionEvent, ExecutionLog, Job, ListJobsFilters, PeriodType,
    RiskLevel, SaveActionConfigPayload, SaveSchedulePayload, Schedule, VelocityCacheEntry,
};
use crate::orchestrator::JobOrchestrator;
use crate::pipeline::ExecutionPipeline;
use crate::policy::PolicyEngine;
use crate::scheduler::{Scheduler, TickReport};
use crate::velocity::{period_start_for, GithubAnalyzer, VelocityCache};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DB_FILE_NAME: &str = "engine.sqlite";
const SETTINGS_SEED_FILE_NAME: &str = "engine.yaml";

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub action_counters_reset: usize,
    pub velocity_entries_pruned: usize,
}

/// Owns every engine component and the background loops that drive them.
pub struct EngineCore {
    db: Arc<Database>,
    policy: PolicyEngine,
    gatekeeper: ActionGatekeeper,
    velocity: VelocityCache,
    orchestrator: Arc<JobOrchestrator>,
    scheduler: Scheduler,
    started: AtomicBool,
    data_dir: PathBuf,
}

impl EngineCore {
    /// Opens the engine database under `data_dir`, applies an `engine.yaml` seed if
    /// present, and recovers jobs whose owning engine stopped.
    pub async fn new(
        data_dir: PathBuf,
        agents: AgentRegistry,
        analyzer: Option<Arc<dyn GithubAnalyzer>>,
    ) -> EngineResult<Arc<Self>> {
        let policy = PolicyEngine::new();
        let db = Arc::new(Database::new(&data_dir.join(DB_FILE_NAME))?);
        apply_settings_seed(&db, &policy, &data_dir)?;
        let settings = db.get_settings()?;

        let gatekeeper = ActionGatekeeper::new(db.clone());
        let velocity = VelocityCache::new(db.clone(), analyzer);
        let pipeline = Arc::new(ExecutionPipeline::new(
            db.clone(),
            agents,
            gatekeeper.clone(),
            velocity.clone(),
        ));
        let dispatcher = Dispatcher::new(
            settings.max_parallel_jobs,
            settings.max_parallel_jobs_per_project,
            settings.max_queue_size,
        );
        let orchestrator = JobOrchestrator::new(db.clone(), pipeline, dispatcher);
        let scheduler = Scheduler::new(db.clone(), orchestrator.clone());

        let this = Arc::new(Self {
            db,
            policy,
            gatekeeper,
            velocity,
            orchestrator,
            scheduler,
            started: AtomicBool::new(false),
            data_dir,
        });

        if let Err(error) = this.orchestrator.recover(Utc::now()).await {
            tracing::warn!(error = %error, "job recovery on startup failed");
        }

        Ok(this)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Starts the dispatcher and the tick, sweep and maintenance loops. Calling it
    /// again is a no-op.
    pub fn start(self: &Arc<Self>) -> EngineResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let settings = self.db.get_settings()?;
        self.orchestrator.dispatcher().start();

        tokio::spawn({
            let engine = self.clone();
            async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(settings.tick_interval_seconds.max(1)));
                loop {
                    interval.tick().await;
                    if let Err(error) = engine.tick(Utc::now()).await {
                        tracing::warn!(error = %error, "scheduler tick failed");
                    }
                }
            }
        });

        tokio::spawn({
            let engine = self.clone();
            async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(settings.sweep_interval_seconds.max(1)));
                loop {
                    interval.tick().await;
                    if let Err(error) = engine.sweep_timeouts(Utc::now()).await {
                        tracing::warn!(error = %error, "timeout sweep failed");
                    }
                    if let Err(error) = engine.orchestrator.reap_abandoned_runs(Utc::now()).await {
                        tracing::warn!(error = %error, "abandoned run sweep failed");
                    }
                }
            }
        });

        tokio::spawn({
            let engine = self.clone();
            async move {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_secs(settings.maintenance_interval_seconds.max(1)));
                loop {
                    interval.tick().await;
                    if let Err(error) = engine.run_maintenance(Utc::now()) {
                        tracing::warn!(error = %error, "engine maintenance failed");
                    }
                }
            }
        });

        tracing::info!(
            tick_seconds = settings.tick_interval_seconds,
            sweep_seconds = settings.sweep_interval_seconds,
            "engine started"
        );
        Ok(())
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> EngineResult<TickReport> {
        self.scheduler.tick(now).await
    }

    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> EngineResult<Vec<Job>> {
        self.orchestrator.sweep_timeouts(now).await
    }

    pub fn run_maintenance(&self, now: DateTime<Utc>) -> EngineResult<MaintenanceReport> {
        let settings = self.db.get_settings()?;
        let action_counters_reset = self.db.reset_daily_action_counters(now)?;
        let velocity_entries_pruned = self
            .velocity
            .prune_history(now - Duration::days(i64::from(settings.history_retention_days)))?;
        if action_counters_reset > 0 || velocity_entries_pruned > 0 {
            tracing::info!(action_counters_reset, velocity_entries_pruned, "maintenance completed");
        }
        Ok(MaintenanceReport {
            action_counters_reset,
            velocity_entries_pruned,
        })
    }

    // Schedules

    pub fn save_schedule(&self, payload: SaveSchedulePayload) -> EngineResult<Schedule> {
        let normalized = self.policy.validate_schedule(&payload)?;
        self.db.save_schedule(&normalized)
    }

    pub fn get_schedule(&self, project_id: &str, agent_slug: &str) -> EngineResult<Option<Schedule>> {
        self.db.get_schedule(project_id, agent_slug)
    }

    pub fn list_schedules(&self, project_id: Option<&str>) -> EngineResult<Vec<Schedule>> {
        self.db.list_schedules(project_id, false)
    }

    pub fn set_schedule_enabled(&self, project_id: &str, agent_slug: &str, enabled: bool) -> EngineResult<bool> {
        self.db.set_schedule_enabled(project_id, agent_slug, enabled)
    }

    // Jobs

    pub async fn enqueue_job(&self, request: EnqueueJobRequest) -> EngineResult<Job> {
        self.policy.validate_enqueue(&request)?;
        self.orchestrator.enqueue_job(request).await
    }

    pub async fn cancel_job(&self, job_id: &str) -> EngineResult<bool> {
        self.orchestrator.cancel_job(job_id).await
    }

    pub fn get_job(&self, job_id: &str) -> EngineResult<Option<Job>> {
        self.db.get_job(job_id)
    }

    pub fn list_jobs(&self, filters: ListJobsFilters) -> EngineResult<Vec<Job>> {
        self.db.list_jobs(&filters)
    }

    pub fn list_retry_chain(&self, root_job_id: &str) -> EngineResult<Vec<Job>> {
        self.db.list_retry_chain(root_job_id)
    }

    // Executions

    pub fn get_execution_log(&self, execution_id: &str) -> EngineResult<Option<ExecutionLog>> {
        self.db.get_execution_log(execution_id)
    }

    pub fn list_execution_logs(&self, job_id: &str) -> EngineResult<Vec<ExecutionLog>> {
        self.db.list_execution_logs_for_job(job_id)
    }

    pub fn list_execution_events(&self, execution_id: &str) -> EngineResult<Vec<ExecutionEvent>> {
        self.db.list_execution_events(execution_id)
    }

    // Action policy

    pub fn save_action_config(&self, payload: SaveActionConfigPayload) -> EngineResult<ActionConfig> {
        self.policy.validate_action_config(&payload)?;
        self.db.save_action_config(&payload)
    }

    pub fn list_action_configs(&self, project_id: &str) -> EngineResult<Vec<ActionConfig>> {
        self.db.list_action_configs(project_id)
    }

    pub fn evaluate_action(
        &self,
        project_id: &str,
        action_key: &str,
        agent_slug: &str,
        proposed_risk: RiskLevel,
    ) -> EngineResult<GateDecision> {
        self.gatekeeper.evaluate(project_id, action_key, agent_slug, proposed_risk)
    }

    // Velocity

    /// Velocity for the period containing `day`; `None` when it has never been
    /// computed and the analyzer is unavailable.
    pub async fn get_velocity(
        &self,
        project_id: &str,
        period_type: PeriodType,
        day: NaiveDate,
    ) -> EngineResult<Option<VelocityCacheEntry>> {
        self.velocity
            .get_or_compute(project_id, period_type, period_start_for(period_type, day))
            .await
    }

    pub fn invalidate_velocity(&self, project_id: &str) -> EngineResult<usize> {
        self.velocity.invalidate(project_id)
    }

    // Settings

    pub fn get_settings(&self) -> EngineResult<EngineSettings> {
        self.db.get_settings()
    }

    /// Merges `patch` into the stored settings. Dispatcher limits are read once at
    /// startup and loop intervals when `start` runs.
    pub fn update_settings(&self, patch: serde_json::Value) -> EngineResult<EngineSettings> {
        validate_settings_patch(&self.db, &self.policy, &patch)?;
        self.db.update_settings(patch)
    }
}

fn validate_settings_patch(db: &Database, policy: &PolicyEngine, patch: &serde_json::Value) -> EngineResult<()> {
    if !patch.is_object() {
        return Err(EngineError::Config("settings patch must be an object".to_string()));
    }
    let mut candidate = serde_json::to_value(db.get_settings()?)?;
    merge_json(&mut candidate, patch.clone());
    let candidate: EngineSettings =
        serde_json::from_value(candidate).map_err(|error| EngineError::Config(error.to_string()))?;
    policy.validate_settings(&candidate)
}

fn apply_settings_seed(db: &Database, policy: &PolicyEngine, data_dir: &Path) -> EngineResult<()> {
    let seed_path = data_dir.join(SETTINGS_SEED_FILE_NAME);
    if !seed_path.exists() {
        return Ok(());
    }
    let raw = std::fs::read_to_string(&seed_path)?;
    let patch: serde_json::Value = serde_yaml::from_str(&raw)?;
    if patch.is_null() {
        return Ok(());
    }
    validate_settings_patch(db, policy, &patch)?;
    db.update_settings(patch)?;
    tracing::info!(path = %seed_path.display(), "applied settings seed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::EngineCore;
    use crate::agent::AgentRegistry;
    use crate::errors::EngineError;
    use serde_json::json;

    #[tokio::test]
    async fn yaml_seed_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("engine.yaml"),
            "jobTimeoutSeconds: 120\nretryBaseMinutes: 2\n",
        )
        .expect("write seed");

        let engine = EngineCore::new(dir.path().to_path_buf(), AgentRegistry::new(), None)
            .await
            .expect("engine");
        let settings = engine.get_settings().expect("settings");
        assert_eq!(settings.job_timeout_seconds, 120);
        assert_eq!(settings.retry_base_minutes, 2);
        assert_eq!(settings.default_max_attempts, 3);
    }

    #[tokio::test]
    async fn invalid_settings_patch_is_rejected_without_writing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = EngineCore::new(dir.path().to_path_buf(), AgentRegistry::new(), None)
            .await
            .expect("engine");

        let err = engine
            .update_settings(json!({ "defaultMaxAttempts": 0 }))
            .expect_err("zero attempts");
        assert!(matches!(err, EngineError::Config(_)));
        assert_eq!(engine.get_settings().expect("settings").default_max_attempts, 3);

        let updated = engine
            .update_settings(json!({ "maxParallelJobs": 8 }))
            .expect("valid patch");
        assert_eq!(updated.max_parallel_jobs, 8);
    }
}
