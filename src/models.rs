use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Hourly,
    #[serde(rename = "every_4h")]
    Every4h,
    #[serde(rename = "every_8h")]
    Every8h,
    Daily,
    Weekly,
    Custom,
}

impl ScheduleType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Every4h => "every_4h",
            Self::Every8h => "every_8h",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Custom => "custom",
        }
    }

    /// Fixed cadence for the named schedule types. `Custom` is driven by a cron expression.
    pub fn interval(self) -> Option<chrono::Duration> {
        match self {
            Self::Hourly => Some(chrono::Duration::hours(1)),
            Self::Every4h => Some(chrono::Duration::hours(4)),
            Self::Every8h => Some(chrono::Duration::hours(8)),
            Self::Daily => Some(chrono::Duration::days(1)),
            Self::Weekly => Some(chrono::Duration::weeks(1)),
            Self::Custom => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Batch,
    SingleAgent,
    GithubAnalysis,
    TaskAssignment,
    Retry,
    Manual,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::SingleAgent => "single_agent",
            Self::GithubAnalysis => "github_analysis",
            Self::TaskAssignment => "task_assignment",
            Self::Retry => "retry",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Cron,
    Webhook,
    Manual,
    Api,
    System,
    RetryScheduler,
}

impl TriggeredBy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Webhook => "webhook",
            Self::Manual => "manual",
            Self::Api => "api",
            Self::System => "system",
            Self::RetryScheduler => "retry_scheduler",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Analyze,
    Decide,
    Execute,
    Verify,
    Complete,
}

impl ExecutionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Decide => "decide",
            Self::Execute => "execute",
            Self::Verify => "verify",
            Self::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    DoNothing,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::DoNothing => "do_nothing",
        }
    }

    /// A legitimate do-nothing counts as a successful agent run for job aggregation.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::DoNothing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Daily,
    Weekly,
    Monthly,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VelocityTrend {
    Increasing,
    Stable,
    Decreasing,
    Unknown,
}

impl VelocityTrend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Increasing => "increasing",
            Self::Stable => "stable",
            Self::Decreasing => "decreasing",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub project_id: String,
    pub agent_slug: String,
    pub is_enabled: bool,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub timezone: String,
    pub run_after_time: Option<NaiveTime>,
    pub run_before_time: Option<NaiveTime>,
    /// 0 = Sunday .. 6 = Saturday. Empty means every day.
    pub run_on_days: Vec<u8>,
    pub min_interval_minutes: Option<u32>,
    pub max_runs_per_day: Option<u32>,
    pub cooldown_after_error_minutes: u32,
    pub priority: i32,
    pub allow_concurrent: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub total_runs: u64,
    pub total_successes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSchedulePayload {
    pub project_id: String,
    pub agent_slug: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub run_after_time: Option<NaiveTime>,
    #[serde(default)]
    pub run_before_time: Option<NaiveTime>,
    #[serde(default)]
    pub run_on_days: Vec<u8>,
    #[serde(default)]
    pub min_interval_minutes: Option<u32>,
    #[serde(default)]
    pub max_runs_per_day: Option<u32>,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_after_error_minutes: u32,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub allow_concurrent: bool,
}

impl SaveSchedulePayload {
    pub fn new(project_id: &str, agent_slug: &str, schedule_type: ScheduleType) -> Self {
        Self {
            project_id: project_id.to_string(),
            agent_slug: agent_slug.to_string(),
            is_enabled: true,
            schedule_type,
            cron_expression: None,
            timezone: default_timezone(),
            run_after_time: None,
            run_before_time: None,
            run_on_days: Vec::new(),
            min_interval_minutes: None,
            max_runs_per_day: None,
            cooldown_after_error_minutes: default_cooldown_minutes(),
            priority: default_priority(),
            allow_concurrent: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_cooldown_minutes() -> u32 {
    30
}

fn default_priority() -> i32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub project_id: String,
    pub job_type: JobType,
    pub triggered_by: TriggeredBy,
    pub status: JobStatus,
    pub priority: i32,
    pub agent_slugs: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub agents_executed: u32,
    pub agents_succeeded: u32,
    pub agents_failed: u32,
    pub tasks_created: u32,
    pub tasks_assigned: u32,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub parent_job_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to insert a job row; the database fills identity and timestamps.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub project_id: String,
    pub job_type: JobType,
    pub triggered_by: TriggeredBy,
    pub priority: i32,
    pub agent_slugs: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub parent_job_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAggregate {
    pub agents_executed: u32,
    pub agents_succeeded: u32,
    pub agents_failed: u32,
    pub tasks_created: u32,
    pub tasks_assigned: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "agent")]
pub enum JobTarget {
    Agent(String),
    /// Every enabled schedule of the project.
    Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueJobRequest {
    pub project_id: String,
    pub target: JobTarget,
    #[serde(default = "default_triggered_by")]
    pub triggered_by: TriggeredBy,
    #[serde(default)]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub priority: Option<i32>,
}

fn default_triggered_by() -> TriggeredBy {
    TriggeredBy::Manual
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsFilters {
    pub project_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLog {
    pub id: String,
    pub job_id: String,
    pub project_id: String,
    pub agent_slug: String,
    pub phase: ExecutionPhase,
    pub status: ExecutionStatus,
    pub should_act: bool,
    pub do_nothing_reason: Option<String>,
    pub confidence_score: Option<f64>,
    pub context_summary: Option<String>,
    pub github_data_used: Option<serde_json::Value>,
    pub output_data: serde_json::Value,
    pub actions_proposed: u32,
    pub actions_executed: u32,
    pub actions_approved: u32,
    pub actions_rejected: u32,
    pub actions_awaiting_approval: u32,
    pub tasks_created: u32,
    pub tasks_assigned: u32,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub id: String,
    pub execution_id: String,
    pub seq: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionConfig {
    pub id: String,
    pub project_id: String,
    pub action_key: String,
    /// `None` is the agent-agnostic policy for the action.
    pub agent_slug: Option<String>,
    pub is_enabled: bool,
    pub requires_approval: bool,
    pub auto_approve_low_risk: bool,
    pub risk_level: RiskLevel,
    pub max_per_day: Option<u32>,
    pub max_per_hour: Option<u32>,
    pub cooldown_minutes: Option<u32>,
    pub times_used_today: u32,
    pub times_used_this_hour: u32,
    pub hour_window_start: Option<DateTime<Utc>>,
    pub times_used_total: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_reset_at: Option<DateTime<Utc>>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveActionConfigPayload {
    pub project_id: String,
    pub action_key: String,
    #[serde(default)]
    pub agent_slug: Option<String>,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub auto_approve_low_risk: bool,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub max_per_day: Option<u32>,
    #[serde(default)]
    pub max_per_hour: Option<u32>,
    #[serde(default)]
    pub cooldown_minutes: Option<u32>,
}

impl SaveActionConfigPayload {
    pub fn new(project_id: &str, action_key: &str, risk_level: RiskLevel) -> Self {
        Self {
            project_id: project_id.to_string(),
            action_key: action_key.to_string(),
            agent_slug: None,
            is_enabled: true,
            requires_approval: false,
            auto_approve_low_risk: false,
            risk_level,
            max_per_day: None,
            max_per_hour: None,
            cooldown_minutes: None,
        }
    }
}

/// Raw activity returned by the GitHub analyzer for one period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VelocityMetrics {
    pub commits_count: u32,
    pub prs_opened: u32,
    pub prs_merged: u32,
    pub issues_opened: u32,
    pub issues_closed: u32,
    pub contributors: u32,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VelocityCacheEntry {
    pub id: String,
    pub project_id: String,
    pub period_type: PeriodType,
    pub period_start: NaiveDate,
    pub metrics: VelocityMetrics,
    pub velocity_score: f64,
    pub velocity_trend: VelocityTrend,
    pub computed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_stale: bool,
}

impl VelocityCacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        !self.is_stale && self.expires_at > now
    }
}

const MAX_JOB_TIMEOUT_SECONDS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    pub tick_interval_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub maintenance_interval_seconds: u64,
    pub job_timeout_seconds: u64,
    pub default_max_attempts: u32,
    pub retry_base_minutes: u32,
    pub max_parallel_jobs: usize,
    pub max_parallel_jobs_per_project: usize,
    pub max_queue_size: usize,
    pub velocity_ttl_daily_minutes: u32,
    pub velocity_ttl_weekly_minutes: u32,
    pub velocity_ttl_monthly_minutes: u32,
    pub history_retention_days: u32,
    pub recent_context_depth: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 60,
            sweep_interval_seconds: 30,
            maintenance_interval_seconds: 3600,
            job_timeout_seconds: 1800,
            default_max_attempts: 3,
            retry_base_minutes: 5,
            max_parallel_jobs: 4,
            max_parallel_jobs_per_project: 1,
            max_queue_size: 512,
            velocity_ttl_daily_minutes: 60,
            velocity_ttl_weekly_minutes: 360,
            velocity_ttl_monthly_minutes: 1440,
            history_retention_days: 90,
            recent_context_depth: 5,
        }
    }
}

impl EngineSettings {
    pub fn velocity_ttl(&self, period_type: PeriodType) -> chrono::Duration {
        let minutes = match period_type {
            PeriodType::Daily => self.velocity_ttl_daily_minutes,
            PeriodType::Weekly => self.velocity_ttl_weekly_minutes,
            PeriodType::Monthly => self.velocity_ttl_monthly_minutes,
        };
        chrono::Duration::minutes(i64::from(minutes.max(1)))
    }

    pub fn job_timeout(&self) -> chrono::Duration {
        let seconds = self.job_timeout_seconds.clamp(1, MAX_JOB_TIMEOUT_SECONDS);
        chrono::Duration::seconds(i64::try_from(seconds).unwrap_or(1))
    }
}
