use crate::errors::{EngineError, EngineResult};
use crate::models::{EngineSettings, EnqueueJobRequest, JobTarget, SaveActionConfigPayload, SaveSchedulePayload, ScheduleType};
use crate::scheduler::{parse_cron, parse_timezone};

const MIN_SCHEDULE_PRIORITY: i32 = 1;
const MAX_SCHEDULE_PRIORITY: i32 = 10;
const MAX_WEEKDAY: u8 = 6;
const MAX_SLUG_LEN: usize = 128;
const MAX_INTERVAL_MINUTES: u32 = 60 * 24 * 31;
const MAX_RUNS_PER_DAY: u32 = 1_440;
const MAX_COOLDOWN_MINUTES: u32 = 60 * 24 * 7;
const MAX_ATTEMPTS_ALLOWED: u32 = 10;
const MIN_JOB_TIMEOUT_SECONDS: u64 = 5;
const MAX_JOB_TIMEOUT_SECONDS: u64 = 86_400;

/// Admin-facing validation for schedules, action policies and manual jobs.
/// Everything rejected here is a configuration error and is never retried.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine;

impl PolicyEngine {
    pub fn new() -> Self {
        Self
    }

    /// Returns the payload with deduplicated weekdays and a trimmed cron expression.
    pub fn validate_schedule(&self, payload: &SaveSchedulePayload) -> EngineResult<SaveSchedulePayload> {
        validate_slug("projectId", &payload.project_id)?;
        validate_slug("agentSlug", &payload.agent_slug)?;
        parse_timezone(&payload.timezone)?;

        if !(MIN_SCHEDULE_PRIORITY..=MAX_SCHEDULE_PRIORITY).contains(&payload.priority) {
            return Err(EngineError::Config(format!(
                "Schedule priority {} is out of allowed range ({}..={})",
                payload.priority, MIN_SCHEDULE_PRIORITY, MAX_SCHEDULE_PRIORITY
            )));
        }

        let mut normalized = payload.clone();
        normalized.cron_expression = payload
            .cron_expression
            .as_deref()
            .map(str::trim)
            .filter(|expression| !expression.is_empty())
            .map(ToString::to_string);

        match (payload.schedule_type, normalized.cron_expression.as_deref()) {
            (ScheduleType::Custom, None) => {
                return Err(EngineError::Config(
                    "custom schedules require a cron expression".to_string(),
                ));
            }
            (_, Some(expression)) => {
                parse_cron(expression)?;
            }
            _ => {}
        }

        if let Some(day) = payload.run_on_days.iter().find(|day| **day > MAX_WEEKDAY) {
            return Err(EngineError::Config(format!(
                "runOnDays entry {} is not a weekday (0 = Sunday ..= 6 = Saturday)",
                day
            )));
        }
        normalized.run_on_days.sort_unstable();
        normalized.run_on_days.dedup();

        if let Some(minutes) = payload.min_interval_minutes {
            if minutes > MAX_INTERVAL_MINUTES {
                return Err(EngineError::Config(format!(
                    "minIntervalMinutes {} exceeds limit {}",
                    minutes, MAX_INTERVAL_MINUTES
                )));
            }
        }

        if let Some(runs) = payload.max_runs_per_day {
            if runs == 0 || runs > MAX_RUNS_PER_DAY {
                return Err(EngineError::Config(format!(
                    "maxRunsPerDay {} is out of allowed range (1..={})",
                    runs, MAX_RUNS_PER_DAY
                )));
            }
        }

        if payload.cooldown_after_error_minutes > MAX_COOLDOWN_MINUTES {
            return Err(EngineError::Config(format!(
                "cooldownAfterErrorMinutes {} exceeds limit {}",
                payload.cooldown_after_error_minutes, MAX_COOLDOWN_MINUTES
            )));
        }

        Ok(normalized)
    }

    pub fn validate_action_config(&self, payload: &SaveActionConfigPayload) -> EngineResult<()> {
        validate_slug("projectId", &payload.project_id)?;
        validate_slug("actionKey", &payload.action_key)?;
        if let Some(agent_slug) = &payload.agent_slug {
            validate_slug("agentSlug", agent_slug)?;
        }

        if let (Some(per_hour), Some(per_day)) = (payload.max_per_hour, payload.max_per_day) {
            if per_hour > per_day {
                return Err(EngineError::Config(format!(
                    "maxPerHour {} cannot exceed maxPerDay {}",
                    per_hour, per_day
                )));
            }
        }

        if let Some(cooldown) = payload.cooldown_minutes {
            if cooldown > MAX_COOLDOWN_MINUTES {
                return Err(EngineError::Config(format!(
                    "cooldownMinutes {} exceeds limit {}",
                    cooldown, MAX_COOLDOWN_MINUTES
                )));
            }
        }

        Ok(())
    }

    pub fn validate_enqueue(&self, request: &EnqueueJobRequest) -> EngineResult<()> {
        validate_slug("projectId", &request.project_id)?;
        if let JobTarget::Agent(agent_slug) = &request.target {
            validate_slug("agentSlug", agent_slug)?;
        }
        if let Some(priority) = request.priority {
            if !(MIN_SCHEDULE_PRIORITY..=MAX_SCHEDULE_PRIORITY).contains(&priority) {
                return Err(EngineError::Config(format!(
                    "Job priority {} is out of allowed range ({}..={})",
                    priority, MIN_SCHEDULE_PRIORITY, MAX_SCHEDULE_PRIORITY
                )));
            }
        }
        Ok(())
    }

    pub fn validate_settings(&self, settings: &EngineSettings) -> EngineResult<()> {
        if !(MIN_JOB_TIMEOUT_SECONDS..=MAX_JOB_TIMEOUT_SECONDS).contains(&settings.job_timeout_seconds) {
            return Err(EngineError::Config(format!(
                "jobTimeoutSeconds {} is out of allowed range ({}..={})",
                settings.job_timeout_seconds, MIN_JOB_TIMEOUT_SECONDS, MAX_JOB_TIMEOUT_SECONDS
            )));
        }
        if settings.default_max_attempts == 0 || settings.default_max_attempts > MAX_ATTEMPTS_ALLOWED {
            return Err(EngineError::Config(format!(
                "defaultMaxAttempts {} is out of allowed range (1..={})",
                settings.default_max_attempts, MAX_ATTEMPTS_ALLOWED
            )));
        }
        if settings.max_parallel_jobs == 0 || settings.max_parallel_jobs_per_project == 0 {
            return Err(EngineError::Config("parallel job limits must be at least 1".to_string()));
        }
        if settings.max_queue_size == 0 {
            return Err(EngineError::Config("maxQueueSize must be at least 1".to_string()));
        }
        if settings.tick_interval_seconds == 0 || settings.sweep_interval_seconds == 0 || settings.maintenance_interval_seconds == 0 {
            return Err(EngineError::Config("loop intervals must be at least 1 second".to_string()));
        }
        Ok(())
    }
}

fn validate_slug(field: &str, value: &str) -> EngineResult<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Config(format!("{} cannot be empty", field)));
    }
    if trimmed.len() != value.len() || value.len() > MAX_SLUG_LEN {
        return Err(EngineError::Config(format!(
            "{} '{}' must be at most {} characters without surrounding whitespace",
            field, value, MAX_SLUG_LEN
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(EngineError::Config(format!("{} contains control characters", field)));
    }
    Ok(())
}
