use crate::db::{AgentClaim, ClaimOutcome, Database, ScheduleStamp};
use crate::errors::{EngineError, EngineResult};
use crate::models::{Job, JobType, NewJob, Schedule, ScheduleType, TriggeredBy};
use crate::orchestrator::JobOrchestrator;
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    OutsideRunWindow,
    DayExcluded,
    NotDue,
    MinInterval,
    ErrorCooldown,
    InvalidTimezone,
    InvalidCron,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutsideRunWindow => "outside_run_window",
            Self::DayExcluded => "day_excluded",
            Self::NotDue => "not_due",
            Self::MinInterval => "min_interval",
            Self::ErrorCooldown => "error_cooldown",
            Self::InvalidTimezone => "invalid_timezone",
            Self::InvalidCron => "invalid_cron",
        }
    }

    fn is_config_error(self) -> bool {
        matches!(self, Self::InvalidTimezone | Self::InvalidCron)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleEvaluation {
    Due,
    Skip(SkipReason),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSkip {
    pub project_id: String,
    pub agent_slug: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub enqueued: Vec<Job>,
    pub skipped: Vec<ScheduleSkip>,
}

pub fn parse_timezone(name: &str) -> EngineResult<Tz> {
    Tz::from_str(name).map_err(|_| EngineError::Config(format!("unknown timezone '{}'", name)))
}

/// Accepts standard 5-field expressions as well as the 6/7-field form with seconds.
pub fn parse_cron(expression: &str) -> EngineResult<cron::Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|error| EngineError::Config(format!("invalid cron expression '{}': {}", expression, error)))
}

fn in_run_window(local: NaiveTime, after: Option<NaiveTime>, before: Option<NaiveTime>) -> bool {
    match (after, before) {
        (Some(after), Some(before)) if after <= before => local >= after && local <= before,
        (Some(after), Some(before)) => local >= after || local <= before,
        (Some(after), None) => local >= after,
        (None, Some(before)) => local <= before,
        (None, None) => true,
    }
}

/// Pure due/skip decision for one schedule. Daily caps and concurrency need the
/// job table and are checked when the job is claimed.
pub fn evaluate_schedule(schedule: &Schedule, now: DateTime<Utc>) -> ScheduleEvaluation {
    let Ok(tz) = parse_timezone(&schedule.timezone) else {
        return ScheduleEvaluation::Skip(SkipReason::InvalidTimezone);
    };
    let local = now.with_timezone(&tz);

    if !in_run_window(local.time(), schedule.run_after_time, schedule.run_before_time) {
        return ScheduleEvaluation::Skip(SkipReason::OutsideRunWindow);
    }
    let weekday = local.weekday().num_days_from_sunday() as u8;
    if !schedule.run_on_days.is_empty() && !schedule.run_on_days.contains(&weekday) {
        return ScheduleEvaluation::Skip(SkipReason::DayExcluded);
    }

    if let Some(last_run_at) = schedule.last_run_at {
        let cadence_elapsed = match schedule.schedule_type.interval() {
            Some(interval) => now - last_run_at >= interval,
            None => {
                let Some(expression) = schedule.cron_expression.as_deref() else {
                    return ScheduleEvaluation::Skip(SkipReason::InvalidCron);
                };
                let Ok(cron_schedule) = parse_cron(expression) else {
                    return ScheduleEvaluation::Skip(SkipReason::InvalidCron);
                };
                cron_schedule
                    .after(&last_run_at.with_timezone(&tz))
                    .next()
                    .is_some_and(|fire| fire <= local)
            }
        };
        if !cadence_elapsed {
            return ScheduleEvaluation::Skip(SkipReason::NotDue);
        }
        if let Some(min_interval) = schedule.min_interval_minutes {
            if now - last_run_at < Duration::minutes(i64::from(min_interval)) {
                return ScheduleEvaluation::Skip(SkipReason::MinInterval);
            }
        }
    } else if schedule.schedule_type == ScheduleType::Custom {
        let parsed = schedule.cron_expression.as_deref().map(parse_cron);
        if !matches!(parsed, Some(Ok(_))) {
            return ScheduleEvaluation::Skip(SkipReason::InvalidCron);
        }
    }

    if schedule.consecutive_failures > 0 {
        if let Some(last_failure_at) = schedule.last_failure_at {
            let cooldown = Duration::minutes(i64::from(schedule.cooldown_after_error_minutes));
            if now - last_failure_at < cooldown {
                return ScheduleEvaluation::Skip(SkipReason::ErrorCooldown);
            }
        }
    }

    ScheduleEvaluation::Due
}

/// Start of the schedule's local calendar day, as a UTC instant.
fn local_midnight(tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let local_date = now.with_timezone(&tz).date_naive();
    let midnight = local_date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&midnight)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(|| now - Duration::hours(24))
}

pub struct Scheduler {
    db: Arc<Database>,
    orchestrator: Arc<JobOrchestrator>,
}

impl Scheduler {
    pub fn new(db: Arc<Database>, orchestrator: Arc<JobOrchestrator>) -> Self {
        Self { db, orchestrator }
    }

    /// One scheduling pass. Due schedules of a project are claimed together as one
    /// job; the claim re-checks concurrency and daily caps atomically.
    pub async fn tick(&self, now: DateTime<Utc>) -> EngineResult<TickReport> {
        let settings = self.db.get_settings()?;
        let schedules = self.db.list_schedules(None, true)?;
        let mut report = TickReport::default();
        let mut due_by_project: BTreeMap<String, Vec<Schedule>> = BTreeMap::new();

        for schedule in schedules {
            match evaluate_schedule(&schedule, now) {
                ScheduleEvaluation::Due => {
                    due_by_project
                        .entry(schedule.project_id.clone())
                        .or_default()
                        .push(schedule);
                }
                ScheduleEvaluation::Skip(reason) => {
                    if reason.is_config_error() {
                        tracing::warn!(
                            project_id = %schedule.project_id,
                            agent = %schedule.agent_slug,
                            reason = reason.as_str(),
                            "schedule misconfigured, skipping"
                        );
                    }
                    report.skipped.push(ScheduleSkip {
                        project_id: schedule.project_id,
                        agent_slug: schedule.agent_slug,
                        reason: reason.as_str().to_string(),
                    });
                }
            }
        }

        for (project_id, due) in due_by_project {
            let claims: Vec<AgentClaim> = due
                .iter()
                .map(|schedule| AgentClaim {
                    agent_slug: schedule.agent_slug.clone(),
                    exclusive: !schedule.allow_concurrent,
                    daily_cap: schedule.max_runs_per_day.map(|cap| {
                        let since = parse_timezone(&schedule.timezone)
                            .map(|tz| local_midnight(tz, now))
                            .unwrap_or_else(|_| now - Duration::hours(24));
                        (since, cap)
                    }),
                    stamp_schedule: Some(ScheduleStamp {
                        schedule_id: schedule.id.clone(),
                        observed_last_run_at: schedule.last_run_at,
                    }),
                })
                .collect();
            let new_job = NewJob {
                project_id: project_id.clone(),
                job_type: if due.len() > 1 { JobType::Batch } else { JobType::SingleAgent },
                triggered_by: TriggeredBy::Cron,
                priority: due.iter().map(|schedule| schedule.priority).max().unwrap_or(5),
                agent_slugs: due.iter().map(|schedule| schedule.agent_slug.clone()).collect(),
                scheduled_at: now,
                timeout_at: now + settings.job_timeout(),
                attempt_number: 1,
                max_attempts: settings.default_max_attempts.max(1),
                parent_job_id: None,
            };

            match self.db.claim_job(&new_job, &claims, now)? {
                ClaimOutcome::Inserted { job, skipped } => {
                    push_claim_skips(&mut report, &project_id, skipped);
                    tracing::info!(
                        job_id = %job.id,
                        project_id = %project_id,
                        agents = ?job.agent_slugs,
                        job_type = job.job_type.as_str(),
                        "scheduled job enqueued"
                    );
                    self.orchestrator.submit(&job).await?;
                    report.enqueued.push(job);
                }
                ClaimOutcome::Blocked { skipped } => {
                    push_claim_skips(&mut report, &project_id, skipped);
                }
            }
        }

        Ok(report)
    }
}

fn push_claim_skips(report: &mut TickReport, project_id: &str, skipped: Vec<(String, &'static str)>) {
    for (agent_slug, reason) in skipped {
        tracing::debug!(project_id, agent = %agent_slug, reason, "schedule claim rejected");
        report.skipped.push(ScheduleSkip {
            project_id: project_id.to_string(),
            agent_slug,
            reason: reason.to_string(),
        });
    }
}
