use crate::db::{Database, GateWrite};
use crate::errors::{EngineError, EngineResult};
use crate::models::{ActionConfig, RiskLevel};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MAX_CONFLICT_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotConfigured,
    Disabled,
    RateLimited,
    Cooldown,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotConfigured => "not_configured",
            Self::Disabled => "disabled",
            Self::RateLimited => "rate_limited",
            Self::Cooldown => "cooldown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum GateDecision {
    Allow,
    RequireApproval { effective_risk: RiskLevel },
    Deny { reason: DenyReason, detail: String },
}

impl GateDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    fn deny(reason: DenyReason, detail: impl Into<String>) -> Self {
        Self::Deny {
            reason,
            detail: detail.into(),
        }
    }
}

/// Policy check for one proposed action. Counter changes (daily reset, hour bucket
/// roll-over, usage on `Allow`) are returned alongside the decision and persisted by
/// the caller in the same transaction that read the config.
pub fn assess(config: Option<&ActionConfig>, now: DateTime<Utc>, proposed_risk: RiskLevel) -> GateWrite<GateDecision> {
    let Some(config) = config else {
        return GateWrite {
            outcome: GateDecision::deny(DenyReason::NotConfigured, "no policy for action"),
            counters: None,
        };
    };
    if !config.is_enabled {
        return GateWrite {
            outcome: GateDecision::deny(DenyReason::Disabled, "action is disabled"),
            counters: None,
        };
    }

    let mut next = config.clone();
    let mut dirty = false;

    let reset_due = match config.last_reset_at {
        Some(last_reset_at) => last_reset_at.date_naive() < now.date_naive(),
        None => true,
    };
    if reset_due {
        next.times_used_today = 0;
        next.last_reset_at = Some(now);
        dirty = true;
    }

    let bucket = hour_bucket(now);
    if next.hour_window_start != Some(bucket) {
        next.times_used_this_hour = 0;
        next.hour_window_start = Some(bucket);
        dirty = true;
    }

    let counters_if_dirty = |next: ActionConfig| if dirty { Some(next) } else { None };

    if let Some(max_per_day) = next.max_per_day {
        if next.times_used_today >= max_per_day {
            let detail = format!("daily limit of {} reached", max_per_day);
            return GateWrite {
                outcome: GateDecision::deny(DenyReason::RateLimited, detail),
                counters: counters_if_dirty(next),
            };
        }
    }
    if let Some(max_per_hour) = next.max_per_hour {
        if next.times_used_this_hour >= max_per_hour {
            let detail = format!("hourly limit of {} reached", max_per_hour);
            return GateWrite {
                outcome: GateDecision::deny(DenyReason::RateLimited, detail),
                counters: counters_if_dirty(next),
            };
        }
    }
    if let (Some(cooldown_minutes), Some(last_used_at)) = (next.cooldown_minutes, next.last_used_at) {
        let ready_at = last_used_at + Duration::minutes(i64::from(cooldown_minutes));
        if now < ready_at {
            let detail = format!("cooling down until {}", ready_at.to_rfc3339());
            return GateWrite {
                outcome: GateDecision::deny(DenyReason::Cooldown, detail),
                counters: counters_if_dirty(next),
            };
        }
    }

    let effective_risk = config.risk_level.max(proposed_risk);
    if config.requires_approval && !(config.auto_approve_low_risk && effective_risk == RiskLevel::Low) {
        return GateWrite {
            outcome: GateDecision::RequireApproval { effective_risk },
            counters: counters_if_dirty(next),
        };
    }

    next.times_used_today = next.times_used_today.saturating_add(1);
    next.times_used_this_hour = next.times_used_this_hour.saturating_add(1);
    next.times_used_total = next.times_used_total.saturating_add(1);
    next.last_used_at = Some(now);
    GateWrite {
        outcome: GateDecision::Allow,
        counters: Some(next),
    }
}

fn hour_bucket(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::hours(1)).unwrap_or(now)
}

#[derive(Debug, Clone)]
pub struct ActionGatekeeper {
    db: Arc<Database>,
}

impl ActionGatekeeper {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn evaluate(
        &self,
        project_id: &str,
        action_key: &str,
        agent_slug: &str,
        proposed_risk: RiskLevel,
    ) -> EngineResult<GateDecision> {
        self.evaluate_at(project_id, action_key, agent_slug, proposed_risk, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        project_id: &str,
        action_key: &str,
        agent_slug: &str,
        proposed_risk: RiskLevel,
        now: DateTime<Utc>,
    ) -> EngineResult<GateDecision> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.db.apply_gate(project_id, action_key, agent_slug, |config| {
                assess(config, now, proposed_risk)
            }) {
                Ok(decision) => {
                    match &decision {
                        GateDecision::Allow => {
                            tracing::debug!(project_id, action_key, agent = agent_slug, "action allowed")
                        }
                        GateDecision::RequireApproval { effective_risk } => tracing::info!(
                            project_id,
                            action_key,
                            agent = agent_slug,
                            risk = effective_risk.as_str(),
                            "action requires approval"
                        ),
                        GateDecision::Deny { reason, detail } => tracing::info!(
                            project_id,
                            action_key,
                            agent = agent_slug,
                            reason = reason.as_str(),
                            detail = %detail,
                            "action denied"
                        ),
                    }
                    return Ok(decision);
                }
                Err(EngineError::Conflict(message)) if attempt < MAX_CONFLICT_RETRIES => {
                    tracing::debug!(project_id, action_key, attempt, error = %message, "gate write conflicted, retrying");
                }
                Err(error) => return Err(error),
            }
        }
    }
}
