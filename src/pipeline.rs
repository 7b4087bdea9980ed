use crate::agent::{clamp_confidence, ensure_registered, ActionOutcome, AgentCapability, AgentContext, AgentRegistry};
use crate::db::Database;
use crate::errors::{EngineError, EngineResult};
use crate::gatekeeper::{ActionGatekeeper, GateDecision};
use crate::models::{ExecutionLog, ExecutionPhase, ExecutionStatus, Job, PeriodType};
use crate::velocity::{period_start_for, VelocityCache};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Runs one agent once: analyze, decide, execute, verify, complete. Agent and
/// effector failures are recorded on the log; only persistence failures surface
/// as errors.
pub struct ExecutionPipeline {
    db: Arc<Database>,
    agents: AgentRegistry,
    gatekeeper: ActionGatekeeper,
    velocity: VelocityCache,
}

impl ExecutionPipeline {
    pub fn new(db: Arc<Database>, agents: AgentRegistry, gatekeeper: ActionGatekeeper, velocity: VelocityCache) -> Self {
        Self {
            db,
            agents,
            gatekeeper,
            velocity,
        }
    }

    pub async fn run(&self, job: &Job, agent_slug: &str) -> EngineResult<ExecutionLog> {
        let started = Utc::now();
        let mut log = ExecutionLog {
            id: Uuid::new_v4().to_string(),
            job_id: job.id.clone(),
            project_id: job.project_id.clone(),
            agent_slug: agent_slug.to_string(),
            phase: ExecutionPhase::Analyze,
            status: ExecutionStatus::Running,
            should_act: false,
            do_nothing_reason: None,
            confidence_score: None,
            context_summary: None,
            github_data_used: None,
            output_data: json!({}),
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
            started_at: started,
            completed_at: None,
            duration_ms: None,
        };
        self.db.insert_execution_log(&log)?;

        let agent = match ensure_registered(&self.agents, agent_slug) {
            Ok(agent) => agent,
            Err(error) => return self.fail(log, error),
        };
        if let Err(error) = self.drive(agent, &mut log).await {
            return self.fail(log, error);
        }
        self.finish(log)
    }

    async fn drive(&self, agent: Arc<dyn AgentCapability>, log: &mut ExecutionLog) -> EngineResult<()> {
        self.enter_phase(log, ExecutionPhase::Analyze, json!({}))?;
        let mut ctx = self.build_context(log).await?;
        agent
            .analyze(&mut ctx)
            .await
            .map_err(|error| EngineError::Agent(format!("analyze failed: {:#}", error)))?;
        log.context_summary = Some(ctx.context_summary.clone().unwrap_or_else(|| default_summary(&ctx)));
        log.github_data_used = ctx.github_data_used.clone().or_else(|| {
            ctx.velocity
                .as_ref()
                .map(|entry| json!({ "velocityCacheId": entry.id, "velocityScore": entry.velocity_score }))
        });

        self.enter_phase(log, ExecutionPhase::Decide, json!({}))?;
        let decision = agent
            .decide(&ctx)
            .await
            .map_err(|error| EngineError::Agent(format!("decide failed: {:#}", error)))?;
        log.confidence_score = Some(clamp_confidence(decision.confidence_score));
        log.tokens_used = decision.tokens_used;
        log.cost_usd = decision.cost_usd.max(0.0);
        log.actions_proposed = u32::try_from(decision.actions.len()).unwrap_or(u32::MAX);

        if !decision.should_act || decision.actions.is_empty() {
            log.should_act = false;
            log.status = ExecutionStatus::DoNothing;
            log.do_nothing_reason = Some(
                decision
                    .do_nothing_reason
                    .clone()
                    .unwrap_or_else(|| "no action warranted".to_string()),
            );
            log.output_data = json!({ "decision": decision.output });
            self.event(log, "decision.do_nothing", json!({ "reason": log.do_nothing_reason, "confidence": log.confidence_score }))?;
            return Ok(());
        }
        log.should_act = true;

        // No gate slots or effectors for a job that timed out or was cancelled
        // while the agent was deciding.
        if !self.job_accepts_actions(&log.job_id)? {
            return Err(EngineError::Orchestration("job ended before its actions ran".to_string()));
        }
        self.enter_phase(log, ExecutionPhase::Execute, json!({ "proposed": log.actions_proposed }))?;
        let mut outcomes: Vec<ActionOutcome> = Vec::new();
        let mut results = Vec::new();
        let mut rejections = Vec::new();
        let mut awaiting = Vec::new();
        let mut effector_failures = Vec::new();

        for action in &decision.actions {
            let gate = self
                .gatekeeper
                .evaluate(&log.project_id, &action.action_key, &log.agent_slug, action.risk_level)?;
            self.event(log, "action.gate", json!({ "actionKey": action.action_key, "gate": gate }))?;
            match gate {
                GateDecision::Allow => {
                    log.actions_approved += 1;
                    match agent.execute(&ctx, action).await {
                        Ok(outcome) => {
                            log.actions_executed += 1;
                            log.tasks_created = log.tasks_created.saturating_add(outcome.tasks_created);
                            log.tasks_assigned = log.tasks_assigned.saturating_add(outcome.tasks_assigned);
                            results.push(json!({ "actionKey": action.action_key, "detail": outcome.detail }));
                            outcomes.push(outcome);
                        }
                        Err(error) => {
                            let message = format!("{}: {:#}", action.action_key, error);
                            tracing::warn!(execution_id = %log.id, action_key = %action.action_key, error = %message, "effector failed");
                            self.event(log, "action.failed", json!({ "actionKey": action.action_key, "error": message }))?;
                            effector_failures.push(message);
                        }
                    }
                }
                GateDecision::RequireApproval { effective_risk } => {
                    log.actions_awaiting_approval += 1;
                    awaiting.push(json!({
                        "actionKey": action.action_key,
                        "riskLevel": effective_risk,
                        "payload": action.payload,
                    }));
                }
                GateDecision::Deny { reason, detail } => {
                    log.actions_rejected += 1;
                    rejections.push(json!({
                        "actionKey": action.action_key,
                        "reason": reason.as_str(),
                        "detail": detail,
                    }));
                }
            }
        }

        log.output_data = json!({
            "decision": decision.output,
            "results": results,
            "rejections": rejections,
            "awaitingApproval": awaiting,
        });

        self.enter_phase(log, ExecutionPhase::Verify, json!({ "executed": log.actions_executed }))?;
        if !effector_failures.is_empty() {
            return Err(EngineError::Effector(effector_failures.join("; ")));
        }
        agent
            .verify(&ctx, &outcomes)
            .await
            .map_err(|error| EngineError::Effector(format!("verification failed: {:#}", error)))?;
        Ok(())
    }

    async fn build_context(&self, log: &ExecutionLog) -> EngineResult<AgentContext> {
        let settings = self.db.get_settings()?;
        let period_start = period_start_for(PeriodType::Weekly, Utc::now().date_naive());
        let velocity = match self
            .velocity
            .get_or_compute(&log.project_id, PeriodType::Weekly, period_start)
            .await
        {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!(project_id = %log.project_id, error = %error, "velocity lookup failed, treating as unknown");
                None
            }
        };
        let recent_executions = self
            .db
            .list_recent_execution_logs(&log.project_id, &log.agent_slug, settings.recent_context_depth)?;
        Ok(AgentContext {
            project_id: log.project_id.clone(),
            agent_slug: log.agent_slug.clone(),
            job_id: log.job_id.clone(),
            execution_id: log.id.clone(),
            velocity,
            recent_executions,
            analysis: serde_json::Value::Null,
            context_summary: None,
            github_data_used: None,
        })
    }

    fn job_accepts_actions(&self, job_id: &str) -> EngineResult<bool> {
        let Some(job) = self.db.get_job(job_id)? else {
            return Ok(false);
        };
        let past_deadline = job.timeout_at.is_some_and(|deadline| Utc::now() >= deadline);
        Ok(!job.status.is_terminal() && !past_deadline)
    }

    fn enter_phase(&self, log: &mut ExecutionLog, phase: ExecutionPhase, payload: serde_json::Value) -> EngineResult<()> {
        log.phase = phase;
        self.db.set_execution_phase(&log.id, phase)?;
        self.event(log, &format!("phase.{}", phase.as_str()), payload)
    }

    fn event(&self, log: &ExecutionLog, event_type: &str, payload: serde_json::Value) -> EngineResult<()> {
        self.db.insert_execution_event(&log.id, event_type, &payload)?;
        Ok(())
    }

    /// Records the execution as failed. Persistence errors are still returned so the
    /// job fails as an orchestration failure.
    fn fail(&self, mut log: ExecutionLog, error: EngineError) -> EngineResult<ExecutionLog> {
        tracing::warn!(
            execution_id = %log.id,
            job_id = %log.job_id,
            agent = %log.agent_slug,
            phase = log.phase.as_str(),
            error = %error,
            "agent execution failed"
        );
        log.status = ExecutionStatus::Failed;
        log.error_message = Some(error.to_string());
        let recorded = self
            .event(&log, "execution.failed", json!({ "phase": log.phase, "error": error.to_string() }))
            .and_then(|_| self.complete(log));
        if matches!(error, EngineError::Internal(_) | EngineError::Io(_)) {
            return Err(error);
        }
        recorded
    }

    fn finish(&self, mut log: ExecutionLog) -> EngineResult<ExecutionLog> {
        log.phase = ExecutionPhase::Complete;
        if log.status == ExecutionStatus::Running {
            log.status = ExecutionStatus::Completed;
        }
        self.event(&log, "phase.complete", json!({ "status": log.status }))?;
        self.complete(log)
    }

    fn complete(&self, mut log: ExecutionLog) -> EngineResult<ExecutionLog> {
        let completed_at = Utc::now();
        log.completed_at = Some(completed_at);
        log.duration_ms = Some((completed_at - log.started_at).num_milliseconds().max(0));
        self.db.finish_execution_log(&log)?;
        Ok(log)
    }
}

fn default_summary(ctx: &AgentContext) -> String {
    let velocity = match &ctx.velocity {
        Some(entry) => format!("velocity {:.2} ({})", entry.velocity_score, entry.velocity_trend.as_str()),
        None => "velocity unknown".to_string(),
    };
    format!("{}; {} recent executions considered", velocity, ctx.recent_executions.len())
}
