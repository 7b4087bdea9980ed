use crate::errors::EngineResult;
use crate::models::{ExecutionLog, RiskLevel, VelocityCacheEntry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Inputs an agent sees for one run. The analyze phase fills the engine-provided
/// fields; the agent's own `analyze` may add to `analysis` and the provenance fields.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    pub project_id: String,
    pub agent_slug: String,
    pub job_id: String,
    pub execution_id: String,
    /// `None` means velocity is unknown, not zero.
    pub velocity: Option<VelocityCacheEntry>,
    pub recent_executions: Vec<ExecutionLog>,
    pub analysis: serde_json::Value,
    pub context_summary: Option<String>,
    pub github_data_used: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedAction {
    pub action_key: String,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ProposedAction {
    pub fn new(action_key: &str, risk_level: RiskLevel) -> Self {
        Self {
            action_key: action_key.to_string(),
            risk_level,
            payload: serde_json::Value::Null,
        }
    }
}

/// What the agent decided. An empty `actions` list (or `should_act = false`) is
/// a do-nothing run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentDecision {
    pub should_act: bool,
    pub do_nothing_reason: Option<String>,
    pub confidence_score: f64,
    pub actions: Vec<ProposedAction>,
    pub output: serde_json::Value,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

impl AgentDecision {
    pub fn do_nothing(reason: &str, confidence_score: f64) -> Self {
        Self {
            should_act: false,
            do_nothing_reason: Some(reason.to_string()),
            confidence_score,
            ..Self::default()
        }
    }

    pub fn act(actions: Vec<ProposedAction>, confidence_score: f64) -> Self {
        Self {
            should_act: true,
            confidence_score,
            actions,
            ..Self::default()
        }
    }
}

/// Result of one performed side effect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActionOutcome {
    pub tasks_created: u32,
    pub tasks_assigned: u32,
    pub detail: serde_json::Value,
}

/// One agent variant. The engine never branches on agent identity beyond looking
/// the implementation up by slug.
#[async_trait]
pub trait AgentCapability: Send + Sync {
    async fn analyze(&self, _ctx: &mut AgentContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn decide(&self, ctx: &AgentContext) -> anyhow::Result<AgentDecision>;

    /// Performs an allowed action. Errors are effector failures.
    async fn execute(&self, ctx: &AgentContext, action: &ProposedAction) -> anyhow::Result<ActionOutcome>;

    /// Post-condition check over the performed actions.
    async fn verify(&self, _ctx: &AgentContext, _outcomes: &[ActionOutcome]) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn AgentCapability>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent_slug: &str, agent: Arc<dyn AgentCapability>) -> &mut Self {
        self.agents.insert(agent_slug.to_string(), agent);
        self
    }

    pub fn with(mut self, agent_slug: &str, agent: Arc<dyn AgentCapability>) -> Self {
        self.register(agent_slug, agent);
        self
    }

    pub fn get(&self, agent_slug: &str) -> Option<Arc<dyn AgentCapability>> {
        self.agents.get(agent_slug).cloned()
    }

    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.agents.keys().cloned().collect();
        slugs.sort();
        slugs
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry").field("agents", &self.slugs()).finish()
    }
}

/// Clamps to [0, 1]; NaN becomes 0.
pub fn clamp_confidence(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

pub(crate) fn ensure_registered(registry: &AgentRegistry, agent_slug: &str) -> EngineResult<Arc<dyn AgentCapability>> {
    registry
        .get(agent_slug)
        .ok_or_else(|| crate::errors::EngineError::Config(format!("no agent registered for slug '{}'", agent_slug)))
}

#[cfg(test)]
mod tests {
    use super::{clamp_confidence, AgentDecision};

    #[test]
    fn confidence_is_clamped_into_unit_interval() {
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(-0.5), 0.0);
        assert_eq!(clamp_confidence(1.7), 1.0);
        assert_eq!(clamp_confidence(f64::INFINITY), 1.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
    }

    #[test]
    fn decision_deserializes_with_defaults() {
        let decision: AgentDecision = serde_json::from_value(serde_json::json!({
            "shouldAct": true,
            "confidenceScore": 0.8,
            "actions": [{ "actionKey": "create_task", "riskLevel": "medium" }]
        }))
        .expect("decision");
        assert_eq!(decision.actions.len(), 1);
        assert!(decision.actions[0].payload.is_null());
        assert_eq!(decision.tokens_used, 0);
    }
}
