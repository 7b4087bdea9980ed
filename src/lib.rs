pub mod agent;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod gatekeeper;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod policy;
pub mod scheduler;
pub mod velocity;

pub use crate::agent::{ActionOutcome, AgentCapability, AgentContext, AgentDecision, AgentRegistry, ProposedAction};
pub use crate::engine::{EngineCore, MaintenanceReport};
pub use crate::errors::{EngineError, EngineResult};
pub use crate::gatekeeper::{DenyReason, GateDecision};
pub use crate::scheduler::TickReport;
pub use crate::velocity::GithubAnalyzer;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the JSON file logger under `log_dir`. Embedders that bring their own
/// subscriber can skip this; a second call reports the already-set subscriber.
pub fn init_tracing(log_dir: &Path) -> EngineResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| EngineError::Config(error.to_string()))
}
