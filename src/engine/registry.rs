// Agent registry - process-wide map from agent kind to implementation

//! # Agent Registry
//!
//! Agents are the executable nodes of a compiled workflow. Each kind is
//! registered once at process startup and looked up by the compiler when a
//! definition references it. The registry is read-only after startup, so a
//! plain `RwLock` sees no contention in steady state.
//!
//! New kinds are added by registering an implementation; no engine code
//! changes. The `execute` signature is uniform: current state in,
//! state fragment (or typed error) out.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::TenantContext;

/// Fields an agent contributes back to the execution state
pub type StateFragment = Map<String, Value>;

/// Result of a successful agent invocation
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub fragment: StateFragment,
    /// Optional message recorded on the step's checkpoint
    pub message: Option<String>,
}

impl From<StateFragment> for AgentOutcome {
    fn from(fragment: StateFragment) -> Self {
        AgentOutcome {
            fragment,
            message: None,
        }
    }
}

/// Error taxonomy governing the engine's response to a failed invocation
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// Transient (network, timeout, rate limit) - the engine retries with
    /// exponential backoff
    #[error("retryable: {0}")]
    Retryable(String),
    /// Invalid input or permission - fails the execution immediately
    #[error("fatal: {0}")]
    Fatal(String),
    /// Needs an out-of-band decision - pauses the execution
    #[error("human intervention required: {0}")]
    HumanRequired(String),
}

/// Per-invocation context handed to every agent.
///
/// `execution_id` doubles as the idempotency key for external side-effects;
/// the cancellation token must be checked at yield points (after I/O
/// completions and at loop boundaries).
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub execution_id: String,
    pub agent_id: String,
    pub tenant: TenantContext,
    pub cancellation: CancellationToken,
}

/// Capability set of an executable node
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique kind name, referenced by `AgentSpec::kind`
    fn kind(&self) -> &str;

    /// State fields this agent reads, derived from its configuration.
    /// Used by the compile-time state-schema closure check.
    fn input_fields(&self, _config: &Value) -> Vec<String> {
        Vec::new()
    }

    /// State fields this agent writes, derived from its configuration
    fn output_fields(&self, config: &Value) -> Vec<String>;

    /// Validate an opaque configuration at workflow compile time.
    /// Returns one message per distinct defect.
    fn validate_config(&self, config: &Value) -> Result<(), Vec<String>>;

    async fn execute(
        &self,
        state: &Map<String, Value>,
        config: &Value,
        ctx: &AgentContext,
    ) -> Result<AgentOutcome, AgentError>;
}

/// Process-wide registry from agent-kind name to implementation
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent kind. Idempotent for the same implementation;
    /// registering a different implementation under an existing name is an
    /// error.
    pub fn register(&self, agent: Arc<dyn Agent>) -> crate::Result<()> {
        let name = agent.kind().to_string();
        let mut agents = self
            .agents
            .write()
            .map_err(|_| crate::FlowForgeError::Internal("agent registry poisoned".to_string()))?;
        if let Some(existing) = agents.get(&name) {
            if Arc::ptr_eq(existing, &agent) {
                return Ok(());
            }
            return Err(crate::FlowForgeError::Conflict(format!(
                "agent kind '{}' already registered with a different implementation",
                name
            )));
        }
        agents.insert(name, agent);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().ok()?.get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .agents
            .read()
            .map(|agents| agents.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopAgent;

    #[async_trait]
    impl Agent for NoopAgent {
        fn kind(&self) -> &str {
            "noop"
        }

        fn output_fields(&self, _config: &Value) -> Vec<String> {
            Vec::new()
        }

        fn validate_config(&self, _config: &Value) -> Result<(), Vec<String>> {
            Ok(())
        }

        async fn execute(
            &self,
            _state: &Map<String, Value>,
            _config: &Value,
            _ctx: &AgentContext,
        ) -> Result<AgentOutcome, AgentError> {
            Ok(AgentOutcome::default())
        }
    }

    #[test]
    fn register_is_idempotent_for_same_impl() {
        let registry = AgentRegistry::new();
        let agent: Arc<dyn Agent> = Arc::new(NoopAgent);
        registry.register(agent.clone()).unwrap();
        registry.register(agent).unwrap();
        assert_eq!(registry.list(), vec!["noop"]);
    }

    #[test]
    fn register_rejects_colliding_impl() {
        let registry = AgentRegistry::new();
        registry.register(Arc::new(NoopAgent)).unwrap();
        let err = registry.register(Arc::new(NoopAgent)).unwrap_err();
        assert!(matches!(err, crate::FlowForgeError::Conflict(_)));
    }

    #[test]
    fn lookup_missing_kind() {
        let registry = AgentRegistry::new();
        assert!(registry.lookup("missing").is_none());
    }
}
