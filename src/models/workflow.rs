// Workflow definitions - declarative DAG templates, versioned per tenant

//! # Workflow Definitions
//!
//! A [`WorkflowDefinition`] is the declarative template the graph compiler
//! turns into an executable DAG: a set of agent specs, the connections
//! between them (optionally conditional, optionally parallel), the entry
//! points and the declared state schema. Definitions are immutable once
//! `Active`; changes require a new version. Archival is a soft delete.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DocumentEnvelope, TenantDocument};

/// Lifecycle of a workflow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Archived,
}

/// One node of the workflow: an agent kind plus its opaque configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Unique within the workflow
    pub id: String,
    /// Registered agent kind name
    pub kind: String,
    /// Opaque configuration, decoded by the agent's `validate_config`
    #[serde(default)]
    pub config: Value,
}

/// What the engine does when an agent on this edge exhausts its retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Fail,
    /// Treat the agent as complete with an error marker in state
    Continue,
}

/// A directed edge of the DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
    /// Safe expression evaluated against the current state; `None` means the
    /// edge always matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Fan out to every matching sibling edge instead of first-match-wins
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub on_error: OnError,
}

/// Declared type of a state field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateFieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

/// One declared field of the workflow's working state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: StateFieldType,
}

/// Declarative DAG template, versioned per tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Opaque identifier, unique per tenant (shared across versions)
    pub id: String,
    pub name: String,
    pub version: u32,
    pub status: WorkflowStatus,
    pub agents: Vec<AgentSpec>,
    pub connections: Vec<Connection>,
    /// Agent ids with no inbound edges; execution starts here
    pub entry_points: Vec<String>,
    #[serde(default)]
    pub state_schema: Vec<StateField>,
    /// Wall-clock limit for one execution; unbounded when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
    /// Aggregated from completed executions
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub average_execution_ms: f64,
    #[serde(flatten)]
    pub envelope: DocumentEnvelope,
}

impl WorkflowDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        tenant_id: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: 1,
            status: WorkflowStatus::Draft,
            agents: Vec::new(),
            connections: Vec::new(),
            entry_points: Vec::new(),
            state_schema: Vec::new(),
            max_duration_ms: None,
            execution_count: 0,
            average_execution_ms: 0.0,
            envelope: DocumentEnvelope::new(tenant_id, created_by),
        }
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    /// Edges leaving `agent_id`, in declaration order
    pub fn outbound<'a, 'b>(&'a self, agent_id: &'b str) -> impl Iterator<Item = &'a Connection> + use<'a, 'b> {
        self.connections.iter().filter(move |c| c.from == agent_id)
    }

    /// Edges arriving at `agent_id`, in declaration order
    pub fn inbound<'a, 'b>(&'a self, agent_id: &'b str) -> impl Iterator<Item = &'a Connection> + use<'a, 'b> {
        self.connections.iter().filter(move |c| c.to == agent_id)
    }

    /// Active definitions are frozen; only drafts may be edited in place
    pub fn is_mutable(&self) -> bool {
        self.status == WorkflowStatus::Draft
    }

    /// Fold a finished execution into the aggregate stats
    pub fn record_execution(&mut self, duration_ms: u64) {
        let total = self.average_execution_ms * self.execution_count as f64 + duration_ms as f64;
        self.execution_count += 1;
        self.average_execution_ms = total / self.execution_count as f64;
    }
}

impl TenantDocument for WorkflowDefinition {
    const COLLECTION: &'static str = "workflows";
    const RESOURCE_TYPE: &'static str = "Workflow";

    fn doc_id(&self) -> String {
        // Versions of one workflow are distinct documents
        format!("{}@{}", self.id, self.version)
    }

    fn envelope(&self) -> &DocumentEnvelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut DocumentEnvelope {
        &mut self.envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> WorkflowDefinition {
        let mut wf = WorkflowDefinition::new("wf-1", "Inspection intake", "t1", "u1");
        wf.agents = vec![
            AgentSpec {
                id: "a".to_string(),
                kind: "checkpoint".to_string(),
                config: json!({}),
            },
            AgentSpec {
                id: "b".to_string(),
                kind: "checkpoint".to_string(),
                config: json!({}),
            },
        ];
        wf.connections = vec![Connection {
            from: "a".to_string(),
            to: "b".to_string(),
            condition: None,
            parallel: false,
            on_error: OnError::Fail,
        }];
        wf.entry_points = vec!["a".to_string()];
        wf
    }

    #[test]
    fn adjacency_helpers_follow_declaration_order() {
        let wf = sample();
        assert_eq!(wf.outbound("a").count(), 1);
        assert_eq!(wf.inbound("b").next().unwrap().from, "a");
        assert!(wf.agent("missing").is_none());
    }

    #[test]
    fn execution_stats_average() {
        let mut wf = sample();
        wf.record_execution(100);
        wf.record_execution(300);
        assert_eq!(wf.execution_count, 2);
        assert!((wf.average_execution_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn doc_id_includes_version() {
        let mut wf = sample();
        wf.version = 3;
        assert_eq!(wf.doc_id(), "wf-1@3");
    }

    #[test]
    fn serde_round_trip_keeps_envelope_flat() {
        let wf = sample();
        let value = serde_json::to_value(&wf).unwrap();
        assert_eq!(value["tenant_id"], "t1");
        assert_eq!(value["status"], "draft");
        let back: WorkflowDefinition = serde_json::from_value(value).unwrap();
        assert_eq!(back.envelope.tenant_id, "t1");
    }
}
