// Executions and checkpoints - one run of a workflow and its durable history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use super::{DocumentEnvelope, TenantDocument};

/// Lifecycle of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states accept no further signals or steps
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Typed failure recorded on a failed execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Machine-readable kind, e.g. `retry-exhausted`, `fatal-agent-error`
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// One run of a workflow definition.
///
/// Holds a `(workflow_id, workflow_version)` pair, never a pointer to a
/// mutable definition. The accumulated working set lives in `state`; the
/// durable step-by-step history lives in the execution's [`Checkpoint`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: String,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub initiated_by: String,
    pub status: ExecutionStatus,
    /// Accumulated working set, merged fragment by fragment
    pub state: Map<String, Value>,
    /// Agent ids currently eligible to run (or running)
    pub current_frontier: BTreeSet<String>,
    /// Agent ids that have completed successfully in this execution
    pub completed_agents: BTreeSet<String>,
    /// Number of checkpoints appended so far; the next sequence number
    pub checkpoint_count: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(flatten)]
    pub envelope: DocumentEnvelope,
}

impl Execution {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_version: u32,
        tenant_id: impl Into<String>,
        initiated_by: impl Into<String>,
        initial_state: Map<String, Value>,
    ) -> Self {
        let initiated_by = initiated_by.into();
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            workflow_version,
            initiated_by: initiated_by.clone(),
            status: ExecutionStatus::Pending,
            state: initial_state,
            current_frontier: BTreeSet::new(),
            completed_agents: BTreeSet::new(),
            checkpoint_count: 0,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            error: None,
            envelope: DocumentEnvelope::new(tenant_id, initiated_by),
        }
    }

    /// Stamp the terminal status and wall-clock duration
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<ExecutionError>) {
        debug_assert!(status.is_terminal());
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }
}

impl TenantDocument for Execution {
    const COLLECTION: &'static str = "executions";
    const RESOURCE_TYPE: &'static str = "Execution";

    fn doc_id(&self) -> String {
        self.execution_id.clone()
    }

    fn envelope(&self) -> &DocumentEnvelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut DocumentEnvelope {
        &mut self.envelope
    }
}

/// Append-only state snapshot within an execution.
///
/// Sequence numbers are gapless and start at 0; the snapshot at N is the
/// complete post-merge state, so rehydrating from the latest checkpoint alone
/// reconstructs the working set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: String,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub state_snapshot: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(flatten)]
    pub envelope: DocumentEnvelope,
}

impl Checkpoint {
    pub fn new(
        execution: &Execution,
        sequence_number: u64,
        completed_agent: Option<String>,
        message: Option<String>,
    ) -> Self {
        Self {
            execution_id: execution.execution_id.clone(),
            sequence_number,
            timestamp: Utc::now(),
            state_snapshot: execution.state.clone(),
            completed_agent,
            message,
            metadata: Value::Null,
            envelope: DocumentEnvelope::new(
                execution.envelope.tenant_id.clone(),
                execution.initiated_by.clone(),
            ),
        }
    }
}

impl TenantDocument for Checkpoint {
    const COLLECTION: &'static str = "checkpoints";
    const RESOURCE_TYPE: &'static str = "Checkpoint";

    fn doc_id(&self) -> String {
        format!("{}#{}", self.execution_id, self.sequence_number)
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

    #[test]
    fn finish_stamps_duration() {
        let mut exec = Execution::new("wf-1", 1, "t1", "u1", Map::new());
        exec.status = ExecutionStatus::Running;
        exec.finish(ExecutionStatus::Completed, None);
        assert!(exec.status.is_terminal());
        assert!(exec.ended_at.is_some());
        assert!(exec.duration_ms.is_some());
    }

    #[test]
    fn checkpoint_snapshots_current_state() {
        let mut exec = Execution::new("wf-1", 1, "t1", "u1", Map::new());
        exec.state.insert("x".to_string(), json!(1));
        let cp = Checkpoint::new(&exec, 0, None, None);
        assert_eq!(cp.state_snapshot["x"], json!(1));
        assert_eq!(cp.doc_id(), format!("{}#0", exec.execution_id));
        assert_eq!(cp.envelope.tenant_id, "t1");
    }

    #[test]
    fn non_terminal_statuses() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }
}
