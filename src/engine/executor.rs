// Execution engine - frontier scheduling, checkpointing, signals, recovery

//! # Execution Engine
//!
//! One driver task per active execution. The driver owns a cooperative
//! scheduling loop: it computes the runnable frontier, spawns agent
//! invocations as tasks (concurrently when the graph permits), and processes
//! completions one at a time. Each processed completion is an atomic step:
//! merge the state fragment, append a checkpoint, update the frontier and
//! record the state-transition audit event in one commit scope. A checkpoint
//! is durable before any downstream agent observes the new state.
//!
//! Signals: pause lets in-flight invocations finish and checkpoint but
//! starts nothing new; resume re-evaluates the frontier; cancel fires the
//! execution's cancellation token, waits out the grace interval and discards
//! late results. On process restart [`ExecutionEngine::recover`] rehydrates
//! every running or paused execution from its latest checkpoint and
//! reschedules the agents that were in flight; agents are idempotent by
//! contract, keyed on `(execution_id, agent_id)`.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineSettings;
use crate::metrics::Metrics;
use crate::models::audit::{AuditEvent, AuditEventType};
use crate::models::execution::{Checkpoint, Execution, ExecutionError, ExecutionStatus};
use crate::models::workflow::{OnError, WorkflowStatus};
use crate::models::{TenantContext, TenantDocument};
use crate::storage::ExecutionStore;
use crate::{FlowForgeError, Result};

use super::compiler::{compile, CompiledGraph};
use super::registry::{AgentContext, AgentError, AgentOutcome, AgentRegistry};

/// Engine tuning knobs, derived from [`EngineSettings`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_agent_timeout: Duration,
    pub cancel_grace: Duration,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    /// Checkpoints returned by `observe`
    pub observe_checkpoint_limit: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_agent_timeout: Duration::from_secs(60),
            cancel_grace: Duration::from_secs(30),
            retry_max_attempts: 5,
            retry_initial_backoff: Duration::from_secs(1),
            retry_max_backoff: Duration::from_secs(30),
            observe_checkpoint_limit: 20,
        }
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            default_agent_timeout: settings.default_agent_timeout,
            cancel_grace: settings.cancel_grace,
            retry_max_attempts: settings.retry_max_attempts,
            ..Self::default()
        }
    }
}

/// Lifecycle signals accepted by [`ExecutionEngine::signal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionSignal {
    Pause,
    Resume,
    Cancel,
}

/// Snapshot returned by [`ExecutionEngine::observe`]
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionView {
    #[serde(flatten)]
    pub execution: Execution,
    pub recent_checkpoints: Vec<Checkpoint>,
}

/// Mutable per-execution state, guarded by the tracker's lock
struct TrackerState {
    execution: Execution,
    /// Agents currently invoked (tasks in the driver's join set)
    running: HashSet<String>,
    /// Edges activated by completed sources; conditional edges only enter
    /// this set when their condition matched at source-completion time
    activated: HashSet<(String, String)>,
}

/// In-memory tracker for one active execution
struct ExecutionTracker {
    execution_id: String,
    ctx: TenantContext,
    graph: Arc<CompiledGraph>,
    cancel: CancellationToken,
    resume_notify: Notify,
    /// Wall-clock limit for this run, when the definition declares one.
    /// Restarts the clock on recovery.
    deadline: Option<tokio::time::Instant>,
    /// The per-execution lock: frontier updates are atomic with checkpoint
    /// bookkeeping
    inner: Mutex<TrackerState>,
}

/// Pending forever when the execution has no wall-clock limit
async fn until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The workflow execution engine
pub struct ExecutionEngine {
    store: ExecutionStore,
    registry: Arc<AgentRegistry>,
    config: EngineConfig,
    metrics: Arc<Metrics>,
    /// Compiled-graph cache, keyed by (workflow_id, version). Only Active
    /// definitions are cached; drafts recompile on every save.
    graphs: DashMap<(String, u32), Arc<CompiledGraph>>,
    active: DashMap<String, Arc<ExecutionTracker>>,
}

impl ExecutionEngine {
    pub fn new(
        store: ExecutionStore,
        registry: Arc<AgentRegistry>,
        config: EngineConfig,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            config,
            metrics,
            graphs: DashMap::new(),
            active: DashMap::new(),
        })
    }

    pub fn store(&self) -> &ExecutionStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Number of executions currently tracked in memory
    pub fn active_executions(&self) -> usize {
        self.active.len()
    }

    /// Compile a definition, caching the result for Active versions
    pub fn compile_definition(
        &self,
        definition: &crate::models::WorkflowDefinition,
    ) -> Result<Arc<CompiledGraph>> {
        let key = (definition.id.clone(), definition.version);
        if definition.status == WorkflowStatus::Active {
            if let Some(cached) = self.graphs.get(&key) {
                return Ok(cached.clone());
            }
        }
        let graph = Arc::new(
            compile(definition, &self.registry, self.config.default_agent_timeout)
                .map_err(FlowForgeError::from)?,
        );
        if definition.status == WorkflowStatus::Active {
            self.graphs.insert(key, graph.clone());
        }
        Ok(graph)
    }

    /// Start an execution of the workflow's newest version.
    ///
    /// Returns as soon as the execution record and its initial checkpoint
    /// are durable; the DAG traversal runs in a background driver task.
    pub async fn start(
        self: &Arc<Self>,
        ctx: &TenantContext,
        workflow_id: &str,
        initial_state: Map<String, Value>,
    ) -> Result<String> {
        let definition = self.store.load_definition(ctx, workflow_id, None).await?;
        if definition.status != WorkflowStatus::Active {
            return Err(FlowForgeError::validation(format!(
                "workflow '{}' is not active and cannot be executed",
                workflow_id
            )));
        }
        let graph = self.compile_definition(&definition)?;

        let mut execution = Execution::new(
            definition.id.clone(),
            definition.version,
            ctx.tenant_id.clone(),
            ctx.user_id.clone(),
            initial_state,
        );
        execution.status = ExecutionStatus::Running;
        execution.current_frontier = graph.entry_points.iter().cloned().collect();
        let execution = self.store.create_execution(ctx, execution).await?;
        self.metrics.executions_started.inc();
        info!(
            execution_id = %execution.execution_id,
            workflow_id = %definition.id,
            version = definition.version,
            "execution started"
        );

        let execution_id = execution.execution_id.clone();
        let deadline = graph
            .max_duration
            .map(|limit| tokio::time::Instant::now() + limit);
        let tracker = Arc::new(ExecutionTracker {
            execution_id: execution_id.clone(),
            ctx: ctx.clone(),
            graph,
            cancel: CancellationToken::new(),
            resume_notify: Notify::new(),
            deadline,
            inner: Mutex::new(TrackerState {
                execution,
                running: HashSet::new(),
                activated: HashSet::new(),
            }),
        });
        self.active.insert(execution_id.clone(), tracker.clone());
        self.spawn_driver(tracker);
        Ok(execution_id)
    }

    /// Pause, resume or cancel an execution
    pub async fn signal(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        signal: ExecutionSignal,
    ) -> Result<()> {
        // Tenant-scoped load first: cross-tenant signals surface as 404
        let persisted = self.store.load_execution(ctx, execution_id).await?;
        if persisted.status.is_terminal() {
            return Err(FlowForgeError::Conflict(format!(
                "execution is already {:?}",
                persisted.status
            )));
        }
        let tracker = self
            .active
            .get(execution_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                FlowForgeError::Conflict("execution is not active on this node".to_string())
            })?;

        match signal {
            ExecutionSignal::Pause => {
                let mut state = tracker.inner.lock().await;
                if state.execution.status != ExecutionStatus::Running {
                    return Err(FlowForgeError::Conflict(
                        "only running executions can be paused".to_string(),
                    ));
                }
                state.execution.status = ExecutionStatus::Paused;
                self.store
                    .update_execution(&tracker.ctx, &state.execution, Vec::new())
                    .await?;
                info!(execution_id, "execution paused");
            }
            ExecutionSignal::Resume => {
                {
                    let mut state = tracker.inner.lock().await;
                    if state.execution.status != ExecutionStatus::Paused {
                        return Err(FlowForgeError::Conflict(
                            "only paused executions can be resumed".to_string(),
                        ));
                    }
                    state.execution.status = ExecutionStatus::Running;
                    self.store
                        .update_execution(&tracker.ctx, &state.execution, Vec::new())
                        .await?;
                }
                tracker.resume_notify.notify_waiters();
                info!(execution_id, "execution resumed");
            }
            ExecutionSignal::Cancel => {
                tracker.cancel.cancel();
                info!(execution_id, "execution cancel requested");
            }
        }
        Ok(())
    }

    /// Current status, state and recent checkpoints
    pub async fn observe(&self, ctx: &TenantContext, execution_id: &str) -> Result<ExecutionView> {
        let execution = self.store.load_execution(ctx, execution_id).await?;
        let from = execution
            .checkpoint_count
            .saturating_sub(self.config.observe_checkpoint_limit);
        let recent_checkpoints = self
            .store
            .list_checkpoints(ctx, execution_id, from)
            .await?;
        Ok(ExecutionView {
            execution,
            recent_checkpoints,
        })
    }

    /// Rehydrate every running or paused execution after a restart.
    /// In-flight agents at crash time are rescheduled.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let system = TenantContext::system("platform");
        let candidates = self.store.recovery_candidates(&system).await?;
        let mut recovered = 0;
        for mut execution in candidates {
            if self.active.contains_key(&execution.execution_id) {
                continue;
            }
            let tenant_ctx = TenantContext::system(execution.envelope.tenant_id.clone());
            let definition = match self
                .store
                .load_definition(
                    &tenant_ctx,
                    &execution.workflow_id,
                    Some(execution.workflow_version),
                )
                .await
            {
                Ok(definition) => definition,
                Err(err) => {
                    error!(
                        execution_id = %execution.execution_id,
                        %err,
                        "recovery skipped: definition unavailable"
                    );
                    continue;
                }
            };
            let graph = match self.compile_definition(&definition) {
                Ok(graph) => graph,
                Err(err) => {
                    error!(
                        execution_id = %execution.execution_id,
                        %err,
                        "recovery skipped: definition no longer compiles"
                    );
                    continue;
                }
            };

            // The latest durable snapshot is authoritative; results of agents
            // in flight at crash time are treated as lost
            if let Some(checkpoint) = self
                .store
                .load_latest_checkpoint(&tenant_ctx, &execution.execution_id)
                .await?
            {
                execution.state = checkpoint.state_snapshot;
            }

            // Re-derive edge activations from the completed set and the
            // recovered state; deterministic given both
            let mut activated = HashSet::new();
            for completed in execution.completed_agents.clone() {
                if let Some(node) = graph.node(&completed) {
                    activate_outbound(&graph, node, &execution.state, &mut activated);
                }
            }

            let execution_id = execution.execution_id.clone();
            let deadline = graph
                .max_duration
                .map(|limit| tokio::time::Instant::now() + limit);
            let tracker = Arc::new(ExecutionTracker {
                execution_id: execution_id.clone(),
                ctx: tenant_ctx,
                graph,
                cancel: CancellationToken::new(),
                resume_notify: Notify::new(),
                deadline,
                inner: Mutex::new(TrackerState {
                    execution,
                    running: HashSet::new(),
                    activated,
                }),
            });
            self.active.insert(execution_id.clone(), tracker.clone());
            self.spawn_driver(tracker);
            recovered += 1;
            info!(execution_id = %execution_id, "execution rehydrated");
        }
        Ok(recovered)
    }

    fn spawn_driver(self: &Arc<Self>, tracker: Arc<ExecutionTracker>) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.drive(tracker).await;
        });
    }

    /// The scheduling loop of one execution
    async fn drive(self: Arc<Self>, tracker: Arc<ExecutionTracker>) {
        let mut join_set: JoinSet<(String, std::result::Result<AgentOutcome, AgentError>)> =
            JoinSet::new();
        loop {
            if tracker.cancel.is_cancelled() {
                self.finalize_cancelled(&tracker, &mut join_set).await;
                break;
            }

            // Schedule runnable agents (none while paused)
            let to_spawn: Vec<String> = {
                let mut state = tracker.inner.lock().await;
                if state.execution.status.is_terminal() {
                    break;
                }
                if state.execution.status == ExecutionStatus::Paused {
                    Vec::new()
                } else {
                    let runnable = runnable_agents(&tracker.graph, &state);
                    for agent_id in &runnable {
                        state.running.insert(agent_id.clone());
                    }
                    let frontier: BTreeSet<String> = state.running.iter().cloned().collect();
                    state.execution.current_frontier = frontier;
                    runnable
                }
            };
            for agent_id in to_spawn {
                let engine = self.clone();
                let tracker = tracker.clone();
                join_set.spawn(async move {
                    let result = engine.invoke_with_retry(&tracker, &agent_id).await;
                    (agent_id, result)
                });
            }

            if join_set.is_empty() {
                // Register interest before re-checking so a resume between
                // the check and the await is not lost
                let notified = tracker.resume_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let paused = {
                    let state = tracker.inner.lock().await;
                    state.execution.status == ExecutionStatus::Paused
                };
                if paused {
                    tokio::select! {
                        _ = tracker.cancel.cancelled() => {
                            self.finalize_cancelled(&tracker, &mut join_set).await;
                            break;
                        }
                        _ = until_deadline(tracker.deadline) => {
                            self.finalize_failed(
                                &tracker,
                                None,
                                "execution-timeout",
                                "execution exceeded its wall-clock limit".to_string(),
                            )
                            .await;
                            break;
                        }
                        _ = &mut notified => continue,
                    }
                } else {
                    self.finalize_quiescent(&tracker).await;
                    break;
                }
            } else {
                tokio::select! {
                    _ = tracker.cancel.cancelled() => {
                        self.finalize_cancelled(&tracker, &mut join_set).await;
                        break;
                    }
                    _ = until_deadline(tracker.deadline) => {
                        self.finalize_failed(
                            &tracker,
                            None,
                            "execution-timeout",
                            "execution exceeded its wall-clock limit".to_string(),
                        )
                        .await;
                        join_set.abort_all();
                        break;
                    }
                    joined = join_set.join_next() => {
                        match joined {
                            Some(Ok((agent_id, result))) => {
                                let terminal = self
                                    .process_step(&tracker, &agent_id, result)
                                    .await;
                                if terminal {
                                    join_set.abort_all();
                                    break;
                                }
                            }
                            Some(Err(join_err)) => {
                                // A panicking agent is programmer error; the
                                // execution fails, the process survives
                                error!(
                                    execution_id = %tracker.execution_id,
                                    %join_err,
                                    "agent task aborted"
                                );
                                self.finalize_failed(
                                    &tracker,
                                    None,
                                    "agent-panic",
                                    join_err.to_string(),
                                )
                                .await;
                                join_set.abort_all();
                                break;
                            }
                            None => {}
                        }
                    }
                }
            }
        }
        self.active.remove(&tracker.execution_id);
    }

    /// Invoke one agent with timeout and exponential backoff. Returns the
    /// final outcome; every failed attempt is recorded as an audit event.
    async fn invoke_with_retry(
        &self,
        tracker: &Arc<ExecutionTracker>,
        agent_id: &str,
    ) -> std::result::Result<AgentOutcome, AgentError> {
        let node = tracker
            .graph
            .node(agent_id)
            .expect("scheduled agent exists in graph");
        let state_snapshot = {
            let state = tracker.inner.lock().await;
            state.execution.state.clone()
        };
        let agent_ctx = AgentContext {
            execution_id: tracker.execution_id.clone(),
            agent_id: agent_id.to_string(),
            tenant: tracker.ctx.clone(),
            cancellation: tracker.cancel.child_token(),
        };

        let mut backoff = self.config.retry_initial_backoff;
        let max_attempts = self.config.retry_max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(
                node.timeout,
                node.agent.execute(&state_snapshot, &node.config, &agent_ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AgentError::Retryable(format!(
                    "invocation exceeded {:?}",
                    node.timeout
                ))),
            };
            self.metrics
                .agent_invocation_duration
                .with_label_values(&[&node.kind])
                .observe(started.elapsed().as_secs_f64());

            let err = match outcome {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };
            let will_retry =
                matches!(err, AgentError::Retryable(_)) && attempt < max_attempts;
            self.record_attempt(tracker, agent_id, attempt, &err, will_retry)
                .await;
            if !will_retry {
                return Err(err);
            }
            self.metrics
                .agent_retries
                .with_label_values(&[&node.kind])
                .inc();
            tokio::select! {
                _ = tracker.cancel.cancelled() => {
                    return Err(AgentError::Retryable("invocation cancelled".to_string()));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.retry_max_backoff);
        }
        unreachable!("retry loop always returns")
    }

    async fn record_attempt(
        &self,
        tracker: &Arc<ExecutionTracker>,
        agent_id: &str,
        attempt: u32,
        err: &AgentError,
        will_retry: bool,
    ) {
        let event = AuditEvent::new(
            AuditEventType::StateTransition,
            Execution::RESOURCE_TYPE,
            tracker.execution_id.clone(),
            &tracker.ctx,
        )
        .with_metadata(json!({
            "agent_id": agent_id,
            "attempt": attempt,
            "error": err.to_string(),
            "will_retry": will_retry,
        }));
        if let Err(record_err) = self.store.append_audit_event(event).await {
            warn!(
                execution_id = %tracker.execution_id,
                %record_err,
                "failed to record invocation attempt"
            );
        }
    }

    /// Process one completed invocation as an atomic step. Returns true when
    /// the execution reached a terminal status.
    async fn process_step(
        &self,
        tracker: &Arc<ExecutionTracker>,
        agent_id: &str,
        result: std::result::Result<AgentOutcome, AgentError>,
    ) -> bool {
        // Results racing a cancel signal are discarded; the driver loop
        // finalizes the cancellation on its next pass
        if tracker.cancel.is_cancelled() {
            self.clear_running(tracker, agent_id).await;
            return false;
        }
        match result {
            Ok(outcome) => self.apply_success(tracker, agent_id, outcome, None).await,
            Err(AgentError::Retryable(message)) => {
                // Retries exhausted inside invoke_with_retry
                if on_error_continue(tracker, agent_id).await {
                    let mut marker = Map::new();
                    marker.insert(format!("{}_error", agent_id), json!(message));
                    let outcome = AgentOutcome {
                        fragment: marker,
                        message: Some(format!("completed with error: {}", message)),
                    };
                    self.apply_success(tracker, agent_id, outcome, Some(message))
                        .await
                } else {
                    self.clear_running(tracker, agent_id).await;
                    self.finalize_failed(
                        tracker,
                        Some(agent_id.to_string()),
                        "retry-exhausted",
                        message,
                    )
                    .await;
                    true
                }
            }
            Err(AgentError::Fatal(message)) => {
                self.clear_running(tracker, agent_id).await;
                self.finalize_failed(
                    tracker,
                    Some(agent_id.to_string()),
                    "fatal-agent-error",
                    message,
                )
                .await;
                true
            }
            Err(AgentError::HumanRequired(message)) => {
                // The agent stays incomplete; resuming reschedules it
                let mut state = tracker.inner.lock().await;
                state.running.remove(agent_id);
                state.execution.status = ExecutionStatus::Paused;
                let event = AuditEvent::new(
                    AuditEventType::StateTransition,
                    Execution::RESOURCE_TYPE,
                    tracker.execution_id.clone(),
                    &tracker.ctx,
                )
                .for_tenant(state.execution.envelope.tenant_id.clone())
                .with_metadata(json!({
                    "status": "paused",
                    "reason": "human-required",
                    "agent_id": agent_id,
                    "message": message,
                }));
                if let Err(err) = self
                    .store
                    .update_execution(&tracker.ctx, &state.execution, vec![event])
                    .await
                {
                    error!(execution_id = %tracker.execution_id, %err, "failed to persist pause");
                }
                info!(
                    execution_id = %tracker.execution_id,
                    agent_id,
                    "execution paused pending human decision"
                );
                false
            }
        }
    }

    /// Merge a fragment, checkpoint, recompute the frontier and detect
    /// completion - all under the per-execution lock
    async fn apply_success(
        &self,
        tracker: &Arc<ExecutionTracker>,
        agent_id: &str,
        outcome: AgentOutcome,
        error_marker: Option<String>,
    ) -> bool {
        let mut state = tracker.inner.lock().await;
        state.running.remove(agent_id);

        // Last-writer-wins per field; parallel branches were proven disjoint
        // at compile time
        for (field, value) in outcome.fragment {
            state.execution.state.insert(field, value);
        }
        state.execution.completed_agents.insert(agent_id.to_string());

        if let Some(node) = tracker.graph.node(agent_id) {
            let TrackerState {
                execution,
                activated,
                ..
            } = &mut *state;
            activate_outbound(&tracker.graph, node, &execution.state, activated);
        }

        let frontier = runnable_agents(&tracker.graph, &state);
        let completed_execution = frontier.is_empty() && state.running.is_empty();
        let new_frontier: BTreeSet<String> = frontier
            .iter()
            .cloned()
            .chain(state.running.iter().cloned())
            .collect();
        state.execution.current_frontier = new_frontier;

        let sequence = state.execution.checkpoint_count;
        state.execution.checkpoint_count += 1;
        if completed_execution {
            state.execution.finish(ExecutionStatus::Completed, None);
        }
        let checkpoint = Checkpoint::new(&state.execution, sequence, Some(agent_id.to_string()), outcome.message);
        let mut metadata = json!({
            "agent_id": agent_id,
            "sequence_number": sequence,
            "status": state.execution.status,
        });
        if let Some(error) = &error_marker {
            metadata["continued_after_error"] = json!(error);
        }

        if let Err(err) = self
            .store
            .append_step(&tracker.ctx, &state.execution, checkpoint, metadata)
            .await
        {
            error!(
                execution_id = %tracker.execution_id,
                agent_id,
                %err,
                "failed to persist step"
            );
            drop(state);
            self.finalize_failed(
                tracker,
                Some(agent_id.to_string()),
                "checkpoint-write-failed",
                err.to_string(),
            )
            .await;
            return true;
        }
        debug!(
            execution_id = %tracker.execution_id,
            agent_id,
            sequence,
            "step checkpointed"
        );

        if completed_execution {
            self.metrics.executions_completed.inc();
            let duration_ms = state.execution.duration_ms.unwrap_or(0);
            let workflow_id = state.execution.workflow_id.clone();
            let version = state.execution.workflow_version;
            drop(state);
            if let Err(err) = self
                .store
                .record_workflow_completion(&tracker.ctx, &workflow_id, version, duration_ms)
                .await
            {
                warn!(workflow_id = %workflow_id, %err, "failed to update workflow stats");
            }
            info!(execution_id = %tracker.execution_id, "execution completed");
            return true;
        }
        false
    }

    async fn clear_running(&self, tracker: &Arc<ExecutionTracker>, agent_id: &str) {
        let mut state = tracker.inner.lock().await;
        state.running.remove(agent_id);
    }

    async fn finalize_failed(
        &self,
        tracker: &Arc<ExecutionTracker>,
        agent_id: Option<String>,
        kind: &str,
        message: String,
    ) {
        let mut state = tracker.inner.lock().await;
        if state.execution.status.is_terminal() {
            return;
        }
        state.execution.current_frontier.clear();
        state.execution.finish(
            ExecutionStatus::Failed,
            Some(ExecutionError {
                kind: kind.to_string(),
                message: message.clone(),
                agent_id: agent_id.clone(),
            }),
        );
        let tenant = state.execution.envelope.tenant_id.clone();
        let transition = AuditEvent::new(
            AuditEventType::StateTransition,
            Execution::RESOURCE_TYPE,
            tracker.execution_id.clone(),
            &tracker.ctx,
        )
        .for_tenant(tenant.clone())
        .with_metadata(json!({
            "status": "failed",
            "error_kind": kind,
            "agent_id": agent_id,
        }));
        // A terminated branch additionally records an Error-typed resource
        let error_event = AuditEvent::new(
            AuditEventType::StateTransition,
            "Error",
            tracker.execution_id.clone(),
            &tracker.ctx,
        )
        .for_tenant(tenant)
        .with_metadata(json!({
            "kind": kind,
            "message": message,
            "agent_id": agent_id,
        }));
        if let Err(err) = self
            .store
            .update_execution(&tracker.ctx, &state.execution, vec![transition, error_event])
            .await
        {
            error!(execution_id = %tracker.execution_id, %err, "failed to persist failure");
        }
        self.metrics.executions_failed.inc();
        warn!(
            execution_id = %tracker.execution_id,
            kind,
            %message,
            "execution failed"
        );
    }

    /// Cancel path: wait out the grace interval for in-flight tasks, discard
    /// their results, keep every checkpoint written before the signal
    async fn finalize_cancelled(
        &self,
        tracker: &Arc<ExecutionTracker>,
        join_set: &mut JoinSet<(String, std::result::Result<AgentOutcome, AgentError>)>,
    ) {
        let drain = async {
            while join_set.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.cancel_grace, drain).await.is_err() {
            warn!(
                execution_id = %tracker.execution_id,
                "cancel grace elapsed, aborting in-flight agents"
            );
            join_set.abort_all();
        }

        let mut state = tracker.inner.lock().await;
        if state.execution.status.is_terminal() {
            return;
        }
        state.running.clear();
        state.execution.current_frontier.clear();
        state.execution.finish(ExecutionStatus::Cancelled, None);
        let event = AuditEvent::new(
            AuditEventType::StateTransition,
            Execution::RESOURCE_TYPE,
            tracker.execution_id.clone(),
            &tracker.ctx,
        )
        .for_tenant(state.execution.envelope.tenant_id.clone())
        .with_metadata(json!({"status": "cancelled"}));
        if let Err(err) = self
            .store
            .update_execution(&tracker.ctx, &state.execution, vec![event])
            .await
        {
            error!(execution_id = %tracker.execution_id, %err, "failed to persist cancellation");
        }
        self.metrics.executions_cancelled.inc();
        info!(execution_id = %tracker.execution_id, "execution cancelled");
    }

    /// A resumed execution with nothing runnable and nothing running has
    /// terminated every branch
    async fn finalize_quiescent(&self, tracker: &Arc<ExecutionTracker>) {
        let mut state = tracker.inner.lock().await;
        if state.execution.status.is_terminal() {
            return;
        }
        state.execution.current_frontier.clear();
        state.execution.finish(ExecutionStatus::Completed, None);
        let event = AuditEvent::new(
            AuditEventType::StateTransition,
            Execution::RESOURCE_TYPE,
            tracker.execution_id.clone(),
            &tracker.ctx,
        )
        .for_tenant(state.execution.envelope.tenant_id.clone())
        .with_metadata(json!({"status": "completed", "reason": "no runnable agents"}));
        if let Err(err) = self
            .store
            .update_execution(&tracker.ctx, &state.execution, vec![event])
            .await
        {
            error!(execution_id = %tracker.execution_id, %err, "failed to persist completion");
        }
        self.metrics.executions_completed.inc();
    }
}

/// Evaluate the outbound edges of a freshly completed node and mark the
/// matching ones as activated. Parallel edges fan out to every match; a
/// sequential group takes the first declared match only.
fn activate_outbound(
    graph: &CompiledGraph,
    node: &super::compiler::CompiledNode,
    state: &Map<String, Value>,
    activated: &mut HashSet<(String, String)>,
) {
    let mut sequential_taken = false;
    for &edge_idx in &node.outbound {
        let edge = &graph.edges[edge_idx];
        let matches = edge
            .condition
            .as_ref()
            .map(|condition| condition.matches(state))
            .unwrap_or(true);
        if !matches {
            continue;
        }
        if edge.parallel {
            activated.insert((edge.from.clone(), edge.to.clone()));
        } else if !sequential_taken {
            activated.insert((edge.from.clone(), edge.to.clone()));
            sequential_taken = true;
        }
    }
}

/// An agent is runnable iff it is neither completed nor running, every
/// upstream agent through a non-conditional edge has completed, and at least
/// one inbound edge has been activated. Entry agents (no inbound edges) are
/// runnable until they complete.
fn runnable_agents(graph: &CompiledGraph, state: &TrackerState) -> Vec<String> {
    let completed = &state.execution.completed_agents;
    graph
        .topo_order
        .iter()
        .filter(|agent_id| {
            let agent_id = agent_id.as_str();
            if completed.contains(agent_id) || state.running.contains(agent_id) {
                return false;
            }
            let node = match graph.node(agent_id) {
                Some(node) => node,
                None => return false,
            };
            if node.inbound.is_empty() {
                return true;
            }
            let unconditional_done = node.inbound.iter().all(|&edge_idx| {
                let edge = &graph.edges[edge_idx];
                edge.condition.is_some() || completed.contains(&edge.from)
            });
            if !unconditional_done {
                return false;
            }
            node.inbound.iter().any(|&edge_idx| {
                let edge = &graph.edges[edge_idx];
                state
                    .activated
                    .contains(&(edge.from.clone(), edge.to.clone()))
            })
        })
        .cloned()
        .collect()
}

/// Retry exhaustion continues instead of failing when any activated inbound
/// edge of the agent is marked `on_error: continue`
async fn on_error_continue(tracker: &Arc<ExecutionTracker>, agent_id: &str) -> bool {
    let state = tracker.inner.lock().await;
    let node = match tracker.graph.node(agent_id) {
        Some(node) => node,
        None => return false,
    };
    if node.inbound.is_empty() {
        return false;
    }
    node.inbound.iter().any(|&edge_idx| {
        let edge = &tracker.graph.edges[edge_idx];
        edge.on_error == OnError::Continue
            && state
                .activated
                .contains(&(edge.from.clone(), edge.to.clone()))
    })
}
