// Graph compiler - validates a definition and builds the executable DAG

//! # Workflow Factory
//!
//! Compilation catches design errors at save time, not run time. The checks
//! run in a fixed order and report one [`ValidationError`] per distinct
//! defect:
//!
//! 1. every referenced agent kind exists in the registry
//! 2. per-agent `validate_config` passes
//! 3. edge endpoints resolve and edge conditions parse
//! 4. the graph has at least one entry point and declared entries have no
//!    inbound edges
//! 5. the graph is acyclic (Kahn's algorithm, reporting the cycle members)
//! 6. state-schema closure: every declared input is produced by ancestors on
//!    every path from an entry, and parallel branches write disjoint fields
//! 7. branch determinism: overlapping outbound edges require `parallel`
//!
//! Compilation is deterministic: nodes are keyed in a `BTreeMap` and edges
//! keep declaration order, so the same definition always yields the same
//! compiled form.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::models::expression::Expression;
use crate::models::workflow::{OnError, WorkflowDefinition};

use super::registry::{Agent, AgentRegistry};

/// One distinct defect found during compilation
#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    /// Stable machine-readable code, e.g. `unknown-agent-kind`
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.agent_id {
            Some(agent_id) => write!(f, "[{}] {}: {}", self.code, agent_id, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// All defects of one compilation attempt
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    fn push(&mut self, code: &'static str, agent_id: Option<&str>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            code,
            agent_id: agent_id.map(str::to_string),
            message: message.into(),
        });
    }
}

impl From<ValidationReport> for crate::FlowForgeError {
    fn from(report: ValidationReport) -> Self {
        crate::FlowForgeError::Validation {
            message: "workflow definition is invalid".to_string(),
            details: report.errors.iter().map(ToString::to_string).collect(),
        }
    }
}

/// A compiled edge: parsed condition, resolved endpoints
#[derive(Clone, Debug)]
pub struct CompiledEdge {
    pub from: String,
    pub to: String,
    pub condition: Option<Expression>,
    pub parallel: bool,
    pub on_error: OnError,
}

/// A compiled node: resolved agent handle, validated configuration and
/// adjacency indexes into [`CompiledGraph::edges`]
#[derive(Clone)]
pub struct CompiledNode {
    pub agent_id: String,
    pub kind: String,
    pub config: Value,
    pub agent: Arc<dyn Agent>,
    pub timeout: Duration,
    pub inbound: Vec<usize>,
    pub outbound: Vec<usize>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// Adjacency-indexed executable form of a workflow definition.
/// Cached per `(workflow_id, version)`.
pub struct CompiledGraph {
    pub workflow_id: String,
    pub version: u32,
    pub nodes: BTreeMap<String, CompiledNode>,
    pub edges: Vec<CompiledEdge>,
    pub entry_points: Vec<String>,
    /// Deterministic topological order of all agent ids
    pub topo_order: Vec<String>,
    /// Per-execution wall-clock limit; unbounded when unset
    pub max_duration: Option<Duration>,
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("workflow_id", &self.workflow_id)
            .field("version", &self.version)
            .field("node_ids", &self.nodes.keys().collect::<Vec<_>>())
            .field("edges", &self.edges)
            .field("entry_points", &self.entry_points)
            .field("topo_order", &self.topo_order)
            .field("max_duration", &self.max_duration)
            .finish()
    }
}

impl CompiledGraph {
    pub fn node(&self, agent_id: &str) -> Option<&CompiledNode> {
        self.nodes.get(agent_id)
    }

    /// True if `ancestor` can reach `descendant` through any path
    pub fn reaches(&self, ancestor: &str, descendant: &str) -> bool {
        let mut queue = VecDeque::from([ancestor]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if current == descendant && current != ancestor {
                return true;
            }
            if let Some(node) = self.nodes.get(current) {
                for &edge_idx in &node.outbound {
                    let next = self.edges[edge_idx].to.as_str();
                    if seen.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        false
    }
}

/// Per-invocation timeout: spec-level `timeout_ms` override, else the
/// engine-wide default
fn resolve_timeout(config: &Value, default_timeout: Duration) -> Duration {
    config
        .get("timeout_ms")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .unwrap_or(default_timeout)
}

/// Compile a definition against the registry.
///
/// Structural defects (unknown kinds, bad configs, dangling edges) abort
/// before the graph algorithms run; within each phase every distinct defect
/// is reported.
pub fn compile(
    definition: &WorkflowDefinition,
    registry: &AgentRegistry,
    default_timeout: Duration,
) -> Result<CompiledGraph, ValidationReport> {
    let mut report = ValidationReport::default();

    // Phase 1-3: structure - agents, configs, edges, conditions
    let mut nodes: BTreeMap<String, CompiledNode> = BTreeMap::new();
    let mut seen_ids = HashSet::new();
    for spec in &definition.agents {
        if !seen_ids.insert(spec.id.clone()) {
            report.push("duplicate-agent-id", Some(&spec.id), "agent id declared twice");
            continue;
        }
        let agent = match registry.lookup(&spec.kind) {
            Some(agent) => agent,
            None => {
                report.push(
                    "unknown-agent-kind",
                    Some(&spec.id),
                    format!("agent kind '{}' is not registered", spec.kind),
                );
                continue;
            }
        };
        if let Err(config_errors) = agent.validate_config(&spec.config) {
            for message in config_errors {
                report.push("invalid-agent-config", Some(&spec.id), message);
            }
            continue;
        }
        let timeout = resolve_timeout(&spec.config, default_timeout);
        let inputs = agent.input_fields(&spec.config);
        let outputs = agent.output_fields(&spec.config);
        nodes.insert(
            spec.id.clone(),
            CompiledNode {
                agent_id: spec.id.clone(),
                kind: spec.kind.clone(),
                config: spec.config.clone(),
                agent,
                timeout,
                inbound: Vec::new(),
                outbound: Vec::new(),
                inputs,
                outputs,
            },
        );
    }

    let mut edges: Vec<CompiledEdge> = Vec::new();
    for connection in &definition.connections {
        let mut resolved = true;
        for endpoint in [&connection.from, &connection.to] {
            if definition.agent(endpoint).is_none() {
                report.push(
                    "dangling-edge",
                    None,
                    format!(
                        "edge {} -> {} references undeclared agent '{}'",
                        connection.from, connection.to, endpoint
                    ),
                );
                resolved = false;
            }
        }
        let condition = match &connection.condition {
            Some(source) => match Expression::parse(source) {
                Ok(expr) => Some(expr),
                Err(err) => {
                    report.push(
                        "invalid-condition",
                        Some(&connection.from),
                        format!("condition '{}' does not parse: {}", source, err),
                    );
                    resolved = false;
                    None
                }
            },
            None => None,
        };
        if resolved {
            edges.push(CompiledEdge {
                from: connection.from.clone(),
                to: connection.to.clone(),
                condition,
                parallel: connection.parallel,
                on_error: connection.on_error,
            });
        }
    }

    if !report.is_empty() {
        return Err(report);
    }

    // Wire adjacency in declaration order
    for (idx, edge) in edges.iter().enumerate() {
        if let Some(node) = nodes.get_mut(&edge.from) {
            node.outbound.push(idx);
        }
        if let Some(node) = nodes.get_mut(&edge.to) {
            node.inbound.push(idx);
        }
    }

    // Phase 4: entry points
    if definition.entry_points.is_empty() {
        report.push("no-entry-point", None, "workflow declares no entry points");
    }
    for entry in &definition.entry_points {
        match nodes.get(entry.as_str()) {
            None => report.push(
                "unknown-entry-point",
                Some(entry),
                "entry point is not a declared agent",
            ),
            Some(node) if !node.inbound.is_empty() => report.push(
                "entry-point-has-inbound",
                Some(entry),
                "entry point has inbound edges",
            ),
            Some(_) => {}
        }
    }
    if !report.is_empty() {
        return Err(report);
    }

    // Phase 5: acyclicity (Kahn). BTreeSet keeps removal order deterministic.
    let mut in_degree: BTreeMap<&str, usize> = nodes
        .values()
        .map(|n| (n.agent_id.as_str(), n.inbound.len()))
        .collect();
    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut topo_order = Vec::with_capacity(nodes.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(next);
        topo_order.push(next.to_string());
        for &edge_idx in &nodes[next].outbound {
            let to = edges[edge_idx].to.as_str();
            let degree = in_degree.get_mut(to).expect("resolved edge");
            *degree -= 1;
            if *degree == 0 {
                ready.insert(to);
            }
        }
    }
    if topo_order.len() != nodes.len() {
        let cycle: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d > 0)
            .map(|(&id, _)| id)
            .collect();
        report.push(
            "cycle",
            None,
            format!("cycle through agents: {}", cycle.join(", ")),
        );
        return Err(report);
    }

    // Reachability: every non-entry agent must be reachable from some entry
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = definition.entry_points.iter().map(String::as_str).collect();
    for &entry in &queue {
        reachable.insert(entry);
    }
    while let Some(current) = queue.pop_front() {
        for &edge_idx in &nodes[current].outbound {
            let to = edges[edge_idx].to.as_str();
            if reachable.insert(to) {
                queue.push_back(to);
            }
        }
    }
    for node in nodes.values() {
        if !reachable.contains(node.agent_id.as_str()) {
            report.push(
                "unreachable-agent",
                Some(&node.agent_id),
                "agent is not reachable from any entry point",
            );
        }
    }
    if !report.is_empty() {
        return Err(report);
    }

    // Phase 6: state-schema closure. Fields declared in the schema but not
    // produced by any agent are expected from the initial state.
    let produced_by_agents: HashSet<&str> = nodes
        .values()
        .flat_map(|n| n.outputs.iter().map(String::as_str))
        .collect();
    let initial_fields: HashSet<String> = definition
        .state_schema
        .iter()
        .filter(|f| !produced_by_agents.contains(f.name.as_str()))
        .map(|f| f.name.clone())
        .collect();

    // guaranteed[n] = fields available whenever n becomes runnable. A node
    // waits for every unconditional upstream, so their guarantees union; a
    // node reached only through conditional edges cannot know which source
    // fired, so those guarantees intersect.
    let mut guaranteed: HashMap<String, HashSet<String>> = HashMap::new();
    for agent_id in &topo_order {
        let node = &nodes[agent_id.as_str()];
        let mut available = initial_fields.clone();
        let mut has_unconditional = false;
        let mut conditional: Option<HashSet<String>> = None;
        for &edge_idx in &node.inbound {
            let edge = &edges[edge_idx];
            let mut through: HashSet<String> =
                guaranteed.get(&edge.from).cloned().unwrap_or_default();
            through.extend(nodes[edge.from.as_str()].outputs.iter().cloned());
            if edge.condition.is_none() {
                has_unconditional = true;
                available.extend(through);
            } else {
                conditional = Some(match conditional {
                    None => through,
                    Some(prev) => prev.intersection(&through).cloned().collect(),
                });
            }
        }
        if !has_unconditional {
            if let Some(conditional) = conditional {
                available.extend(conditional);
            }
        }
        for input in node.inputs.iter() {
            if !available.contains(input) {
                report.push(
                    "uncovered-input",
                    Some(agent_id),
                    format!("input '{}' is not produced on every path from an entry", input),
                );
            }
        }
        guaranteed.insert(agent_id.clone(), available);
    }

    // Parallel branches may never write the same field. Concurrency arises
    // from parallel fan-outs and from multiple entry points; sequential
    // (first-match-wins) branches are mutually exclusive and exempt.
    let mut descendants: HashMap<String, HashSet<String>> = HashMap::new();
    for agent_id in topo_order.iter().rev() {
        let mut set = HashSet::new();
        set.insert(agent_id.clone());
        for &edge_idx in &nodes[agent_id.as_str()].outbound {
            if let Some(child) = descendants.get(edges[edge_idx].to.as_str()) {
                set.extend(child.iter().cloned());
            }
        }
        descendants.insert(agent_id.clone(), set);
    }

    let mut concurrent_roots: Vec<(String, String)> = Vec::new();
    for i in 0..definition.entry_points.len() {
        for j in (i + 1)..definition.entry_points.len() {
            concurrent_roots.push((
                definition.entry_points[i].clone(),
                definition.entry_points[j].clone(),
            ));
        }
    }
    for node in nodes.values() {
        let parallel_targets: Vec<&str> = node
            .outbound
            .iter()
            .map(|&idx| &edges[idx])
            .filter(|edge| edge.parallel)
            .map(|edge| edge.to.as_str())
            .collect();
        for i in 0..parallel_targets.len() {
            for j in (i + 1)..parallel_targets.len() {
                concurrent_roots.push((
                    parallel_targets[i].to_string(),
                    parallel_targets[j].to_string(),
                ));
            }
        }
    }

    let mut checked: HashSet<(String, String)> = HashSet::new();
    for (left_root, right_root) in concurrent_roots {
        for a in &descendants[&left_root] {
            for b in &descendants[&right_root] {
                if a == b {
                    continue;
                }
                // A path between the two means they are ordered, not parallel
                if descendants[a].contains(b) || descendants[b].contains(a) {
                    continue;
                }
                let key = if a < b {
                    (a.clone(), b.clone())
                } else {
                    (b.clone(), a.clone())
                };
                if !checked.insert(key.clone()) {
                    continue;
                }
                let outputs_a: HashSet<&str> =
                    nodes[key.0.as_str()].outputs.iter().map(String::as_str).collect();
                let conflicts: Vec<&str> = nodes[key.1.as_str()]
                    .outputs
                    .iter()
                    .map(String::as_str)
                    .filter(|field| outputs_a.contains(field))
                    .collect();
                if !conflicts.is_empty() {
                    report.push(
                        "parallel-write-conflict",
                        Some(&key.0),
                        format!(
                            "agents '{}' and '{}' can run concurrently but both write: {}",
                            key.0,
                            key.1,
                            conflicts.join(", ")
                        ),
                    );
                }
            }
        }
    }

    // Phase 7: branch determinism per source node
    for node in nodes.values() {
        if node.outbound.len() < 2 {
            continue;
        }
        let parallel_flags: HashSet<bool> = node
            .outbound
            .iter()
            .map(|&idx| edges[idx].parallel)
            .collect();
        if parallel_flags.len() > 1 {
            report.push(
                "mixed-branching",
                Some(&node.agent_id),
                "outbound edges mix parallel and sequential branching",
            );
            continue;
        }
        let parallel = parallel_flags.into_iter().next().unwrap_or(false);
        if parallel {
            continue;
        }
        // Sequential: first declared matching edge wins. An edge after an
        // unconditional one, or a duplicate condition, can match
        // simultaneously with an earlier edge and must be parallel instead.
        let mut seen_conditions: HashSet<Option<&str>> = HashSet::new();
        let mut unconditional_seen = false;
        for &edge_idx in &node.outbound {
            let edge = &edges[edge_idx];
            let condition = edge.condition.as_ref().map(Expression::source);
            if unconditional_seen {
                report.push(
                    "nondeterministic-branch",
                    Some(&node.agent_id),
                    format!(
                        "edge to '{}' follows an unconditional edge; declare the branch parallel",
                        edge.to
                    ),
                );
                continue;
            }
            if !seen_conditions.insert(condition) {
                report.push(
                    "nondeterministic-branch",
                    Some(&node.agent_id),
                    format!(
                        "edge to '{}' repeats an earlier condition; declare the branch parallel",
                        edge.to
                    ),
                );
            }
            if condition.is_none() {
                unconditional_seen = true;
            }
        }
    }

    if !report.is_empty() {
        return Err(report);
    }

    Ok(CompiledGraph {
        workflow_id: definition.id.clone(),
        version: definition.version,
        nodes,
        edges,
        entry_points: definition.entry_points.clone(),
        topo_order,
        max_duration: definition.max_duration_ms.map(Duration::from_millis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::{AgentContext, AgentError, AgentOutcome};
    use crate::models::workflow::{AgentSpec, Connection, StateField, StateFieldType};
    use async_trait::async_trait;
    use serde_json::{json, Map};

    /// Test agent whose declared inputs/outputs come from its config
    struct StubAgent;

    #[async_trait]
    impl Agent for StubAgent {
        fn kind(&self) -> &str {
            "stub"
        }

        fn input_fields(&self, config: &Value) -> Vec<String> {
            string_list(config, "inputs")
        }

        fn output_fields(&self, config: &Value) -> Vec<String> {
            string_list(config, "outputs")
        }

        fn validate_config(&self, config: &Value) -> Result<(), Vec<String>> {
            if config.get("invalid").is_some() {
                Err(vec!["config marked invalid".to_string()])
            } else {
                Ok(())
            }
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

    fn string_list(config: &Value, key: &str) -> Vec<String> {
        config
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn registry() -> AgentRegistry {
        let registry = AgentRegistry::new();
        registry.register(Arc::new(StubAgent)).unwrap();
        registry
    }

    fn agent(id: &str, config: Value) -> AgentSpec {
        AgentSpec {
            id: id.to_string(),
            kind: "stub".to_string(),
            config,
        }
    }

    fn edge(from: &str, to: &str) -> Connection {
        Connection {
            from: from.to_string(),
            to: to.to_string(),
            condition: None,
            parallel: false,
            on_error: OnError::Fail,
        }
    }

    fn definition(
        agents: Vec<AgentSpec>,
        connections: Vec<Connection>,
        entries: &[&str],
    ) -> WorkflowDefinition {
        let mut wf = WorkflowDefinition::new("wf", "test", "t1", "u1");
        wf.agents = agents;
        wf.connections = connections;
        wf.entry_points = entries.iter().map(|e| e.to_string()).collect();
        wf
    }

    fn try_compile(wf: &WorkflowDefinition) -> Result<CompiledGraph, ValidationReport> {
        compile(wf, &registry(), Duration::from_secs(60))
    }

    fn codes(report: &ValidationReport) -> Vec<&'static str> {
        report.errors.iter().map(|e| e.code).collect()
    }

    #[test]
    fn compiles_linear_workflow() {
        let wf = definition(
            vec![
                agent("a", json!({"outputs": ["x"]})),
                agent("b", json!({"inputs": ["x"], "outputs": ["y"]})),
            ],
            vec![edge("a", "b")],
            &["a"],
        );
        let graph = try_compile(&wf).unwrap();
        assert_eq!(graph.topo_order, vec!["a", "b"]);
        assert_eq!(graph.nodes["b"].inbound.len(), 1);
        assert!(graph.reaches("a", "b"));
        assert!(!graph.reaches("b", "a"));
    }

    #[test]
    fn unknown_kind_and_bad_config() {
        let mut wf = definition(
            vec![
                AgentSpec {
                    id: "a".to_string(),
                    kind: "missing".to_string(),
                    config: json!({}),
                },
                agent("b", json!({"invalid": true})),
            ],
            vec![],
            &["a", "b"],
        );
        wf.entry_points = vec!["a".to_string(), "b".to_string()];
        let report = try_compile(&wf).unwrap_err();
        assert_eq!(codes(&report), vec!["unknown-agent-kind", "invalid-agent-config"]);
    }

    #[test]
    fn dangling_edge_reported() {
        let wf = definition(
            vec![agent("a", json!({}))],
            vec![edge("a", "ghost")],
            &["a"],
        );
        let report = try_compile(&wf).unwrap_err();
        assert_eq!(codes(&report), vec!["dangling-edge"]);
    }

    #[test]
    fn condition_parse_errors_are_compile_errors() {
        let mut wf = definition(
            vec![agent("a", json!({})), agent("b", json!({}))],
            vec![Connection {
                from: "a".to_string(),
                to: "b".to_string(),
                condition: Some("score >".to_string()),
                parallel: false,
                on_error: OnError::Fail,
            }],
            &["a"],
        );
        wf.state_schema = vec![StateField {
            name: "score".to_string(),
            field_type: StateFieldType::Number,
        }];
        let report = try_compile(&wf).unwrap_err();
        assert_eq!(codes(&report), vec!["invalid-condition"]);
    }

    #[test]
    fn cycle_reported_with_members() {
        let wf = definition(
            vec![agent("a", json!({})), agent("b", json!({})), agent("c", json!({}))],
            vec![edge("a", "b"), edge("b", "c"), edge("c", "b")],
            &["a"],
        );
        let report = try_compile(&wf).unwrap_err();
        assert_eq!(codes(&report), vec!["cycle"]);
        assert!(report.errors[0].message.contains('b'));
        assert!(report.errors[0].message.contains('c'));
    }

    #[test]
    fn entry_point_rules() {
        let no_entry = definition(vec![agent("a", json!({}))], vec![], &[]);
        let report = try_compile(&no_entry).unwrap_err();
        assert_eq!(codes(&report), vec!["no-entry-point"]);

        let bad_entry = definition(
            vec![agent("a", json!({})), agent("b", json!({}))],
            vec![edge("a", "b")],
            &["b"],
        );
        let report = try_compile(&bad_entry).unwrap_err();
        assert!(codes(&report).contains(&"entry-point-has-inbound"));
    }

    #[test]
    fn unreachable_agent_reported() {
        let wf = definition(
            vec![agent("a", json!({})), agent("b", json!({})), agent("lone", json!({}))],
            vec![edge("a", "b")],
            &["a"],
        );
        let report = try_compile(&wf).unwrap_err();
        assert_eq!(codes(&report), vec!["unreachable-agent"]);
        assert_eq!(report.errors[0].agent_id.as_deref(), Some("lone"));
    }

    #[test]
    fn state_closure_covers_initial_fields_and_ancestors() {
        let mut wf = definition(
            vec![
                agent("router", json!({"inputs": ["score"], "outputs": ["route"]})),
                agent("sink", json!({"inputs": ["route"]})),
            ],
            vec![edge("router", "sink")],
            &["router"],
        );
        // `score` comes from the initial state via the declared schema
        wf.state_schema = vec![StateField {
            name: "score".to_string(),
            field_type: StateFieldType::Number,
        }];
        assert!(try_compile(&wf).is_ok());
    }

    #[test]
    fn fan_out_join_unions_upstream_outputs() {
        // `join` waits for both unconditional upstreams, so it may read
        // fields from either branch
        let wf = definition(
            vec![
                agent("a", json!({"outputs": ["seed"]})),
                agent("b", json!({"outputs": ["x"]})),
                agent("c", json!({"outputs": ["y"]})),
                agent("join", json!({"inputs": ["x", "y"]})),
            ],
            vec![
                Connection {
                    from: "a".to_string(),
                    to: "b".to_string(),
                    condition: None,
                    parallel: true,
                    on_error: OnError::Fail,
                },
                Connection {
                    from: "a".to_string(),
                    to: "c".to_string(),
                    condition: None,
                    parallel: true,
                    on_error: OnError::Fail,
                },
                edge("b", "join"),
                edge("c", "join"),
            ],
            &["a"],
        );
        assert!(try_compile(&wf).is_ok());
    }

    #[test]
    fn uncovered_input_reported_for_exclusive_join() {
        // `join` is reached through conditional edges: only fields produced
        // by every possible source are guaranteed, so `x` is uncovered
        let mut wf = definition(
            vec![
                agent("a", json!({"outputs": ["seed"]})),
                agent("b", json!({"outputs": ["x"]})),
                agent("c", json!({"outputs": ["y"]})),
                agent("join", json!({"inputs": ["x"]})),
            ],
            vec![
                Connection {
                    from: "a".to_string(),
                    to: "b".to_string(),
                    condition: Some("seed > 0".to_string()),
                    parallel: false,
                    on_error: OnError::Fail,
                },
                edge("a", "c"),
                Connection {
                    from: "b".to_string(),
                    to: "join".to_string(),
                    condition: Some("seed > 0".to_string()),
                    parallel: false,
                    on_error: OnError::Fail,
                },
                Connection {
                    from: "c".to_string(),
                    to: "join".to_string(),
                    condition: Some("seed <= 0".to_string()),
                    parallel: false,
                    on_error: OnError::Fail,
                },
            ],
            &["a"],
        );
        wf.state_schema = vec![StateField {
            name: "seed".to_string(),
            field_type: StateFieldType::Number,
        }];
        let report = try_compile(&wf).unwrap_err();
        assert_eq!(codes(&report), vec!["uncovered-input"]);
        assert_eq!(report.errors[0].agent_id.as_deref(), Some("join"));
    }

    #[test]
    fn parallel_write_conflict_rejected() {
        let wf = definition(
            vec![
                agent("a", json!({"outputs": ["seed"]})),
                agent("b", json!({"outputs": ["shared"]})),
                agent("c", json!({"outputs": ["shared"]})),
            ],
            vec![
                Connection {
                    from: "a".to_string(),
                    to: "b".to_string(),
                    condition: None,
                    parallel: true,
                    on_error: OnError::Fail,
                },
                Connection {
                    from: "a".to_string(),
                    to: "c".to_string(),
                    condition: None,
                    parallel: true,
                    on_error: OnError::Fail,
                },
            ],
            &["a"],
        );
        let report = try_compile(&wf).unwrap_err();
        assert_eq!(codes(&report), vec!["parallel-write-conflict"]);
    }

    #[test]
    fn sequential_branch_after_unconditional_edge_rejected() {
        let wf = definition(
            vec![agent("a", json!({})), agent("b", json!({})), agent("c", json!({}))],
            vec![edge("a", "b"), edge("a", "c")],
            &["a"],
        );
        let report = try_compile(&wf).unwrap_err();
        assert_eq!(codes(&report), vec!["nondeterministic-branch"]);
    }

    #[test]
    fn conditional_fallback_chain_is_deterministic() {
        let mut wf = definition(
            vec![agent("a", json!({})), agent("high", json!({})), agent("low", json!({}))],
            vec![
                Connection {
                    from: "a".to_string(),
                    to: "high".to_string(),
                    condition: Some("state.score > 5".to_string()),
                    parallel: false,
                    on_error: OnError::Fail,
                },
                edge("a", "low"),
            ],
            &["a"],
        );
        wf.state_schema = vec![StateField {
            name: "score".to_string(),
            field_type: StateFieldType::Number,
        }];
        assert!(try_compile(&wf).is_ok());
    }

    #[test]
    fn compilation_is_deterministic() {
        let wf = definition(
            vec![
                agent("z", json!({"outputs": ["zz"]})),
                agent("a", json!({"outputs": ["aa"]})),
                agent("m", json!({"inputs": ["aa", "zz"]})),
            ],
            vec![edge("z", "m"), edge("a", "m")],
            &["z", "a"],
        );
        let first = try_compile(&wf).unwrap();
        let second = try_compile(&wf).unwrap();
        assert_eq!(first.topo_order, second.topo_order);
        let first_edges: Vec<(String, String)> = first
            .edges
            .iter()
            .map(|e| (e.from.clone(), e.to.clone()))
            .collect();
        let second_edges: Vec<(String, String)> = second
            .edges
            .iter()
            .map(|e| (e.from.clone(), e.to.clone()))
            .collect();
        assert_eq!(first_edges, second_edges);
    }

    #[test]
    fn timeout_ms_config_overrides_default() {
        let wf = definition(
            vec![agent("a", json!({"timeout_ms": 1500}))],
            vec![],
            &["a"],
        );
        let graph = try_compile(&wf).unwrap();
        assert_eq!(graph.nodes["a"].timeout, Duration::from_millis(1500));
    }
}
