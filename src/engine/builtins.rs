// Built-in agent kinds shipped with the engine

//! # Built-in Agents
//!
//! Four kinds are registered at startup: `aggregator` (merges named inputs
//! with a derived confidence score), `router` (evaluates safe expressions to
//! pick a route label), `ai-completion` (delegates to the external AI
//! service with a templated prompt) and `checkpoint` (forces a durable
//! snapshot). Everything else is expected to arrive through
//! [`AgentRegistry::register`] from embedding code.

use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use std::sync::Arc;

use crate::models::expression::Expression;

use super::registry::{
    Agent, AgentContext, AgentError, AgentOutcome, AgentRegistry, StateFragment,
};

/// Register every built-in kind. Idempotent, called once from the server
/// binary after the registry is constructed.
pub fn register_builtins(registry: &AgentRegistry) -> crate::Result<()> {
    registry.register(Arc::new(AggregatorAgent))?;
    registry.register(Arc::new(RouterAgent))?;
    registry.register(Arc::new(AiCompletionAgent::new()))?;
    registry.register(Arc::new(CheckpointAgent))?;
    Ok(())
}

fn config_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

fn config_string_list(config: &Value, key: &str) -> Vec<String> {
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

// ---------------------------------------------------------------------------
// aggregator

/// Merges named input fields into one combined output object (or numeric
/// sum) with a derived confidence score.
///
/// Config:
/// - `sources`: non-empty list of state field names to aggregate
/// - `target`: state field receiving the result
/// - `mode`: `"merge"` (default) or `"sum"`
/// - `weights`: optional per-source weights for the confidence score
pub struct AggregatorAgent;

impl AggregatorAgent {
    fn mode(config: &Value) -> &str {
        config_str(config, "mode").unwrap_or("merge")
    }
}

#[async_trait]
impl Agent for AggregatorAgent {
    fn kind(&self) -> &str {
        "aggregator"
    }

    fn input_fields(&self, config: &Value) -> Vec<String> {
        config_string_list(config, "sources")
    }

    fn output_fields(&self, config: &Value) -> Vec<String> {
        config_str(config, "target")
            .map(|t| vec![t.to_string()])
            .unwrap_or_default()
    }

    fn validate_config(&self, config: &Value) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if config_string_list(config, "sources").is_empty() {
            errors.push("'sources' must be a non-empty list of field names".to_string());
        }
        if config_str(config, "target").map(str::is_empty).unwrap_or(true) {
            errors.push("'target' must be a non-empty field name".to_string());
        }
        match Self::mode(config) {
            "merge" | "sum" => {}
            other => errors.push(format!("unknown mode '{}', expected merge or sum", other)),
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    async fn execute(
        &self,
        state: &Map<String, Value>,
        config: &Value,
        _ctx: &AgentContext,
    ) -> Result<AgentOutcome, AgentError> {
        let sources = config_string_list(config, "sources");
        let target = config_str(config, "target")
            .ok_or_else(|| AgentError::Fatal("aggregator target missing".to_string()))?;
        let weights = config.get("weights").and_then(Value::as_object);

        let mut fragment = StateFragment::new();
        match Self::mode(config) {
            "sum" => {
                let mut total = 0.0;
                for source in &sources {
                    if let Some(n) = state.get(source).and_then(Value::as_f64) {
                        total += n;
                    }
                }
                fragment.insert(
                    target.to_string(),
                    Number::from_f64(total).map(Value::Number).unwrap_or(Value::Null),
                );
            }
            _ => {
                let mut combined = Map::new();
                let mut weight_present = 0.0;
                let mut weight_total = 0.0;
                for source in &sources {
                    let weight = weights
                        .and_then(|w| w.get(source))
                        .and_then(Value::as_f64)
                        .unwrap_or(1.0);
                    weight_total += weight;
                    if let Some(value) = state.get(source) {
                        combined.insert(source.clone(), value.clone());
                        weight_present += weight;
                    }
                }
                let confidence = if weight_total > 0.0 {
                    weight_present / weight_total
                } else {
                    0.0
                };
                combined.insert(
                    "confidence".to_string(),
                    Number::from_f64(confidence)
                        .map(Value::Number)
                        .unwrap_or(Value::Null),
                );
                fragment.insert(target.to_string(), Value::Object(combined));
            }
        }
        Ok(fragment.into())
    }
}

// ---------------------------------------------------------------------------
// router

/// Evaluates a list of safe expressions in declaration order and writes the
/// first matching route's value into the target field.
///
/// Config:
/// - `routes`: list of `{when: <expression>, value: <json>}`
/// - `target`: state field receiving the chosen value
/// - `default`: optional value when no route matches
pub struct RouterAgent;

impl RouterAgent {
    fn routes(config: &Value) -> Vec<(String, Value)> {
        config
            .get("routes")
            .and_then(Value::as_array)
            .map(|routes| {
                routes
                    .iter()
                    .filter_map(|route| {
                        let when = route.get("when")?.as_str()?.to_string();
                        let value = route.get("value").cloned().unwrap_or(Value::Null);
                        Some((when, value))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Agent for RouterAgent {
    fn kind(&self) -> &str {
        "router"
    }

    fn input_fields(&self, config: &Value) -> Vec<String> {
        let mut fields = Vec::new();
        for (when, _) in Self::routes(config) {
            if let Ok(expr) = Expression::parse(&when) {
                fields.extend(expr.referenced_fields());
            }
        }
        fields.sort();
        fields.dedup();
        fields
    }

    fn output_fields(&self, config: &Value) -> Vec<String> {
        config_str(config, "target")
            .map(|t| vec![t.to_string()])
            .unwrap_or_default()
    }

    fn validate_config(&self, config: &Value) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if config_str(config, "target").map(str::is_empty).unwrap_or(true) {
            errors.push("'target' must be a non-empty field name".to_string());
        }
        let routes = Self::routes(config);
        if routes.is_empty() {
            errors.push("'routes' must be a non-empty list of {when, value}".to_string());
        }
        for (when, _) in &routes {
            if let Err(err) = Expression::parse(when) {
                errors.push(format!("route condition '{}' does not parse: {}", when, err));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    async fn execute(
        &self,
        state: &Map<String, Value>,
        config: &Value,
        _ctx: &AgentContext,
    ) -> Result<AgentOutcome, AgentError> {
        let target = config_str(config, "target")
            .ok_or_else(|| AgentError::Fatal("router target missing".to_string()))?;
        for (when, value) in Self::routes(config) {
            let expr = Expression::parse(&when)
                .map_err(|e| AgentError::Fatal(format!("route condition invalid: {}", e)))?;
            if expr.matches(state) {
                let mut fragment = StateFragment::new();
                fragment.insert(target.to_string(), value);
                return Ok(fragment.into());
            }
        }
        if let Some(default) = config.get("default") {
            let mut fragment = StateFragment::new();
            fragment.insert(target.to_string(), default.clone());
            return Ok(fragment.into());
        }
        Err(AgentError::Fatal("no route matched and no default given".to_string()))
    }
}

// ---------------------------------------------------------------------------
// ai-completion

/// Delegates to the external AI service: renders a `{{field}}` template
/// against the current state, POSTs it and parses the typed response into
/// the configured output field.
///
/// Config:
/// - `endpoint`: URL of the completion service
/// - `prompt`: template with `{{field}}` placeholders
/// - `output_field`: state field receiving the parsed output
/// - `model`: optional model identifier forwarded verbatim
pub struct AiCompletionAgent {
    client: reqwest::Client,
}

impl AiCompletionAgent {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// `{{name}}` placeholders in declaration order
    fn placeholders(template: &str) -> Vec<String> {
        let mut names = Vec::new();
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    names.push(after[..end].trim().to_string());
                    rest = &after[end + 2..];
                }
                None => break,
            }
        }
        names
    }

    fn render(template: &str, state: &Map<String, Value>) -> String {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let name = after[..end].trim();
                    match state.get(name) {
                        Some(Value::String(s)) => rendered.push_str(s),
                        Some(other) => rendered.push_str(&other.to_string()),
                        None => {}
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    rendered.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        rendered.push_str(rest);
        rendered
    }
}

impl Default for AiCompletionAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for AiCompletionAgent {
    fn kind(&self) -> &str {
        "ai-completion"
    }

    fn input_fields(&self, config: &Value) -> Vec<String> {
        let mut fields: Vec<String> = config_str(config, "prompt")
            .map(|prompt| {
                Self::placeholders(prompt)
                    .into_iter()
                    .map(|p| p.split('.').next().unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default();
        fields.sort();
        fields.dedup();
        fields
    }

    fn output_fields(&self, config: &Value) -> Vec<String> {
        config_str(config, "output_field")
            .map(|f| vec![f.to_string()])
            .unwrap_or_default()
    }

    fn validate_config(&self, config: &Value) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if config_str(config, "endpoint").map(str::is_empty).unwrap_or(true) {
            errors.push("'endpoint' must be a non-empty URL".to_string());
        }
        if config_str(config, "prompt").map(str::is_empty).unwrap_or(true) {
            errors.push("'prompt' must be a non-empty template".to_string());
        }
        if config_str(config, "output_field").map(str::is_empty).unwrap_or(true) {
            errors.push("'output_field' must be a non-empty field name".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    async fn execute(
        &self,
        state: &Map<String, Value>,
        config: &Value,
        ctx: &AgentContext,
    ) -> Result<AgentOutcome, AgentError> {
        let endpoint = config_str(config, "endpoint")
            .ok_or_else(|| AgentError::Fatal("ai-completion endpoint missing".to_string()))?;
        let prompt_template = config_str(config, "prompt")
            .ok_or_else(|| AgentError::Fatal("ai-completion prompt missing".to_string()))?;
        let output_field = config_str(config, "output_field")
            .ok_or_else(|| AgentError::Fatal("ai-completion output_field missing".to_string()))?;

        let mut body = Map::new();
        body.insert(
            "prompt".to_string(),
            Value::String(Self::render(prompt_template, state)),
        );
        if let Some(model) = config_str(config, "model") {
            body.insert("model".to_string(), Value::String(model.to_string()));
        }
        // (execution_id, agent_id) is the idempotency key for the provider
        body.insert(
            "idempotency_key".to_string(),
            Value::String(format!("{}:{}", ctx.execution_id, ctx.agent_id)),
        );

        let request = self.client.post(endpoint).json(&Value::Object(body)).send();
        let response = tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                return Err(AgentError::Retryable("invocation cancelled".to_string()));
            }
            response = request => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(err) if err.is_timeout() || err.is_connect() => {
                return Err(AgentError::Retryable(err.to_string()));
            }
            Err(err) => return Err(AgentError::Fatal(err.to_string())),
        };

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(AgentError::Retryable(format!(
                "AI service returned {}",
                status
            )));
        }
        if status.is_client_error() {
            return Err(AgentError::Fatal(format!("AI service returned {}", status)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| AgentError::Retryable(format!("malformed AI response: {}", err)))?;
        let output = payload.get("output").cloned().unwrap_or(payload);

        let mut fragment = StateFragment::new();
        fragment.insert(output_field.to_string(), output);
        Ok(fragment.into())
    }
}

// ---------------------------------------------------------------------------
// checkpoint

/// Contributes nothing to state; its whole purpose is forcing a durable
/// snapshot, optionally annotated with a message.
pub struct CheckpointAgent;

#[async_trait]
impl Agent for CheckpointAgent {
    fn kind(&self) -> &str {
        "checkpoint"
    }

    fn output_fields(&self, _config: &Value) -> Vec<String> {
        Vec::new()
    }

    fn validate_config(&self, config: &Value) -> Result<(), Vec<String>> {
        match config.get("message") {
            None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
            Some(_) => Err(vec!["'message' must be a string".to_string()]),
        }
    }

    async fn execute(
        &self,
        _state: &Map<String, Value>,
        config: &Value,
        _ctx: &AgentContext,
    ) -> Result<AgentOutcome, AgentError> {
        Ok(AgentOutcome {
            fragment: StateFragment::new(),
            message: config_str(config, "message").map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TenantContext;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> AgentContext {
        AgentContext {
            execution_id: "exec-1".to_string(),
            agent_id: "agent-1".to_string(),
            tenant: TenantContext::system("t1"),
            cancellation: CancellationToken::new(),
        }
    }

    fn state(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn aggregator_sum_mode() {
        let config = json!({"sources": ["b", "c"], "target": "total", "mode": "sum"});
        let agent = AggregatorAgent;
        agent.validate_config(&config).unwrap();
        let outcome = agent
            .execute(&state(&[("b", json!(20)), ("c", json!(15))]), &config, &ctx())
            .await
            .unwrap();
        assert_eq!(outcome.fragment["total"], json!(35.0));
    }

    #[tokio::test]
    async fn aggregator_merge_confidence() {
        let config = json!({"sources": ["voice", "image", "text"], "target": "combined"});
        let outcome = AggregatorAgent
            .execute(
                &state(&[("voice", json!("ok")), ("image", json!("blurry"))]),
                &config,
                &ctx(),
            )
            .await
            .unwrap();
        let combined = outcome.fragment["combined"].as_object().unwrap();
        assert_eq!(combined["voice"], json!("ok"));
        assert!(combined.get("text").is_none());
        let confidence = combined["confidence"].as_f64().unwrap();
        assert!((confidence - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn router_picks_first_match_then_default() {
        let config = json!({
            "target": "route",
            "routes": [
                {"when": "score > 5", "value": "high"},
                {"when": "score > 0", "value": "low"}
            ],
            "default": "none"
        });
        let agent = RouterAgent;
        agent.validate_config(&config).unwrap();
        let high = agent
            .execute(&state(&[("score", json!(7))]), &config, &ctx())
            .await
            .unwrap();
        assert_eq!(high.fragment["route"], json!("high"));
        let low = agent
            .execute(&state(&[("score", json!(3))]), &config, &ctx())
            .await
            .unwrap();
        assert_eq!(low.fragment["route"], json!("low"));
        let fallback = agent
            .execute(&state(&[("score", json!(-1))]), &config, &ctx())
            .await
            .unwrap();
        assert_eq!(fallback.fragment["route"], json!("none"));
    }

    #[test]
    fn router_inputs_come_from_conditions() {
        let config = json!({
            "target": "route",
            "routes": [{"when": "state.score > 5 && flag", "value": 1}]
        });
        assert_eq!(RouterAgent.input_fields(&config), vec!["flag", "score"]);
    }

    #[test]
    fn ai_completion_template_rendering() {
        let rendered = AiCompletionAgent::render(
            "Summarize {{finding}} with severity {{severity}}",
            &state(&[("finding", json!("crack")), ("severity", json!(4))]),
        );
        assert_eq!(rendered, "Summarize crack with severity 4");
        let config = json!({
            "endpoint": "http://ai.local/complete",
            "prompt": "{{finding}} / {{severity}}",
            "output_field": "summary"
        });
        let agent = AiCompletionAgent::new();
        agent.validate_config(&config).unwrap();
        assert_eq!(agent.input_fields(&config), vec!["finding", "severity"]);
        assert_eq!(agent.output_fields(&config), vec!["summary"]);
    }

    #[test]
    fn ai_completion_rejects_empty_config() {
        let errors = AiCompletionAgent::new()
            .validate_config(&json!({}))
            .unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[tokio::test]
    async fn checkpoint_carries_message() {
        let outcome = CheckpointAgent
            .execute(&Map::new(), &json!({"message": "after intake"}), &ctx())
            .await
            .unwrap();
        assert!(outcome.fragment.is_empty());
        assert_eq!(outcome.message.as_deref(), Some("after intake"));
    }

    #[test]
    fn builtins_register() {
        let registry = AgentRegistry::new();
        register_builtins(&registry).unwrap();
        assert_eq!(
            registry.list(),
            vec!["aggregator", "ai-completion", "checkpoint", "router"]
        );
    }
}
