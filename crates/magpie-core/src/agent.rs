use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use magpie_providers::{ChatMessage, ChatRequest, Provider};
use magpie_tools::{ToolExecution, ToolRegistry, ToolReply};

pub const DEFAULT_MAX_ITERATIONS: usize = 100;
const MAX_IDENTICAL_CALLS: usize = 3;

/// One agent = a role prompt, a tool allowlist and a bounded loop.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub name: &'static str,
    pub system_prompt: String,
    pub tools: Vec<&'static str>,
    pub temperature: f64,
    pub max_iterations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    FinalAnswer(String),
    /// Stop condition satisfied (e.g. enough sources gathered).
    Stopped,
    Cancelled,
    /// Iteration budget exhausted without a final answer.
    Exhausted,
    /// Guard rails tripped: repeated schema violations, malformed replies
    /// or identical tool calls in a loop.
    Aborted(String),
}

/// Optional externally-evaluated termination condition, checked between
/// iterations.
#[async_trait]
pub trait StopCondition: Send + Sync {
    async fn should_stop(&self) -> bool;
}

pub struct AgentRunner<'a> {
    provider: &'a dyn Provider,
    registry: &'a ToolRegistry,
}

impl<'a> AgentRunner<'a> {
    pub fn new(provider: &'a dyn Provider, registry: &'a ToolRegistry) -> Self {
        Self { provider, registry }
    }

    /// Drive the reason -> act -> observe loop until a final answer or a
    /// bound is hit. Cancellation is observed after every suspension
    /// point; the current tool call is allowed to finish.
    pub async fn run(
        &self,
        spec: &AgentSpec,
        task: String,
        cancel: &CancellationToken,
        stop: Option<&dyn StopCondition>,
    ) -> anyhow::Result<AgentOutcome> {
        let declarations = self.registry.declarations(Some(&spec.tools));
        let mut history: Vec<ChatMessage> = vec![
            ChatMessage::system(spec.system_prompt.clone()),
            ChatMessage::user(task),
        ];

        let mut schema_strikes = 0usize;
        let mut malformed_strikes = 0usize;
        let mut last_call: Option<(String, String)> = None;
        let mut identical_count = 0usize;

        for iteration in 0..spec.max_iterations {
            if cancel.is_cancelled() {
                return Ok(AgentOutcome::Cancelled);
            }
            if let Some(stop) = stop {
                if stop.should_stop().await {
                    tracing::debug!(agent = spec.name, iteration, "stop condition met");
                    return Ok(AgentOutcome::Stopped);
                }
            }

            let completion = self
                .provider
                .complete(ChatRequest {
                    messages: history.clone(),
                    temperature: Some(spec.temperature),
                    tools: declarations.clone(),
                    ..Default::default()
                })
                .await?;

            if cancel.is_cancelled() {
                return Ok(AgentOutcome::Cancelled);
            }

            if completion.tool_calls.is_empty() {
                let text = completion.text.trim().to_string();
                if text.is_empty() {
                    malformed_strikes += 1;
                    if malformed_strikes > 1 {
                        return Ok(AgentOutcome::Aborted(
                            "model produced neither a tool call nor an answer twice".to_string(),
                        ));
                    }
                    history.push(ChatMessage::user(
                        "Your reply was empty. Either call a tool or give the final answer."
                            .to_string(),
                    ));
                    continue;
                }
                return Ok(AgentOutcome::FinalAnswer(text));
            }

            if !completion.text.trim().is_empty() {
                history.push(ChatMessage::assistant(completion.text.clone()));
            }

            for call in &completion.tool_calls {
                if cancel.is_cancelled() {
                    return Ok(AgentOutcome::Cancelled);
                }

                let args = match call.parsed_arguments() {
                    Ok(args) => args,
                    Err(err) => {
                        malformed_strikes += 1;
                        if malformed_strikes > 1 {
                            return Ok(AgentOutcome::Aborted(format!(
                                "tool call arguments stayed malformed: {err}"
                            )));
                        }
                        history.push(observation_message(
                            &call.name,
                            &serde_json::json!({
                                "error": format!("arguments were not valid JSON: {err}")
                            }),
                        ));
                        continue;
                    }
                };
                malformed_strikes = 0;

                let signature = (call.name.clone(), args.to_string());
                if last_call.as_ref() == Some(&signature) {
                    identical_count += 1;
                    if identical_count >= MAX_IDENTICAL_CALLS {
                        return Ok(AgentOutcome::Aborted(format!(
                            "tool `{}` called with identical arguments {} times in a row",
                            call.name,
                            identical_count + 1
                        )));
                    }
                } else {
                    identical_count = 0;
                    last_call = Some(signature);
                }

                if !spec.tools.contains(&call.name.as_str()) {
                    history.push(observation_message(
                        &call.name,
                        &serde_json::json!({
                            "error": format!("tool `{}` is not available to this agent", call.name)
                        }),
                    ));
                    continue;
                }

                match self.registry.execute(&call.name, args).await? {
                    ToolExecution::Reply(reply) => {
                        schema_strikes = 0;
                        if let ToolReply::Failure(reason) = &reply {
                            tracing::debug!(
                                agent = spec.name,
                                tool = %call.name,
                                "tool failure observation: {reason}"
                            );
                        }
                        history.push(observation_message(&call.name, &reply.observation()));
                    }
                    ToolExecution::SchemaViolation(err) => {
                        schema_strikes += 1;
                        if schema_strikes > 1 {
                            return Ok(AgentOutcome::Aborted(format!(
                                "repeated tool-schema violations: {err}"
                            )));
                        }
                        history.push(observation_message(
                            &call.name,
                            &serde_json::json!({"error": err.to_string()}),
                        ));
                    }
                    ToolExecution::UnknownTool(name) => {
                        history.push(observation_message(
                            &name,
                            &serde_json::json!({"error": format!("unknown tool `{name}`")}),
                        ));
                    }
                }
            }
        }

        Ok(AgentOutcome::Exhausted)
    }
}

fn observation_message(tool: &str, observation: &Value) -> ChatMessage {
    ChatMessage::user(format!(
        "Observation from `{tool}`:\n{}",
        serde_json::to_string(observation).unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use magpie_providers::{ChatCompletion, ToolCallRequest};
    use magpie_tools::{FieldKind, FieldSpec, Tool, ToolSchema};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Provider that pops scripted completions in order.
    struct ScriptedProvider {
        replies: std::sync::Mutex<Vec<ChatCompletion>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<ChatCompletion>) -> Self {
            Self {
                replies: std::sync::Mutex::new(replies),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn label(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _request: ChatRequest) -> anyhow::Result<ChatCompletion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().expect("lock");
            if replies.is_empty() {
                Ok(ChatCompletion {
                    text: "done".to_string(),
                    ..Default::default()
                })
            } else {
                Ok(replies.remove(0))
            }
        }
    }

    fn tool_call(name: &str, arguments: &str) -> ChatCompletion {
        ChatCompletion {
            text: String::new(),
            tool_calls: vec![ToolCallRequest {
                id: "call".to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
            usage: None,
        }
    }

    fn final_answer(text: &str) -> ChatCompletion {
        ChatCompletion {
            text: text.to_string(),
            ..Default::default()
        }
    }

    struct ProbeTool {
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for ProbeTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "probe",
                description: "probe",
                fields: vec![FieldSpec::required(
                    "value",
                    FieldKind::Integer { min: 0, max: 100 },
                    "a value",
                )],
            }
        }

        async fn invoke(&self, args: Value) -> anyhow::Result<ToolReply> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            ToolReply::success(json!({"seen": args["value"]}))
        }
    }

    fn registry(invocations: Arc<AtomicUsize>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ProbeTool { invocations }));
        registry
    }

    fn spec() -> AgentSpec {
        AgentSpec {
            name: "test",
            system_prompt: "You are a test agent.".to_string(),
            tools: vec!["probe"],
            temperature: 0.0,
            max_iterations: 10,
        }
    }

    #[tokio::test]
    async fn tool_call_then_final_answer() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let provider = ScriptedProvider::new(vec![
            tool_call("probe", r#"{"value": 7}"#),
            final_answer("the answer"),
        ]);
        let registry = registry(invocations.clone());
        let runner = AgentRunner::new(&provider, &registry);
        let outcome = runner
            .run(&spec(), "task".to_string(), &CancellationToken::new(), None)
            .await
            .expect("run");
        assert_eq!(outcome, AgentOutcome::FinalAnswer("the answer".to_string()));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn schema_error_fed_back_once_then_aborts() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let provider = ScriptedProvider::new(vec![
            tool_call("probe", r#"{"value": 500}"#),
            tool_call("probe", r#"{"value": 600}"#),
        ]);
        let registry = registry(invocations.clone());
        let runner = AgentRunner::new(&provider, &registry);
        let outcome = runner
            .run(&spec(), "task".to_string(), &CancellationToken::new(), None)
            .await
            .expect("run");
        assert!(matches!(outcome, AgentOutcome::Aborted(_)));
        assert_eq!(invocations.load(Ordering::SeqCst), 0, "invalid calls never invoke");
    }

    #[tokio::test]
    async fn identical_calls_trip_the_loop_guard() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let provider = ScriptedProvider::new(vec![
            tool_call("probe", r#"{"value": 1}"#),
            tool_call("probe", r#"{"value": 1}"#),
            tool_call("probe", r#"{"value": 1}"#),
            tool_call("probe", r#"{"value": 1}"#),
            tool_call("probe", r#"{"value": 1}"#),
        ]);
        let registry = registry(invocations.clone());
        let runner = AgentRunner::new(&provider, &registry);
        let outcome = runner
            .run(&spec(), "task".to_string(), &CancellationToken::new(), None)
            .await
            .expect("run");
        assert!(matches!(outcome, AgentOutcome::Aborted(_)));
        assert!(invocations.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn malformed_arguments_get_one_repair_round() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let provider = ScriptedProvider::new(vec![
            tool_call("probe", "{not json"),
            tool_call("probe", r#"{"value": 3}"#),
            final_answer("fixed"),
        ]);
        let registry = registry(invocations.clone());
        let runner = AgentRunner::new(&provider, &registry);
        let outcome = runner
            .run(&spec(), "task".to_string(), &CancellationToken::new(), None)
            .await
            .expect("run");
        assert_eq!(outcome, AgentOutcome::FinalAnswer("fixed".to_string()));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_wins_before_the_next_provider_call() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let provider = ScriptedProvider::new(vec![final_answer("never seen")]);
        let registry = registry(invocations);
        let runner = AgentRunner::new(&provider, &registry);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = runner
            .run(&spec(), "task".to_string(), &cancel, None)
            .await
            .expect("run");
        assert_eq!(outcome, AgentOutcome::Cancelled);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    struct AlwaysStop;

    #[async_trait]
    impl StopCondition for AlwaysStop {
        async fn should_stop(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn stop_condition_ends_the_loop() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let provider = ScriptedProvider::new(vec![final_answer("never seen")]);
        let registry = registry(invocations);
        let runner = AgentRunner::new(&provider, &registry);
        let outcome = runner
            .run(
                &spec(),
                "task".to_string(),
                &CancellationToken::new(),
                Some(&AlwaysStop),
            )
            .await
            .expect("run");
        assert_eq!(outcome, AgentOutcome::Stopped);
    }

    #[tokio::test]
    async fn iteration_budget_exhausts() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let replies: Vec<ChatCompletion> = (0..20)
            .map(|i| tool_call("probe", &format!(r#"{{"value": {i}}}"#)))
            .collect();
        let provider = ScriptedProvider::new(replies);
        let registry = registry(invocations);
        let runner = AgentRunner::new(&provider, &registry);
        let mut bounded = spec();
        bounded.max_iterations = 5;
        let outcome = runner
            .run(&bounded, "task".to_string(), &CancellationToken::new(), None)
            .await
            .expect("run");
        assert_eq!(outcome, AgentOutcome::Exhausted);
    }
}
