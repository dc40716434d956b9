use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Level;

use trio_observability::{emit_event, ObservabilityEvent, ProcessKind};
use trio_providers::{CompletionRequest, CompletionResponse, ProviderRegistry};
use trio_tools::{validate_tool_schemas, ToolRegistry};
use trio_types::{ChatMessage, FileMap, TokenUsage, ToolInvocation, ToolSchema};

use crate::agents::AgentDefinition;
use crate::prompts::{FILES_INCOMPLETE_NOTE, NO_FILES_WARNING, RESPONSE_INCOMPLETE_NOTE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Done,
    TimedOut,
    Failed,
    IterationsExhausted,
}

impl LoopOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopOutcome::Done => "done",
            LoopOutcome::TimedOut => "timed_out",
            LoopOutcome::Failed => "failed",
            LoopOutcome::IterationsExhausted => "iterations_exhausted",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion call timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("{0}")]
    Capability(String),
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct LoopRequest {
    pub request_id: String,
    pub agent: AgentDefinition,
    pub messages: Vec<ChatMessage>,
    pub files: FileMap,
}

#[derive(Debug, Clone)]
pub struct LoopResult {
    pub final_text: String,
    pub files: FileMap,
    pub usage: TokenUsage,
    pub iterations_used: u32,
    pub outcome: LoopOutcome,
    /// Full transcript including tool results and the final assistant message.
    pub messages: Vec<ChatMessage>,
}

#[derive(Clone)]
pub struct CompletionLoop {
    providers: ProviderRegistry,
    tools: ToolRegistry,
}

struct LoopState {
    messages: Vec<ChatMessage>,
    files: FileMap,
    usage: TokenUsage,
    iteration: u32,
}

impl LoopState {
    fn finish(mut self, outcome: LoopOutcome, final_text: String) -> LoopResult {
        self.messages.push(ChatMessage::assistant(final_text.clone()));
        LoopResult {
            final_text,
            files: self.files,
            usage: self.usage,
            iterations_used: self.iteration,
            outcome,
            messages: self.messages,
        }
    }
}

impl CompletionLoop {
    pub fn new(providers: ProviderRegistry, tools: ToolRegistry) -> Self {
        Self { providers, tools }
    }

    /// Runs the agent until it answers without tool calls, the iteration
    /// ceiling is reached, or a call times out or fails. Only cancellation
    /// is reported as an error; every other terminal state yields a result.
    pub async fn run(
        &self,
        request: LoopRequest,
        cancel: CancellationToken,
    ) -> Result<LoopResult, CompletionError> {
        let LoopRequest {
            request_id,
            agent,
            messages,
            files,
        } = request;
        let tools = if agent.tools_enabled {
            self.tools.list()
        } else {
            Vec::new()
        };
        let provider_id = self.providers.resolved_provider_id(None);
        let ctx = CallContext {
            request_id: &request_id,
            agent: &agent,
            provider_id: provider_id.as_deref(),
        };

        let mut state = LoopState {
            messages,
            files,
            usage: TokenUsage::default(),
            iteration: 0,
        };

        if let Err(err) = validate_tool_schemas(&tools) {
            let detail = err.to_string();
            ctx.emit(Level::ERROR, "provider.call.error", 0, |e| ObservabilityEvent {
                status: Some("failed"),
                error_code: Some("TOOL_SCHEMA_INVALID"),
                detail: Some(&detail),
                ..e
            });
            return Ok(state.finish(LoopOutcome::Failed, agent.kind.failure_text(&detail)));
        }

        let ceiling = agent.max_iterations.max(1);
        let mut last_text = String::new();
        while state.iteration < ceiling {
            state.iteration += 1;
            let iteration = state.iteration;

            let response = match self.call_model(&ctx, &state, &tools, &cancel).await {
                Ok(response) => response,
                Err(CompletionError::Cancelled) => return Err(CompletionError::Cancelled),
                Err(CompletionError::Timeout(_)) => {
                    let text = agent.kind.timeout_text().to_string();
                    return Ok(state.finish(LoopOutcome::TimedOut, text));
                }
                Err(CompletionError::Capability(detail)) => {
                    let text = agent.kind.failure_text(&detail);
                    return Ok(state.finish(LoopOutcome::Failed, text));
                }
            };

            state.usage.accumulate(response.usage.as_ref());
            let CompletionResponse {
                content,
                tool_calls,
                ..
            } = response;
            let content = content.unwrap_or_default();

            if !agent.tools_enabled || tool_calls.is_empty() {
                let mut final_text = if content.trim().is_empty() {
                    agent.kind.empty_response_text().to_string()
                } else {
                    content
                };
                if agent.produces_files && state.files.is_empty() {
                    tracing::warn!(request_id = %request_id, "agent finished without producing files");
                    final_text.push_str("\n\n");
                    final_text.push_str(NO_FILES_WARNING);
                }
                return Ok(state.finish(LoopOutcome::Done, final_text));
            }

            if !content.trim().is_empty() {
                last_text = content.clone();
            }
            state
                .messages
                .push(ChatMessage::assistant_with_tools(content, tool_calls.clone()));
            for call in &tool_calls {
                self.dispatch_tool(&ctx, iteration, call, &mut state);
            }
        }

        ctx.emit(Level::WARN, "loop.iterations_exhausted", state.iteration, |e| {
            ObservabilityEvent {
                status: Some("incomplete"),
                ..e
            }
        });
        let note = if agent.produces_files {
            FILES_INCOMPLETE_NOTE
        } else {
            RESPONSE_INCOMPLETE_NOTE
        };
        let final_text = if last_text.is_empty() {
            note.to_string()
        } else {
            format!("{last_text}\n\n{note}")
        };
        Ok(state.finish(LoopOutcome::IterationsExhausted, final_text))
    }

    async fn call_model(
        &self,
        ctx: &CallContext<'_>,
        state: &LoopState,
        tools: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, CompletionError> {
        let iteration = state.iteration;
        let timeout = ctx.agent.call_timeout;
        let request = CompletionRequest {
            messages: state.messages.clone(),
            tools: tools.to_vec(),
            model: ctx.agent.model.clone(),
            temperature: ctx.agent.temperature,
        };
        ctx.emit(Level::INFO, "provider.call.start", iteration, |e| e);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CompletionError::Cancelled),
            result = tokio::time::timeout(timeout, self.providers.chat_for_provider(None, request)) => {
                match result {
                    Err(_) => Err(CompletionError::Timeout(timeout)),
                    Ok(Err(err)) => Err(CompletionError::Capability(err.to_string())),
                    Ok(Ok(response)) => Ok(response),
                }
            }
        };

        match &outcome {
            Ok(response) => {
                let detail = format!("tool_calls={}", response.tool_calls.len());
                ctx.emit(Level::INFO, "provider.call.finish", iteration, |e| {
                    ObservabilityEvent {
                        status: Some("ok"),
                        detail: Some(&detail),
                        ..e
                    }
                });
            }
            Err(CompletionError::Timeout(_)) => {
                ctx.emit(Level::WARN, "provider.call.timeout", iteration, |e| {
                    ObservabilityEvent {
                        status: Some("timed_out"),
                        error_code: Some("TIMEOUT"),
                        ..e
                    }
                });
            }
            Err(CompletionError::Capability(detail)) => {
                let truncated = truncate_text(detail, 500);
                ctx.emit(Level::ERROR, "provider.call.error", iteration, |e| {
                    ObservabilityEvent {
                        status: Some("failed"),
                        error_code: Some(provider_error_code(detail)),
                        detail: Some(&truncated),
                        ..e
                    }
                });
            }
            Err(CompletionError::Cancelled) => {
                ctx.emit(Level::INFO, "provider.call.cancelled", iteration, |e| {
                    ObservabilityEvent {
                        status: Some("cancelled"),
                        ..e
                    }
                });
            }
        }
        outcome
    }

    fn dispatch_tool(
        &self,
        ctx: &CallContext<'_>,
        iteration: u32,
        call: &ToolInvocation,
        state: &mut LoopState,
    ) {
        match self.tools.execute(&call.name, &call.arguments, &state.files) {
            Ok(result) => {
                // Upsert; files absent from the result are kept.
                state.files.extend(result.state_files);
                state
                    .messages
                    .push(ChatMessage::tool_result(call.id.clone(), result.output));
            }
            Err(err) => {
                let message = format!("Error processing tool {}: {err}", call.name);
                ctx.emit(Level::WARN, "tool.call.error", iteration, |e| ObservabilityEvent {
                    status: Some("failed"),
                    detail: Some(&message),
                    ..e
                });
                state
                    .messages
                    .push(ChatMessage::tool_result(call.id.clone(), message));
            }
        }
    }
}

struct CallContext<'a> {
    request_id: &'a str,
    agent: &'a AgentDefinition,
    provider_id: Option<&'a str>,
}

impl CallContext<'_> {
    fn emit<'e>(
        &'e self,
        level: Level,
        event: &'e str,
        iteration: u32,
        fill: impl FnOnce(ObservabilityEvent<'e>) -> ObservabilityEvent<'e>,
    ) {
        let base = ObservabilityEvent {
            event,
            component: "core.loop",
            request_id: Some(self.request_id),
            agent: Some(self.agent.kind.as_str()),
            iteration: Some(iteration),
            provider_id: self.provider_id,
            model_id: self.agent.model.as_deref(),
            ..ObservabilityEvent::default()
        };
        emit_event(level, ProcessKind::Server, fill(base));
    }
}

fn truncate_text(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut cut = max_len;
    while !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = input[..cut].to_string();
    out.push_str("...<truncated>");
    out
}

pub fn provider_error_code(error_text: &str) -> &'static str {
    let lower = error_text.to_lowercase();
    if lower.contains("invalid_function_parameters")
        || lower.contains("array schema missing items")
        || lower.contains("tool schema")
    {
        return "TOOL_SCHEMA_INVALID";
    }
    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        return "RATE_LIMIT_EXCEEDED";
    }
    if lower.contains("context length")
        || lower.contains("max tokens")
        || lower.contains("token limit")
    {
        return "CONTEXT_LENGTH_EXCEEDED";
    }
    if lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("401")
        || lower.contains("403")
    {
        return "AUTHENTICATION_ERROR";
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return "TIMEOUT";
    }
    if lower.contains("server error")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
    {
        return "PROVIDER_SERVER_ERROR";
    }
    "PROVIDER_REQUEST_FAILED"
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use trio_providers::Provider;
    use trio_types::{MessageRole, ProviderInfo};

    use super::*;
    use crate::agents::{AgentKind, AgentRegistry};

    pub(crate) enum Step {
        Reply(CompletionResponse),
        Fail(&'static str),
        Hang,
    }

    /// Plays back a fixed script of replies and records every request.
    pub(crate) struct ScriptedProvider {
        steps: Mutex<VecDeque<Step>>,
        pub(crate) seen: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                id: "scripted".to_string(),
                name: "Scripted".to_string(),
                models: Vec::new(),
            }
        }

        async fn chat(&self, request: CompletionRequest) -> anyhow::Result<CompletionResponse> {
            self.seen.lock().expect("seen lock").push(request);
            let step = self.steps.lock().expect("steps lock").pop_front();
            match step {
                Some(Step::Reply(response)) => Ok(response),
                Some(Step::Fail(detail)) => anyhow::bail!(detail),
                Some(Step::Hang) => std::future::pending().await,
                None => Ok(CompletionResponse::text("script exhausted")),
            }
        }
    }

    pub(crate) fn registry_for(provider: Arc<ScriptedProvider>) -> ProviderRegistry {
        let provider: Arc<dyn Provider> = provider;
        ProviderRegistry::from_providers(vec![provider], None)
    }

    pub(crate) fn usage(prompt: u64, completion: u64) -> Option<TokenUsage> {
        Some(TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            reasoning_tokens: 0,
        })
    }

    pub(crate) fn tool_call(id: &str, name: &str, arguments: Value) -> ToolInvocation {
        ToolInvocation {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    pub(crate) fn calls(tool_calls: Vec<ToolInvocation>, usage: Option<TokenUsage>) -> Step {
        Step::Reply(CompletionResponse {
            content: None,
            tool_calls,
            usage,
            finish_reason: Some("tool_calls".to_string()),
        })
    }

    pub(crate) fn reply(text: &str, usage: Option<TokenUsage>) -> Step {
        Step::Reply(CompletionResponse {
            usage,
            ..CompletionResponse::text(text)
        })
    }

    fn write_call(id: &str, path: &str, content: &str) -> ToolInvocation {
        tool_call(
            id,
            "create_or_update_files",
            json!({"files": [{"path": path, "content": content}]}),
        )
    }

    fn developer(max_iterations: u32) -> AgentDefinition {
        let mut agent = AgentRegistry::default().get(AgentKind::Developer).clone();
        agent.max_iterations = max_iterations;
        agent
    }

    fn request(agent: AgentDefinition, files: FileMap) -> LoopRequest {
        LoopRequest {
            request_id: "req-test".to_string(),
            agent,
            messages: vec![ChatMessage::system("SYS"), ChatMessage::user("build it")],
            files,
        }
    }

    async fn run(
        provider: Arc<ScriptedProvider>,
        req: LoopRequest,
    ) -> Result<LoopResult, CompletionError> {
        CompletionLoop::new(registry_for(provider), ToolRegistry::new())
            .run(req, CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn finishes_when_model_answers_without_tools() {
        let provider = ScriptedProvider::new(vec![reply("all done", usage(10, 5))]);
        let mut files = FileMap::new();
        files.insert("a.txt".to_string(), "x".to_string());
        let result = run(provider.clone(), request(developer(5), files))
            .await
            .expect("result");

        assert_eq!(result.outcome, LoopOutcome::Done);
        assert_eq!(result.final_text, "all done");
        assert_eq!(result.iterations_used, 1);
        assert_eq!(result.usage.total_tokens, 15);
        let seen = provider.seen.lock().expect("seen");
        assert_eq!(seen[0].tools.len(), 2);
        assert!((seen[0].temperature.unwrap_or_default() - 0.7).abs() < 1e-6);
    }

    #[tokio::test]
    async fn write_then_read_in_one_turn_observes_the_write() {
        let provider = ScriptedProvider::new(vec![
            calls(
                vec![
                    write_call("call_w", "a.txt", "hello"),
                    tool_call("call_r", "read_files", json!({"files": ["a.txt"]})),
                ],
                usage(3, 2),
            ),
            reply("wrote a.txt", usage(4, 1)),
        ]);
        let result = run(provider.clone(), request(developer(5), FileMap::new()))
            .await
            .expect("result");

        assert_eq!(result.outcome, LoopOutcome::Done);
        assert_eq!(result.iterations_used, 2);
        assert_eq!(result.files.get("a.txt").map(String::as_str), Some("hello"));

        let tool_messages = result
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .collect::<Vec<_>>();
        assert_eq!(tool_messages.len(), 2);
        assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_w"));
        assert_eq!(tool_messages[0].content, "Successfully created 1 files: a.txt");
        assert_eq!(tool_messages[1].tool_call_id.as_deref(), Some("call_r"));
        let read: Value = serde_json::from_str(&tool_messages[1].content).expect("read json");
        assert_eq!(read, json!([{"path": "a.txt", "content": "hello", "exists": true}]));

        // The second call sees the assistant turn and both tool results.
        let seen = provider.seen.lock().expect("seen");
        let second = &seen[1].messages;
        assert_eq!(second.len(), 5);
        assert!(second[2].has_tool_calls());
    }

    #[tokio::test]
    async fn usage_is_summed_and_missing_usage_counts_as_zero() {
        let provider = ScriptedProvider::new(vec![
            calls(vec![write_call("c1", "a.txt", "1")], usage(10, 2)),
            calls(vec![write_call("c2", "b.txt", "2")], None),
            reply("done", usage(30, 4)),
        ]);
        let result = run(provider, request(developer(5), FileMap::new()))
            .await
            .expect("result");
        assert_eq!(result.usage.prompt_tokens, 40);
        assert_eq!(result.usage.completion_tokens, 6);
        assert_eq!(result.usage.total_tokens, 46);
        assert_eq!(result.files.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_times_out_with_pre_call_files() {
        let provider = ScriptedProvider::new(vec![Step::Hang]);
        let mut files = FileMap::new();
        files.insert("test/a.test.ts".to_string(), "expect(1)".to_string());
        let mut agent = developer(5);
        agent.call_timeout = Duration::from_millis(50);
        let result = run(provider, request(agent, files.clone()))
            .await
            .expect("result");

        assert_eq!(result.outcome, LoopOutcome::TimedOut);
        assert_eq!(result.files, files);
        assert_eq!(
            result.final_text,
            "Timed out generating code. Please try again with a more specific prompt."
        );
        assert_eq!(result.usage, TokenUsage::default());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_files_merged_in_earlier_iterations() {
        let provider = ScriptedProvider::new(vec![
            calls(vec![write_call("c1", "a.txt", "1")], usage(1, 1)),
            Step::Hang,
        ]);
        let mut agent = developer(5);
        agent.call_timeout = Duration::from_millis(50);
        let result = run(provider, request(agent, FileMap::new()))
            .await
            .expect("result");
        assert_eq!(result.outcome, LoopOutcome::TimedOut);
        assert!(result.files.contains_key("a.txt"));
        assert_eq!(result.usage.total_tokens, 2);
        assert_eq!(result.iterations_used, 2);
    }

    #[tokio::test]
    async fn ceiling_of_one_stops_after_first_tool_turn() {
        let provider = ScriptedProvider::new(vec![
            calls(vec![write_call("c1", "a.txt", "1")], usage(5, 5)),
            calls(vec![write_call("c2", "b.txt", "2")], usage(5, 5)),
        ]);
        let result = run(provider.clone(), request(developer(1), FileMap::new()))
            .await
            .expect("result");

        assert_eq!(result.outcome, LoopOutcome::IterationsExhausted);
        assert_eq!(result.iterations_used, 1);
        assert_eq!(result.files.get("a.txt").map(String::as_str), Some("1"));
        assert!(!result.files.contains_key("b.txt"));
        assert_eq!(result.final_text, FILES_INCOMPLETE_NOTE);
        assert_eq!(provider.seen.lock().expect("seen").len(), 1);
    }

    #[tokio::test]
    async fn bad_tool_calls_become_tool_messages_and_loop_continues() {
        let provider = ScriptedProvider::new(vec![
            calls(
                vec![
                    tool_call("c1", "delete_everything", json!({})),
                    tool_call("c2", "create_or_update_files", json!({"files": "nope"})),
                    write_call("c3", "ok.txt", "fine"),
                ],
                None,
            ),
            reply("recovered", None),
        ]);
        let result = run(provider, request(developer(5), FileMap::new()))
            .await
            .expect("result");

        assert_eq!(result.outcome, LoopOutcome::Done);
        let tool_messages = result
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .map(|m| (m.tool_call_id.as_deref(), m.content.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            tool_messages[0],
            (
                Some("c1"),
                "Error processing tool delete_everything: Unknown tool: delete_everything"
            )
        );
        assert_eq!(tool_messages[1].0, Some("c2"));
        assert!(tool_messages[1].1.contains("Invalid arguments"));
        assert_eq!(result.files.keys().collect::<Vec<_>>(), vec!["ok.txt"]);
    }

    #[tokio::test]
    async fn provider_failure_ends_loop_with_fallback_text() {
        let provider = ScriptedProvider::new(vec![Step::Fail("Rate limit reached (status 429)")]);
        let result = run(provider, request(developer(5), FileMap::new()))
            .await
            .expect("result");
        assert_eq!(result.outcome, LoopOutcome::Failed);
        assert_eq!(
            result.final_text,
            "Error generating code: Rate limit reached (status 429). Please try again."
        );
        assert_eq!(provider_error_code("Rate limit reached (status 429)"), "RATE_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn empty_answer_without_files_gets_placeholder_and_warning() {
        let provider = ScriptedProvider::new(vec![reply("", None)]);
        let result = run(provider, request(developer(5), FileMap::new()))
            .await
            .expect("result");
        assert_eq!(
            result.final_text,
            format!("Generated code files for the request.\n\n{NO_FILES_WARNING}")
        );
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_call() {
        let provider = ScriptedProvider::new(vec![Step::Hang]);
        let cancel = CancellationToken::new();
        let loop_ = CompletionLoop::new(registry_for(provider), ToolRegistry::new());
        let trigger = cancel.clone();
        let handle = tokio::spawn(async move {
            loop_
                .run(request(developer(5), FileMap::new()), cancel)
                .await
        });
        tokio::task::yield_now().await;
        trigger.cancel();
        let outcome = handle.await.expect("join");
        assert!(matches!(outcome, Err(CompletionError::Cancelled)));
    }

    #[tokio::test]
    async fn single_shot_agents_ignore_tool_calls() {
        let mut response = CompletionResponse::text("plan");
        response.tool_calls = vec![write_call("c1", "a.txt", "1")];
        let provider = ScriptedProvider::new(vec![Step::Reply(response)]);
        let agent = AgentRegistry::default()
            .get(AgentKind::SystemArchitect)
            .clone();
        let result = run(provider.clone(), request(agent, FileMap::new()))
            .await
            .expect("result");
        assert_eq!(result.outcome, LoopOutcome::Done);
        assert_eq!(result.final_text, "plan");
        assert!(result.files.is_empty());
        assert!(provider.seen.lock().expect("seen")[0].tools.is_empty());
    }
}
