use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use trio_observability::{emit_event, ObservabilityEvent, ProcessKind};
use trio_providers::ProviderRegistry;
use trio_tools::ToolRegistry;
use trio_types::{FileMap, MessageRole};
use trio_wire::{
    AgentResponse, ArchitectRequest, DeveloperRequest, DeveloperResponse, PromptRequest,
};

use crate::agents::{AgentDefinition, AgentKind, AgentRegistry};
use crate::assembler::{
    agent_error_response, agent_response, developer_error_response, developer_response,
};
use crate::engine_loop::{CompletionError, CompletionLoop, LoopRequest, LoopResult};
use crate::normalizer::normalize_conversation;
use crate::prompts::DEVELOPER_TOOL_REMINDER;

/// Why a run produced no loop result.
enum RunFailure {
    Cancelled,
    Internal(String),
}

/// Entry point for the three agents. Every call returns a well-formed
/// response unless the request is cancelled.
#[derive(Clone)]
pub struct AgentRunner {
    agents: AgentRegistry,
    completion: CompletionLoop,
}

impl AgentRunner {
    pub fn new(agents: AgentRegistry, providers: ProviderRegistry, tools: ToolRegistry) -> Self {
        Self {
            agents,
            completion: CompletionLoop::new(providers, tools),
        }
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub async fn business_analyst(
        &self,
        request: PromptRequest,
        cancel: CancellationToken,
    ) -> Result<AgentResponse, CompletionError> {
        let started = Instant::now();
        let kind = AgentKind::BusinessAnalyst;
        let agent = self.agents.get(kind).with_model_override(request.model.as_deref());
        let entries = vec![user_entry(request.prompt.trim())];
        match self.run(agent, &entries, FileMap::new(), false, cancel).await {
            Ok(result) => Ok(agent_response(result, started.elapsed())),
            Err(RunFailure::Cancelled) => Err(CompletionError::Cancelled),
            Err(RunFailure::Internal(detail)) => {
                Ok(agent_error_response(kind, &detail, started.elapsed()))
            }
        }
    }

    pub async fn system_architect(
        &self,
        request: ArchitectRequest,
        cancel: CancellationToken,
    ) -> Result<AgentResponse, CompletionError> {
        let started = Instant::now();
        let kind = AgentKind::SystemArchitect;
        let agent = self.agents.get(kind).with_model_override(request.model.as_deref());
        let mut entries = request.conversation;
        if entries.is_empty() {
            if let Some(prompt) = request.prompt.as_deref() {
                entries.push(user_entry(prompt.trim()));
            }
        }
        match self.run(agent, &entries, FileMap::new(), false, cancel).await {
            Ok(result) => Ok(agent_response(result, started.elapsed())),
            Err(RunFailure::Cancelled) => Err(CompletionError::Cancelled),
            Err(RunFailure::Internal(detail)) => {
                Ok(agent_error_response(kind, &detail, started.elapsed()))
            }
        }
    }

    pub async fn developer(
        &self,
        request: DeveloperRequest,
        cancel: CancellationToken,
    ) -> Result<DeveloperResponse, CompletionError> {
        let started = Instant::now();
        let agent = self
            .agents
            .get(AgentKind::Developer)
            .with_model_override(request.model.as_deref());

        let content = match developer_user_content(
            &request.prompt,
            &request.current_folder,
            request.tdd_enabled,
        ) {
            Ok(content) => content,
            Err(err) => {
                return Ok(developer_error_response(&err.to_string(), started.elapsed()));
            }
        };
        let entries = vec![user_entry(&content)];
        match self
            .run(
                agent,
                &entries,
                request.current_folder,
                request.tdd_enabled,
                cancel,
            )
            .await
        {
            Ok(result) => {
                tracing::info!(
                    files_count = result.files.len(),
                    outcome = result.outcome.as_str(),
                    "developer agent completed"
                );
                Ok(developer_response(result, started.elapsed()))
            }
            Err(RunFailure::Cancelled) => Err(CompletionError::Cancelled),
            Err(RunFailure::Internal(detail)) => {
                Ok(developer_error_response(&detail, started.elapsed()))
            }
        }
    }

    async fn run(
        &self,
        agent: AgentDefinition,
        entries: &[Value],
        files: FileMap,
        tdd_enabled: bool,
        cancel: CancellationToken,
    ) -> Result<LoopResult, RunFailure> {
        let request_id = Uuid::new_v4().to_string();
        let normalized = normalize_conversation(
            entries,
            agent.system_prompt(tdd_enabled),
            agent.prompt_placement,
            &files,
        );
        for dropped in &normalized.dropped {
            let detail = format!("entry {}: {}", dropped.index, dropped.reason);
            emit_event(
                Level::WARN,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "conversation.entry.dropped",
                    component: "core.normalizer",
                    request_id: Some(&request_id),
                    agent: Some(agent.kind.as_str()),
                    status: Some("dropped"),
                    detail: Some(&detail),
                    ..ObservabilityEvent::default()
                },
            );
        }
        if !normalized
            .messages
            .iter()
            .any(|m| m.role == MessageRole::User)
        {
            return Err(RunFailure::Internal(
                "conversation contains no usable user message".to_string(),
            ));
        }

        let request = LoopRequest {
            request_id,
            agent,
            messages: normalized.messages,
            files,
        };
        let guarded = AssertUnwindSafe(self.completion.run(request, cancel)).catch_unwind();
        match guarded.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(CompletionError::Cancelled)) => Err(RunFailure::Cancelled),
            Ok(Err(err)) => Err(RunFailure::Internal(err.to_string())),
            Err(payload) => {
                let detail = panic_detail(payload.as_ref());
                tracing::error!("agent run panicked: {detail}");
                Err(RunFailure::Internal(detail))
            }
        }
    }
}

fn user_entry(content: &str) -> Value {
    json!({"type": "text", "role": "user", "content": content})
}

fn developer_user_content(
    prompt: &str,
    current_folder: &FileMap,
    tdd_enabled: bool,
) -> anyhow::Result<String> {
    let mut content = format!("**System Architect Requirements:**\n{}", prompt.trim());
    content.push_str("\n\n");
    content.push_str(DEVELOPER_TOOL_REMINDER);
    if tdd_enabled {
        let tests = serde_json::to_string_pretty(current_folder)?;
        content.push_str(&format!("\n\n**Current Test Files:**\n```json\n{tests}\n```"));
    }
    Ok(content)
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "internal error".to_string()
}
