use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use trio_types::{
    ChatMessage, MessageRole, ModelInfo, ProviderInfo, TokenUsage, ToolInvocation, ToolSchema,
};

pub const DEFAULT_TRANSPORT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    /// Transport-level retries per completion call.
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolInvocation>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

impl CompletionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            finish_reason: Some("stop".to_string()),
            ..Self::default()
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;
    async fn chat(&self, request: CompletionRequest) -> anyhow::Result<CompletionResponse>;
}

/// Providers fixed at construction. Cloning shares the provider list.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<[Arc<dyn Provider>]>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new(config: AppConfig) -> Self {
        let providers = build_providers(&config);
        Self::from_providers(providers, config.default_provider)
    }

    pub fn from_providers(
        providers: Vec<Arc<dyn Provider>>,
        default_provider: Option<String>,
    ) -> Self {
        Self {
            providers: providers.into(),
            default_provider,
        }
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        self.providers.iter().map(|p| p.info()).collect()
    }

    pub async fn chat_for_provider(
        &self,
        provider_id: Option<&str>,
        request: CompletionRequest,
    ) -> anyhow::Result<CompletionResponse> {
        let provider = self.select_provider(provider_id)?;
        provider.chat(request).await
    }

    /// Id of the provider a call without an explicit provider would use.
    pub fn resolved_provider_id(&self, provider_id: Option<&str>) -> Option<String> {
        self.select_provider(provider_id).ok().map(|p| p.info().id)
    }

    /// Explicit id, then the configured default, then the first registered.
    fn select_provider(&self, provider_id: Option<&str>) -> anyhow::Result<&Arc<dyn Provider>> {
        let by_id = |id: &str| self.providers.iter().find(|p| p.info().id == id);

        if let Some(id) = provider_id {
            return by_id(id).ok_or_else(|| {
                let known = self.providers.iter().map(|p| p.info().id).collect::<Vec<_>>();
                anyhow::anyhow!(
                    "provider `{id}` is not configured. configured providers: {}",
                    known.join(", ")
                )
            });
        }

        self.default_provider
            .as_deref()
            .and_then(by_id)
            .or_else(|| self.providers.first())
            .ok_or_else(|| anyhow::anyhow!("No provider configured."))
    }
}

fn build_providers(config: &AppConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    let retries = config.max_retries.unwrap_or(DEFAULT_TRANSPORT_RETRIES);

    for (id, name, default_url, default_model, use_api_key) in [
        (
            "openai",
            "OpenAI",
            "https://api.openai.com/v1",
            "gpt-4.1-mini",
            true,
        ),
        (
            "openrouter",
            "OpenRouter",
            "https://openrouter.ai/api/v1",
            "openai/gpt-4.1-mini",
            true,
        ),
        (
            "ollama",
            "Ollama",
            "http://127.0.0.1:11434/v1",
            "llama3.1:8b",
            false,
        ),
        (
            "groq",
            "Groq",
            "https://api.groq.com/openai/v1",
            "llama-3.1-8b-instant",
            true,
        ),
        (
            "mistral",
            "Mistral",
            "https://api.mistral.ai/v1",
            "mistral-small-latest",
            true,
        ),
        (
            "together",
            "Together",
            "https://api.together.xyz/v1",
            "meta-llama/Llama-3.1-8B-Instruct-Turbo",
            true,
        ),
    ] {
        add_openai_provider(
            config,
            &mut providers,
            OpenAIDefaults {
                id,
                name,
                default_url,
                default_model,
                use_api_key,
                retries,
            },
        );
    }

    if providers.is_empty() {
        providers.push(Arc::new(LocalEchoProvider));
    }

    providers
}

struct OpenAIDefaults<'a> {
    id: &'a str,
    name: &'a str,
    default_url: &'a str,
    default_model: &'a str,
    use_api_key: bool,
    retries: u32,
}

fn add_openai_provider(
    config: &AppConfig,
    providers: &mut Vec<Arc<dyn Provider>>,
    defaults: OpenAIDefaults<'_>,
) {
    let Some(entry) = config.providers.get(defaults.id) else {
        return;
    };
    providers.push(Arc::new(OpenAICompatibleProvider {
        id: defaults.id.to_string(),
        name: defaults.name.to_string(),
        base_url: normalize_base(entry.url.as_deref().unwrap_or(defaults.default_url)),
        api_key: if defaults.use_api_key {
            entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string())
                .or_else(|| env_api_key_for_provider(defaults.id))
        } else {
            None
        },
        default_model: entry
            .default_model
            .clone()
            .unwrap_or_else(|| defaults.default_model.to_string()),
        max_retries: defaults.retries,
        client: Client::new(),
    }));
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = match id {
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "together" => Some("TOGETHER_API_KEY"),
        _ => None,
    }?;
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Offline fallback used when no provider is configured.
struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "local".to_string(),
            name: "Local Echo".to_string(),
            models: vec![ModelInfo {
                id: "echo-1".to_string(),
                provider_id: "local".to_string(),
                display_name: "Echo Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn chat(&self, request: CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(CompletionResponse::text(format!("Echo: {last_user}")))
    }
}

struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    max_retries: u32,
    client: Client,
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                display_name: self.default_model.clone(),
                context_window: 128_000,
            }],
        }
    }

    async fn chat(&self, request: CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
            .to_string();
        let body = build_chat_body(&model, &request);
        let url = format!("{}/chat/completions", self.base_url);

        let mut attempt = 0u32;
        loop {
            let mut req = self.client.post(&url).json(&body);
            if self.id == "openrouter" {
                req = req.header("X-Title", "Trio");
            }
            if let Some(api_key) = &self.api_key {
                req = req.bearer_auth(api_key);
            }

            let (retryable, err) = match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    let value: Value = response.json().await.unwrap_or(Value::Null);
                    if status.is_success() {
                        return parse_chat_completion(&value, &model);
                    }
                    let detail = extract_openai_error(&value).unwrap_or_else(|| {
                        format!("provider request failed with status {}", status)
                    });
                    (
                        is_retryable_status(status),
                        anyhow::anyhow!("{} (status {})", detail, status.as_u16()),
                    )
                }
                Err(err) => (
                    err.is_timeout() || err.is_connect() || err.is_request(),
                    anyhow::Error::new(err),
                ),
            };

            if !retryable || attempt >= self.max_retries {
                return Err(err);
            }
            attempt += 1;
            tracing::warn!(
                provider = %self.id,
                attempt,
                max_retries = self.max_retries,
                "retrying completion call: {err}"
            );
            tokio::time::sleep(retry_backoff(attempt)).await;
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_millis(250u64.saturating_mul(1u64 << attempt.min(5)))
}

fn build_chat_body(model: &str, request: &CompletionRequest) -> Value {
    let wire_messages = request
        .messages
        .iter()
        .map(wire_message)
        .collect::<Vec<_>>();

    let wire_tools = request
        .tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect::<Vec<_>>();

    let mut body = json!({
        "model": model,
        "messages": wire_messages,
        "stream": false,
    });
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if !wire_tools.is_empty() {
        body["tools"] = Value::Array(wire_tools);
        body["tool_choice"] = json!("auto");
    }
    body
}

fn wire_message(message: &ChatMessage) -> Value {
    match message.role {
        MessageRole::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
            "content": message.content,
        }),
        MessageRole::Assistant if message.has_tool_calls() => {
            let calls = message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": match &call.arguments {
                                Value::String(raw) => raw.clone(),
                                other => other.to_string(),
                            },
                        }
                    })
                })
                .collect::<Vec<_>>();
            let content = if message.content.is_empty() {
                Value::Null
            } else {
                Value::String(message.content.clone())
            };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
        role => json!({"role": role.as_str(), "content": message.content}),
    }
}

fn parse_chat_completion(value: &Value, model: &str) -> anyhow::Result<CompletionResponse> {
    if let Some(detail) = extract_openai_error(value) {
        anyhow::bail!(detail);
    }
    let Some(choice) = value.get("choices").and_then(|v| v.get(0)) else {
        let body_preview = truncate_for_error(&value.to_string(), 500);
        anyhow::bail!(
            "provider returned no completion choices for model `{}` (response: {})",
            model,
            body_preview
        );
    };
    let message = choice.get("message").cloned().unwrap_or_default();

    let mut content = String::new();
    if let Some(raw) = message.get("content") {
        collect_text_fragments(raw, &mut content);
    }

    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(idx, call)| parse_tool_call(idx, call))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(CompletionResponse {
        content: (!content.is_empty()).then_some(content),
        tool_calls,
        usage: extract_usage(value),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

fn parse_tool_call(idx: usize, call: &Value) -> Option<ToolInvocation> {
    let function = call.get("function")?;
    let name = function.get("name").and_then(|v| v.as_str())?.trim();
    if name.is_empty() {
        return None;
    }
    let id = call
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{idx}"));
    let arguments = match function.get("arguments") {
        Some(Value::String(raw)) if raw.trim().is_empty() => json!({}),
        // Unparseable argument text is passed through so the tool can report it.
        Some(Value::String(raw)) => {
            serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        }
        Some(other) => other.clone(),
        None => json!({}),
    };
    Some(ToolInvocation {
        id,
        name: name.to_string(),
        arguments,
    })
}

/// Base URLs are stored without a trailing slash and always end in `/v1`.
fn normalize_base(input: &str) -> String {
    let base = input.trim().trim_end_matches('/');
    match base.strip_suffix("/v1") {
        Some(_) => base.to_string(),
        None => format!("{base}/v1"),
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut cut = max_len;
    while !input.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &input[..cut])
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage").filter(|v| v.is_object())?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    let reasoning_tokens = usage
        .get("completion_tokens_details")
        .and_then(|v| v.get("reasoning_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        reasoning_tokens,
    })
}

fn collect_text_fragments(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Array(arr) => {
            for item in arr {
                collect_text_fragments(item, out);
            }
        }
        Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(|v| v.as_str()) {
                out.push_str(text);
            }
            if let Some(content) = map.get("content") {
                collect_text_fragments(content, out);
            }
        }
        _ => {}
    }
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("error")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}
