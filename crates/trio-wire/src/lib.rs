use serde::{Deserialize, Serialize};
use serde_json::Value;

use trio_types::{FileMap, TokenUsage};

/// Body of `POST /agents/ba`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Body of `POST /agents/system-architect`. Entries stay untyped here so
/// that malformed ones reach the normalizer and are dropped individually.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchitectRequest {
    #[serde(default)]
    pub conversation: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Body of `POST /agents/developer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeveloperRequest {
    pub prompt: String,
    #[serde(default)]
    pub current_folder: FileMap,
    #[serde(default)]
    pub tdd_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResponse {
    pub response: String,
    pub time_taken_seconds: f64,
    pub tokens: TokenUsage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeveloperState {
    pub files: FileMap,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeveloperResponse {
    pub response: String,
    pub state: DeveloperState,
    pub time_taken_seconds: f64,
    pub tokens: TokenUsage,
    pub files_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    pub api_token_required: bool,
    pub providers: Vec<String>,
}
