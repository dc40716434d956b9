use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::AgentSettings;
use crate::prompts::{
    BA_SYSTEM_PROMPT, DEVELOPER_PROMPT, DEVELOPER_TDD_PROMPT, SYSTEM_ARCHITECT_PROMPT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentKind {
    #[serde(rename = "ba")]
    BusinessAnalyst,
    #[serde(rename = "system-architect")]
    SystemArchitect,
    #[serde(rename = "developer")]
    Developer,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::BusinessAnalyst => "ba",
            AgentKind::SystemArchitect => "system-architect",
            AgentKind::Developer => "developer",
        }
    }

    /// Assistant text used when the completion call times out.
    pub fn timeout_text(self) -> &'static str {
        match self {
            AgentKind::Developer => {
                "Timed out generating code. Please try again with a more specific prompt."
            }
            AgentKind::SystemArchitect => {
                "Timed out generating response. Please try again with a more specific conversation."
            }
            AgentKind::BusinessAnalyst => {
                "Timed out generating response. Please try again with a more specific prompt."
            }
        }
    }

    pub fn failure_text(self, detail: &str) -> String {
        match self {
            AgentKind::Developer => format!("Error generating code: {detail}. Please try again."),
            _ => format!("Error generating response: {detail}. Please try again."),
        }
    }

    /// Final text when the model answers with neither text nor tool calls.
    pub fn empty_response_text(self) -> &'static str {
        match self {
            AgentKind::Developer => "Generated code files for the request.",
            _ => "Generated response for the request.",
        }
    }

    /// Response body text for a request that failed before the loop produced a result.
    pub fn error_response_text(self, detail: &str) -> String {
        match self {
            AgentKind::BusinessAnalyst => format!("Error: {detail}"),
            AgentKind::SystemArchitect => format!("Error: {detail}. No response generated."),
            AgentKind::Developer => format!("Error: {detail}. No files generated."),
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "ba" | "business-analyst" => Ok(AgentKind::BusinessAnalyst),
            "sa" | "system-architect" => Ok(AgentKind::SystemArchitect),
            "dev" | "developer" => Ok(AgentKind::Developer),
            other => anyhow::bail!(
                "unknown agent `{other}`; expected one of: ba, system-architect, developer"
            ),
        }
    }
}

/// Where the role prompt goes in the outgoing message sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPlacement {
    SystemMessage,
    /// Prepended to the first user message; no system message is sent.
    FirstUserMessage,
}

#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub kind: AgentKind,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub call_timeout: Duration,
    pub max_iterations: u32,
    pub tools_enabled: bool,
    pub produces_files: bool,
    pub prompt_placement: PromptPlacement,
}

impl AgentDefinition {
    pub fn system_prompt(&self, tdd_enabled: bool) -> &'static str {
        match self.kind {
            AgentKind::BusinessAnalyst => BA_SYSTEM_PROMPT,
            AgentKind::SystemArchitect => SYSTEM_ARCHITECT_PROMPT,
            AgentKind::Developer if tdd_enabled => DEVELOPER_TDD_PROMPT,
            AgentKind::Developer => DEVELOPER_PROMPT,
        }
    }

    /// A request-supplied model wins over the configured one.
    pub fn with_model_override(&self, model: Option<&str>) -> Self {
        let mut out = self.clone();
        if let Some(model) = model.map(str::trim).filter(|m| !m.is_empty()) {
            out.model = Some(model.to_string());
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct AgentRegistry {
    business_analyst: AgentDefinition,
    system_architect: AgentDefinition,
    developer: AgentDefinition,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::from_settings(&AgentSettings::default())
    }
}

impl AgentRegistry {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        let single_shot = Duration::from_secs(settings.single_shot_timeout_secs.max(1));
        Self {
            business_analyst: AgentDefinition {
                kind: AgentKind::BusinessAnalyst,
                model: settings.models.ba.clone(),
                temperature: Some(settings.temperature),
                call_timeout: single_shot,
                max_iterations: 1,
                tools_enabled: false,
                produces_files: false,
                prompt_placement: PromptPlacement::SystemMessage,
            },
            system_architect: AgentDefinition {
                kind: AgentKind::SystemArchitect,
                model: settings.models.system_architect.clone(),
                temperature: None,
                call_timeout: single_shot,
                max_iterations: 1,
                tools_enabled: false,
                produces_files: false,
                prompt_placement: PromptPlacement::FirstUserMessage,
            },
            developer: AgentDefinition {
                kind: AgentKind::Developer,
                model: settings.models.developer.clone(),
                temperature: Some(settings.temperature),
                call_timeout: Duration::from_secs(settings.call_timeout_secs.max(1)),
                max_iterations: settings.max_iterations.max(1),
                tools_enabled: true,
                produces_files: true,
                prompt_placement: PromptPlacement::SystemMessage,
            },
        }
    }

    pub fn get(&self, kind: AgentKind) -> &AgentDefinition {
        match kind {
            AgentKind::BusinessAnalyst => &self.business_analyst,
            AgentKind::SystemArchitect => &self.system_architect,
            AgentKind::Developer => &self.developer,
        }
    }

    pub fn list(&self) -> Vec<&AgentDefinition> {
        vec![&self.business_analyst, &self.system_architect, &self.developer]
    }
}
