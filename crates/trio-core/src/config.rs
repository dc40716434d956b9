use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

pub const DEFAULT_MAX_ITERATIONS: u32 = 5;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 150;
pub const DEFAULT_SINGLE_SHOT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_TRANSPORT_RETRIES: u32 = 3;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentModels {
    pub ba: Option<String>,
    pub system_architect: Option<String>,
    pub developer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_iterations: u32,
    pub call_timeout_secs: u64,
    pub single_shot_timeout_secs: u64,
    pub transport_retries: u32,
    pub temperature: f32,
    pub models: AgentModels,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            single_shot_timeout_secs: DEFAULT_SINGLE_SHOT_TIMEOUT_SECS,
            transport_retries: DEFAULT_TRANSPORT_RETRIES,
            temperature: DEFAULT_TEMPERATURE,
            models: AgentModels::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agents: AgentSettings,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: global file, project file, environment, CLI.
/// Later layers win. Layers are read once at construction and the store never
/// writes back to disk.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    layers: ConfigLayers,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path();
        Self::with_global_path(path, global_path, cli_overrides).await
    }

    pub async fn with_global_path(
        path: impl AsRef<Path>,
        global_path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let layers = ConfigLayers {
            global: read_json_file(global_path.as_ref()).await?,
            project: read_json_file(path.as_ref()).await?,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self { layers })
    }

    pub fn get(&self) -> AppConfig {
        match serde_json::from_value(self.get_effective_value()) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("effective config is invalid, using defaults: {err}");
                AppConfig::default()
            }
        }
    }

    pub fn get_effective_value(&self) -> Value {
        let mut merged = empty_object();
        for layer in [
            &self.layers.global,
            &self.layers.project,
            &self.layers.env,
            &self.layers.cli,
        ] {
            deep_merge(&mut merged, layer);
        }
        merged
    }

    /// Effective config with provider keys and the API token masked, for logging.
    pub fn get_redacted_value(&self) -> Value {
        let mut value = self.get_effective_value();
        strip_secrets(&mut value);
        value
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn strip_secrets(value: &mut Value) {
    let Value::Object(root) = value else {
        return;
    };
    if let Some(server) = root.get_mut("server").and_then(|v| v.as_object_mut()) {
        if server.contains_key("api_token") {
            server.insert("api_token".to_string(), json!("[redacted]"));
        }
    }
    let Some(providers) = root.get_mut("providers").and_then(|v| v.as_object_mut()) else {
        return;
    };
    for provider_cfg in providers.values_mut() {
        let Value::Object(cfg) = provider_cfg else {
            continue;
        };
        if cfg.contains_key("api_key") {
            cfg.insert("api_key".to_string(), json!("[redacted]"));
        }
    }
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::warn!(path = %path.display(), "ignoring unparseable config file: {err}");
            Ok(empty_object())
        }
    }
}

fn resolve_global_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TRIO_GLOBAL_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("trio").join("config.json");
    }
    PathBuf::from(".trio/global_config.json")
}

/// Provider id and the variable holding its API key.
const PROVIDER_KEY_ENV: [(&str, &str); 5] = [
    ("openai", "OPENAI_API_KEY"),
    ("openrouter", "OPENROUTER_API_KEY"),
    ("groq", "GROQ_API_KEY"),
    ("mistral", "MISTRAL_API_KEY"),
    ("together", "TOGETHER_API_KEY"),
];

/// Environment layer. Keys only enable a provider; its url and model keep
/// coming from lower layers or the provider defaults.
fn env_layer() -> Value {
    let mut root = empty_object();

    for (provider, var) in PROVIDER_KEY_ENV {
        if let Some(api_key) = non_empty_env(var) {
            deep_merge(
                &mut root,
                &json!({ "providers": { provider: { "api_key": api_key } } }),
            );
        }
    }
    if let Some(url) = non_empty_env("OLLAMA_URL") {
        deep_merge(&mut root, &json!({ "providers": { "ollama": { "url": url } } }));
    }

    let api_token = non_empty_env("TRIO_API_TOKEN").or_else(|| non_empty_env("API_KEY"));
    if let Some(token) = api_token {
        deep_merge(&mut root, &json!({ "server": { "api_token": token } }));
    }
    if let Some(n) = non_empty_env("TRIO_MAX_ITERATIONS").and_then(|v| v.parse::<u32>().ok()) {
        deep_merge(&mut root, &json!({ "agents": { "max_iterations": n } }));
    }
    if let Some(secs) =
        non_empty_env("TRIO_CALL_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "agents": { "call_timeout_secs": secs } }));
    }

    root
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Objects merge key by key; any other overlay value replaces the base.
/// Nulls in the overlay never erase a lower layer.
fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(into), Value::Object(from)) => {
            for (key, value) in from.iter().filter(|(_, v)| !v.is_null()) {
                if let Some(existing) = into.get_mut(key) {
                    deep_merge(existing, value);
                } else {
                    into.insert(key.clone(), value.clone());
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

impl From<ProviderConfig> for trio_providers::ProviderConfig {
    fn from(value: ProviderConfig) -> Self {
        Self {
            api_key: value.api_key,
            url: value.url,
            default_model: value.default_model,
        }
    }
}

impl From<AppConfig> for trio_providers::AppConfig {
    fn from(value: AppConfig) -> Self {
        Self {
            providers: value
                .providers
                .into_iter()
                .map(|(k, v)| (k, v.into()))
                .collect(),
            default_provider: value.default_provider,
            max_retries: Some(value.agents.transport_retries),
        }
    }
}
