use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::{fs, io::Read};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use trio_core::{
    AgentKind, AgentRegistry, AgentRunner, ConfigStore, DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT,
};
use trio_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, redact_text,
    ObservabilityEvent, ProcessKind,
};
use trio_providers::ProviderRegistry;
use trio_server::{serve, AppState};
use trio_tools::ToolRegistry;
use trio_types::FileMap;
use trio_wire::{ArchitectRequest, DeveloperRequest, PromptRequest};

const SUPPORTED_PROVIDER_IDS: [&str; 6] =
    ["openai", "openrouter", "ollama", "groq", "mistral", "together"];

#[derive(Parser, Debug)]
#[command(name = "trio-engine")]
#[command(about = "Business analyst, system architect and developer agents over HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        config: Option<String>,
        /// Serve agent routes without an API token (local development only).
        #[arg(long, default_value_t = false)]
        allow_unauthenticated: bool,
    },
    /// Run one agent request and print the response body as JSON.
    Run {
        #[arg(long)]
        agent: AgentKind,
        prompt: String,
        /// Developer only: JSON object of path -> content, as `@file`, `-` or inline.
        #[arg(long)]
        folder: Option<String>,
        #[arg(long, default_value_t = false)]
        tdd: bool,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    /// Execute a single tool: `{"tool": "...", "args": {...}, "files": {...}}`.
    Tool {
        #[arg(long)]
        json: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            api_key,
            provider,
            model,
            config,
            allow_unauthenticated,
        } => {
            let overrides = build_cli_overrides(api_key, provider, model)?;
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(ProcessKind::Server, &logs_dir, 14)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("server jsonl logging initialized"),
                    ..ObservabilityEvent::default()
                },
            );
            info!("server logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let startup_id = Uuid::new_v4().to_string();
            log_startup_paths(&state_dir, &addr, &startup_id);

            let store = load_config(&state_dir, overrides, config.map(PathBuf::from)).await?;
            info!("effective config: {}", store.get_redacted_value());
            let app_config = store.get();
            let api_token =
                require_api_token(app_config.server.api_token.clone(), allow_unauthenticated)?;

            let (runner, providers) = build_runner(app_config);
            for agent in runner.agents().list() {
                info!(
                    agent = agent.kind.as_str(),
                    model = agent.model.as_deref().unwrap_or("<provider default>"),
                    max_iterations = agent.max_iterations,
                    call_timeout_secs = agent.call_timeout.as_secs(),
                    tools_enabled = agent.tools_enabled,
                    "agent ready"
                );
            }
            let provider_ids = providers
                .list()
                .into_iter()
                .map(|p| p.id)
                .collect::<Vec<_>>();
            info!("configured providers: {}", provider_ids.join(", "));

            let state = AppState::new(runner, providers, api_token);
            serve(addr, state).await?;
        }
        Command::Run {
            agent,
            prompt,
            folder,
            tdd,
            api_key,
            provider,
            model,
            config,
        } => {
            let overrides = build_cli_overrides(api_key, provider, None)?;
            let state_dir = resolve_state_dir(None);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, _) = init_process_logging(ProcessKind::Cli, &logs_dir, 14)?;
            let store = load_config(&state_dir, overrides, config.map(PathBuf::from)).await?;
            let (runner, _) = build_runner(store.get());

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let body = match agent {
                AgentKind::BusinessAnalyst => {
                    let resp = runner
                        .business_analyst(PromptRequest { prompt, model }, cancel)
                        .await?;
                    serde_json::to_value(resp)?
                }
                AgentKind::SystemArchitect => {
                    let request = ArchitectRequest {
                        prompt: Some(prompt),
                        model,
                        ..ArchitectRequest::default()
                    };
                    let resp = runner.system_architect(request, cancel).await?;
                    serde_json::to_value(resp)?
                }
                AgentKind::Developer => {
                    let current_folder = match folder.as_deref() {
                        Some(raw) => read_file_map(raw)?,
                        None => FileMap::new(),
                    };
                    let request = DeveloperRequest {
                        prompt,
                        current_folder,
                        tdd_enabled: tdd,
                        model,
                    };
                    let resp = runner.developer(request, cancel).await?;
                    serde_json::to_value(resp)?
                }
            };
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Command::Tool { json } => {
            let payload = read_json_input(&json)?;
            let tool = payload
                .get("tool")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if tool.is_empty() {
                anyhow::bail!("tool is required in input json");
            }
            let args = payload.get("args").cloned().unwrap_or_else(|| json!({}));
            let files: FileMap = match payload.get("files") {
                Some(value) => serde_json::from_value(value.clone())
                    .context("files must be an object of path -> content")?,
                None => FileMap::new(),
            };
            let result = ToolRegistry::new().execute(&tool, &args, &files)?;
            let output = json!({
                "output": result.output,
                "metadata": result.metadata,
                "state_files": result.state_files,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

async fn load_config(
    state_dir: &Path,
    overrides: Option<Value>,
    config_path: Option<PathBuf>,
) -> anyhow::Result<ConfigStore> {
    let path = config_path.unwrap_or_else(|| state_dir.join("config.json"));
    ConfigStore::new(path, overrides).await
}

fn build_runner(config: trio_core::AppConfig) -> (AgentRunner, ProviderRegistry) {
    let agents = AgentRegistry::from_settings(&config.agents);
    let providers = ProviderRegistry::new(config.into());
    let runner = AgentRunner::new(agents, providers.clone(), ToolRegistry::new());
    (runner, providers)
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert("default_provider".to_string(), Value::String(p.clone()));
    }

    // Key and model land on the selected provider, openai when none was given.
    let target_provider = provider.as_deref().unwrap_or("openai");

    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), Value::String(m));
        }

        let mut providers = serde_json::Map::new();
        providers.insert(target_provider.to_string(), Value::Object(provider_config));
        root.insert("providers".to_string(), Value::Object(providers));
    }

    Ok(Some(Value::Object(root)))
}

/// `serve` refuses to start without a token unless explicitly opted out.
fn require_api_token(
    configured: Option<String>,
    allow_unauthenticated: bool,
) -> anyhow::Result<Option<String>> {
    match configured.filter(|token| !token.trim().is_empty()) {
        Some(token) => {
            info!("api token required: {}", redact_text(&token));
            Ok(Some(token))
        }
        None if allow_unauthenticated => {
            tracing::warn!("no api token configured; agent routes are open to any caller");
            Ok(None)
        }
        None => anyhow::bail!(
            "API token not set: configure server.api_token, TRIO_API_TOKEN or API_KEY, \
             or pass --allow-unauthenticated for local use"
        ),
    }
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("TRIO_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|dir| dir.join("trio"))
        .unwrap_or_else(|| PathBuf::from(".trio"))
}

fn read_json_input(input: &str) -> anyhow::Result<Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}

fn read_file_map(input: &str) -> anyhow::Result<FileMap> {
    let value = read_json_input(input)?;
    serde_json::from_value(value).context("folder must be an object of path -> content")
}

fn log_startup_paths(state_dir: &Path, addr: &SocketAddr, startup_id: &str) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting trio-engine on http://{addr}");
    info!(
        "startup paths: startup_id={} exe={} cwd={} state_dir={} config_path={}",
        startup_id,
        exe.display(),
        cwd.display(),
        state_dir.display(),
        state_dir.join("config.json").display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_cli_overrides_targets_selected_provider() {
        let overrides = build_cli_overrides(
            Some("sk-test".to_string()),
            Some("openrouter".to_string()),
            Some("google/gemini-2.5-flash".to_string()),
        )
        .expect("overrides")
        .expect("some");

        assert_eq!(overrides["default_provider"], "openrouter");
        assert_eq!(
            overrides["providers"]["openrouter"]["api_key"],
            json!("sk-test")
        );
        assert_eq!(
            overrides["providers"]["openrouter"]["default_model"],
            json!("google/gemini-2.5-flash")
        );
    }

    #[test]
    fn build_cli_overrides_defaults_to_openai_without_provider() {
        let overrides = build_cli_overrides(Some("sk-test".to_string()), None, None)
            .expect("overrides")
            .expect("some");

        assert!(overrides.get("default_provider").is_none());
        assert_eq!(overrides["providers"]["openai"]["api_key"], json!("sk-test"));
        assert!(overrides["providers"]["openai"].get("default_model").is_none());
    }

    #[test]
    fn build_cli_overrides_is_none_without_flags() {
        assert!(build_cli_overrides(None, None, None)
            .expect("overrides")
            .is_none());
    }

    #[test]
    fn serve_refuses_to_start_without_token() {
        let err = require_api_token(None, false).unwrap_err();
        assert!(err.to_string().contains("API token not set"));
        assert!(require_api_token(Some("  ".to_string()), false).is_err());
    }

    #[test]
    fn serve_token_requirement_can_be_waived_or_satisfied() {
        assert_eq!(require_api_token(None, true).expect("opt-out"), None);
        assert_eq!(
            require_api_token(Some("tok".to_string()), false)
                .expect("token")
                .as_deref(),
            Some("tok")
        );
    }

    #[test]
    fn provider_validation_is_case_insensitive_and_rejects_unknown() {
        let provider =
            normalize_and_validate_provider(Some(" Groq ".to_string())).expect("provider");
        assert_eq!(provider.as_deref(), Some("groq"));

        let err = normalize_and_validate_provider(Some("anthropic".to_string())).unwrap_err();
        assert!(err.to_string().contains("unsupported provider `anthropic`"));
    }

    #[test]
    fn folder_can_be_read_from_file() {
        let dir = std::env::temp_dir().join(format!("trio-folder-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("folder.json");
        fs::write(&path, r#"{"test/a.test.ts": "it()"}"#).expect("write");

        let files = read_file_map(&format!("@{}", path.display())).expect("files");
        assert_eq!(files.get("test/a.test.ts").map(String::as_str), Some("it()"));

        assert!(read_file_map("[1, 2]").is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn runner_uses_echo_provider_without_configuration() {
        let (runner, providers) = build_runner(trio_core::AppConfig::default());
        assert_eq!(providers.list().len(), 1);
        let resp = runner
            .business_analyst(
                PromptRequest {
                    prompt: "notes app".to_string(),
                    model: None,
                },
                CancellationToken::new(),
            )
            .await
            .expect("response");
        assert_eq!(resp.response, "Echo: notes app");
    }
}
