use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_SUFFIX: &str = "jsonl";

/// Which binary mode is writing logs. Each mode gets its own file family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Server,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Server => "server",
            ProcessKind::Cli => "cli",
        }
    }

    /// `trio.<process>`; the appender adds `.<date>.jsonl`.
    fn file_prefix(self) -> String {
        format!("trio.{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: ProcessKind,
    pub logs_dir: PathBuf,
    pub file_prefix: String,
    pub retention_days: u64,
    pub pruned_files: usize,
    pub initialized_at: DateTime<Utc>,
}

/// A structured lifecycle record. Only `event` and `component` are required;
/// absent fields are logged as empty strings so every record has the same keys.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub request_id: Option<&'a str>,
    pub agent: Option<&'a str>,
    pub iteration: Option<u32>,
    pub provider_id: Option<&'a str>,
    pub model_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

/// Replaces a secret with its length and a short fingerprint.
pub fn redact_text(input: &str) -> String {
    let secret = input.trim();
    if secret.is_empty() {
        return String::new();
    }
    format!("[redacted len={} hash={}]", secret.len(), short_hash(secret))
}

pub fn short_hash(input: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

macro_rules! obs_record {
    ($macro:ident, $process:expr, $ev:expr) => {
        tracing::$macro!(
            target: "trio.obs",
            process = $process.as_str(),
            component = $ev.component,
            event = $ev.event,
            request_id = $ev.request_id.unwrap_or_default(),
            agent = $ev.agent.unwrap_or_default(),
            iteration = $ev.iteration.unwrap_or(0),
            provider_id = $ev.provider_id.unwrap_or_default(),
            model_id = $ev.model_id.unwrap_or_default(),
            status = $ev.status.unwrap_or_default(),
            error_code = $ev.error_code.unwrap_or_default(),
            detail = $ev.detail.unwrap_or_default(),
            "observability_event"
        )
    };
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    if level == Level::ERROR {
        obs_record!(error, process, event);
    } else if level == Level::WARN {
        obs_record!(warn, process, event);
    } else {
        obs_record!(info, process, event);
    }
}

/// Installs the global subscriber: `RUST_LOG` filter (default `info`), a
/// compact stderr layer and a daily JSONL file under `logs_dir`. Files of the
/// same process older than `retention_days` are removed first.
///
/// The returned guard must be held for the life of the process or buffered
/// file output is lost.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let pruned_files = prune_expired_logs(logs_dir, process, retention_days, Utc::now())?;

    let prefix = process.file_prefix();
    let appender = RollingBuilder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(&prefix)
        .filename_suffix(LOG_SUFFIX)
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true);
    let jsonl = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(jsonl)
        .try_init();

    Ok((
        guard,
        LoggingInitInfo {
            process,
            logs_dir: logs_dir.to_path_buf(),
            file_prefix: prefix,
            retention_days,
            pruned_files,
            initialized_at: Utc::now(),
        },
    ))
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

fn prune_expired_logs(
    logs_dir: &Path,
    process: ProcessKind,
    retention_days: u64,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let cutoff = (now - chrono::Duration::days(retention_days as i64)).date_naive();
    let prefix = process.file_prefix();
    let mut removed = 0;

    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(date) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| log_file_date(name, &prefix))
        else {
            continue;
        };
        if date < cutoff && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}

/// Date stamp of `<prefix>.YYYY-MM-DD.jsonl`, or `None` for any other name.
fn log_file_date(name: &str, prefix: &str) -> Option<NaiveDate> {
    let stamp = name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(LOG_SUFFIX)?
        .strip_suffix('.')?;
    NaiveDate::parse_from_str(stamp, "%Y-%m-%d").ok()
}
