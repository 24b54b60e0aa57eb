// taskloom Observability
// Log bootstrap, retention pruning and structured lifecycle events

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Target every lifecycle event is emitted on, so a filter like
/// `taskloom.obs=info` isolates them from ordinary diagnostics.
pub const OBS_TARGET: &str = "taskloom.obs";

/// Directory name, relative to the data dir, holding the JSONL logs.
pub const LOGS_DIR_NAME: &str = "logs";

/// Overrides the configured filter when set.
pub const FILTER_ENV: &str = "TASKLOOM_LOG";

const LOG_SUFFIX: &str = "jsonl";

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LogSettings {
    /// Daily files older than this many days are deleted at startup.
    /// Zero keeps every file.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// `EnvFilter` directive used when `TASKLOOM_LOG` is unset
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default = "default_console")]
    pub console: bool,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

fn default_retention_days() -> u64 {
    14
}

fn default_filter() -> String {
    "info".to_string()
}

fn default_console() -> bool {
    true
}

fn default_file_prefix() -> String {
    "taskloom".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            filter: default_filter(),
            console: default_console(),
            file_prefix: default_file_prefix(),
        }
    }
}

impl LogSettings {
    /// Name of the file the appender writes for `date`.
    pub fn file_name_for(&self, date: NaiveDate) -> String {
        format!("{}.{}.{}", self.file_prefix, date.format("%Y-%m-%d"), LOG_SUFFIX)
    }
}

// ============================================================================
// Bootstrap
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingInitInfo {
    pub logs_dir: PathBuf,
    pub file_prefix: String,
    pub retention_days: u64,
    /// False when another subscriber was already installed globally; the
    /// file appender is still created but receives nothing.
    pub installed: bool,
    pub pruned: Vec<PathBuf>,
    pub initialized_at: DateTime<Utc>,
}

/// Keeps the non-blocking writer alive. Dropping it flushes and closes the
/// current log file.
pub struct LoggingHandle {
    _guard: WorkerGuard,
    pub info: LoggingInitInfo,
}

impl std::fmt::Debug for LoggingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingHandle")
            .field("info", &self.info)
            .finish()
    }
}

/// Prunes expired files, then installs the global subscriber: a daily JSONL
/// file under `logs_dir` plus an optional compact console layer.
pub fn init_logging(settings: &LogSettings, logs_dir: &Path) -> anyhow::Result<LoggingHandle> {
    fs::create_dir_all(logs_dir)?;
    let today = Utc::now().date_naive();
    let pruned = prune_expired_logs(logs_dir, &settings.file_prefix, settings.retention_days, today)?;

    let appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&settings.file_prefix)
        .filename_suffix(LOG_SUFFIX)
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);
    let console_layer = settings
        .console
        .then(|| tracing_subscriber::fmt::layer().compact().with_target(true));

    let filter = EnvFilter::try_from_env(FILTER_ENV)
        .or_else(|_| EnvFilter::try_new(&settings.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    Ok(LoggingHandle {
        _guard: guard,
        info: LoggingInitInfo {
            logs_dir: logs_dir.to_path_buf(),
            file_prefix: settings.file_prefix.clone(),
            retention_days: settings.retention_days,
            installed,
            pruned,
            initialized_at: Utc::now(),
        },
    })
}

/// Deletes `<prefix>.YYYY-MM-DD.jsonl` files dated more than
/// `retention_days` before `today`. Other files are left alone.
pub fn prune_expired_logs(
    logs_dir: &Path,
    prefix: &str,
    retention_days: u64,
    today: NaiveDate,
) -> std::io::Result<Vec<PathBuf>> {
    let mut pruned = Vec::new();
    if retention_days == 0 {
        return Ok(pruned);
    }
    let Some(cutoff) = today.checked_sub_days(chrono::Days::new(retention_days)) else {
        return Ok(pruned);
    };

    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let expired = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|name| log_file_date(name, prefix))
            .is_some_and(|date| date < cutoff);
        if !expired || !path.is_file() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => pruned.push(path),
            Err(e) => tracing::warn!("Failed to prune log {}: {}", path.display(), e),
        }
    }
    pruned.sort();
    Ok(pruned)
}

fn log_file_date(name: &str, prefix: &str) -> Option<NaiveDate> {
    let date = name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(LOG_SUFFIX)?
        .strip_suffix('.')?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

// ============================================================================
// Events
// ============================================================================

/// A structured lifecycle record. Every field except `event` and `component`
/// is optional so call sites only fill in what they know.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub task_id: Option<&'a str>,
    pub project_id: Option<&'a str>,
    pub pipeline_id: Option<&'a str>,
    pub step_id: Option<&'a str>,
    pub agent_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> ObservabilityEvent<'a> {
    pub fn new(component: &'a str, event: &'a str) -> Self {
        Self {
            event,
            component,
            ..Self::default()
        }
    }

    pub fn task(mut self, task_id: &'a str) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn project(mut self, project_id: &'a str) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn pipeline(mut self, pipeline_id: &'a str) -> Self {
        self.pipeline_id = Some(pipeline_id);
        self
    }

    pub fn step(mut self, step_id: &'a str) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn agent(mut self, agent_id: &'a str) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn status(mut self, status: &'a str) -> Self {
        self.status = Some(status);
        self
    }

    pub fn error_code(mut self, code: &'a str) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn detail(mut self, detail: &'a str) -> Self {
        self.detail = Some(detail);
        self
    }
}

macro_rules! obs_event {
    ($macro:ident, $event:expr) => {
        tracing::$macro!(
            target: OBS_TARGET,
            component = $event.component,
            event = $event.event,
            task_id = $event.task_id.unwrap_or(""),
            project_id = $event.project_id.unwrap_or(""),
            pipeline_id = $event.pipeline_id.unwrap_or(""),
            step_id = $event.step_id.unwrap_or(""),
            agent_id = $event.agent_id.unwrap_or(""),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "lifecycle"
        )
    };
}

pub fn emit_event(level: Level, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => obs_event!(error, event),
        Level::WARN => obs_event!(warn, event),
        Level::DEBUG | Level::TRACE => obs_event!(debug, event),
        _ => obs_event!(info, event),
    }
}

// ============================================================================
// Redaction
// ============================================================================

/// Replaces free text (worker instructions, agent output) with its size and
/// a fingerprint so logs never carry payload content.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted {} chars fp={}]",
        trimmed.chars().count(),
        fingerprint(trimmed)
    )
}

/// FNV-1a over the UTF-8 bytes. Stable across runs and toolchains, so the
/// same payload can be matched between log files.
pub fn fingerprint(input: &str) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    let hash = input
        .bytes()
        .fold(OFFSET, |acc, b| (acc ^ u64::from(b)).wrapping_mul(PRIME));
    format!("{:016x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn redact_text_masks_content() {
        let raw = "deploy with token abc-123";
        let redacted = redact_text(raw);
        assert!(redacted.starts_with("[redacted 25 chars fp="));
        assert!(!redacted.contains("abc-123"));
        assert_eq!(redact_text("   "), "");
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(fingerprint(""), "cbf29ce484222325");
        assert_eq!(fingerprint("a"), "af63dc4c8601ec8c");
        assert_ne!(fingerprint("plan"), fingerprint("plan "));
    }

    #[test]
    fn settings_default_from_empty_json() {
        let settings: LogSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, LogSettings::default());
        assert_eq!(
            settings.file_name_for(day("2026-03-09")),
            "taskloom.2026-03-09.jsonl"
        );
    }

    #[test]
    fn log_file_date_requires_exact_shape() {
        assert_eq!(
            log_file_date("taskloom.2026-01-02.jsonl", "taskloom"),
            Some(day("2026-01-02"))
        );
        assert_eq!(log_file_date("taskloom.2026-01-02.log", "taskloom"), None);
        assert_eq!(log_file_date("taskloomx.2026-01-02.jsonl", "taskloom"), None);
        assert_eq!(log_file_date("taskloom.latest.jsonl", "taskloom"), None);
    }

    #[test]
    fn prune_removes_only_expired_files_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let today = day("2026-05-20");
        let settings = LogSettings::default();
        let expired = dir.path().join(settings.file_name_for(day("2026-05-12")));
        let boundary = dir.path().join(settings.file_name_for(day("2026-05-13")));
        let current = dir.path().join(settings.file_name_for(today));
        let foreign = dir.path().join("other.2001-01-01.jsonl");
        for path in [&expired, &boundary, &current, &foreign] {
            fs::write(path, "{}\n").unwrap();
        }

        let pruned = prune_expired_logs(dir.path(), "taskloom", 7, today).unwrap();

        assert_eq!(pruned, vec![expired.clone()]);
        assert!(!expired.exists());
        assert!(boundary.exists());
        assert!(current.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn zero_retention_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("taskloom.2001-01-01.jsonl");
        fs::write(&old, "{}\n").unwrap();

        let pruned = prune_expired_logs(dir.path(), "taskloom", 0, day("2026-05-20")).unwrap();

        assert!(pruned.is_empty());
        assert!(old.exists());
    }

    #[test]
    fn event_builder_fills_optional_fields() {
        let event = ObservabilityEvent::new("queue", "task.dispatched")
            .task("t-1")
            .agent("worker")
            .status("processing");
        assert_eq!(event.task_id, Some("t-1"));
        assert_eq!(event.agent_id, Some("worker"));
        assert_eq!(event.status, Some("processing"));
        assert!(event.pipeline_id.is_none());
    }
}
