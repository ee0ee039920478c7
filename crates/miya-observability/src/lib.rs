use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const OBS_TARGET: &str = "miya.obs";

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Plugin,
    Daemon,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Plugin => "plugin",
            ProcessKind::Daemon => "daemon",
        }
    }

    /// `miya.<process>`, the stem of every log file this process writes.
    pub fn file_prefix(self) -> String {
        format!("miya.{}", self.as_str())
    }
}

/// What `init_process_logging` set up, for the host to report.
#[derive(Debug, Clone, Serialize)]
pub struct LogSession {
    pub process: ProcessKind,
    pub logs_dir: PathBuf,
    pub file_prefix: String,
    pub retention_days: u64,
    pub pruned_files: usize,
    pub started_at: DateTime<Utc>,
}

/// A lifecycle milestone of a background task, logged under [`OBS_TARGET`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub task_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub parent_session_id: Option<&'a str>,
    pub agent: Option<&'a str>,
    pub model: Option<&'a str>,
    pub status: Option<&'a str>,
    pub detail: Option<&'a str>,
}

/// Replaces prompt text with its length and a non-cryptographic fingerprint,
/// enough to correlate two log lines about the same prompt.
pub fn redact_text(input: &str) -> String {
    use std::hash::{Hash, Hasher};

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    trimmed.hash(&mut hasher);
    format!("[redacted len={} hash={:016x}]", trimmed.len(), hasher.finish())
}

pub fn emit_event(level: Level, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "miya.obs",
            component = event.component,
            event = event.event,
            task_id = event.task_id.unwrap_or(""),
            session_id = event.session_id.unwrap_or(""),
            parent_session_id = event.parent_session_id.unwrap_or(""),
            agent = event.agent.unwrap_or(""),
            model = event.model.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        Level::WARN => tracing::warn!(
            target: "miya.obs",
            component = event.component,
            event = event.event,
            task_id = event.task_id.unwrap_or(""),
            session_id = event.session_id.unwrap_or(""),
            parent_session_id = event.parent_session_id.unwrap_or(""),
            agent = event.agent.unwrap_or(""),
            model = event.model.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        Level::DEBUG | Level::TRACE => tracing::debug!(
            target: "miya.obs",
            component = event.component,
            event = event.event,
            task_id = event.task_id.unwrap_or(""),
            session_id = event.session_id.unwrap_or(""),
            agent = event.agent.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        _ => tracing::info!(
            target: "miya.obs",
            component = event.component,
            event = event.event,
            task_id = event.task_id.unwrap_or(""),
            session_id = event.session_id.unwrap_or(""),
            parent_session_id = event.parent_session_id.unwrap_or(""),
            agent = event.agent.unwrap_or(""),
            model = event.model.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
    }
}

/// Installs the global subscriber: env filter (default `info`), compact
/// console output and a daily `miya.<process>.YYYY-MM-DD.jsonl` file under
/// `logs_dir`. Files of the same process older than `retention_days` are
/// pruned first. Keep the guard alive while file logging is needed.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LogSession)> {
    fs::create_dir_all(logs_dir)?;
    let file_prefix = process.file_prefix();
    let cutoff = Utc::now().date_naive() - chrono::Duration::days(retention_days as i64);
    let pruned_files = prune_logs_before(logs_dir, &file_prefix, cutoff)?;

    let appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(file_prefix.clone())
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .is_ok();
    if !installed {
        tracing::debug!("global subscriber already set; keeping it");
    }

    Ok((
        guard,
        LogSession {
            process,
            logs_dir: logs_dir.to_path_buf(),
            file_prefix,
            retention_days,
            pruned_files,
            started_at: Utc::now(),
        },
    ))
}

/// Date stamp of `<prefix>.YYYY-MM-DD.jsonl`, or `None` for any other name.
fn log_file_date(file_name: &str, prefix: &str) -> Option<NaiveDate> {
    let stamp = file_name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(stamp, "%Y-%m-%d").ok()
}

fn prune_logs_before(logs_dir: &Path, prefix: &str, cutoff: NaiveDate) -> anyhow::Result<usize> {
    let mut pruned = 0;
    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let expired = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| log_file_date(name, prefix))
            .is_some_and(|date| date < cutoff);
        if expired && path.is_file() && fs::remove_file(&path).is_ok() {
            pruned += 1;
        }
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        let raw = "search the repo for the api token";
        let redacted = redact_text(raw);
        assert!(redacted.starts_with("[redacted len=33 hash="));
        assert!(!redacted.contains("api token"));
        assert_eq!(redacted, redact_text("  search the repo for the api token "));
        assert_eq!(redact_text("   "), "");
    }

    #[test]
    fn log_file_date_only_matches_own_process() {
        assert_eq!(
            log_file_date("miya.plugin.2024-03-01.jsonl", "miya.plugin"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert_eq!(log_file_date("miya.daemon.2024-03-01.jsonl", "miya.plugin"), None);
        assert_eq!(log_file_date("miya.plugin.latest.jsonl", "miya.plugin"), None);
        assert_eq!(log_file_date("miya.plugin.2024-03-01.log", "miya.plugin"), None);
    }

    #[test]
    fn prune_removes_only_expired_files_for_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = dir.path().join("miya.plugin.2001-01-01.jsonl");
        let fresh = dir
            .path()
            .join(format!("miya.plugin.{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let other_process = dir.path().join("miya.daemon.2001-01-01.jsonl");
        let unrelated = dir.path().join("notes.txt");
        for path in [&old, &fresh, &other_process, &unrelated] {
            fs::write(path, "{}").expect("write");
        }

        let cutoff = Utc::now().date_naive() - chrono::Duration::days(7);
        let pruned = prune_logs_before(dir.path(), "miya.plugin", cutoff).expect("prune");

        assert_eq!(pruned, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other_process.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn init_creates_daily_jsonl_file_and_prunes_old_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs_dir = dir.path().join("logs");
        fs::create_dir_all(&logs_dir).expect("mkdir");
        fs::write(logs_dir.join("miya.plugin.2001-01-01.jsonl"), "{}").expect("write");

        let (guard, session) =
            init_process_logging(ProcessKind::Plugin, &logs_dir, 14).expect("init");
        emit_event(
            Level::INFO,
            ObservabilityEvent {
                event: "task.launched",
                component: "test",
                task_id: Some("bg_1"),
                ..Default::default()
            },
        );
        drop(guard);

        assert_eq!(session.file_prefix, "miya.plugin");
        assert_eq!(session.pruned_files, 1);
        let names: Vec<String> = fs::read_dir(&logs_dir)
            .expect("read dir")
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        assert!(
            names
                .iter()
                .any(|name| log_file_date(name, "miya.plugin").is_some()),
            "no daily log file in {names:?}"
        );
        assert!(!names.contains(&"miya.plugin.2001-01-01.jsonl".to_string()));
    }
}
