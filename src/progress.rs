//! Reindex progress reporting.
//!
//! Reports what a reindex run is doing so operators can follow a long
//! rebuild: the current stage, items processed out of the total, and the
//! final summary. Progress goes to **stderr** so stdout stays parseable.

use std::io::Write;
use std::sync::Arc;

use kb_sync_core::models::ReindexStatus;

/// A single progress event for a reindex run.
#[derive(Clone, Debug, PartialEq)]
pub enum ReindexProgressEvent {
    /// The job entered a new stage.
    Stage {
        execution_id: String,
        status: ReindexStatus,
    },
    /// PROCESSING: n items handled out of total, errors so far.
    Items {
        execution_id: String,
        n: u64,
        total: u64,
        errors: u64,
    },
    /// The job reached COMPLETED or FAILED.
    Finished {
        execution_id: String,
        status: ReindexStatus,
        summary: String,
    },
}

/// Reports reindex progress. Implementations write to stderr (human or JSON).
pub trait ReindexProgressReporter: Send + Sync {
    fn report(&self, event: ReindexProgressEvent);
}

/// Human-friendly progress on stderr: "reindex 3f2a…  PROCESSING  1,234 / 5,000 items (2 errors)".
pub struct StderrProgress;

impl ReindexProgressReporter for StderrProgress {
    fn report(&self, event: ReindexProgressEvent) {
        let line = match &event {
            ReindexProgressEvent::Stage {
                execution_id,
                status,
            } => format!("reindex {}  {}\n", short_id(execution_id), status),
            ReindexProgressEvent::Items {
                execution_id,
                n,
                total,
                errors,
            } => format!(
                "reindex {}  PROCESSING  {} / {} items ({} error{})\n",
                short_id(execution_id),
                format_number(*n),
                format_number(*total),
                format_number(*errors),
                if *errors == 1 { "" } else { "s" }
            ),
            ReindexProgressEvent::Finished {
                execution_id,
                summary,
                ..
            } => format!("reindex {}  {}\n", short_id(execution_id), summary),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ReindexProgressReporter for JsonProgress {
    fn report(&self, event: ReindexProgressEvent) {
        let obj = match &event {
            ReindexProgressEvent::Stage {
                execution_id,
                status,
            } => serde_json::json!({
                "event": "stage",
                "execution_id": execution_id,
                "status": status,
            }),
            ReindexProgressEvent::Items {
                execution_id,
                n,
                total,
                errors,
            } => serde_json::json!({
                "event": "progress",
                "execution_id": execution_id,
                "n": n,
                "total": total,
                "errors": errors,
            }),
            ReindexProgressEvent::Finished {
                execution_id,
                status,
                summary,
            } => serde_json::json!({
                "event": "finished",
                "execution_id": execution_id,
                "status": status,
                "summary": summary,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ReindexProgressReporter for NoProgress {
    fn report(&self, _event: ReindexProgressEvent) {}
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn ReindexProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn short_id_truncates_long_ids_only() {
        assert_eq!(short_id("3f2a9c1e-0000-4000-8000-000000000000"), "3f2a9c1e");
        assert_eq!(short_id("abc"), "abc");
    }
}
