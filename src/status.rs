//! Operator overview for `kbctl status`.
//!
//! Shows what is being served and whether the pipeline is keeping up: the
//! current index, queue depth and dead letters, the most recent sync jobs,
//! and the latest reindex job.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use kb_sync_core::models::{IndexPointer, ReindexJob, SyncJob};
use kb_sync_core::store::{JobStore, PointerStore};

use crate::app::App;
use crate::progress::format_number;
use crate::queue::{DeadLetter, QueueDepth};

const RECENT_SYNCS: i64 = 5;
const RECENT_DEAD_LETTERS: i64 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub pointer: Option<IndexPointer>,
    pub queue: QueueDepth,
    pub dead_letters: Vec<DeadLetter>,
    pub recent_syncs: Vec<SyncJob>,
    pub reindex: Option<ReindexJob>,
}

pub async fn collect_status(app: &App) -> Result<StatusReport> {
    Ok(StatusReport {
        pointer: app.store.current().await?,
        queue: app.queue.depth().await?,
        dead_letters: app.queue.dead_letters(RECENT_DEAD_LETTERS).await?,
        recent_syncs: app.store.recent_sync_jobs(RECENT_SYNCS).await?,
        reindex: app.store.latest_reindex_job().await?,
    })
}

/// Run the status command: collect and print a summary.
pub async fn run_status(app: &App) -> Result<()> {
    let report = collect_status(app).await?;
    let db_size = std::fs::metadata(&app.config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("kb-sync status");
    println!("==============");
    println!();
    println!("  Database:    {}", app.config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Backend:     {}", app.config.backend.provider);
    println!();
    match report.pointer {
        Some(ref p) => println!(
            "  Serving:     {} (v{}, since {})",
            p.index_id,
            p.version,
            format_ts_relative(p.updated_at)
        ),
        None => println!("  Serving:     (no index)"),
    }
    println!();
    println!(
        "  Queue:       {} pending, {} in flight, {} dead",
        format_number(report.queue.pending as u64),
        format_number(report.queue.inflight as u64),
        format_number(report.queue.dead as u64)
    );

    if !report.dead_letters.is_empty() {
        println!();
        println!("  Dead letters:");
        for d in &report.dead_letters {
            println!(
                "    #{:<6} {:<20} requested {}, {} deliver{}: {}",
                d.message_id,
                d.index_id,
                format_ts_relative(d.requested_at),
                d.deliveries,
                if d.deliveries == 1 { "y" } else { "ies" },
                d.last_error.as_deref().unwrap_or("-")
            );
        }
    }

    if !report.recent_syncs.is_empty() {
        println!();
        println!("  Recent syncs:");
        println!("    {:<28} {:<20} {:<12} STARTED", "JOB", "INDEX", "STATUS");
        for job in &report.recent_syncs {
            println!(
                "    {:<28} {:<20} {:<12} {}",
                job.job_id,
                job.index_id,
                job.status,
                format_ts_relative(job.started_at)
            );
        }
    }

    println!();
    match report.reindex {
        Some(ref job) => {
            println!("  Reindex:     {}", job.execution_id);
            println!("               {}", job.summary());
            println!(
                "               started {}, updated {}",
                format_ts_relative(job.started_at),
                format_ts_relative(job.updated_at)
            );
            if let Some(ref new) = job.new_index_id {
                println!("               new index: {}", new);
            }
        }
        None => println!("  Reindex:     never run"),
    }
    println!();

    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style, falling back to a date for old or future times.
fn format_ts_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn bytes_scale() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_times() {
        let now = Utc::now();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - Duration::minutes(1)), "1 min ago");
        assert_eq!(format_ts_relative(now - Duration::hours(3)), "3 hours ago");
        let old = now - Duration::days(90);
        assert_eq!(format_ts_relative(old), format_ts_iso(old));
    }
}
