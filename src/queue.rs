//! Durable FIFO queue of [`SyncRequest`]s, stored in SQLite.
//!
//! # Delivery rules
//!
//! - Messages for one index are delivered in enqueue order, and at most one
//!   message per index is in flight at a time. A later message waits until
//!   every earlier message for its index is acked or dead-lettered.
//! - A delivered message holds a visibility lease. If the consumer neither
//!   acks nor reschedules it before the lease expires, it is delivered again.
//! - A message that has been delivered `max_deliveries` times is moved to
//!   the dead-letter state instead of being delivered again.
//!
//! # Deduplication
//!
//! Within `dedup_window_secs` of the earlier enqueue:
//!
//! - a byte-identical body (same SHA-256) is dropped, unless the earlier
//!   message was dead-lettered;
//! - a request for an index that already has a message waiting for
//!   delivery (not in flight) is folded into it, advancing its `requested_at` to
//!   the later of the two timestamps.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use kb_sync_core::models::SyncRequest;

use crate::config::QueueConfig;
use crate::db::{from_micros, to_micros};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    pub message_id: i64,
    /// True when the request was absorbed by an existing message.
    pub deduplicated: bool,
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: i64,
    pub request: SyncRequest,
    /// Including this one.
    pub deliveries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Scheduled,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: i64,
    pub inflight: i64,
    pub dead: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub message_id: i64,
    pub index_id: String,
    pub requested_at: DateTime<Utc>,
    pub deliveries: u32,
    pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct RequestQueue {
    pool: SqlitePool,
    settings: QueueConfig,
}

const MAX_BUSY_RETRIES: u32 = 8;

/// SQLITE_BUSY or SQLITE_LOCKED, including their extended codes.
fn is_busy(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db)) => db
            .code()
            .and_then(|c| c.parse::<i32>().ok())
            .map(|c| matches!(c & 0xff, 5 | 6))
            .unwrap_or(false),
        _ => false,
    }
}

/// SHA-256 over the canonical JSON body.
pub fn dedup_hash(request: &SyncRequest) -> Result<String> {
    let body = serde_json::to_string(request)?;
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

impl RequestQueue {
    pub fn new(pool: SqlitePool, settings: QueueConfig) -> Self {
        Self { pool, settings }
    }

    fn window_start(&self, now: DateTime<Utc>) -> i64 {
        to_micros(now - ChronoDuration::seconds(self.settings.dedup_window_secs as i64))
    }

    pub async fn enqueue(&self, request: &SyncRequest) -> Result<EnqueueOutcome> {
        let hash = dedup_hash(request)?;
        let mut attempt = 0u32;
        loop {
            match self.try_enqueue(request, &hash).await {
                // A deferred transaction that read before another writer
                // committed cannot upgrade; start over with a fresh snapshot.
                Err(e) if attempt < MAX_BUSY_RETRIES && is_busy(&e) => {
                    attempt += 1;
                    tracing::debug!(
                        attempt,
                        index_id = %request.index_id,
                        "queue busy, retrying enqueue"
                    );
                    tokio::time::sleep(Duration::from_millis(5 * attempt as u64)).await;
                }
                other => return other,
            }
        }
    }

    async fn try_enqueue(&self, request: &SyncRequest, hash: &str) -> Result<EnqueueOutcome> {
        let now = Utc::now();
        let window_start = self.window_start(now);
        let mut tx = self.pool.begin().await?;

        let duplicate: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM sync_requests WHERE dedup_hash = ? AND enqueued_at >= ? \
             AND state != 'dead' ORDER BY id DESC LIMIT 1",
        )
        .bind(hash)
        .bind(window_start)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(message_id) = duplicate {
            tx.commit().await?;
            tracing::debug!(
                message_id,
                index_id = %request.index_id,
                "duplicate sync request dropped"
            );
            return Ok(EnqueueOutcome {
                message_id,
                deduplicated: true,
            });
        }

        let pending: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM sync_requests \
             WHERE index_id = ? AND state = 'pending' AND enqueued_at >= ? \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(&request.index_id)
        .bind(window_start)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(message_id) = pending {
            sqlx::query(
                "UPDATE sync_requests SET requested_at = MAX(requested_at, ?) WHERE id = ?",
            )
            .bind(to_micros(request.requested_at))
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            tracing::debug!(
                message_id,
                index_id = %request.index_id,
                "sync request collapsed into pending message"
            );
            return Ok(EnqueueOutcome {
                message_id,
                deduplicated: true,
            });
        }

        let message_id = sqlx::query(
            r#"
            INSERT INTO sync_requests
                (index_id, requested_at, dedup_hash, state, deliveries, visible_at, enqueued_at)
            VALUES (?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(&request.index_id)
        .bind(to_micros(request.requested_at))
        .bind(hash)
        .bind(to_micros(now))
        .bind(to_micros(now))
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;

        tracing::info!(message_id, index_id = %request.index_id, "sync request enqueued");
        Ok(EnqueueOutcome {
            message_id,
            deduplicated: false,
        })
    }

    /// Take the next deliverable message, if any.
    pub async fn receive(&self) -> Result<Option<Delivery>> {
        loop {
            let now = to_micros(Utc::now());
            // Head of each index's line: the oldest message not yet finished.
            let row = sqlx::query(
                r#"
                SELECT r.id, r.index_id, r.requested_at, r.deliveries
                FROM sync_requests r
                WHERE r.state IN ('pending', 'inflight')
                  AND r.visible_at <= ?
                  AND NOT EXISTS (
                      SELECT 1 FROM sync_requests o
                      WHERE o.index_id = r.index_id
                        AND o.state IN ('pending', 'inflight')
                        AND o.id < r.id
                  )
                ORDER BY r.id ASC
                LIMIT 1
                "#,
            )
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let message_id: i64 = row.get("id");
            let deliveries = row.get::<i64, _>("deliveries") as u32;

            if deliveries >= self.settings.max_deliveries {
                // Lease expired on the last permitted delivery.
                self.dead_letter(
                    message_id,
                    &format!("lease expired after {} deliveries", deliveries),
                )
                .await?;
                continue;
            }

            let lease_until =
                now + (self.settings.visibility_timeout_secs as i64).saturating_mul(1_000_000);
            let claimed = sqlx::query(
                "UPDATE sync_requests SET state = 'inflight', deliveries = deliveries + 1, \
                 visible_at = ? WHERE id = ? AND state IN ('pending', 'inflight') AND visible_at <= ?",
            )
            .bind(lease_until)
            .bind(message_id)
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if claimed == 0 {
                // Another consumer took it.
                continue;
            }

            return Ok(Some(Delivery {
                message_id,
                request: SyncRequest::new(
                    row.get::<String, _>("index_id"),
                    from_micros(row.get("requested_at")),
                ),
                deliveries: deliveries + 1,
            }));
        }
    }

    pub async fn ack(&self, message_id: i64) -> Result<()> {
        sqlx::query("UPDATE sync_requests SET state = 'done', last_error = NULL WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release an in-flight message for redelivery after
    /// `redeliver_delay_secs`, or dead-letter it when it has used up its
    /// deliveries.
    pub async fn retry_later(&self, message_id: i64, reason: &str) -> Result<RetryDisposition> {
        let deliveries: Option<i64> =
            sqlx::query_scalar("SELECT deliveries FROM sync_requests WHERE id = ?")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;
        let deliveries = deliveries.unwrap_or_default() as u32;

        if deliveries >= self.settings.max_deliveries {
            self.dead_letter(
                message_id,
                &format!("{} (gave up after {} deliveries)", reason, deliveries),
            )
            .await?;
            return Ok(RetryDisposition::DeadLettered);
        }

        let visible_at =
            Utc::now() + ChronoDuration::seconds(self.settings.redeliver_delay_secs as i64);
        sqlx::query(
            "UPDATE sync_requests SET state = 'pending', visible_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(to_micros(visible_at))
        .bind(reason)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(RetryDisposition::Scheduled)
    }

    pub async fn dead_letter(&self, message_id: i64, reason: &str) -> Result<()> {
        sqlx::query("UPDATE sync_requests SET state = 'dead', last_error = ? WHERE id = ?")
            .bind(reason)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        tracing::warn!(message_id, reason, "sync request dead-lettered");
        Ok(())
    }

    pub async fn depth(&self) -> Result<QueueDepth> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM sync_requests GROUP BY state")
            .fetch_all(&self.pool)
            .await?;
        let mut depth = QueueDepth::default();
        for row in rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            match state.as_str() {
                "pending" => depth.pending = n,
                "inflight" => depth.inflight = n,
                "dead" => depth.dead = n,
                _ => {}
            }
        }
        Ok(depth)
    }

    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT id, index_id, requested_at, deliveries, last_error FROM sync_requests \
             WHERE state = 'dead' ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| DeadLetter {
                message_id: row.get("id"),
                index_id: row.get("index_id"),
                requested_at: from_micros(row.get("requested_at")),
                deliveries: row.get::<i64, _>("deliveries") as u32,
                last_error: row.get("last_error"),
            })
            .collect())
    }
}
