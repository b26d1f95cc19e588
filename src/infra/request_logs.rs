//! Usage: Request log persistence (sqlite buffered writer, queries, and cleanup).

use crate::db;
use rusqlite::{params, ErrorCode};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod types;
pub use types::{RequestLogInsert, RequestLogSummary};

mod cleanup;
pub use cleanup::cleanup_expired;

mod queries;
pub use queries::{get_by_trace_id, list_recent};

const WRITE_BUFFER_CAPACITY: usize = 512;
const WRITE_BATCH_MAX: usize = 50;
const CLEANUP_MIN_INTERVAL: Duration = Duration::from_secs(10 * 60);
const INSERT_RETRY_MAX_ATTEMPTS: u32 = 8;
const INSERT_RETRY_BASE_DELAY_MS: u64 = 20;
const INSERT_RETRY_MAX_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbWriteErrorKind {
    Busy,
    Other,
}

#[derive(Debug)]
struct DbWriteError {
    kind: DbWriteErrorKind,
    message: String,
}

impl DbWriteError {
    fn other(message: String) -> Self {
        Self {
            kind: DbWriteErrorKind::Other,
            message,
        }
    }

    fn from_rusqlite(context: &'static str, err: rusqlite::Error) -> Self {
        let kind = classify_rusqlite_error(&err);
        Self {
            kind,
            message: format!("DB_ERROR: {context}: {err}"),
        }
    }

    fn is_retryable(&self) -> bool {
        self.kind == DbWriteErrorKind::Busy
    }
}

fn classify_rusqlite_error(err: &rusqlite::Error) -> DbWriteErrorKind {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => DbWriteErrorKind::Busy,
            _ => DbWriteErrorKind::Other,
        },
        _ => DbWriteErrorKind::Other,
    }
}

fn retry_delay(attempt_index: u32) -> Duration {
    let exp = attempt_index.min(20);
    let raw = INSERT_RETRY_BASE_DELAY_MS.saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX));
    Duration::from_millis(raw.min(INSERT_RETRY_MAX_DELAY_MS))
}

/// Spawns the background writer. Dropping every sender flushes the remaining
/// buffer and ends the task.
pub fn start_buffered_writer(
    db: db::Db,
    retention_days: u32,
) -> (mpsc::Sender<RequestLogInsert>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<RequestLogInsert>(WRITE_BUFFER_CAPACITY);
    let task = tokio::task::spawn_blocking(move || {
        writer_loop(db, retention_days, rx);
    });
    (tx, task)
}

pub fn spawn_write_through(db: db::Db, item: RequestLogInsert) {
    tokio::task::spawn_blocking(move || {
        let items = [item];
        if let Err(err) = insert_batch_with_retries(&db, &items) {
            tracing::error!(error = %err.message, "request log write-through insert failed");
        }
    });
}

fn writer_loop(db: db::Db, retention_days: u32, mut rx: mpsc::Receiver<RequestLogInsert>) {
    let mut buffer: Vec<RequestLogInsert> = Vec::with_capacity(WRITE_BATCH_MAX);
    let now = Instant::now();
    let mut last_cleanup = now.checked_sub(CLEANUP_MIN_INTERVAL).unwrap_or(now);
    let mut cleanup_due = last_cleanup == now;

    while let Some(item) = rx.blocking_recv() {
        buffer.push(item);

        while buffer.len() < WRITE_BATCH_MAX {
            match rx.try_recv() {
                Ok(next) => buffer.push(next),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }

        if let Err(err) = insert_batch_with_retries(&db, &buffer) {
            tracing::error!(error = %err.message, batch = buffer.len(), "request log batch insert failed");
        }
        buffer.clear();

        if cleanup_due || last_cleanup.elapsed() >= CLEANUP_MIN_INTERVAL {
            match cleanup_expired(&db, retention_days) {
                Ok(0) => {}
                Ok(deleted) => tracing::debug!(deleted, "request log retention cleanup"),
                Err(err) => tracing::warn!(error = %err, "request log cleanup failed"),
            }
            cleanup_due = false;
            last_cleanup = Instant::now();
        }
    }

    if !buffer.is_empty() {
        if let Err(err) = insert_batch_with_retries(&db, &buffer) {
            tracing::error!(error = %err.message, "request log final batch insert failed");
        }
    }
}

fn insert_batch_with_retries(db: &db::Db, items: &[RequestLogInsert]) -> Result<(), DbWriteError> {
    let mut attempt: u32 = 0;
    loop {
        match insert_batch_once(db, items) {
            Ok(()) => return Ok(()),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                if !err.is_retryable() || attempt >= INSERT_RETRY_MAX_ATTEMPTS {
                    return Err(err);
                }
                std::thread::sleep(retry_delay(attempt.saturating_sub(1)));
            }
        }
    }
}

fn insert_batch_once(db: &db::Db, items: &[RequestLogInsert]) -> Result<(), DbWriteError> {
    if items.is_empty() {
        return Ok(());
    }

    let mut conn = db.open_connection().map_err(DbWriteError::other)?;
    let tx = conn
        .transaction()
        .map_err(|e| DbWriteError::from_rusqlite("failed to start transaction", e))?;

    {
        let mut stmt = tx
            .prepare(
                r#"
INSERT INTO request_logs (
  trace_id,
  variant,
  requested_model,
  outcome,
  error_code,
  attempt_count,
  final_model,
  attempts_json,
  duration_ms,
  ttfb_ms,
  created_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
ON CONFLICT(trace_id) DO UPDATE SET
  outcome = excluded.outcome,
  error_code = excluded.error_code,
  attempt_count = excluded.attempt_count,
  final_model = excluded.final_model,
  attempts_json = excluded.attempts_json,
  duration_ms = excluded.duration_ms,
  ttfb_ms = excluded.ttfb_ms
"#,
            )
            .map_err(|e| DbWriteError::from_rusqlite("failed to prepare insert", e))?;

        for item in items {
            stmt.execute(params![
                item.trace_id,
                item.variant,
                item.requested_model,
                item.outcome,
                item.error_code,
                item.attempt_count,
                item.final_model,
                item.attempts_json,
                item.duration_ms,
                item.ttfb_ms,
                item.created_at
            ])
            .map_err(|e| DbWriteError::from_rusqlite("failed to insert request_log", e))?;
        }
    }

    tx.commit()
        .map_err(|e| DbWriteError::from_rusqlite("failed to commit transaction", e))?;

    Ok(())
}
