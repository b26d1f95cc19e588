//! Usage: Request log queries and attempts decoding.

use crate::db;
use rusqlite::{params, OptionalExtension};

use super::RequestLogSummary;

const REQUEST_LOG_SUMMARY_FIELDS: &str = "
  id,
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
";

pub(super) fn parse_attempts(attempts_json: &str) -> serde_json::Value {
    serde_json::from_str(attempts_json).unwrap_or_else(|_| serde_json::Value::Array(Vec::new()))
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> Result<RequestLogSummary, rusqlite::Error> {
    let attempts_json: String = row.get("attempts_json")?;
    let attempt_count: i64 = row.get("attempt_count")?;

    Ok(RequestLogSummary {
        id: row.get("id")?,
        trace_id: row.get("trace_id")?,
        variant: row.get("variant")?,
        requested_model: row.get("requested_model")?,
        outcome: row.get("outcome")?,
        error_code: row.get("error_code")?,
        attempt_count,
        has_failover: attempt_count > 1,
        final_model: row.get("final_model")?,
        attempts: parse_attempts(&attempts_json),
        duration_ms: row.get("duration_ms")?,
        ttfb_ms: row.get("ttfb_ms")?,
        created_at: row.get("created_at")?,
    })
}

pub fn list_recent(db: &db::Db, limit: usize) -> Result<Vec<RequestLogSummary>, String> {
    let conn = db.open_connection()?;

    let sql = format!(
        "SELECT{}FROM request_logs ORDER BY created_at DESC, id DESC LIMIT ?1",
        REQUEST_LOG_SUMMARY_FIELDS
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| format!("DB_ERROR: failed to prepare query: {e}"))?;

    let rows = stmt
        .query_map(params![limit as i64], row_to_summary)
        .map_err(|e| format!("DB_ERROR: failed to list request_logs: {e}"))?;

    let mut items = Vec::new();
    for row in rows {
        items.push(row.map_err(|e| format!("DB_ERROR: failed to read request_log row: {e}"))?);
    }
    Ok(items)
}

pub fn get_by_trace_id(db: &db::Db, trace_id: &str) -> Result<Option<RequestLogSummary>, String> {
    if trace_id.trim().is_empty() {
        return Err("SEC_INVALID_INPUT: trace_id is required".to_string());
    }

    let conn = db.open_connection()?;
    let sql = format!(
        "SELECT{}FROM request_logs WHERE trace_id = ?1",
        REQUEST_LOG_SUMMARY_FIELDS
    );
    conn.query_row(&sql, params![trace_id], row_to_summary)
        .optional()
        .map_err(|e| format!("DB_ERROR: failed to query request_log: {e}"))
}
