//! Usage: Request log DTOs and insertion payloads.

use serde::Serialize;

#[derive(Debug, Clone)]
pub struct RequestLogInsert {
    pub trace_id: String,
    pub variant: String,
    pub requested_model: Option<String>,
    pub outcome: String,
    pub error_code: Option<String>,
    pub attempt_count: i64,
    pub final_model: Option<String>,
    pub attempts_json: String,
    pub duration_ms: i64,
    pub ttfb_ms: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestLogSummary {
    pub id: i64,
    pub trace_id: String,
    pub variant: String,
    pub requested_model: Option<String>,
    pub outcome: String,
    pub error_code: Option<String>,
    pub attempt_count: i64,
    pub has_failover: bool,
    pub final_model: Option<String>,
    pub attempts: serde_json::Value,
    pub duration_ms: i64,
    pub ttfb_ms: Option<i64>,
    pub created_at: i64,
}
