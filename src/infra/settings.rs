//! Usage: Gateway settings file (schema + read/sanitize/write helpers).

use crate::shared::fs::{read_optional_file, write_file_atomic};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_GATEWAY_PORT: u16 = 37123;
pub const DEFAULT_SETTINGS_FILE: &str = "gateway-settings.json";
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";
const DEFAULT_UPSTREAM_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODELS: [&str; 3] = ["gemini-2.5-pro", "gemini-2.5-flash", "gemini-2.0-flash"];
const DEFAULT_RECITATION_FALLBACK_MODELS: [&str; 2] = ["gemini-2.5-flash", "gemini-2.5-flash-lite"];
const DEFAULT_SAFETY_THRESHOLD: &str = "BLOCK_NONE";
const DEFAULT_MAX_REQUEST_BODY_MB: u32 = 20;
const DEFAULT_LOG_RETENTION_DAYS: u32 = 30;
const DEFAULT_REQUEST_LOG_DB_PATH: &str = "gen-gateway.db";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_UPSTREAM_FIRST_BYTE_TIMEOUT_SECONDS: u32 = 60;
const DEFAULT_UPSTREAM_STREAM_IDLE_TIMEOUT_SECONDS: u32 = 120;
const MAX_UPSTREAM_FIRST_BYTE_TIMEOUT_SECONDS: u32 = 60 * 60;
const MAX_UPSTREAM_STREAM_IDLE_TIMEOUT_SECONDS: u32 = 60 * 60;
const MAX_REQUEST_BODY_MB: u32 = 64;
const SAFETY_THRESHOLDS: [&str; 5] = [
    "BLOCK_NONE",
    "BLOCK_ONLY_HIGH",
    "BLOCK_MEDIUM_AND_ABOVE",
    "BLOCK_LOW_AND_ABOVE",
    "OFF",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewaySettings {
    pub schema_version: u32,
    pub listen_host: String,
    pub port: u16,
    pub upstream_base_url: String,
    // Empty = fall back to the GEMINI_API_KEY environment variable.
    pub api_key: String,
    // Normal cascade, highest-capability first.
    pub default_models: Vec<String>,
    // De-escalation chain used only after a recitation finish.
    pub recitation_fallback_models: Vec<String>,
    pub safety_threshold: String,
    pub include_thoughts: bool,
    // 0 = disabled.
    pub upstream_first_byte_timeout_seconds: u32,
    pub upstream_stream_idle_timeout_seconds: u32,
    pub max_request_body_mb: u32,
    pub request_log_enabled: bool,
    pub request_log_db_path: String,
    pub log_retention_days: u32,
    // Empty = stderr only.
    pub log_dir: String,
    pub log_filter: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            port: DEFAULT_GATEWAY_PORT,
            upstream_base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            api_key: String::new(),
            default_models: DEFAULT_MODELS.iter().map(|m| m.to_string()).collect(),
            recitation_fallback_models: DEFAULT_RECITATION_FALLBACK_MODELS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            safety_threshold: DEFAULT_SAFETY_THRESHOLD.to_string(),
            include_thoughts: true,
            upstream_first_byte_timeout_seconds: DEFAULT_UPSTREAM_FIRST_BYTE_TIMEOUT_SECONDS,
            upstream_stream_idle_timeout_seconds: DEFAULT_UPSTREAM_STREAM_IDLE_TIMEOUT_SECONDS,
            max_request_body_mb: DEFAULT_MAX_REQUEST_BODY_MB,
            request_log_enabled: true,
            request_log_db_path: DEFAULT_REQUEST_LOG_DB_PATH.to_string(),
            log_retention_days: DEFAULT_LOG_RETENTION_DAYS,
            log_dir: String::new(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl GatewaySettings {
    pub fn max_request_body_bytes(&self) -> usize {
        (self.max_request_body_mb.max(1) as usize).saturating_mul(1024 * 1024)
    }

    /// Request override first, then the configured key. `None` means the request
    /// must be rejected before streaming.
    pub fn resolve_api_key(&self, request_override: Option<&str>) -> Option<String> {
        request_override
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| Some(self.api_key.trim()).filter(|v| !v.is_empty()))
            .map(str::to_string)
    }
}

fn clean_model_list(models: &mut Vec<String>) -> bool {
    let before = models.clone();
    models.retain(|m| !m.trim().is_empty());
    for model in models.iter_mut() {
        let trimmed = model.trim();
        if trimmed.len() != model.len() {
            *model = trimmed.to_string();
        }
    }
    *models != before
}

fn sanitize_model_lists(settings: &mut GatewaySettings) -> bool {
    let mut changed = false;

    changed |= clean_model_list(&mut settings.default_models);
    if settings.default_models.is_empty() {
        settings.default_models = DEFAULT_MODELS.iter().map(|m| m.to_string()).collect();
        changed = true;
    }

    // An empty fallback list is legal: the first recitation is then terminal.
    changed |= clean_model_list(&mut settings.recitation_fallback_models);

    changed
}

fn sanitize_upstream_timeouts(settings: &mut GatewaySettings) -> bool {
    let mut changed = false;

    if settings.upstream_first_byte_timeout_seconds > MAX_UPSTREAM_FIRST_BYTE_TIMEOUT_SECONDS {
        settings.upstream_first_byte_timeout_seconds = MAX_UPSTREAM_FIRST_BYTE_TIMEOUT_SECONDS;
        changed = true;
    }
    if settings.upstream_stream_idle_timeout_seconds > MAX_UPSTREAM_STREAM_IDLE_TIMEOUT_SECONDS {
        settings.upstream_stream_idle_timeout_seconds = MAX_UPSTREAM_STREAM_IDLE_TIMEOUT_SECONDS;
        changed = true;
    }

    changed
}

fn sanitize_limits(settings: &mut GatewaySettings) -> bool {
    let mut changed = false;

    if settings.max_request_body_mb == 0 {
        settings.max_request_body_mb = DEFAULT_MAX_REQUEST_BODY_MB;
        changed = true;
    }
    if settings.max_request_body_mb > MAX_REQUEST_BODY_MB {
        settings.max_request_body_mb = MAX_REQUEST_BODY_MB;
        changed = true;
    }
    if settings.log_retention_days == 0 {
        settings.log_retention_days = DEFAULT_LOG_RETENTION_DAYS;
        changed = true;
    }

    changed
}

fn sanitize_strings(settings: &mut GatewaySettings) -> bool {
    let mut changed = false;

    let threshold = settings.safety_threshold.trim().to_ascii_uppercase();
    if !SAFETY_THRESHOLDS.contains(&threshold.as_str()) {
        settings.safety_threshold = DEFAULT_SAFETY_THRESHOLD.to_string();
        changed = true;
    } else if threshold != settings.safety_threshold {
        settings.safety_threshold = threshold;
        changed = true;
    }

    let base_url = settings.upstream_base_url.trim().trim_end_matches('/');
    if base_url.is_empty() {
        settings.upstream_base_url = DEFAULT_UPSTREAM_BASE_URL.to_string();
        changed = true;
    } else if base_url != settings.upstream_base_url {
        settings.upstream_base_url = base_url.to_string();
        changed = true;
    }

    if settings.listen_host.trim().is_empty() {
        settings.listen_host = DEFAULT_LISTEN_HOST.to_string();
        changed = true;
    }
    if settings.log_filter.trim().is_empty() {
        settings.log_filter = DEFAULT_LOG_FILTER.to_string();
        changed = true;
    }

    changed
}

fn sanitize(settings: &mut GatewaySettings) -> bool {
    let mut repaired = false;
    repaired |= sanitize_model_lists(settings);
    repaired |= sanitize_upstream_timeouts(settings);
    repaired |= sanitize_limits(settings);
    repaired |= sanitize_strings(settings);
    repaired
}

fn validate(settings: &GatewaySettings) -> Result<(), String> {
    if settings.port < 1024 {
        return Err("SEC_INVALID_INPUT: port must be between 1024 and 65535".to_string());
    }
    Ok(())
}

fn parse_settings_json(content: &[u8]) -> Result<(GatewaySettings, bool), String> {
    let raw: serde_json::Value = serde_json::from_slice(content)
        .map_err(|e| format!("failed to parse settings file: {e}"))?;
    let schema_version_present = raw.get("schema_version").is_some();
    let settings: GatewaySettings = serde_json::from_value(raw)
        .map_err(|e| format!("failed to parse settings file: {e}"))?;
    Ok((settings, schema_version_present))
}

/// Reads settings from `path`, creating the file with defaults when missing.
/// The `GEMINI_API_KEY` environment variable fills an empty `api_key`.
pub fn read(path: &Path) -> Result<GatewaySettings, String> {
    let mut settings = match read_optional_file(path)? {
        Some(content) => {
            let (mut settings, schema_version_present) = parse_settings_json(&content)?;
            validate(&settings).map_err(|e| format!("invalid settings file: {e}"))?;

            let mut repaired = sanitize(&mut settings);
            if !schema_version_present || settings.schema_version != SCHEMA_VERSION {
                settings.schema_version = SCHEMA_VERSION;
                repaired = true;
            }
            if repaired {
                // Best-effort: persist repaired values while keeping read semantics.
                if let Err(err) = write(path, &settings) {
                    tracing::warn!(path = %path.display(), error = %err, "failed to persist repaired settings");
                }
            }
            settings
        }
        None => {
            let settings = GatewaySettings::default();
            // Best-effort: create the file on first read so the config is discoverable/editable.
            if let Err(err) = write(path, &settings) {
                tracing::warn!(path = %path.display(), error = %err, "failed to create default settings file");
            }
            settings
        }
    };

    apply_env_overrides(&mut settings, std::env::var(API_KEY_ENV).ok());
    Ok(settings)
}

fn apply_env_overrides(settings: &mut GatewaySettings, env_api_key: Option<String>) {
    if !settings.api_key.trim().is_empty() {
        return;
    }
    if let Some(key) = env_api_key.filter(|v| !v.trim().is_empty()) {
        settings.api_key = key.trim().to_string();
    }
}

pub fn write(path: &Path, settings: &GatewaySettings) -> Result<GatewaySettings, String> {
    validate(settings)?;

    let mut to_write = settings.clone();
    sanitize(&mut to_write);

    let content = serde_json::to_vec_pretty(&to_write)
        .map_err(|e| format!("failed to serialize settings: {e}"))?;
    write_file_atomic(path, &content)?;

    Ok(to_write)
}
