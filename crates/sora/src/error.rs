//! Client-level errors and upstream error-payload normalization.
//!
//! The backend reports failures as `{"error": {"type", "code",
//! "message"}}` with varying completeness; [`UpstreamError`] captures
//! whatever was present plus the raw body for diagnostics. Well-known
//! free-text rejections are remapped to stable codes so consumers can
//! branch without string matching.

use serde::Serialize;
use vidpool_core::cookies::CookieExportError;

// Stable error codes surfaced in terminal events.
pub const CODE_AUTH_FAILED: &str = "auth_failed";
pub const CODE_AUTH_EXPIRED: &str = "auth_expired";
pub const CODE_UPLOAD_FAILED: &str = "upload_failed";
pub const CODE_INVALID_START_IMAGE: &str = "invalid_start_image";
pub const CODE_UPLOAD_MISSING_ID: &str = "upload_missing_id";
pub const CODE_UPLOAD_EXCEPTION: &str = "upload_exception";
pub const CODE_CREATE_FAILED: &str = "create_failed";
pub const CODE_RATE_LIMIT: &str = "rate_limit";
pub const CODE_CONCURRENCY_LIMIT: &str = "concurrency_limit";
pub const CODE_DAILY_LIMIT: &str = "daily_limit";
pub const CODE_SENTINEL_BLOCK: &str = "sentinel_block";
pub const CODE_MISSING_TASK_ID: &str = "missing_task_id";
pub const CODE_TIMEOUT: &str = "timeout";
pub const CODE_POLL_FAILED: &str = "poll_failed";
pub const CODE_PROCESSING_ERROR: &str = "processing_error";
pub const CODE_RESUME_FAILED: &str = "resume_failed";
pub const CODE_ACCOUNT_MISSING: &str = "account_missing";

/// Errors from the transport and session layer.
#[derive(Debug, thiserror::Error)]
pub enum SoraError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The credential blob could not be parsed into cookies.
    #[error("invalid credential: {0}")]
    Credential(#[from] CookieExportError),

    /// The auth-session endpoint rejected the credential or returned
    /// an unusable payload.
    #[error("authentication failed: {0}")]
    Auth(String),
}

/// Normalized upstream error payload.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamError {
    pub http_status: u16,
    /// `error.type` when present.
    pub kind: Option<String>,
    /// `error.code` when present.
    pub code: Option<String>,
    pub message: Option<String>,
    /// Raw body, JSON when it parsed, plain text otherwise.
    pub raw: serde_json::Value,
}

impl UpstreamError {
    /// Consume a non-success response into a normalized payload.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let http_status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Self::from_body(http_status, &body)
    }

    /// Parse a raw body captured from a non-success response.
    pub fn from_body(http_status: u16, body: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(json) => {
                let err = json.get("error").cloned().unwrap_or_default();
                let field = |name: &str| {
                    err.get(name)
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                };
                let message = field("message")
                    .or_else(|| (!body.is_empty()).then(|| body.to_string()));
                Self {
                    http_status,
                    kind: field("type"),
                    code: field("code"),
                    message,
                    raw: json,
                }
            }
            Err(_) => Self {
                http_status,
                kind: None,
                code: None,
                message: (!body.is_empty()).then(|| body.to_string()),
                raw: serde_json::Value::String(body.to_string()),
            },
        }
    }

    pub fn details(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Stable code for a failed creation call.
///
/// Precedence: an explicit upstream code wins, then the well-known
/// free-text rejections (concurrent-task cap, rolling daily cap), then
/// HTTP 429 as a generic rate limit, then `create_failed`.
pub fn classify_create_failure(err: &UpstreamError) -> String {
    if let Some(code) = err.code.as_deref() {
        let lowered = code.to_ascii_lowercase();
        if lowered.contains(CODE_DAILY_LIMIT) {
            return CODE_DAILY_LIMIT.to_string();
        }
        if !code.is_empty() {
            return code.to_string();
        }
    }

    let message = err.message.as_deref().unwrap_or("");
    if message.contains("You already have 5 generations in progress") {
        return CODE_CONCURRENCY_LIMIT.to_string();
    }
    if is_daily_limit_message(message) {
        return CODE_DAILY_LIMIT.to_string();
    }
    if err.http_status == 429 {
        return CODE_RATE_LIMIT.to_string();
    }
    CODE_CREATE_FAILED.to_string()
}

/// Heuristic for the rolling daily-cap rejection, which upstream words
/// in several ways.
fn is_daily_limit_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    (lowered.contains("submitted") || lowered.contains("generated"))
        && lowered.contains("100")
        && (lowered.contains("24 hours") || lowered.contains("last day"))
}

/// Stable code for a failed upload call.
pub fn classify_upload_failure(err: &UpstreamError) -> String {
    if err.http_status == 400 {
        let message = err.message.as_deref().unwrap_or("").to_ascii_lowercase();
        if ["face", "person", "people", "invalid image"]
            .iter()
            .any(|needle| message.contains(needle))
        {
            return CODE_INVALID_START_IMAGE.to_string();
        }
    }
    err.code
        .clone()
        .filter(|code| !code.is_empty())
        .unwrap_or_else(|| CODE_UPLOAD_FAILED.to_string())
}
