//! Typed payloads for the Sora backend endpoints.
//!
//! The backend's responses are loosely shaped; every field that has
//! ever been observed absent is optional here, and interpretation
//! helpers (`is_success`, `failure`, `is_rendering`) encode the
//! truthiness rules the protocol relies on.

use serde::Deserialize;

/// `GET /api/auth/session` response.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    #[serde(rename = "accessToken")]
    pub access_token: Option<String>,
}

/// `POST /backend/uploads` response.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadInfo {
    pub id: Option<String>,
}

/// `POST /backend/nf/create` response; the server returns either a
/// task object or a one-element array of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CreateResponse {
    Many(Vec<CreateInfo>),
    One(CreateInfo),
}

impl CreateResponse {
    pub fn task(&self) -> Option<&CreateInfo> {
        match self {
            CreateResponse::Many(items) => items.first(),
            CreateResponse::One(info) => Some(info),
        }
    }
}

/// One accepted creation task.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateInfo {
    pub id: Option<String>,
    pub task_id: Option<String>,
    pub priority: Option<i64>,
}

impl CreateInfo {
    /// The server has used both `id` and `task_id` for the same thing.
    pub fn resolved_task_id(&self) -> Option<&str> {
        self.id.as_deref().or(self.task_id.as_deref())
    }
}

/// One entry of the `GET /backend/nf/pending` feed.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PendingTask {
    pub id: Option<String>,
    pub status: Option<String>,
    /// Completion fraction in `0.0..=1.0`.
    pub progress_pct: Option<f64>,
    pub progress_pos_in_queue: Option<i64>,
    pub estimated_queue_wait_time: Option<f64>,
    pub queue_status_message: Option<String>,
    pub failure_reason: Option<String>,
}

impl PendingTask {
    /// Explicit failure reason, or a terminal status on the feed.
    pub fn is_terminal_failure(&self) -> bool {
        if self.failure_reason.is_some() {
            return true;
        }
        matches!(
            self.status.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("failed" | "error" | "canceled")
        )
    }

    /// Code to surface for a terminal pending-feed failure.
    pub fn failure_code(&self) -> String {
        self.failure_reason
            .clone()
            .or_else(|| self.status.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| crate::error::CODE_PROCESSING_ERROR.to_string())
    }

    /// A task is rendering once its status leaves the queue stages or
    /// any positive percentage shows up.
    pub fn is_rendering(&self) -> bool {
        let status = self
            .status
            .as_deref()
            .unwrap_or("")
            .to_ascii_lowercase();
        let queued_stage = matches!(status.as_str(), "queued" | "preprocessing");
        !queued_stage || self.progress_pct.is_some_and(|pct| pct > 0.0)
    }
}

/// `GET /backend/project_y/profile/drafts` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DraftListing {
    #[serde(default)]
    pub items: Vec<DraftItem>,
}

/// One work item from the drafts listing.
#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
pub struct DraftItem {
    pub id: Option<String>,
    pub task_id: Option<String>,
    pub kind: Option<String>,
    pub url: Option<String>,
    pub downloadable_url: Option<String>,
    pub encodings: Option<serde_json::Value>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub prompt: Option<String>,
    pub error_reason: Option<String>,
    pub failure_reason: Option<String>,
    pub reason: Option<String>,
    pub reason_str: Option<String>,
    pub message: Option<String>,
}

impl DraftItem {
    /// Terminal success requires both a result URL and encoding
    /// metadata.
    pub fn is_success(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.is_empty())
            && self.encodings.as_ref().is_some_and(|e| !e.is_null())
    }

    /// Terminal failure: an error-kind item, or any failure-reason
    /// field without the success fields. Returns `(code, message)`.
    pub fn failure(&self) -> Option<(String, Option<String>)> {
        let reason_message = self.reason_str.clone().or_else(|| self.message.clone());

        if self.kind.as_deref() == Some("sora_error") {
            let code = self
                .error_reason
                .clone()
                .or_else(|| self.reason.clone())
                .unwrap_or_else(|| crate::error::CODE_PROCESSING_ERROR.to_string());
            return Some((code, reason_message));
        }

        let has_reason = self.error_reason.is_some()
            || self.failure_reason.is_some()
            || self.reason.is_some()
            || self.reason_str.is_some();
        if has_reason && !self.is_success() {
            let code = self
                .error_reason
                .clone()
                .or_else(|| self.failure_reason.clone())
                .or_else(|| self.reason.clone())
                .unwrap_or_else(|| crate::error::CODE_PROCESSING_ERROR.to_string());
            return Some((code, reason_message));
        }

        None
    }
}

/// `GET /backend/project_y/profile/drafts/v2/{id}` response.
#[derive(Debug, Clone, Deserialize)]
pub struct DraftDetailEnvelope {
    pub draft: Option<DraftDetail>,
}

/// Enriched per-item detail record.
#[derive(Debug, Clone, Deserialize)]
pub struct DraftDetail {
    pub url: Option<String>,
    pub downloadable_url: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub prompt: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parse_session_info() {
        let info: SessionInfo =
            serde_json::from_str(r#"{"accessToken":"eyJ.x.y","user":{"id":"u1"}}"#).unwrap();
        assert_eq!(info.access_token.as_deref(), Some("eyJ.x.y"));
    }

    #[test]
    fn parse_session_without_token() {
        let info: SessionInfo = serde_json::from_str(r#"{}"#).unwrap();
        assert!(info.access_token.is_none());
    }

    #[test]
    fn parse_create_response_object() {
        let resp: CreateResponse =
            serde_json::from_str(r#"{"id":"task_01","priority":2}"#).unwrap();
        let task = resp.task().unwrap();
        assert_eq!(task.resolved_task_id(), Some("task_01"));
        assert_eq!(task.priority, Some(2));
    }

    #[test]
    fn parse_create_response_array() {
        let resp: CreateResponse =
            serde_json::from_str(r#"[{"task_id":"task_02"}]"#).unwrap();
        assert_eq!(resp.task().unwrap().resolved_task_id(), Some("task_02"));
    }

    #[test]
    fn parse_create_response_empty_array() {
        let resp: CreateResponse = serde_json::from_str("[]").unwrap();
        assert!(resp.task().is_none());
    }

    #[test]
    fn create_info_prefers_id_over_task_id() {
        let info: CreateInfo =
            serde_json::from_str(r#"{"id":"a","task_id":"b"}"#).unwrap();
        assert_eq!(info.resolved_task_id(), Some("a"));
    }

    #[test]
    fn parse_pending_task() {
        let task: PendingTask = serde_json::from_str(
            r#"{"id":"task_1","status":"queued","progress_pos_in_queue":4,
                "estimated_queue_wait_time":120.5,"queue_status_message":"waiting"}"#,
        )
        .unwrap();
        assert_eq!(task.progress_pos_in_queue, Some(4));
        assert!(!task.is_rendering());
        assert!(!task.is_terminal_failure());
    }

    #[test]
    fn pending_task_rendering_by_status() {
        let task: PendingTask =
            serde_json::from_str(r#"{"id":"t","status":"running"}"#).unwrap();
        assert!(task.is_rendering());
    }

    #[test]
    fn pending_task_rendering_by_percentage() {
        let task: PendingTask = serde_json::from_str(
            r#"{"id":"t","status":"preprocessing","progress_pct":0.1}"#,
        )
        .unwrap();
        assert!(task.is_rendering());
    }

    #[test]
    fn pending_task_terminal_statuses() {
        for status in ["failed", "error", "canceled"] {
            let task: PendingTask =
                serde_json::from_str(&format!(r#"{{"id":"t","status":"{status}"}}"#)).unwrap();
            assert!(task.is_terminal_failure(), "{status}");
            assert_eq!(task.failure_code(), status);
        }
    }

    #[test]
    fn pending_task_failure_reason_wins() {
        let task: PendingTask = serde_json::from_str(
            r#"{"id":"t","status":"queued","failure_reason":"moderation_blocked"}"#,
        )
        .unwrap();
        assert!(task.is_terminal_failure());
        assert_eq!(task.failure_code(), "moderation_blocked");
    }

    #[test]
    fn parse_draft_listing() {
        let listing: DraftListing = serde_json::from_str(
            r#"{"items":[{"id":"gen_1","task_id":"task_1","url":"https://v",
                "encodings":{"source":{}},"width":720,"height":1280,"prompt":"a cat"}]}"#,
        )
        .unwrap();
        assert_eq!(listing.items.len(), 1);
        assert!(listing.items[0].is_success());
        assert_matches!(listing.items[0].failure(), None);
    }

    #[test]
    fn draft_error_kind_is_failure() {
        let item: DraftItem = serde_json::from_str(
            r#"{"task_id":"t","kind":"sora_error","error_reason":"moderation",
                "reason_str":"content policy"}"#,
        )
        .unwrap();
        let (code, message) = item.failure().unwrap();
        assert_eq!(code, "moderation");
        assert_eq!(message.as_deref(), Some("content policy"));
    }

    #[test]
    fn draft_reason_without_success_fields_is_failure() {
        let item: DraftItem = serde_json::from_str(
            r#"{"task_id":"t","failure_reason":"expired"}"#,
        )
        .unwrap();
        let (code, _) = item.failure().unwrap();
        assert_eq!(code, "expired");
    }

    #[test]
    fn draft_reason_with_success_fields_is_not_failure() {
        let item: DraftItem = serde_json::from_str(
            r#"{"task_id":"t","failure_reason":"transient","url":"https://v",
                "encodings":{"source":{}}}"#,
        )
        .unwrap();
        assert!(item.failure().is_none());
        assert!(item.is_success());
    }

    #[test]
    fn draft_null_encodings_is_not_success() {
        let item: DraftItem =
            serde_json::from_str(r#"{"task_id":"t","url":"https://v","encodings":null}"#)
                .unwrap();
        assert!(!item.is_success());
    }

    #[test]
    fn draft_without_error_fields_is_pending() {
        let item: DraftItem = serde_json::from_str(r#"{"task_id":"t"}"#).unwrap();
        assert!(item.failure().is_none());
        assert!(!item.is_success());
    }

    #[test]
    fn parse_draft_detail() {
        let envelope: DraftDetailEnvelope = serde_json::from_str(
            r#"{"draft":{"url":"https://v","downloadable_url":"https://d",
                "width":720,"height":1280,"prompt":"a cat"}}"#,
        )
        .unwrap();
        let detail = envelope.draft.unwrap();
        assert_eq!(detail.downloadable_url.as_deref(), Some("https://d"));
        assert_eq!(detail.width, Some(720));
    }

    #[test]
    fn parse_draft_detail_missing_draft() {
        let envelope: DraftDetailEnvelope = serde_json::from_str(r#"{}"#).unwrap();
        assert!(envelope.draft.is_none());
    }
}
