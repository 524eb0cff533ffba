//! Typed events emitted by a protocol-client run.
//!
//! A run produces a finite, ordered, single-pass sequence of these
//! events over an `mpsc` channel. Exactly one terminal event
//! ([`GenerationEvent::Finished`] or [`GenerationEvent::Error`]) ends a
//! well-formed sequence; consumers must treat a stream that closes
//! without one as an unknown-state failure.

use serde::Serialize;
use vidpool_core::types::DbId;

/// A protocol-level event from a generation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// Emitted on resumed runs to confirm which credential backs the
    /// run; fresh runs learn the account from the pool before the
    /// client starts.
    Account { account_id: DbId },

    /// Authentication succeeded.
    Auth,

    /// The start image was accepted by the upload endpoint.
    Uploaded { media_id: String },

    /// Upstream accepted the creation call and assigned a task.
    Queued {
        task_id: String,
        priority: Option<i64>,
    },

    /// Queue-position or render-percentage change.
    Progress(ProgressUpdate),

    /// The work item first became visible in the drafts listing.
    DraftFound { generation_id: String },

    /// Terminal success.
    Finished(FinishedInfo),

    /// Terminal failure.
    Error(GenerationFailure),
}

impl GenerationEvent {
    /// Stable event name, recorded on the job as `last_event`.
    pub fn name(&self) -> &'static str {
        match self {
            GenerationEvent::Account { .. } => "account",
            GenerationEvent::Auth => "auth",
            GenerationEvent::Uploaded { .. } => "uploaded",
            GenerationEvent::Queued { .. } => "queued",
            GenerationEvent::Progress(_) => "progress",
            GenerationEvent::DraftFound { .. } => "draft_found",
            GenerationEvent::Finished(_) => "finished",
            GenerationEvent::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationEvent::Finished(_) | GenerationEvent::Error(_)
        )
    }
}

/// One progress observation from the pending feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub task_id: String,
    #[serde(flatten)]
    pub stage: ProgressStage,
    pub message: Option<String>,
}

/// Coarse upstream stage for a pending task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProgressStage {
    /// Waiting for a render slot.
    Queued {
        queue_position: Option<i64>,
        eta_secs: Option<f64>,
    },
    /// Rendering, with a completion fraction in `0.0..=1.0` when the
    /// feed exposes one.
    Rendering { percent: Option<f64> },
}

impl ProgressUpdate {
    /// Canonical serialization used to suppress duplicate emissions.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Suppresses consecutive identical progress payloads.
///
/// Only a changed fingerprint triggers a new `progress` event.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last_fingerprint: Option<String>,
}

impl ProgressTracker {
    /// Record the candidate payload; `true` when it differs from the
    /// previously emitted one.
    pub fn should_emit(&mut self, update: &ProgressUpdate) -> bool {
        let fingerprint = update.fingerprint();
        if self.last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return false;
        }
        self.last_fingerprint = Some(fingerprint);
        true
    }

    /// Whether any progress payload has been emitted yet.
    pub fn has_emitted(&self) -> bool {
        self.last_fingerprint.is_some()
    }
}

/// Payload of a terminal success.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishedInfo {
    pub task_id: String,
    pub generation_id: Option<String>,
    pub url: Option<String>,
    pub downloadable_url: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub prompt: Option<String>,
}

impl FinishedInfo {
    /// The URL worth persisting: the downloadable variant when the
    /// detail fetch exposed one, the display URL otherwise.
    pub fn best_url(&self) -> Option<&str> {
        self.downloadable_url
            .as_deref()
            .or(self.url.as_deref())
    }
}

/// Payload of a terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationFailure {
    /// Stable code from the taxonomy, or the upstream failure reason
    /// verbatim for processing errors.
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl GenerationFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
