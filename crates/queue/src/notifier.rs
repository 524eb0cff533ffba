//! Notification boundary towards the chat front-end.
//!
//! Every call is best-effort and at-most-once: failures are logged and
//! never escalated, and a failed edit or delete makes the caller drop
//! the stored message handle so later steps skip the known-dead
//! target.

use async_trait::async_trait;
use vidpool_core::types::DbId;

/// A notification could not be delivered. Carries only a description;
/// the job never fails because of it.
#[derive(Debug, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Terminal message for the requester.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultMessage {
    /// Deliver the rendered video by URL.
    Video { url: String, caption: String },
    /// Plain text (errors, or success without a usable link).
    Text(String),
}

/// Progress and result delivery, implemented by the front-end.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Update the progress message identified by `handle`.
    async fn edit_progress(
        &self,
        chat_id: DbId,
        handle: i64,
        text: &str,
    ) -> Result<(), NotifyError>;

    /// Remove the progress message identified by `handle`.
    async fn delete_progress(&self, chat_id: DbId, handle: i64) -> Result<(), NotifyError>;

    /// Deliver the terminal outcome. Exactly one per job.
    async fn send_result(&self, chat_id: DbId, message: ResultMessage) -> Result<(), NotifyError>;

    /// Clear the user's single-active-generation flag (front-end
    /// state).
    async fn clear_active_generation(&self, user_id: DbId);
}

/// Tracing-only notifier for headless operation and tests.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn edit_progress(
        &self,
        chat_id: DbId,
        handle: i64,
        text: &str,
    ) -> Result<(), NotifyError> {
        tracing::debug!(chat_id, handle, text, "progress update");
        Ok(())
    }

    async fn delete_progress(&self, chat_id: DbId, handle: i64) -> Result<(), NotifyError> {
        tracing::debug!(chat_id, handle, "progress message removed");
        Ok(())
    }

    async fn send_result(&self, chat_id: DbId, message: ResultMessage) -> Result<(), NotifyError> {
        match message {
            ResultMessage::Video { url, .. } => {
                tracing::info!(chat_id, url = %url, "generation result")
            }
            ResultMessage::Text(text) => tracing::info!(chat_id, text = %text, "generation result"),
        }
        Ok(())
    }

    async fn clear_active_generation(&self, user_id: DbId) {
        tracing::debug!(user_id, "active generation flag cleared");
    }
}
