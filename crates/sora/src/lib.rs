//! Sora web-backend protocol client.
//!
//! Drives the upstream generation workflow (authenticate, optionally
//! upload a start image, submit, poll) against one credential and one
//! request, normalizing the backend's ad-hoc responses into a finite,
//! ordered stream of typed [`events::GenerationEvent`]s.
//!
//! The client is stateless per invocation and accepts credentials as
//! plain data; it knows nothing about the account pool or the job
//! queue.

pub mod client;
pub mod error;
pub mod events;
pub mod generate;
pub mod messages;
pub mod sentinel;

pub use client::{SoraClient, SoraConfig};
pub use error::{SoraError, UpstreamError};
pub use events::GenerationEvent;
pub use generate::{generate, resume, GenerationRequest, Orientation, VideoSize};
