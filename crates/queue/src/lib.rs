//! Durable job queue and worker pool.
//!
//! A single coordinator loop claims queued jobs from the store and
//! runs up to `max_workers` of them concurrently, each as a
//! cancellable task that translates the protocol client's event stream
//! into job-record updates and best-effort notifications. Crash
//! recovery on startup resumes submitted jobs without resubmitting
//! them and requeues the rest.

pub mod notifier;
pub mod queue;
mod runner;

pub use notifier::{LogNotifier, Notifier, NotifyError, ResultMessage};
pub use queue::{GenerationQueue, QueueConfig};
