//! Coordinator: claim, dispatch, recover, shut down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use vidpool_accounts::AccountPool;
use vidpool_core::types::DbId;
use vidpool_db::models::job::{GenerationJob, JobStatus, NewJob};
use vidpool_db::repositories::JobRepo;
use vidpool_db::DbPool;
use vidpool_sora::SoraConfig;

use crate::notifier::Notifier;
use crate::runner;

/// Fallback poll period protecting against a missed wake signal.
const WAKE_FALLBACK: Duration = Duration::from_secs(1);

/// Default bound on concurrently running job tasks.
const DEFAULT_MAX_WORKERS: usize = 5;

/// Tunable queue parameters.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_workers: usize,
    pub wake_fallback: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            wake_fallback: WAKE_FALLBACK,
        }
    }
}

/// Shared state handed to the coordinator and every job task.
pub(crate) struct QueueShared {
    pub(crate) pool: DbPool,
    pub(crate) accounts: AccountPool,
    pub(crate) sora: SoraConfig,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) config: QueueConfig,
    pub(crate) wake: Notify,
    pub(crate) cancel: CancellationToken,
}

/// The persistent generation queue.
///
/// Owned by the process composition root and passed by reference to
/// whatever needs to enqueue or wake it; there is no ambient global
/// instance.
pub struct GenerationQueue {
    shared: Arc<QueueShared>,
    coordinator: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl GenerationQueue {
    pub fn new(
        pool: DbPool,
        accounts: AccountPool,
        sora: SoraConfig,
        notifier: Arc<dyn Notifier>,
        config: QueueConfig,
    ) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                pool,
                accounts,
                sora,
                notifier,
                config,
                wake: Notify::new(),
                cancel: CancellationToken::new(),
            }),
            coordinator: Mutex::new(None),
        }
    }

    /// Persist a new job in `queued` status and wake the scheduler.
    ///
    /// Returns immediately; dispatch timing is not guaranteed.
    pub async fn enqueue(&self, input: &NewJob) -> Result<DbId, sqlx::Error> {
        let job = JobRepo::enqueue(&self.shared.pool, input).await?;
        tracing::info!(job_id = job.id, user_id = job.user_id, "job enqueued");
        self.notify_new_job();
        Ok(job.id)
    }

    /// Non-blocking wake signal: a queued job may exist.
    pub fn notify_new_job(&self) {
        self.shared.wake.notify_one();
    }

    /// Run crash recovery, then start the scheduling loop.
    pub async fn start(&self) -> Result<(), sqlx::Error> {
        let mut coordinator = self.coordinator.lock().await;
        if coordinator.is_some() {
            return Ok(());
        }

        let recovery = recover(&self.shared.pool).await?;
        if recovery.requeued > 0 {
            self.shared.wake.notify_one();
        }

        let shared = Arc::clone(&self.shared);
        *coordinator = Some(tokio::spawn(run_loop(shared, recovery.resumable)));
        Ok(())
    }

    /// Cooperatively cancel the scheduling loop and every in-flight
    /// job task, waiting for all of them to unwind.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down generation queue");
        self.shared.cancel.cancel();
        self.shared.wake.notify_one();
        if let Some(handle) = self.coordinator.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "coordinator task ended abnormally");
            }
        }
        tracing::info!("generation queue stopped");
    }
}

/// What startup recovery found.
pub(crate) struct Recovery {
    /// Jobs with both `task_id` and `account_id`: reattach to the
    /// protocol client's resume path without resubmitting.
    pub(crate) resumable: Vec<GenerationJob>,
    /// Jobs reset to `queued` because their prior attempt never
    /// reached a resumable state.
    pub(crate) requeued: usize,
}

/// Inspect every `running` job left over from a previous process.
pub(crate) async fn recover(pool: &DbPool) -> Result<Recovery, sqlx::Error> {
    let running = JobRepo::list_by_status(pool, JobStatus::Running).await?;
    let mut resumable = Vec::new();
    let mut requeued = 0;

    for job in running {
        if job.task_id.is_some() && job.account_id.is_some() {
            tracing::info!(
                job_id = job.id,
                task_id = job.task_id.as_deref().unwrap_or_default(),
                "resuming running job",
            );
            resumable.push(job);
        } else {
            tracing::info!(job_id = job.id, "running job has no resume data, requeueing");
            JobRepo::requeue(pool, job.id).await?;
            requeued += 1;
        }
    }

    Ok(Recovery { resumable, requeued })
}

/// The scheduling loop: one coordinator, many concurrent job tasks.
async fn run_loop(shared: Arc<QueueShared>, resumable: Vec<GenerationJob>) {
    let mut tasks: JoinSet<()> = JoinSet::new();
    for job in resumable {
        spawn_job(&mut tasks, &shared, job, true);
    }

    tracing::info!(
        max_workers = shared.config.max_workers,
        "generation queue started",
    );

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        // Fill free worker slots with the oldest queued jobs.
        while tasks.len() < shared.config.max_workers {
            match JobRepo::claim_next(&shared.pool).await {
                Ok(Some(job)) => {
                    tracing::info!(job_id = job.id, "starting queued job");
                    spawn_job(&mut tasks, &shared, job, false);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to claim next job");
                    break;
                }
            }
        }

        // A finished task immediately re-arms the loop so its slot can
        // be refilled; the fallback tick protects against lost wakes.
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            joined = tasks.join_next(), if !tasks.is_empty() => {
                if let Some(Err(e)) = joined {
                    if e.is_panic() {
                        tracing::error!("job task panicked");
                    }
                }
            }
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(shared.config.wake_fallback) => {}
        }
    }

    tracing::info!(in_flight = tasks.len(), "draining in-flight job tasks");
    while tasks.join_next().await.is_some() {}
}

fn spawn_job(
    tasks: &mut JoinSet<()>,
    shared: &Arc<QueueShared>,
    job: GenerationJob,
    resume: bool,
) {
    let shared = Arc::clone(shared);
    tasks.spawn(runner::run_job(shared, job, resume));
}
