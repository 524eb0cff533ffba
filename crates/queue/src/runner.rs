//! Per-job task: credential selection, event translation, guaranteed
//! slot release.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use vidpool_accounts::{ExhaustionReason, PickAccountError};
use vidpool_core::types::DbId;
use vidpool_db::models::job::{self, GenerationJob};
use vidpool_db::repositories::{AccountRepo, JobRepo};
use vidpool_db::DbPool;
use vidpool_sora::error::CODE_DAILY_LIMIT;
use vidpool_sora::events::{FinishedInfo, GenerationFailure, ProgressStage};
use vidpool_sora::{generate, resume, GenerationEvent, GenerationRequest, SoraClient};

use crate::notifier::ResultMessage;
use crate::queue::QueueShared;

/// Event channel depth between the protocol client and the job task.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// How a job task's event loop ended.
enum Outcome {
    Finished(FinishedInfo),
    Failed(GenerationFailure),
    /// The event stream closed without a terminal event.
    Unterminated,
    /// Queue shutdown; the job stays `running` for recovery.
    Cancelled,
}

/// Releases an account's concurrency slot exactly once.
///
/// The normal path is the explicit [`release`](Self::release) call at
/// the end of the job task; the `Drop` impl is the backstop for panic
/// and cancellation unwinds.
struct SlotGuard {
    pool: DbPool,
    account_id: DbId,
    released: bool,
}

impl SlotGuard {
    fn new(pool: DbPool, account_id: DbId) -> Self {
        Self {
            pool,
            account_id,
            released: false,
        }
    }

    async fn release(mut self) {
        self.released = true;
        if let Err(e) = AccountRepo::decrement_active(&self.pool, self.account_id).await {
            tracing::error!(
                account_id = self.account_id,
                error = %e,
                "failed to release account slot",
            );
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pool = self.pool.clone();
        let account_id = self.account_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = AccountRepo::decrement_active(&pool, account_id).await {
                    tracing::error!(account_id, error = %e, "slot release backstop failed");
                }
            });
        }
    }
}

/// Mutable per-job view threaded through event handling.
struct JobContext<'a> {
    shared: &'a QueueShared,
    job_id: DbId,
    user_id: DbId,
    chat_id: DbId,
    notify_handle: Option<i64>,
    account_id: Option<DbId>,
}

impl<'a> JobContext<'a> {
    fn new(shared: &'a QueueShared, job: &GenerationJob) -> Self {
        Self {
            shared,
            job_id: job.id,
            user_id: job.user_id,
            chat_id: job.chat_id,
            notify_handle: job.notify_handle,
            account_id: job.account_id,
        }
    }

    /// Best-effort progress edit; a failure drops the stored handle so
    /// later steps skip it.
    async fn edit_progress(&mut self, text: &str) {
        let Some(handle) = self.notify_handle else {
            return;
        };
        if let Err(e) = self
            .shared
            .notifier
            .edit_progress(self.chat_id, handle, text)
            .await
        {
            tracing::debug!(
                job_id = self.job_id,
                error = %e,
                "progress edit failed, dropping handle",
            );
            self.drop_handle().await;
        }
    }

    /// Best-effort delete; the handle is forgotten either way.
    async fn delete_progress(&mut self) {
        let Some(handle) = self.notify_handle else {
            return;
        };
        if let Err(e) = self
            .shared
            .notifier
            .delete_progress(self.chat_id, handle)
            .await
        {
            tracing::debug!(job_id = self.job_id, error = %e, "progress delete failed");
        }
        self.drop_handle().await;
    }

    async fn drop_handle(&mut self) {
        self.notify_handle = None;
        if let Err(e) = JobRepo::clear_notify_handle(&self.shared.pool, self.job_id).await {
            tracing::error!(job_id = self.job_id, error = %e, "failed to clear notify handle");
        }
    }

    async fn send_result(&self, message: ResultMessage) {
        if let Err(e) = self.shared.notifier.send_result(self.chat_id, message).await {
            tracing::debug!(job_id = self.job_id, error = %e, "result delivery failed");
        }
    }

    async fn clear_active_flag(&self) {
        self.shared
            .notifier
            .clear_active_generation(self.user_id)
            .await;
    }
}

/// Entry point for one job task. Panics are converted into a terminal
/// failure; they never reach the coordinator.
pub(crate) async fn run_job(shared: Arc<QueueShared>, job: GenerationJob, resume_run: bool) {
    let job_id = job.id;
    let driven = AssertUnwindSafe(drive_job(&shared, job, resume_run))
        .catch_unwind()
        .await;
    if driven.is_err() {
        tracing::error!(job_id, "job task panicked");
        if let Err(e) = JobRepo::fail(&shared.pool, job_id, "internal error").await {
            tracing::error!(job_id, error = %e, "failed to record panic failure");
        }
    }
}

async fn drive_job(shared: &QueueShared, job: GenerationJob, resume_run: bool) {
    let mut ctx = JobContext::new(shared, &job);

    // Credential selection. A fresh run reserves a slot from the pool;
    // a resumed run still holds the slot reserved before the crash.
    let (slot, cookies_json) = if resume_run {
        let Some(account_id) = job.account_id else {
            fail_job(&mut ctx, "cannot resume without a bound account").await;
            return;
        };
        let slot = SlotGuard::new(shared.pool.clone(), account_id);
        match shared.accounts.get_credentials(account_id).await {
            Ok(Some(credential)) => (slot, credential.cookies_json),
            Ok(None) => {
                fail_job(&mut ctx, "account unavailable to resume the generation").await;
                slot.release().await;
                return;
            }
            Err(e) => {
                tracing::error!(job_id = ctx.job_id, error = %e, "credential lookup failed");
                fail_job(&mut ctx, "internal error while resuming").await;
                slot.release().await;
                return;
            }
        }
    } else {
        let account = match shared.accounts.pick_account().await {
            Ok(account) => account,
            Err(PickAccountError::Exhausted(reason)) => {
                tracing::info!(job_id = ctx.job_id, reason = %reason, "no account available");
                fail_job(&mut ctx, exhaustion_message(reason)).await;
                return;
            }
            Err(PickAccountError::Db(e)) => {
                tracing::error!(job_id = ctx.job_id, error = %e, "account selection failed");
                fail_job(&mut ctx, "internal error while selecting an account").await;
                return;
            }
        };
        ctx.account_id = Some(account.id);
        if let Err(e) = JobRepo::set_account(&shared.pool, ctx.job_id, account.id).await {
            tracing::error!(job_id = ctx.job_id, error = %e, "failed to bind account");
        }
        (
            SlotGuard::new(shared.pool.clone(), account.id),
            account.cookies_json,
        )
    };

    let client = match SoraClient::new(&cookies_json, &shared.sora) {
        Ok(client) => client,
        Err(e) => {
            fail_job(&mut ctx, &format!("credential rejected: {e}")).await;
            slot.release().await;
            return;
        }
    };

    // Producer task: drives the upstream workflow and feeds the event
    // channel until a terminal event or until we drop the receiver.
    let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let producer = if resume_run {
        let Some(task_id) = job.task_id.clone() else {
            fail_job(&mut ctx, "cannot resume without an upstream task id").await;
            slot.release().await;
            return;
        };
        ctx.edit_progress("Resuming generation tracking...").await;
        tokio::spawn(resume(
            client,
            slot.account_id,
            task_id,
            job.poll_interval(),
            job.timeout(),
            tx,
        ))
    } else {
        ctx.edit_progress("Generation will start soon...").await;
        let request = GenerationRequest {
            prompt: job.prompt.clone(),
            orientation: job.orientation.map(to_sora_orientation),
            frames: job.frames,
            size: to_sora_size(job.size),
            start_image: job.image.clone(),
            poll_interval: job.poll_interval(),
            timeout: job.timeout(),
        };
        tokio::spawn(generate(client, request, tx))
    };

    let outcome = loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break Outcome::Cancelled,
            event = rx.recv() => match event {
                Some(event) => {
                    if let Some(outcome) = handle_event(&mut ctx, event).await {
                        break outcome;
                    }
                }
                None => break Outcome::Unterminated,
            }
        }
    };
    producer.abort();
    drop(rx);

    match outcome {
        Outcome::Cancelled => {
            // The job stays `running`; recovery will resume it when it
            // has a task id, or requeue it otherwise.
            tracing::info!(job_id = ctx.job_id, "job task cancelled");
        }
        outcome => finalize(&mut ctx, outcome).await,
    }

    slot.release().await;
}

/// Apply one protocol event: job-record updates, accounting hooks,
/// notifications. Returns the outcome once a terminal event arrives.
async fn handle_event(ctx: &mut JobContext<'_>, event: GenerationEvent) -> Option<Outcome> {
    if let Err(e) = JobRepo::set_last_event(&ctx.shared.pool, ctx.job_id, event.name()).await {
        tracing::error!(job_id = ctx.job_id, error = %e, "failed to record event name");
    }

    match event {
        GenerationEvent::Account { account_id } => {
            ctx.account_id = Some(account_id);
            if let Err(e) = JobRepo::set_account(&ctx.shared.pool, ctx.job_id, account_id).await {
                tracing::error!(job_id = ctx.job_id, error = %e, "failed to bind account");
            }
            None
        }
        GenerationEvent::Auth => {
            ctx.edit_progress("Authorizing with the upstream account...").await;
            None
        }
        GenerationEvent::Uploaded { .. } => {
            ctx.edit_progress("Image uploaded, preparing the generation...").await;
            None
        }
        GenerationEvent::Queued { task_id, .. } => {
            if let Err(e) = JobRepo::set_task_id(&ctx.shared.pool, ctx.job_id, &task_id).await {
                tracing::error!(job_id = ctx.job_id, error = %e, "failed to record task id");
            }
            // Upstream accepted the task: only now is daily quota
            // charged.
            if let Some(account_id) = ctx.account_id {
                if let Err(e) = ctx.shared.accounts.mark_generation_created(account_id).await {
                    tracing::error!(account_id, error = %e, "failed to charge daily quota");
                }
            }
            ctx.edit_progress("Generation will start soon...").await;
            None
        }
        GenerationEvent::Progress(update) => {
            match update.stage {
                ProgressStage::Queued { .. } => {
                    ctx.edit_progress("Generation will start soon...").await;
                }
                ProgressStage::Rendering { percent } => {
                    if let Some(fraction) = percent {
                        if let Err(e) =
                            JobRepo::update_progress(&ctx.shared.pool, ctx.job_id, fraction).await
                        {
                            tracing::error!(job_id = ctx.job_id, error = %e, "failed to record progress");
                        }
                        let percent = (fraction * 100.0).round() as i64;
                        ctx.edit_progress(&format!("Rendering in progress: {percent}%"))
                            .await;
                    }
                }
            }
            None
        }
        GenerationEvent::DraftFound { .. } => {
            ctx.edit_progress("Processing the draft...").await;
            None
        }
        GenerationEvent::Error(failure) => {
            // Resynchronize local accounting when upstream reports a
            // quota violation the counters did not predict.
            if failure.code == CODE_DAILY_LIMIT {
                if let Some(account_id) = ctx.account_id {
                    if let Err(e) = ctx
                        .shared
                        .accounts
                        .mark_account_daily_exhausted(account_id)
                        .await
                    {
                        tracing::error!(account_id, error = %e, "failed to sync daily counter");
                    }
                }
            }
            Some(Outcome::Failed(failure))
        }
        GenerationEvent::Finished(info) => Some(Outcome::Finished(info)),
    }
}

/// Record the terminal state and deliver exactly one result message.
async fn finalize(ctx: &mut JobContext<'_>, outcome: Outcome) {
    match outcome {
        Outcome::Finished(info) => {
            let url = info.best_url().map(str::to_string);
            if let Err(e) = JobRepo::complete(&ctx.shared.pool, ctx.job_id, url.as_deref()).await {
                tracing::error!(job_id = ctx.job_id, error = %e, "failed to record completion");
            }
            ctx.delete_progress().await;
            let message = match url {
                Some(url) => ResultMessage::Video {
                    url,
                    caption: "Video generated successfully".into(),
                },
                None => {
                    ResultMessage::Text("Video generated, but no link was returned".into())
                }
            };
            ctx.send_result(message).await;
            ctx.clear_active_flag().await;
            tracing::info!(job_id = ctx.job_id, "job completed");
        }
        Outcome::Failed(failure) => {
            let message = if failure.message.is_empty() {
                failure.code.clone()
            } else {
                failure.message.clone()
            };
            tracing::warn!(
                job_id = ctx.job_id,
                code = %failure.code,
                "job failed: {message}",
            );
            fail_job(ctx, &message).await;
        }
        Outcome::Unterminated => {
            fail_job(ctx, "generation ended in an unknown state").await;
        }
        Outcome::Cancelled => {}
    }
}

/// Shared failure path: record, clean up, notify once.
async fn fail_job(ctx: &mut JobContext<'_>, message: &str) {
    if let Err(e) = JobRepo::fail(&ctx.shared.pool, ctx.job_id, message).await {
        tracing::error!(job_id = ctx.job_id, error = %e, "failed to record failure");
    }
    ctx.delete_progress().await;
    ctx.send_result(ResultMessage::Text(format!("Generation failed:\n{message}")))
        .await;
    ctx.clear_active_flag().await;
}

/// Requester-facing guidance per exhaustion reason.
fn exhaustion_message(reason: ExhaustionReason) -> &'static str {
    match reason {
        ExhaustionReason::NoActiveSlots => {
            "No accounts are available right now. Wait a few minutes and try again."
        }
        ExhaustionReason::NoAccounts | ExhaustionReason::DailyLimitAll => {
            "No accounts are available right now. Try again later."
        }
    }
}

fn to_sora_orientation(orientation: job::Orientation) -> vidpool_sora::Orientation {
    match orientation {
        job::Orientation::Portrait => vidpool_sora::Orientation::Portrait,
        job::Orientation::Landscape => vidpool_sora::Orientation::Landscape,
    }
}

fn to_sora_size(size: job::VideoSize) -> vidpool_sora::VideoSize {
    match size {
        job::VideoSize::Small => vidpool_sora::VideoSize::Small,
        job::VideoSize::Large => vidpool_sora::VideoSize::Large,
    }
}
