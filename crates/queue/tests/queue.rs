use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use vidpool_accounts::{AccountPool, PoolLimits};
use vidpool_core::types::DbId;
use vidpool_db::models::job::{JobStatus, NewJob, VideoSize};
use vidpool_db::repositories::{AccountRepo, JobRepo};
use vidpool_queue::{GenerationQueue, LogNotifier, QueueConfig};
use vidpool_sora::SoraConfig;

fn queue_for(pg: &PgPool) -> GenerationQueue {
    GenerationQueue::new(
        pg.clone(),
        AccountPool::new(pg.clone(), PoolLimits::default(), SoraConfig::default()),
        SoraConfig::default(),
        Arc::new(LogNotifier),
        QueueConfig {
            wake_fallback: Duration::from_millis(50),
            ..QueueConfig::default()
        },
    )
}

fn new_job(prompt: &str) -> NewJob {
    NewJob {
        user_id: 1,
        chat_id: 2,
        prompt: prompt.into(),
        orientation: None,
        frames: 300,
        size: VideoSize::Large,
        image: None,
        notify_handle: None,
        poll_interval_secs: 0.05,
        timeout_secs: 5.0,
    }
}

async fn wait_for_status(pg: &PgPool, job_id: DbId, status: JobStatus) {
    for _ in 0..200 {
        let job = JobRepo::get(pg, job_id).await.unwrap().unwrap();
        if job.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let job = JobRepo::get(pg, job_id).await.unwrap().unwrap();
    panic!("job {job_id} never reached {status:?}, stuck at {:?}", job.status);
}

#[sqlx::test(migrations = "../db/migrations")]
async fn empty_pool_fails_the_job_with_guidance(pg: PgPool) {
    let queue = queue_for(&pg);
    queue.start().await.unwrap();

    let job_id = queue.enqueue(&new_job("no accounts for me")).await.unwrap();
    wait_for_status(&pg, job_id, JobStatus::Failed).await;

    let job = JobRepo::get(&pg, job_id).await.unwrap().unwrap();
    assert_eq!(
        job.error_message.as_deref(),
        Some("No accounts are available right now. Try again later.")
    );

    queue.shutdown().await;
}

#[sqlx::test(migrations = "../db/migrations")]
async fn unparseable_credential_fails_the_job_and_frees_the_slot(pg: PgPool) {
    // The account exists but its credential blob is empty, so the
    // dispatch reserves a slot and then rejects the credential before
    // any network traffic.
    let account = AccountRepo::insert(&pg, "[]", None).await.unwrap();

    let queue = queue_for(&pg);
    queue.start().await.unwrap();

    let job_id = queue.enqueue(&new_job("bad credential")).await.unwrap();
    wait_for_status(&pg, job_id, JobStatus::Failed).await;

    let job = JobRepo::get(&pg, job_id).await.unwrap().unwrap();
    assert_eq!(job.account_id, Some(account.id));
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("credential rejected:"));

    queue.shutdown().await;

    let account = AccountRepo::get(&pg, account.id).await.unwrap().unwrap();
    assert_eq!(account.active_generations, 0, "slot must be released");
    assert_eq!(account.daily_generations, 0, "quota must not be charged");
}

#[sqlx::test(migrations = "../db/migrations")]
async fn recovery_requeues_jobs_without_resume_data(pg: PgPool) {
    // Left `running` by a crashed process, but never submitted
    // upstream: must go back to `queued` and get redispatched.
    let job = JobRepo::enqueue(&pg, &new_job("interrupted early")).await.unwrap();
    JobRepo::claim_next(&pg).await.unwrap().unwrap();

    let account = AccountRepo::insert(&pg, "[]", None).await.unwrap();

    let queue = queue_for(&pg);
    queue.start().await.unwrap();
    wait_for_status(&pg, job.id, JobStatus::Failed).await;
    queue.shutdown().await;

    // The redispatch bound the account and rejected its credential;
    // what matters is that the job went through `queued` again rather
    // than resuming.
    let job = JobRepo::get(&pg, job.id).await.unwrap().unwrap();
    assert_eq!(job.account_id, Some(account.id));
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("credential rejected:"));
}

#[sqlx::test(migrations = "../db/migrations")]
async fn recovery_resumes_jobs_with_task_and_account(pg: PgPool) {
    let account = AccountRepo::insert(&pg, "[]", None).await.unwrap();
    let job = JobRepo::enqueue(&pg, &new_job("interrupted mid-flight")).await.unwrap();
    JobRepo::claim_next(&pg).await.unwrap().unwrap();
    JobRepo::set_task_id(&pg, job.id, "task_resume_1").await.unwrap();
    JobRepo::set_account(&pg, job.id, account.id).await.unwrap();

    let queue = queue_for(&pg);
    queue.start().await.unwrap();
    wait_for_status(&pg, job.id, JobStatus::Failed).await;
    queue.shutdown().await;

    // The resume path kept the upstream binding (no new submission)
    // and failed only on the unusable credential.
    let job = JobRepo::get(&pg, job.id).await.unwrap().unwrap();
    assert_eq!(job.task_id.as_deref(), Some("task_resume_1"));
    assert_eq!(job.account_id, Some(account.id));
    assert_ne!(job.last_event.as_deref(), Some("requeued"));
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("credential rejected:"));
}

#[sqlx::test(migrations = "../db/migrations")]
async fn shutdown_with_idle_queue_returns_promptly(pg: PgPool) {
    let queue = queue_for(&pg);
    queue.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), queue.shutdown())
        .await
        .expect("shutdown must not hang");
}

#[sqlx::test(migrations = "../db/migrations")]
async fn jobs_dispatch_in_enqueue_order(pg: PgPool) {
    // Without any account both jobs fail fast; with a single worker
    // the failure order follows the FIFO claim order.
    let queue = GenerationQueue::new(
        pg.clone(),
        AccountPool::new(pg.clone(), PoolLimits::default(), SoraConfig::default()),
        SoraConfig::default(),
        Arc::new(LogNotifier),
        QueueConfig {
            max_workers: 1,
            wake_fallback: Duration::from_millis(50),
        },
    );

    let first = queue.enqueue(&new_job("first")).await.unwrap();
    let second = queue.enqueue(&new_job("second")).await.unwrap();
    assert!(first < second);

    queue.start().await.unwrap();
    wait_for_status(&pg, first, JobStatus::Failed).await;
    wait_for_status(&pg, second, JobStatus::Failed).await;

    let a = JobRepo::get(&pg, first).await.unwrap().unwrap();
    let b = JobRepo::get(&pg, second).await.unwrap().unwrap();
    assert!(a.updated_at <= b.updated_at);

    queue.shutdown().await;
}
