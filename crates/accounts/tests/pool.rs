use assert_matches::assert_matches;
use chrono::Utc;
use sqlx::PgPool;
use vidpool_accounts::{AccountPool, ExhaustionReason, PickAccountError, PoolLimits};
use vidpool_core::cookies::parse_cookie_export;
use vidpool_db::repositories::AccountRepo;
use vidpool_sora::SoraConfig;

fn pool_with(pg: &PgPool, limits: PoolLimits) -> AccountPool {
    AccountPool::new(pg.clone(), limits, SoraConfig::default())
}

#[sqlx::test(migrations = "../db/migrations")]
async fn six_concurrent_picks_fill_exactly_five_slots(pg: PgPool) {
    AccountRepo::insert(&pg, "[]", Some("only")).await.unwrap();
    let pool = pool_with(&pg, PoolLimits::default());

    let results =
        futures::future::join_all((0..6).map(|_| pool.pick_account())).await;

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 5);
    for result in results.iter().filter(|r| r.is_err()) {
        assert_matches!(
            result,
            Err(PickAccountError::Exhausted(ExhaustionReason::NoActiveSlots))
        );
    }

    let picked_id = results.iter().find_map(|r| r.as_ref().ok()).unwrap().id;
    let account = AccountRepo::get(&pg, picked_id).await.unwrap().unwrap();
    assert_eq!(account.active_generations, 5);
}

#[sqlx::test(migrations = "../db/migrations")]
async fn empty_pool_reports_no_accounts(pg: PgPool) {
    let pool = pool_with(&pg, PoolLimits::default());
    assert_matches!(
        pool.pick_account().await,
        Err(PickAccountError::Exhausted(ExhaustionReason::NoAccounts))
    );
}

#[sqlx::test(migrations = "../db/migrations")]
async fn daily_exhausted_account_reports_daily_limit_all(pg: PgPool) {
    let today = Utc::now().date_naive();
    let account = AccountRepo::insert(&pg, "[]", None).await.unwrap();
    AccountRepo::set_daily(&pg, account.id, 100, today).await.unwrap();

    let pool = pool_with(&pg, PoolLimits::default());
    assert_matches!(
        pool.pick_account().await,
        Err(PickAccountError::Exhausted(ExhaustionReason::DailyLimitAll))
    );
}

#[sqlx::test(migrations = "../db/migrations")]
async fn busy_account_reports_no_active_slots(pg: PgPool) {
    AccountRepo::insert(&pg, "[]", None).await.unwrap();
    let limits = PoolLimits {
        concurrency_limit: 1,
        ..PoolLimits::default()
    };
    let pool = pool_with(&pg, limits);

    pool.pick_account().await.unwrap();
    assert_matches!(
        pool.pick_account().await,
        Err(PickAccountError::Exhausted(ExhaustionReason::NoActiveSlots))
    );
}

#[sqlx::test(migrations = "../db/migrations")]
async fn finished_generation_frees_the_slot(pg: PgPool) {
    AccountRepo::insert(&pg, "[]", None).await.unwrap();
    let limits = PoolLimits {
        concurrency_limit: 1,
        ..PoolLimits::default()
    };
    let pool = pool_with(&pg, limits);

    let picked = pool.pick_account().await.unwrap();
    assert_matches!(
        pool.pick_account().await,
        Err(PickAccountError::Exhausted(ExhaustionReason::NoActiveSlots))
    );

    pool.mark_generation_finished(picked.id).await.unwrap();
    assert_eq!(pool.pick_account().await.unwrap().id, picked.id);
}

#[sqlx::test(migrations = "../db/migrations")]
async fn stale_daily_counter_resets_on_pick(pg: PgPool) {
    let today = Utc::now().date_naive();
    let yesterday = today.pred_opt().unwrap();
    let account = AccountRepo::insert(&pg, "[]", None).await.unwrap();
    AccountRepo::set_daily(&pg, account.id, 100, yesterday).await.unwrap();

    let pool = pool_with(&pg, PoolLimits::default());
    let picked = pool.pick_account().await.unwrap();
    assert_eq!(picked.id, account.id);
    assert_eq!(picked.daily_generations, 0);
    assert_eq!(picked.last_used_date, Some(today));
}

#[sqlx::test(migrations = "../db/migrations")]
async fn created_charges_daily_quota_only_on_confirmation(pg: PgPool) {
    let account = AccountRepo::insert(&pg, "[]", None).await.unwrap();
    let pool = pool_with(&pg, PoolLimits::default());

    let picked = pool.pick_account().await.unwrap();
    assert_eq!(picked.daily_generations, 0, "selection must not charge quota");

    pool.mark_generation_created(picked.id).await.unwrap();
    let account = AccountRepo::get(&pg, account.id).await.unwrap().unwrap();
    assert_eq!(account.daily_generations, 1);
    assert_eq!(account.active_generations, 1);
}

#[sqlx::test(migrations = "../db/migrations")]
async fn daily_exhausted_forces_counter_to_limit(pg: PgPool) {
    let account = AccountRepo::insert(&pg, "[]", None).await.unwrap();
    let pool = pool_with(&pg, PoolLimits::default());

    pool.mark_account_daily_exhausted(account.id).await.unwrap();

    let account = AccountRepo::get(&pg, account.id).await.unwrap().unwrap();
    assert_eq!(account.daily_generations, 100);
    assert_matches!(
        pool.pick_account().await,
        Err(PickAccountError::Exhausted(ExhaustionReason::DailyLimitAll))
    );
}

#[sqlx::test(migrations = "../db/migrations")]
async fn canonical_duplicate_is_detected_across_orderings(pg: PgPool) {
    let stored = r#"[{"name":"a","value":"1","domain":".chatgpt.com","path":"/"},
                     {"name":"b","value":"2","domain":".chatgpt.com","path":"/"}]"#;
    AccountRepo::insert(&pg, stored, None).await.unwrap();
    let pool = pool_with(&pg, PoolLimits::default());

    let reordered = parse_cookie_export(
        r#"[{"name":"b","value":"2","domain":".Chatgpt.com","path":"/"},
            {"name":"a","value":"1","domain":".chatgpt.com","path":"/"}]"#,
    )
    .unwrap();
    assert!(pool
        .find_canonical_duplicate(&reordered)
        .await
        .unwrap()
        .is_some());

    let different = parse_cookie_export(
        r#"[{"name":"a","value":"other","domain":".chatgpt.com","path":"/"}]"#,
    )
    .unwrap();
    assert!(pool
        .find_canonical_duplicate(&different)
        .await
        .unwrap()
        .is_none());
}

#[sqlx::test(migrations = "../db/migrations")]
async fn malformed_stored_rows_do_not_break_duplicate_scan(pg: PgPool) {
    AccountRepo::insert(&pg, "not json", None).await.unwrap();
    let pool = pool_with(&pg, PoolLimits::default());

    let probe = parse_cookie_export(r#"[{"name":"a","value":"1"}]"#).unwrap();
    assert!(pool.find_canonical_duplicate(&probe).await.unwrap().is_none());
}
