use sqlx::PgPool;

/// Full bootstrap: connect, migrate, verify schema.
#[sqlx::test(migrations = "./migrations")]
async fn full_bootstrap(pool: PgPool) {
    vidpool_db::health_check(&pool).await.unwrap();

    for table in ["accounts", "generation_jobs"] {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
        )
        .bind(table)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(exists.0, "{table} table should exist after migrations");
    }
}

/// The partial unique index rejects a second account with the same key
/// while still allowing many NULL keys.
#[sqlx::test(migrations = "./migrations")]
async fn account_key_uniqueness(pool: PgPool) {
    use vidpool_db::repositories::AccountRepo;

    AccountRepo::insert(&pool, "[]", Some("user-1")).await.unwrap();
    let dup = AccountRepo::insert(&pool, "[]", Some("user-1")).await;
    assert!(dup.is_err(), "duplicate account_key should violate the index");

    AccountRepo::insert(&pool, "[]", None).await.unwrap();
    AccountRepo::insert(&pool, "[]", None).await.unwrap();
}
