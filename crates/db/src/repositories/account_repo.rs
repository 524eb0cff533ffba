//! Repository for the `accounts` table.
//!
//! Scheduling-relevant counters (`active_generations`,
//! `daily_generations`) are only mutated through single atomic
//! statements or inside a caller-held transaction, so concurrent
//! pickers can never double-book the last free slot.

use chrono::NaiveDate;
use sqlx::{PgConnection, PgPool};
use vidpool_core::types::DbId;

use crate::models::account::{Account, StoredCredential};

/// Column list for `accounts` queries.
const COLUMNS: &str = "\
    id, cookies_json, account_key, active_generations, daily_generations, \
    last_used_at, last_used_date, disabled, created_at, updated_at";

/// Pool-wide availability snapshot used to classify exhaustion.
#[derive(Debug, Clone, Copy)]
pub struct AvailabilityCounts {
    /// All accounts, disabled included.
    pub total: i64,
    /// Enabled accounts under their daily cap.
    pub under_daily_cap: i64,
    /// Enabled accounts under both the daily cap and the concurrency cap.
    pub with_free_slot: i64,
}

/// Provides CRUD and slot-accounting operations for pooled accounts.
pub struct AccountRepo;

impl AccountRepo {
    /// Insert a new account with zeroed counters, returning the row.
    pub async fn insert(
        pool: &PgPool,
        cookies_json: &str,
        account_key: Option<&str>,
    ) -> Result<Account, sqlx::Error> {
        let query = format!(
            "INSERT INTO accounts (cookies_json, account_key) \
             VALUES ($1, $2) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Account>(&query)
            .bind(cookies_json)
            .bind(account_key)
            .fetch_one(pool)
            .await
    }

    /// Find an account ID by its derived stable key.
    pub async fn find_id_by_key(
        pool: &PgPool,
        account_key: &str,
    ) -> Result<Option<DbId>, sqlx::Error> {
        let row: Option<(DbId,)> =
            sqlx::query_as("SELECT id FROM accounts WHERE account_key = $1")
                .bind(account_key)
                .fetch_optional(pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Fetch an account by ID.
    pub async fn get(pool: &PgPool, id: DbId) -> Result<Option<Account>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM accounts WHERE id = $1");
        sqlx::query_as::<_, Account>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Credential blob for a single account (resume path).
    pub async fn get_credentials(
        pool: &PgPool,
        id: DbId,
    ) -> Result<Option<StoredCredential>, sqlx::Error> {
        sqlx::query_as::<_, StoredCredential>(
            "SELECT id, cookies_json, account_key FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// All stored credentials, for canonical duplicate scanning.
    pub async fn list_credentials(pool: &PgPool) -> Result<Vec<StoredCredential>, sqlx::Error> {
        sqlx::query_as::<_, StoredCredential>(
            "SELECT id, cookies_json, account_key FROM accounts ORDER BY id",
        )
        .fetch_all(pool)
        .await
    }

    /// Lazily reset daily counters for accounts whose stored date is
    /// not `today`. Runs inside the caller's transaction.
    pub async fn reset_daily_out_of_date(
        conn: &mut PgConnection,
        today: NaiveDate,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE accounts \
             SET daily_generations = 0, last_used_date = $1, updated_at = NOW() \
             WHERE last_used_date IS NOT NULL AND last_used_date <> $1",
        )
        .bind(today)
        .execute(conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Availability snapshot under the given limits. Runs inside the
    /// caller's transaction so the subsequent acquire sees the same
    /// state.
    pub async fn availability_counts(
        conn: &mut PgConnection,
        daily_limit: i32,
        concurrency_limit: i32,
    ) -> Result<AvailabilityCounts, sqlx::Error> {
        let (total, under_daily_cap, with_free_slot): (i64, i64, i64) = sqlx::query_as(
            "SELECT \
                 COUNT(*), \
                 COUNT(*) FILTER (WHERE NOT disabled AND daily_generations < $1), \
                 COUNT(*) FILTER (WHERE NOT disabled AND daily_generations < $1 \
                                    AND active_generations < $2) \
             FROM accounts",
        )
        .bind(daily_limit)
        .bind(concurrency_limit)
        .fetch_one(conn)
        .await?;
        Ok(AvailabilityCounts {
            total,
            under_daily_cap,
            with_free_slot,
        })
    }

    /// Atomically select the best available account and reserve one
    /// concurrency slot.
    ///
    /// The selection and the increment happen in one statement with
    /// `FOR UPDATE`, so two concurrent callers can never reserve the
    /// same last slot: a waiter re-evaluates the slot predicate against
    /// the committed row once the lock holder finishes. Returns `None`
    /// when no candidate matches (including losing the race).
    pub async fn acquire(
        conn: &mut PgConnection,
        today: NaiveDate,
        daily_limit: i32,
        concurrency_limit: i32,
    ) -> Result<Option<Account>, sqlx::Error> {
        let query = format!(
            "UPDATE accounts \
             SET active_generations = active_generations + 1, \
                 last_used_at = NOW(), last_used_date = $1, updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM accounts \
                 WHERE NOT disabled \
                   AND daily_generations < $2 \
                   AND active_generations < $3 \
                 ORDER BY active_generations ASC, daily_generations ASC, \
                          last_used_at ASC NULLS FIRST, id ASC \
                 LIMIT 1 \
                 FOR UPDATE \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Account>(&query)
            .bind(today)
            .bind(daily_limit)
            .bind(concurrency_limit)
            .fetch_optional(conn)
            .await
    }

    /// Charge one unit of daily quota and stamp the last-used markers.
    pub async fn increment_daily(
        pool: &PgPool,
        id: DbId,
        today: NaiveDate,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE accounts \
             SET daily_generations = daily_generations + 1, \
                 last_used_at = NOW(), last_used_date = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(today)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Release one concurrency slot, floored at zero.
    pub async fn decrement_active(pool: &PgPool, id: DbId) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE accounts \
             SET active_generations = GREATEST(active_generations - 1, 0), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Force-set the daily counter (upstream quota resynchronization).
    pub async fn set_daily(
        pool: &PgPool,
        id: DbId,
        value: i32,
        today: NaiveDate,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE accounts \
             SET daily_generations = $2, last_used_at = NOW(), \
                 last_used_date = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(value)
        .bind(today)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Soft-delete toggle: disabled accounts never get selected.
    pub async fn set_disabled(pool: &PgPool, id: DbId, disabled: bool) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE accounts SET disabled = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(disabled)
            .execute(pool)
            .await?;
        Ok(())
    }
}
