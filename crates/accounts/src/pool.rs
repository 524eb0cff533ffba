//! Pool operations: onboarding, atomic selection, and accounting.

use std::time::Duration;

use chrono::Utc;
use vidpool_core::cookies::{canonicalize, parse_cookie_export, CookieRecord};
use vidpool_core::types::DbId;
use vidpool_db::models::account::{Account, StoredCredential};
use vidpool_db::repositories::AccountRepo;
use vidpool_db::DbPool;
use vidpool_sora::{SoraClient, SoraConfig};

use crate::key::derive_account_key;

/// Per-account, per-UTC-day cap on accepted submissions.
pub const DAILY_LIMIT: i32 = 100;

/// Per-account cap on simultaneously running generations.
pub const CONCURRENCY_LIMIT: i32 = 5;

/// Upper bound on the onboarding authentication probe.
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(20);

/// Tunable pool limits; the defaults match the upstream caps.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub daily_limit: i32,
    pub concurrency_limit: i32,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            daily_limit: DAILY_LIMIT,
            concurrency_limit: CONCURRENCY_LIMIT,
        }
    }
}

/// Why no account could be reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionReason {
    /// The pool is empty.
    NoAccounts,
    /// Every account has reached its daily cap.
    DailyLimitAll,
    /// Accounts under the daily cap exist, but none has a free
    /// concurrency slot (including losing a selection race).
    NoActiveSlots,
}

impl ExhaustionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExhaustionReason::NoAccounts => "no_accounts",
            ExhaustionReason::DailyLimitAll => "daily_limit_all",
            ExhaustionReason::NoActiveSlots => "no_active_slots",
        }
    }
}

impl std::fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PickAccountError {
    #[error("no account available: {0}")]
    Exhausted(ExhaustionReason),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AddAccountError {
    /// The credential failed parsing or the authentication probe.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// An account with the same identity or identical canonical
    /// credential already exists.
    #[error("account already exists in the pool")]
    DuplicateAccount,

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Resource manager for pooled upstream credentials.
pub struct AccountPool {
    pool: DbPool,
    limits: PoolLimits,
    sora: SoraConfig,
}

impl AccountPool {
    pub fn new(pool: DbPool, limits: PoolLimits, sora: SoraConfig) -> Self {
        Self { pool, limits, sora }
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    // ── Onboarding ───────────────────────────────────────────────────

    /// Validate and store a new credential.
    ///
    /// The probe fetches an access token with the provided cookies;
    /// its identity claims become the dedupe key, with a canonical
    /// cookie hash as fallback, so two functionally identical exports
    /// always collide.
    pub async fn add_account(&self, cookies_json: &str) -> Result<DbId, AddAccountError> {
        let records = parse_cookie_export(cookies_json)
            .map_err(|e| AddAccountError::InvalidCredential(e.to_string()))?;

        let client = SoraClient::from_records(records.clone(), &self.sora)
            .map_err(|e| AddAccountError::InvalidCredential(e.to_string()))?;
        let token = tokio::time::timeout(VALIDATION_TIMEOUT, client.fetch_session_token())
            .await
            .map_err(|_| {
                AddAccountError::InvalidCredential("credential validation timed out".into())
            })?
            .map_err(|e| AddAccountError::InvalidCredential(e.to_string()))?;

        let account_key = derive_account_key(&token, &records);
        if AccountRepo::find_id_by_key(&self.pool, &account_key)
            .await?
            .is_some()
        {
            return Err(AddAccountError::DuplicateAccount);
        }
        if self.find_canonical_duplicate(&records).await?.is_some() {
            return Err(AddAccountError::DuplicateAccount);
        }

        let account = AccountRepo::insert(&self.pool, cookies_json, Some(&account_key))
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AddAccountError::DuplicateAccount
                } else {
                    AddAccountError::Db(e)
                }
            })?;
        tracing::info!(account_id = account.id, "account added to pool");
        Ok(account.id)
    }

    /// Scan stored credentials for a byte-for-byte canonical match.
    ///
    /// Malformed stored rows are skipped rather than failing the scan.
    pub async fn find_canonical_duplicate(
        &self,
        records: &[CookieRecord],
    ) -> Result<Option<DbId>, sqlx::Error> {
        let canonical = canonicalize(records);
        for stored in AccountRepo::list_credentials(&self.pool).await? {
            match parse_cookie_export(&stored.cookies_json) {
                Ok(existing) if canonicalize(&existing) == canonical => {
                    return Ok(Some(stored.id));
                }
                _ => continue,
            }
        }
        Ok(None)
    }

    // ── Selection ────────────────────────────────────────────────────

    /// Atomically select and reserve one account.
    ///
    /// Applies the lazy daily reset, classifies exhaustion, then
    /// increments `active_generations` in the same transaction as the
    /// read. The daily quota is NOT charged here; a reservation that
    /// never reaches submission must not consume it.
    pub async fn pick_account(&self) -> Result<Account, PickAccountError> {
        let today = Utc::now().date_naive();
        let mut tx = self.pool.begin().await?;

        AccountRepo::reset_daily_out_of_date(&mut tx, today).await?;

        let counts = AccountRepo::availability_counts(
            &mut tx,
            self.limits.daily_limit,
            self.limits.concurrency_limit,
        )
        .await?;
        if counts.total == 0 {
            tx.commit().await?;
            return Err(PickAccountError::Exhausted(ExhaustionReason::NoAccounts));
        }
        if counts.under_daily_cap == 0 {
            tx.commit().await?;
            return Err(PickAccountError::Exhausted(ExhaustionReason::DailyLimitAll));
        }
        if counts.with_free_slot == 0 {
            tx.commit().await?;
            return Err(PickAccountError::Exhausted(ExhaustionReason::NoActiveSlots));
        }

        let picked = AccountRepo::acquire(
            &mut tx,
            today,
            self.limits.daily_limit,
            self.limits.concurrency_limit,
        )
        .await?;
        tx.commit().await?;

        match picked {
            Some(account) => {
                tracing::debug!(
                    account_id = account.id,
                    active_generations = account.active_generations,
                    daily_generations = account.daily_generations,
                    "account reserved",
                );
                Ok(account)
            }
            // Lost the selection race after the counts snapshot.
            None => Err(PickAccountError::Exhausted(ExhaustionReason::NoActiveSlots)),
        }
    }

    // ── Accounting ───────────────────────────────────────────────────

    /// Charge one unit of daily quota. Call only after upstream
    /// confirmed task acceptance.
    pub async fn mark_generation_created(&self, account_id: DbId) -> Result<(), sqlx::Error> {
        AccountRepo::increment_daily(&self.pool, account_id, Utc::now().date_naive()).await
    }

    /// Release the reserved concurrency slot. Must run exactly once
    /// per successful [`pick_account`](Self::pick_account), regardless
    /// of outcome.
    pub async fn mark_generation_finished(&self, account_id: DbId) -> Result<(), sqlx::Error> {
        AccountRepo::decrement_active(&self.pool, account_id).await
    }

    /// Resynchronize after an upstream daily-quota rejection the local
    /// counters did not predict: force the counter to the limit.
    pub async fn mark_account_daily_exhausted(&self, account_id: DbId) -> Result<(), sqlx::Error> {
        tracing::warn!(account_id, "upstream reported daily quota exhausted, syncing counter");
        AccountRepo::set_daily(
            &self.pool,
            account_id,
            self.limits.daily_limit,
            Utc::now().date_naive(),
        )
        .await
    }

    /// Credential lookup for the resume path.
    pub async fn get_credentials(
        &self,
        account_id: DbId,
    ) -> Result<Option<StoredCredential>, sqlx::Error> {
        AccountRepo::get_credentials(&self.pool, account_id).await
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}
