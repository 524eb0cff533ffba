//! Account entity: one pooled upstream credential with its own daily
//! quota and concurrency slots.

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::FromRow;
use vidpool_core::types::{DbId, Timestamp};

/// A row from the `accounts` table.
///
/// `active_generations` and `daily_generations` are best-effort local
/// counters; they may transiently disagree with upstream truth and are
/// resynchronized when upstream reports a quota violation.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Account {
    pub id: DbId,
    /// Opaque credential blob (browser cookie export).
    #[serde(skip_serializing)]
    pub cookies_json: String,
    /// Derived stable identity; unique when non-null.
    pub account_key: Option<String>,
    pub active_generations: i32,
    pub daily_generations: i32,
    pub last_used_at: Option<Timestamp>,
    /// UTC day the daily counter belongs to.
    pub last_used_date: Option<NaiveDate>,
    pub disabled: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Credential lookup result for resume and duplicate scanning.
#[derive(Debug, Clone, FromRow)]
pub struct StoredCredential {
    pub id: DbId,
    pub cookies_json: String,
    pub account_key: Option<String>,
}
