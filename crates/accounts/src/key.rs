//! Stable account-key derivation.
//!
//! Two credential exports for the same upstream account must dedupe,
//! so the key is taken from the identity claims of the probe's access
//! token when possible, and falls back to a hash of the canonical
//! cookie form otherwise.

use vidpool_core::cookies::{credential_hash_key, CookieRecord};
use vidpool_core::jwt;

/// Identity claims checked in preference order. Email-like claims win
/// because they survive token re-issuance.
const IDENTITY_CLAIMS: [&str; 5] = ["email", "user_id", "userId", "sub", "uid"];

/// Derive the stable key for a credential.
pub fn derive_account_key(access_token: &str, records: &[CookieRecord]) -> String {
    if let Some(payload) = jwt::decode_payload(access_token) {
        for claim in IDENTITY_CLAIMS {
            let Some(value) = payload.get(claim).and_then(|v| v.as_str()) else {
                continue;
            };
            let trimmed = value.trim();
            if trimmed.is_empty() {
                continue;
            }
            return if claim == "email" {
                trimmed.to_ascii_lowercase()
            } else {
                trimmed.to_string()
            };
        }
    }
    credential_hash_key(records)
}
