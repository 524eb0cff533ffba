//! Credential cookie-export handling.
//!
//! An upstream credential is a browser cookie export: a JSON array of
//! objects with at least `name` and `value`, usually also `domain` and
//! `path`. This module parses such exports into [`CookieRecord`]s,
//! produces a canonical serialization for equality comparison, and
//! derives a stable fallback key by hashing the canonical form.
//!
//! Canonicalization keeps only the semantically meaningful fields
//! (name, value, domain, path), lower-cases domain and path, sorts by
//! (domain, path, name) and serializes deterministically, so two
//! functionally identical exports with different ordering or casing
//! compare equal.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Default host assumed when an export entry carries no `domain`.
pub const DEFAULT_COOKIE_DOMAIN: &str = "sora.chatgpt.com";

/// One cookie from a browser export, reduced to the fields that matter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    /// Lower-cased; may carry a leading dot for domain cookies.
    pub domain: String,
    pub path: String,
}

/// Errors produced while parsing a cookie export.
#[derive(Debug, thiserror::Error)]
pub enum CookieExportError {
    /// The blob is not valid JSON.
    #[error("credential is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The blob parsed, but is not a JSON array of cookie objects.
    #[error("credential must be a JSON array of cookie objects")]
    NotAnArray,

    /// The array contained no usable cookie entries.
    #[error("credential contains no usable cookies")]
    Empty,
}

/// Raw export entry; extra browser fields (`secure`, `httpOnly`, ...)
/// are ignored.
#[derive(Debug, Deserialize)]
struct RawCookie {
    name: Option<String>,
    value: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

/// RFC 6265 cookie-name token characters.
fn valid_cookie_name(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[!#$%&'*+.^_`|~0-9A-Za-z-]+$").unwrap());
    re.is_match(name)
}

/// Parse a browser cookie export into records.
///
/// Entries with a missing value or an invalid name are skipped; the
/// result is an error only when the blob is not an array or nothing
/// usable remains.
pub fn parse_cookie_export(cookies_json: &str) -> Result<Vec<CookieRecord>, CookieExportError> {
    let value: serde_json::Value = serde_json::from_str(cookies_json)?;
    let entries = value.as_array().ok_or(CookieExportError::NotAnArray)?;

    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        let Ok(raw) = serde_json::from_value::<RawCookie>(entry.clone()) else {
            continue;
        };
        let (Some(name), Some(value)) = (raw.name, raw.value) else {
            continue;
        };
        if !valid_cookie_name(&name) {
            continue;
        }
        records.push(CookieRecord {
            name,
            value,
            domain: raw
                .domain
                .unwrap_or_else(|| DEFAULT_COOKIE_DOMAIN.to_string())
                .to_ascii_lowercase(),
            path: raw.path.unwrap_or_else(|| "/".to_string()),
        });
    }

    if records.is_empty() {
        return Err(CookieExportError::Empty);
    }
    Ok(records)
}

/// Canonical JSON form of a cookie set, for byte-for-byte comparison.
pub fn canonicalize(records: &[CookieRecord]) -> String {
    let mut norm: Vec<(String, String, String, String)> = records
        .iter()
        .map(|c| {
            (
                c.domain.to_ascii_lowercase(),
                c.path.to_ascii_lowercase(),
                c.name.clone(),
                c.value.clone(),
            )
        })
        .collect();
    norm.sort();

    // serde_json maps serialize with sorted keys, so the output is
    // fully deterministic.
    let items: Vec<serde_json::Value> = norm
        .into_iter()
        .map(|(domain, path, name, value)| {
            serde_json::json!({
                "domain": domain,
                "path": path,
                "name": name,
                "value": value,
            })
        })
        .collect();
    serde_json::to_string(&items).unwrap_or_default()
}

/// Stable fallback account key: SHA-256 over the canonical form.
pub fn credential_hash_key(records: &[CookieRecord]) -> String {
    let canon = canonicalize(records);
    let digest = Sha256::digest(canon.as_bytes());
    format!("cookiehash:{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn export(json: &str) -> Vec<CookieRecord> {
        parse_cookie_export(json).unwrap()
    }

    #[test]
    fn parse_basic_export() {
        let records = export(
            r#"[{"name":"sid","value":"abc","domain":".chatgpt.com","path":"/","secure":true}]"#,
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "sid");
        assert_eq!(records[0].domain, ".chatgpt.com");
    }

    #[test]
    fn parse_defaults_domain_and_path() {
        let records = export(r#"[{"name":"sid","value":"abc"}]"#);
        assert_eq!(records[0].domain, DEFAULT_COOKIE_DOMAIN);
        assert_eq!(records[0].path, "/");
    }

    #[test]
    fn parse_skips_invalid_names() {
        let records = export(
            r#"[{"name":"bad name;","value":"x"},{"name":"ok","value":"y"}]"#,
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "ok");
    }

    #[test]
    fn parse_rejects_non_array() {
        assert!(matches!(
            parse_cookie_export(r#"{"name":"sid"}"#),
            Err(CookieExportError::NotAnArray)
        ));
    }

    #[test]
    fn parse_rejects_invalid_json() {
        assert!(matches!(
            parse_cookie_export("not json"),
            Err(CookieExportError::InvalidJson(_))
        ));
    }

    #[test]
    fn parse_rejects_empty_usable_set() {
        assert!(matches!(
            parse_cookie_export(r#"[{"name":"x y","value":"v"}]"#),
            Err(CookieExportError::Empty)
        ));
    }

    #[test]
    fn canonical_form_ignores_ordering_and_casing() {
        let a = export(
            r#"[{"name":"b","value":"2","domain":".Chatgpt.Com","path":"/"},
                {"name":"a","value":"1","domain":".chatgpt.com","path":"/"}]"#,
        );
        let b = export(
            r#"[{"name":"a","value":"1","domain":".chatgpt.com","path":"/"},
                {"name":"b","value":"2","domain":".chatgpt.com","path":"/"}]"#,
        );
        assert_eq!(canonicalize(&a), canonicalize(&b));
        assert_eq!(credential_hash_key(&a), credential_hash_key(&b));
    }

    #[test]
    fn canonical_form_distinguishes_values() {
        let a = export(r#"[{"name":"a","value":"1"}]"#);
        let b = export(r#"[{"name":"a","value":"2"}]"#);
        assert_ne!(credential_hash_key(&a), credential_hash_key(&b));
    }

    #[test]
    fn hash_key_is_prefixed() {
        let records = export(r#"[{"name":"a","value":"1"}]"#);
        assert!(credential_hash_key(&records).starts_with("cookiehash:"));
    }
}
