//! Unverified JWT payload decoding.
//!
//! Upstream access tokens are JWTs whose claims we only need for two
//! local purposes: scheduling a proactive refresh (`exp`) and deriving
//! a stable account identity (`email`, `sub`, ...). Signature
//! verification is the upstream's job, not ours, so the payload is
//! decoded without validation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Decode the payload segment of a JWT into JSON.
///
/// Returns `None` for anything that does not look like a three-part
/// token with a base64url JSON payload.
pub fn decode_payload(token: &str) -> Option<serde_json::Value> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    let _signature = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let raw = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Decode the `exp` claim as unix seconds.
pub fn decode_exp(token: &str) -> Option<i64> {
    decode_payload(token)?.get("exp")?.as_i64()
}
