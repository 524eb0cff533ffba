//! Authenticated HTTP session against the Sora backend.
//!
//! [`SoraClient`] owns a cookie-seeded `reqwest` client plus the cached
//! bearer token for one credential. Tokens are refreshed proactively
//! inside a fixed margin before expiry and reactively on an
//! unauthorized response (retried once); refreshes are serialized by a
//! session-scoped lock so concurrent calls never issue redundant ones.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{multipart, StatusCode};
use tokio::sync::Mutex;
use vidpool_core::cookies::{parse_cookie_export, CookieRecord};
use vidpool_core::jwt;

use crate::error::SoraError;
use crate::messages::SessionInfo;
use crate::sentinel;

/// Production backend base URL.
pub const SORA_BASE_URL: &str = "https://sora.chatgpt.com";

/// Refresh the token this many seconds before its decoded expiry.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Browser-like user agent sent on every request.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Connection settings shared by every client instance.
#[derive(Debug, Clone)]
pub struct SoraConfig {
    pub base_url: String,
    /// Optional proxy URL applied to HTTP calls and the sentinel
    /// browser.
    pub proxy: Option<String>,
}

impl Default for SoraConfig {
    fn default() -> Self {
        Self {
            base_url: SORA_BASE_URL.to_string(),
            proxy: None,
        }
    }
}

/// Cached bearer token with its decoded expiry.
#[derive(Debug, Default)]
struct AuthState {
    access_token: Option<String>,
    expires_at: Option<i64>,
}

impl AuthState {
    fn valid_token(&self) -> Option<String> {
        let token = self.access_token.as_ref()?;
        let expires_at = self.expires_at?;
        (unix_now() < expires_at - TOKEN_REFRESH_MARGIN_SECS).then(|| token.clone())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One authenticated session for one credential.
pub struct SoraClient {
    http: reqwest::Client,
    base_url: String,
    proxy: Option<String>,
    cookies: Vec<CookieRecord>,
    device_id: String,
    auth: Mutex<AuthState>,
    /// Cached anti-automation token, minted lazily per session.
    sentinel_token: Mutex<Option<String>>,
}

impl SoraClient {
    /// Build a session from a raw credential blob (browser cookie
    /// export).
    pub fn new(cookies_json: &str, config: &SoraConfig) -> Result<Self, SoraError> {
        let records = parse_cookie_export(cookies_json)?;
        Self::from_records(records, config)
    }

    /// Build a session from already-parsed cookie records.
    pub fn from_records(
        records: Vec<CookieRecord>,
        config: &SoraConfig,
    ) -> Result<Self, SoraError> {
        let jar = Arc::new(Jar::default());
        for record in &records {
            // Only cookies for the upstream domain are relevant;
            // domain cookies must also reach the sora host.
            let base_host = record.domain.trim_start_matches('.');
            if !base_host.ends_with("chatgpt.com") {
                continue;
            }
            let mut hosts = vec![base_host.to_string()];
            if base_host != "sora.chatgpt.com" {
                hosts.push("sora.chatgpt.com".to_string());
            }
            for host in hosts {
                if let Ok(url) = format!("https://{host}/").parse::<reqwest::Url>() {
                    jar.add_cookie_str(
                        &format!(
                            "{}={}; Domain={}; Path={}",
                            record.name, record.value, host, record.path
                        ),
                        &url,
                    );
                }
            }
        }

        let device_id = records
            .iter()
            .find(|r| r.name == "oai-did")
            .map(|r| r.value.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut builder = reqwest::Client::builder()
            .cookie_provider(jar)
            .default_headers(default_headers(&config.base_url))
            .user_agent(USER_AGENT);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            proxy: config.proxy.clone(),
            cookies: records,
            device_id,
            auth: Mutex::new(AuthState::default()),
            sentinel_token: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    // ── Authentication ───────────────────────────────────────────────

    /// Return a valid access token, refreshing if needed.
    ///
    /// Doubles as the lightweight credential validation probe used by
    /// account onboarding.
    pub async fn fetch_session_token(&self) -> Result<String, SoraError> {
        if let Some(token) = self.auth.lock().await.valid_token() {
            return Ok(token);
        }
        self.refresh_token(false).await
    }

    /// Refresh the access token via the auth-session endpoint.
    ///
    /// With `force`, an apparently valid cached token is discarded
    /// (used after an unauthorized response).
    async fn refresh_token(&self, force: bool) -> Result<String, SoraError> {
        let mut auth = self.auth.lock().await;

        // Double-check under the lock so concurrent callers piggyback
        // on one refresh.
        if !force {
            if let Some(token) = auth.valid_token() {
                return Ok(token);
            }
        }

        let response = self
            .http
            .get(self.url("/api/auth/session"))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SoraError::Auth(format!(
                "auth session returned {status}: {}",
                truncate(&body, 200)
            )));
        }

        let info: SessionInfo = response
            .json()
            .await
            .map_err(|e| SoraError::Auth(format!("auth session returned invalid JSON: {e}")))?;
        let token = info
            .access_token
            .ok_or_else(|| SoraError::Auth("auth session carried no access token".into()))?;

        auth.expires_at = jwt::decode_exp(&token);
        auth.access_token = Some(token.clone());
        tracing::debug!(
            expires_at = ?auth.expires_at,
            "access token refreshed",
        );
        Ok(token)
    }

    /// Run a request with the session token, refreshing and retrying
    /// exactly once on an unauthorized response.
    async fn send_with_auth<F>(&self, build: F) -> Result<reqwest::Response, SoraError>
    where
        F: Fn(&str) -> Result<reqwest::RequestBuilder, SoraError>,
    {
        let token = self.fetch_session_token().await?;
        let response = build(&token)?.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::debug!("unauthorized response, refreshing token and retrying once");
        let token = self.refresh_token(true).await?;
        Ok(build(&token)?.send().await?)
    }

    fn authed(&self, builder: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(token)
            .header("OAI-Device-Id", &self.device_id)
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// Authenticated GET.
    pub async fn get(&self, path: &str) -> Result<reqwest::Response, SoraError> {
        self.send_with_auth(|token| Ok(self.authed(self.http.get(self.url(path)), token)))
            .await
    }

    /// Authenticated JSON POST with optional extra headers.
    pub async fn post_json(
        &self,
        path: &str,
        payload: &serde_json::Value,
        extra_headers: &[(&str, String)],
    ) -> Result<reqwest::Response, SoraError> {
        self.send_with_auth(|token| {
            let mut builder = self.authed(self.http.post(self.url(path)), token).json(payload);
            for (name, value) in extra_headers {
                builder = builder.header(*name, value.as_str());
            }
            Ok(builder)
        })
        .await
    }

    /// Authenticated multipart POST (start-image upload).
    pub async fn post_multipart(
        &self,
        path: &str,
        file_field: &str,
        filename: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<reqwest::Response, SoraError> {
        self.send_with_auth(|token| {
            let part = multipart::Part::bytes(data.clone())
                .file_name(filename.to_string())
                .mime_str(content_type)
                .map_err(SoraError::Request)?;
            let form = multipart::Form::new()
                .part(file_field.to_string(), part)
                .text("file_name", filename.to_string());
            Ok(self
                .authed(self.http.post(self.url(path)), token)
                .multipart(form))
        })
        .await
    }

    // ── Sentinel token ───────────────────────────────────────────────

    /// Anti-automation token header value for the given flow, minted
    /// via the headless browser on first use and cached per session.
    ///
    /// Returns `None` when minting fails; the submission call then
    /// proceeds without the header and any `sentinel_block` rejection
    /// surfaces with its stable code.
    pub async fn sentinel_header(&self, flow: &str) -> Option<String> {
        let mut cached = self.sentinel_token.lock().await;
        if cached.is_none() {
            match sentinel::mint_token(
                &self.cookies,
                &self.device_id,
                USER_AGENT,
                flow,
                self.proxy.as_deref(),
            )
            .await
            {
                Ok(token) => *cached = Some(token),
                Err(e) => {
                    tracing::warn!(error = %e, flow, "sentinel token fetch failed");
                    return None;
                }
            }
        }
        cached
            .as_deref()
            .map(|token| sentinel::with_flow(token, flow))
    }
}

fn default_headers(base_url: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("accept", HeaderValue::from_static("*/*"));
    headers.insert(
        "accept-language",
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    if let Ok(referer) = HeaderValue::from_str(&format!("{base_url}/drafts")) {
        headers.insert("referer", referer);
    }
    if let Ok(origin) = HeaderValue::from_str(base_url) {
        headers.insert("origin", origin);
    }
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static(
            "\"Google Chrome\";v=\"131\", \"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\"",
        ),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));
    headers
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_production_base() {
        let config = SoraConfig::default();
        assert_eq!(config.base_url, SORA_BASE_URL);
        assert!(config.proxy.is_none());
    }

    #[test]
    fn device_id_comes_from_cookie() {
        let client = SoraClient::new(
            r#"[{"name":"oai-did","value":"device-123","domain":".chatgpt.com"},
                {"name":"session","value":"s","domain":"sora.chatgpt.com"}]"#,
            &SoraConfig::default(),
        )
        .unwrap();
        assert_eq!(client.device_id(), "device-123");
    }

    #[test]
    fn device_id_generated_when_cookie_absent() {
        let client = SoraClient::new(
            r#"[{"name":"session","value":"s","domain":"sora.chatgpt.com"}]"#,
            &SoraConfig::default(),
        )
        .unwrap();
        assert!(uuid::Uuid::parse_str(client.device_id()).is_ok());
    }

    #[test]
    fn invalid_credential_is_rejected() {
        assert!(SoraClient::new("not json", &SoraConfig::default()).is_err());
        assert!(SoraClient::new(r#"{"a":1}"#, &SoraConfig::default()).is_err());
    }

    #[test]
    fn url_joins_relative_paths() {
        let client = SoraClient::new(
            r#"[{"name":"sid","value":"v","domain":"sora.chatgpt.com"}]"#,
            &SoraConfig::default(),
        )
        .unwrap();
        assert_eq!(
            client.url("/backend/nf/pending"),
            format!("{SORA_BASE_URL}/backend/nf/pending")
        );
        assert_eq!(client.url("https://elsewhere/x"), "https://elsewhere/x");
    }

    #[test]
    fn stale_token_is_not_reused() {
        let state = AuthState {
            access_token: Some("tok".into()),
            expires_at: Some(unix_now() + 10),
        };
        assert!(state.valid_token().is_none(), "inside refresh margin");

        let state = AuthState {
            access_token: Some("tok".into()),
            expires_at: Some(unix_now() + 600),
        };
        assert_eq!(state.valid_token().as_deref(), Some("tok"));

        let state = AuthState {
            access_token: Some("tok".into()),
            expires_at: None,
        };
        assert!(state.valid_token().is_none(), "unknown expiry forces refresh");
    }
}
