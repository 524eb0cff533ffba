//! Anti-automation challenge token minting.
//!
//! The submission endpoint rejects plain automated requests unless they
//! carry a short-lived proof-of-humanity token. The token can only be
//! produced by the page's own SDK, so this module drives a headless
//! Chromium loaded with the same credential, waits for the
//! token-minting capability to appear, and invokes it.

use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::Page;
use futures::StreamExt;
use vidpool_core::cookies::CookieRecord;

/// Flow name for video creation submissions.
pub const DEFAULT_FLOW: &str = "sora_2_create_task";

/// Header carrying the minted token.
pub const SENTINEL_HEADER: &str = "OpenAI-Sentinel-Token";

/// Fallback SDK script injected when the page did not load it itself.
const SDK_SCRIPT_URL: &str = "https://chatgpt.com/sentinel/97790f37/sdk.js";

const SDK_PROBE: &str =
    "typeof window.SentinelSDK !== 'undefined' && typeof window.SentinelSDK.token === 'function'";

/// How long to wait for the SDK before (and after) injecting it.
const SDK_WAIT: Duration = Duration::from_secs(7);

const SDK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound on one whole minting attempt, browser launch included.
const MINT_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, thiserror::Error)]
pub enum SentinelError {
    #[error("browser error: {0}")]
    Browser(String),

    #[error("sentinel SDK not available on the page")]
    SdkUnavailable,

    #[error("token evaluation failed: {0}")]
    Token(String),

    #[error("sentinel minting timed out")]
    Timeout,
}

/// Mint a sentinel token by driving a headless browser with the given
/// credential cookies.
pub async fn mint_token(
    cookies: &[CookieRecord],
    device_id: &str,
    user_agent: &str,
    flow: &str,
    proxy: Option<&str>,
) -> Result<String, SentinelError> {
    let mut config = BrowserConfig::builder();
    if let Some(proxy) = proxy {
        config = config.arg(format!("--proxy-server={proxy}"));
    }
    let config = config.build().map_err(SentinelError::Browser)?;

    let (mut browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| SentinelError::Browser(e.to_string()))?;
    let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

    let result = tokio::time::timeout(
        MINT_TIMEOUT,
        drive(&browser, cookies, device_id, user_agent, flow),
    )
    .await
    .unwrap_or(Err(SentinelError::Timeout));

    if let Err(e) = browser.close().await {
        tracing::debug!(error = %e, "sentinel browser close failed");
    }
    handler_task.abort();

    result
}

async fn drive(
    browser: &Browser,
    cookies: &[CookieRecord],
    device_id: &str,
    user_agent: &str,
    flow: &str,
) -> Result<String, SentinelError> {
    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| SentinelError::Browser(e.to_string()))?;
    page.set_user_agent(user_agent)
        .await
        .map_err(|e| SentinelError::Browser(e.to_string()))?;

    page.set_cookies(cookie_params(cookies, device_id))
        .await
        .map_err(|e| SentinelError::Browser(e.to_string()))?;

    page.goto(format!("{}/profile", crate::client::SORA_BASE_URL))
        .await
        .map_err(|e| SentinelError::Browser(e.to_string()))?;

    wait_for_sdk(&page).await?;

    let raw: serde_json::Value = page
        .evaluate_function(format!(
            "async () => window.SentinelSDK.token({flow:?})"
        ))
        .await
        .map_err(|e| SentinelError::Token(e.to_string()))?
        .into_value()
        .map_err(|e| SentinelError::Token(e.to_string()))?;

    Ok(finalize_token(raw, flow, device_id))
}

/// Wait for the SDK probe to pass, injecting the script once as a
/// fallback when the page did not ship it.
async fn wait_for_sdk(page: &Page) -> Result<(), SentinelError> {
    for attempt in 0..2 {
        let deadline = tokio::time::Instant::now() + SDK_WAIT;
        while tokio::time::Instant::now() < deadline {
            let ready = page
                .evaluate(SDK_PROBE)
                .await
                .ok()
                .and_then(|result| result.into_value::<bool>().ok())
                .unwrap_or(false);
            if ready {
                return Ok(());
            }
            tokio::time::sleep(SDK_POLL_INTERVAL).await;
        }
        if attempt == 0 {
            tracing::debug!("sentinel SDK absent, injecting script tag");
            let inject = format!(
                "(() => {{ const s = document.createElement('script'); \
                 s.src = {SDK_SCRIPT_URL:?}; document.head.appendChild(s); }})()"
            );
            if let Err(e) = page.evaluate(inject).await {
                return Err(SentinelError::Browser(e.to_string()));
            }
        }
    }
    Err(SentinelError::SdkUnavailable)
}

/// Browser cookie parameters for the credential, guaranteeing a device
/// cookie is present.
fn cookie_params(cookies: &[CookieRecord], device_id: &str) -> Vec<CookieParam> {
    let mut params = Vec::with_capacity(cookies.len() + 1);
    let mut have_device_cookie = false;

    for record in cookies {
        if record.name == "oai-did" && !record.value.is_empty() {
            have_device_cookie = true;
        }
        let host = record.domain.trim_start_matches('.');
        let Ok(param) = CookieParam::builder()
            .name(record.name.clone())
            .value(record.value.clone())
            .domain(host.to_string())
            .path(record.path.clone())
            .secure(true)
            .build()
        else {
            continue;
        };
        params.push(param);
    }

    if !have_device_cookie {
        if let Ok(param) = CookieParam::builder()
            .name("oai-did")
            .value(device_id.to_string())
            .domain(".chatgpt.com")
            .path("/")
            .secure(true)
            .build()
        {
            params.push(param);
        }
    }

    params
}

/// Merge `flow` and the device `id` into the minted token and
/// serialize it compactly.
pub(crate) fn finalize_token(raw: serde_json::Value, flow: &str, device_id: &str) -> String {
    let mut object = match raw {
        serde_json::Value::Object(map) => map,
        serde_json::Value::String(s) => serde_json::from_str::<serde_json::Value>(&s)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default(),
        _ => serde_json::Map::new(),
    };
    object.insert("flow".into(), serde_json::Value::String(flow.into()));
    object.insert("id".into(), serde_json::Value::String(device_id.into()));
    serde_json::Value::Object(object).to_string()
}

/// Rewrite the `flow` field of a cached token for a different flow.
pub(crate) fn with_flow(token: &str, flow: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(token) {
        Ok(serde_json::Value::Object(mut map)) => {
            if map.get("flow").and_then(|v| v.as_str()) != Some(flow) {
                map.insert("flow".into(), serde_json::Value::String(flow.into()));
            }
            serde_json::Value::Object(map).to_string()
        }
        _ => token.to_string(),
    }
}
