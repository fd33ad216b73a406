//! DevTools endpoint discovery for an already-running browser.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{AdapterError, AdapterErrorKind};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    web_socket_debugger_url: Option<String>,
    #[serde(rename = "Browser")]
    browser: Option<String>,
}

/// `ws://` origins are used verbatim; `http(s)://` origins go through `/json/version`.
pub async fn resolve_ws_url(origin: &str, timeout: Duration) -> Result<String, AdapterError> {
    let trimmed = origin.trim();
    if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        return Ok(trimmed.to_string());
    }

    let endpoint = version_endpoint(trimmed)?;
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| AdapterError::new(AdapterErrorKind::Discovery).with_hint(err.to_string()))?;

    let info: VersionInfo = client
        .get(endpoint.clone())
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(|err| {
            AdapterError::new(AdapterErrorKind::Discovery)
                .with_hint(format!("GET {endpoint} failed: {err}"))
                .retriable(true)
        })?
        .json()
        .await
        .map_err(|err| {
            AdapterError::new(AdapterErrorKind::Discovery)
                .with_hint(format!("invalid /json/version payload: {err}"))
        })?;

    debug!(
        target: "cdp-transport",
        browser = info.browser.as_deref().unwrap_or("unknown"),
        "discovered devtools endpoint"
    );

    info.web_socket_debugger_url.ok_or_else(|| {
        AdapterError::new(AdapterErrorKind::Discovery)
            .with_hint(format!("{endpoint} did not report webSocketDebuggerUrl"))
    })
}

fn version_endpoint(origin: &str) -> Result<Url, AdapterError> {
    let with_scheme = if origin.contains("://") {
        origin.to_string()
    } else {
        format!("http://{origin}")
    };
    let base = Url::parse(&with_scheme).map_err(|err| {
        AdapterError::new(AdapterErrorKind::Discovery)
            .with_hint(format!("invalid cdp origin '{origin}': {err}"))
    })?;
    base.join("/json/version").map_err(|err| {
        AdapterError::new(AdapterErrorKind::Discovery).with_hint(err.to_string())
    })
}
