//! Feeds `Network.*` events of one session into a [`NetworkTapLight`].

use std::collections::BTreeMap;
use std::sync::Arc;

use network_tap_light::config::TapConfig;
use network_tap_light::{NetworkTapLight, ResponseRecord, TapEvent};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::AdapterError;
use crate::session::{CdpSession, Domain};

/// Live network tap for the duration of an action. Stops pumping on drop.
pub struct NetworkMonitor {
    tap: Arc<NetworkTapLight>,
    pump: JoinHandle<()>,
}

impl NetworkMonitor {
    /// Subscribes first, then enables the Network domain, so no event
    /// between the two is lost.
    pub async fn start(session: &CdpSession, config: TapConfig) -> Result<Self, AdapterError> {
        let tap = Arc::new(NetworkTapLight::new(config));
        let mut events = session.events();
        session.enable(Domain::Network).await?;

        let sink = tap.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Some(tap_event) = to_tap_event(&event.method, &event.params) {
                    sink.ingest(tap_event).await;
                }
            }
            debug!(target: "cdp-adapter", "network event pump finished");
        });

        Ok(Self { tap, pump })
    }

    pub fn tap(&self) -> &Arc<NetworkTapLight> {
        &self.tap
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn to_tap_event(method: &str, params: &Value) -> Option<TapEvent> {
    let request_id = || params["requestId"].as_str().unwrap_or_default().to_string();
    match method {
        "Network.requestWillBeSent" => Some(TapEvent::RequestWillBeSent {
            request_id: request_id(),
        }),
        "Network.responseReceived" => Some(TapEvent::ResponseReceived(parse_response(params))),
        "Network.loadingFinished" => Some(TapEvent::LoadingFinished {
            request_id: request_id(),
        }),
        "Network.loadingFailed" => Some(TapEvent::LoadingFailed {
            request_id: request_id(),
        }),
        _ => None,
    }
}

/// Builds a record from `Network.responseReceived` params.
pub fn parse_response(params: &Value) -> ResponseRecord {
    let response = &params["response"];
    let headers: BTreeMap<String, String> = response["headers"]
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(key, value)| {
                    let value = value
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| value.to_string());
                    (key.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default();
    ResponseRecord {
        request_id: params["requestId"].as_str().unwrap_or_default().to_string(),
        url: response["url"].as_str().unwrap_or_default().to_string(),
        status: response["status"].as_i64().unwrap_or_default(),
        status_text: response["statusText"].as_str().unwrap_or_default().to_string(),
        mime_type: response["mimeType"].as_str().unwrap_or_default().to_string(),
        headers,
    }
}

/// `Network.responseReceived` params for tests and fixtures.
pub fn response_params(request_id: &str, url: &str, status: i64, headers: Value) -> Value {
    json!({
        "requestId": request_id,
        "response": {
            "url": url,
            "status": status,
            "statusText": "",
            "mimeType": "application/octet-stream",
            "headers": headers
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{session_event, PageFixture};
    use std::time::Duration;

    #[test]
    fn parses_response_headers() {
        let record = parse_response(&response_params(
            "r1",
            "https://e.test/x.txt",
            200,
            json!({ "Content-Disposition": "attachment; filename=\"x.txt\"", "Content-Length": 5 }),
        ));
        assert_eq!(record.status, 200);
        assert!(record.is_attachment());
        assert_eq!(record.header("content-length"), Some("5"));
    }

    #[tokio::test]
    async fn pump_feeds_tap() {
        let fixture = PageFixture::new(&["MAIN"]);
        let transport = fixture.transport();
        let session = fixture.open().await;
        let monitor = NetworkMonitor::start(&session, TapConfig::default())
            .await
            .unwrap();
        assert_eq!(transport.calls_for("Network.enable").len(), 1);

        transport.emit(session_event("Network.requestWillBeSent", json!({ "requestId": "r1" })));
        transport.emit(session_event(
            "Network.responseReceived",
            response_params("r1", "https://e.test/a", 404, json!({})),
        ));
        transport.emit(session_event("Network.loadingFinished", json!({ "requestId": "r1" })));

        let mut snapshot = monitor.tap().snapshot().await;
        for _ in 0..50 {
            if snapshot.req == 1 && snapshot.inflight == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            snapshot = monitor.tap().snapshot().await;
        }
        assert_eq!(snapshot.req, 1);
        assert_eq!(snapshot.res4xx, 1);
        assert_eq!(snapshot.inflight, 0);
        assert_eq!(monitor.tap().responses().await.len(), 1);
    }

    #[test]
    fn redirect_keeps_request_id() {
        let redirect = to_tap_event(
            "Network.requestWillBeSent",
            &json!({ "requestId": "r7", "redirectResponse": { "status": 302 } }),
        );
        match redirect {
            Some(TapEvent::RequestWillBeSent { request_id }) => assert_eq!(request_id, "r7"),
            other => panic!("unexpected event {other:?}"),
        }
        match to_tap_event("Network.loadingFailed", &json!({ "requestId": "r7" })) {
            Some(TapEvent::LoadingFailed { request_id }) => assert_eq!(request_id, "r7"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
