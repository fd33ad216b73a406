//! Network tap (light) for a single invocation.
//!
//! Tracks in-flight requests so callers can wait for network idle, and keeps a
//! bounded ring of recently observed responses. The ring is what download
//! fallbacks scan when the browser never reports a download.

pub mod config;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;

use crate::config::TapConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Header names whose values never leave the engine.
pub const REDACTED_HEADERS: &[&str] = &["set-cookie", "cookie", "authorization", "proxy-authorization"];

pub const REDACTED_VALUE: &str = "[redacted]";

/// Snapshot of the request counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSnapshot {
    pub req: u64,
    pub res2xx: u64,
    pub res4xx: u64,
    pub res5xx: u64,
    pub inflight: u64,
    pub quiet: bool,
    pub since_last_activity_ms: u64,
}

/// Errors emitted by the tap surface.
#[derive(Clone, Debug, Error)]
pub enum TapError {
    #[error("network did not go idle within {timeout_ms}ms ({inflight} request(s) in flight)")]
    IdleTimeout { timeout_ms: u64, inflight: u64 },
}

/// One observed HTTP response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub request_id: String,
    pub url: String,
    pub status: i64,
    pub status_text: String,
    pub mime_type: String,
    pub headers: BTreeMap<String, String>,
}

impl ResponseRecord {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_attachment(&self) -> bool {
        self.header("content-disposition")
            .map(|value| value.trim_start().to_ascii_lowercase().starts_with("attachment"))
            .unwrap_or(false)
    }

    /// Copy with sensitive header values replaced.
    pub fn redacted(&self) -> Self {
        Self {
            headers: redact_headers(&self.headers),
            ..self.clone()
        }
    }
}

pub fn redact_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(key, value)| {
            let lower = key.to_ascii_lowercase();
            if REDACTED_HEADERS.contains(&lower.as_str()) {
                (key.clone(), REDACTED_VALUE.to_string())
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

/// Fixed-capacity buffer of the most recent responses, oldest evicted first.
#[derive(Clone, Debug)]
pub struct ResponseRing {
    capacity: usize,
    entries: VecDeque<ResponseRecord>,
    evicted: u64,
}

impl ResponseRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
            evicted: 0,
        }
    }

    pub fn push(&mut self, record: ResponseRecord) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Newest response for `url`.
    pub fn find_by_url(&self, url: &str) -> Option<&ResponseRecord> {
        self.entries.iter().rev().find(|record| record.url == url)
    }

    /// Newest response served as an attachment.
    pub fn latest_attachment(&self) -> Option<&ResponseRecord> {
        self.entries.iter().rev().find(|record| record.is_attachment())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResponseRecord> {
        self.entries.iter()
    }
}

/// CDP-inspired events understood by the tap for aggregation.
///
/// Request lifecycle events carry the CDP `requestId`; a redirect reuses the
/// id of the request it continues.
#[derive(Clone, Debug)]
pub enum TapEvent {
    RequestWillBeSent { request_id: String },
    ResponseReceived(ResponseRecord),
    LoadingFinished { request_id: String },
    LoadingFailed { request_id: String },
}

#[derive(Debug)]
struct Counters {
    requests: u64,
    res2xx: u64,
    res4xx: u64,
    res5xx: u64,
    inflight: HashSet<String>,
    last_activity: Instant,
}

impl Counters {
    fn new() -> Self {
        Self {
            requests: 0,
            res2xx: 0,
            res4xx: 0,
            res5xx: 0,
            inflight: HashSet::new(),
            last_activity: Instant::now(),
        }
    }

    fn register(&mut self, event: &TapEvent, now: Instant) {
        match event {
            TapEvent::RequestWillBeSent { request_id } => {
                if self.inflight.insert(request_id.clone()) {
                    self.requests += 1;
                }
            }
            TapEvent::ResponseReceived(record) => match record.status {
                200..=299 => self.res2xx += 1,
                400..=499 => self.res4xx += 1,
                500..=599 => self.res5xx += 1,
                _ => {}
            },
            TapEvent::LoadingFinished { request_id } | TapEvent::LoadingFailed { request_id } => {
                self.inflight.remove(request_id);
            }
        }
        self.last_activity = now;
    }

    fn snapshot(&self, config: &TapConfig, now: Instant) -> NetworkSnapshot {
        let since_last = now.saturating_duration_since(self.last_activity).as_millis() as u64;
        let inflight = self.inflight.len() as u64;
        NetworkSnapshot {
            req: self.requests,
            res2xx: self.res2xx,
            res4xx: self.res4xx,
            res5xx: self.res5xx,
            inflight,
            quiet: inflight == 0 && since_last >= config.quiet_window_ms,
            since_last_activity_ms: since_last,
        }
    }
}

/// Per-invocation tap. Fed by the CDP session's network event pump.
pub struct NetworkTapLight {
    config: TapConfig,
    counters: Mutex<Counters>,
    responses: Mutex<ResponseRing>,
}

impl Default for NetworkTapLight {
    fn default() -> Self {
        Self::new(TapConfig::default())
    }
}

impl NetworkTapLight {
    pub fn new(config: TapConfig) -> Self {
        let ring = ResponseRing::new(config.response_capacity);
        Self {
            config,
            counters: Mutex::new(Counters::new()),
            responses: Mutex::new(ring),
        }
    }

    pub fn config(&self) -> &TapConfig {
        &self.config
    }

    pub async fn ingest(&self, event: TapEvent) {
        let now = Instant::now();
        self.counters.lock().await.register(&event, now);
        if let TapEvent::ResponseReceived(record) = event {
            self.responses.lock().await.push(record);
        }
    }

    pub async fn snapshot(&self) -> NetworkSnapshot {
        self.counters.lock().await.snapshot(&self.config, Instant::now())
    }

    /// Copy of the buffered responses, oldest first.
    pub async fn responses(&self) -> ResponseRing {
        self.responses.lock().await.clone()
    }

    /// Polls until no request has been in flight for the quiet window.
    pub async fn wait_for_idle(&self, timeout: Duration) -> Result<NetworkSnapshot, TapError> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            let snapshot = self.snapshot().await;
            if snapshot.quiet {
                debug!(
                    requests = snapshot.req,
                    since_last_activity_ms = snapshot.since_last_activity_ms,
                    "network idle"
                );
                return Ok(snapshot);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TapError::IdleTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                    inflight: snapshot.inflight,
                });
            }
            sleep(poll.min(deadline - now)).await;
        }
    }
}
