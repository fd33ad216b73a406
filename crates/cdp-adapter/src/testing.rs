//! Scripted in-memory transport for exercising sessions and executors
//! without a browser.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use soulact_core_types::TargetId;
use tokio::sync::broadcast;

use crate::error::AdapterError;
use crate::session::CdpSession;
use crate::transport::{CdpTransport, CommandTarget, TransportEvent};

pub const FIXTURE_TARGET: &str = "TARGET-1";
pub const FIXTURE_SESSION: &str = "SESSION-1";
pub const FIXTURE_WORLD: &str = "soulact";

type Handler = Arc<dyn Fn(&Value) -> Result<Value, AdapterError> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub target: CommandTarget,
    pub method: String,
    pub params: Value,
}

/// Answers commands from a method → handler table and records every call.
/// Unscripted methods answer `{}`.
pub struct ScriptedTransport {
    handlers: Mutex<HashMap<String, Handler>>,
    follow_ups: Mutex<HashMap<String, VecDeque<TransportEvent>>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
    events_tx: broadcast::Sender<TransportEvent>,
    shut_down: AtomicBool,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            handlers: Mutex::new(HashMap::new()),
            follow_ups: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            events_tx,
            shut_down: AtomicBool::new(false),
        }
    }
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Canned response for `method`, replacing any earlier script.
    pub fn on(&self, method: &str, response: Value) {
        self.on_fn(method, move |_| Ok(response.clone()));
    }

    pub fn on_fn<F>(&self, method: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value, AdapterError> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Holds every answer to `method` back for `delay`.
    pub fn delay(&self, method: &str, delay: Duration) {
        self.delays.lock().insert(method.to_string(), delay);
    }

    /// Broadcasts `event` now.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Broadcasts `event` right after the next `method` command is answered.
    pub fn emit_after(&self, method: &str, event: TransportEvent) {
        self.follow_ups
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(event);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, method: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls.lock().iter().map(|call| call.method.clone()).collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CdpTransport for ScriptedTransport {
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        self.calls.lock().push(RecordedCall {
            target,
            method: method.to_string(),
            params: params.clone(),
        });
        let delay = self.delays.lock().get(method).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let handler = self.handlers.lock().get(method).cloned();
        let result = match handler {
            Some(handler) => handler(&params).map_err(|err| err.with_method(method)),
            None => Ok(json!({})),
        };
        let follow_up = self
            .follow_ups
            .lock()
            .get_mut(method)
            .and_then(|queue| queue.pop_front());
        if let Some(event) = follow_up {
            self.emit(event);
        }
        result
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Event scoped to the fixture session.
pub fn session_event(method: &str, params: Value) -> TransportEvent {
    TransportEvent {
        method: method.to_string(),
        params,
        session_id: Some(FIXTURE_SESSION.to_string()),
    }
}

/// Browser-level event.
pub fn browser_event(method: &str, params: Value) -> TransportEvent {
    TransportEvent {
        method: method.to_string(),
        params,
        session_id: None,
    }
}

/// A page target with a flat frame tree: the first id is the main frame,
/// the rest are its children. Each frame's isolated world gets context id
/// `1000 + position`.
pub struct PageFixture {
    transport: Arc<ScriptedTransport>,
    frames: Vec<String>,
}

impl PageFixture {
    pub fn new(frames: &[&str]) -> Self {
        let transport = ScriptedTransport::new();
        let frames: Vec<String> = frames.iter().map(|id| id.to_string()).collect();

        transport.on("Target.attachToTarget", json!({ "sessionId": FIXTURE_SESSION }));
        transport.on("Page.getFrameTree", frame_tree(&frames));

        let known = frames.clone();
        transport.on_fn("Page.createIsolatedWorld", move |params| {
            let frame = params["frameId"].as_str().unwrap_or_default();
            match known.iter().position(|id| id == frame) {
                Some(pos) => Ok(json!({ "executionContextId": 1000 + pos as i64 })),
                None => Err(AdapterError::new(crate::AdapterErrorKind::Protocol)
                    .with_hint(format!("cdp error -32000: No frame for given id found ({frame})"))),
            }
        });
        transport.on(
            "Target.getTargetInfo",
            json!({ "targetInfo": {
                "targetId": FIXTURE_TARGET,
                "type": "page",
                "url": "https://e.test/",
                "title": "Fixture",
                "attached": true
            }}),
        );
        transport.on(
            "Target.getTargets",
            json!({ "targetInfos": [{
                "targetId": FIXTURE_TARGET,
                "type": "page",
                "url": "https://e.test/",
                "title": "Fixture",
                "attached": true
            }]}),
        );

        Self { transport, frames }
    }

    pub fn transport(&self) -> Arc<ScriptedTransport> {
        self.transport.clone()
    }

    pub fn frame_ids(&self) -> &[String] {
        &self.frames
    }

    /// Frame id for a world context id handed out by the fixture.
    pub fn frame_for_context(&self, context_id: i64) -> Option<&str> {
        let pos = usize::try_from(context_id - 1000).ok()?;
        self.frames.get(pos).map(String::as_str)
    }

    /// Reports a different url and title from `Target.getTargetInfo`.
    pub fn set_page(&self, url: &str, title: &str) {
        self.transport.on(
            "Target.getTargetInfo",
            json!({ "targetInfo": {
                "targetId": FIXTURE_TARGET,
                "type": "page",
                "url": url,
                "title": title,
                "attached": true
            }}),
        );
    }

    /// Routes `Runtime.evaluate` to `handler(frame_id, expression)`.
    ///
    /// The handler returns the evaluated value. For handle evaluations
    /// (`returnByValue: false`) a string value is the object id and `null`
    /// means no element.
    pub fn on_evaluate<F>(&self, handler: F)
    where
        F: Fn(&str, &str) -> Result<Value, AdapterError> + Send + Sync + 'static,
    {
        let frames = self.frames.clone();
        self.transport.on_fn("Runtime.evaluate", move |params| {
            let context_id = params["contextId"].as_i64().unwrap_or_default();
            let frame = usize::try_from(context_id - 1000)
                .ok()
                .and_then(|pos| frames.get(pos))
                .cloned()
                .unwrap_or_default();
            let expression = params["expression"].as_str().unwrap_or_default();
            let value = handler(&frame, expression)?;
            if params["returnByValue"].as_bool().unwrap_or(true) {
                Ok(json!({ "result": { "type": "object", "value": value } }))
            } else if let Some(object_id) = value.as_str() {
                Ok(json!({ "result": { "type": "object", "subtype": "node", "objectId": object_id } }))
            } else {
                Ok(json!({ "result": { "type": "object", "subtype": "null", "value": null } }))
            }
        });
    }

    pub async fn open(&self) -> CdpSession {
        CdpSession::open(
            self.transport.clone(),
            TargetId::from(FIXTURE_TARGET),
            FIXTURE_WORLD,
        )
        .await
        .expect("fixture session opens")
    }
}

fn frame_tree(frames: &[String]) -> Value {
    let Some((main, children)) = frames.split_first() else {
        return json!({});
    };
    let child_frames: Vec<Value> = children
        .iter()
        .map(|id| {
            json!({ "frame": {
                "id": id,
                "parentId": main,
                "url": format!("https://e.test/{}", id.to_lowercase())
            }})
        })
        .collect();
    json!({
        "frameTree": {
            "frame": { "id": main, "url": "https://e.test/" },
            "childFrames": child_frames
        }
    })
}
