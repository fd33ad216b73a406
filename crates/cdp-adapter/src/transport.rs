use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CdpConfig;
use crate::discovery::resolve_ws_url;
use crate::error::{AdapterError, AdapterErrorKind};

#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError>;

    /// New receiver for every event seen after this call.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    async fn shutdown(&self);
}

/// Raw chromiumoxide connection to an already-running browser.
pub struct ChromiumTransport {
    runtime: RuntimeState,
    deadline: Duration,
}

impl ChromiumTransport {
    pub async fn connect(cfg: &CdpConfig) -> Result<Self, AdapterError> {
        let ws_url = resolve_ws_url(
            &cfg.origin,
            Duration::from_millis(cfg.discovery_timeout_ms),
        )
        .await?;
        let runtime = RuntimeState::start(&ws_url, cfg.event_buffer).await?;
        Ok(Self {
            runtime,
            deadline: Duration::from_millis(cfg.default_deadline_ms),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.runtime.is_alive()
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        self.runtime
            .send_internal(target, method, params, self.deadline)
            .await
            .map_err(|err| err.with_method(method))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.runtime.events_tx.subscribe()
    }

    async fn shutdown(&self) {
        self.runtime.stop();
    }
}

struct ControlMessage {
    target: CommandTarget,
    method: String,
    params: Value,
    responder: oneshot::Sender<Result<Value, AdapterError>>,
}

struct RuntimeState {
    command_tx: mpsc::Sender<ControlMessage>,
    events_tx: broadcast::Sender<TransportEvent>,
    loop_task: JoinHandle<()>,
    alive: Arc<AtomicBool>,
}

impl RuntimeState {
    async fn start(ws_url: &str, event_buffer: usize) -> Result<Self, AdapterError> {
        let conn = Connection::<CdpEventMessage>::connect(ws_url)
            .await
            .map_err(|err| AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let (events_tx, _) = broadcast::channel(event_buffer.max(16));

        let alive = Arc::new(AtomicBool::new(true));
        let loop_alive = alive.clone();
        let loop_events = events_tx.clone();

        let loop_task = tokio::spawn(async move {
            let result = Self::run_loop(conn, command_rx, loop_events).await;
            loop_alive.store(false, Ordering::Relaxed);
            if let Err(err) = result {
                error!(target: "cdp-transport", ?err, "transport loop terminated with error");
            }
        });

        info!(target: "cdp-transport", url = %ws_url, "devtools connection established");

        Ok(Self {
            command_tx,
            events_tx,
            loop_task,
            alive,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        if self.alive.swap(false, Ordering::Relaxed) {
            debug!(target: "cdp-transport", "closing devtools connection");
        }
        self.loop_task.abort();
    }

    async fn send_internal(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, AdapterError> {
        if !self.is_alive() {
            return Err(AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint("devtools connection is closed"));
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        let message = ControlMessage {
            target,
            method: method.to_string(),
            params,
            responder: resp_tx,
        };

        self.command_tx
            .send(message)
            .await
            .map_err(|err| AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()))?;

        match tokio::time::timeout(deadline, resp_rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint("command response channel closed")),
            Err(_) => Err(AdapterError::new(AdapterErrorKind::Timeout)
                .with_hint(format!("no response within {}ms", deadline.as_millis()))),
        }
    }

    async fn run_loop(
        mut conn: Connection<CdpEventMessage>,
        mut command_rx: mpsc::Receiver<ControlMessage>,
        events_tx: broadcast::Sender<TransportEvent>,
    ) -> Result<(), AdapterError> {
        let mut inflight: HashMap<CallId, oneshot::Sender<Result<Value, AdapterError>>> =
            HashMap::new();

        loop {
            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    Self::handle_command(&mut conn, cmd, &mut inflight)?;
                }
                message = conn.next() => {
                    match message {
                        Some(Ok(Message::Response(resp))) => {
                            Self::handle_response(resp, &mut inflight);
                        }
                        Some(Ok(Message::Event(event))) => {
                            if let Err(err) = Self::handle_event(event, &events_tx) {
                                warn!(target: "cdp-transport", ?err, "failed to forward event");
                            }
                        }
                        Some(Err(err)) => {
                            let adapter_err = Self::map_cdp_error(err);
                            for (_, sender) in inflight.drain() {
                                let _ = sender.send(Err(adapter_err.clone()));
                            }
                            return Err(adapter_err);
                        }
                        None => {
                            let err = AdapterError::new(AdapterErrorKind::CdpIo)
                                .with_hint("cdp connection closed");
                            for (_, sender) in inflight.drain() {
                                let _ = sender.send(Err(err.clone()));
                            }
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn handle_command(
        conn: &mut Connection<CdpEventMessage>,
        cmd: ControlMessage,
        inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, AdapterError>>>,
    ) -> Result<(), AdapterError> {
        let session = match cmd.target {
            CommandTarget::Browser => None,
            CommandTarget::Session(session_id) => Some(CdpSessionId::from(session_id)),
        };

        let method_id: MethodId = cmd.method.clone().into();
        match conn.submit_command(method_id, session, cmd.params) {
            Ok(call_id) => {
                inflight.insert(call_id, cmd.responder);
                Ok(())
            }
            Err(err) => {
                let adapter_err =
                    AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string());
                let _ = cmd.responder.send(Err(adapter_err.clone()));
                Err(adapter_err)
            }
        }
    }

    fn handle_response(
        resp: Response,
        inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, AdapterError>>>,
    ) {
        let entry = inflight.remove(&resp.id);
        let result = extract_payload(resp.result, resp.error.map(|e| (e.code, e.message)));

        if let Some(sender) = entry {
            let _ = sender.send(result);
        }
    }

    fn handle_event(
        event: CdpEventMessage,
        events_tx: &broadcast::Sender<TransportEvent>,
    ) -> Result<(), AdapterError> {
        let raw: CdpJsonEventMessage = event.try_into().map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("failed to decode cdp event: {err}"))
        })?;

        let payload = TransportEvent {
            method: raw.method.into_owned(),
            params: raw.params,
            session_id: raw.session_id,
        };

        // No subscribers is not an error; events are only consumed while a waiter is active.
        let _ = events_tx.send(payload);
        Ok(())
    }

    fn map_cdp_error(err: CdpError) -> AdapterError {
        let hint = err.to_string();
        match err {
            CdpError::Timeout => AdapterError::new(AdapterErrorKind::Timeout)
                .with_hint(hint)
                .retriable(true),
            CdpError::JavascriptException(_) => {
                AdapterError::new(AdapterErrorKind::ScriptException).with_hint(hint)
            }
            CdpError::Serde(_) | CdpError::FrameNotFound(_) => {
                AdapterError::new(AdapterErrorKind::Internal).with_hint(hint)
            }
            _ => AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint(hint)
                .retriable(true),
        }
    }
}

/// Splits a CDP response into its result or a protocol error.
pub(crate) fn extract_payload(
    result: Option<Value>,
    error: Option<(i64, String)>,
) -> Result<Value, AdapterError> {
    if let Some(result) = result {
        Ok(result)
    } else if let Some((code, message)) = error {
        let retriable = code >= 500;
        Err(AdapterError::new(AdapterErrorKind::Protocol)
            .with_hint(format!("cdp error {}: {}", code, message))
            .with_data(serde_json::json!({ "code": code }))
            .retriable(retriable))
    } else {
        Err(AdapterError::new(AdapterErrorKind::Internal).with_hint("empty cdp response"))
    }
}

impl Drop for RuntimeState {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
    }
}
