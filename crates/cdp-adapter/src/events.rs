//! Event subscriptions scoped to one CDP session.

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use crate::transport::TransportEvent;

/// Receives events for one attached session plus browser-level events.
///
/// Create the stream before issuing the command that triggers the awaited
/// event, otherwise the event can be missed.
pub struct EventStream {
    rx: broadcast::Receiver<TransportEvent>,
    session_id: String,
}

impl EventStream {
    pub fn new(rx: broadcast::Receiver<TransportEvent>, session_id: impl Into<String>) -> Self {
        Self {
            rx,
            session_id: session_id.into(),
        }
    }

    fn in_scope(&self, event: &TransportEvent) -> bool {
        match &event.session_id {
            Some(id) => id == &self.session_id,
            None => true,
        }
    }

    /// Next in-scope event, or `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.in_scope(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "cdp-adapter", skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// First in-scope event satisfying `pred` before `deadline`.
    pub async fn next_matching<F>(&mut self, deadline: Instant, mut pred: F) -> Option<TransportEvent>
    where
        F: FnMut(&TransportEvent) -> bool,
    {
        loop {
            match timeout_at(deadline, self.recv()).await {
                Ok(Some(event)) if pred(&event) => return Some(event),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// First `method` event satisfying `pred` within `timeout`.
    pub async fn wait_for<F>(
        &mut self,
        method: &str,
        timeout: Duration,
        mut pred: F,
    ) -> Option<TransportEvent>
    where
        F: FnMut(&TransportEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;
        self.next_matching(deadline, |event| event.method == method && pred(event))
            .await
    }
}
