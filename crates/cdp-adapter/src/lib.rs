//! Chromium DevTools Protocol adapter.
//!
//! Connects to an already-running browser, attaches one flattened CDP session
//! to a page target per invocation, and exposes frame-scoped evaluation in
//! isolated worlds plus the raw input/event plumbing executors build on.

pub mod discovery;
pub mod events;
pub mod input;
pub mod network;
pub mod session;
pub mod targets;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub mod error {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use thiserror::Error;

    /// High-level error categories surfaced by the adapter.
    #[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AdapterErrorKind {
        #[error("command timed out")]
        Timeout,
        #[error("cdp i/o failure")]
        CdpIo,
        #[error("cdp protocol error")]
        Protocol,
        #[error("script raised an exception")]
        ScriptException,
        #[error("endpoint discovery failed")]
        Discovery,
        #[error("internal error")]
        Internal,
    }

    /// Enriched error metadata passed back to higher layers.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AdapterError {
        pub kind: AdapterErrorKind,
        pub hint: Option<String>,
        pub retriable: bool,
        pub method: Option<String>,
        pub data: Option<serde_json::Value>,
    }

    impl fmt::Display for AdapterError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(method) = &self.method {
                write!(f, " ({method})")?;
            }
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for AdapterError {}

    impl AdapterError {
        pub fn new(kind: AdapterErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                retriable: false,
                method: None,
                data: None,
            }
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn retriable(mut self, flag: bool) -> Self {
            self.retriable = flag;
            self
        }

        pub fn with_method(mut self, method: impl Into<String>) -> Self {
            if self.method.is_none() {
                self.method = Some(method.into());
            }
            self
        }

        pub fn with_data(mut self, data: serde_json::Value) -> Self {
            self.data = Some(data);
            self
        }

        /// The execution context behind a cached world no longer exists
        /// (navigation, frame detach).
        pub fn is_stale_context(&self) -> bool {
            let Some(hint) = &self.hint else {
                return false;
            };
            hint.contains("Cannot find context with specified id")
                || hint.contains("Execution context was destroyed")
                || hint.contains("Cannot find default execution context")
                || hint.contains("Inspected target navigated or closed")
        }
    }
}

pub mod config {
    use serde::{Deserialize, Serialize};

    pub const DEFAULT_CDP_ORIGIN: &str = "http://127.0.0.1:9222";
    pub const DEFAULT_WORLD_NAME: &str = "soulact";

    /// Connection settings for one invocation.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct CdpConfig {
        /// `http(s)://host:port` of the DevTools endpoint, or a `ws://` URL.
        pub origin: String,
        pub default_deadline_ms: u64,
        pub discovery_timeout_ms: u64,
        pub world_name: String,
        pub event_buffer: usize,
    }

    impl Default for CdpConfig {
        fn default() -> Self {
            Self {
                origin: DEFAULT_CDP_ORIGIN.to_string(),
                default_deadline_ms: 15_000,
                discovery_timeout_ms: 5_000,
                world_name: DEFAULT_WORLD_NAME.to_string(),
                event_buffer: 1024,
            }
        }
    }

    impl CdpConfig {
        pub fn with_origin(origin: impl Into<String>) -> Self {
            Self {
                origin: origin.into(),
                ..Self::default()
            }
        }
    }
}

pub use config::CdpConfig;
pub use error::{AdapterError, AdapterErrorKind};
pub use events::EventStream;
pub use input::{KeyChord, Point};
pub use network::NetworkMonitor;
pub use session::{CdpSession, Domain, FrameNode, FrameTree, PageInfo, RemoteObjectId, WorldCache};
pub use targets::{list_pages, list_targets, TargetInfo};
pub use transport::{CdpTransport, ChromiumTransport, CommandTarget, TransportEvent};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_context_detection_matches_cdp_messages() {
        let err = AdapterError::new(AdapterErrorKind::Protocol)
            .with_hint("cdp error -32000: Cannot find context with specified id");
        assert!(err.is_stale_context());

        let other = AdapterError::new(AdapterErrorKind::Protocol)
            .with_hint("cdp error -32000: No node with given id found");
        assert!(!other.is_stale_context());
    }

    #[test]
    fn display_includes_method_and_hint() {
        let err = AdapterError::new(AdapterErrorKind::Timeout)
            .with_method("DOM.getBoxModel")
            .with_hint("command timed out");
        assert_eq!(
            err.to_string(),
            "command timed out (DOM.getBoxModel): command timed out"
        );
    }

    #[test]
    fn first_method_wins() {
        let err = AdapterError::new(AdapterErrorKind::CdpIo)
            .with_method("Runtime.evaluate")
            .with_method("outer");
        assert_eq!(err.method.as_deref(), Some("Runtime.evaluate"));
    }
}
