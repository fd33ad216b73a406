//! Core data types for action execution

use std::path::PathBuf;
use std::time::Duration;

use action_locator::Resolution;
use cdp_adapter::{CdpConfig, CdpSession, NetworkMonitor, RemoteObjectId};
use network_tap_light::config::TapConfig;
use serde_json::Value;
use soulact_core_types::{ActionId, ActionKind, TargetId};

use crate::report::VerbOutcome;

/// Fixed interval between predicate polls.
pub const POLL_INTERVAL_MS: u64 = 200;

/// Engine tunables for one invocation.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub cdp: CdpConfig,
    pub download_dir: PathBuf,
    /// Bounds on the best-effort settle after the native action.
    pub settle_min_ms: u64,
    pub settle_max_ms: u64,
    pub network_quiet_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cdp: CdpConfig::default(),
            download_dir: PathBuf::from("downloads"),
            settle_min_ms: 200,
            settle_max_ms: 1000,
            network_quiet_ms: 500,
            poll_interval_ms: POLL_INTERVAL_MS,
        }
    }
}

impl EngineConfig {
    pub fn tap_config(&self) -> TapConfig {
        TapConfig {
            quiet_window_ms: self.network_quiet_ms,
            ..TapConfig::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Settle budget for a caller timeout, clamped to the settle bounds.
    pub fn settle_budget(&self, timeout: Duration) -> Duration {
        let ms = (timeout.as_millis() as u64).clamp(self.settle_min_ms, self.settle_max_ms.max(self.settle_min_ms));
        Duration::from_millis(ms)
    }
}

/// What the verb acts on, resolved before any page mutation.
#[derive(Debug, Clone)]
pub enum ActionTarget {
    /// No query was given (keypress on body, dialog without trigger,
    /// drag-drop by selectors).
    None,
    Query(Resolution),
    /// Backend node id from `--handle`.
    Handle(i64),
}

impl ActionTarget {
    pub fn resolution(&self) -> Option<&Resolution> {
        match self {
            ActionTarget::Query(resolution) => Some(resolution),
            _ => None,
        }
    }

    pub fn match_count(&self) -> Option<usize> {
        self.resolution().map(Resolution::match_count)
    }

    pub fn picked_index(&self) -> Option<usize> {
        self.resolution().map(|resolution| resolution.picked)
    }
}

/// Execution context handed to every executor.
pub struct ExecCtx<'a> {
    pub action_id: ActionId,
    pub kind: ActionKind,
    pub session: &'a CdpSession,
    pub config: &'a EngineConfig,
    /// Caller budget for event races and verification polls.
    pub timeout: Duration,
    /// Present when the invocation taps network traffic.
    pub monitor: Option<&'a NetworkMonitor>,
}

/// Result of one executor run.
#[derive(Debug, Clone)]
pub struct Executed {
    pub outcome: VerbOutcome,
    /// Set when the verb moved the caller to another tab.
    pub target_after: Option<TargetId>,
    /// Verb-specific proof details.
    pub details: Value,
}

impl Executed {
    pub fn new(outcome: VerbOutcome) -> Self {
        Self {
            outcome,
            target_after: None,
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Element handle used for ARIA tracking, if the target has one.
pub async fn tracked_element(
    session: &CdpSession,
    target: &ActionTarget,
) -> Result<Option<RemoteObjectId>, soulact_core_types::ActError> {
    use action_locator::errors::AdapterResultExt;
    match target {
        ActionTarget::None => Ok(None),
        ActionTarget::Query(resolution) => {
            action_locator::QueryResolver::new(session)
                .element(resolution, false)
                .await
        }
        ActionTarget::Handle(node) => session
            .resolve_node(*node)
            .await
            .map(Some)
            .or_internal("resolve_handle"),
    }
}
