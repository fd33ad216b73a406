//! Session resolution and target snapshots shared across invocations.
//!
//! The engine itself keeps nothing between invocations. This crate is the
//! collaborator that remembers which browser a session id points at and
//! which tab was acted on last.

mod json_store;
mod memory;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use soulact_core_types::{ActionId, ActionKind, SessionHandle, SessionId, SessionSource, TargetId};
use thiserror::Error;

pub use json_store::JsonStateStore;
pub use memory::InMemoryStateStore;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path} could not be accessed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown session {0:?}")]
    UnknownSession(String),
}

/// A browser session known to the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub cdp_origin: String,
    pub created_at: u64,
    pub last_used_at: u64,
}

/// Last known state of one tab, written after a successful action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSnapshot {
    pub target_id: TargetId,
    pub session_id: SessionId,
    pub url: String,
    pub title: String,
    pub last_action_id: ActionId,
    pub last_action_kind: ActionKind,
    /// Milliseconds since the Unix epoch.
    pub updated_at: u64,
}

/// Outcome of session resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSession {
    pub handle: SessionHandle,
    pub target_hint: Option<TargetId>,
}

#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// `session_hint` is a stored session id or a CDP origin; without it a
    /// stored `target_hint` implies its session, else a new session is
    /// minted for `default_origin`.
    async fn resolve(
        &self,
        session_hint: Option<&str>,
        target_hint: Option<&str>,
        default_origin: &str,
    ) -> Result<ResolvedSession, StateError>;
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn save(&self, snapshot: TargetSnapshot) -> Result<(), StateError>;

    /// Most recently updated target of `session`.
    async fn latest_for_session(&self, session: &SessionId) -> Result<Option<TargetSnapshot>, StateError>;
}

/// Both halves of the collaborator behind one object.
pub trait StateStore: SessionResolver + TargetStore {}

impl<T: SessionResolver + TargetStore> StateStore for T {}

/// In-memory tables shared by both store implementations.
#[derive(Clone, Debug, Default)]
pub(crate) struct StateTables {
    pub sessions: BTreeMap<SessionId, SessionRecord>,
    pub targets: BTreeMap<TargetId, TargetSnapshot>,
}

pub(crate) fn looks_like_origin(hint: &str) -> bool {
    ["http://", "https://", "ws://", "wss://"]
        .iter()
        .any(|scheme| hint.starts_with(scheme))
}

impl StateTables {
    fn touch(&mut self, id: &SessionId, now: u64) -> Option<SessionRecord> {
        let record = self.sessions.get_mut(id)?;
        record.last_used_at = now;
        Some(record.clone())
    }

    fn mint(&mut self, origin: &str, now: u64) -> SessionRecord {
        let record = SessionRecord {
            session_id: SessionId::new(),
            cdp_origin: origin.to_string(),
            created_at: now,
            last_used_at: now,
        };
        self.sessions.insert(record.session_id.clone(), record.clone());
        record
    }

    pub(crate) fn resolve(
        &mut self,
        session_hint: Option<&str>,
        target_hint: Option<&str>,
        default_origin: &str,
        now: u64,
    ) -> Result<ResolvedSession, StateError> {
        let target_hint = target_hint
            .map(str::trim)
            .filter(|hint| !hint.is_empty())
            .map(TargetId::from);

        if let Some(hint) = session_hint.map(str::trim).filter(|hint| !hint.is_empty()) {
            let id = SessionId::from(hint);
            let record = match self.touch(&id, now) {
                Some(record) => record,
                None if looks_like_origin(hint) => {
                    let existing = self
                        .sessions
                        .values()
                        .filter(|record| record.cdp_origin == hint)
                        .max_by_key(|record| record.last_used_at)
                        .map(|record| record.session_id.clone());
                    match existing.and_then(|id| self.touch(&id, now)) {
                        Some(record) => record,
                        None => self.mint(hint, now),
                    }
                }
                None => return Err(StateError::UnknownSession(hint.to_string())),
            };
            return Ok(ResolvedSession {
                handle: SessionHandle::new(record.session_id, record.cdp_origin, SessionSource::Explicit),
                target_hint,
            });
        }

        if let Some(target) = &target_hint {
            let owner = self.targets.get(target).map(|snapshot| snapshot.session_id.clone());
            if let Some(record) = owner.and_then(|id| self.touch(&id, now)) {
                return Ok(ResolvedSession {
                    handle: SessionHandle::new(
                        record.session_id,
                        record.cdp_origin,
                        SessionSource::TargetInferred,
                    ),
                    target_hint,
                });
            }
        }

        let record = self.mint(default_origin, now);
        Ok(ResolvedSession {
            handle: SessionHandle::new(record.session_id, record.cdp_origin, SessionSource::ImplicitNew),
            target_hint,
        })
    }

    pub(crate) fn save(&mut self, snapshot: TargetSnapshot) {
        self.targets.insert(snapshot.target_id.clone(), snapshot);
    }

    pub(crate) fn latest_for_session(&self, session: &SessionId) -> Option<TargetSnapshot> {
        self.targets
            .values()
            .filter(|snapshot| &snapshot.session_id == session)
            .max_by_key(|snapshot| snapshot.updated_at)
            .cloned()
    }
}

pub fn timestamp_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}

pub fn now_ms() -> u64 {
    timestamp_ms(SystemTime::now())
}
