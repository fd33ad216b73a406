use async_trait::async_trait;
use parking_lot::Mutex;
use soulact_core_types::SessionId;

use crate::{
    now_ms, ResolvedSession, SessionRecord, SessionResolver, StateError, StateTables, TargetSnapshot,
    TargetStore,
};

/// Process-local store for tests.
#[derive(Default)]
pub struct InMemoryStateStore {
    tables: Mutex<StateTables>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session up front, as if an earlier invocation created it.
    pub fn with_session(self, id: &str, origin: &str) -> Self {
        let now = now_ms();
        self.tables.lock().sessions.insert(
            SessionId::from(id),
            SessionRecord {
                session_id: SessionId::from(id),
                cdp_origin: origin.to_string(),
                created_at: now,
                last_used_at: now,
            },
        );
        self
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.tables.lock().sessions.values().cloned().collect()
    }

    pub fn targets(&self) -> Vec<TargetSnapshot> {
        self.tables.lock().targets.values().cloned().collect()
    }
}

#[async_trait]
impl SessionResolver for InMemoryStateStore {
    async fn resolve(
        &self,
        session_hint: Option<&str>,
        target_hint: Option<&str>,
        default_origin: &str,
    ) -> Result<ResolvedSession, StateError> {
        self.tables
            .lock()
            .resolve(session_hint, target_hint, default_origin, now_ms())
    }
}

#[async_trait]
impl TargetStore for InMemoryStateStore {
    async fn save(&self, snapshot: TargetSnapshot) -> Result<(), StateError> {
        self.tables.lock().save(snapshot);
        Ok(())
    }

    async fn latest_for_session(&self, session: &SessionId) -> Result<Option<TargetSnapshot>, StateError> {
        Ok(self.tables.lock().latest_for_session(session))
    }
}
