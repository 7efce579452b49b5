//! Session registry: explicit, caller-owned lookup of live sessions.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::session::{SessionStatus, SyncSession};

/// Registry key: `(branch_id, module_id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey {
    pub branch_id: String,
    pub module_id: String,
}

impl SessionKey {
    pub fn new(branch_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            module_id: module_id.into(),
        }
    }

    pub fn of(session: &SyncSession) -> Self {
        Self::new(session.branch_id(), session.module_id())
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.branch_id, self.module_id)
    }
}

/// Thread-safe map of sessions keyed by branch and module.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<BTreeMap<SessionKey, SyncSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `session`, returning the session previously registered under the
    /// same key.
    pub async fn register(&self, session: SyncSession) -> Option<SyncSession> {
        let key = SessionKey::of(&session);
        info!(session = %key, "Registering session");
        self.sessions.write().await.insert(key, session)
    }

    pub async fn get(&self, branch_id: &str, module_id: &str) -> Option<SyncSession> {
        self.sessions
            .read()
            .await
            .get(&SessionKey::new(branch_id, module_id))
            .cloned()
    }

    /// Remove a session without disconnecting it.
    pub async fn remove(&self, branch_id: &str, module_id: &str) -> Option<SyncSession> {
        let key = SessionKey::new(branch_id, module_id);
        let removed = self.sessions.write().await.remove(&key);
        if removed.is_some() {
            debug!(session = %key, "Session removed");
        }
        removed
    }

    pub async fn list(&self) -> Vec<SessionKey> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Current status of every registered session.
    pub async fn statuses(&self) -> Vec<(SessionKey, SessionStatus)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(key, session)| (key.clone(), session.status()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Disconnect and remove every session.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<SyncSession> = {
            let mut sessions = self.sessions.write().await;
            std::mem::take(&mut *sessions).into_values().collect()
        };
        for session in sessions {
            session.disconnect().await;
        }
    }
}
