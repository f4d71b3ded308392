//! In-memory table of live upload sessions.

use crate::models::session::UploadSession;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};
use thiserror::Error;
use uuid::Uuid;

/// Shared handle to one session. Lock it only for short, non-async sections.
pub type SessionHandle = Arc<Mutex<UploadSession>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("upload id `{0}` is already registered")]
    Duplicate(Uuid),
}

/// Thread-safe map of `upload_id → session`.
///
/// Sessions are inserted fully built, so readers never see partial state.
/// The registry is injected into the orchestrator; nothing here is global.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session. Refuses to replace an existing id.
    pub fn create(&self, session: UploadSession) -> Result<SessionHandle, RegistryError> {
        let id = session.upload_id;
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        let handle = Arc::new(Mutex::new(session));
        sessions.insert(id, handle.clone());
        Ok(handle)
    }

    pub fn get(&self, upload_id: &Uuid) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(upload_id)
            .cloned()
    }

    pub fn remove(&self, upload_id: &Uuid) -> Option<SessionHandle> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(upload_id)
    }

    pub fn contains(&self, upload_id: &Uuid) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(upload_id)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of sessions whose last activity is older than `cutoff` and that
    /// have no completion or chunk write in flight.
    ///
    /// This is a snapshot; confirm with `remove_if_idle` before acting on it.
    pub fn idle_since(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        let handles: Vec<(Uuid, SessionHandle)> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();

        handles
            .into_iter()
            .filter(|(_, handle)| {
                let session = lock_session(handle);
                !session.is_busy() && session.last_activity_at < cutoff
            })
            .map(|(id, _)| id)
            .collect()
    }

    /// Remove `upload_id` only if it is still idle as of `cutoff`.
    ///
    /// The check and the removal happen under the registry write lock, so a
    /// session touched after an `idle_since` snapshot survives.
    pub fn remove_if_idle(
        &self,
        upload_id: &Uuid,
        cutoff: DateTime<Utc>,
    ) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let idle = {
            let session = lock_session(sessions.get(upload_id)?);
            !session.is_busy() && session.last_activity_at < cutoff
        };
        if idle {
            sessions.remove(upload_id)
        } else {
            None
        }
    }
}

/// Lock a session, recovering the data if a previous holder panicked.
pub fn lock_session(handle: &SessionHandle) -> MutexGuard<'_, UploadSession> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}
