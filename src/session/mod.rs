//! Recording sessions - per-source lifecycle state

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::{BackendKind, NativeHandle};

/// Stable integer identifying one logical input stream
pub type SourceId = u32;

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Attached (or failed to attach) and not recording
    Idle,
    /// Backend resources exist but the record bin is not linked yet
    Configuring,
    /// A segment is being written
    Active,
    /// Early stop requested, waiting for the completion
    Stopping,
    /// Unrecoverable; the caller must re-attach
    Faulted,
}

impl SessionState {
    pub fn is_recording(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Stopping)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Configuring => "configuring",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// One source's recording lifecycle
#[derive(Debug)]
pub struct RecordingSession {
    pub source_id: SourceId,
    pub state: SessionState,
    /// Fixed at attach time
    pub backend_kind: BackendKind,
    /// Cause of the current (or last) cut
    pub label: Option<String>,
    pub last_trigger_time: Option<Instant>,
    /// Present between a successful attach and teardown
    pub handle: Option<NativeHandle>,
    /// Why the session faulted, if it did
    pub fault: Option<String>,
    pub completed_segments: u64,
}

impl RecordingSession {
    pub fn new(source_id: SourceId, backend_kind: BackendKind) -> Self {
        Self {
            source_id,
            state: SessionState::Idle,
            backend_kind,
            label: None,
            last_trigger_time: None,
            handle: None,
            fault: None,
            completed_segments: 0,
        }
    }

    pub fn fault(&mut self, reason: impl Into<String>) {
        self.state = SessionState::Faulted;
        self.fault = Some(reason.into());
    }

    /// Re-attach is allowed once the old handle is gone or the session faulted
    pub fn can_reattach(&self) -> bool {
        self.handle.is_none() || self.state == SessionState::Faulted
    }
}

pub type SharedSession = Arc<Mutex<RecordingSession>>;

/// Source id to session map.
///
/// The map lock is held only to look a session up; transitions take the
/// session's own lock, so different sources never block each other.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SourceId, SharedSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing any previous session for the source
    pub fn insert(&self, session: RecordingSession) -> SharedSession {
        let source_id = session.source_id;
        let shared = Arc::new(Mutex::new(session));
        self.sessions.write().insert(source_id, Arc::clone(&shared));
        shared
    }

    pub fn get(&self, source_id: SourceId) -> Option<SharedSession> {
        self.sessions.read().get(&source_id).cloned()
    }

    pub fn remove(&self, source_id: SourceId) -> Option<SharedSession> {
        self.sessions.write().remove(&source_id)
    }

    /// Take every session out, ordered by source id
    pub fn drain(&self) -> Vec<SharedSession> {
        let mut drained: Vec<(SourceId, SharedSession)> = self.sessions.write().drain().collect();
        drained.sort_by_key(|(source_id, _)| *source_id);
        drained.into_iter().map(|(_, session)| session).collect()
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self.sessions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn state(&self, source_id: SourceId) -> Option<SessionState> {
        self.get(source_id).map(|session| session.lock().state)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
