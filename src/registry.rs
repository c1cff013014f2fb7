//! Device presence registry
//!
//! Maps device identity to the live session handle. The daemon dispatch task
//! is the only writer; everything else sees cloned handles or immutable
//! [`PresenceSnapshot`]s, so there is no cross-task mutation to reason about.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::protocol::DeviceId;
use crate::session::{SessionCommand, SessionHandle, SessionState};

/// Immutable view of one device's presence
#[derive(Debug, Clone)]
pub struct PresenceSnapshot {
    /// Device identity
    pub device: DeviceId,
    /// Session id
    pub session_id: String,
    /// Session state at snapshot time
    pub state: SessionState,
    /// When the session was created
    pub connected_at: DateTime<Utc>,
}

/// Device identity → session handle, single-writer
#[derive(Default)]
pub struct Registry {
    sessions: HashMap<DeviceId, SessionHandle>,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked sessions (closed ones included until pruned)
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// The live (non-closed) session for a device, if any
    #[must_use]
    pub fn get(&self, device: &DeviceId) -> Option<&SessionHandle> {
        self.sessions.get(device).filter(|handle| !handle.is_closed())
    }

    /// Track a session, replacing any previous entry for the device
    pub fn insert(&mut self, handle: SessionHandle) {
        let previous = self.sessions.insert(handle.device().clone(), handle);
        if let Some(previous) = previous
            && !previous.is_closed()
        {
            // A live session must never be silently shadowed; the daemon
            // resumes instead of re-inserting, so this is a bug upstream.
            tracing::warn!(device = %previous.device(), "replaced a live session");
        }
    }

    /// Stop tracking a device
    pub fn remove(&mut self, device: &DeviceId) -> Option<SessionHandle> {
        self.sessions.remove(device)
    }

    /// Drop entries whose sessions have closed; returns how many went
    pub fn prune_closed(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, handle| !handle.is_closed());
        before - self.sessions.len()
    }

    /// Immutable presence view across all tracked sessions
    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceSnapshot> {
        self.sessions
            .values()
            .map(|handle| PresenceSnapshot {
                device: handle.device().clone(),
                session_id: handle.session_id().to_string(),
                state: handle.state(),
                connected_at: handle.connected_at(),
            })
            .collect()
    }

    /// Suspend every live session (broker connectivity lost)
    pub async fn suspend_all(&self) {
        for handle in self.sessions.values() {
            handle.send(SessionCommand::Suspend).await;
        }
    }

    /// Resume every suspended session (broker connectivity restored)
    pub async fn resume_all(&self) {
        for handle in self.sessions.values() {
            handle.send(SessionCommand::Resume).await;
        }
    }

    /// Ask every session to close (daemon shutdown)
    pub async fn shutdown_all(&self) {
        for handle in self.sessions.values() {
            handle.send(SessionCommand::Shutdown).await;
        }
    }
}
