//! Session handles.
//!
//! A driver owns exactly one [`SessionSlot`]. `login` fills it, `logoff`
//! closes it, and every other operation borrows the live session from it.
//! The slot lives behind a `tokio::sync::Mutex` inside the driver so a
//! session is never used by two operations at once.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::{HypervisorError, Result};

/// Identity of an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    pub id: Uuid,
    /// What the session is connected to, e.g. `hmc01.example.com/CPC3`.
    pub target: String,
    pub opened_at: DateTime<Utc>,
}

impl SessionHandle {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            opened_at: Utc::now(),
        }
    }
}

/// Holds the live collaborator session of a driver.
#[derive(Debug)]
pub enum SessionSlot<S> {
    NeverOpened,
    Open { handle: SessionHandle, session: S },
    Closed { handle: SessionHandle },
}

impl<S> Default for SessionSlot<S> {
    fn default() -> Self {
        SessionSlot::NeverOpened
    }
}

impl<S> SessionSlot<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly opened session. A session that was still open is
    /// returned so the caller can close it.
    pub fn open(&mut self, target: impl Into<String>, session: S) -> (SessionHandle, Option<S>) {
        let handle = SessionHandle::new(target);
        let previous = match std::mem::replace(
            self,
            SessionSlot::Open {
                handle: handle.clone(),
                session,
            },
        ) {
            SessionSlot::Open { handle: old, session } => {
                warn!(session_id = %old.id, "Replacing a session that was still open");
                Some(session)
            }
            _ => None,
        };
        (handle, previous)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, SessionSlot::Open { .. })
    }

    pub fn handle(&self) -> Option<&SessionHandle> {
        match self {
            SessionSlot::NeverOpened => None,
            SessionSlot::Open { handle, .. } | SessionSlot::Closed { handle } => Some(handle),
        }
    }

    pub fn get(&self) -> Result<&S> {
        match self {
            SessionSlot::Open { session, .. } => Ok(session),
            SessionSlot::NeverOpened => Err(HypervisorError::NotLoggedIn),
            SessionSlot::Closed { handle } => Err(closed(handle)),
        }
    }

    pub fn get_mut(&mut self) -> Result<&mut S> {
        match self {
            SessionSlot::Open { session, .. } => Ok(session),
            SessionSlot::NeverOpened => Err(HypervisorError::NotLoggedIn),
            SessionSlot::Closed { handle } => Err(closed(handle)),
        }
    }

    /// Invalidate the handle and hand the session back for teardown.
    pub fn close(&mut self) -> Result<S> {
        match std::mem::replace(self, SessionSlot::NeverOpened) {
            SessionSlot::Open { handle, session } => {
                *self = SessionSlot::Closed { handle };
                Ok(session)
            }
            SessionSlot::Closed { handle } => {
                let err = closed(&handle);
                *self = SessionSlot::Closed { handle };
                Err(err)
            }
            SessionSlot::NeverOpened => Err(HypervisorError::NotLoggedIn),
        }
    }
}

fn closed(handle: &SessionHandle) -> HypervisorError {
    HypervisorError::SessionClosed(format!("session {} to {} was logged off", handle.id, handle.target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_use_before_login() {
        let slot: SessionSlot<u32> = SessionSlot::new();
        assert!(matches!(slot.get(), Err(HypervisorError::NotLoggedIn)));
        assert!(slot.handle().is_none());
    }

    #[test]
    fn test_use_after_logoff() {
        let mut slot = SessionSlot::new();
        let (handle, previous) = slot.open("hmc01/CPC3", 7u32);
        assert!(previous.is_none());
        assert_eq!(*slot.get().unwrap(), 7);

        assert_eq!(slot.close().unwrap(), 7);
        assert!(!slot.is_open());
        assert_eq!(slot.handle().unwrap().id, handle.id);
        assert!(matches!(slot.get(), Err(HypervisorError::SessionClosed(_))));
        assert!(matches!(slot.close(), Err(HypervisorError::SessionClosed(_))));
    }

    #[test]
    fn test_relogin_returns_previous_session() {
        let mut slot = SessionSlot::new();
        let (first, _) = slot.open("a", 1u32);
        let (second, previous) = slot.open("a", 2u32);
        assert_eq!(previous, Some(1));
        assert_ne!(first.id, second.id);
        *slot.get_mut().unwrap() += 40;
        assert_eq!(*slot.get().unwrap(), 42);
    }
}
