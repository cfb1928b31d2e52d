//! Per-entity lifecycle state tracking.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use crate::error::{HypervisorError, Result};
use crate::types::EntityState;

/// Records the lifecycle state of every entity a driver touched.
///
/// The backend remains the source of truth; this only rejects sequences the
/// state machine does not allow and lets callers observe progress.
#[derive(Debug, Default)]
pub struct StateTracker {
    states: RwLock<HashMap<String, EntityState>>,
}

fn allowed(from: EntityState, to: EntityState) -> bool {
    use EntityState::*;
    match to {
        Unknown => true,
        LoggedIn => from == Unknown,
        StartRequested | StopRequested => from != Unknown,
        Booting => matches!(from, StartRequested | Active | LoggedIn),
        Active => from == Booting,
        Inactive => from == StopRequested,
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Result<EntityState> {
        let states = self.states.read().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        Ok(states.get(name).copied().unwrap_or(EntityState::Unknown))
    }

    /// Register `name` as managed through the current session.
    pub fn enter(&self, name: &str) -> Result<()> {
        if self.get(name)? == EntityState::Unknown {
            self.transition(name, EntityState::LoggedIn)?;
        }
        Ok(())
    }

    /// Move `name` to `to`, rejecting transitions the state machine forbids.
    pub fn transition(&self, name: &str, to: EntityState) -> Result<EntityState> {
        let mut states = self.states.write().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        let from = states.get(name).copied().unwrap_or(EntityState::Unknown);
        if !allowed(from, to) {
            return Err(HypervisorError::InvalidState(format!(
                "{}: transition {} -> {} is not allowed",
                name, from, to
            )));
        }
        debug!(entity = %name, from = %from, to = %to, "Entity state changed");
        states.insert(name.to_string(), to);
        Ok(from)
    }

    /// Forget every entity, as after `logoff`.
    pub fn reset(&self) -> Result<()> {
        let mut states = self.states.write().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        states.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EntityState::*;

    #[test]
    fn test_start_sequence() {
        let tracker = StateTracker::new();
        assert_eq!(tracker.get("LP01").unwrap(), Unknown);
        tracker.enter("LP01").unwrap();
        tracker.transition("LP01", StartRequested).unwrap();
        tracker.transition("LP01", Booting).unwrap();
        tracker.transition("LP01", Active).unwrap();
        // reboot
        tracker.transition("LP01", Booting).unwrap();
        tracker.transition("LP01", Active).unwrap();
        tracker.transition("LP01", StopRequested).unwrap();
        tracker.transition("LP01", Inactive).unwrap();
        assert_eq!(tracker.get("LP01").unwrap(), Inactive);
    }

    #[test]
    fn test_rejects_skipping_stages() {
        let tracker = StateTracker::new();
        assert!(tracker.transition("LP01", StartRequested).is_err());
        tracker.enter("LP01").unwrap();
        assert!(tracker.transition("LP01", Active).is_err());
        assert!(tracker.transition("LP01", Inactive).is_err());
    }

    #[test]
    fn test_enter_is_idempotent_and_reset_forgets() {
        let tracker = StateTracker::new();
        tracker.enter("G1").unwrap();
        tracker.transition("G1", StopRequested).unwrap();
        tracker.enter("G1").unwrap();
        assert_eq!(tracker.get("G1").unwrap(), StopRequested);
        tracker.reset().unwrap();
        assert_eq!(tracker.get("G1").unwrap(), Unknown);
    }
}
