// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Application state management.
//!
//! The session driver publishes a snapshot after every change. Readers take
//! cheap copies and can wait on the revision counter for the next change.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

use crate::bluetooth::{ConnectionState, MessageLogEntry, PeripheralHandle, RadioPowerState};
use crate::storage::CommandHistory;

/// Observable view of the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub power: RadioPowerState,
    pub connection: ConnectionState,
    pub status: String,
    pub scanning: bool,
    pub devices: Vec<PeripheralHandle>,
    pub peripheral: Option<PeripheralHandle>,
    pub write_bound: bool,
    pub notify_bound: bool,
    pub messages: Vec<MessageLogEntry>,
}

impl SessionSnapshot {
    pub fn is_ready(&self) -> bool {
        self.connection == ConnectionState::Ready
    }
}

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    /// Latest published session snapshot.
    snapshot: RwLock<SessionSnapshot>,

    /// Commands sent successfully.
    history: RwLock<CommandHistory>,

    /// Bumped on every publish.
    revision: watch::Sender<u64>,
}

impl Default for AppState {
    fn default() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            snapshot: RwLock::new(SessionSnapshot::default()),
            history: RwLock::new(CommandHistory::new()),
            revision,
        }
    }
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the snapshot and wake subscribers if anything changed.
    pub fn publish(&self, snapshot: SessionSnapshot) {
        {
            let mut current = self.snapshot.write();
            if *current == snapshot {
                return;
            }
            *current = snapshot;
        }
        self.revision.send_modify(|rev| *rev += 1);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().clone()
    }

    pub fn get_status(&self) -> String {
        self.snapshot.read().status.clone()
    }

    pub fn get_connection(&self) -> ConnectionState {
        self.snapshot.read().connection.clone()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Receiver that observes each publish.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn record_command(&self, command: &str) {
        self.history.write().record(command);
    }

    /// Sent commands, most recent first.
    pub fn get_history(&self) -> Vec<String> {
        self.history.read().iter().map(str::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_bumps_revision_on_change() {
        let state = AppState::new();
        let mut rx = state.subscribe();

        let snapshot = SessionSnapshot {
            status: "Scanning...".to_string(),
            scanning: true,
            ..Default::default()
        };
        state.publish(snapshot.clone());
        assert_eq!(state.revision(), 1);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        // Identical snapshot is not a change
        state.publish(snapshot);
        assert_eq!(state.revision(), 1);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(state.get_status(), "Scanning...");
    }

    #[test]
    fn test_history_through_state() {
        let state = AppState::new();
        state.record_command("AT");
        state.record_command("AT+VERS?");
        assert_eq!(state.get_history(), vec!["AT+VERS?", "AT"]);
    }
}
