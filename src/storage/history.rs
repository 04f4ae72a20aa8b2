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

//! Recently sent commands, most recent first.

use std::collections::VecDeque;
use tracing::debug;

use crate::bluetooth::ble_constants::limits;

/// Bounded command history. Re-sending a command moves it to the front
/// instead of adding a duplicate.
#[derive(Debug, Clone)]
pub struct CommandHistory {
    entries: VecDeque<String>,
    max_entries: usize,
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandHistory {
    /// Create a history with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(limits::COMMAND_HISTORY_CAPACITY)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries),
            max_entries: max_entries.max(1),
        }
    }

    /// Record a sent command. Blank commands are ignored.
    pub fn record(&mut self, command: &str) {
        let command = command.trim();
        if command.is_empty() {
            return;
        }

        if let Some(pos) = self.entries.iter().position(|e| e == command) {
            self.entries.remove(pos);
        }
        self.entries.push_front(command.to_string());

        while self.entries.len() > self.max_entries {
            if let Some(dropped) = self.entries.pop_back() {
                debug!("History full, dropping '{}'", dropped);
            }
        }
    }

    /// Entries, most recent first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_recent_first() {
        let mut history = CommandHistory::new();
        history.record("AT");
        history.record("AT+NAME?");

        assert_eq!(history.iter().collect::<Vec<_>>(), vec!["AT+NAME?", "AT"]);
    }

    #[test]
    fn test_resend_moves_to_front() {
        let mut history = CommandHistory::new();
        history.record("AT");
        history.record("AT+BAUD?");
        history.record(" AT ");

        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().next(), Some("AT"));
        assert_eq!(history.iter().nth(1), Some("AT+BAUD?"));
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut history = CommandHistory::new();
        for i in 0..25 {
            history.record(&format!("AT+{}", i));
        }

        assert_eq!(history.len(), 20);
        assert_eq!(history.iter().next(), Some("AT+24"));
        assert_eq!(history.iter().nth(19), Some("AT+5"));
    }

    #[test]
    fn test_blank_ignored() {
        let mut history = CommandHistory::new();
        history.record("   ");
        assert!(history.is_empty());
    }
}
