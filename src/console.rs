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

//! Line-oriented console front end.
//!
//! Reads commands from stdin, hands them to the session driver and prints
//! status changes and new messages as they are published.

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::bluetooth::{
    classify, Direction, MessageLogEntry, MessagePayload, PeripheralHandle, PeripheralId,
};
use crate::events::SessionHandle;
use crate::state::{AppState, SessionSnapshot};

const HELP: &str = "\
Commands:
  scan               start scanning (clears the device list)
  stop               stop scanning
  devices            list discovered devices
  connect <n|addr>   connect by list number or address
  disconnect         close the connection
  send <text>        send text (any other line is sent as typed)
  history            recently sent commands
  status             show session status
  quit               exit";

/// Which peripheral a `connect` refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// Zero-based position in the device list.
    Index(usize),
    Id(PeripheralId),
}

impl ConnectTarget {
    pub fn resolve(&self, devices: &[PeripheralHandle]) -> Option<PeripheralId> {
        match self {
            ConnectTarget::Index(index) => devices.get(*index).map(|d| d.id.clone()),
            ConnectTarget::Id(id) => Some(id.clone()),
        }
    }
}

/// One line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Scan,
    Stop,
    Devices,
    Connect(ConnectTarget),
    Disconnect,
    Send(String),
    History,
    Status,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse a line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let (word, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (trimmed, ""),
        };

        let command = match (word.to_ascii_lowercase().as_str(), rest) {
            ("scan", "") => ConsoleCommand::Scan,
            ("stop", "") => ConsoleCommand::Stop,
            ("devices", "") => ConsoleCommand::Devices,
            ("disconnect", "") => ConsoleCommand::Disconnect,
            ("history", "") => ConsoleCommand::History,
            ("status", "") => ConsoleCommand::Status,
            ("help", "") => ConsoleCommand::Help,
            ("quit", "") | ("exit", "") => ConsoleCommand::Quit,
            ("connect", "") => ConsoleCommand::Help,
            ("connect", target) => ConsoleCommand::Connect(match target.parse::<usize>() {
                Ok(n) if n >= 1 => ConnectTarget::Index(n - 1),
                _ => ConnectTarget::Id(PeripheralId::new(target)),
            }),
            ("send", text) if !text.is_empty() => ConsoleCommand::Send(text.to_string()),
            _ => ConsoleCommand::Send(trimmed.to_string()),
        };
        Some(command)
    }
}

/// Render a message log entry with its classification.
pub fn format_entry(entry: &MessageLogEntry) -> String {
    let time = entry.at.format("%H:%M:%S");
    match (&entry.direction, &entry.payload) {
        (Direction::Sent, payload) => format!("[{}] > {}", time, payload),
        (Direction::Received, MessagePayload::Text(text)) => {
            let response = classify(text);
            format!(
                "[{}] < [{}] {}",
                time,
                response.category.as_str(),
                response.display_text
            )
        }
        (Direction::Received, payload) => format!("[{}] < {}", time, payload),
    }
}

pub fn format_devices(devices: &[PeripheralHandle]) -> String {
    if devices.is_empty() {
        return "No devices found".to_string();
    }
    devices
        .iter()
        .enumerate()
        .map(|(i, device)| {
            let rssi = device
                .rssi
                .map(|r| format!("{} dBm", r))
                .unwrap_or_else(|| "-".to_string());
            format!("{:>3}. {} ({}) {}", i + 1, device.display_name(), device.id, rssi)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_status(snapshot: &SessionSnapshot) -> String {
    let mut out = format!(
        "Radio: {}\nState: {}\nStatus: {}",
        snapshot.power,
        snapshot.connection.as_str(),
        snapshot.status
    );
    if let Some(peripheral) = &snapshot.peripheral {
        out.push_str(&format!(
            "\nDevice: {} ({})",
            peripheral.display_name(),
            peripheral.id
        ));
    }
    if snapshot.scanning {
        out.push_str(&format!("\nScanning, {} device(s) so far", snapshot.devices.len()));
    }
    out
}

/// Print status changes and new log entries until the state is dropped.
async fn print_updates(state: Arc<AppState>) {
    let mut rx = state.subscribe();
    let mut last_status = String::new();
    let mut next_seq = 0u64;

    while rx.changed().await.is_ok() {
        let snapshot = state.snapshot();
        if snapshot.status != last_status {
            println!("-- {}", snapshot.status);
            last_status = snapshot.status.clone();
        }
        let seen = next_seq;
        for entry in snapshot.messages.iter().filter(|e| e.seq >= seen) {
            println!("{}", format_entry(entry));
            next_seq = entry.seq + 1;
        }
    }
}

/// Run the console until `quit` or end of input.
pub async fn run(handle: SessionHandle, state: Arc<AppState>) -> Result<()> {
    let printer = tokio::spawn(print_updates(state.clone()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{}", HELP);
    while let Some(line) = lines.next_line().await? {
        let Some(command) = ConsoleCommand::parse(&line) else {
            continue;
        };
        debug!("Console command: {:?}", command);

        match command {
            ConsoleCommand::Scan => handle.start_scan(),
            ConsoleCommand::Stop => handle.stop_scan(),
            ConsoleCommand::Devices => println!("{}", format_devices(&state.snapshot().devices)),
            ConsoleCommand::Connect(target) => {
                match target.resolve(&state.snapshot().devices) {
                    Some(id) => handle.connect(id),
                    None => println!("No such device, run 'devices' to list them"),
                }
            }
            ConsoleCommand::Disconnect => handle.disconnect(),
            ConsoleCommand::Send(text) => handle.send(text),
            ConsoleCommand::History => {
                for (i, command) in state.get_history().iter().enumerate() {
                    println!("{:>3}. {}", i + 1, command);
                }
            }
            ConsoleCommand::Status => println!("{}", format_status(&state.snapshot())),
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => {
                info!("Quit requested");
                break;
            }
        }
    }

    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    #[test]
    fn test_parse_keywords() {
        assert_eq!(ConsoleCommand::parse("scan"), Some(ConsoleCommand::Scan));
        assert_eq!(ConsoleCommand::parse("  STOP \n"), Some(ConsoleCommand::Stop));
        assert_eq!(ConsoleCommand::parse("quit"), Some(ConsoleCommand::Quit));
        assert_eq!(ConsoleCommand::parse(""), None);
        assert_eq!(ConsoleCommand::parse("   "), None);
    }

    #[test]
    fn test_parse_connect_targets() {
        assert_eq!(
            ConsoleCommand::parse("connect 2"),
            Some(ConsoleCommand::Connect(ConnectTarget::Index(1)))
        );
        assert_eq!(
            ConsoleCommand::parse("connect AA:BB:CC:DD:EE:FF"),
            Some(ConsoleCommand::Connect(ConnectTarget::Id(PeripheralId::new(
                "AA:BB:CC:DD:EE:FF"
            ))))
        );
        assert_eq!(ConsoleCommand::parse("connect"), Some(ConsoleCommand::Help));
    }

    #[test]
    fn test_other_lines_are_sent() {
        assert_eq!(
            ConsoleCommand::parse("send AT+NAME?"),
            Some(ConsoleCommand::Send("AT+NAME?".to_string()))
        );
        assert_eq!(
            ConsoleCommand::parse("AT+BAUD4"),
            Some(ConsoleCommand::Send("AT+BAUD4".to_string()))
        );
        // A keyword with trailing text is not a command
        assert_eq!(
            ConsoleCommand::parse("scan now"),
            Some(ConsoleCommand::Send("scan now".to_string()))
        );
    }

    #[test]
    fn test_resolve_index() {
        let devices = vec![PeripheralHandle::new(PeripheralId::new("p1"), None, None)];
        assert_eq!(
            ConnectTarget::Index(0).resolve(&devices),
            Some(PeripheralId::new("p1"))
        );
        assert_eq!(ConnectTarget::Index(1).resolve(&devices), None);
    }

    #[test]
    fn test_format_received_entry_is_classified() {
        let entry = MessageLogEntry {
            seq: 0,
            direction: Direction::Received,
            payload: MessagePayload::Text("OK+NAME:foo".to_string()),
            at: Local::now(),
        };
        assert!(format_entry(&entry).ends_with("< [INFO] OK+NAME:foo"));

        let entry = MessageLogEntry {
            direction: Direction::Sent,
            payload: MessagePayload::Text("AT".to_string()),
            ..entry
        };
        assert!(format_entry(&entry).ends_with("> AT"));
    }

    #[test]
    fn test_format_devices() {
        let devices = vec![PeripheralHandle::new(
            PeripheralId::new("AA:BB"),
            Some("HMSoft".to_string()),
            Some(-60),
        )];
        assert_eq!(format_devices(&devices), "  1. HMSoft (AA:BB) -60 dBm");
        assert_eq!(format_devices(&[]), "No devices found");
    }
}
