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

//! Outbound command encoding and inbound notification decoding.
//!
//! Both directions are recorded in a bounded [`MessageLog`]; eviction from the
//! oldest end is the only backpressure on the link.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, warn};

use super::ble_constants::limits;
use super::connection::WriteChannel;
use super::radio::{PeripheralId, RadioAdapter};
use crate::error::{SessionError, SessionResult};

/// Direction of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// Logged message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    /// Text as typed or as decoded from UTF-8.
    Text(String),
    /// Upper-case hex of bytes that were not valid UTF-8.
    Hex(String),
}

impl MessagePayload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessagePayload::Text(text) => Some(text),
            MessagePayload::Hex(_) => None,
        }
    }
}

impl fmt::Display for MessagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessagePayload::Text(text) => f.write_str(text),
            MessagePayload::Hex(hex) => write!(f, "<hex {}>", hex),
        }
    }
}

/// One message log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLogEntry {
    /// Position in append order, never reused.
    pub seq: u64,
    pub direction: Direction,
    pub payload: MessagePayload,
    pub at: DateTime<Local>,
}

/// Append-only log bounded to a fixed capacity.
#[derive(Debug)]
pub struct MessageLog {
    entries: VecDeque<MessageLogEntry>,
    capacity: usize,
    next_seq: u64,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog {
    pub fn new() -> Self {
        Self::with_capacity(limits::MESSAGE_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    /// Append an entry, evicting from the oldest end past capacity.
    pub fn push(&mut self, direction: Direction, payload: MessagePayload) -> &MessageLogEntry {
        let entry = MessageLogEntry {
            seq: self.next_seq,
            direction,
            payload,
            at: Local::now(),
        };
        self.next_seq += 1;
        self.entries.push_back(entry);

        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }

        &self.entries[self.entries.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageLogEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&MessageLogEntry> {
        self.entries.back()
    }
}

/// Bytes appended after each outbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    #[default]
    None,
    Cr,
    Lf,
    Crlf,
}

impl LineEnding {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            LineEnding::None => b"",
            LineEnding::Cr => b"\r",
            LineEnding::Lf => b"\n",
            LineEnding::Crlf => b"\r\n",
        }
    }
}

/// Character set accepted for outbound text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    #[default]
    Utf8,
    Ascii,
}

/// Outbound encoding settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSettings {
    pub line_ending: LineEnding,
    pub encoding: TextEncoding,
    pub max_write_len: usize,
}

impl Default for TrafficSettings {
    fn default() -> Self {
        Self {
            line_ending: LineEnding::None,
            encoding: TextEncoding::Utf8,
            max_write_len: limits::DEFAULT_MAX_WRITE_LEN,
        }
    }
}

impl TrafficSettings {
    /// Encode command text into the bytes put on the air.
    pub fn encode(&self, text: &str) -> SessionResult<Vec<u8>> {
        if self.encoding == TextEncoding::Ascii {
            if let Some(c) = text.chars().find(|c| !c.is_ascii()) {
                return Err(SessionError::EncodingError(format!(
                    "'{}' is not an ASCII character",
                    c
                )));
            }
        }

        let mut bytes = Vec::with_capacity(text.len() + 2);
        bytes.extend_from_slice(text.as_bytes());
        bytes.extend_from_slice(self.line_ending.as_bytes());

        if bytes.is_empty() {
            return Err(SessionError::EncodingError("nothing to send".to_string()));
        }
        Ok(bytes)
    }
}

/// Decode one notification value. Returns `None` for whitespace-only text.
pub fn decode_notification(value: &[u8]) -> Option<MessagePayload> {
    match std::str::from_utf8(value) {
        Ok(text) => {
            let text = text.trim();
            if text.is_empty() {
                None
            } else {
                Some(MessagePayload::Text(text.to_string()))
            }
        }
        Err(e) => {
            debug!("Notification is not UTF-8 ({}), keeping as hex", e);
            Some(MessagePayload::Hex(hex::encode_upper(value)))
        }
    }
}

/// Write target resolved by the state machine.
#[derive(Debug, Clone, Copy)]
pub struct WriteTarget<'a> {
    pub peripheral: &'a PeripheralId,
    pub channel: &'a WriteChannel,
}

/// Moves bytes between the session and the bound characteristics.
#[derive(Debug, Default)]
pub struct TrafficMultiplexer {
    log: MessageLog,
    settings: TrafficSettings,
}

impl TrafficMultiplexer {
    pub fn new(settings: TrafficSettings) -> Self {
        Self {
            log: MessageLog::new(),
            settings,
        }
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// Write a command. The `sent` entry is logged as soon as the writes are
    /// issued, without waiting for any acknowledgement.
    pub fn send(
        &mut self,
        text: &str,
        target: Option<WriteTarget<'_>>,
        radio: &dyn RadioAdapter,
    ) -> SessionResult<()> {
        let target = target.ok_or(SessionError::NotReady)?;
        let bytes = self.settings.encode(text)?;

        let chunk_len = self.settings.max_write_len.max(1);
        let chunks = bytes.chunks(chunk_len);
        let count = chunks.len();
        for chunk in chunks {
            radio.write(
                target.peripheral,
                &target.channel.characteristic,
                chunk,
                target.channel.mode,
            );
        }

        if count > 1 {
            info!(
                "Sent {} bytes to {} in {} writes",
                bytes.len(),
                target.peripheral,
                count
            );
        } else {
            debug!("Sent {} bytes to {}", bytes.len(), target.peripheral);
        }

        self.log
            .push(Direction::Sent, MessagePayload::Text(text.to_string()));
        Ok(())
    }

    /// Record an inbound notification value.
    pub fn on_notification(&mut self, value: &[u8]) -> Option<&MessageLogEntry> {
        match decode_notification(value) {
            Some(payload) => {
                if let MessagePayload::Hex(ref hex) = payload {
                    warn!("Received {} non-text bytes: {}", value.len(), hex);
                }
                Some(self.log.push(Direction::Received, payload))
            }
            None => None,
        }
    }
}
