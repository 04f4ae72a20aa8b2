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

//! BLE service and characteristic UUIDs for HM-10 style modules.

use uuid::Uuid;

/// HM-10 serial service UUID (16-bit 0xFFE0).
/// Used as the scan filter when `hm10_only` is enabled.
pub const HM10_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// Traffic limits.
pub mod limits {
    /// Maximum number of entries kept in the message log.
    pub const MESSAGE_LOG_CAPACITY: usize = 100;

    /// Maximum number of entries kept in the command history.
    pub const COMMAND_HISTORY_CAPACITY: usize = 20;

    /// Default ATT MTU (minimum for all BLE devices).
    pub const DEFAULT_MTU: usize = 23;

    /// ATT protocol overhead (3 bytes).
    pub const ATT_OVERHEAD: usize = 3;

    /// Largest single write an HM-10 accepts at the default MTU.
    pub const DEFAULT_MAX_WRITE_LEN: usize = DEFAULT_MTU - ATT_OVERHEAD;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            HM10_SERVICE_UUID.to_string().to_lowercase(),
            "0000ffe0-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_default_write_len() {
        // 23 - 3
        assert_eq!(limits::DEFAULT_MAX_WRITE_LEN, 20);
    }
}
