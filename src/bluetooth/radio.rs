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

//! Contract with the radio stack.
//!
//! Outbound requests go through the [`RadioAdapter`] trait and return
//! immediately. Their outcomes come back later as [`RadioEvent`]s on the
//! session's event channel, in whatever order the stack delivers them.

use std::fmt;
use uuid::Uuid;

/// Power state of the local Bluetooth radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RadioPowerState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioPowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RadioPowerState::Unknown => "unknown",
            RadioPowerState::Resetting => "resetting",
            RadioPowerState::Unsupported => "unsupported",
            RadioPowerState::Unauthorized => "unauthorized",
            RadioPowerState::PoweredOff => "powered off",
            RadioPowerState::PoweredOn => "powered on",
        }
    }

    pub fn is_powered_on(&self) -> bool {
        matches!(self, RadioPowerState::PoweredOn)
    }

    /// Human-readable explanation shown when scanning or connecting is refused.
    pub fn describe(&self) -> &'static str {
        match self {
            RadioPowerState::Unknown => "Bluetooth state unknown",
            RadioPowerState::Resetting => "Bluetooth is resetting",
            RadioPowerState::Unsupported => "Bluetooth LE is not supported on this system",
            RadioPowerState::Unauthorized => "Bluetooth access is not authorized",
            RadioPowerState::PoweredOff => "Bluetooth is powered off",
            RadioPowerState::PoweredOn => "Bluetooth is ready",
        }
    }
}

impl fmt::Display for RadioPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a remote peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A discovered peripheral. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl PeripheralHandle {
    pub fn new(id: PeripheralId, name: Option<String>, rssi: Option<i16>) -> Self {
        Self { id, name, rssi }
    }

    /// Name for status text, falling back to the identity.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => self.id.to_string(),
        }
    }
}

/// A GATT service on the connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    /// Radio-stack handle used to address the service.
    pub handle: u16,
    pub uuid: Uuid,
}

/// Capabilities advertised by a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }

    /// Preferred write mode for this characteristic, if it is writable at all.
    pub fn preferred_write_mode(&self) -> Option<WriteMode> {
        if self.write {
            Some(WriteMode::WithResponse)
        } else if self.write_without_response {
            Some(WriteMode::WithoutResponse)
        } else {
            None
        }
    }
}

/// A characteristic within a service on the connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub service: u16,
    pub handle: u16,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

impl CharacteristicRef {
    /// Whether two references address the same characteristic.
    pub fn same_channel(&self, other: &CharacteristicRef) -> bool {
        self.service == other.service && self.handle == other.handle
    }
}

/// Whether the peripheral acknowledges a write at the ATT level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Events delivered by the radio stack. Any of them may arrive at any time,
/// including after the session has moved on from the peripheral they name.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// Radio power state changed.
    PowerStateChanged(RadioPowerState),
    /// Advertisement received during a scan.
    PeripheralDiscovered(PeripheralHandle),
    /// Link established.
    Connected(PeripheralId),
    /// Link could not be established.
    ConnectFailed {
        peripheral: PeripheralId,
        error: String,
    },
    /// Link closed, solicited or not.
    Disconnected {
        peripheral: PeripheralId,
        error: Option<String>,
    },
    /// Answer to `discover_services`.
    ServicesDiscovered {
        peripheral: PeripheralId,
        services: Vec<ServiceRef>,
        error: Option<String>,
    },
    /// Answer to `discover_characteristics` for one service.
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: ServiceRef,
        characteristics: Vec<CharacteristicRef>,
        error: Option<String>,
    },
    /// Answer to `set_notify`.
    NotifyStateChanged {
        peripheral: PeripheralId,
        characteristic: CharacteristicRef,
        is_notifying: bool,
        error: Option<String>,
    },
    /// Notification (or read) value.
    ValueUpdated {
        peripheral: PeripheralId,
        characteristic: CharacteristicRef,
        value: Vec<u8>,
        error: Option<String>,
    },
    /// Acknowledgement of a with-response write.
    WriteCompleted {
        peripheral: PeripheralId,
        characteristic: CharacteristicRef,
        error: Option<String>,
    },
}

/// Outbound half of the radio contract.
///
/// Every call is a request: implementations must not block, and report the
/// outcome through a [`RadioEvent`].
pub trait RadioAdapter: Send + Sync {
    /// Start or stop scanning, optionally limited to one advertised service.
    fn set_scan(&self, active: bool, filter: Option<Uuid>);

    /// Open a link to a peripheral.
    fn connect(&self, peripheral: &PeripheralId);

    /// Close or abandon a link.
    fn cancel_connection(&self, peripheral: &PeripheralId);

    /// Enumerate services, optionally only those with the given UUIDs.
    fn discover_services(&self, peripheral: &PeripheralId, filter: Option<&[Uuid]>);

    /// Enumerate characteristics of one service.
    fn discover_characteristics(&self, peripheral: &PeripheralId, service: &ServiceRef);

    /// Enable or disable notifications on a characteristic.
    fn set_notify(&self, peripheral: &PeripheralId, characteristic: &CharacteristicRef, enabled: bool);

    /// Write bytes to a characteristic.
    fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicRef,
        data: &[u8],
        mode: WriteMode,
    );
}

/// Recording adapter for unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Request {
        SetScan(bool, Option<Uuid>),
        Connect(PeripheralId),
        CancelConnection(PeripheralId),
        DiscoverServices(PeripheralId),
        DiscoverCharacteristics(PeripheralId, u16),
        SetNotify(PeripheralId, u16, bool),
        Write(PeripheralId, u16, Vec<u8>, WriteMode),
    }

    #[derive(Default)]
    pub struct RecordingRadio {
        requests: Mutex<Vec<Request>>,
    }

    impl RecordingRadio {
        pub fn take(&self) -> Vec<Request> {
            std::mem::take(&mut *self.requests.lock())
        }
    }

    impl RadioAdapter for RecordingRadio {
        fn set_scan(&self, active: bool, filter: Option<Uuid>) {
            self.requests.lock().push(Request::SetScan(active, filter));
        }

        fn connect(&self, peripheral: &PeripheralId) {
            self.requests.lock().push(Request::Connect(peripheral.clone()));
        }

        fn cancel_connection(&self, peripheral: &PeripheralId) {
            self.requests
                .lock()
                .push(Request::CancelConnection(peripheral.clone()));
        }

        fn discover_services(&self, peripheral: &PeripheralId, _filter: Option<&[Uuid]>) {
            self.requests
                .lock()
                .push(Request::DiscoverServices(peripheral.clone()));
        }

        fn discover_characteristics(&self, peripheral: &PeripheralId, service: &ServiceRef) {
            self.requests
                .lock()
                .push(Request::DiscoverCharacteristics(peripheral.clone(), service.handle));
        }

        fn set_notify(&self, peripheral: &PeripheralId, characteristic: &CharacteristicRef, enabled: bool) {
            self.requests.lock().push(Request::SetNotify(
                peripheral.clone(),
                characteristic.handle,
                enabled,
            ));
        }

        fn write(
            &self,
            peripheral: &PeripheralId,
            characteristic: &CharacteristicRef,
            data: &[u8],
            mode: WriteMode,
        ) {
            self.requests.lock().push(Request::Write(
                peripheral.clone(),
                characteristic.handle,
                data.to_vec(),
                mode,
            ));
        }
    }

    pub fn characteristic(handle: u16, properties: CharacteristicProperties) -> CharacteristicRef {
        CharacteristicRef {
            service: 1,
            handle,
            uuid: Uuid::from_u128(handle as u128),
            properties,
        }
    }

    pub fn writable(handle: u16, with_response: bool) -> CharacteristicRef {
        characteristic(
            handle,
            CharacteristicProperties {
                write: with_response,
                write_without_response: !with_response,
                ..Default::default()
            },
        )
    }

    pub fn notifiable(handle: u16) -> CharacteristicRef {
        characteristic(
            handle,
            CharacteristicProperties {
                notify: true,
                ..Default::default()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_write_mode() {
        let both = CharacteristicProperties {
            write: true,
            write_without_response: true,
            ..Default::default()
        };
        assert_eq!(both.preferred_write_mode(), Some(WriteMode::WithResponse));

        let command_only = CharacteristicProperties {
            write_without_response: true,
            ..Default::default()
        };
        assert_eq!(command_only.preferred_write_mode(), Some(WriteMode::WithoutResponse));
        assert_eq!(CharacteristicProperties::default().preferred_write_mode(), None);
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let id = PeripheralId::new("AA:BB:CC:DD:EE:FF");
        let unnamed = PeripheralHandle::new(id.clone(), Some("  ".to_string()), None);
        assert_eq!(unnamed.display_name(), "AA:BB:CC:DD:EE:FF");

        let named = PeripheralHandle::new(id, Some("HMSoft".to_string()), Some(-60));
        assert_eq!(named.display_name(), "HMSoft");
    }
}
