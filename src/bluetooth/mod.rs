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

//! Bluetooth communication module.
//!
//! BLE central session for HM-10 style serial modules: discovery, one link,
//! characteristic binding and line traffic.

pub mod ble_constants;
mod bluez;
mod connection;
mod protocol;
pub(crate) mod radio;
mod registry;
mod session;
mod traffic;

pub use bluez::BluezAdapter;
pub use connection::{
    CharacteristicBinding, ConnectionState, PartialBinding, SessionStateMachine, WriteChannel,
};
pub use protocol::{classify, ClassifiedResponse, ResponseCategory};
pub use radio::{
    CharacteristicProperties, CharacteristicRef, PeripheralHandle, PeripheralId, RadioAdapter,
    RadioEvent, RadioPowerState, ServiceRef, WriteMode,
};
pub use registry::DeviceRegistry;
pub use session::{Session, SessionOptions};
pub use traffic::{
    decode_notification, Direction, LineEnding, MessageLog, MessageLogEntry, MessagePayload,
    TextEncoding, TrafficMultiplexer, TrafficSettings, WriteTarget,
};
