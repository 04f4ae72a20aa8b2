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

//! Connection lifecycle and GATT resolution for the active peripheral.
//!
//! Radio callbacks can arrive late, for a peripheral the session has already
//! abandoned. Every handler first checks the event's peripheral against the
//! current one and drops anything that does not match.

use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::radio::{
    CharacteristicRef, PeripheralHandle, PeripheralId, RadioAdapter, RadioPowerState, ServiceRef,
    WriteMode,
};
use super::traffic::WriteTarget;
use crate::error::{DiscoveryScope, SessionError, SessionResult};

/// State of the session's single connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Ready,
    Disconnecting,
    /// Last attempt failed. A new connect is accepted from here.
    Failed(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::DiscoveringServices => "Discovering services...",
            ConnectionState::DiscoveringCharacteristics => "Discovering characteristics...",
            ConnectionState::Ready => "Ready",
            ConnectionState::Disconnecting => "Disconnecting...",
            ConnectionState::Failed(_) => "Failed",
        }
    }

    /// Whether a link is being set up or is up.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::DiscoveringServices
                | ConnectionState::DiscoveringCharacteristics
                | ConnectionState::Ready
        )
    }
}

/// The characteristic commands are written to, with the mode to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteChannel {
    pub characteristic: CharacteristicRef,
    pub mode: WriteMode,
}

/// Channels found so far while characteristic discovery is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartialBinding {
    pub write: Option<WriteChannel>,
    pub notify: Option<CharacteristicRef>,
}

impl PartialBinding {
    /// Consider a discovered characteristic. Returns true if it became the
    /// notify channel.
    ///
    /// The first writable characteristic is kept, unless a later one supports
    /// write-with-response and the kept one does not. The first notifying
    /// characteristic is kept.
    fn offer(&mut self, characteristic: &CharacteristicRef) -> bool {
        if let Some(mode) = characteristic.properties.preferred_write_mode() {
            let replace = match &self.write {
                None => true,
                Some(current) => {
                    current.mode == WriteMode::WithoutResponse && mode == WriteMode::WithResponse
                }
            };
            if replace {
                self.write = Some(WriteChannel {
                    characteristic: *characteristic,
                    mode,
                });
            }
        }

        if self.notify.is_none() && characteristic.properties.can_notify() {
            self.notify = Some(*characteristic);
            return true;
        }
        false
    }
}

/// Write/notify channels of the active peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CharacteristicBinding {
    /// Nothing discovered yet.
    #[default]
    Unresolved,
    /// Discovery in flight; channels may be missing.
    Resolving(PartialBinding),
    /// Both channels bound. Immutable until the link goes away.
    Resolved {
        write: WriteChannel,
        notify: CharacteristicRef,
    },
}

impl CharacteristicBinding {
    pub fn write_channel(&self) -> Option<&WriteChannel> {
        match self {
            CharacteristicBinding::Unresolved => None,
            CharacteristicBinding::Resolving(partial) => partial.write.as_ref(),
            CharacteristicBinding::Resolved { write, .. } => Some(write),
        }
    }

    pub fn notify_channel(&self) -> Option<&CharacteristicRef> {
        match self {
            CharacteristicBinding::Unresolved => None,
            CharacteristicBinding::Resolving(partial) => partial.notify.as_ref(),
            CharacteristicBinding::Resolved { notify, .. } => Some(notify),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, CharacteristicBinding::Resolved { .. })
    }
}

/// Owns the connection state, the characteristic binding and the status line.
#[derive(Debug, Default)]
pub struct SessionStateMachine {
    state: ConnectionState,
    peripheral: Option<PeripheralHandle>,
    binding: CharacteristicBinding,
    /// Services whose characteristic discovery has not answered yet.
    pending_services: HashSet<u16>,
    attempt: u64,
    /// Cancels sent to the radio whose `Disconnected` has not come back yet.
    unanswered_cancels: HashMap<PeripheralId, u32>,
    status: String,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            status: "Idle".to_string(),
            ..Default::default()
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    pub fn peripheral(&self) -> Option<&PeripheralHandle> {
        self.peripheral.as_ref()
    }

    pub fn binding(&self) -> &CharacteristicBinding {
        &self.binding
    }

    /// Number of the most recent connect attempt.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Whether `id` names the peripheral this session currently tracks.
    pub fn is_current(&self, id: &PeripheralId) -> bool {
        self.peripheral.as_ref().map(|p| &p.id == id).unwrap_or(false)
    }

    /// Write target, only once the session is ready.
    pub fn write_target(&self) -> Option<WriteTarget<'_>> {
        if self.state != ConnectionState::Ready {
            return None;
        }
        match (&self.peripheral, &self.binding) {
            (Some(peripheral), CharacteristicBinding::Resolved { write, .. }) => Some(WriteTarget {
                peripheral: &peripheral.id,
                channel: write,
            }),
            _ => None,
        }
    }

    /// Whether a value from this characteristic should reach the message log.
    pub fn accepts_value(&self, id: &PeripheralId, characteristic: &CharacteristicRef) -> bool {
        self.is_current(id)
            && self
                .binding
                .notify_channel()
                .map(|notify| notify.same_channel(characteristic))
                .unwrap_or(false)
    }

    /// Begin connecting. Any link in progress is torn down first.
    /// Returns the attempt number.
    pub fn connect(
        &mut self,
        handle: PeripheralHandle,
        power: RadioPowerState,
        radio: &dyn RadioAdapter,
    ) -> SessionResult<u64> {
        if !power.is_powered_on() {
            self.status = power.describe().to_string();
            return Err(SessionError::RadioUnavailable(power));
        }

        if self.is_current(&handle.id) && self.state.is_active() {
            info!("Already {} {}", self.state.as_str(), handle.id);
            self.status = format!("Already connected to {}", handle.display_name());
            return Ok(self.attempt);
        }

        if let Some(previous) = self.peripheral.take() {
            if self.state.is_active() {
                info!("Tearing down link to {} before connecting", previous.id);
                self.cancel(&previous.id, radio);
            }
        }

        self.reset_link();
        self.attempt += 1;
        self.state = ConnectionState::Connecting;
        self.status = format!("Connecting to {}", handle.display_name());
        info!("Connecting to {} (attempt {})", handle.id, self.attempt);

        radio.connect(&handle.id);
        self.peripheral = Some(handle);
        Ok(self.attempt)
    }

    /// Request a disconnect. Completes when the radio reports `Disconnected`.
    pub fn disconnect(&mut self, radio: &dyn RadioAdapter) {
        if !self.state.is_active() {
            debug!("Disconnect requested while {}", self.state.as_str());
            return;
        }

        if let Some(peripheral) = self.peripheral.clone() {
            info!("Disconnecting from {}", peripheral.id);
            self.cancel(&peripheral.id, radio);
            self.status = format!("Disconnecting from {}", peripheral.display_name());
        }

        self.binding = CharacteristicBinding::Unresolved;
        self.pending_services.clear();
        self.state = ConnectionState::Disconnecting;
    }

    pub fn on_connected(&mut self, id: &PeripheralId, radio: &dyn RadioAdapter) {
        if !self.is_current(id) || self.state == ConnectionState::Disconnecting {
            // The radio finished a connect the session no longer wants
            debug!("Dropping link to {} that is no longer wanted", id);
            self.cancel(id, radio);
            return;
        }
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring connected event for {} while {}", id, self.state.as_str());
            return;
        }

        let name = self.display_name();
        info!("Connected to {}, discovering services", id);
        self.state = ConnectionState::DiscoveringServices;
        self.status = format!("Connected to {}, discovering services", name);
        radio.discover_services(id, None);
    }

    pub fn on_connect_failed(&mut self, id: &PeripheralId, error: &str) -> SessionResult<()> {
        if !self.is_current(id) || self.state != ConnectionState::Connecting {
            debug!("Ignoring stale connect failure for {}", id);
            return Ok(());
        }

        warn!("Failed to connect to {}: {}", id, error);
        self.status = format!("Failed to connect to {}: {}", self.display_name(), error);
        self.clear_link();
        self.state = ConnectionState::Failed(error.to_string());
        Err(SessionError::ConnectFailed(error.to_string()))
    }

    /// Returns true if the event closed the current link.
    pub fn on_disconnected(&mut self, id: &PeripheralId, error: Option<&str>) -> bool {
        let answers_cancel = self.settle_cancel(id);
        if !self.is_current(id) {
            debug!("Ignoring stale disconnect for {}", id);
            return false;
        }
        if answers_cancel && self.state == ConnectionState::Connecting {
            // The old link to this peripheral went down; the new attempt stands
            debug!("Disconnect of earlier link to {} does not end new attempt", id);
            return false;
        }

        let name = self.display_name();
        self.status = match error {
            Some(error) => {
                warn!("Disconnected from {}: {}", id, error);
                format!("Disconnected from {}: {}", name, error)
            }
            None => {
                info!("Disconnected from {}", id);
                format!("Disconnected from {}", name)
            }
        };
        self.clear_link();
        self.state = ConnectionState::Idle;
        true
    }

    pub fn on_services_discovered(
        &mut self,
        id: &PeripheralId,
        services: &[ServiceRef],
        error: Option<&str>,
        radio: &dyn RadioAdapter,
    ) -> SessionResult<()> {
        if !self.is_current(id) || self.state != ConnectionState::DiscoveringServices {
            debug!("Ignoring stale service list for {}", id);
            return Ok(());
        }

        if let Some(error) = error {
            warn!("Service discovery failed on {}: {}", id, error);
            self.status = format!("Service discovery failed: {}", error);
            return Err(SessionError::DiscoveryFailed {
                scope: DiscoveryScope::Services,
                reason: error.to_string(),
            });
        }

        if services.is_empty() {
            warn!("No services found on {}", id);
            self.status = format!("No services found on {}", self.display_name());
            return Ok(());
        }

        info!("Found {} service(s) on {}", services.len(), id);
        self.state = ConnectionState::DiscoveringCharacteristics;
        self.binding = CharacteristicBinding::Resolving(PartialBinding::default());
        self.pending_services = services.iter().map(|s| s.handle).collect();
        self.status = format!("Discovering characteristics in {} service(s)", services.len());

        for service in services {
            debug!("Discovering characteristics of service {}", service.uuid);
            radio.discover_characteristics(id, service);
        }
        Ok(())
    }

    pub fn on_characteristics_discovered(
        &mut self,
        id: &PeripheralId,
        service: &ServiceRef,
        characteristics: &[CharacteristicRef],
        error: Option<&str>,
        radio: &dyn RadioAdapter,
    ) -> SessionResult<()> {
        if !self.is_current(id) || self.state != ConnectionState::DiscoveringCharacteristics {
            debug!("Ignoring stale characteristics for {}", id);
            return Ok(());
        }
        if !self.pending_services.remove(&service.handle) {
            debug!("Ignoring unrequested characteristics for service {}", service.uuid);
            return Ok(());
        }

        let mut partial = match self.binding {
            CharacteristicBinding::Resolving(partial) => partial,
            _ => PartialBinding::default(),
        };

        let failure = match error {
            Some(error) => {
                warn!("Characteristic discovery failed for {}: {}", service.uuid, error);
                Some(SessionError::DiscoveryFailed {
                    scope: DiscoveryScope::Characteristics {
                        service: service.uuid.to_string(),
                    },
                    reason: error.to_string(),
                })
            }
            None => {
                for characteristic in characteristics {
                    if partial.offer(characteristic) {
                        // Subscribe as soon as a notify channel shows up
                        info!("Subscribing to notifications on {}", characteristic.uuid);
                        radio.set_notify(id, characteristic, true);
                    }
                }
                None
            }
        };

        self.binding = CharacteristicBinding::Resolving(partial);
        if self.try_resolve(partial) {
            return Ok(());
        }

        match failure {
            Some(failure) => {
                self.status = failure.to_string();
                Err(failure)
            }
            None => {
                self.status = self.progress_text(&partial);
                Ok(())
            }
        }
    }

    pub fn on_notify_state_changed(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicRef,
        is_notifying: bool,
        error: Option<&str>,
    ) {
        if !self.is_current(id) {
            debug!("Ignoring stale notify state for {}", id);
            return;
        }

        match error {
            Some(error) => {
                warn!("Notify subscription on {} failed: {}", characteristic.uuid, error);
                self.status = format!("Failed to enable notifications: {}", error);
            }
            None => info!(
                "Notifications {} on {}",
                if is_notifying { "enabled" } else { "disabled" },
                characteristic.uuid
            ),
        }
    }

    pub fn on_write_completed(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicRef,
        error: Option<&str>,
    ) {
        if !self.is_current(id) {
            debug!("Ignoring stale write completion for {}", id);
            return;
        }

        match error {
            Some(error) => {
                warn!("Write to {} failed: {}", characteristic.uuid, error);
                self.status = format!("Write failed: {}", error);
            }
            None => debug!("Write to {} acknowledged", characteristic.uuid),
        }
    }

    /// A radio that is not powered on cannot keep a GATT session.
    pub fn on_power_changed(&mut self, power: RadioPowerState) {
        if power.is_powered_on() {
            if !self.state.is_active() {
                self.status = power.describe().to_string();
            }
            return;
        }

        if let Some(peripheral) = &self.peripheral {
            warn!("Radio {} while linked to {}", power, peripheral.id);
        }
        self.clear_link();
        self.state = ConnectionState::Idle;
        self.status = power.describe().to_string();
    }

    /// Give up on an attempt that has not reached ready in time. Timers from
    /// earlier attempts are ignored.
    pub fn on_connect_timeout(
        &mut self,
        id: &PeripheralId,
        attempt: u64,
        radio: &dyn RadioAdapter,
    ) -> SessionResult<()> {
        let in_setup = matches!(
            self.state,
            ConnectionState::Connecting
                | ConnectionState::DiscoveringServices
                | ConnectionState::DiscoveringCharacteristics
        );
        if attempt != self.attempt || !self.is_current(id) || !in_setup {
            return Ok(());
        }

        warn!("Connection to {} timed out while {}", id, self.state.as_str());
        self.cancel(id, radio);
        self.status = format!("Connection to {} timed out", self.display_name());
        self.clear_link();
        self.state = ConnectionState::Failed("timed out".to_string());
        Err(SessionError::ConnectFailed("timed out".to_string()))
    }

    fn cancel(&mut self, id: &PeripheralId, radio: &dyn RadioAdapter) {
        *self.unanswered_cancels.entry(id.clone()).or_default() += 1;
        radio.cancel_connection(id);
    }

    /// Count off one outstanding cancel for `id`. Returns whether there was one.
    fn settle_cancel(&mut self, id: &PeripheralId) -> bool {
        let Some(count) = self.unanswered_cancels.get_mut(id) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.unanswered_cancels.remove(id);
        }
        true
    }

    fn try_resolve(&mut self, partial: PartialBinding) -> bool {
        if !self.pending_services.is_empty() {
            return false;
        }
        let (Some(write), Some(notify)) = (partial.write, partial.notify) else {
            return false;
        };

        self.binding = CharacteristicBinding::Resolved { write, notify };
        self.state = ConnectionState::Ready;
        let mode = match write.mode {
            WriteMode::WithResponse => "with response",
            WriteMode::WithoutResponse => "without response",
        };
        info!(
            "Session ready: write {} ({}), notify {}",
            write.characteristic.uuid, mode, notify.uuid
        );
        self.status = format!("Ready: {}", self.display_name());
        true
    }

    fn progress_text(&self, partial: &PartialBinding) -> String {
        let waiting = self.pending_services.len();
        match (partial.write.is_some(), partial.notify.is_some(), waiting) {
            (true, true, n) => format!("Write and notify found, waiting for {} service(s)", n),
            (true, false, 0) => format!("No notify characteristic on {}", self.display_name()),
            (false, true, 0) => format!("No writable characteristic on {}", self.display_name()),
            (false, false, 0) => format!("No usable characteristics on {}", self.display_name()),
            (true, false, _) => "Write found, still seeking notify".to_string(),
            (false, true, _) => "Notify found, still seeking write".to_string(),
            (false, false, n) => format!("Searching characteristics ({} service(s) left)", n),
        }
    }

    fn display_name(&self) -> String {
        self.peripheral
            .as_ref()
            .map(|p| p.display_name())
            .unwrap_or_else(|| "device".to_string())
    }

    fn reset_link(&mut self) {
        self.binding = CharacteristicBinding::Unresolved;
        self.pending_services.clear();
    }

    fn clear_link(&mut self) {
        self.reset_link();
        self.peripheral = None;
    }
}
