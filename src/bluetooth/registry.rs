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

//! Peripherals discovered during the current scan.

use tracing::{debug, info};
use uuid::Uuid;

use super::radio::{PeripheralHandle, PeripheralId, RadioAdapter, RadioPowerState};
use crate::error::{SessionError, SessionResult};

/// Discovery set for one scan window, unique by identity, in discovery order.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<PeripheralHandle>,
    scanning: bool,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh scan. Refused unless the radio is powered on, in which
    /// case the discovery set is left untouched.
    pub fn start_scan(
        &mut self,
        power: RadioPowerState,
        radio: &dyn RadioAdapter,
        filter: Option<Uuid>,
    ) -> SessionResult<()> {
        if !power.is_powered_on() {
            return Err(SessionError::RadioUnavailable(power));
        }

        self.devices.clear();
        self.scanning = true;
        radio.set_scan(true, filter);

        match filter {
            Some(uuid) => info!("Scan started (service filter {})", uuid),
            None => info!("Scan started"),
        }
        Ok(())
    }

    /// Stop scanning. Returns whether a scan was actually running.
    pub fn stop_scan(&mut self, radio: &dyn RadioAdapter) -> bool {
        if !self.scanning {
            return false;
        }

        radio.set_scan(false, None);
        self.scanning = false;
        info!("Scan stopped with {} device(s) found", self.devices.len());
        true
    }

    /// Record an advertisement. Returns true if the peripheral is new.
    pub fn on_discovered(&mut self, handle: PeripheralHandle) -> bool {
        if !self.scanning {
            debug!("Ignoring advertisement from {} outside scan window", handle.id);
            return false;
        }

        if self.devices.iter().any(|known| known.id == handle.id) {
            return false;
        }

        debug!(
            "Discovered {} ({}), RSSI {:?}",
            handle.display_name(),
            handle.id,
            handle.rssi
        );
        self.devices.push(handle);
        true
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn devices(&self) -> &[PeripheralHandle] {
        &self.devices
    }

    pub fn find(&self, id: &PeripheralId) -> Option<&PeripheralHandle> {
        self.devices.iter().find(|handle| &handle.id == id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::radio::testing::{RecordingRadio, Request};

    fn handle(id: &str) -> PeripheralHandle {
        PeripheralHandle::new(PeripheralId::new(id), Some(format!("dev-{}", id)), None)
    }

    #[test]
    fn test_duplicates_are_collapsed() {
        let radio = RecordingRadio::default();
        let mut registry = DeviceRegistry::new();
        registry
            .start_scan(RadioPowerState::PoweredOn, &radio, None)
            .unwrap();

        for id in ["a", "b", "a", "c", "b", "a"] {
            registry.on_discovered(handle(id));
        }

        let ids: Vec<_> = registry.devices().iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_scan_refused_without_power() {
        let radio = RecordingRadio::default();
        let mut registry = DeviceRegistry::new();
        registry
            .start_scan(RadioPowerState::PoweredOn, &radio, None)
            .unwrap();
        registry.on_discovered(handle("a"));
        registry.stop_scan(&radio);
        radio.take();

        let result = registry.start_scan(RadioPowerState::PoweredOff, &radio, None);
        assert_eq!(
            result,
            Err(SessionError::RadioUnavailable(RadioPowerState::PoweredOff))
        );
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_scanning());
        assert!(radio.take().is_empty());
    }

    #[test]
    fn test_new_scan_clears_previous_results() {
        let radio = RecordingRadio::default();
        let mut registry = DeviceRegistry::new();
        registry
            .start_scan(RadioPowerState::PoweredOn, &radio, None)
            .unwrap();
        registry.on_discovered(handle("a"));

        registry
            .start_scan(RadioPowerState::PoweredOn, &radio, None)
            .unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stop_scan_is_idempotent() {
        let radio = RecordingRadio::default();
        let mut registry = DeviceRegistry::new();
        assert!(!registry.stop_scan(&radio));
        assert!(radio.take().is_empty());

        registry
            .start_scan(RadioPowerState::PoweredOn, &radio, None)
            .unwrap();
        assert!(registry.stop_scan(&radio));
        assert!(!registry.stop_scan(&radio));
        assert_eq!(
            radio.take(),
            vec![Request::SetScan(true, None), Request::SetScan(false, None)]
        );
    }

    #[test]
    fn test_advertisements_outside_scan_are_ignored() {
        let mut registry = DeviceRegistry::new();
        assert!(!registry.on_discovered(handle("a")));
        assert!(registry.is_empty());
    }
}
