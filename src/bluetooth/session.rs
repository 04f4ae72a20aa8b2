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

//! The session: one radio, one discovery set, at most one link.
//!
//! All mutation goes through `&mut self`, so callers must serialise access.
//! The driver in `events` does that by owning the session on a single task.

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ble_constants::HM10_SERVICE_UUID;
use super::connection::{CharacteristicBinding, ConnectionState, SessionStateMachine};
use super::radio::{PeripheralHandle, PeripheralId, RadioAdapter, RadioEvent, RadioPowerState};
use super::registry::DeviceRegistry;
use super::traffic::{MessageLog, TrafficMultiplexer, TrafficSettings};
use crate::error::{SessionError, SessionResult};
use crate::state::SessionSnapshot;

/// Session options taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Only discover peripherals advertising the HM-10 service.
    pub hm10_only: bool,
    pub traffic: TrafficSettings,
}

/// BLE central session for one serial-over-BLE peripheral.
pub struct Session {
    radio: Arc<dyn RadioAdapter>,
    power: RadioPowerState,
    registry: DeviceRegistry,
    connection: SessionStateMachine,
    traffic: TrafficMultiplexer,
    scan_filter: Option<Uuid>,
}

impl Session {
    /// Create a new session on top of a radio adapter.
    pub fn new(radio: Arc<dyn RadioAdapter>, options: SessionOptions) -> Self {
        Self {
            radio,
            power: RadioPowerState::Unknown,
            registry: DeviceRegistry::new(),
            connection: SessionStateMachine::new(),
            traffic: TrafficMultiplexer::new(options.traffic),
            scan_filter: options.hm10_only.then_some(HM10_SERVICE_UUID),
        }
    }

    pub fn power(&self) -> RadioPowerState {
        self.power
    }

    pub fn is_scanning(&self) -> bool {
        self.registry.is_scanning()
    }

    pub fn devices(&self) -> &[PeripheralHandle] {
        self.registry.devices()
    }

    pub fn state(&self) -> &ConnectionState {
        self.connection.state()
    }

    pub fn status(&self) -> &str {
        self.connection.status()
    }

    pub fn peripheral(&self) -> Option<&PeripheralHandle> {
        self.connection.peripheral()
    }

    pub fn binding(&self) -> &CharacteristicBinding {
        self.connection.binding()
    }

    pub fn log(&self) -> &MessageLog {
        self.traffic.log()
    }

    /// Attempt number of the most recent connect.
    pub fn attempt(&self) -> u64 {
        self.connection.attempt()
    }

    /// Begin a new scan, clearing the discovery set.
    pub fn start_scan(&mut self) -> SessionResult<()> {
        if let Err(e) = self
            .registry
            .start_scan(self.power, self.radio.as_ref(), self.scan_filter)
        {
            warn!("Scan refused: {}", e);
            self.connection.set_status(self.power.describe());
            return Err(e);
        }
        self.connection.set_status("Scanning...");
        Ok(())
    }

    pub fn stop_scan(&mut self) {
        if self.registry.stop_scan(self.radio.as_ref()) {
            self.connection
                .set_status(format!("Scan stopped, {} device(s) found", self.registry.len()));
        }
    }

    /// Connect to a peripheral from the discovery set.
    pub fn connect_by_id(&mut self, id: &PeripheralId) -> SessionResult<u64> {
        let handle = match self.registry.find(id) {
            Some(handle) => handle.clone(),
            None => {
                let err = SessionError::UnknownPeripheral(id.to_string());
                self.connection.set_status(err.to_string());
                return Err(err);
            }
        };
        self.connect(handle)
    }

    /// Connect to a peripheral. Scanning stops first.
    pub fn connect(&mut self, handle: PeripheralHandle) -> SessionResult<u64> {
        if self.power.is_powered_on() {
            self.registry.stop_scan(self.radio.as_ref());
        }
        self.connection
            .connect(handle, self.power, self.radio.as_ref())
    }

    pub fn disconnect(&mut self) {
        self.registry.stop_scan(self.radio.as_ref());
        self.connection.disconnect(self.radio.as_ref());
    }

    /// Send a line of text to the bound write characteristic.
    pub fn send(&mut self, text: &str) -> SessionResult<()> {
        let target = self.connection.write_target();
        let result = self
            .traffic
            .send(text, target, self.radio.as_ref());
        if let Err(e) = &result {
            warn!("Send failed: {}", e);
            self.connection.set_status(e.to_string());
        }
        result
    }

    /// Connect watchdog fired for `attempt`.
    pub fn connect_timed_out(&mut self, id: &PeripheralId, attempt: u64) -> SessionResult<()> {
        self.connection
            .on_connect_timeout(id, attempt, self.radio.as_ref())
    }

    /// Apply one radio event. Errors are already reflected in the status.
    pub fn handle_event(&mut self, event: RadioEvent) -> SessionResult<()> {
        let radio = self.radio.as_ref();
        match event {
            RadioEvent::PowerStateChanged(power) => {
                info!("Radio {}", power);
                self.power = power;
                if !power.is_powered_on() {
                    self.registry.stop_scan(radio);
                }
                self.connection.on_power_changed(power);
            }
            RadioEvent::PeripheralDiscovered(handle) => {
                self.registry.on_discovered(handle);
            }
            RadioEvent::Connected(peripheral) => {
                self.connection.on_connected(&peripheral, radio);
            }
            RadioEvent::ConnectFailed { peripheral, error } => {
                return self.connection.on_connect_failed(&peripheral, &error);
            }
            RadioEvent::Disconnected { peripheral, error } => {
                if self.connection.on_disconnected(&peripheral, error.as_deref()) {
                    self.registry.stop_scan(radio);
                }
            }
            RadioEvent::ServicesDiscovered {
                peripheral,
                services,
                error,
            } => {
                return self.connection.on_services_discovered(
                    &peripheral,
                    &services,
                    error.as_deref(),
                    radio,
                );
            }
            RadioEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                characteristics,
                error,
            } => {
                return self.connection.on_characteristics_discovered(
                    &peripheral,
                    &service,
                    &characteristics,
                    error.as_deref(),
                    radio,
                );
            }
            RadioEvent::NotifyStateChanged {
                peripheral,
                characteristic,
                is_notifying,
                error,
            } => {
                self.connection.on_notify_state_changed(
                    &peripheral,
                    &characteristic,
                    is_notifying,
                    error.as_deref(),
                );
            }
            RadioEvent::ValueUpdated {
                peripheral,
                characteristic,
                value,
                error,
            } => {
                if !self.connection.accepts_value(&peripheral, &characteristic) {
                    debug!("Ignoring value from {} on {}", peripheral, characteristic.uuid);
                    return Ok(());
                }
                match error {
                    Some(error) => {
                        warn!("Notification error on {}: {}", characteristic.uuid, error);
                        self.connection
                            .set_status(format!("Notification error: {}", error));
                    }
                    None => {
                        self.traffic.on_notification(&value);
                    }
                }
            }
            RadioEvent::WriteCompleted {
                peripheral,
                characteristic,
                error,
            } => {
                self.connection
                    .on_write_completed(&peripheral, &characteristic, error.as_deref());
            }
        }
        Ok(())
    }

    /// Copy of everything an observer can see.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            power: self.power,
            connection: self.connection.state().clone(),
            status: self.connection.status().to_string(),
            scanning: self.registry.is_scanning(),
            devices: self.registry.devices().to_vec(),
            peripheral: self.connection.peripheral().cloned(),
            write_bound: self.connection.binding().write_channel().is_some(),
            notify_bound: self.connection.binding().notify_channel().is_some(),
            messages: self.traffic.log().iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::radio::testing::{notifiable, writable, RecordingRadio, Request};
    use crate::bluetooth::radio::ServiceRef;
    use crate::bluetooth::traffic::{Direction, MessagePayload};

    fn session() -> (Session, Arc<RecordingRadio>) {
        let radio = Arc::new(RecordingRadio::default());
        let session = Session::new(radio.clone(), SessionOptions::default());
        (session, radio)
    }

    fn discovered(id: &str) -> RadioEvent {
        RadioEvent::PeripheralDiscovered(PeripheralHandle::new(
            PeripheralId::new(id),
            Some("HMSoft".to_string()),
            Some(-60),
        ))
    }

    fn ready_session() -> (Session, Arc<RecordingRadio>, PeripheralId) {
        let (mut session, radio) = session();
        let id = PeripheralId::new("p1");
        let service = ServiceRef {
            handle: 1,
            uuid: HM10_SERVICE_UUID,
        };
        session
            .handle_event(RadioEvent::PowerStateChanged(RadioPowerState::PoweredOn))
            .unwrap();
        session.start_scan().unwrap();
        session.handle_event(discovered("p1")).unwrap();
        session.connect_by_id(&id).unwrap();
        session.handle_event(RadioEvent::Connected(id.clone())).unwrap();
        session
            .handle_event(RadioEvent::ServicesDiscovered {
                peripheral: id.clone(),
                services: vec![service],
                error: None,
            })
            .unwrap();
        session
            .handle_event(RadioEvent::CharacteristicsDiscovered {
                peripheral: id.clone(),
                service,
                characteristics: vec![writable(7, false), notifiable(7)],
                error: None,
            })
            .unwrap();
        radio.take();
        (session, radio, id)
    }

    #[test]
    fn test_scan_refused_until_powered() {
        let (mut session, radio) = session();
        assert_eq!(
            session.start_scan(),
            Err(SessionError::RadioUnavailable(RadioPowerState::Unknown))
        );
        assert!(!session.is_scanning());
        assert!(radio.take().is_empty());
    }

    #[test]
    fn test_hm10_only_filters_scan() {
        let radio = Arc::new(RecordingRadio::default());
        let mut session = Session::new(
            radio.clone(),
            SessionOptions {
                hm10_only: true,
                ..Default::default()
            },
        );
        session
            .handle_event(RadioEvent::PowerStateChanged(RadioPowerState::PoweredOn))
            .unwrap();
        session.start_scan().unwrap();
        assert_eq!(
            radio.take(),
            vec![Request::SetScan(true, Some(HM10_SERVICE_UUID))]
        );
    }

    #[test]
    fn test_connect_stops_scan() {
        let (mut session, radio) = session();
        session
            .handle_event(RadioEvent::PowerStateChanged(RadioPowerState::PoweredOn))
            .unwrap();
        session.start_scan().unwrap();
        session.handle_event(discovered("p1")).unwrap();
        radio.take();

        session.connect_by_id(&PeripheralId::new("p1")).unwrap();
        assert!(!session.is_scanning());
        assert_eq!(
            radio.take(),
            vec![
                Request::SetScan(false, None),
                Request::Connect(PeripheralId::new("p1"))
            ]
        );
    }

    #[test]
    fn test_connect_unknown_peripheral() {
        let (mut session, _radio) = session();
        let result = session.connect_by_id(&PeripheralId::new("nope"));
        assert_eq!(result, Err(SessionError::UnknownPeripheral("nope".to_string())));
        assert_eq!(session.status(), "Unknown device: nope");
    }

    #[test]
    fn test_send_and_receive() {
        let (mut session, radio, id) = ready_session();
        assert_eq!(session.state(), &ConnectionState::Ready);

        session.send("AT+NAME?").unwrap();
        assert_eq!(
            radio.take(),
            vec![Request::Write(
                id.clone(),
                7,
                b"AT+NAME?".to_vec(),
                crate::bluetooth::WriteMode::WithoutResponse
            )]
        );

        session
            .handle_event(RadioEvent::ValueUpdated {
                peripheral: id,
                characteristic: notifiable(7),
                value: b"OK+NAME:foo\r\n".to_vec(),
                error: None,
            })
            .unwrap();

        let entries: Vec<_> = session.log().iter().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].direction, Direction::Sent);
        assert_eq!(entries[1].direction, Direction::Received);
        assert_eq!(entries[1].payload, MessagePayload::Text("OK+NAME:foo".to_string()));
    }

    #[test]
    fn test_send_before_ready_sets_status() {
        let (mut session, radio) = session();
        assert_eq!(session.send("AT"), Err(SessionError::NotReady));
        assert_eq!(session.status(), "Not ready: no writable characteristic bound");
        assert!(session.log().is_empty());
        assert!(radio.take().is_empty());
    }

    #[test]
    fn test_value_from_other_peripheral_ignored() {
        let (mut session, _radio, _id) = ready_session();
        session
            .handle_event(RadioEvent::ValueUpdated {
                peripheral: PeripheralId::new("p2"),
                characteristic: notifiable(7),
                value: b"OK".to_vec(),
                error: None,
            })
            .unwrap();
        assert!(session.log().is_empty());
    }

    #[test]
    fn test_power_off_resets_session() {
        let (mut session, _radio, _id) = ready_session();
        session
            .handle_event(RadioEvent::PowerStateChanged(RadioPowerState::PoweredOff))
            .unwrap();

        assert_eq!(session.state(), &ConnectionState::Idle);
        assert!(!session.is_scanning());
        assert_eq!(session.devices().len(), 1);
        assert_eq!(session.send("AT"), Err(SessionError::NotReady));
    }

    #[test]
    fn test_snapshot_reflects_session() {
        let (session, _radio, id) = ready_session();
        let snapshot = session.snapshot();

        assert_eq!(snapshot.connection, ConnectionState::Ready);
        assert_eq!(snapshot.peripheral.map(|p| p.id), Some(id));
        assert!(snapshot.write_bound && snapshot.notify_bound);
        assert!(!snapshot.scanning);
        assert_eq!(snapshot.devices.len(), 1);
    }
}
