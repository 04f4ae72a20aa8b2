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

//! Event processing and command dispatch.
//!
//! A single driver task owns the [`Session`]. Radio events and user commands
//! are both funnelled into it, so session state is only ever touched from one
//! place, in arrival order.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bluetooth::{PeripheralId, RadioEvent, Session};
use crate::state::AppState;

/// User-initiated session operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    StartScan,
    StopScan,
    Connect(PeripheralId),
    Disconnect,
    Send(String),
}

#[derive(Debug)]
enum SessionInput {
    Command(SessionCommand),
    ConnectTimeout { peripheral: PeripheralId, attempt: u64 },
    Shutdown,
}

/// Cloneable handle for submitting commands to the driver.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionInput>,
}

impl SessionHandle {
    fn submit(&self, input: SessionInput) {
        if self.tx.send(input).is_err() {
            warn!("Session driver has stopped, command dropped");
        }
    }

    pub fn command(&self, command: SessionCommand) {
        self.submit(SessionInput::Command(command));
    }

    pub fn start_scan(&self) {
        self.command(SessionCommand::StartScan);
    }

    pub fn stop_scan(&self) {
        self.command(SessionCommand::StopScan);
    }

    pub fn connect(&self, peripheral: PeripheralId) {
        self.command(SessionCommand::Connect(peripheral));
    }

    pub fn disconnect(&self) {
        self.command(SessionCommand::Disconnect);
    }

    pub fn send(&self, text: impl Into<String>) {
        self.command(SessionCommand::Send(text.into()));
    }

    /// Ask the driver to close the link and exit.
    pub fn shutdown(&self) {
        self.submit(SessionInput::Shutdown);
    }
}

/// Owns the session and serialises every change to it.
pub struct SessionDriver {
    session: Session,
    state: Arc<AppState>,
    connect_timeout: Option<Duration>,
    inputs: mpsc::UnboundedReceiver<SessionInput>,
    /// Weak so that dropping the last handle stops the driver.
    timer_tx: mpsc::WeakUnboundedSender<SessionInput>,
}

impl SessionDriver {
    /// Create a new driver and the handle that feeds it.
    pub fn new(session: Session, state: Arc<AppState>) -> (Self, SessionHandle) {
        let (tx, inputs) = mpsc::unbounded_channel();
        let driver = Self {
            session,
            state,
            connect_timeout: None,
            inputs,
            timer_tx: tx.downgrade(),
        };
        (driver, SessionHandle { tx })
    }

    /// Fail connections that are not ready within `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Run until shut down or every handle is dropped.
    pub async fn run(mut self, mut radio_events: mpsc::UnboundedReceiver<RadioEvent>) {
        info!("Session driver started");
        self.publish();

        loop {
            tokio::select! {
                Some(event) = radio_events.recv() => {
                    self.process_event(event);
                }
                input = self.inputs.recv() => match input {
                    Some(SessionInput::Command(command)) => self.process_command(command),
                    Some(SessionInput::ConnectTimeout { peripheral, attempt }) => {
                        if let Err(e) = self.session.connect_timed_out(&peripheral, attempt) {
                            warn!("{}", e);
                        }
                    }
                    Some(SessionInput::Shutdown) | None => break,
                },
            }
            self.publish();
        }

        self.session.stop_scan();
        self.session.disconnect();
        self.publish();
        info!("Session driver stopped");
    }

    /// Apply a single radio event.
    fn process_event(&mut self, event: RadioEvent) {
        debug!("Radio event: {:?}", event);
        if let Err(e) = self.session.handle_event(event) {
            warn!("{}", e);
        }
    }

    /// Apply a single user command.
    fn process_command(&mut self, command: SessionCommand) {
        debug!("Command: {:?}", command);
        match command {
            SessionCommand::StartScan => {
                if let Err(e) = self.session.start_scan() {
                    debug!("Scan not started: {}", e);
                }
            }
            SessionCommand::StopScan => self.session.stop_scan(),
            SessionCommand::Connect(peripheral) => {
                let previous = self.session.attempt();
                if let Ok(attempt) = self.session.connect_by_id(&peripheral) {
                    if attempt != previous {
                        self.arm_watchdog(peripheral, attempt);
                    }
                }
            }
            SessionCommand::Disconnect => self.session.disconnect(),
            SessionCommand::Send(text) => {
                if self.session.send(&text).is_ok() {
                    self.state.record_command(&text);
                }
            }
        }
    }

    fn arm_watchdog(&self, peripheral: PeripheralId, attempt: u64) {
        let Some(timeout) = self.connect_timeout else {
            return;
        };
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(SessionInput::ConnectTimeout { peripheral, attempt });
            }
        });
    }

    fn publish(&self) {
        self.state.publish(self.session.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::radio::testing::RecordingRadio;
    use crate::bluetooth::{ConnectionState, PeripheralHandle, RadioPowerState, SessionOptions};
    use crate::state::SessionSnapshot;

    async fn wait_for<F>(state: &AppState, predicate: F) -> SessionSnapshot
    where
        F: Fn(&SessionSnapshot) -> bool,
    {
        let mut rx = state.subscribe();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = state.snapshot();
                if predicate(&snapshot) {
                    return snapshot;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("condition not reached")
    }

    #[tokio::test]
    async fn test_driver_publishes_scan_results() {
        let radio = Arc::new(RecordingRadio::default());
        let state = AppState::new();
        let session = Session::new(radio.clone(), SessionOptions::default());
        let (driver, handle) = SessionDriver::new(session, state.clone());
        let (radio_tx, radio_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(driver.run(radio_rx));

        radio_tx
            .send(RadioEvent::PowerStateChanged(RadioPowerState::PoweredOn))
            .unwrap();
        wait_for(&state, |s| s.power.is_powered_on()).await;

        handle.start_scan();
        wait_for(&state, |s| s.scanning).await;

        radio_tx
            .send(RadioEvent::PeripheralDiscovered(PeripheralHandle::new(
                PeripheralId::new("AA:BB:CC:DD:EE:FF"),
                Some("HMSoft".to_string()),
                Some(-48),
            )))
            .unwrap();
        let snapshot = wait_for(&state, |s| !s.devices.is_empty()).await;
        assert_eq!(snapshot.devices[0].display_name(), "HMSoft");

        handle.connect(PeripheralId::new("AA:BB:CC:DD:EE:FF"));
        let snapshot = wait_for(&state, |s| s.connection == ConnectionState::Connecting).await;
        assert!(!snapshot.scanning);

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(state.get_connection(), ConnectionState::Disconnecting);
    }

    #[tokio::test]
    async fn test_failed_send_not_recorded() {
        let radio = Arc::new(RecordingRadio::default());
        let state = AppState::new();
        let session = Session::new(radio, SessionOptions::default());
        let (driver, handle) = SessionDriver::new(session, state.clone());
        let (_radio_tx, radio_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(driver.run(radio_rx));

        handle.send("AT");
        wait_for(&state, |s| s.status.starts_with("Not ready")).await;
        assert!(state.get_history().is_empty());

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_watchdog_fails_stalled_attempt() {
        let radio = Arc::new(RecordingRadio::default());
        let state = AppState::new();
        let session = Session::new(radio, SessionOptions::default());
        let (driver, handle) = SessionDriver::new(session, state.clone());
        let driver = driver.with_connect_timeout(Some(Duration::from_millis(50)));
        let (radio_tx, radio_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(driver.run(radio_rx));

        radio_tx
            .send(RadioEvent::PowerStateChanged(RadioPowerState::PoweredOn))
            .unwrap();
        wait_for(&state, |s| s.power.is_powered_on()).await;
        handle.start_scan();
        wait_for(&state, |s| s.scanning).await;
        radio_tx
            .send(RadioEvent::PeripheralDiscovered(PeripheralHandle::new(
                PeripheralId::new("p1"),
                None,
                None,
            )))
            .unwrap();
        wait_for(&state, |s| !s.devices.is_empty()).await;

        handle.connect(PeripheralId::new("p1"));
        let snapshot =
            wait_for(&state, |s| matches!(s.connection, ConnectionState::Failed(_))).await;
        assert_eq!(snapshot.status, "Connection to p1 timed out");

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_driver_stops_when_last_handle_dropped() {
        let radio = Arc::new(RecordingRadio::default());
        let state = AppState::new();
        let session = Session::new(radio, SessionOptions::default());
        let (driver, handle) = SessionDriver::new(session, state.clone());
        let driver = driver.with_connect_timeout(Some(Duration::from_secs(60)));
        let (_radio_tx, radio_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(driver.run(radio_rx));

        let console = handle.clone();
        drop(handle);
        console.send("AT");
        wait_for(&state, |s| s.status.starts_with("Not ready")).await;
        drop(console);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("driver kept running without handles")
            .unwrap();
    }
}
