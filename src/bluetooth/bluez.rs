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

//! BlueZ radio adapter.
//!
//! Implements [`RadioAdapter`] on top of `bluer`. Each request spawns a task
//! that talks to BlueZ over D-Bus and reports back on the event channel.
//! Writes for one peripheral go through a single queue so chunks stay ordered.

use anyhow::anyhow;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport, ErrorKind,
};
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::radio::{
    CharacteristicProperties, CharacteristicRef, PeripheralHandle, PeripheralId, RadioAdapter,
    RadioEvent, RadioPowerState, ServiceRef, WriteMode,
};

/// How often to check whether BlueZ has resolved a device's services.
const SERVICES_RESOLVE_INTERVAL: Duration = Duration::from_millis(100);

/// Give up waiting for resolution after this many checks.
const SERVICES_RESOLVE_POLLS: u32 = 50;

type Links = Arc<Mutex<HashMap<PeripheralId, Link>>>;

/// An open link and the tasks serving it. Dropping it stops the tasks.
struct Link {
    device: Device,
    writer: mpsc::UnboundedSender<WriteJob>,
    tasks: Vec<JoinHandle<()>>,
    notifications: HashMap<(u16, u16), JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.notifications.values() {
            task.abort();
        }
    }
}

/// In-flight tasks keyed by peripheral. A finished task clears its own slot,
/// unless a newer task has taken it over.
#[derive(Clone, Default)]
struct TaskSlots {
    slots: Arc<Mutex<HashMap<PeripheralId, (u64, JoinHandle<()>)>>>,
    next_token: Arc<AtomicU64>,
}

impl TaskSlots {
    /// Run `task` in the slot for `peripheral`, aborting whatever ran there.
    fn spawn<F>(&self, peripheral: &PeripheralId, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let slots = self.slots.clone();
        let id = peripheral.clone();

        // Held across the spawn so the task cannot clear its slot before it is filled
        let mut guard = self.slots.lock();
        let handle = tokio::spawn(async move {
            task.await;
            let mut slots = slots.lock();
            if slots.get(&id).map(|(t, _)| *t == token).unwrap_or(false) {
                slots.remove(&id);
            }
        });
        if let Some((_, previous)) = guard.insert(peripheral.clone(), (token, handle)) {
            previous.abort();
        }
    }

    fn take(&self, peripheral: &PeripheralId) -> Option<JoinHandle<()>> {
        self.slots.lock().remove(peripheral).map(|(_, handle)| handle)
    }

    fn abort(&self, peripheral: &PeripheralId) {
        if let Some(handle) = self.take(peripheral) {
            handle.abort();
        }
    }

    fn abort_all(&self) {
        for (_, (_, handle)) in self.slots.lock().drain() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn contains(&self, peripheral: &PeripheralId) -> bool {
        self.slots.lock().contains_key(peripheral)
    }
}

struct WriteJob {
    characteristic: CharacteristicRef,
    data: Vec<u8>,
    mode: WriteMode,
}

/// Radio adapter backed by the system BlueZ daemon.
pub struct BluezAdapter {
    adapter: Option<Adapter>,
    events: mpsc::UnboundedSender<RadioEvent>,
    links: Links,
    /// Connect attempts in flight.
    pending: TaskSlots,
    /// Disconnects in flight. A new connect to the same peripheral waits for them.
    closing: TaskSlots,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    power_task: Option<JoinHandle<()>>,
}

impl BluezAdapter {
    /// Open a BlueZ session on the named adapter, or the default one.
    /// The initial power state is reported on `events`.
    pub async fn new(
        adapter_name: Option<&str>,
        events: mpsc::UnboundedSender<RadioEvent>,
    ) -> bluer::Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        let power = if adapter.is_powered().await? {
            RadioPowerState::PoweredOn
        } else {
            RadioPowerState::PoweredOff
        };
        let _ = events.send(RadioEvent::PowerStateChanged(power));

        let power_task = tokio::spawn(watch_power(adapter.clone(), events.clone()));

        Ok(Self {
            adapter: Some(adapter),
            events,
            links: Arc::new(Mutex::new(HashMap::new())),
            pending: TaskSlots::default(),
            closing: TaskSlots::default(),
            scan_task: Mutex::new(None),
            power_task: Some(power_task),
        })
    }

    /// Adapter for a system without a usable radio. Reports `power` once and
    /// ignores every request.
    pub fn unavailable(power: RadioPowerState, events: mpsc::UnboundedSender<RadioEvent>) -> Self {
        let _ = events.send(RadioEvent::PowerStateChanged(power));
        Self {
            adapter: None,
            events,
            links: Arc::new(Mutex::new(HashMap::new())),
            pending: TaskSlots::default(),
            closing: TaskSlots::default(),
            scan_task: Mutex::new(None),
            power_task: None,
        }
    }

    /// Radio state implied by a failure to open the adapter.
    pub fn power_state_for(err: &bluer::Error) -> RadioPowerState {
        match err.kind {
            ErrorKind::NotAuthorized | ErrorKind::NotPermitted => RadioPowerState::Unauthorized,
            _ => RadioPowerState::Unsupported,
        }
    }

    fn emit(&self, event: RadioEvent) {
        if self.events.send(event).is_err() {
            debug!("Session is gone, dropping radio event");
        }
    }

    fn adapter_for(&self, request: &str) -> Option<Adapter> {
        if self.adapter.is_none() {
            warn!("No Bluetooth adapter, ignoring {} request", request);
        }
        self.adapter.clone()
    }

    fn linked_device(&self, peripheral: &PeripheralId) -> Option<Device> {
        self.links
            .lock()
            .get(peripheral)
            .map(|link| link.device.clone())
    }
}

impl Drop for BluezAdapter {
    fn drop(&mut self) {
        if let Some(task) = &self.power_task {
            task.abort();
        }
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
        self.pending.abort_all();
        self.closing.abort_all();
    }
}

impl RadioAdapter for BluezAdapter {
    fn set_scan(&self, active: bool, filter: Option<Uuid>) {
        if let Some(task) = self.scan_task.lock().take() {
            // Dropping the discovery stream ends the BlueZ discovery session
            task.abort();
            debug!("Discovery stopped");
        }
        if !active {
            return;
        }

        let Some(adapter) = self.adapter_for("scan") else {
            return;
        };
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = run_scan(adapter, filter, events).await {
                error!("Discovery failed: {}", e);
            }
        });
        *self.scan_task.lock() = Some(task);
    }

    fn connect(&self, peripheral: &PeripheralId) {
        let Some(adapter) = self.adapter_for("connect") else {
            return;
        };

        let id = peripheral.clone();
        let links = self.links.clone();
        let closing = self.closing.clone();
        let events = self.events.clone();
        self.pending.spawn(peripheral, async move {
            let previous = closing.take(&id);
            if let Some(previous) = previous {
                debug!("Waiting for earlier disconnect of {}", id);
                let _ = previous.await;
            }
            let event = match open_link(&adapter, &id, &links, &events).await {
                Ok(()) => RadioEvent::Connected(id.clone()),
                Err(e) => RadioEvent::ConnectFailed {
                    peripheral: id.clone(),
                    error: e.to_string(),
                },
            };
            let _ = events.send(event);
        });
    }

    fn cancel_connection(&self, peripheral: &PeripheralId) {
        self.pending.abort(peripheral);
        // Dropping the link stops its watcher before the disconnect lands
        let linked = self
            .links
            .lock()
            .remove(peripheral)
            .map(|link| link.device.clone());
        let Some(adapter) = self.adapter_for("disconnect") else {
            return;
        };

        let id = peripheral.clone();
        let events = self.events.clone();
        self.closing.spawn(peripheral, async move {
            let device = match linked {
                Some(device) => Some(device),
                None => id
                    .as_str()
                    .parse::<Address>()
                    .ok()
                    .and_then(|address| adapter.device(address).ok()),
            };
            if let Some(device) = device {
                if let Err(e) = device.disconnect().await {
                    debug!("Disconnect of {} reported: {}", id, e);
                }
            }
            let _ = events.send(RadioEvent::Disconnected {
                peripheral: id,
                error: None,
            });
        });
    }

    fn discover_services(&self, peripheral: &PeripheralId, filter: Option<&[Uuid]>) {
        let device = self.linked_device(peripheral);
        let filter = filter.map(|uuids| uuids.to_vec());
        let id = peripheral.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = match device {
                Some(device) => list_services(&device, filter.as_deref()).await,
                None => Err(anyhow!("not connected")),
            };
            let (services, error) = match result {
                Ok(services) => (services, None),
                Err(e) => (Vec::new(), Some(e.to_string())),
            };
            let _ = events.send(RadioEvent::ServicesDiscovered {
                peripheral: id,
                services,
                error,
            });
        });
    }

    fn discover_characteristics(&self, peripheral: &PeripheralId, service: &ServiceRef) {
        let device = self.linked_device(peripheral);
        let service = *service;
        let id = peripheral.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = match device {
                Some(device) => list_characteristics(&device, &service).await,
                None => Err(anyhow!("not connected")),
            };
            let (characteristics, error) = match result {
                Ok(characteristics) => (characteristics, None),
                Err(e) => (Vec::new(), Some(e.to_string())),
            };
            let _ = events.send(RadioEvent::CharacteristicsDiscovered {
                peripheral: id,
                service,
                characteristics,
                error,
            });
        });
    }

    fn set_notify(&self, peripheral: &PeripheralId, characteristic: &CharacteristicRef, enabled: bool) {
        let key = (characteristic.service, characteristic.handle);

        if !enabled {
            let task = self
                .links
                .lock()
                .get_mut(peripheral)
                .and_then(|link| link.notifications.remove(&key));
            if let Some(task) = task {
                task.abort();
            }
            self.emit(RadioEvent::NotifyStateChanged {
                peripheral: peripheral.clone(),
                characteristic: *characteristic,
                is_notifying: false,
                error: None,
            });
            return;
        }

        let Some(device) = self.linked_device(peripheral) else {
            self.emit(RadioEvent::NotifyStateChanged {
                peripheral: peripheral.clone(),
                characteristic: *characteristic,
                is_notifying: false,
                error: Some("not connected".to_string()),
            });
            return;
        };

        let task = tokio::spawn(forward_notifications(
            device,
            peripheral.clone(),
            *characteristic,
            self.events.clone(),
        ));

        let mut links = self.links.lock();
        match links.get_mut(peripheral) {
            Some(link) => {
                if let Some(previous) = link.notifications.insert(key, task) {
                    previous.abort();
                }
            }
            None => task.abort(),
        }
    }

    fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicRef,
        data: &[u8],
        mode: WriteMode,
    ) {
        let job = WriteJob {
            characteristic: *characteristic,
            data: data.to_vec(),
            mode,
        };

        let queued = self
            .links
            .lock()
            .get(peripheral)
            .map(|link| link.writer.send(job).is_ok())
            .unwrap_or(false);

        if !queued {
            self.emit(RadioEvent::WriteCompleted {
                peripheral: peripheral.clone(),
                characteristic: *characteristic,
                error: Some("not connected".to_string()),
            });
        }
    }
}

/// Report adapter power changes until the adapter goes away.
async fn watch_power(adapter: Adapter, events: mpsc::UnboundedSender<RadioEvent>) {
    let stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot watch adapter power state: {}", e);
            return;
        }
    };
    pin_mut!(stream);

    while let Some(event) = stream.next().await {
        if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
            let power = if powered {
                RadioPowerState::PoweredOn
            } else {
                RadioPowerState::PoweredOff
            };
            if events.send(RadioEvent::PowerStateChanged(power)).is_err() {
                break;
            }
        }
    }
}

async fn run_scan(
    adapter: Adapter,
    filter: Option<Uuid>,
    events: mpsc::UnboundedSender<RadioEvent>,
) -> bluer::Result<()> {
    let mut discovery = DiscoveryFilter {
        transport: DiscoveryTransport::Le,
        ..Default::default()
    };
    if let Some(uuid) = filter {
        discovery.uuids.insert(uuid);
    }
    adapter.set_discovery_filter(discovery).await?;

    let stream = adapter.discover_devices().await?;
    pin_mut!(stream);
    info!("Discovery started on {}", adapter.name());

    while let Some(event) = stream.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        let device = adapter.device(address)?;
        let name = device.name().await.unwrap_or(None);
        let rssi = device.rssi().await.unwrap_or(None);

        let handle = PeripheralHandle::new(PeripheralId::new(address.to_string()), name, rssi);
        if events.send(RadioEvent::PeripheralDiscovered(handle)).is_err() {
            break;
        }
    }
    Ok(())
}

/// Connect and register the link's watcher and writer tasks.
async fn open_link(
    adapter: &Adapter,
    id: &PeripheralId,
    links: &Links,
    events: &mpsc::UnboundedSender<RadioEvent>,
) -> anyhow::Result<()> {
    let address: Address = id
        .as_str()
        .parse()
        .map_err(|_| anyhow!("invalid Bluetooth address {}", id))?;
    let device = adapter.device(address)?;

    match device.connect().await {
        Ok(()) => {}
        Err(e) if matches!(e.kind, ErrorKind::AlreadyConnected) => {
            debug!("{} already connected", id);
        }
        Err(e) => return Err(e.into()),
    }

    let (writer, queue) = mpsc::unbounded_channel();
    let watcher = tokio::spawn(watch_link(
        device.clone(),
        id.clone(),
        links.clone(),
        events.clone(),
    ));
    let write_task = tokio::spawn(run_writer(device.clone(), id.clone(), queue, events.clone()));

    links.lock().insert(
        id.clone(),
        Link {
            device,
            writer,
            tasks: vec![watcher, write_task],
            notifications: HashMap::new(),
        },
    );
    Ok(())
}

/// Report an unsolicited link loss.
async fn watch_link(
    device: Device,
    id: PeripheralId,
    links: Links,
    events: mpsc::UnboundedSender<RadioEvent>,
) {
    let stream = match device.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot watch link to {}: {}", id, e);
            return;
        }
    };
    pin_mut!(stream);

    while let Some(event) = stream.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            info!("Link to {} lost", id);
            let _ = events.send(RadioEvent::Disconnected {
                peripheral: id.clone(),
                error: Some("connection lost".to_string()),
            });
            // Drops the link, which aborts this task
            links.lock().remove(&id);
            return;
        }
    }
}

async fn wait_services_resolved(device: &Device) -> bluer::Result<()> {
    for _ in 0..SERVICES_RESOLVE_POLLS {
        if device.is_services_resolved().await? {
            return Ok(());
        }
        tokio::time::sleep(SERVICES_RESOLVE_INTERVAL).await;
    }
    debug!("Services of {} still unresolved, listing what is known", device.address());
    Ok(())
}

async fn list_services(device: &Device, filter: Option<&[Uuid]>) -> anyhow::Result<Vec<ServiceRef>> {
    wait_services_resolved(device).await?;

    let mut found = Vec::new();
    for service in device.services().await? {
        let uuid = service.uuid().await?;
        if filter.map(|uuids| uuids.contains(&uuid)).unwrap_or(true) {
            found.push(ServiceRef {
                handle: service.id(),
                uuid,
            });
        }
    }
    Ok(found)
}

async fn list_characteristics(
    device: &Device,
    service: &ServiceRef,
) -> anyhow::Result<Vec<CharacteristicRef>> {
    let remote = device.service(service.handle).await?;

    let mut found = Vec::new();
    for characteristic in remote.characteristics().await? {
        let flags = characteristic.flags().await?;
        found.push(CharacteristicRef {
            service: service.handle,
            handle: characteristic.id(),
            uuid: characteristic.uuid().await?,
            properties: CharacteristicProperties {
                read: flags.read,
                write: flags.write,
                write_without_response: flags.write_without_response,
                notify: flags.notify,
                indicate: flags.indicate,
            },
        });
    }
    Ok(found)
}

async fn remote_characteristic(
    device: &Device,
    characteristic: &CharacteristicRef,
) -> bluer::Result<Characteristic> {
    device
        .service(characteristic.service)
        .await?
        .characteristic(characteristic.handle)
        .await
}

/// Subscribe and forward every value until the stream ends or the task is
/// aborted.
async fn forward_notifications(
    device: Device,
    id: PeripheralId,
    characteristic: CharacteristicRef,
    events: mpsc::UnboundedSender<RadioEvent>,
) {
    let remote = match remote_characteristic(&device, &characteristic).await {
        Ok(remote) => remote,
        Err(e) => {
            let _ = events.send(RadioEvent::NotifyStateChanged {
                peripheral: id,
                characteristic,
                is_notifying: false,
                error: Some(e.to_string()),
            });
            return;
        }
    };
    let stream = match remote.notify().await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(RadioEvent::NotifyStateChanged {
                peripheral: id,
                characteristic,
                is_notifying: false,
                error: Some(e.to_string()),
            });
            return;
        }
    };

    let _ = events.send(RadioEvent::NotifyStateChanged {
        peripheral: id.clone(),
        characteristic,
        is_notifying: true,
        error: None,
    });

    pin_mut!(stream);
    while let Some(value) = stream.next().await {
        let event = RadioEvent::ValueUpdated {
            peripheral: id.clone(),
            characteristic,
            value,
            error: None,
        };
        if events.send(event).is_err() {
            break;
        }
    }
    debug!("Notifications from {} ended", characteristic.uuid);
}

/// Drain the write queue of one link in order.
async fn run_writer(
    device: Device,
    id: PeripheralId,
    mut queue: mpsc::UnboundedReceiver<WriteJob>,
    events: mpsc::UnboundedSender<RadioEvent>,
) {
    while let Some(job) = queue.recv().await {
        let error = match write_chunk(&device, &job).await {
            Ok(()) if job.mode == WriteMode::WithoutResponse => continue,
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };
        let event = RadioEvent::WriteCompleted {
            peripheral: id.clone(),
            characteristic: job.characteristic,
            error,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

async fn write_chunk(device: &Device, job: &WriteJob) -> bluer::Result<()> {
    let remote = remote_characteristic(device, &job.characteristic).await?;
    let op_type = match job.mode {
        WriteMode::WithResponse => WriteOp::Request,
        WriteMode::WithoutResponse => WriteOp::Command,
    };
    remote
        .write_ext(
            &job.data,
            &CharacteristicWriteRequest {
                op_type,
                ..Default::default()
            },
        )
        .await
}
