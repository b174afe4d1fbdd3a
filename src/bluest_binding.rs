//! bluest-backed adapter binding
//! Adapts the platform BLE stack, as exposed by the `bluest` crate, to the
//! command/event surface of [`AdapterBinding`]. Each command kicks off the
//! corresponding platform operation on a spawned task and reports its
//! completion as an [`AdapterEvent`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device, Service};
use futures_util::StreamExt;
use log::{debug, info, warn};
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{AdapterBinding, AdapterEvent, AdapterState};
use crate::constants::CONNECTION_MONITOR_INTERVAL_MS;
use crate::error::{Error, Result};
use crate::types::{AdvertisementData, CharacteristicInfo, Peripheral, ServiceInfo};

/// State shared between the binding and its spawned platform tasks.
struct Shared {
    events: mpsc::UnboundedSender<AdapterEvent>,
    /// Our identifier -> live platform device handle
    devices: Mutex<HashMap<Uuid, Device>>,
    /// (device, service UUID) -> platform service handle
    services: Mutex<HashMap<(Uuid, Uuid), Service>>,
    /// (device, characteristic UUID) -> platform characteristic handle
    characteristics: Mutex<HashMap<(Uuid, Uuid), Characteristic>>,
    /// Cancellation for the notification stream task per characteristic
    notify_cancels: Mutex<HashMap<(Uuid, Uuid), CancellationToken>>,
    /// Cancellation for the connection-loss monitor per device
    monitor_cancels: Mutex<HashMap<Uuid, CancellationToken>>,
    uuid_pattern: Regex,
}

impl Shared {
    fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    /// Derives our stable identifier for a platform device and registers
    /// the handle under it.
    ///
    /// Platform device ids embed a UUID on some targets and an opaque path
    /// on others; when no UUID can be extracted, a stable one is derived
    /// from the id string itself.
    fn register_device(&self, device: &Device) -> Uuid {
        let raw = device.id().to_string();
        let id = self
            .uuid_pattern
            .find(&raw)
            .and_then(|m| Uuid::parse_str(m.as_str()).ok())
            .unwrap_or_else(|| Uuid::new_v5(&Uuid::NAMESPACE_OID, raw.as_bytes()));
        self.devices.lock().unwrap().insert(id, device.clone());
        id
    }

    fn device(&self, id: Uuid) -> Result<Device> {
        self.devices
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Adapter(format!("device {} not seen by this adapter", id)))
    }

    fn characteristic(&self, device: Uuid, uuid: Uuid) -> Result<Characteristic> {
        self.characteristics
            .lock()
            .unwrap()
            .get(&(device, uuid))
            .cloned()
            .ok_or_else(|| Error::Adapter(format!("characteristic {} not discovered", uuid)))
    }

    /// Watches an established connection and reports its loss. The token
    /// is cancelled on a requested disconnect, which reports on its own.
    fn spawn_connection_monitor(self: &Arc<Self>, id: Uuid, device: Device) {
        let cancel = CancellationToken::new();
        // A reconnect replaces the previous monitor; left running it would
        // report a second, phantom disconnect.
        if let Some(old) = self
            .monitor_cancels
            .lock()
            .unwrap()
            .insert(id, cancel.clone())
        {
            old.cancel();
        }

        let shared = self.clone();
        tokio::spawn(async move {
            let interval = Duration::from_millis(CONNECTION_MONITOR_INTERVAL_MS);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {
                        if !device.is_connected().await {
                            debug!("connection to {} lost", id);
                            shared.monitor_cancels.lock().unwrap().remove(&id);
                            shared.emit(AdapterEvent::Disconnected { device: id, error: None });
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Adapter binding over the system Bluetooth stack via `bluest`.
pub struct BluestBinding {
    adapter: Adapter,
    shared: Arc<Shared>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AdapterEvent>>>,
    scan_cancel: Mutex<Option<CancellationToken>>,
}

impl BluestBinding {
    /// Opens the default system adapter and waits for it to become usable.
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(Error::AdapterUnavailable)?;
        adapter.wait_available().await.map_err(Error::adapter)?;
        info!("Bluetooth adapter is available.");

        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            events,
            devices: Mutex::default(),
            services: Mutex::default(),
            characteristics: Mutex::default(),
            notify_cancels: Mutex::default(),
            monitor_cancels: Mutex::default(),
            uuid_pattern: Regex::new(
                r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
            )
            .unwrap(),
        });
        shared.emit(AdapterEvent::StateChanged(AdapterState::PoweredOn));

        Ok(Self {
            adapter,
            shared,
            events_rx: Mutex::new(Some(events_rx)),
            scan_cancel: Mutex::new(None),
        })
    }
}

#[async_trait]
impl AdapterBinding for BluestBinding {
    async fn start_scan(&self, service_filter: Option<Uuid>, allow_duplicates: bool) -> Result<()> {
        if let Some(token) = self.scan_cancel.lock().unwrap().take() {
            token.cancel();
        }
        let cancel = CancellationToken::new();
        *self.scan_cancel.lock().unwrap() = Some(cancel.clone());

        let adapter = self.adapter.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let uuids: Vec<Uuid> = service_filter.into_iter().collect();
            let mut stream = match adapter.scan(&uuids).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("failed to start scan: {}", e);
                    return;
                }
            };

            let mut seen: HashSet<Uuid> = HashSet::new();
            loop {
                tokio::select! {
                    advertisement = stream.next() => {
                        let Some(advertisement) = advertisement else { break };
                        let id = shared.register_device(&advertisement.device);
                        if !allow_duplicates && !seen.insert(id) {
                            continue;
                        }
                        let name = advertisement
                            .adv_data
                            .local_name
                            .clone()
                            .or_else(|| advertisement.device.name().ok());
                        let manufacturer_data = advertisement
                            .adv_data
                            .manufacturer_data
                            .as_ref()
                            .map(|m| HashMap::from([(m.company_id, m.data.to_vec())]))
                            .unwrap_or_default();
                        shared.emit(AdapterEvent::PeripheralDiscovered {
                            peripheral: Peripheral::new(id, name),
                            advertisement: AdvertisementData {
                                local_name: advertisement.adv_data.local_name.clone(),
                                services: advertisement.adv_data.services.to_vec(),
                                manufacturer_data,
                                is_connectable: advertisement.adv_data.is_connectable,
                            },
                            rssi: advertisement.rssi,
                        });
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("scan task finished");
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(token) = self.scan_cancel.lock().unwrap().take() {
            token.cancel();
        }
        Ok(())
    }

    async fn connect(&self, device: Uuid) -> Result<()> {
        let handle = self.shared.device(device)?;
        let adapter = self.adapter.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            match adapter.connect_device(&handle).await {
                Ok(()) => {
                    shared.emit(AdapterEvent::Connected { device });
                    shared.spawn_connection_monitor(device, handle);
                }
                Err(e) => {
                    shared.emit(AdapterEvent::ConnectFailed {
                        device,
                        error: e.to_string(),
                    });
                }
            }
        });
        Ok(())
    }

    async fn cancel_connection(&self, device: Uuid) -> Result<()> {
        let handle = self.shared.device(device)?;
        // The requested path reports the disconnect itself; the monitor
        // must not race it with a second event.
        if let Some(token) = self.shared.monitor_cancels.lock().unwrap().remove(&device) {
            token.cancel();
        }
        let adapter = self.adapter.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let error = adapter
                .disconnect_device(&handle)
                .await
                .err()
                .map(|e| e.to_string());
            shared.emit(AdapterEvent::Disconnected { device, error });
        });
        Ok(())
    }

    async fn known_peripherals(&self, ids: &[Uuid]) -> Result<Vec<Peripheral>> {
        // Refresh the registry from whatever the platform already holds
        // connections to; identifiers outside it resolve to nothing.
        match self.adapter.connected_devices().await {
            Ok(devices) => {
                for device in &devices {
                    self.shared.register_device(device);
                }
            }
            Err(e) => debug!("connected_devices unavailable: {}", e),
        }

        let devices = self.shared.devices.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| {
                devices
                    .get(id)
                    .map(|device| Peripheral::new(*id, device.name().ok()))
            })
            .collect())
    }

    async fn discover_services(&self, device: Uuid, filter: Option<Uuid>) -> Result<()> {
        let handle = self.shared.device(device)?;
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = match handle.discover_services().await {
                Ok(services) => {
                    let mut registry = shared.services.lock().unwrap();
                    let mut infos = Vec::with_capacity(services.len());
                    for service in services {
                        let uuid = service.uuid();
                        registry.insert((device, uuid), service);
                        if filter.is_none_or(|f| f == uuid) {
                            infos.push(ServiceInfo { uuid, device });
                        }
                    }
                    Ok(infos)
                }
                Err(e) => Err(Error::adapter(e)),
            };
            shared.emit(AdapterEvent::ServicesDiscovered { device, result });
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        device: Uuid,
        service: Uuid,
        filter: Option<Uuid>,
    ) -> Result<()> {
        let handle = {
            self.shared
                .services
                .lock()
                .unwrap()
                .get(&(device, service))
                .cloned()
                .ok_or_else(|| Error::Adapter(format!("service {} not discovered", service)))?
        };
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = match handle.characteristics().await {
                Ok(characteristics) => {
                    let mut registry = shared.characteristics.lock().unwrap();
                    let mut infos = Vec::with_capacity(characteristics.len());
                    for characteristic in characteristics {
                        let uuid = characteristic.uuid();
                        registry.insert((device, uuid), characteristic);
                        if filter.is_none_or(|f| f == uuid) {
                            infos.push(CharacteristicInfo {
                                uuid,
                                service,
                                device,
                                is_notifying: false,
                            });
                        }
                    }
                    Ok(infos)
                }
                Err(e) => Err(Error::adapter(e)),
            };
            shared.emit(AdapterEvent::CharacteristicsDiscovered {
                device,
                service,
                result,
            });
        });
        Ok(())
    }

    async fn read_value(&self, device: Uuid, characteristic: Uuid) -> Result<()> {
        let handle = self.shared.characteristic(device, characteristic)?;
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = handle
                .read()
                .await
                .map(Some)
                .map_err(Error::adapter);
            shared.emit(AdapterEvent::ValueUpdated {
                device,
                characteristic,
                result,
            });
        });
        Ok(())
    }

    async fn write_value(
        &self,
        device: Uuid,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let handle = self.shared.characteristic(device, characteristic)?;
        let shared = self.shared.clone();
        let data = data.to_vec();
        tokio::spawn(async move {
            let result = if with_response {
                handle.write(&data).await
            } else {
                handle.write_without_response(&data).await
            }
            .map_err(Error::adapter);
            shared.emit(AdapterEvent::ValueWritten {
                device,
                characteristic,
                result,
            });
        });
        Ok(())
    }

    async fn set_notify(&self, device: Uuid, characteristic: Uuid, enable: bool) -> Result<()> {
        if !enable {
            let token = self
                .shared
                .notify_cancels
                .lock()
                .unwrap()
                .remove(&(device, characteristic));
            match token {
                // The stream task reports the disabled state on its way out.
                Some(token) => token.cancel(),
                None => self.shared.emit(AdapterEvent::NotifyStateUpdated {
                    device,
                    characteristic,
                    result: Ok(false),
                }),
            }
            return Ok(());
        }

        let handle = self.shared.characteristic(device, characteristic)?;
        let cancel = CancellationToken::new();
        self.shared
            .notify_cancels
            .lock()
            .unwrap()
            .insert((device, characteristic), cancel.clone());

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut stream = match handle.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    shared.emit(AdapterEvent::NotifyStateUpdated {
                        device,
                        characteristic,
                        result: Err(Error::adapter(e)),
                    });
                    return;
                }
            };
            shared.emit(AdapterEvent::NotifyStateUpdated {
                device,
                characteristic,
                result: Ok(true),
            });

            loop {
                tokio::select! {
                    item = stream.next() => {
                        let Some(item) = item else { break };
                        let result = item.map(Some).map_err(Error::adapter);
                        shared.emit(AdapterEvent::ValueUpdated { device, characteristic, result });
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            shared
                .notify_cancels
                .lock()
                .unwrap()
                .remove(&(device, characteristic));
            shared.emit(AdapterEvent::NotifyStateUpdated {
                device,
                characteristic,
                result: Ok(false),
            });
        });
        Ok(())
    }

    async fn read_rssi(&self, device: Uuid) -> Result<()> {
        let handle = self.shared.device(device)?;
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = handle.rssi().await.map_err(Error::adapter);
            shared.emit(AdapterEvent::RssiRead { device, result });
        });
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AdapterEvent>> {
        self.events_rx.lock().unwrap().take()
    }
}
