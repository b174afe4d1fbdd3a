//! Session coordinator for the BLE central role
//! This module provides the main public interface: a device/service/
//! characteristic UUID-string API over the connection manager, plus the
//! connected-device table, the scan session, and observer dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::AdapterBinding;
use crate::bluest_binding::BluestBinding;
use crate::constants::RETRIEVE_WARMUP_SCAN_SECS;
use crate::error::{Error, Result};
use crate::manager::{ConnectionManager, ManagerEvent};
use crate::observer::CentralObserver;
use crate::scanner::ScanSession;
use crate::types::{parse_uuid, CharacteristicInfo, ConnectionState, Peripheral};

/// Public-facing coordinator for a BLE central.
///
/// Owns the connection manager outright, keeps the table of connected
/// devices keyed by identifier, and re-dispatches every observer-facing
/// callback onto one dedicated task so callers always see results
/// serially. Identifier strings on the public surface are parsed once at
/// the boundary, so casing and short forms never matter for lookups.
pub struct CentralHelper {
    manager: ConnectionManager,
    /// Connected-device table: the single source of truth for which
    /// devices are usable right now
    connected: Arc<Mutex<HashMap<Uuid, Peripheral>>>,
    /// Scan result accumulator, shared with the active scan session
    scan_list: Arc<Mutex<Vec<Peripheral>>>,
    /// Cancellation handle for the in-flight scan session, if any
    scan_cancel: Mutex<Option<CancellationToken>>,
    observer: Arc<Mutex<Option<Arc<dyn CentralObserver>>>>,
    dispatch_handle: JoinHandle<()>,
}

impl CentralHelper {
    /// Creates a coordinator over the system Bluetooth adapter.
    pub async fn new() -> Result<Self> {
        let binding = Arc::new(BluestBinding::new().await?);
        Self::with_binding(binding)
    }

    /// Creates a coordinator over an injected adapter binding. This is the
    /// seam test doubles plug into.
    pub fn with_binding(binding: Arc<dyn AdapterBinding>) -> Result<Self> {
        let (manager, mut events) = ConnectionManager::new(binding)?;
        let observer: Arc<Mutex<Option<Arc<dyn CentralObserver>>>> = Arc::default();

        // All observer callbacks are delivered from this one task.
        let observer_slot = observer.clone();
        let dispatch_handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let current = observer_slot.lock().unwrap().clone();
                let Some(current) = current else { continue };
                match event {
                    ManagerEvent::Disconnected { peripheral } => {
                        current.on_disconnect(&peripheral);
                    }
                    ManagerEvent::DataReceived {
                        peripheral,
                        characteristic,
                        data,
                    } => {
                        current.on_data_received(data.as_deref(), &peripheral, &characteristic);
                    }
                }
            }
        });

        Ok(Self {
            manager,
            connected: Arc::default(),
            scan_list: Arc::default(),
            scan_cancel: Mutex::new(None),
            observer,
            dispatch_handle,
        })
    }

    /// Registers the observer that receives disconnect and data callbacks.
    pub fn set_observer(&self, observer: Arc<dyn CentralObserver>) {
        *self.observer.lock().unwrap() = Some(observer);
    }

    /// Scans for `timeout`, optionally filtered to peripherals advertising
    /// `service_uuid`, and returns the deduplicated list of discoveries.
    ///
    /// Any scan already in flight is cancelled first and resolves with
    /// [`Error::ScanSuperseded`]. Completion happens only at the timeout;
    /// a quiet radio does not end the scan early.
    pub async fn scan(
        &self,
        timeout: Duration,
        service_uuid: Option<&str>,
    ) -> Result<Vec<Peripheral>> {
        let filter = service_uuid.map(parse_uuid).transpose()?;

        self.cancel_active_scan();
        self.manager.stop_scan().await?;

        let session = ScanSession::new(self.scan_list.clone());
        *self.scan_cancel.lock().unwrap() = Some(session.cancel_token());

        let discoveries = self.manager.scan(filter).await?;
        let result = session.run(discoveries, timeout).await;
        if result.is_ok() {
            // A superseded session leaves the radio to its successor.
            self.manager.stop_scan().await?;
        }
        result
    }

    /// Connects to a discovered peripheral and registers it in the
    /// connected-device table.
    ///
    /// Scanning and connecting are mutually exclusive, so any in-flight
    /// scan is cancelled before the connect request goes out.
    pub async fn connect(&self, peripheral: &Peripheral) -> Result<()> {
        self.cancel_active_scan();
        self.manager.stop_scan().await?;

        self.manager.connect(peripheral).await?;
        self.connected
            .lock()
            .unwrap()
            .insert(peripheral.id, peripheral.clone());
        info!("registered connected device {}", peripheral.id);
        Ok(())
    }

    /// Connects to previously-known devices by identifier.
    ///
    /// The platform only resolves identifiers for devices it holds live
    /// instances of, so a short unfiltered scan runs first. Identifiers
    /// that fail to resolve produce no entry and no error.
    pub async fn retrieve(&self, device_uuids: &[&str]) -> Result<Vec<Peripheral>> {
        let ids = device_uuids
            .iter()
            .map(|s| parse_uuid(s))
            .collect::<Result<Vec<Uuid>>>()?;

        self.scan(Duration::from_secs(RETRIEVE_WARMUP_SCAN_SECS), None)
            .await?;

        let peripherals = self.manager.retrieve_by_identifiers(&ids).await?;
        {
            let mut connected = self.connected.lock().unwrap();
            for peripheral in &peripherals {
                connected.insert(peripheral.id, peripheral.clone());
            }
        }
        Ok(peripherals)
    }

    /// Disconnects one device, or every connected device when `None`, and
    /// unregisters the targets. The scan accumulator is cleared either way.
    pub async fn disconnect(&self, device_uuid: Option<&str>) -> Result<()> {
        let targets: Vec<Peripheral> = match device_uuid {
            Some(uuid) => {
                let id = parse_uuid(uuid)?;
                self.connected
                    .lock()
                    .unwrap()
                    .remove(&id)
                    .into_iter()
                    .collect()
            }
            None => self.connected.lock().unwrap().drain().map(|(_, p)| p).collect(),
        };

        for peripheral in &targets {
            if let Err(e) = self.manager.disconnect(peripheral).await {
                warn!("disconnect from {} failed: {}", peripheral.id, e);
            }
        }

        self.scan_list.lock().unwrap().clear();
        Ok(())
    }

    /// True iff the device is registered AND its live adapter-reported
    /// state is connected. A device can be registered yet disconnected if
    /// a disconnect event raced this check.
    pub fn is_connected(&self, device_uuid: &str) -> bool {
        let Ok(id) = parse_uuid(device_uuid) else {
            return false;
        };
        self.connected.lock().unwrap().contains_key(&id)
            && self.manager.connection_state(id) == ConnectionState::Connected
    }

    /// Snapshot of the connected-device table.
    pub fn connected_peripherals(&self) -> Vec<Peripheral> {
        self.connected.lock().unwrap().values().cloned().collect()
    }

    /// Reads a characteristic's value. Success means the platform
    /// confirmed the read; the bytes arrive via the observer's data
    /// callback. The first use of a (device, characteristic) pair pays a
    /// one-time discovery round-trip; later uses hit the cache.
    pub async fn read_value(
        &self,
        device_uuid: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<()> {
        let peripheral = self.registered(device_uuid)?;
        let characteristic = self
            .fetch(&peripheral, service_uuid, characteristic_uuid)
            .await?;
        self.manager.read_value(&peripheral, &characteristic).await
    }

    /// Writes to a characteristic, with or without response.
    pub async fn write_value(
        &self,
        device_uuid: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let peripheral = self.registered(device_uuid)?;
        let characteristic = self
            .fetch(&peripheral, service_uuid, characteristic_uuid)
            .await?;
        self.manager
            .write_value(&peripheral, &characteristic, data, with_response)
            .await
    }

    /// Enables or disables notifications on a characteristic. Requesting
    /// the state the characteristic is already in is a no-op, not an error.
    pub async fn enable_notification(
        &self,
        enable: bool,
        device_uuid: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<()> {
        let peripheral = self.registered(device_uuid)?;
        let characteristic = self
            .fetch(&peripheral, service_uuid, characteristic_uuid)
            .await?;
        self.manager
            .set_notification(&peripheral, &characteristic, enable)
            .await
    }

    /// Single-shot signal strength read against a connected device.
    pub async fn read_rssi(&self, device_uuid: &str) -> Result<i16> {
        let peripheral = self.registered(device_uuid)?;
        self.manager.read_rssi(&peripheral).await
    }

    fn registered(&self, device_uuid: &str) -> Result<Peripheral> {
        let id = parse_uuid(device_uuid)?;
        self.connected
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotRegistered {
                device: device_uuid.to_string(),
            })
    }

    async fn fetch(
        &self,
        peripheral: &Peripheral,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<CharacteristicInfo> {
        let service = parse_uuid(service_uuid)?;
        let characteristic = parse_uuid(characteristic_uuid)?;
        self.manager
            .fetch_characteristic(peripheral.id, service, characteristic)
            .await
    }

    fn cancel_active_scan(&self) {
        if let Some(token) = self.scan_cancel.lock().unwrap().take() {
            token.cancel();
        }
    }
}

impl Drop for CentralHelper {
    fn drop(&mut self) {
        self.dispatch_handle.abort();
    }
}
