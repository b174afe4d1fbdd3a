//! Connection and discovery manager
//! Owns the one adapter binding, the per-device characteristic cache, and
//! the table of pending operations. A single pump task consumes adapter
//! events in order and resolves the matching pending request for each one.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapter::{AdapterBinding, AdapterEvent};
use crate::error::{Error, Result};
use crate::types::{CharacteristicInfo, ConnectionState, Discovery, Peripheral, ServiceInfo};

/// Events the manager surfaces to its owner, in place of a back-reference.
#[derive(Debug)]
pub enum ManagerEvent {
    /// The link to a peripheral dropped, whether requested or spontaneous
    Disconnected { peripheral: Peripheral },
    /// A characteristic value arrived, from an explicit read or a
    /// peripheral-initiated notification
    DataReceived {
        peripheral: Peripheral,
        characteristic: CharacteristicInfo,
        data: Option<Vec<u8>>,
    },
}

/// Operation kinds that can be in flight against a device. Value-bearing
/// kinds key by characteristic so operations on distinct characteristics
/// never contend for the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OpKind {
    Connect,
    Disconnect,
    DiscoverServices,
    DiscoverCharacteristics,
    Read(Uuid),
    Write(Uuid),
    SetNotify(Uuid),
    ReadRssi,
}

/// Payload delivered when a pending operation resolves.
#[derive(Debug)]
enum OpOutcome {
    Done,
    Services(Vec<ServiceInfo>),
    Characteristics(Vec<CharacteristicInfo>),
    NotifyState(bool),
    Rssi(i16),
}

type OpResult = Result<OpOutcome>;

/// Pending-operation table keyed by (device, operation kind).
///
/// Each key holds a FIFO of one-shot resolvers: events resolve the oldest
/// request for their key, so two in-flight operations of the same kind
/// resolve independently and in issue order instead of the newer one
/// silently displacing the older.
#[derive(Default)]
struct PendingOps {
    slots: HashMap<(Uuid, OpKind), VecDeque<oneshot::Sender<OpResult>>>,
}

impl PendingOps {
    fn register(&mut self, device: Uuid, kind: OpKind) -> oneshot::Receiver<OpResult> {
        let (tx, rx) = oneshot::channel();
        self.slots.entry((device, kind)).or_default().push_back(tx);
        rx
    }

    /// Resolves the oldest pending request for the key. Returns false when
    /// nothing was waiting, which is how unsolicited events are told apart.
    fn resolve(&mut self, device: Uuid, kind: OpKind, result: OpResult) -> bool {
        let Some(queue) = self.slots.get_mut(&(device, kind)) else {
            return false;
        };
        let Some(tx) = queue.pop_front() else {
            return false;
        };
        if queue.is_empty() {
            self.slots.remove(&(device, kind));
        }
        // A dropped receiver means the caller gave up; nothing to do.
        let _ = tx.send(result);
        true
    }
}

type CharacteristicCache = HashMap<Uuid, HashMap<Uuid, CharacteristicInfo>>;

/// Connection and discovery manager for a single adapter binding.
pub struct ConnectionManager {
    binding: Arc<dyn AdapterBinding>,
    pending: Arc<Mutex<PendingOps>>,
    /// device UUID -> characteristic UUID -> cached handle
    cache: Arc<Mutex<CharacteristicCache>>,
    /// Connection state per device, as last reported by the adapter
    states: Arc<Mutex<HashMap<Uuid, ConnectionState>>>,
    /// Metadata for every peripheral the adapter has mentioned
    peripherals: Arc<Mutex<HashMap<Uuid, Peripheral>>>,
    /// Destination for advertisement reports while a scan is active
    scan_sink: Arc<Mutex<Option<mpsc::UnboundedSender<Discovery>>>>,
    pump_handle: JoinHandle<()>,
}

impl ConnectionManager {
    /// Creates the manager and starts its event pump. Returns the manager
    /// together with the channel its owner should drain for disconnect and
    /// data notifications.
    pub fn new(
        binding: Arc<dyn AdapterBinding>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ManagerEvent>)> {
        let events = binding.take_events().ok_or(Error::BindingClosed)?;
        let (manager_tx, manager_rx) = mpsc::unbounded_channel();

        let pending: Arc<Mutex<PendingOps>> = Arc::default();
        let cache: Arc<Mutex<CharacteristicCache>> = Arc::default();
        let states: Arc<Mutex<HashMap<Uuid, ConnectionState>>> = Arc::default();
        let peripherals: Arc<Mutex<HashMap<Uuid, Peripheral>>> = Arc::default();
        let scan_sink: Arc<Mutex<Option<mpsc::UnboundedSender<Discovery>>>> = Arc::default();

        let pump_handle = tokio::spawn(Self::pump(
            events,
            pending.clone(),
            cache.clone(),
            states.clone(),
            peripherals.clone(),
            scan_sink.clone(),
            manager_tx,
        ));

        let manager = Self {
            binding,
            pending,
            cache,
            states,
            peripherals,
            scan_sink,
            pump_handle,
        };
        Ok((manager, manager_rx))
    }

    /// Begins scanning and returns the stream of advertisement reports.
    ///
    /// Duplicate advertisements are reported only in the unfiltered case:
    /// filtered scans suppress duplicates to avoid redundant wake-ups,
    /// unfiltered scans need them to pick up devices seen only briefly.
    /// The scan never completes on its own; the caller stops it.
    pub async fn scan(
        &self,
        service_filter: Option<Uuid>,
    ) -> Result<mpsc::UnboundedReceiver<Discovery>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.scan_sink.lock().unwrap() = Some(tx);
        let allow_duplicates = service_filter.is_none();
        self.binding
            .start_scan(service_filter, allow_duplicates)
            .await?;
        info!("scan started (filter: {:?})", service_filter);
        Ok(rx)
    }

    /// Stops any active scan. Safe to call when not scanning.
    pub async fn stop_scan(&self) -> Result<()> {
        self.scan_sink.lock().unwrap().take();
        self.binding.stop_scan().await
    }

    /// Connects to a peripheral. Resolves exactly once, via the platform's
    /// connect-success or connect-failure event.
    pub async fn connect(&self, peripheral: &Peripheral) -> Result<()> {
        self.peripherals
            .lock()
            .unwrap()
            .insert(peripheral.id, peripheral.clone());
        self.states
            .lock()
            .unwrap()
            .insert(peripheral.id, ConnectionState::Connecting);

        let rx = self.register(peripheral.id, OpKind::Connect);
        if let Err(e) = self.binding.connect(peripheral.id).await {
            self.states
                .lock()
                .unwrap()
                .insert(peripheral.id, ConnectionState::Disconnected);
            return Err(e);
        }
        Self::wait_done(rx).await
    }

    /// Resolves previously-known identifiers to live peripherals and
    /// connects each one found. Identifiers the platform cannot resolve
    /// produce nothing; connect failures are logged and skipped.
    pub async fn retrieve_by_identifiers(&self, ids: &[Uuid]) -> Result<Vec<Peripheral>> {
        let found = self.binding.known_peripherals(ids).await?;
        let mut connected = Vec::with_capacity(found.len());
        for peripheral in found {
            match self.connect(&peripheral).await {
                Ok(()) => connected.push(peripheral),
                Err(e) => warn!("retrieve: connect to {} failed: {}", peripheral.id, e),
            }
        }
        Ok(connected)
    }

    /// Disconnects from a peripheral: first disables every notification
    /// known to be active on it, purges its cache entry, then requests
    /// disconnection and waits for the platform to confirm.
    pub async fn disconnect(&self, peripheral: &Peripheral) -> Result<()> {
        let notifying: Vec<Uuid> = {
            let cache = self.cache.lock().unwrap();
            cache
                .get(&peripheral.id)
                .map(|chars| {
                    chars
                        .values()
                        .filter(|c| c.is_notifying)
                        .map(|c| c.uuid)
                        .collect()
                })
                .unwrap_or_default()
        };
        for characteristic in notifying {
            if let Err(e) = self
                .binding
                .set_notify(peripheral.id, characteristic, false)
                .await
            {
                warn!(
                    "disconnect: failed to disable notify on {}: {}",
                    characteristic, e
                );
            }
        }

        // Platform handles may be invalidated by the disconnect, so the
        // cache entry must not survive into a later reconnect.
        self.cache.lock().unwrap().remove(&peripheral.id);
        self.states
            .lock()
            .unwrap()
            .insert(peripheral.id, ConnectionState::Disconnecting);

        let rx = self.register(peripheral.id, OpKind::Disconnect);
        self.binding.cancel_connection(peripheral.id).await?;
        Self::wait_done(rx).await
    }

    /// Returns the characteristic handle for (device, service,
    /// characteristic), from cache when possible.
    ///
    /// A cache hit costs no adapter traffic. Otherwise services are
    /// discovered filtered to `service`, then characteristics filtered to
    /// `characteristic` within the matching service. Every platform service
    /// is examined for the match regardless of report order. All
    /// characteristics the platform returns are cached, requested or not.
    pub async fn fetch_characteristic(
        &self,
        device: Uuid,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicInfo> {
        if let Some(cached) = self.cached_characteristic(device, characteristic) {
            debug!("fetch: cache hit for {} on {}", characteristic, device);
            return Ok(cached);
        }

        let rx = self.register(device, OpKind::DiscoverServices);
        self.binding.discover_services(device, Some(service)).await?;
        let services = match Self::wait(rx).await? {
            OpOutcome::Services(services) => services,
            _ => return Err(Error::BindingClosed),
        };

        let matched = services
            .iter()
            .find(|s| s.uuid == service)
            .ok_or(Error::ServiceNotFound { service })?;

        let rx = self.register(device, OpKind::DiscoverCharacteristics);
        self.binding
            .discover_characteristics(device, matched.uuid, Some(characteristic))
            .await?;
        let characteristics = match Self::wait(rx).await? {
            OpOutcome::Characteristics(characteristics) => characteristics,
            _ => return Err(Error::BindingClosed),
        };

        characteristics
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or(Error::CharacteristicNotFound { characteristic })
    }

    /// Triggers a value read. Success means the platform confirmed the
    /// read; the bytes themselves are delivered through the data
    /// notification channel.
    pub async fn read_value(
        &self,
        peripheral: &Peripheral,
        characteristic: &CharacteristicInfo,
    ) -> Result<()> {
        let rx = self.register(peripheral.id, OpKind::Read(characteristic.uuid));
        self.binding
            .read_value(peripheral.id, characteristic.uuid)
            .await?;
        Self::wait_done(rx).await
    }

    /// Writes a value. With response, resolution waits for platform
    /// confirmation; without response it follows platform timing and may
    /// resolve before the write is acknowledged.
    pub async fn write_value(
        &self,
        peripheral: &Peripheral,
        characteristic: &CharacteristicInfo,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let rx = self.register(peripheral.id, OpKind::Write(characteristic.uuid));
        self.binding
            .write_value(peripheral.id, characteristic.uuid, data, with_response)
            .await?;
        Self::wait_done(rx).await
    }

    /// Enables or disables notifications on a characteristic.
    ///
    /// If the requested state already matches the adapter-reported state
    /// this returns without touching the adapter at all; asking twice is
    /// not an error.
    pub async fn set_notification(
        &self,
        peripheral: &Peripheral,
        characteristic: &CharacteristicInfo,
        enable: bool,
    ) -> Result<()> {
        let current = self
            .cached_characteristic(peripheral.id, characteristic.uuid)
            .map(|c| c.is_notifying)
            .unwrap_or(characteristic.is_notifying);
        if current == enable {
            debug!(
                "set_notification: {} already {} on {}",
                characteristic.uuid,
                if enable { "notifying" } else { "silent" },
                peripheral.id
            );
            return Ok(());
        }

        let rx = self.register(peripheral.id, OpKind::SetNotify(characteristic.uuid));
        self.binding
            .set_notify(peripheral.id, characteristic.uuid, enable)
            .await?;
        match Self::wait(rx).await? {
            OpOutcome::NotifyState(_) => Ok(()),
            _ => Err(Error::BindingClosed),
        }
    }

    /// Single-shot signal strength read.
    pub async fn read_rssi(&self, peripheral: &Peripheral) -> Result<i16> {
        let rx = self.register(peripheral.id, OpKind::ReadRssi);
        self.binding.read_rssi(peripheral.id).await?;
        match Self::wait(rx).await? {
            OpOutcome::Rssi(rssi) => Ok(rssi),
            _ => Err(Error::BindingClosed),
        }
    }

    /// Connection state of a device, as last reported by the adapter.
    pub fn connection_state(&self, device: Uuid) -> ConnectionState {
        self.states
            .lock()
            .unwrap()
            .get(&device)
            .copied()
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn cached_characteristic(&self, device: Uuid, characteristic: Uuid) -> Option<CharacteristicInfo> {
        self.cache
            .lock()
            .unwrap()
            .get(&device)
            .and_then(|chars| chars.get(&characteristic))
            .cloned()
    }

    fn register(&self, device: Uuid, kind: OpKind) -> oneshot::Receiver<OpResult> {
        self.pending.lock().unwrap().register(device, kind)
    }

    async fn wait(rx: oneshot::Receiver<OpResult>) -> Result<OpOutcome> {
        rx.await.map_err(|_| Error::BindingClosed)?
    }

    async fn wait_done(rx: oneshot::Receiver<OpResult>) -> Result<()> {
        Self::wait(rx).await.map(|_| ())
    }

    /// Consumes adapter events one at a time, in platform order, resolving
    /// the matching pending request for each and keeping the cache and
    /// state tables in step with what the adapter reports.
    async fn pump(
        mut events: mpsc::UnboundedReceiver<AdapterEvent>,
        pending: Arc<Mutex<PendingOps>>,
        cache: Arc<Mutex<CharacteristicCache>>,
        states: Arc<Mutex<HashMap<Uuid, ConnectionState>>>,
        peripherals: Arc<Mutex<HashMap<Uuid, Peripheral>>>,
        scan_sink: Arc<Mutex<Option<mpsc::UnboundedSender<Discovery>>>>,
        manager_tx: mpsc::UnboundedSender<ManagerEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                AdapterEvent::StateChanged(state) => {
                    info!("central stack state: {:?}", state);
                }
                AdapterEvent::PeripheralDiscovered {
                    peripheral,
                    advertisement,
                    rssi,
                } => {
                    peripherals
                        .lock()
                        .unwrap()
                        .insert(peripheral.id, peripheral.clone());
                    if let Some(sink) = scan_sink.lock().unwrap().as_ref() {
                        let _ = sink.send(Discovery {
                            peripheral,
                            advertisement,
                            rssi,
                        });
                    }
                }
                AdapterEvent::Connected { device } => {
                    states
                        .lock()
                        .unwrap()
                        .insert(device, ConnectionState::Connected);
                    pending
                        .lock()
                        .unwrap()
                        .resolve(device, OpKind::Connect, Ok(OpOutcome::Done));
                }
                AdapterEvent::ConnectFailed { device, error } => {
                    states
                        .lock()
                        .unwrap()
                        .insert(device, ConnectionState::Disconnected);
                    pending
                        .lock()
                        .unwrap()
                        .resolve(device, OpKind::Connect, Err(Error::Adapter(error)));
                }
                AdapterEvent::Disconnected { device, error } => {
                    if let Some(error) = error {
                        warn!("device {} disconnected: {}", device, error);
                    }
                    states
                        .lock()
                        .unwrap()
                        .insert(device, ConnectionState::Disconnected);
                    // Stale handles must not survive a reconnect.
                    cache.lock().unwrap().remove(&device);
                    pending
                        .lock()
                        .unwrap()
                        .resolve(device, OpKind::Disconnect, Ok(OpOutcome::Done));
                    let peripheral = peripherals
                        .lock()
                        .unwrap()
                        .get(&device)
                        .cloned()
                        .unwrap_or_else(|| Peripheral::new(device, None));
                    let _ = manager_tx.send(ManagerEvent::Disconnected { peripheral });
                }
                AdapterEvent::ServicesDiscovered { device, result } => {
                    let resolved = pending.lock().unwrap().resolve(
                        device,
                        OpKind::DiscoverServices,
                        result.map(OpOutcome::Services),
                    );
                    if !resolved {
                        debug!("unsolicited service discovery for {}", device);
                    }
                }
                AdapterEvent::CharacteristicsDiscovered { device, result, .. } => {
                    let result = result.map(|characteristics| {
                        // Every characteristic the platform reports goes
                        // into the cache, requested or not.
                        let mut cache = cache.lock().unwrap();
                        let entry = cache.entry(device).or_default();
                        for c in &characteristics {
                            entry.insert(c.uuid, c.clone());
                        }
                        OpOutcome::Characteristics(characteristics)
                    });
                    pending
                        .lock()
                        .unwrap()
                        .resolve(device, OpKind::DiscoverCharacteristics, result);
                }
                AdapterEvent::ValueUpdated {
                    device,
                    characteristic,
                    result,
                } => match result {
                    Ok(data) => {
                        pending.lock().unwrap().resolve(
                            device,
                            OpKind::Read(characteristic),
                            Ok(OpOutcome::Done),
                        );
                        let peripheral = peripherals
                            .lock()
                            .unwrap()
                            .get(&device)
                            .cloned()
                            .unwrap_or_else(|| Peripheral::new(device, None));
                        let info = cache
                            .lock()
                            .unwrap()
                            .get(&device)
                            .and_then(|chars| chars.get(&characteristic))
                            .cloned()
                            .unwrap_or(CharacteristicInfo {
                                uuid: characteristic,
                                service: Uuid::nil(),
                                device,
                                is_notifying: false,
                            });
                        let _ = manager_tx.send(ManagerEvent::DataReceived {
                            peripheral,
                            characteristic: info,
                            data,
                        });
                    }
                    Err(e) => {
                        pending.lock().unwrap().resolve(
                            device,
                            OpKind::Read(characteristic),
                            Err(e),
                        );
                    }
                },
                AdapterEvent::ValueWritten {
                    device,
                    characteristic,
                    result,
                } => {
                    pending.lock().unwrap().resolve(
                        device,
                        OpKind::Write(characteristic),
                        result.map(|_| OpOutcome::Done),
                    );
                }
                AdapterEvent::NotifyStateUpdated {
                    device,
                    characteristic,
                    result,
                } => {
                    let result = result.map(|enabled| {
                        if let Some(c) = cache
                            .lock()
                            .unwrap()
                            .get_mut(&device)
                            .and_then(|chars| chars.get_mut(&characteristic))
                        {
                            c.is_notifying = enabled;
                        }
                        OpOutcome::NotifyState(enabled)
                    });
                    pending
                        .lock()
                        .unwrap()
                        .resolve(device, OpKind::SetNotify(characteristic), result);
                }
                AdapterEvent::RssiRead { device, result } => {
                    pending.lock().unwrap().resolve(
                        device,
                        OpKind::ReadRssi,
                        result.map(OpOutcome::Rssi),
                    );
                }
            }
        }
        debug!("adapter event channel closed, pump exiting");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.pump_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_ops_resolve_in_issue_order() {
        let device = Uuid::from_u128(1);
        let characteristic = Uuid::from_u128(2);
        let mut pending = PendingOps::default();

        let first = pending.register(device, OpKind::Read(characteristic));
        let second = pending.register(device, OpKind::Read(characteristic));

        assert!(pending.resolve(device, OpKind::Read(characteristic), Ok(OpOutcome::Done)));
        assert!(pending.resolve(
            device,
            OpKind::Read(characteristic),
            Err(Error::Adapter("gone".into()))
        ));

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_pending_ops_unsolicited_event_resolves_nothing() {
        let device = Uuid::from_u128(1);
        let mut pending = PendingOps::default();
        assert!(!pending.resolve(device, OpKind::ReadRssi, Ok(OpOutcome::Rssi(-40))));
    }

    #[tokio::test]
    async fn test_pending_ops_keys_by_characteristic() {
        let device = Uuid::from_u128(1);
        let a = Uuid::from_u128(0xa);
        let b = Uuid::from_u128(0xb);
        let mut pending = PendingOps::default();

        let read_a = pending.register(device, OpKind::Read(a));
        let _read_b = pending.register(device, OpKind::Read(b));

        // Resolving characteristic A leaves B pending.
        assert!(pending.resolve(device, OpKind::Read(a), Ok(OpOutcome::Done)));
        assert!(read_a.await.unwrap().is_ok());
        assert!(pending.resolve(device, OpKind::Read(b), Ok(OpOutcome::Done)));
    }
}
