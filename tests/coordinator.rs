//! End-to-end tests for the session coordinator over a scripted adapter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use ble_central::{
    AdapterBinding, AdapterEvent, CentralHelper, CentralObserver, CharacteristicInfo, Error,
    Peripheral, Result, ServiceInfo,
};

const DEVICE_A: Uuid = Uuid::from_u128(0xa);
const DEVICE_B: Uuid = Uuid::from_u128(0xb);
const DEVICE_C: Uuid = Uuid::from_u128(0xc);
const SERVICE: Uuid = Uuid::from_u128(0x5e1);
const DECOY_SERVICE: Uuid = Uuid::from_u128(0xdec0);
const CHARACTERISTIC: Uuid = Uuid::from_u128(0xc4a1);

/// A peripheral the fake platform knows about.
#[derive(Clone)]
struct FakePeripheral {
    id: Uuid,
    name: Option<String>,
    rssi: i16,
    /// (service UUID, characteristic UUIDs)
    services: Vec<(Uuid, Vec<Uuid>)>,
    connectable: bool,
    read_value: Vec<u8>,
    /// How many advertisement reports one scan produces for this device
    adv_repeats: usize,
}

impl FakePeripheral {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            name: Some(format!("fake-{}", id)),
            rssi: -42,
            services: vec![(SERVICE, vec![CHARACTERISTIC])],
            connectable: true,
            read_value: vec![0x01, 0x02],
            adv_repeats: 1,
        }
    }

    fn with_services(mut self, services: Vec<(Uuid, Vec<Uuid>)>) -> Self {
        self.services = services;
        self
    }

    fn with_adv_repeats(mut self, repeats: usize) -> Self {
        self.adv_repeats = repeats;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    StartScan { filter: Option<Uuid>, allow_duplicates: bool },
    StopScan,
    Connect(Uuid),
    CancelConnection(Uuid),
    DiscoverServices(Uuid),
    DiscoverCharacteristics(Uuid, Uuid),
    Read(Uuid, Uuid),
    Write(Uuid, Uuid, Vec<u8>, bool),
    SetNotify(Uuid, Uuid, bool),
    ReadRssi(Uuid),
}

/// Scripted in-memory platform stack: every command is recorded and
/// answered immediately with the matching event.
struct FakeBinding {
    peripherals: HashMap<Uuid, FakePeripheral>,
    commands: Mutex<Vec<Command>>,
    events: mpsc::UnboundedSender<AdapterEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AdapterEvent>>>,
    /// When false the fake, like some real platforms, ignores discovery
    /// filters and reports everything it has.
    honor_filters: bool,
}

impl FakeBinding {
    fn new(peripherals: Vec<FakePeripheral>) -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            peripherals: peripherals.into_iter().map(|p| (p.id, p)).collect(),
            commands: Mutex::new(Vec::new()),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            honor_filters: true,
        })
    }

    fn ignoring_filters(peripherals: Vec<FakePeripheral>) -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            peripherals: peripherals.into_iter().map(|p| (p.id, p)).collect(),
            commands: Mutex::new(Vec::new()),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            honor_filters: false,
        })
    }

    fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    fn count(&self, predicate: impl Fn(&Command) -> bool) -> usize {
        self.commands().iter().filter(|c| predicate(c)).count()
    }

    /// Injects a spontaneous platform event, e.g. a connection loss or an
    /// unsolicited notification push.
    fn push(&self, event: AdapterEvent) {
        self.events.send(event).unwrap();
    }

    fn record(&self, command: Command) {
        self.commands.lock().unwrap().push(command);
    }
}

#[async_trait]
impl AdapterBinding for FakeBinding {
    async fn start_scan(&self, service_filter: Option<Uuid>, allow_duplicates: bool) -> Result<()> {
        self.record(Command::StartScan {
            filter: service_filter,
            allow_duplicates,
        });
        for peripheral in self.peripherals.values() {
            if let Some(filter) = service_filter {
                if !peripheral.services.iter().any(|(uuid, _)| *uuid == filter) {
                    continue;
                }
            }
            let repeats = if allow_duplicates { peripheral.adv_repeats } else { 1 };
            for _ in 0..repeats {
                self.push(AdapterEvent::PeripheralDiscovered {
                    peripheral: Peripheral::new(peripheral.id, peripheral.name.clone()),
                    advertisement: Default::default(),
                    rssi: Some(peripheral.rssi),
                });
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(Command::StopScan);
        Ok(())
    }

    async fn connect(&self, device: Uuid) -> Result<()> {
        self.record(Command::Connect(device));
        match self.peripherals.get(&device) {
            Some(p) if p.connectable => self.push(AdapterEvent::Connected { device }),
            _ => self.push(AdapterEvent::ConnectFailed {
                device,
                error: "peripheral refused".into(),
            }),
        }
        Ok(())
    }

    async fn cancel_connection(&self, device: Uuid) -> Result<()> {
        self.record(Command::CancelConnection(device));
        self.push(AdapterEvent::Disconnected { device, error: None });
        Ok(())
    }

    async fn known_peripherals(&self, ids: &[Uuid]) -> Result<Vec<Peripheral>> {
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.peripherals
                    .get(id)
                    .map(|p| Peripheral::new(p.id, p.name.clone()))
            })
            .collect())
    }

    async fn discover_services(&self, device: Uuid, filter: Option<Uuid>) -> Result<()> {
        self.record(Command::DiscoverServices(device));
        let result = match self.peripherals.get(&device) {
            Some(p) => Ok(p
                .services
                .iter()
                .map(|(uuid, _)| ServiceInfo { uuid: *uuid, device })
                .filter(|s| !self.honor_filters || filter.is_none() || filter == Some(s.uuid))
                .collect()),
            None => Err(Error::Adapter("unknown device".into())),
        };
        self.push(AdapterEvent::ServicesDiscovered { device, result });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        device: Uuid,
        service: Uuid,
        filter: Option<Uuid>,
    ) -> Result<()> {
        self.record(Command::DiscoverCharacteristics(device, service));
        let result = match self
            .peripherals
            .get(&device)
            .and_then(|p| p.services.iter().find(|(uuid, _)| *uuid == service))
        {
            Some((_, characteristics)) => Ok(characteristics
                .iter()
                .filter(|uuid| !self.honor_filters || filter.is_none() || filter == Some(**uuid))
                .map(|uuid| CharacteristicInfo {
                    uuid: *uuid,
                    service,
                    device,
                    is_notifying: false,
                })
                .collect()),
            None => Err(Error::Adapter("unknown service".into())),
        };
        self.push(AdapterEvent::CharacteristicsDiscovered {
            device,
            service,
            result,
        });
        Ok(())
    }

    async fn read_value(&self, device: Uuid, characteristic: Uuid) -> Result<()> {
        self.record(Command::Read(device, characteristic));
        let value = self
            .peripherals
            .get(&device)
            .map(|p| p.read_value.clone())
            .unwrap_or_default();
        self.push(AdapterEvent::ValueUpdated {
            device,
            characteristic,
            result: Ok(Some(value)),
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
        self.record(Command::Write(
            device,
            characteristic,
            data.to_vec(),
            with_response,
        ));
        self.push(AdapterEvent::ValueWritten {
            device,
            characteristic,
            result: Ok(()),
        });
        Ok(())
    }

    async fn set_notify(&self, device: Uuid, characteristic: Uuid, enable: bool) -> Result<()> {
        self.record(Command::SetNotify(device, characteristic, enable));
        self.push(AdapterEvent::NotifyStateUpdated {
            device,
            characteristic,
            result: Ok(enable),
        });
        Ok(())
    }

    async fn read_rssi(&self, device: Uuid) -> Result<()> {
        self.record(Command::ReadRssi(device));
        let result = self
            .peripherals
            .get(&device)
            .map(|p| p.rssi)
            .ok_or_else(|| Error::Adapter("unknown device".into()));
        self.push(AdapterEvent::RssiRead { device, result });
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AdapterEvent>> {
        self.events_rx.lock().unwrap().take()
    }
}

#[derive(Default)]
struct RecordingObserver {
    disconnects: Mutex<Vec<Uuid>>,
    data: Mutex<Vec<(Uuid, Uuid, Option<Vec<u8>>)>>,
}

impl CentralObserver for RecordingObserver {
    fn on_disconnect(&self, peripheral: &Peripheral) {
        self.disconnects.lock().unwrap().push(peripheral.id);
    }

    fn on_data_received(
        &self,
        data: Option<&[u8]>,
        peripheral: &Peripheral,
        characteristic: &CharacteristicInfo,
    ) {
        self.data.lock().unwrap().push((
            peripheral.id,
            characteristic.uuid,
            data.map(<[u8]>::to_vec),
        ));
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn connected_helper(binding: Arc<FakeBinding>, devices: &[Uuid]) -> CentralHelper {
    let helper = CentralHelper::with_binding(binding).unwrap();
    for id in devices {
        helper.connect(&Peripheral::new(*id, None)).await.unwrap();
    }
    helper
}

/// Lets in-flight events drain through the pump and dispatch tasks.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn discovery_happens_once_per_device_and_characteristic() {
    init_logging();
    let binding = FakeBinding::new(vec![FakePeripheral::new(DEVICE_A)]);
    let helper = connected_helper(binding.clone(), &[DEVICE_A]).await;
    let device = DEVICE_A.to_string();
    let service = SERVICE.to_string();
    let characteristic = CHARACTERISTIC.to_string();

    helper
        .read_value(&device, &service, &characteristic)
        .await
        .unwrap();
    helper
        .read_value(&device, &service, &characteristic)
        .await
        .unwrap();
    helper
        .write_value(&device, &service, &characteristic, &[0xAB], true)
        .await
        .unwrap();

    // One discovery round-trip total; everything after the first read is
    // served from the cache.
    assert_eq!(
        binding.count(|c| matches!(c, Command::DiscoverServices(_))),
        1
    );
    assert_eq!(
        binding.count(|c| matches!(c, Command::DiscoverCharacteristics(..))),
        1
    );
    assert_eq!(binding.count(|c| matches!(c, Command::Read(..))), 2);
    assert_eq!(
        binding.count(|c| matches!(c, Command::Write(_, _, data, true) if data == &[0xAB])),
        1
    );
}

#[tokio::test]
async fn disconnect_purges_cache_and_forces_rediscovery() {
    init_logging();
    let binding = FakeBinding::new(vec![FakePeripheral::new(DEVICE_A)]);
    let helper = connected_helper(binding.clone(), &[DEVICE_A]).await;
    let device = DEVICE_A.to_string();
    let service = SERVICE.to_string();
    let characteristic = CHARACTERISTIC.to_string();

    helper
        .read_value(&device, &service, &characteristic)
        .await
        .unwrap();
    helper.disconnect(Some(&device)).await.unwrap();

    // Reconnect and read again: stale handles must not be reused.
    helper
        .connect(&Peripheral::new(DEVICE_A, None))
        .await
        .unwrap();
    helper
        .read_value(&device, &service, &characteristic)
        .await
        .unwrap();

    assert_eq!(
        binding.count(|c| matches!(c, Command::DiscoverServices(_))),
        2
    );
}

#[tokio::test]
async fn enable_notification_twice_issues_one_adapter_request() {
    init_logging();
    let binding = FakeBinding::new(vec![FakePeripheral::new(DEVICE_A)]);
    let helper = connected_helper(binding.clone(), &[DEVICE_A]).await;
    let device = DEVICE_A.to_string();
    let service = SERVICE.to_string();
    let characteristic = CHARACTERISTIC.to_string();

    helper
        .enable_notification(true, &device, &service, &characteristic)
        .await
        .unwrap();
    helper
        .enable_notification(true, &device, &service, &characteristic)
        .await
        .unwrap();

    assert_eq!(
        binding.count(|c| matches!(c, Command::SetNotify(_, _, true))),
        1
    );
}

#[tokio::test]
async fn scan_completes_at_timeout_with_deduplicated_results() {
    init_logging();
    let binding = FakeBinding::new(vec![
        FakePeripheral::new(DEVICE_A).with_adv_repeats(2),
        FakePeripheral::new(DEVICE_B),
    ]);
    let helper = CentralHelper::with_binding(binding.clone()).unwrap();

    let started = tokio::time::Instant::now();
    let peripherals = helper.scan(Duration::from_millis(300), None).await.unwrap();

    // Three advertisements, two distinct peripherals, and no early exit.
    assert_eq!(peripherals.len(), 2);
    assert!(started.elapsed() >= Duration::from_millis(300));

    // Unfiltered scans ask the platform for duplicate reports.
    assert_eq!(
        binding.count(|c| matches!(
            c,
            Command::StartScan { filter: None, allow_duplicates: true }
        )),
        1
    );
}

#[tokio::test]
async fn filtered_scan_suppresses_duplicates_and_unmatched_devices() {
    init_logging();
    let binding = FakeBinding::new(vec![
        FakePeripheral::new(DEVICE_A),
        FakePeripheral::new(DEVICE_B).with_services(vec![(DECOY_SERVICE, vec![])]),
    ]);
    let helper = CentralHelper::with_binding(binding.clone()).unwrap();

    let peripherals = helper
        .scan(Duration::from_millis(200), Some(&SERVICE.to_string()))
        .await
        .unwrap();

    assert_eq!(peripherals.len(), 1);
    assert_eq!(peripherals[0].id, DEVICE_A);
    assert_eq!(
        binding.count(|c| matches!(
            c,
            Command::StartScan { filter: Some(_), allow_duplicates: false }
        )),
        1
    );
}

#[tokio::test]
async fn disconnect_all_unregisters_every_device_and_clears_scan_results() {
    init_logging();
    let binding = FakeBinding::new(vec![
        FakePeripheral::new(DEVICE_A),
        FakePeripheral::new(DEVICE_B),
        FakePeripheral::new(DEVICE_C),
    ]);
    let helper = connected_helper(binding.clone(), &[DEVICE_A, DEVICE_B, DEVICE_C]).await;
    for id in [DEVICE_A, DEVICE_B, DEVICE_C] {
        assert!(helper.is_connected(&id.to_string()));
    }

    helper.disconnect(None).await.unwrap();

    for id in [DEVICE_A, DEVICE_B, DEVICE_C] {
        assert!(!helper.is_connected(&id.to_string()));
    }
    assert!(helper.connected_peripherals().is_empty());
    assert_eq!(
        binding.count(|c| matches!(c, Command::CancelConnection(_))),
        3
    );
}

#[tokio::test]
async fn overlapping_reads_on_one_characteristic_both_resolve() {
    init_logging();
    let binding = FakeBinding::new(vec![FakePeripheral::new(DEVICE_A)]);
    let helper = connected_helper(binding.clone(), &[DEVICE_A]).await;
    let device = DEVICE_A.to_string();
    let service = SERVICE.to_string();
    let characteristic = CHARACTERISTIC.to_string();

    // The pending table keys requests and resolves them in issue order, so
    // neither read displaces the other.
    let (first, second) = tokio::join!(
        helper.read_value(&device, &service, &characteristic),
        helper.read_value(&device, &service, &characteristic),
    );
    first.unwrap();
    second.unwrap();
    assert_eq!(binding.count(|c| matches!(c, Command::Read(..))), 2);
}

#[tokio::test]
async fn retrieve_of_unknown_identifier_yields_nothing_and_no_error() {
    init_logging();
    let binding = FakeBinding::new(vec![FakePeripheral::new(DEVICE_A)]);
    let helper = CentralHelper::with_binding(binding.clone()).unwrap();

    let never_seen = Uuid::from_u128(0xdead).to_string();
    let peripherals = helper.retrieve(&[&never_seen]).await.unwrap();
    assert!(peripherals.is_empty());
    assert!(!helper.is_connected(&never_seen));
}

#[tokio::test]
async fn retrieve_connects_and_registers_known_devices() {
    init_logging();
    let binding = FakeBinding::new(vec![FakePeripheral::new(DEVICE_A)]);
    let helper = CentralHelper::with_binding(binding.clone()).unwrap();

    let device = DEVICE_A.to_string();
    let peripherals = helper.retrieve(&[&device]).await.unwrap();
    assert_eq!(peripherals.len(), 1);
    assert!(helper.is_connected(&device));
    // The warm-up scan precedes the connect.
    let commands = binding.commands();
    let scan_at = commands
        .iter()
        .position(|c| matches!(c, Command::StartScan { .. }))
        .unwrap();
    let connect_at = commands
        .iter()
        .position(|c| matches!(c, Command::Connect(_)))
        .unwrap();
    assert!(scan_at < connect_at);
}

#[tokio::test]
async fn service_match_beyond_first_reported_service_is_found() {
    init_logging();
    // A platform that ignores discovery filters reports the decoy service
    // first; the requested one must still be found behind it.
    let binding = FakeBinding::ignoring_filters(vec![FakePeripheral::new(DEVICE_A)
        .with_services(vec![
            (DECOY_SERVICE, vec![Uuid::from_u128(0xbeef)]),
            (SERVICE, vec![CHARACTERISTIC]),
        ])]);
    let helper = connected_helper(binding.clone(), &[DEVICE_A]).await;

    helper
        .read_value(
            &DEVICE_A.to_string(),
            &SERVICE.to_string(),
            &CHARACTERISTIC.to_string(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn unsolicited_characteristics_are_cached_too() {
    init_logging();
    // Filter-ignoring platform returns both characteristics of the service;
    // asking for the second afterwards must not re-discover.
    let binding = FakeBinding::ignoring_filters(vec![FakePeripheral::new(DEVICE_A)
        .with_services(vec![(
            SERVICE,
            vec![CHARACTERISTIC, Uuid::from_u128(0xc4a2)],
        )])]);
    let helper = connected_helper(binding.clone(), &[DEVICE_A]).await;
    let device = DEVICE_A.to_string();
    let service = SERVICE.to_string();

    helper
        .read_value(&device, &service, &CHARACTERISTIC.to_string())
        .await
        .unwrap();
    helper
        .read_value(&device, &service, &Uuid::from_u128(0xc4a2).to_string())
        .await
        .unwrap();

    assert_eq!(
        binding.count(|c| matches!(c, Command::DiscoverServices(_))),
        1
    );
}

#[tokio::test]
async fn observer_hears_disconnects_and_data() {
    init_logging();
    let binding = FakeBinding::new(vec![FakePeripheral::new(DEVICE_A)]);
    let helper = connected_helper(binding.clone(), &[DEVICE_A]).await;
    let observer = Arc::new(RecordingObserver::default());
    helper.set_observer(observer.clone());

    // An explicit read delivers its bytes through the data callback.
    helper
        .read_value(
            &DEVICE_A.to_string(),
            &SERVICE.to_string(),
            &CHARACTERISTIC.to_string(),
        )
        .await
        .unwrap();

    // An unsolicited notification push uses the same channel.
    binding.push(AdapterEvent::ValueUpdated {
        device: DEVICE_A,
        characteristic: CHARACTERISTIC,
        result: Ok(Some(vec![0x99])),
    });

    // A spontaneous link loss reaches the observer undistinguished from a
    // requested one.
    binding.push(AdapterEvent::Disconnected {
        device: DEVICE_A,
        error: Some("supervision timeout".into()),
    });
    settle().await;

    let data = observer.data.lock().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0], (DEVICE_A, CHARACTERISTIC, Some(vec![0x01, 0x02])));
    assert_eq!(data[1], (DEVICE_A, CHARACTERISTIC, Some(vec![0x99])));
    assert_eq!(*observer.disconnects.lock().unwrap(), vec![DEVICE_A]);
}

#[tokio::test]
async fn spontaneous_disconnect_leaves_device_registered_but_not_connected() {
    init_logging();
    let binding = FakeBinding::new(vec![FakePeripheral::new(DEVICE_A)]);
    let helper = connected_helper(binding.clone(), &[DEVICE_A]).await;
    let device = DEVICE_A.to_string();
    assert!(helper.is_connected(&device));

    binding.push(AdapterEvent::Disconnected {
        device: DEVICE_A,
        error: None,
    });
    settle().await;

    // Still in the table, but the live state says disconnected.
    assert!(!helper.is_connected(&device));
    assert_eq!(helper.connected_peripherals().len(), 1);
}

#[tokio::test]
async fn connect_supersedes_an_active_scan() {
    init_logging();
    let binding = FakeBinding::new(vec![FakePeripheral::new(DEVICE_A)]);
    let helper = Arc::new(CentralHelper::with_binding(binding.clone()).unwrap());

    let scanning = {
        let helper = helper.clone();
        tokio::spawn(async move { helper.scan(Duration::from_secs(10), None).await })
    };
    settle().await;

    helper
        .connect(&Peripheral::new(DEVICE_A, None))
        .await
        .unwrap();

    assert!(matches!(
        scanning.await.unwrap(),
        Err(Error::ScanSuperseded)
    ));
    assert!(helper.is_connected(&DEVICE_A.to_string()));
}

#[tokio::test]
async fn read_rssi_returns_platform_measurement() {
    init_logging();
    let binding = FakeBinding::new(vec![FakePeripheral::new(DEVICE_A)]);
    let helper = connected_helper(binding.clone(), &[DEVICE_A]).await;

    let rssi = helper.read_rssi(&DEVICE_A.to_string()).await.unwrap();
    assert_eq!(rssi, -42);
    assert_eq!(binding.count(|c| matches!(c, Command::ReadRssi(_))), 1);
}

#[tokio::test]
async fn operations_against_unregistered_devices_fail_fast() {
    init_logging();
    let binding = FakeBinding::new(vec![FakePeripheral::new(DEVICE_A)]);
    let helper = CentralHelper::with_binding(binding.clone()).unwrap();

    let result = helper
        .read_value(
            &DEVICE_A.to_string(),
            &SERVICE.to_string(),
            &CHARACTERISTIC.to_string(),
        )
        .await;
    assert!(matches!(result, Err(Error::NotRegistered { .. })));
    assert!(binding.commands().is_empty());
}

#[tokio::test]
async fn disconnect_disables_active_notifications_first() {
    init_logging();
    let binding = FakeBinding::new(vec![FakePeripheral::new(DEVICE_A)]);
    let helper = connected_helper(binding.clone(), &[DEVICE_A]).await;
    let device = DEVICE_A.to_string();

    helper
        .enable_notification(true, &device, &SERVICE.to_string(), &CHARACTERISTIC.to_string())
        .await
        .unwrap();
    helper.disconnect(Some(&device)).await.unwrap();

    let commands = binding.commands();
    let notify_off = commands
        .iter()
        .position(|c| matches!(c, Command::SetNotify(_, _, false)))
        .expect("notification must be torn down");
    let cancel = commands
        .iter()
        .position(|c| matches!(c, Command::CancelConnection(_)))
        .unwrap();
    assert!(notify_off < cancel);
}
