//! Adapter binding trait for the platform BLE central stack
//! This is the injectable seam between the coordinator and the radio:
//! commands are issued as async calls, results come back as events on a
//! single channel, one event per completed platform operation.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{AdvertisementData, CharacteristicInfo, Peripheral, ServiceInfo};

/// Power/authorization state of the platform central stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// Asynchronous events emitted by the platform central stack.
///
/// All events for one binding are delivered on one channel and consumed by
/// a single task, so they are processed strictly one at a time and in the
/// order the platform emitted them.
#[derive(Debug)]
pub enum AdapterEvent {
    /// The central stack changed power or authorization state
    StateChanged(AdapterState),
    /// An advertisement was received during an active scan
    PeripheralDiscovered {
        peripheral: Peripheral,
        advertisement: AdvertisementData,
        rssi: Option<i16>,
    },
    /// A connect request succeeded
    Connected { device: Uuid },
    /// A connect request failed, with the platform's description
    ConnectFailed { device: Uuid, error: String },
    /// The link to a device dropped, requested or not
    Disconnected { device: Uuid, error: Option<String> },
    /// Service discovery finished for a device
    ServicesDiscovered {
        device: Uuid,
        result: Result<Vec<ServiceInfo>>,
    },
    /// Characteristic discovery finished for a service
    CharacteristicsDiscovered {
        device: Uuid,
        service: Uuid,
        result: Result<Vec<CharacteristicInfo>>,
    },
    /// A characteristic's value arrived, from an explicit read or a
    /// peripheral-initiated notification
    ValueUpdated {
        device: Uuid,
        characteristic: Uuid,
        result: Result<Option<Vec<u8>>>,
    },
    /// A write completed
    ValueWritten {
        device: Uuid,
        characteristic: Uuid,
        result: Result<()>,
    },
    /// The platform acknowledged a notify-enable/-disable request
    NotifyStateUpdated {
        device: Uuid,
        characteristic: Uuid,
        result: Result<bool>,
    },
    /// A single-shot RSSI read finished
    RssiRead { device: Uuid, result: Result<i16> },
}

/// Thin interface to the platform's BLE central stack.
///
/// Commands return as soon as the platform accepts them; completion is
/// reported through [`AdapterEvent`]s. Implementations translate between
/// the crate's UUID identifiers and whatever native handles the platform
/// uses. Ships with a [`bluest`-backed implementation](crate::BluestBinding);
/// tests substitute scripted fakes.
#[async_trait]
pub trait AdapterBinding: Send + Sync {
    /// Begins scanning. With a filter only matching advertisements are
    /// reported; `allow_duplicates` controls repeat reports per device.
    async fn start_scan(&self, service_filter: Option<Uuid>, allow_duplicates: bool) -> Result<()>;

    /// Stops any active scan. Idempotent.
    async fn stop_scan(&self) -> Result<()>;

    /// Requests a connection with notify-on-disconnect semantics; resolves
    /// via `Connected` or `ConnectFailed`.
    async fn connect(&self, device: Uuid) -> Result<()>;

    /// Requests disconnection; resolves via `Disconnected`.
    async fn cancel_connection(&self, device: Uuid) -> Result<()>;

    /// Resolves previously-seen identifiers to live peripherals. Unknown
    /// identifiers are simply absent from the result, never an error.
    async fn known_peripherals(&self, ids: &[Uuid]) -> Result<Vec<Peripheral>>;

    /// Starts service discovery; resolves via `ServicesDiscovered`.
    async fn discover_services(&self, device: Uuid, filter: Option<Uuid>) -> Result<()>;

    /// Starts characteristic discovery within one service; resolves via
    /// `CharacteristicsDiscovered`.
    async fn discover_characteristics(
        &self,
        device: Uuid,
        service: Uuid,
        filter: Option<Uuid>,
    ) -> Result<()>;

    /// Triggers a value read; resolves via `ValueUpdated`.
    async fn read_value(&self, device: Uuid, characteristic: Uuid) -> Result<()>;

    /// Writes a value. With response the platform confirms via
    /// `ValueWritten`; without response confirmation timing follows
    /// platform semantics.
    async fn write_value(
        &self,
        device: Uuid,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Enables or disables notifications; resolves via `NotifyStateUpdated`.
    async fn set_notify(&self, device: Uuid, characteristic: Uuid, enable: bool) -> Result<()>;

    /// Single-shot signal strength read; resolves via `RssiRead`.
    async fn read_rssi(&self, device: Uuid) -> Result<()>;

    /// Hands out the event channel. Single consumer; returns `None` after
    /// the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AdapterEvent>>;
}
