//! Defines shared data structures for the BLE central coordinator.

use std::collections::HashMap;

use uuid::Uuid;

use crate::constants::BLUETOOTH_BASE_UUID;
use crate::error::{Error, Result};

/// Connection state of a peripheral, as last reported by the adapter.
/// Transitions are driven only by adapter events, never asserted by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Represents a remote BLE peripheral
#[derive(Debug, Clone, serde::Serialize)]
pub struct Peripheral {
    /// Stable platform identifier for the device
    pub id: Uuid,
    /// The advertised or GAP name of the device, if available
    pub name: Option<String>,
}

impl Peripheral {
    /// Creates a new Peripheral instance
    pub fn new(id: Uuid, name: Option<String>) -> Self {
        Self { id, name }
    }
}

/// Advertisement metadata carried by a single discovery report.
/// Scan-scoped and transient; none of it is cached past the scan session.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AdvertisementData {
    /// Local name from the advertisement payload, if present
    pub local_name: Option<String>,
    /// Service UUIDs listed in the advertisement
    pub services: Vec<Uuid>,
    /// Manufacturer-specific data, keyed by company identifier
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Whether the peripheral accepts connections
    pub is_connectable: bool,
}

/// One advertisement report emitted during a scan.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub peripheral: Peripheral,
    pub advertisement: AdvertisementData,
    /// Signal strength of this report, if the platform measured one
    pub rssi: Option<i16>,
}

/// A GATT service discovered on a peripheral. Transient; only the
/// characteristics found inside it outlive the discovery pass.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    /// Identifier of the peripheral this service was discovered on
    pub device: Uuid,
}

/// A GATT characteristic handle, cached per device once discovered.
#[derive(Debug, Clone)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    /// Owning service UUID
    pub service: Uuid,
    /// Identifier of the peripheral this characteristic belongs to
    pub device: Uuid,
    /// Mirrors the adapter-reported notification state, never locally assumed
    pub is_notifying: bool,
}

/// Parses a device/service/characteristic identifier string.
///
/// Accepts full UUIDs in any casing as well as the 16- and 32-bit short
/// forms used for well-known GATT identifiers ("180F", "2A19"), which are
/// expanded against the Bluetooth base UUID.
pub fn parse_uuid(input: &str) -> Result<Uuid> {
    let trimmed = input.trim();
    let short = match trimmed.len() {
        4 | 8 => u32::from_str_radix(trimmed, 16).ok(),
        _ => None,
    };
    if let Some(value) = short {
        return Ok(Uuid::from_u128(
            BLUETOOTH_BASE_UUID | ((value as u128) << 96),
        ));
    }
    Uuid::parse_str(trimmed).map_err(|_| Error::InvalidUuid {
        input: input.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uuid() {
        let uuid = parse_uuid("c8c51726-81bc-483b-a052-f7a14ea3d281").unwrap();
        assert_eq!(uuid, Uuid::from_u128(0xc8c51726_81bc_483b_a052_f7a14ea3d281));
    }

    #[test]
    fn test_parse_short_uuid_expands_to_base() {
        let uuid = parse_uuid("180F").unwrap();
        assert_eq!(uuid, Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb));
    }

    #[test]
    fn test_parse_32_bit_short_uuid() {
        let uuid = parse_uuid("0000180f").unwrap();
        assert_eq!(uuid, Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_uuid("not-a-uuid"),
            Err(Error::InvalidUuid { .. })
        ));
    }
}
