//! Constants used throughout the crate
//! Well-known GATT identifiers plus the internal durations and capacities
//! the coordinator relies on.

use uuid::Uuid;

/// Bottom 96 bits of the Bluetooth base UUID, used to expand 16-/32-bit
/// short-form identifiers (xxxxxxxx-0000-1000-8000-00805f9b34fb).
pub const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Standard Bluetooth Service UUIDs
pub const UUID_GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_DEVICE_NAME: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);
pub const UUID_MANUFACTURER_NAME: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);
pub const UUID_MODEL_NUMBER: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Duration of the internal scan that precedes identifier-based retrieval.
/// The platform only resolves identifiers for devices it has live instances
/// of, so retrieval always warms up with a short unfiltered scan.
pub const RETRIEVE_WARMUP_SCAN_SECS: u64 = 1;

/// Interval at which an established connection is polled for loss, in
/// milliseconds. The platform binding reports a spontaneous disconnect no
/// later than one interval after the link drops.
pub const CONNECTION_MONITOR_INTERVAL_MS: u64 = 1000;
