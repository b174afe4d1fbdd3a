//! BLE central coordinator library
//! This crate handles the central side of Bluetooth Low Energy: scanning
//! for peripherals, connecting to them, discovering their services and
//! characteristics, and serializing read/write/notify operations against
//! a single adapter, with discovered characteristics cached per device.

mod adapter;
mod bluest_binding;
mod central;
mod constants;
mod error;
mod manager;
mod observer;
mod scanner;
mod types;

// Re-export types that should be publicly accessible
pub use adapter::{AdapterBinding, AdapterEvent, AdapterState};
pub use bluest_binding::BluestBinding;
pub use central::CentralHelper;
pub use constants::*; // Re-export all constants
pub use error::{Error, Result};
pub use manager::{ConnectionManager, ManagerEvent};
pub use observer::CentralObserver;
pub use scanner::ScanSession;
pub use types::{
    parse_uuid, AdvertisementData, CharacteristicInfo, ConnectionState, Discovery, Peripheral,
    ServiceInfo,
};
