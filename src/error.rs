//! Error types for the BLE central coordinator
//! Every fallible operation in this crate resolves to one of these variants.

use thiserror::Error;

/// Errors surfaced by the central coordinator and its adapter binding.
#[derive(Debug, Error)]
pub enum Error {
    /// No Bluetooth adapter is present or the platform stack is unusable
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,

    /// The platform stack reported an error for an issued operation
    #[error("adapter error: {0}")]
    Adapter(String),

    /// A string could not be parsed as a full or short-form UUID
    #[error("invalid UUID string: {input}")]
    InvalidUuid { input: String },

    /// The target device is not in the connected-device table
    #[error("device not registered: {device}")]
    NotRegistered { device: String },

    /// Service discovery completed without the requested service
    #[error("service not found: {service}")]
    ServiceNotFound { service: uuid::Uuid },

    /// Characteristic discovery completed without the requested characteristic
    #[error("characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: uuid::Uuid },

    /// A newer scan or a connect request cancelled this scan session
    #[error("scan superseded by a newer request")]
    ScanSuperseded,

    /// The adapter binding shut down while a request was pending
    #[error("adapter binding closed")]
    BindingClosed,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps a platform error, keeping its description.
    pub fn adapter<E: std::fmt::Display>(err: E) -> Self {
        Error::Adapter(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_keeps_description() {
        let err = Error::adapter("connection timed out");
        assert!(err.to_string().contains("connection timed out"));
    }

    #[test]
    fn test_not_registered_names_device() {
        let err = Error::NotRegistered {
            device: "6e7f0001-0000-1000-8000-00805f9b34fb".into(),
        };
        assert!(err.to_string().contains("6e7f0001"));
    }
}
