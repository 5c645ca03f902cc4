//! Error types for open-peq-core.

use thiserror::Error;

/// Core library error type.
#[derive(Debug, Error)]
pub enum Error {
    /// HID device communication failure outside of a single write.
    #[error("HID error: {0}")]
    Hid(String),

    /// Device not found during enumeration.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// No adapter is registered for this manufacturer/model pair.
    #[error("no PEQ adapter for {manufacturer} {model}")]
    UnsupportedDevice { manufacturer: String, model: String },

    /// A report was issued on a transport that is not open.
    #[error("transport not open: {0}")]
    TransportNotOpen(String),

    /// The transport rejected an outbound report or byte write.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A correlated response never arrived within the wait budget.
    #[error("timeout after {waited_ms} ms waiting for {operation}")]
    Timeout {
        operation: &'static str,
        waited_ms: u64,
    },

    /// The device went away while an operation was in flight.
    #[error("device disconnected: {0}")]
    DeviceDisconnected(String),

    /// A response could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Value out of the encodable or device-supported range.
    #[error("value out of range: {field} = {value} (allowed {min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;
