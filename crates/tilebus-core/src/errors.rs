//! Error types for TileBus communication
//!
//! This module contains the caller-visible error type returned by every
//! transport operation, together with the nested link-level error used when a
//! failure happens below the RPC layer (serial I/O, dongle result codes,
//! command timeouts).

use std::time::Duration;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Link-level failures that happen below the RPC exchange
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serial port error: {reason}")]
    Serial { reason: String },
    #[error("Dongle rejected {operation} with result code 0x{code:04x}")]
    DongleRejected { operation: &'static str, code: u16 },
    #[error("Timed out after {duration_ms}ms waiting for {operation}")]
    Timeout {
        operation: &'static str,
        duration_ms: u64,
    },
}

impl TransportError {
    /// Build a timeout error from the waited duration
    pub fn timeout(operation: &'static str, waited: Duration) -> Self {
        Self::Timeout {
            operation,
            duration_ms: waited.as_millis() as u64,
        }
    }
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Errors surfaced to callers of a [`crate::Transport`] or the hardware manager
#[derive(Debug, thiserror::Error)]
pub enum TileBusError {
    #[error("No radio dongle found: {reason}")]
    DeviceNotFound { reason: String },

    #[error("Timed out connecting to device")]
    ConnectTimeout,

    #[error("Device does not expose the TileBus service (found {services:?})")]
    UnsupportedDevice { services: Vec<String> },

    #[error("Not connected to a device")]
    NotConnected,

    #[error("Connection was lost before the RPC could be sent and reconnecting failed")]
    ReconnectFailed,

    #[error("No controller responded at address 8")]
    ControllerNotFound,

    #[error("Timeout waiting for RPC response (address {address}, feature 0x{feature:02x}, command 0x{command:02x})")]
    RemoteTimeout { address: u8, feature: u8, command: u8 },

    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Operation not supported by this transport: {operation}")]
    UnsupportedOperation { operation: &'static str },

    #[error("No scanned device advertises uuid 0x{uuid:08x}")]
    UnknownDevice { uuid: u32 },

    #[error("No proxy registered for tile name '{name}'")]
    UnknownProxy { name: String },

    #[error("Invalid port string '{port}': {reason}")]
    InvalidPort { port: String, reason: String },

    #[error("No transport registered under '{name}'")]
    UnknownTransport { name: String },

    #[error("Invalid argument: {0}")]
    Validation(String),

    #[error("Timeout waiting for reports: expected {expected}, received {received}")]
    ReportTimeout { expected: usize, received: usize },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl TileBusError {
    /// Create a decode error
    pub fn decode<S: Into<String>>(reason: S) -> Self {
        Self::ProtocolDecode(reason.into())
    }

    /// Create an unsupported-operation error
    pub fn unsupported(operation: &'static str) -> Self {
        Self::UnsupportedOperation { operation }
    }

    /// Whether the error came from the transport timing out at some layer
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout
                | Self::RemoteTimeout { .. }
                | Self::ControllerNotFound
                | Self::ReportTimeout { .. }
                | Self::Transport(TransportError::Timeout { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, TileBusError>;
