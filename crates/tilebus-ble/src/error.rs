//! Error types for the BLE transport

use std::time::Duration;

use thiserror::Error;
use tilebus_core::{TileBusError, TransportError};

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors raised by the dongle session and the BGAPI codec
#[derive(Error, Debug)]
pub enum BleTransportError {
    #[error("No BLED112 dongle found: {0}")]
    DongleNotFound(String),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dongle session closed")]
    SessionClosed,

    #[error("Timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Dongle rejected {operation} with result code 0x{code:04x}")]
    Rejected { operation: &'static str, code: u16 },

    #[error("Malformed BGAPI frame: {0}")]
    Decode(String),

    #[error("Invalid BLE address '{0}'")]
    InvalidAddress(String),

    #[error("Dongle sessions must be opened inside a Tokio runtime")]
    NoRuntime,
}

impl BleTransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<BleTransportError> for TileBusError {
    fn from(err: BleTransportError) -> Self {
        match err {
            BleTransportError::DongleNotFound(reason) => TileBusError::DeviceNotFound { reason },
            BleTransportError::SessionClosed => TileBusError::SessionClosed,
            BleTransportError::Serial(e) => TileBusError::Transport(TransportError::Serial {
                reason: e.to_string(),
            }),
            BleTransportError::Io(e) => TileBusError::Transport(TransportError::Io(e)),
            BleTransportError::Timeout { operation, timeout } => {
                TileBusError::Transport(TransportError::timeout(operation, timeout))
            }
            BleTransportError::Rejected { operation, code } => {
                TileBusError::Transport(TransportError::DongleRejected { operation, code })
            }
            BleTransportError::Decode(reason) => TileBusError::ProtocolDecode(reason),
            BleTransportError::InvalidAddress(address) => {
                TileBusError::Validation(format!("invalid BLE address '{}'", address))
            }
            BleTransportError::NoRuntime => TileBusError::Validation(
                "dongle sessions must be opened inside a Tokio runtime".to_string(),
            ),
        }
    }
}
