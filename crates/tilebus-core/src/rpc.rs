//! RPC request and response envelopes
//!
//! An RPC is a synchronous `(address, feature, command, payload) -> (status,
//! payload)` exchange with a tile. The request side packs typed arguments into
//! a fixed-format payload that is truncated to the declared argument length.
//! The response side is a 4-byte header (`status, reserved, reserved, length`)
//! followed by `length` payload bytes.

use tracing::warn;

use crate::{Result, TileBusError};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Largest argument payload a single RPC can carry
pub const MAX_RPC_PAYLOAD: usize = 20;

/// Size of the response header that precedes the payload
pub const RESPONSE_HEADER_SIZE: usize = 4;

/// Address of the controller tile on every device
pub const CONTROLLER_ADDRESS: u8 = 8;

/// Status bit indicating the response carries payload bytes
pub const STATUS_HAS_DATA: u8 = 1 << 7;

/// Status bit indicating the tile application is running
pub const STATUS_APP_RUNNING: u8 = 1 << 6;

/// Sentinel status returned when nothing answered on the bus
pub const STATUS_NO_RESPONDER: u8 = 0xFF;

// ----------------------------------------------------------------------------
// Request
// ----------------------------------------------------------------------------

/// A single typed RPC argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcArg {
    /// Packed as a little-endian 16-bit integer
    U16(u16),
    /// Packed verbatim
    Bytes(Vec<u8>),
}

impl RpcArg {
    fn encoded_len(&self) -> usize {
        match self {
            RpcArg::U16(_) => 2,
            RpcArg::Bytes(bytes) => bytes.len(),
        }
    }
}

/// An outgoing RPC addressed to one tile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    pub address: u8,
    pub feature: u8,
    pub command: u8,
    pub args: Vec<RpcArg>,
    /// Explicit argument length, overriding the length derived from `args`
    declared_len: Option<usize>,
}

impl RpcRequest {
    /// Create a request with no arguments
    pub fn new(address: u8, feature: u8, command: u8) -> Self {
        Self {
            address,
            feature,
            command,
            args: Vec::new(),
            declared_len: None,
        }
    }

    /// Create a request from a combined 16-bit command id (`feature << 8 | command`)
    pub fn from_id(address: u8, rpc_id: u16) -> Self {
        Self::new(address, (rpc_id >> 8) as u8, (rpc_id & 0xFF) as u8)
    }

    /// Append a 16-bit integer argument
    pub fn with_u16(mut self, value: u16) -> Self {
        self.args.push(RpcArg::U16(value));
        self
    }

    /// Append a raw byte argument
    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.args.push(RpcArg::Bytes(bytes.into()));
        self
    }

    /// Declare the argument length explicitly
    pub fn with_declared_len(mut self, len: usize) -> Self {
        self.declared_len = Some(len);
        self
    }

    /// Combined 16-bit command id
    pub fn rpc_id(&self) -> u16 {
        (u16::from(self.feature) << 8) | u16::from(self.command)
    }

    /// Length the tile expects for this command's arguments
    pub fn spec_len(&self) -> usize {
        self.declared_len
            .unwrap_or_else(|| self.args.iter().map(RpcArg::encoded_len).sum())
            .min(MAX_RPC_PAYLOAD)
    }

    /// Serialize the arguments, truncated to [`Self::spec_len`]
    ///
    /// Arguments that do not fit are dropped silently on the wire, exactly as
    /// the tile firmware does; the truncation is logged so it is not invisible.
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(MAX_RPC_PAYLOAD);
        for arg in &self.args {
            match arg {
                RpcArg::U16(value) => payload.extend_from_slice(&value.to_le_bytes()),
                RpcArg::Bytes(bytes) => payload.extend_from_slice(bytes),
            }
        }

        let spec_len = self.spec_len();
        if payload.len() > spec_len {
            warn!(
                "Truncating RPC 0x{:04x} to tile {} from {} to {} bytes",
                self.rpc_id(),
                self.address,
                payload.len(),
                spec_len
            );
            payload.truncate(spec_len);
        }
        payload
    }
}

// ----------------------------------------------------------------------------
// Response
// ----------------------------------------------------------------------------

/// A decoded RPC response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub status: u8,
    pub payload: Vec<u8>,
}

impl RpcResponse {
    /// Decode the response envelope
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(TileBusError::decode(format!(
                "RPC response too short: {} bytes",
                bytes.len()
            )));
        }

        let status = bytes[0];
        let length = if status == STATUS_NO_RESPONDER && bytes[1] == 0xFF {
            0
        } else if status & STATUS_HAS_DATA != 0 {
            let length = bytes.get(3).copied().ok_or_else(|| {
                TileBusError::decode("RPC response header missing length byte")
            })?;
            usize::from(length)
        } else {
            0
        };

        let end = RESPONSE_HEADER_SIZE + length;
        if length > 0 && bytes.len() < end {
            return Err(TileBusError::decode(format!(
                "RPC response declares {} payload bytes but carries {}",
                length,
                bytes.len().saturating_sub(RESPONSE_HEADER_SIZE)
            )));
        }

        let payload = if length == 0 {
            Vec::new()
        } else {
            bytes[RESPONSE_HEADER_SIZE..end].to_vec()
        };

        Ok(Self { status, payload })
    }

    /// Encode the response envelope
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(RESPONSE_HEADER_SIZE + self.payload.len());
        bytes.push(self.status);
        if self.no_responder() {
            bytes.extend_from_slice(&[0xFF, 0, 0]);
            return bytes;
        }
        bytes.extend_from_slice(&[0, 0, self.payload.len() as u8]);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Whether nothing on the bus answered this address
    pub fn no_responder(&self) -> bool {
        self.status == STATUS_NO_RESPONDER && self.payload.is_empty()
    }

    /// Whether the status carries the has-data bit
    pub fn has_data(&self) -> bool {
        !self.no_responder() && self.status & STATUS_HAS_DATA != 0
    }

    /// Whether the tile reported its application as running
    pub fn app_running(&self) -> bool {
        !self.no_responder() && self.status & STATUS_APP_RUNNING != 0
    }

    /// Application-defined status code in the low bits
    pub fn app_status(&self) -> u8 {
        self.status & 0x3F
    }
}
