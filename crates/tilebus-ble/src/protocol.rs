//! BLE protocol constants and utilities for TileBus devices

use uuid::Uuid;

use crate::error::BleTransportError;

// ----------------------------------------------------------------------------
// Dongle Identification
// ----------------------------------------------------------------------------

/// USB vendor id of the BLED112 dongle
pub const BLED112_VID: u16 = 0x2458;

/// USB product id of the BLED112 dongle
pub const BLED112_PID: u16 = 0x0001;

/// Name the transport registers under
pub const TRANSPORT_NAME: &str = "bled112";

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Bluetooth base UUID that 16-bit UUIDs are expanded onto
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// TileBus GATT service UUID
pub const TILEBUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0ff60f63_132c_e611_ba53_f73f00200000);

/// Primary service declaration attribute type
pub const PRIMARY_SERVICE_UUID16: u16 = 0x2800;

/// Characteristic declaration attribute type
pub const CHARACTERISTIC_UUID16: u16 = 0x2803;

/// Largest value a single ATT write can carry
pub const ATT_WRITE_CEILING: usize = 20;

/// Characteristics of the TileBus service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileBusCharacteristic {
    ReceiveHeader,
    ReceivePayload,
    SendHeader,
    SendPayload,
    Streaming,
    HighSpeed,
    Tracing,
}

impl TileBusCharacteristic {
    pub const ALL: [TileBusCharacteristic; 7] = [
        Self::ReceiveHeader,
        Self::ReceivePayload,
        Self::SendHeader,
        Self::SendPayload,
        Self::Streaming,
        Self::HighSpeed,
        Self::Tracing,
    ];

    /// Characteristics an RPC exchange cannot work without
    pub const REQUIRED: [TileBusCharacteristic; 4] = [
        Self::ReceiveHeader,
        Self::ReceivePayload,
        Self::SendHeader,
        Self::SendPayload,
    ];

    /// 16-bit short form of the characteristic UUID
    pub fn short_uuid(self) -> u16 {
        match self {
            Self::ReceiveHeader => 0x2001,
            Self::ReceivePayload => 0x2002,
            Self::SendHeader => 0x2003,
            Self::SendPayload => 0x2004,
            Self::Streaming => 0x2005,
            Self::HighSpeed => 0x2006,
            Self::Tracing => 0x2007,
        }
    }

    pub fn uuid(self) -> Uuid {
        uuid16(self.short_uuid())
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ReceiveHeader => "receive header",
            Self::ReceivePayload => "receive payload",
            Self::SendHeader => "send header",
            Self::SendPayload => "send payload",
            Self::Streaming => "streaming",
            Self::HighSpeed => "high speed",
            Self::Tracing => "tracing",
        }
    }
}

// ----------------------------------------------------------------------------
// UUID Utilities
// ----------------------------------------------------------------------------

/// Expand a 16-bit UUID onto the Bluetooth base UUID
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Decode an attribute UUID as carried over ATT (2 or 16 bytes, little-endian)
pub fn uuid_from_att(bytes: &[u8]) -> Option<Uuid> {
    match bytes.len() {
        2 => Some(uuid16(u16::from_le_bytes([bytes[0], bytes[1]]))),
        16 => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(bytes);
            Some(Uuid::from_u128(u128::from_le_bytes(raw)))
        }
        _ => None,
    }
}

/// Encode an attribute UUID for ATT, using the short form where possible
pub fn uuid_to_att(uuid: &Uuid) -> Vec<u8> {
    let value = uuid.as_u128();
    let short_mask: u128 = 0xFFFF << 96;
    if value & !short_mask == BLUETOOTH_BASE_UUID {
        (((value >> 96) & 0xFFFF) as u16).to_le_bytes().to_vec()
    } else {
        value.to_le_bytes().to_vec()
    }
}

// ----------------------------------------------------------------------------
// Address Utilities
// ----------------------------------------------------------------------------

/// Format a little-endian BLE address as `AA:BB:CC:DD:EE:FF`
pub fn format_address(address: &[u8; 6]) -> String {
    address
        .iter()
        .rev()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse `AA:BB:CC:DD:EE:FF` into the little-endian wire form
pub fn parse_address(text: &str) -> Result<[u8; 6], BleTransportError> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    if parts.len() != 6 {
        return Err(BleTransportError::InvalidAddress(text.to_string()));
    }

    let mut address = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        address[5 - i] = u8::from_str_radix(part, 16)
            .map_err(|_| BleTransportError::InvalidAddress(text.to_string()))?;
    }
    Ok(address)
}
