//! BGAPI frame codec
//!
//! The dongle speaks a binary command/response/event protocol over the serial
//! link. Every frame starts with a 4-byte header:
//!
//! ```text
//! byte 0: message type (bit 7, 1 = event) | technology (bits 6..3) | length high (bits 2..0)
//! byte 1: length low
//! byte 2: class
//! byte 3: id
//! ```
//!
//! followed by `length` payload bytes. Integers are little-endian, byte arrays
//! carry a one-byte length prefix and BLE addresses are six bytes,
//! little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::BleTransportError;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

pub const HEADER_SIZE: usize = 4;

/// Largest payload the 11-bit length field can describe
pub const MAX_PAYLOAD: usize = 0x07FF;

const EVENT_BIT: u8 = 0x80;
const TECHNOLOGY_MASK: u8 = 0x78;
const LENGTH_HIGH_MASK: u8 = 0x07;

pub mod class {
    pub const SYSTEM: u8 = 0;
    pub const CONNECTION: u8 = 3;
    pub const ATTCLIENT: u8 = 4;
    pub const GAP: u8 = 6;
}

/// Flag bits reported in a connection status event
pub mod connection_flags {
    pub const CONNECTED: u8 = 0x01;
    pub const ENCRYPTED: u8 = 0x02;
    pub const COMPLETED: u8 = 0x04;
    pub const PARAMETERS_CHANGED: u8 = 0x08;
}

/// Kinds of attribute value reported by the dongle
pub mod attribute_value_type {
    pub const READ: u8 = 0;
    pub const NOTIFY: u8 = 1;
    pub const INDICATE: u8 = 2;
    pub const READ_BY_TYPE: u8 = 3;
    pub const READ_BLOB: u8 = 4;
    pub const INDICATE_RSP_REQ: u8 = 5;
}

/// GAP discover mode that reports every advertiser
pub const DISCOVER_OBSERVATION: u8 = 2;

// ----------------------------------------------------------------------------
// Frames
// ----------------------------------------------------------------------------

/// Command/response or event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Command,
    Event,
}

/// One BGAPI frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub class: u8,
    pub id: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Build a command or response frame
    pub fn command(class: u8, id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type: MessageType::Command,
            class,
            id,
            payload: payload.into(),
        }
    }

    /// Build an event frame
    pub fn event(class: u8, id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type: MessageType::Event,
            class,
            id,
            payload: payload.into(),
        }
    }

    pub fn is_event(&self) -> bool {
        self.message_type == MessageType::Event
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Result<Vec<u8>, BleTransportError> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD {
            return Err(BleTransportError::Decode(format!(
                "payload of {} bytes exceeds the {} byte frame limit",
                len, MAX_PAYLOAD
            )));
        }

        let mut out = BytesMut::with_capacity(HEADER_SIZE + len);
        let type_bit = match self.message_type {
            MessageType::Command => 0,
            MessageType::Event => EVENT_BIT,
        };
        out.put_u8(type_bit | ((len >> 8) as u8 & LENGTH_HIGH_MASK));
        out.put_u8((len & 0xFF) as u8);
        out.put_u8(self.class);
        out.put_u8(self.id);
        out.put_slice(&self.payload);
        Ok(out.to_vec())
    }
}

/// Incremental decoder turning a byte stream into frames
///
/// Bytes whose header claims a technology other than BLE are skipped one at a
/// time until the stream lines up with a frame boundary again.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(512),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes waiting to complete a frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete frame, if any
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if self.buf.len() < HEADER_SIZE {
                return None;
            }

            let first = self.buf[0];
            if first & TECHNOLOGY_MASK != 0 {
                self.buf.advance(1);
                continue;
            }

            let len = (usize::from(first & LENGTH_HIGH_MASK) << 8) | usize::from(self.buf[1]);
            if self.buf.len() < HEADER_SIZE + len {
                return None;
            }

            let mut header = self.buf.split_to(HEADER_SIZE);
            let payload = self.buf.split_to(len).freeze();
            let type_byte = header.get_u8();
            let _len_low = header.get_u8();
            let class = header.get_u8();
            let id = header.get_u8();

            let message_type = if type_byte & EVENT_BIT != 0 {
                MessageType::Event
            } else {
                MessageType::Command
            };

            return Some(Frame {
                message_type,
                class,
                id,
                payload,
            });
        }
    }
}

// ----------------------------------------------------------------------------
// Field Reader
// ----------------------------------------------------------------------------

struct Fields<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn need(&self, n: usize) -> Result<(), BleTransportError> {
        if self.buf.remaining() < n {
            return Err(BleTransportError::Decode(format!(
                "{} truncated: needed {} more bytes, had {}",
                self.what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, BleTransportError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn i8(&mut self) -> Result<i8, BleTransportError> {
        self.need(1)?;
        Ok(self.buf.get_i8())
    }

    fn u16(&mut self) -> Result<u16, BleTransportError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn address(&mut self) -> Result<[u8; 6], BleTransportError> {
        self.need(6)?;
        let mut address = [0u8; 6];
        self.buf.copy_to_slice(&mut address);
        Ok(address)
    }

    fn array(&mut self) -> Result<Vec<u8>, BleTransportError> {
        let len = usize::from(self.u8()?);
        self.need(len)?;
        let value = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(value)
    }
}

fn put_array(out: &mut BytesMut, data: &[u8]) {
    out.put_u8(data.len() as u8);
    out.put_slice(data);
}

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Commands the host sends to the dongle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SystemReset,
    SystemHello,
    Disconnect {
        connection: u8,
    },
    GetStatus {
        connection: u8,
    },
    ReadByGroupType {
        connection: u8,
        start: u16,
        end: u16,
        uuid: Vec<u8>,
    },
    ReadByType {
        connection: u8,
        start: u16,
        end: u16,
        uuid: Vec<u8>,
    },
    AttributeWrite {
        connection: u8,
        handle: u16,
        data: Vec<u8>,
    },
    WriteCommand {
        connection: u8,
        handle: u16,
        data: Vec<u8>,
    },
    Discover {
        mode: u8,
    },
    ConnectDirect {
        address: [u8; 6],
        address_type: u8,
        interval_min: u16,
        interval_max: u16,
        timeout: u16,
        latency: u16,
    },
    EndProcedure,
    SetScanParameters {
        interval: u16,
        window: u16,
        active: bool,
    },
}

impl Command {
    /// `(class, id)` of the command and of its response
    pub fn class_id(&self) -> (u8, u8) {
        match self {
            Self::SystemReset => (class::SYSTEM, 0),
            Self::SystemHello => (class::SYSTEM, 1),
            Self::Disconnect { .. } => (class::CONNECTION, 0),
            Self::GetStatus { .. } => (class::CONNECTION, 7),
            Self::ReadByGroupType { .. } => (class::ATTCLIENT, 1),
            Self::ReadByType { .. } => (class::ATTCLIENT, 2),
            Self::AttributeWrite { .. } => (class::ATTCLIENT, 5),
            Self::WriteCommand { .. } => (class::ATTCLIENT, 6),
            Self::Discover { .. } => (class::GAP, 2),
            Self::ConnectDirect { .. } => (class::GAP, 3),
            Self::EndProcedure => (class::GAP, 4),
            Self::SetScanParameters { .. } => (class::GAP, 7),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SystemReset => "system_reset",
            Self::SystemHello => "system_hello",
            Self::Disconnect { .. } => "connection_disconnect",
            Self::GetStatus { .. } => "connection_get_status",
            Self::ReadByGroupType { .. } => "attclient_read_by_group_type",
            Self::ReadByType { .. } => "attclient_read_by_type",
            Self::AttributeWrite { .. } => "attclient_attribute_write",
            Self::WriteCommand { .. } => "attclient_write_command",
            Self::Discover { .. } => "gap_discover",
            Self::ConnectDirect { .. } => "gap_connect_direct",
            Self::EndProcedure => "gap_end_procedure",
            Self::SetScanParameters { .. } => "gap_set_scan_parameters",
        }
    }

    /// Offset of the 16-bit result code inside the response payload
    pub fn result_offset(&self) -> Option<usize> {
        match self {
            Self::SystemReset | Self::SystemHello | Self::GetStatus { .. } => None,
            Self::Disconnect { .. }
            | Self::ReadByGroupType { .. }
            | Self::ReadByType { .. }
            | Self::AttributeWrite { .. }
            | Self::WriteCommand { .. } => Some(1),
            Self::Discover { .. }
            | Self::ConnectDirect { .. }
            | Self::EndProcedure
            | Self::SetScanParameters { .. } => Some(0),
        }
    }

    /// Check the result code carried by this command's response
    pub fn check_response(&self, response: &Frame) -> Result<(), BleTransportError> {
        let Some(offset) = self.result_offset() else {
            return Ok(());
        };
        let code = response
            .payload
            .get(offset..offset + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .ok_or_else(|| {
                BleTransportError::Decode(format!("{} response missing result code", self.name()))
            })?;
        if code != 0 {
            return Err(BleTransportError::Rejected {
                operation: self.name(),
                code,
            });
        }
        Ok(())
    }

    pub fn to_frame(&self) -> Frame {
        let (class, id) = self.class_id();
        let mut out = BytesMut::new();
        match self {
            Self::SystemReset => out.put_u8(0),
            Self::SystemHello | Self::EndProcedure => {}
            Self::Disconnect { connection } | Self::GetStatus { connection } => {
                out.put_u8(*connection)
            }
            Self::ReadByGroupType {
                connection,
                start,
                end,
                uuid,
            }
            | Self::ReadByType {
                connection,
                start,
                end,
                uuid,
            } => {
                out.put_u8(*connection);
                out.put_u16_le(*start);
                out.put_u16_le(*end);
                put_array(&mut out, uuid);
            }
            Self::AttributeWrite {
                connection,
                handle,
                data,
            }
            | Self::WriteCommand {
                connection,
                handle,
                data,
            } => {
                out.put_u8(*connection);
                out.put_u16_le(*handle);
                put_array(&mut out, data);
            }
            Self::Discover { mode } => out.put_u8(*mode),
            Self::ConnectDirect {
                address,
                address_type,
                interval_min,
                interval_max,
                timeout,
                latency,
            } => {
                out.put_slice(address);
                out.put_u8(*address_type);
                out.put_u16_le(*interval_min);
                out.put_u16_le(*interval_max);
                out.put_u16_le(*timeout);
                out.put_u16_le(*latency);
            }
            Self::SetScanParameters {
                interval,
                window,
                active,
            } => {
                out.put_u16_le(*interval);
                out.put_u16_le(*window);
                out.put_u8(u8::from(*active));
            }
        }
        Frame::command(class, id, out.freeze())
    }

    /// Decode a command frame, as the dongle would
    pub fn parse(frame: &Frame) -> Result<Self, BleTransportError> {
        let mut f = Fields::new(&frame.payload, "command");
        let command = match (frame.class, frame.id) {
            (class::SYSTEM, 0) => Self::SystemReset,
            (class::SYSTEM, 1) => Self::SystemHello,
            (class::CONNECTION, 0) => Self::Disconnect {
                connection: f.u8()?,
            },
            (class::CONNECTION, 7) => Self::GetStatus {
                connection: f.u8()?,
            },
            (class::ATTCLIENT, 1) => Self::ReadByGroupType {
                connection: f.u8()?,
                start: f.u16()?,
                end: f.u16()?,
                uuid: f.array()?,
            },
            (class::ATTCLIENT, 2) => Self::ReadByType {
                connection: f.u8()?,
                start: f.u16()?,
                end: f.u16()?,
                uuid: f.array()?,
            },
            (class::ATTCLIENT, 5) => Self::AttributeWrite {
                connection: f.u8()?,
                handle: f.u16()?,
                data: f.array()?,
            },
            (class::ATTCLIENT, 6) => Self::WriteCommand {
                connection: f.u8()?,
                handle: f.u16()?,
                data: f.array()?,
            },
            (class::GAP, 2) => Self::Discover { mode: f.u8()? },
            (class::GAP, 3) => Self::ConnectDirect {
                address: f.address()?,
                address_type: f.u8()?,
                interval_min: f.u16()?,
                interval_max: f.u16()?,
                timeout: f.u16()?,
                latency: f.u16()?,
            },
            (class::GAP, 4) => Self::EndProcedure,
            (class::GAP, 7) => Self::SetScanParameters {
                interval: f.u16()?,
                window: f.u16()?,
                active: f.u8()? != 0,
            },
            (class, id) => {
                return Err(BleTransportError::Decode(format!(
                    "unknown command ({}, {})",
                    class, id
                )))
            }
        };
        Ok(command)
    }
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Advertisement or scan response reported while discovering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub rssi: i8,
    pub packet_type: u8,
    pub sender: [u8; 6],
    pub address_type: u8,
    pub bond: u8,
    pub data: Vec<u8>,
}

/// Unsolicited frames from the dongle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ConnectionStatus {
        connection: u8,
        flags: u8,
        address: [u8; 6],
        address_type: u8,
        interval: u16,
        timeout: u16,
        latency: u16,
        bonding: u8,
    },
    Disconnected {
        connection: u8,
        reason: u16,
    },
    ProcedureCompleted {
        connection: u8,
        result: u16,
        handle: u16,
    },
    GroupFound {
        connection: u8,
        start: u16,
        end: u16,
        uuid: Vec<u8>,
    },
    AttributeValue {
        connection: u8,
        handle: u16,
        value_type: u8,
        value: Vec<u8>,
    },
    ScanResponse(ScanReport),
    /// Any event this engine does not act on
    Other { class: u8, id: u8 },
}

impl Event {
    pub fn parse(frame: &Frame) -> Result<Self, BleTransportError> {
        let mut f = Fields::new(&frame.payload, "event");
        let event = match (frame.class, frame.id) {
            (class::CONNECTION, 0) => Self::ConnectionStatus {
                connection: f.u8()?,
                flags: f.u8()?,
                address: f.address()?,
                address_type: f.u8()?,
                interval: f.u16()?,
                timeout: f.u16()?,
                latency: f.u16()?,
                bonding: f.u8()?,
            },
            (class::CONNECTION, 4) => Self::Disconnected {
                connection: f.u8()?,
                reason: f.u16()?,
            },
            (class::ATTCLIENT, 1) => Self::ProcedureCompleted {
                connection: f.u8()?,
                result: f.u16()?,
                handle: f.u16()?,
            },
            (class::ATTCLIENT, 2) => Self::GroupFound {
                connection: f.u8()?,
                start: f.u16()?,
                end: f.u16()?,
                uuid: f.array()?,
            },
            (class::ATTCLIENT, 5) => Self::AttributeValue {
                connection: f.u8()?,
                handle: f.u16()?,
                value_type: f.u8()?,
                value: f.array()?,
            },
            (class::GAP, 0) => Self::ScanResponse(ScanReport {
                rssi: f.i8()?,
                packet_type: f.u8()?,
                sender: f.address()?,
                address_type: f.u8()?,
                bond: f.u8()?,
                data: f.array()?,
            }),
            (class, id) => Self::Other { class, id },
        };
        Ok(event)
    }

    /// Encode as the dongle would send it
    pub fn to_frame(&self) -> Frame {
        let mut out = BytesMut::new();
        let (class, id) = match self {
            Self::ConnectionStatus {
                connection,
                flags,
                address,
                address_type,
                interval,
                timeout,
                latency,
                bonding,
            } => {
                out.put_u8(*connection);
                out.put_u8(*flags);
                out.put_slice(address);
                out.put_u8(*address_type);
                out.put_u16_le(*interval);
                out.put_u16_le(*timeout);
                out.put_u16_le(*latency);
                out.put_u8(*bonding);
                (class::CONNECTION, 0)
            }
            Self::Disconnected { connection, reason } => {
                out.put_u8(*connection);
                out.put_u16_le(*reason);
                (class::CONNECTION, 4)
            }
            Self::ProcedureCompleted {
                connection,
                result,
                handle,
            } => {
                out.put_u8(*connection);
                out.put_u16_le(*result);
                out.put_u16_le(*handle);
                (class::ATTCLIENT, 1)
            }
            Self::GroupFound {
                connection,
                start,
                end,
                uuid,
            } => {
                out.put_u8(*connection);
                out.put_u16_le(*start);
                out.put_u16_le(*end);
                put_array(&mut out, uuid);
                (class::ATTCLIENT, 2)
            }
            Self::AttributeValue {
                connection,
                handle,
                value_type,
                value,
            } => {
                out.put_u8(*connection);
                out.put_u16_le(*handle);
                out.put_u8(*value_type);
                put_array(&mut out, value);
                (class::ATTCLIENT, 5)
            }
            Self::ScanResponse(report) => {
                out.put_i8(report.rssi);
                out.put_u8(report.packet_type);
                out.put_slice(&report.sender);
                out.put_u8(report.address_type);
                out.put_u8(report.bond);
                put_array(&mut out, &report.data);
                (class::GAP, 0)
            }
            Self::Other { class, id } => (*class, *id),
        };
        Frame::event(class, id, out.freeze())
    }

    /// Whether this is a notification or indication pushed by the peripheral
    pub fn is_notification(&self) -> bool {
        matches!(
            self,
            Self::AttributeValue { value_type, .. }
                if *value_type == attribute_value_type::NOTIFY
                    || *value_type == attribute_value_type::INDICATE
        )
    }
}
