//! Bluetooth Low Energy transport for TileBus devices
//!
//! This crate provides a transport that implements the `Transport` trait from
//! `tilebus-core` by driving a BLED112 USB dongle over its serial BGAPI
//! protocol.
//!
//! ## Architecture
//!
//! - [`bgapi`] - Frame codec for the dongle's command/response/event protocol
//! - [`dongle`] - Serial session with a background reader that routes frames
//! - [`advertisement`] - Decoding advertisements and scan responses into device records
//! - [`gatt`] - Services and characteristics discovered on a device
//! - [`connection`] - Link state machine, probing and reconnect
//! - [`rpc`] - RPC exchange and bulk writes over the TileBus characteristics
//! - [`transport`] - The `Transport` implementation tying it together
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tilebus_ble::{BleTransport, BleTransportConfig};
//! use tilebus_core::{RpcRequest, Transport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut transport = BleTransport::open(None, BleTransportConfig::new())?;
//!
//! for device in transport.scan().await? {
//!     println!("{:08x} at {}", device.uuid, device.connection_string);
//! }
//!
//! transport.connect_direct("C0:11:22:33:44:55").await?;
//! let status = transport.send_rpc(&RpcRequest::from_id(8, 0x0004)).await?;
//! println!("controller status 0x{:02x}", status.status);
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod advertisement;
pub mod bgapi;
mod config;
pub mod connection;
pub mod dongle;
mod error;
pub mod gatt;
mod protocol;
pub mod rpc;
mod transport;

// Public API exports
pub use config::BleTransportConfig;
pub use dongle::{find_dongle_port, DongleSession};
pub use error::BleTransportError;
pub use protocol::{
    format_address, parse_address, TileBusCharacteristic, BLED112_PID, BLED112_VID,
    TILEBUS_SERVICE_UUID, TRANSPORT_NAME,
};
pub use transport::{register, BleTransport};

// Re-export Transport trait for convenience
pub use tilebus_core::Transport;
