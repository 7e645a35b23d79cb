//! TileBus Core
//!
//! Transport-independent types for talking to IOTile devices: the RPC
//! envelope, device discovery records, streamed reports, the [`Transport`]
//! contract every concrete transport implements, and the [`HardwareManager`]
//! front end that drives a transport on behalf of callers.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod device;
pub mod errors;
pub mod manager;
pub mod proxy;
pub mod queue;
pub mod report;
pub mod rpc;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{PortSpec, TransportFactory, TransportRegistry, AUTO_PORT};
pub use device::{DeviceRecord, VisibleReading};
pub use errors::{Result, TileBusError, TransportError};
pub use manager::{HardwareManager, TraceEncoding};
pub use proxy::{GenericTile, ProxyFactory, ProxyRegistry, TileInfo, TileProxy};
pub use queue::{notification_channel, NotificationQueue};
pub use report::{IndividualReadingReport, Report};
pub use rpc::{RpcArg, RpcRequest, RpcResponse, CONTROLLER_ADDRESS, MAX_RPC_PAYLOAD};
pub use transport::{Transport, TransportCapabilities, TransportType};
