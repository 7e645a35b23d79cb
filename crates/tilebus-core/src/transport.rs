//! Transport abstraction for talking to IOTile devices
//!
//! This module defines the contract every concrete transport satisfies so the
//! hardware manager can drive any of them uniformly. The BLE dongle engine is
//! one implementation; an operation a protocol variant cannot provide fails
//! with [`TileBusError::UnsupportedOperation`] rather than doing nothing.

use async_trait::async_trait;

use crate::device::DeviceRecord;
use crate::queue::NotificationQueue;
use crate::report::Report;
use crate::rpc::{RpcRequest, RpcResponse};
use crate::{Result, TileBusError};

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Unified transport interface for IOTile communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the device advertising the given uuid
    async fn connect(&mut self, device_uuid: u32) -> Result<()>;

    /// Connect using an opaque, transport-specific connection string
    async fn connect_direct(&mut self, connection_string: &str) -> Result<()>;

    /// Disconnect from the current device; never fails on cleanup paths
    async fn disconnect(&mut self) -> Result<()>;

    /// Send an RPC and wait for its response
    async fn send_rpc(&mut self, request: &RpcRequest) -> Result<RpcResponse>;

    /// Scan for reachable devices
    async fn scan(&mut self) -> Result<Vec<DeviceRecord>>;

    /// Check whether the underlying link to the radio is functional
    async fn heartbeat(&mut self) -> Result<bool>;

    /// Return the transport to a known idle state
    async fn reset(&mut self) -> Result<()>;

    /// Release every resource; calling it again is a no-op
    async fn close(&mut self) -> Result<()>;

    /// Push bulk data to the device without per-chunk acknowledgment
    async fn send_bulk(&mut self, _data: &[u8]) -> Result<()> {
        Err(TileBusError::unsupported("send_bulk"))
    }

    /// Start receiving streamed reports
    async fn enable_streaming(&mut self) -> Result<NotificationQueue<Report>> {
        Err(TileBusError::unsupported("enable_streaming"))
    }

    /// Start receiving raw trace bytes
    async fn enable_tracing(&mut self) -> Result<NotificationQueue<Vec<u8>>> {
        Err(TileBusError::unsupported("enable_tracing"))
    }

    /// Whether a device link is currently established
    fn is_connected(&self) -> bool;

    /// Get transport-specific metadata/capabilities
    fn capabilities(&self) -> TransportCapabilities;
}

// ----------------------------------------------------------------------------
// Transport Capabilities
// ----------------------------------------------------------------------------

/// Describes what a transport can do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Transport type identifier
    pub transport_type: TransportType,
    /// Maximum RPC argument payload
    pub max_rpc_payload: usize,
    /// Largest chunk written by the bulk path
    pub bulk_chunk_size: usize,
    /// Whether the transport can scan for devices
    pub supports_scan: bool,
}

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransportType {
    /// Bluetooth Low Energy through a USB dongle
    Ble,
    /// In-process transport used by tests
    Local,
}

// ----------------------------------------------------------------------------
// Mock Transport (for testing)
// ----------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::HashMap;

    use super::*;
    use crate::queue::notification_channel;
    use tokio::sync::mpsc;

    /// Scripted transport used by the manager tests
    pub struct MockTransport {
        pub connected: Option<String>,
        pub closed: bool,
        pub devices: Vec<DeviceRecord>,
        pub responses: HashMap<(u8, u16), RpcResponse>,
        pub sent: Vec<RpcRequest>,
        pub report_tx: mpsc::UnboundedSender<Report>,
        pub reports: NotificationQueue<Report>,
        pub trace_tx: mpsc::UnboundedSender<Vec<u8>>,
        pub traces: NotificationQueue<Vec<u8>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            let (report_tx, reports) = notification_channel();
            let (trace_tx, traces) = notification_channel();
            Self {
                connected: None,
                closed: false,
                devices: Vec::new(),
                responses: HashMap::new(),
                sent: Vec::new(),
                report_tx,
                reports,
                trace_tx,
                traces,
            }
        }

        pub fn respond(mut self, address: u8, rpc_id: u16, response: RpcResponse) -> Self {
            self.responses.insert((address, rpc_id), response);
            self
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&mut self, device_uuid: u32) -> Result<()> {
            let record = self
                .devices
                .iter()
                .find(|d| d.uuid == device_uuid)
                .ok_or(TileBusError::UnknownDevice { uuid: device_uuid })?;
            self.connected = Some(record.connection_string.clone());
            Ok(())
        }

        async fn connect_direct(&mut self, connection_string: &str) -> Result<()> {
            self.connected = Some(connection_string.to_string());
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.connected = None;
            Ok(())
        }

        async fn send_rpc(&mut self, request: &RpcRequest) -> Result<RpcResponse> {
            if self.closed {
                return Err(TileBusError::SessionClosed);
            }
            if self.connected.is_none() {
                return Err(TileBusError::NotConnected);
            }
            self.sent.push(request.clone());
            self.responses
                .get(&(request.address, request.rpc_id()))
                .cloned()
                .ok_or(TileBusError::RemoteTimeout {
                    address: request.address,
                    feature: request.feature,
                    command: request.command,
                })
        }

        async fn scan(&mut self) -> Result<Vec<DeviceRecord>> {
            Ok(self.devices.clone())
        }

        async fn heartbeat(&mut self) -> Result<bool> {
            Ok(!self.closed)
        }

        async fn reset(&mut self) -> Result<()> {
            self.connected = None;
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed = true;
            self.connected = None;
            Ok(())
        }

        async fn enable_streaming(&mut self) -> Result<NotificationQueue<Report>> {
            Ok(self.reports.clone())
        }

        async fn enable_tracing(&mut self) -> Result<NotificationQueue<Vec<u8>>> {
            Ok(self.traces.clone())
        }

        fn is_connected(&self) -> bool {
            self.connected.is_some()
        }

        fn capabilities(&self) -> TransportCapabilities {
            TransportCapabilities {
                transport_type: TransportType::Local,
                max_rpc_payload: crate::rpc::MAX_RPC_PAYLOAD,
                bulk_chunk_size: 0,
                supports_scan: true,
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[tokio::test]
    async fn test_default_operations_are_unsupported() {
        let mut transport = MockTransport::new();

        match transport.send_bulk(&[1, 2, 3]).await {
            Err(TileBusError::UnsupportedOperation { operation }) => {
                assert_eq!(operation, "send_bulk")
            }
            other => panic!("Expected UnsupportedOperation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mock_transport_rpc_requires_connection() {
        let mut transport = MockTransport::new();
        let request = RpcRequest::new(8, 0, 4);

        assert!(matches!(
            transport.send_rpc(&request).await,
            Err(TileBusError::NotConnected)
        ));

        transport.connect_direct("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert!(transport.is_connected());
        assert!(matches!(
            transport.send_rpc(&request).await,
            Err(TileBusError::RemoteTimeout { address: 8, .. })
        ));
    }
}
