//! Hardware manager: the caller-facing front end over one transport
//!
//! The manager owns a single [`Transport`], remembers the streaming and
//! tracing queues once they are enabled, accumulates trace bytes, and turns
//! tile addresses into typed proxies through a [`ProxyRegistry`].

use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{PortSpec, TransportRegistry};
use crate::device::DeviceRecord;
use crate::proxy::{ProxyRegistry, TileInfo, TileProxy};
use crate::queue::NotificationQueue;
use crate::report::Report;
use crate::rpc::{RpcRequest, RpcResponse, CONTROLLER_ADDRESS};
use crate::transport::Transport;
use crate::{Result, TileBusError};

// ----------------------------------------------------------------------------
// Trace Encoding
// ----------------------------------------------------------------------------

/// How accumulated trace data is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEncoding {
    Raw,
    Hex,
}

impl FromStr for TraceEncoding {
    type Err = TileBusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(Self::Raw),
            "hex" => Ok(Self::Hex),
            other => Err(TileBusError::Validation(format!(
                "unknown trace encoding '{}', expected 'raw' or 'hex'",
                other
            ))),
        }
    }
}

// ----------------------------------------------------------------------------
// Hardware Manager
// ----------------------------------------------------------------------------

pub struct HardwareManager {
    transport: Box<dyn Transport>,
    proxies: ProxyRegistry,
    stream_queue: Option<NotificationQueue<Report>>,
    trace_queue: Option<NotificationQueue<Vec<u8>>>,
    trace_data: Vec<u8>,
}

impl HardwareManager {
    /// Wrap an already constructed transport
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            proxies: ProxyRegistry::new(),
            stream_queue: None,
            trace_queue: None,
            trace_data: Vec::new(),
        }
    }

    /// Open the transport named by a port string
    ///
    /// A connection string in the port string is connected to immediately.
    pub async fn open(port: &str, registry: &TransportRegistry) -> Result<Self> {
        let spec = PortSpec::parse(port)?;
        info!("Opening transport '{}'", spec);

        let mut manager = Self::new(registry.create(&spec)?);
        if let Some(conn) = &spec.connection_string {
            manager.connect_direct(conn).await?;
        }
        Ok(manager)
    }

    /// Proxy registry used by [`Self::get`]
    pub fn proxies_mut(&mut self) -> &mut ProxyRegistry {
        &mut self.proxies
    }

    /// Underlying transport
    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    pub async fn connect(&mut self, device_uuid: u32) -> Result<()> {
        self.transport.connect(device_uuid).await
    }

    pub async fn connect_direct(&mut self, connection_string: &str) -> Result<()> {
        self.transport.connect_direct(connection_string).await
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.transport.disconnect().await
    }

    pub async fn heartbeat(&mut self) -> Result<bool> {
        self.transport.heartbeat().await
    }

    pub async fn reset(&mut self) -> Result<()> {
        self.transport.reset().await
    }

    pub async fn scan(&mut self) -> Result<Vec<DeviceRecord>> {
        self.transport.scan().await
    }

    pub async fn send_rpc(&mut self, request: &RpcRequest) -> Result<RpcResponse> {
        self.transport.send_rpc(request).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }

    /// Create the proxy for the tile at `address`
    ///
    /// The tile's status RPC names its module; the name selects the proxy.
    pub async fn get(&mut self, address: u8) -> Result<Box<dyn TileProxy>> {
        let response = self.transport.send_rpc(&TileInfo::request(address)).await?;
        let info = TileInfo::parse(address, &response)?;
        debug!("Resolved tile {}", info);
        self.proxies.create(info)
    }

    /// Create the proxy for the device's controller tile
    pub async fn controller(&mut self) -> Result<Box<dyn TileProxy>> {
        self.get(CONTROLLER_ADDRESS).await
    }

    // ------------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------------

    pub async fn enable_streaming(&mut self) -> Result<()> {
        self.stream_queue = Some(self.transport.enable_streaming().await?);
        Ok(())
    }

    /// Number of reports received but not yet consumed
    pub async fn count_reports(&self) -> usize {
        match &self.stream_queue {
            Some(queue) => queue.count().await,
            None => 0,
        }
    }

    /// Take every report received so far without waiting
    pub async fn drain_reports(&self) -> Vec<Report> {
        match &self.stream_queue {
            Some(queue) => queue.drain().await,
            None => Vec::new(),
        }
    }

    /// Wait for `count` reports, allowing `timeout` between consecutive ones
    pub async fn wait_reports(&self, count: usize, timeout: Duration) -> Result<Vec<Report>> {
        let queue = self.stream_queue.as_ref().ok_or_else(|| {
            TileBusError::Validation("streaming must be enabled before waiting for reports".into())
        })?;

        let mut reports = Vec::with_capacity(count);
        while reports.len() < count {
            match queue.pop(timeout).await {
                Some(report) => reports.push(report),
                None => {
                    return Err(TileBusError::ReportTimeout {
                        expected: count,
                        received: reports.len(),
                    })
                }
            }
        }
        Ok(reports)
    }

    // ------------------------------------------------------------------------
    // Tracing
    // ------------------------------------------------------------------------

    pub async fn enable_tracing(&mut self) -> Result<()> {
        self.trace_queue = Some(self.transport.enable_tracing().await?);
        Ok(())
    }

    /// Return all trace data received so far, rendered in `encoding`
    pub async fn dump_trace(&mut self, encoding: TraceEncoding) -> Vec<u8> {
        self.accumulate_trace().await;
        match encoding {
            TraceEncoding::Raw => self.trace_data.clone(),
            TraceEncoding::Hex => hex::encode(&self.trace_data).into_bytes(),
        }
    }

    async fn accumulate_trace(&mut self) {
        if let Some(queue) = &self.trace_queue {
            for blob in queue.drain().await {
                self.trace_data.extend_from_slice(&blob);
            }
        }
    }
}
