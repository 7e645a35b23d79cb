//! BLE transport implementation

use async_trait::async_trait;
use tilebus_core::{
    DeviceRecord, NotificationQueue, PortSpec, Report, Result, RpcRequest, RpcResponse,
    TileBusError, Transport, TransportCapabilities, TransportRegistry, TransportType,
    MAX_RPC_PAYLOAD,
};
use tracing::{debug, info};

use crate::advertisement::ScanAccumulator;
use crate::bgapi::{Command, DISCOVER_OBSERVATION};
use crate::config::BleTransportConfig;
use crate::connection::{LinkState, TileLink};
use crate::dongle::{DongleSession, NotificationKind};
use crate::protocol::{TileBusCharacteristic, ATT_WRITE_CEILING, TRANSPORT_NAME};
use crate::rpc;

// ----------------------------------------------------------------------------
// Registration
// ----------------------------------------------------------------------------

fn create(spec: &PortSpec) -> Result<Box<dyn Transport>> {
    let transport = BleTransport::open(spec.port.as_deref(), BleTransportConfig::default())?;
    Ok(Box::new(transport))
}

/// Make the dongle transport available under `bled112`
pub fn register(registry: &mut TransportRegistry) {
    registry.register(TRANSPORT_NAME, create);
}

// ----------------------------------------------------------------------------
// BLE Transport
// ----------------------------------------------------------------------------

/// Transport talking to TileBus devices through a BLED112 dongle
pub struct BleTransport {
    session: DongleSession,
    link: TileLink,
    closed: bool,
}

impl BleTransport {
    /// Open the dongle on `port`; `None` or `<auto>` picks the first dongle found
    ///
    /// Must be called from within a Tokio runtime. Outside one this returns a
    /// validation error instead of opening the port.
    pub fn open(port: Option<&str>, config: BleTransportConfig) -> Result<Self> {
        let session = DongleSession::open(port, config)?;
        Ok(Self::from_session(session))
    }

    /// Build a transport over an existing dongle session
    pub fn from_session(session: DongleSession) -> Self {
        Self {
            session,
            link: TileLink::new(),
            closed: false,
        }
    }

    pub fn session(&self) -> &DongleSession {
        &self.session
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    /// Address of the connected device
    pub fn connection_string(&self) -> Option<&str> {
        self.link.connection_string()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed || self.session.is_closed() {
            return Err(TileBusError::SessionClosed);
        }
        Ok(())
    }

    /// Reboot the dongle itself and close the session
    ///
    /// The dongle drops off the USB bus while it restarts, so the serial port
    /// has to be reopened afterwards.
    pub async fn reboot_dongle(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.link.disconnect(&self.session).await;
        self.session.write_command(&Command::SystemReset).await?;
        info!("Dongle rebooting");
        self.session.close().await;
        self.closed = true;
        Ok(())
    }

    async fn enable_channel(
        &mut self,
        which: TileBusCharacteristic,
        kind: NotificationKind,
        operation: &'static str,
    ) -> Result<()> {
        self.ensure_open()?;
        if !self.link.subscribe(&self.session, which, kind).await? {
            return Err(TileBusError::unsupported(operation));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&mut self, device_uuid: u32) -> Result<()> {
        self.ensure_open()?;
        let record = self
            .scan()
            .await?
            .into_iter()
            .find(|d| d.uuid == device_uuid)
            .ok_or(TileBusError::UnknownDevice { uuid: device_uuid })?;

        debug!("Device 0x{:x} is at {}", device_uuid, record.connection_string);
        self.connect_direct(&record.connection_string).await
    }

    async fn connect_direct(&mut self, connection_string: &str) -> Result<()> {
        self.ensure_open()?;
        self.link.connect(&self.session, connection_string).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.ensure_open().is_err() {
            debug!("Disconnect after close ignored");
            return Ok(());
        }
        self.link.disconnect(&self.session).await;
        Ok(())
    }

    async fn send_rpc(&mut self, request: &RpcRequest) -> Result<RpcResponse> {
        self.ensure_open()?;
        self.link.check_and_maybe_reconnect(&self.session).await?;
        rpc::exchange(&self.session, &self.link, request).await
    }

    async fn scan(&mut self) -> Result<Vec<DeviceRecord>> {
        self.ensure_open()?;
        let config = self.session.config().clone();

        self.session
            .exchange(&Command::SetScanParameters {
                interval: config.scan_interval,
                window: config.scan_window,
                active: true,
            })
            .await?;
        self.session.clear_scan_reports().await;
        self.session
            .exchange(&Command::Discover {
                mode: DISCOVER_OBSERVATION,
            })
            .await?;

        let reports = self.session.collect_scan_reports(config.scan_duration).await;
        let stopped = self.session.exchange(&Command::EndProcedure).await;
        let reports = reports?;
        stopped?;

        let mut accumulator = ScanAccumulator::new();
        for report in &reports {
            accumulator.process(report);
        }

        let devices = accumulator.finish();
        info!("Scan found {} TileBus devices", devices.len());
        Ok(devices)
    }

    async fn heartbeat(&mut self) -> Result<bool> {
        self.ensure_open()?;
        match self.session.exchange(&Command::SystemHello).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_timeout() => {
                debug!("Dongle did not answer hello");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reset(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.link.disconnect(&self.session).await;
        if let Err(e) = self.session.exchange(&Command::EndProcedure).await {
            debug!("No GAP procedure to stop: {}", e);
        }

        self.session.clear_events().await;
        self.session.clear_scan_reports().await;
        self.session.clear_rpc_notifications().await;
        self.session.reports().clear().await;
        self.session.traces().clear().await;
        info!("Transport reset");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if !self.session.is_closed() {
            self.link.disconnect(&self.session).await;
        }
        self.session.close().await;
        self.closed = true;
        Ok(())
    }

    async fn send_bulk(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.link.check_and_maybe_reconnect(&self.session).await?;
        rpc::send_bulk(&self.session, &self.link, data).await
    }

    async fn enable_streaming(&mut self) -> Result<NotificationQueue<Report>> {
        self.enable_channel(
            TileBusCharacteristic::Streaming,
            NotificationKind::Streaming,
            "enable_streaming",
        )
        .await?;
        Ok(self.session.reports())
    }

    async fn enable_tracing(&mut self) -> Result<NotificationQueue<Vec<u8>>> {
        self.enable_channel(
            TileBusCharacteristic::Tracing,
            NotificationKind::Tracing,
            "enable_tracing",
        )
        .await?;
        Ok(self.session.traces())
    }

    fn is_connected(&self) -> bool {
        !self.closed && self.link.is_ready()
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            transport_type: TransportType::Ble,
            max_rpc_payload: MAX_RPC_PAYLOAD,
            bulk_chunk_size: ATT_WRITE_CEILING,
            supports_scan: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn transport() -> (BleTransport, tokio::io::DuplexStream) {
        let (host, dongle) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(host);
        let config = BleTransportConfig::default().with_command_timeout(Duration::from_millis(100));
        let session = DongleSession::from_io(reader, writer, config);
        (BleTransport::from_session(session), dongle)
    }

    #[test]
    fn test_register_adds_bled112() {
        let mut registry = TransportRegistry::new();
        register(&mut registry);
        assert_eq!(registry.names(), vec!["bled112"]);
    }

    #[test]
    fn test_open_outside_runtime_is_an_error() {
        let result = BleTransport::open(Some("/dev/ttyACM9"), BleTransportConfig::default());
        assert!(matches!(result, Err(TileBusError::Validation(_))));
    }

    #[tokio::test]
    async fn test_capabilities() {
        let (transport, _dongle) = transport();
        let caps = transport.capabilities();
        assert_eq!(caps.transport_type, TransportType::Ble);
        assert_eq!(caps.bulk_chunk_size, 20);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_rpc_before_connect_is_not_connected() {
        let (mut transport, _dongle) = transport();
        let result = transport.send_rpc(&RpcRequest::new(8, 0, 4)).await;
        assert!(matches!(result, Err(TileBusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_heartbeat_without_answer_is_false() {
        let (mut transport, _dongle) = transport();
        assert!(!transport.heartbeat().await.unwrap());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut transport, _dongle) = transport();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(matches!(
            transport.heartbeat().await,
            Err(TileBusError::SessionClosed)
        ));
        assert!(transport.disconnect().await.is_ok());
    }
}
