//! Serial session with the BLED112 dongle
//!
//! A background reader task decodes frames off the serial link and routes
//! them: command responses, connection events, scan reports, RPC
//! notifications, and streaming/tracing notifications each land in their own
//! channel so a caller waiting on one kind of traffic never consumes another.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tilebus_core::{notification_channel, NotificationQueue, Report, AUTO_PORT};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_serial::{FlowControl, SerialPortBuilderExt, SerialPortType};
use tracing::{debug, info, trace, warn};

use crate::bgapi::{Command, Event, Frame, FrameDecoder, ScanReport};
use crate::config::BleTransportConfig;
use crate::error::BleTransportError;
use crate::protocol::{BLED112_PID, BLED112_VID};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

// ----------------------------------------------------------------------------
// Dongle Discovery
// ----------------------------------------------------------------------------

/// Find the serial port of the first attached BLED112 dongle
pub fn find_dongle_port() -> Result<String, BleTransportError> {
    let ports = tokio_serial::available_ports()?;

    for port in ports {
        if let SerialPortType::UsbPort(usb_info) = &port.port_type {
            if usb_info.vid == BLED112_VID && usb_info.pid == BLED112_PID {
                info!("Found BLED112 dongle at {}", port.port_name);
                return Ok(port.port_name);
            }
        }
    }

    Err(BleTransportError::DongleNotFound(format!(
        "no serial port with USB id {:04x}:{:04x}",
        BLED112_VID, BLED112_PID
    )))
}

// ----------------------------------------------------------------------------
// Notification Routing
// ----------------------------------------------------------------------------

/// What a subscribed characteristic's notifications are used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    RpcHeader,
    RpcPayload,
    Streaming,
    Tracing,
}

/// Notification on one of the RPC characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcNotification {
    pub kind: NotificationKind,
    pub data: Vec<u8>,
}

struct Router {
    responses: mpsc::UnboundedSender<Frame>,
    events: mpsc::UnboundedSender<Event>,
    scan_reports: mpsc::UnboundedSender<ScanReport>,
    rpc_notifications: mpsc::UnboundedSender<RpcNotification>,
    reports: mpsc::UnboundedSender<Report>,
    traces: mpsc::UnboundedSender<Vec<u8>>,
    routes: Arc<RwLock<HashMap<u16, NotificationKind>>>,
    lost_links: Arc<Mutex<HashSet<u8>>>,
}

impl Router {
    async fn dispatch(&self, frame: Frame) {
        if !frame.is_event() {
            trace!("Response ({}, {})", frame.class, frame.id);
            let _ = self.responses.send(frame);
            return;
        }

        let event = match Event::parse(&frame) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping malformed event ({}, {}): {}", frame.class, frame.id, e);
                return;
            }
        };

        match event {
            Event::ScanResponse(report) => {
                let _ = self.scan_reports.send(report);
            }
            Event::Disconnected { connection, reason } => {
                debug!("Link {} dropped, reason 0x{:04x}", connection, reason);
                self.lost_links.lock().await.insert(connection);
                let _ = self.events.send(event);
            }
            event if event.is_notification() => self.route_notification(event).await,
            other => {
                let _ = self.events.send(other);
            }
        }
    }

    async fn route_notification(&self, event: Event) {
        let Event::AttributeValue {
            connection,
            handle,
            value_type,
            value,
        } = event
        else {
            let _ = self.events.send(event);
            return;
        };

        let route = self.routes.read().await.get(&handle).copied();
        match route {
            Some(kind @ (NotificationKind::RpcHeader | NotificationKind::RpcPayload)) => {
                let _ = self
                    .rpc_notifications
                    .send(RpcNotification { kind, data: value });
            }
            Some(NotificationKind::Streaming) => {
                let _ = self.reports.send(Report::parse(&value));
            }
            Some(NotificationKind::Tracing) => {
                let _ = self.traces.send(value);
            }
            None => {
                trace!("Unrouted notification on handle 0x{:04x}", handle);
                let _ = self.events.send(Event::AttributeValue {
                    connection,
                    handle,
                    value_type,
                    value,
                });
            }
        }
    }
}

async fn read_loop<R>(mut reader: R, router: Router)
where
    R: AsyncRead + Send + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 512];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Dongle serial stream closed");
                break;
            }
            Ok(n) => {
                decoder.push(&buf[..n]);
                while let Some(frame) = decoder.next_frame() {
                    router.dispatch(frame).await;
                }
            }
            Err(e) => {
                warn!("Dongle read failed: {}", e);
                break;
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Dongle Session
// ----------------------------------------------------------------------------

/// Open serial session with a dongle
pub struct DongleSession {
    config: BleTransportConfig,
    writer: Mutex<Option<Writer>>,
    responses: Mutex<mpsc::UnboundedReceiver<Frame>>,
    events: Mutex<mpsc::UnboundedReceiver<Event>>,
    scan_reports: Mutex<mpsc::UnboundedReceiver<ScanReport>>,
    rpc_notifications: Mutex<mpsc::UnboundedReceiver<RpcNotification>>,
    reports: NotificationQueue<Report>,
    traces: NotificationQueue<Vec<u8>>,
    routes: Arc<RwLock<HashMap<u16, NotificationKind>>>,
    lost_links: Arc<Mutex<HashSet<u8>>>,
    closed: AtomicBool,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DongleSession {
    /// Open the dongle on `port`, or the first one found when `port` is absent
    /// or `<auto>`
    ///
    /// The serial stream and the reader task live on the current Tokio
    /// runtime; calling this outside one fails with `NoRuntime`.
    pub fn open(port: Option<&str>, config: BleTransportConfig) -> Result<Self, BleTransportError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(BleTransportError::NoRuntime);
        }

        let path = match port {
            Some(port) if port != AUTO_PORT => port.to_string(),
            _ => find_dongle_port()?,
        };

        info!("Opening dongle on {} at {} baud", path, config.baud_rate);
        let flow_control = if config.hardware_flow_control {
            FlowControl::Hardware
        } else {
            FlowControl::None
        };
        let stream = tokio_serial::new(&path, config.baud_rate)
            .flow_control(flow_control)
            .timeout(config.command_timeout)
            .open_native_async()?;

        let (reader, writer) = tokio::io::split(stream);
        Ok(Self::from_io(reader, writer, config))
    }

    /// Run a session over any byte stream pair
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime, since the reader task is
    /// spawned immediately.
    pub fn from_io<R, W>(reader: R, writer: W, config: BleTransportConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
        let (report_tx, reports) = notification_channel();
        let (trace_tx, traces) = notification_channel();
        let routes = Arc::new(RwLock::new(HashMap::new()));
        let lost_links = Arc::new(Mutex::new(HashSet::new()));

        let router = Router {
            responses: response_tx,
            events: event_tx,
            scan_reports: scan_tx,
            rpc_notifications: rpc_tx,
            reports: report_tx,
            traces: trace_tx,
            routes: Arc::clone(&routes),
            lost_links: Arc::clone(&lost_links),
        };
        let reader = tokio::spawn(read_loop(reader, router));

        Self {
            config,
            writer: Mutex::new(Some(Box::new(writer))),
            responses: Mutex::new(response_rx),
            events: Mutex::new(event_rx),
            scan_reports: Mutex::new(scan_rx),
            rpc_notifications: Mutex::new(rpc_rx),
            reports,
            traces,
            routes,
            lost_links,
            closed: AtomicBool::new(false),
            reader: std::sync::Mutex::new(Some(reader)),
        }
    }

    pub fn config(&self) -> &BleTransportConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), BleTransportError> {
        if self.is_closed() {
            return Err(BleTransportError::SessionClosed);
        }
        Ok(())
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), BleTransportError> {
        let bytes = frame.encode()?;
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(BleTransportError::SessionClosed)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send a command without waiting for any answer
    pub async fn write_command(&self, command: &Command) -> Result<(), BleTransportError> {
        self.ensure_open()?;
        trace!("-> {}", command.name());
        self.write_frame(&command.to_frame()).await
    }

    /// Send a command and wait for its response
    ///
    /// Responses left over from an earlier command that timed out are
    /// discarded first. A non-zero result code fails with
    /// [`BleTransportError::Rejected`].
    pub async fn exchange(&self, command: &Command) -> Result<Frame, BleTransportError> {
        self.ensure_open()?;
        let mut responses = self.responses.lock().await;
        while let Ok(stale) = responses.try_recv() {
            debug!("Discarding stale response ({}, {})", stale.class, stale.id);
        }

        self.write_command(command).await?;

        let (class, id) = command.class_id();
        let wait = self.config.command_timeout;
        let deadline = Instant::now() + wait;
        loop {
            let frame = match timeout_at(deadline, responses.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(BleTransportError::SessionClosed),
                Err(_) => {
                    return Err(BleTransportError::Timeout {
                        operation: command.name(),
                        timeout: wait,
                    })
                }
            };

            if frame.class == class && frame.id == id {
                command.check_response(&frame)?;
                return Ok(frame);
            }
            debug!(
                "Ignoring response ({}, {}) while waiting for {}",
                frame.class,
                frame.id,
                command.name()
            );
        }
    }

    /// Wait until `deadline` for the next connection or GATT event
    pub async fn next_event(&self, deadline: Instant) -> Result<Option<Event>, BleTransportError> {
        let mut events = self.events.lock().await;
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => Err(BleTransportError::SessionClosed),
            Err(_) => Ok(None),
        }
    }

    /// Wait for the first event accepted by `matches`, discarding others
    pub async fn wait_for_event<F>(
        &self,
        operation: &'static str,
        wait: Duration,
        mut matches: F,
    ) -> Result<Event, BleTransportError>
    where
        F: FnMut(&Event) -> bool,
    {
        let deadline = Instant::now() + wait;
        loop {
            match self.next_event(deadline).await? {
                Some(event) if matches(&event) => return Ok(event),
                Some(event) => trace!("Skipping {:?} while waiting for {}", event, operation),
                None => {
                    return Err(BleTransportError::Timeout {
                        operation,
                        timeout: wait,
                    })
                }
            }
        }
    }

    /// Drop queued events
    pub async fn clear_events(&self) -> usize {
        let mut events = self.events.lock().await;
        let mut dropped = 0;
        while events.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// Drop scan reports left over from an earlier scan
    pub async fn clear_scan_reports(&self) {
        let mut reports = self.scan_reports.lock().await;
        while reports.try_recv().is_ok() {}
    }

    /// Gather scan reports for `duration`
    pub async fn collect_scan_reports(
        &self,
        duration: Duration,
    ) -> Result<Vec<ScanReport>, BleTransportError> {
        let mut reports = self.scan_reports.lock().await;
        let deadline = Instant::now() + duration;
        let mut collected = Vec::new();
        loop {
            match timeout_at(deadline, reports.recv()).await {
                Ok(Some(report)) => collected.push(report),
                Ok(None) => return Err(BleTransportError::SessionClosed),
                Err(_) => return Ok(collected),
            }
        }
    }

    /// Wait until `deadline` for the next RPC header or payload notification
    pub async fn next_rpc_notification(
        &self,
        deadline: Instant,
    ) -> Result<Option<RpcNotification>, BleTransportError> {
        let mut notifications = self.rpc_notifications.lock().await;
        match timeout_at(deadline, notifications.recv()).await {
            Ok(Some(notification)) => Ok(Some(notification)),
            Ok(None) => Err(BleTransportError::SessionClosed),
            Err(_) => Ok(None),
        }
    }

    /// Drop RPC notifications from an exchange that already gave up
    pub async fn clear_rpc_notifications(&self) {
        let mut notifications = self.rpc_notifications.lock().await;
        while let Ok(late) = notifications.try_recv() {
            debug!("Discarding late {:?} notification", late.kind);
        }
    }

    pub async fn set_route(&self, handle: u16, kind: NotificationKind) {
        self.routes.write().await.insert(handle, kind);
    }

    pub async fn clear_routes(&self) {
        self.routes.write().await.clear();
    }

    /// Whether the dongle reported the link as dropped since the last check
    pub async fn take_link_lost(&self, connection: u8) -> bool {
        self.lost_links.lock().await.remove(&connection)
    }

    /// Queue of parsed streaming reports
    pub fn reports(&self) -> NotificationQueue<Report> {
        self.reports.clone()
    }

    /// Queue of raw trace chunks
    pub fn traces(&self) -> NotificationQueue<Vec<u8>> {
        self.traces.clone()
    }

    /// Stop the reader and release the serial port; closing twice is a no-op
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Ignoring error while closing dongle writer: {}", e);
            }
        }

        let reader = match self.reader.lock() {
            Ok(mut reader) => reader.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(reader) = reader {
            reader.abort();
        }
        info!("Dongle session closed");
    }
}

impl Drop for DongleSession {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(reader) = reader.take() {
                reader.abort();
            }
        }
    }
}
