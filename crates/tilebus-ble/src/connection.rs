//! Connection lifecycle for one TileBus device
//!
//! A link walks `Disconnected -> Connecting -> ServiceDiscovery -> Ready` and
//! leaves through `Disconnecting`, or drops straight back to `Disconnected`
//! when the radio reports the link lost. The GATT table is populated and the
//! TileBus service verified before the link ever reaches `Ready`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tilebus_core::{Result, TileBusError};
use tracing::{debug, info, warn};

use crate::bgapi::{attribute_value_type, connection_flags, Command, Event};
use crate::dongle::{DongleSession, NotificationKind};
use crate::error::BleTransportError;
use crate::gatt::{Characteristic, GattTable, Service};
use crate::protocol::{
    parse_address, uuid16, uuid_from_att, uuid_to_att, TileBusCharacteristic,
    CHARACTERISTIC_UUID16, PRIMARY_SERVICE_UUID16, TILEBUS_SERVICE_UUID,
};

/// Value written to a configuration descriptor to enable notifications
const ENABLE_NOTIFICATIONS: [u8; 2] = [0x01, 0x00];

/// Connection slot used when the real handle was never learned
const FALLBACK_CONNECTION: u8 = 0;

// ----------------------------------------------------------------------------
// Link State Machine
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    ServiceDiscovery,
    Ready,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Caller asked for a connection
    ConnectRequested,
    /// Dongle reported the link up
    LinkEstablished,
    /// Required service and characteristics were found
    ServicesVerified,
    /// Connecting or probing gave up
    ConnectFailed,
    /// Caller asked to tear the link down
    DisconnectRequested,
    /// Link is gone
    Disconnected,
    /// Liveness check found the link dead
    LinkLost,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid link transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: LinkState,
    pub event: LinkEvent,
}

impl LinkState {
    /// Process an event and return the next state
    pub fn transition(self, event: LinkEvent) -> std::result::Result<LinkState, InvalidTransition> {
        use LinkEvent as E;
        use LinkState as S;

        let next = match (self, event) {
            (S::Disconnected, E::ConnectRequested) => S::Connecting,
            (S::Connecting, E::LinkEstablished) => S::ServiceDiscovery,
            (S::ServiceDiscovery, E::ServicesVerified) => S::Ready,
            (S::Connecting | S::ServiceDiscovery, E::ConnectFailed) => S::Disconnected,
            (S::Connecting | S::ServiceDiscovery | S::Ready, E::DisconnectRequested) => {
                S::Disconnecting
            }
            (S::Ready, E::LinkLost) => S::Disconnected,
            (_, E::Disconnected) => S::Disconnected,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::ServiceDiscovery => "service discovery",
            Self::Ready => "ready",
            Self::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// Attribute Helpers
// ----------------------------------------------------------------------------

fn procedure_completed(connection: u8) -> impl FnMut(&Event) -> bool {
    move |event| matches!(event, Event::ProcedureCompleted { connection: c, .. } if *c == connection)
}

/// Write an attribute and wait for the peripheral to acknowledge it
pub async fn write_attribute(
    session: &DongleSession,
    connection: u8,
    handle: u16,
    data: &[u8],
    wait: Duration,
) -> std::result::Result<(), BleTransportError> {
    session.clear_events().await;
    session
        .exchange(&Command::AttributeWrite {
            connection,
            handle,
            data: data.to_vec(),
        })
        .await?;

    let event = session
        .wait_for_event("attribute write", wait, procedure_completed(connection))
        .await?;
    match event {
        Event::ProcedureCompleted { result, .. } if result != 0 => Err(BleTransportError::Rejected {
            operation: "attclient_attribute_write",
            code: result,
        }),
        _ => Ok(()),
    }
}

async fn discover_services(
    session: &DongleSession,
    connection: u8,
) -> std::result::Result<Vec<Service>, BleTransportError> {
    let wait = session.config().probe_timeout;
    session.clear_events().await;
    session
        .exchange(&Command::ReadByGroupType {
            connection,
            start: 0x0001,
            end: 0xFFFF,
            uuid: uuid_to_att(&uuid16(PRIMARY_SERVICE_UUID16)),
        })
        .await?;

    let mut services = Vec::new();
    loop {
        let event = session
            .wait_for_event("service discovery", wait, |e| {
                matches!(
                    e,
                    Event::GroupFound { connection: c, .. } | Event::ProcedureCompleted { connection: c, .. }
                        if *c == connection
                )
            })
            .await?;

        match event {
            Event::GroupFound {
                start, end, uuid, ..
            } => match uuid_from_att(&uuid) {
                Some(uuid) => services.push(Service::new(uuid, start, end)),
                None => debug!("Skipping service 0x{:04x} with {} byte uuid", start, uuid.len()),
            },
            _ => break,
        }
    }
    Ok(services)
}

async fn discover_characteristics(
    session: &DongleSession,
    connection: u8,
    service: &mut Service,
) -> std::result::Result<(), BleTransportError> {
    let wait = session.config().probe_timeout;
    session.clear_events().await;
    session
        .exchange(&Command::ReadByType {
            connection,
            start: service.start_handle,
            end: service.end_handle,
            uuid: uuid_to_att(&uuid16(CHARACTERISTIC_UUID16)),
        })
        .await?;

    loop {
        let event = session
            .wait_for_event("characteristic discovery", wait, |e| match e {
                Event::AttributeValue {
                    connection: c,
                    value_type,
                    ..
                } => *c == connection && *value_type == attribute_value_type::READ_BY_TYPE,
                Event::ProcedureCompleted { connection: c, .. } => *c == connection,
                _ => false,
            })
            .await?;

        match event {
            Event::AttributeValue { handle, .. } if !service.contains_handle(handle) => {
                debug!(
                    "Skipping declaration 0x{:04x} outside service 0x{:04x}-0x{:04x}",
                    handle, service.start_handle, service.end_handle
                );
            }
            Event::AttributeValue { handle, value, .. } => {
                match Characteristic::from_declaration(handle, &value) {
                    Ok(characteristic) => service.characteristics.push(characteristic),
                    Err(e) => debug!("Skipping characteristic: {}", e),
                }
            }
            _ => return Ok(()),
        }
    }
}

/// Enumerate every service and characteristic on the device
pub async fn probe(
    session: &DongleSession,
    connection: u8,
) -> std::result::Result<GattTable, BleTransportError> {
    let mut services = discover_services(session, connection).await?;
    for service in &mut services {
        discover_characteristics(session, connection, service).await?;
    }

    debug!(
        "Probed {} services, {} characteristics",
        services.len(),
        services.iter().map(|s| s.characteristics.len()).sum::<usize>()
    );
    Ok(GattTable::new(services))
}

// ----------------------------------------------------------------------------
// Tile Link
// ----------------------------------------------------------------------------

/// Connection to one device and the bookkeeping that goes with it
#[derive(Debug)]
pub struct TileLink {
    state: LinkState,
    connection: Option<u8>,
    connection_string: Option<String>,
    gatt: Option<Arc<GattTable>>,
    /// Optional channels to restore after a reconnect
    subscriptions: Vec<(TileBusCharacteristic, NotificationKind)>,
}

impl Default for TileLink {
    fn default() -> Self {
        Self::new()
    }
}

impl TileLink {
    pub fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            connection: None,
            connection_string: None,
            gatt: None,
            subscriptions: Vec::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    pub fn connection(&self) -> Option<u8> {
        self.connection
    }

    pub fn connection_string(&self) -> Option<&str> {
        self.connection_string.as_deref()
    }

    pub fn gatt(&self) -> Option<Arc<GattTable>> {
        self.gatt.clone()
    }

    fn apply(&mut self, event: LinkEvent) {
        match self.state.transition(event) {
            Ok(next) => {
                debug!("Link {} -> {} on {:?}", self.state, next, event);
                self.state = next;
            }
            Err(e) => {
                warn!("{}; forcing disconnected", e);
                self.state = LinkState::Disconnected;
            }
        }
    }

    /// Connected link and characteristic lookup, or `NotConnected`
    pub fn ready_characteristic(
        &self,
        which: TileBusCharacteristic,
    ) -> Result<(u8, Option<Characteristic>)> {
        match (self.state, self.connection, &self.gatt) {
            (LinkState::Ready, Some(connection), Some(gatt)) => {
                Ok((connection, gatt.tilebus(which).cloned()))
            }
            _ => Err(TileBusError::NotConnected),
        }
    }

    /// Open a link to the device at `connection_string` and make it ready
    pub async fn connect(&mut self, session: &DongleSession, connection_string: &str) -> Result<()> {
        let address = parse_address(connection_string)?;

        if self.state != LinkState::Disconnected {
            info!("Dropping existing link before connecting to {}", connection_string);
            self.disconnect(session).await;
        }

        let config = session.config().clone();
        self.apply(LinkEvent::ConnectRequested);
        info!("Connecting to {}", connection_string);
        session.clear_events().await;

        let response = session
            .exchange(&Command::ConnectDirect {
                address,
                address_type: config.address_type,
                interval_min: config.conn_interval_min,
                interval_max: config.conn_interval_max,
                timeout: config.supervision_timeout,
                latency: config.latency,
            })
            .await;
        let connection = match response {
            Ok(frame) => frame.payload.get(2).copied().unwrap_or(FALLBACK_CONNECTION),
            Err(e) => {
                self.apply(LinkEvent::ConnectFailed);
                return Err(e.into());
            }
        };

        let established = session
            .wait_for_event("connection", config.connect_timeout, |e| {
                matches!(
                    e,
                    Event::ConnectionStatus { connection: c, flags, .. }
                        if *c == connection && flags & connection_flags::CONNECTED != 0
                )
            })
            .await;
        match established {
            Ok(_) => {}
            Err(e) if e.is_timeout() => {
                warn!("Timed out connecting to {}", connection_string);
                if let Err(e) = session.exchange(&Command::EndProcedure).await {
                    debug!("Ignoring end_procedure failure: {}", e);
                }
                self.apply(LinkEvent::ConnectFailed);
                return Err(TileBusError::ConnectTimeout);
            }
            Err(e) => {
                self.apply(LinkEvent::ConnectFailed);
                return Err(e.into());
            }
        }

        session.take_link_lost(connection).await;
        self.connection = Some(connection);
        self.apply(LinkEvent::LinkEstablished);

        match self.prepare(session, connection).await {
            Ok(gatt) => {
                self.gatt = Some(Arc::new(gatt));
                self.connection_string = Some(connection_string.to_string());
                self.apply(LinkEvent::ServicesVerified);
                info!("Connected to {} on handle {}", connection_string, connection);
                Ok(())
            }
            Err(e) => {
                warn!("Connection to {} unusable: {}", connection_string, e);
                self.teardown(session, connection).await;
                self.apply(LinkEvent::ConnectFailed);
                self.forget(session).await;
                Err(e)
            }
        }
    }

    async fn prepare(&self, session: &DongleSession, connection: u8) -> Result<GattTable> {
        let gatt = probe(session, connection).await?;

        let receivable = [
            TileBusCharacteristic::ReceiveHeader,
            TileBusCharacteristic::ReceivePayload,
        ]
        .iter()
        .all(|which| gatt.tilebus(*which).is_some_and(Characteristic::is_subscribable));

        if !gatt.has_service(&TILEBUS_SERVICE_UUID)
            || !gatt.missing_required().is_empty()
            || !receivable
        {
            return Err(TileBusError::UnsupportedDevice {
                services: gatt.service_uuids(),
            });
        }

        for (which, kind) in [
            (TileBusCharacteristic::ReceiveHeader, NotificationKind::RpcHeader),
            (TileBusCharacteristic::ReceivePayload, NotificationKind::RpcPayload),
        ]
        .into_iter()
        .chain(self.subscriptions.clone())
        {
            match gatt.tilebus(which) {
                Some(characteristic) => {
                    enable_notifications(session, connection, characteristic, kind).await?
                }
                None => debug!("Device lacks {} characteristic", which.name()),
            }
        }
        Ok(gatt)
    }

    /// Route and enable notifications for an optional characteristic
    ///
    /// Returns `false` when the device does not expose it.
    pub async fn subscribe(
        &mut self,
        session: &DongleSession,
        which: TileBusCharacteristic,
        kind: NotificationKind,
    ) -> Result<bool> {
        let (connection, characteristic) = self.ready_characteristic(which)?;
        let Some(characteristic) = characteristic else {
            return Ok(false);
        };

        if self.subscriptions.iter().any(|(w, _)| *w == which) {
            return Ok(true);
        }

        enable_notifications(session, connection, &characteristic, kind).await?;
        self.subscriptions.push((which, kind));
        info!("Enabled {} notifications", which.name());
        Ok(true)
    }

    /// Whether the link is still up
    ///
    /// A disconnected event seen by the reader or a status query that the
    /// dongle does not answer with the connected flag both count as lost.
    pub async fn is_alive(
        &self,
        session: &DongleSession,
    ) -> std::result::Result<bool, BleTransportError> {
        let Some(connection) = self.connection else {
            return Ok(false);
        };
        if session.take_link_lost(connection).await {
            return Ok(false);
        }

        session.clear_events().await;
        match session.exchange(&Command::GetStatus { connection }).await {
            Ok(_) => {}
            Err(e) if e.is_timeout() => return Ok(false),
            Err(e) => return Err(e),
        }

        let status = session
            .wait_for_event("connection status", session.config().status_timeout, |e| {
                matches!(e, Event::ConnectionStatus { connection: c, .. } if *c == connection)
            })
            .await;
        match status {
            Ok(Event::ConnectionStatus { flags, .. }) => Ok(flags & connection_flags::CONNECTED != 0),
            Ok(_) => Ok(false),
            Err(e) if e.is_timeout() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Confirm the link is usable, reconnecting once if it was lost
    pub async fn check_and_maybe_reconnect(&mut self, session: &DongleSession) -> Result<()> {
        if !self.is_ready() {
            return Err(TileBusError::NotConnected);
        }
        if self.is_alive(session).await? {
            return Ok(());
        }

        let Some(connection_string) = self.connection_string.clone() else {
            self.apply(LinkEvent::LinkLost);
            return Err(TileBusError::NotConnected);
        };

        warn!("Link to {} lost, reconnecting", connection_string);
        self.apply(LinkEvent::LinkLost);
        self.connection = None;
        self.gatt = None;
        session.clear_routes().await;

        match self.connect(session, &connection_string).await {
            Ok(()) => {
                info!("Reconnected to {}", connection_string);
                Ok(())
            }
            Err(TileBusError::SessionClosed) => Err(TileBusError::SessionClosed),
            Err(e) => {
                warn!("Reconnect to {} failed: {}", connection_string, e);
                self.forget(session).await;
                Err(TileBusError::ReconnectFailed)
            }
        }
    }

    /// Tear the link down; failures are logged and otherwise ignored
    pub async fn disconnect(&mut self, session: &DongleSession) {
        if self.state == LinkState::Disconnected {
            debug!("Disconnect requested while already disconnected");
            return;
        }

        let connection = self.connection.unwrap_or(FALLBACK_CONNECTION);
        self.apply(LinkEvent::DisconnectRequested);
        self.teardown(session, connection).await;
        self.apply(LinkEvent::Disconnected);
        self.forget(session).await;
        info!("Disconnected");
    }

    async fn teardown(&self, session: &DongleSession, connection: u8) {
        if let Err(e) = session.exchange(&Command::Disconnect { connection }).await {
            debug!("Ignoring disconnect failure: {}", e);
            return;
        }

        let wait = session.config().command_timeout;
        let result = session
            .wait_for_event("disconnect", wait, |e| {
                matches!(e, Event::Disconnected { connection: c, .. } if *c == connection)
            })
            .await;
        if let Err(e) = result {
            debug!("No disconnected event: {}", e);
        }
        session.take_link_lost(connection).await;
    }

    /// Drop everything tied to the link, including the reader's routes
    async fn forget(&mut self, session: &DongleSession) {
        self.connection = None;
        self.connection_string = None;
        self.gatt = None;
        self.subscriptions.clear();
        session.clear_routes().await;
    }
}

async fn enable_notifications(
    session: &DongleSession,
    connection: u8,
    characteristic: &Characteristic,
    kind: NotificationKind,
) -> std::result::Result<(), BleTransportError> {
    let config_handle = characteristic.config_handle().ok_or_else(|| {
        BleTransportError::Decode(format!(
            "characteristic {} at 0x{:04x} has no configuration descriptor",
            characteristic.uuid, characteristic.value_handle
        ))
    })?;

    session.set_route(characteristic.value_handle, kind).await;
    write_attribute(
        session,
        connection,
        config_handle,
        &ENABLE_NOTIFICATIONS,
        session.config().probe_timeout,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let state = LinkState::Disconnected
            .transition(LinkEvent::ConnectRequested)
            .and_then(|s| s.transition(LinkEvent::LinkEstablished))
            .and_then(|s| s.transition(LinkEvent::ServicesVerified))
            .unwrap();
        assert_eq!(state, LinkState::Ready);

        let state = state
            .transition(LinkEvent::DisconnectRequested)
            .and_then(|s| s.transition(LinkEvent::Disconnected))
            .unwrap();
        assert_eq!(state, LinkState::Disconnected);
    }

    #[test]
    fn test_failed_probe_reverts_to_disconnected() {
        let state = LinkState::ServiceDiscovery
            .transition(LinkEvent::ConnectFailed)
            .unwrap();
        assert_eq!(state, LinkState::Disconnected);
    }

    #[test]
    fn test_lost_only_from_ready() {
        assert_eq!(
            LinkState::Ready.transition(LinkEvent::LinkLost),
            Ok(LinkState::Disconnected)
        );
        let err = LinkState::Connecting
            .transition(LinkEvent::LinkLost)
            .unwrap_err();
        assert_eq!(err.from, LinkState::Connecting);
    }

    #[test]
    fn test_cannot_skip_service_discovery() {
        assert!(LinkState::Connecting
            .transition(LinkEvent::ServicesVerified)
            .is_err());
        assert!(LinkState::Disconnected
            .transition(LinkEvent::LinkEstablished)
            .is_err());
    }

    #[test]
    fn test_new_link_is_not_ready() {
        let link = TileLink::new();
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(matches!(
            link.ready_characteristic(TileBusCharacteristic::SendHeader),
            Err(TileBusError::NotConnected)
        ));
    }
}
