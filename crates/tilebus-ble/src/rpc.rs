//! RPC exchange over the TileBus characteristics

use std::time::Duration;

use tilebus_core::rpc::{RESPONSE_HEADER_SIZE, STATUS_HAS_DATA, STATUS_NO_RESPONDER};
use tilebus_core::{Result, RpcRequest, RpcResponse, TileBusError, CONTROLLER_ADDRESS};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::bgapi::Command;
use crate::connection::{write_attribute, TileLink};
use crate::dongle::{DongleSession, NotificationKind};
use crate::error::BleTransportError;
use crate::protocol::{TileBusCharacteristic, ATT_WRITE_CEILING};

// ----------------------------------------------------------------------------
// Request Encoding
// ----------------------------------------------------------------------------

/// Header written to the send-header characteristic
///
/// Layout: payload length, reserved, command, feature, address.
pub fn request_header(request: &RpcRequest, payload_len: usize) -> [u8; 5] {
    [
        payload_len as u8,
        0,
        request.command,
        request.feature,
        request.address,
    ]
}

fn timeout_error(request: &RpcRequest) -> TileBusError {
    if request.address == CONTROLLER_ADDRESS {
        TileBusError::ControllerNotFound
    } else {
        TileBusError::RemoteTimeout {
            address: request.address,
            feature: request.feature,
            command: request.command,
        }
    }
}

// ----------------------------------------------------------------------------
// Exchange
// ----------------------------------------------------------------------------

/// Send one RPC on a ready link and wait for its response
pub async fn exchange(
    session: &DongleSession,
    link: &TileLink,
    request: &RpcRequest,
) -> Result<RpcResponse> {
    let (connection, send_header) = link.ready_characteristic(TileBusCharacteristic::SendHeader)?;
    let (_, send_payload) = link.ready_characteristic(TileBusCharacteristic::SendPayload)?;
    let (send_header, send_payload) = match (send_header, send_payload) {
        (Some(header), Some(payload)) => (header, payload),
        _ => return Err(TileBusError::NotConnected),
    };

    let payload = request.payload();
    let header = request_header(request, payload.len());
    let wait = session.config().rpc_timeout;

    debug!(
        "RPC 0x{:04x} to tile {} with {} byte payload",
        request.rpc_id(),
        request.address,
        payload.len()
    );
    session.clear_rpc_notifications().await;

    let outcome = send_and_receive(
        session,
        connection,
        (send_payload.value_handle, payload.as_slice()),
        (send_header.value_handle, &header[..]),
        wait,
    )
    .await;

    match outcome {
        Ok(frame) => {
            let response = RpcResponse::decode(&frame)?;
            trace!(
                "RPC 0x{:04x} answered with status 0x{:02x}",
                request.rpc_id(),
                response.status
            );
            Ok(response)
        }
        Err(e) if e.is_timeout() => {
            debug!("RPC 0x{:04x} to tile {} timed out", request.rpc_id(), request.address);
            Err(timeout_error(request))
        }
        Err(e) => Err(e.into()),
    }
}

async fn send_and_receive(
    session: &DongleSession,
    connection: u8,
    (payload_handle, payload): (u16, &[u8]),
    (header_handle, header): (u16, &[u8]),
    wait: Duration,
) -> std::result::Result<Vec<u8>, BleTransportError> {
    if !payload.is_empty() {
        write_attribute(session, connection, payload_handle, payload, wait).await?;
    }
    write_attribute(session, connection, header_handle, header, wait).await?;
    receive_response(session, wait).await
}

/// Collect the header notification and, when it announces data, the payload
async fn receive_response(
    session: &DongleSession,
    wait: Duration,
) -> std::result::Result<Vec<u8>, BleTransportError> {
    let deadline = Instant::now() + wait;
    let timed_out = || BleTransportError::Timeout {
        operation: "rpc response",
        timeout: wait,
    };

    let mut frame = loop {
        match session.next_rpc_notification(deadline).await? {
            Some(n) if n.kind == NotificationKind::RpcHeader => break n.data,
            Some(_) => debug!("Ignoring RPC payload that arrived without a header"),
            None => return Err(timed_out()),
        }
    };

    if frame.len() < RESPONSE_HEADER_SIZE {
        return Err(BleTransportError::Decode(format!(
            "RPC response header is {} bytes",
            frame.len()
        )));
    }

    let status = frame[0];
    let length = usize::from(frame[3]);
    let no_responder = status == STATUS_NO_RESPONDER && frame[1] == 0xFF;
    if no_responder || status & STATUS_HAS_DATA == 0 || length == 0 {
        return Ok(frame);
    }

    loop {
        match session.next_rpc_notification(deadline).await? {
            Some(n) if n.kind == NotificationKind::RpcPayload => {
                frame.extend_from_slice(&n.data);
                return Ok(frame);
            }
            Some(_) => debug!("Ignoring second RPC header while waiting for payload"),
            None => return Err(timed_out()),
        }
    }
}

// ----------------------------------------------------------------------------
// Bulk Transfer
// ----------------------------------------------------------------------------

/// Write `data` to the high-speed characteristic in unacknowledged chunks
pub async fn send_bulk(session: &DongleSession, link: &TileLink, data: &[u8]) -> Result<()> {
    let (connection, high_speed) = link.ready_characteristic(TileBusCharacteristic::HighSpeed)?;
    let high_speed = high_speed.ok_or_else(|| TileBusError::unsupported("send_bulk"))?;

    for chunk in data.chunks(ATT_WRITE_CEILING) {
        session
            .exchange(&Command::WriteCommand {
                connection,
                handle: high_speed.value_handle,
                data: chunk.to_vec(),
            })
            .await?;
    }

    debug!(
        "Sent {} bytes in {} chunks",
        data.len(),
        data.len().div_ceil(ATT_WRITE_CEILING)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_layout() {
        let request = RpcRequest::new(11, 0x80, 0x04).with_u16(7);
        assert_eq!(request_header(&request, 2), [2, 0, 0x04, 0x80, 11]);
    }

    #[test]
    fn test_timeout_error_by_address() {
        assert!(matches!(
            timeout_error(&RpcRequest::new(CONTROLLER_ADDRESS, 0, 4)),
            TileBusError::ControllerNotFound
        ));
        assert!(matches!(
            timeout_error(&RpcRequest::new(12, 0x20, 0x01)),
            TileBusError::RemoteTimeout {
                address: 12,
                feature: 0x20,
                command: 0x01
            }
        ));
    }
}
