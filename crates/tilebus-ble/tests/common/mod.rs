//! In-process BLED112 dongle for integration tests
//!
//! The mock speaks BGAPI over a `tokio::io::duplex` pipe and emulates one
//! TileBus peripheral: a GATT table, CCCD writes, and RPC answers pushed
//! back as header/payload notifications.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tilebus_ble::bgapi::{attribute_value_type, Command, Event, Frame, FrameDecoder, ScanReport};
use tilebus_ble::{
    BleTransport, BleTransportConfig, DongleSession, TileBusCharacteristic, TILEBUS_SERVICE_UUID,
};
use tilebus_core::RpcResponse;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const DEVICE_ADDRESS: &str = "C0:11:22:33:44:55";
pub const DEVICE_WIRE_ADDRESS: [u8; 6] = [0x55, 0x44, 0x33, 0x22, 0x11, 0xC0];

const GENERIC_ACCESS_UUID: u16 = 0x1800;
const TILEBUS_START: u16 = 0x0010;
const TILEBUS_END: u16 = 0x0030;

// ----------------------------------------------------------------------------
// GATT Layout
// ----------------------------------------------------------------------------

fn index_of(which: TileBusCharacteristic) -> u16 {
    TileBusCharacteristic::ALL
        .iter()
        .position(|c| *c == which)
        .unwrap_or(0) as u16
}

pub fn declaration_handle(which: TileBusCharacteristic) -> u16 {
    TILEBUS_START + 1 + 3 * index_of(which)
}

pub fn value_handle(which: TileBusCharacteristic) -> u16 {
    declaration_handle(which) + 1
}

pub fn config_handle(which: TileBusCharacteristic) -> u16 {
    declaration_handle(which) + 2
}

// ----------------------------------------------------------------------------
// Mock State
// ----------------------------------------------------------------------------

/// A write the host performed on the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub handle: u16,
    pub data: Vec<u8>,
    pub acknowledged: bool,
}

/// Knobs and records shared between a test and the mock dongle
pub struct MockState {
    /// Answer get_status with the connected flag
    pub alive: bool,
    /// Never report a connection as established
    pub refuse_connect: bool,
    /// Answer system hello
    pub answer_hello: bool,
    /// Expose the TileBus service at all
    pub include_service: bool,
    /// TileBus characteristics the peripheral exposes
    pub characteristics: Vec<TileBusCharacteristic>,
    /// Characteristic whose declaration claims the last attribute handle
    pub last_handle: Option<TileBusCharacteristic>,
    /// Packets reported while discovering
    pub scan_reports: Vec<ScanReport>,
    /// RPC answers keyed by (address, rpc id); missing entries never answer
    pub rpcs: HashMap<(u8, u16), RpcResponse>,
    pub commands: Vec<Command>,
    pub writes: Vec<RecordedWrite>,
    pub connects: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            alive: true,
            refuse_connect: false,
            answer_hello: true,
            include_service: true,
            characteristics: TileBusCharacteristic::ALL.to_vec(),
            last_handle: None,
            scan_reports: Vec::new(),
            rpcs: HashMap::new(),
            commands: Vec::new(),
            writes: Vec::new(),
            connects: 0,
        }
    }
}

impl MockState {
    /// Writes to one characteristic value
    pub fn writes_to(&self, which: TileBusCharacteristic) -> Vec<RecordedWrite> {
        let handle = value_handle(which);
        self.writes
            .iter()
            .filter(|w| w.handle == handle)
            .cloned()
            .collect()
    }

    /// Whether notifications were enabled on a characteristic
    pub fn subscribed(&self, which: TileBusCharacteristic) -> bool {
        let handle = config_handle(which);
        self.writes
            .iter()
            .any(|w| w.handle == handle && w.data == [1, 0])
    }
}

// ----------------------------------------------------------------------------
// Mock Dongle
// ----------------------------------------------------------------------------

/// Test-side handle onto a running mock dongle
#[derive(Clone)]
pub struct MockDongle {
    pub state: Arc<Mutex<MockState>>,
    inject: mpsc::UnboundedSender<Frame>,
}

impl MockDongle {
    pub fn with_state<F: FnOnce(&mut MockState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn read<T, F: FnOnce(&MockState) -> T>(&self, f: F) -> T {
        f(&self.state.lock().unwrap())
    }

    /// Push an unsolicited event to the host
    pub fn inject(&self, event: Event) {
        self.inject.send(event.to_frame()).unwrap();
    }

    /// Push a notification on a TileBus characteristic
    pub fn notify(&self, which: TileBusCharacteristic, value: Vec<u8>) {
        self.inject(Event::AttributeValue {
            connection: 0,
            handle: value_handle(which),
            value_type: attribute_value_type::NOTIFY,
            value,
        });
    }
}

/// Short timeouts so failure paths finish quickly
pub fn test_config() -> BleTransportConfig {
    BleTransportConfig::new()
        .with_command_timeout(Duration::from_millis(200))
        .with_connect_timeout(Duration::from_millis(300))
        .with_rpc_timeout(Duration::from_millis(300))
        .with_probe_timeout(Duration::from_millis(500))
        .with_status_timeout(Duration::from_millis(100))
        .with_scan_duration(Duration::from_millis(100))
}

/// Start a mock dongle and a transport talking to it
pub fn start(state: MockState) -> (BleTransport, MockDongle) {
    let (host, dongle) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(host);
    let session = DongleSession::from_io(reader, writer, test_config());

    let (inject, injected) = mpsc::unbounded_channel();
    let mock = MockDongle {
        state: Arc::new(Mutex::new(state)),
        inject,
    };
    tokio::spawn(run(dongle, Arc::clone(&mock.state), injected));

    (BleTransport::from_session(session), mock)
}

async fn run(
    mut io: DuplexStream,
    state: Arc<Mutex<MockState>>,
    mut injected: mpsc::UnboundedReceiver<Frame>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 1024];

    loop {
        tokio::select! {
            read = io.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                decoder.push(&buf[..n]);
                while let Some(frame) = decoder.next_frame() {
                    let replies = match Command::parse(&frame) {
                        Ok(command) => handle(&state, command),
                        Err(_) => Vec::new(),
                    };
                    for reply in replies {
                        if send(&mut io, &reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Some(frame) = injected.recv() => {
                if send(&mut io, &frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn send(io: &mut DuplexStream, frame: &Frame) -> std::io::Result<()> {
    let bytes = frame
        .encode()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    io.write_all(&bytes).await
}

fn response(command: &Command, payload: Vec<u8>) -> Frame {
    let (class, id) = command.class_id();
    Frame::command(class, id, payload)
}

fn completed(connection: u8, handle: u16) -> Frame {
    Event::ProcedureCompleted {
        connection,
        result: 0,
        handle,
    }
    .to_frame()
}

fn handle(state: &Arc<Mutex<MockState>>, command: Command) -> Vec<Frame> {
    let mut state = state.lock().unwrap();
    state.commands.push(command.clone());

    match &command {
        Command::SystemReset => Vec::new(),
        Command::SystemHello => {
            if state.answer_hello {
                vec![response(&command, Vec::new())]
            } else {
                Vec::new()
            }
        }
        Command::SetScanParameters { .. } | Command::EndProcedure => {
            vec![response(&command, vec![0, 0])]
        }
        Command::Discover { .. } => {
            let mut frames = vec![response(&command, vec![0, 0])];
            frames.extend(
                state
                    .scan_reports
                    .iter()
                    .map(|r| Event::ScanResponse(r.clone()).to_frame()),
            );
            frames
        }
        Command::ConnectDirect { address, .. } => {
            state.connects += 1;
            let mut frames = vec![response(&command, vec![0, 0, 0])];
            if !state.refuse_connect {
                state.alive = true;
                frames.push(
                    Event::ConnectionStatus {
                        connection: 0,
                        flags: 0x05,
                        address: *address,
                        address_type: 1,
                        interval: 6,
                        timeout: 100,
                        latency: 0,
                        bonding: 0xFF,
                    }
                    .to_frame(),
                );
            }
            frames
        }
        Command::GetStatus { connection } => {
            let mut frames = vec![response(&command, vec![*connection])];
            if state.alive {
                frames.push(
                    Event::ConnectionStatus {
                        connection: *connection,
                        flags: 0x01,
                        address: DEVICE_WIRE_ADDRESS,
                        address_type: 1,
                        interval: 6,
                        timeout: 100,
                        latency: 0,
                        bonding: 0xFF,
                    }
                    .to_frame(),
                );
            }
            frames
        }
        Command::Disconnect { connection } => {
            state.alive = false;
            vec![
                response(&command, vec![*connection, 0, 0]),
                Event::Disconnected {
                    connection: *connection,
                    reason: 0x0216,
                }
                .to_frame(),
            ]
        }
        Command::ReadByGroupType { connection, .. } => {
            let mut frames = vec![
                response(&command, vec![*connection, 0, 0]),
                Event::GroupFound {
                    connection: *connection,
                    start: 0x0001,
                    end: 0x000F,
                    uuid: GENERIC_ACCESS_UUID.to_le_bytes().to_vec(),
                }
                .to_frame(),
            ];
            if state.include_service {
                frames.push(
                    Event::GroupFound {
                        connection: *connection,
                        start: TILEBUS_START,
                        end: TILEBUS_END,
                        uuid: TILEBUS_SERVICE_UUID.as_u128().to_le_bytes().to_vec(),
                    }
                    .to_frame(),
                );
            }
            frames.push(completed(*connection, 0));
            frames
        }
        Command::ReadByType {
            connection,
            start,
            end,
            ..
        } => {
            let mut frames = vec![response(&command, vec![*connection, 0, 0])];
            for which in &state.characteristics {
                let decl = declaration_handle(*which);
                if decl < *start || decl > *end {
                    continue;
                }
                let handle = if state.last_handle == Some(*which) {
                    0xFFFF
                } else {
                    value_handle(*which)
                };
                let mut value = vec![0x1A];
                value.extend_from_slice(&handle.to_le_bytes());
                value.extend_from_slice(&which.short_uuid().to_le_bytes());
                frames.push(
                    Event::AttributeValue {
                        connection: *connection,
                        handle: decl,
                        value_type: attribute_value_type::READ_BY_TYPE,
                        value,
                    }
                    .to_frame(),
                );
            }
            frames.push(completed(*connection, 0));
            frames
        }
        Command::AttributeWrite {
            connection,
            handle,
            data,
        } => {
            state.writes.push(RecordedWrite {
                handle: *handle,
                data: data.clone(),
                acknowledged: true,
            });
            let mut frames = vec![
                response(&command, vec![*connection, 0, 0]),
                completed(*connection, *handle),
            ];
            if *handle == value_handle(TileBusCharacteristic::SendHeader) {
                frames.extend(answer_rpc(&state, *connection, data));
            }
            frames
        }
        Command::WriteCommand {
            connection,
            handle,
            data,
        } => {
            state.writes.push(RecordedWrite {
                handle: *handle,
                data: data.clone(),
                acknowledged: false,
            });
            vec![response(&command, vec![*connection, 0, 0])]
        }
    }
}

fn answer_rpc(state: &MockState, connection: u8, header: &[u8]) -> Vec<Frame> {
    if header.len() != 5 {
        return Vec::new();
    }
    let (command, feature, address) = (header[2], header[3], header[4]);
    let rpc_id = (u16::from(feature) << 8) | u16::from(command);

    let Some(response) = state.rpcs.get(&(address, rpc_id)) else {
        return Vec::new();
    };

    let encoded = response.encode();
    let notify = |which: TileBusCharacteristic, value: Vec<u8>| {
        Event::AttributeValue {
            connection,
            handle: value_handle(which),
            value_type: attribute_value_type::NOTIFY,
            value,
        }
        .to_frame()
    };

    let mut frames = vec![notify(
        TileBusCharacteristic::ReceiveHeader,
        encoded[..4.min(encoded.len())].to_vec(),
    )];
    if encoded.len() > 4 {
        frames.push(notify(
            TileBusCharacteristic::ReceivePayload,
            encoded[4..].to_vec(),
        ));
    }
    frames
}

// ----------------------------------------------------------------------------
// Packet Builders
// ----------------------------------------------------------------------------

/// Advertisement as a TileBus device broadcasts it
pub fn advertisement(service: Uuid, device_uuid: u32, flags: u16) -> Vec<u8> {
    let mut data = vec![0x02, 0x01, 0x06, 17, 0x06];
    data.extend_from_slice(&service.to_bytes_le());
    data.extend_from_slice(&[9, 0xFF]);
    data.extend_from_slice(&0x03C0u16.to_le_bytes());
    data.extend_from_slice(&device_uuid.to_le_bytes());
    data.extend_from_slice(&flags.to_le_bytes());
    data
}

/// Scan response carrying voltage and one broadcast reading
pub fn scan_response(voltage: u16, stream: u16, value: u32, reading_time: u32, now: u32) -> Vec<u8> {
    let mut data = vec![30, 0xFF];
    data.extend_from_slice(&0x03C0u16.to_le_bytes());
    data.extend_from_slice(&voltage.to_le_bytes());
    data.extend_from_slice(&stream.to_le_bytes());
    data.extend_from_slice(&value.to_le_bytes());
    data.extend_from_slice(&reading_time.to_le_bytes());
    data.extend_from_slice(&now.to_le_bytes());
    data.extend_from_slice(&[0u8; 11]);
    data
}

pub fn scan_report(sender: [u8; 6], packet_type: u8, data: Vec<u8>) -> ScanReport {
    ScanReport {
        rssi: -58,
        packet_type,
        sender,
        address_type: 1,
        bond: 0xFF,
        data,
    }
}

/// Status RPC answer naming the tile's module
pub fn status_response(name: &str) -> RpcResponse {
    let mut payload = 0x0001u16.to_le_bytes().to_vec();
    let mut padded = name.as_bytes().to_vec();
    padded.resize(6, b' ');
    payload.extend_from_slice(&padded);
    payload.extend_from_slice(&[1, 2, 3, 0]);
    RpcResponse {
        status: 0xC0,
        payload,
    }
}
