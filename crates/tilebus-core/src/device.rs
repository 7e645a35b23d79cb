//! Records describing devices found while scanning

use serde::{Deserialize, Serialize};

/// A sensor reading a device publishes in its scan response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibleReading {
    pub stream_id: u16,
    pub timestamp: u32,
    pub value: u32,
}

/// Everything learned about one device during a scan cycle
///
/// The advertisement fills in identity and flags; a later scan response for
/// the same address adds voltage, device time and the visible reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub address: String,
    pub uuid: u32,
    pub connection_string: String,
    pub pending_data: bool,
    pub low_voltage: bool,
    pub user_connected: bool,
    pub signal_strength: i8,
    pub voltage: Option<f64>,
    pub current_time: Option<u32>,
    pub visible_readings: Vec<VisibleReading>,
}
