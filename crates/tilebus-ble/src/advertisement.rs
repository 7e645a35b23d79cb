//! Decoding of TileBus advertisements and scan responses
//!
//! A discoverable TileBus device broadcasts two packets: an advertisement
//! carrying the service uuid, its device uuid and status flags, and a scan
//! response carrying battery voltage, the device clock and its most recent
//! broadcast reading. The two are correlated by sender address within one
//! scan cycle.

use std::collections::HashMap;

use bytes::Buf;
use tilebus_core::{DeviceRecord, VisibleReading};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::bgapi::ScanReport;
use crate::error::BleTransportError;
use crate::protocol::{format_address, TILEBUS_SERVICE_UUID};

// ----------------------------------------------------------------------------
// Packet Layout
// ----------------------------------------------------------------------------

/// Advertising packet types reported by the dongle
pub mod packet_type {
    pub const CONNECTABLE_ADVERTISEMENT: u8 = 0;
    pub const SCAN_RESPONSE: u8 = 4;
    pub const DISCOVERABLE_ADVERTISEMENT: u8 = 6;
}

pub const MIN_ADVERTISEMENT_SIZE: usize = 29;
pub const SCAN_RESPONSE_SIZE: usize = 31;

const FLAGS_PREFIX_SIZE: usize = 3;
const SERVICE_LIST_LENGTH: u8 = 17;
const INCOMPLETE_UUID128_LIST: u8 = 0x06;
const MANUFACTURER_DATA_SIZE: usize = 10;

/// Scan response stream id meaning "no reading broadcast"
pub const NO_STREAM: u16 = 0xFFFF;

const FLAG_PENDING_DATA: u16 = 1 << 0;
const FLAG_LOW_VOLTAGE: u16 = 1 << 1;
const FLAG_USER_CONNECTED: u16 = 1 << 2;

// ----------------------------------------------------------------------------
// Decoded Packets
// ----------------------------------------------------------------------------

/// Fields carried by a TileBus advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertisement {
    pub manufacturer_id: u16,
    pub device_uuid: u32,
    pub pending_data: bool,
    pub low_voltage: bool,
    pub user_connected: bool,
}

impl Advertisement {
    /// Decode an advertisement payload
    ///
    /// Returns `Ok(None)` for well-formed packets that belong to some other
    /// kind of device.
    pub fn parse(data: &[u8]) -> Result<Option<Self>, BleTransportError> {
        if data.len() < MIN_ADVERTISEMENT_SIZE {
            return Err(BleTransportError::Decode(format!(
                "advertisement is {} bytes, expected at least {}",
                data.len(),
                MIN_ADVERTISEMENT_SIZE
            )));
        }

        let mut buf = &data[FLAGS_PREFIX_SIZE..];
        let list_len = buf.get_u8();
        let list_type = buf.get_u8();
        if list_len != SERVICE_LIST_LENGTH || list_type != INCOMPLETE_UUID128_LIST {
            return Ok(None);
        }

        let mut service = [0u8; 16];
        buf.copy_to_slice(&mut service);
        let service = Uuid::from_bytes_le(service);
        if service != TILEBUS_SERVICE_UUID {
            return Ok(None);
        }

        if buf.remaining() < MANUFACTURER_DATA_SIZE {
            return Err(BleTransportError::Decode(format!(
                "advertisement manufacturer data is {} bytes, expected {}",
                buf.remaining(),
                MANUFACTURER_DATA_SIZE
            )));
        }

        let _len = buf.get_u8();
        let _data_type = buf.get_u8();
        let manufacturer_id = buf.get_u16_le();
        let device_uuid = buf.get_u32_le();
        let flags = buf.get_u16_le();

        Ok(Some(Self {
            manufacturer_id,
            device_uuid,
            pending_data: flags & FLAG_PENDING_DATA != 0,
            low_voltage: flags & FLAG_LOW_VOLTAGE != 0,
            user_connected: flags & FLAG_USER_CONNECTED != 0,
        }))
    }
}

/// Fields carried by a TileBus scan response
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanResponseData {
    pub manufacturer_id: u16,
    pub voltage: f64,
    pub current_time: u32,
    pub reading: Option<VisibleReading>,
}

impl ScanResponseData {
    pub fn parse(data: &[u8]) -> Result<Self, BleTransportError> {
        if data.len() != SCAN_RESPONSE_SIZE {
            return Err(BleTransportError::Decode(format!(
                "scan response is {} bytes, expected {}",
                data.len(),
                SCAN_RESPONSE_SIZE
            )));
        }

        let mut buf = data;
        let _len = buf.get_u8();
        let _data_type = buf.get_u8();
        let manufacturer_id = buf.get_u16_le();
        let raw_voltage = buf.get_u16_le();
        let stream_id = buf.get_u16_le();
        let value = buf.get_u32_le();
        let timestamp = buf.get_u32_le();
        let current_time = buf.get_u32_le();

        let reading = (stream_id != NO_STREAM).then_some(VisibleReading {
            stream_id,
            timestamp,
            value,
        });

        Ok(Self {
            manufacturer_id,
            voltage: f64::from(raw_voltage) / 256.0,
            current_time,
            reading,
        })
    }
}

// ----------------------------------------------------------------------------
// Scan Accumulator
// ----------------------------------------------------------------------------

/// Builds device records from the scan reports of one discovery cycle
#[derive(Debug, Default)]
pub struct ScanAccumulator {
    records: Vec<DeviceRecord>,
    by_address: HashMap<String, usize>,
}

impl ScanAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Fold one scan report into the cycle; malformed packets are skipped
    pub fn process(&mut self, report: &ScanReport) {
        let address = format_address(&report.sender);
        let outcome = match report.packet_type {
            packet_type::CONNECTABLE_ADVERTISEMENT | packet_type::DISCOVERABLE_ADVERTISEMENT => {
                self.on_advertisement(address.clone(), report)
            }
            packet_type::SCAN_RESPONSE => self.on_scan_response(&address, report),
            other => {
                trace!("Ignoring packet type {} from {}", other, address);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            debug!("Skipping malformed packet from {}: {}", address, e);
        }
    }

    fn on_advertisement(
        &mut self,
        address: String,
        report: &ScanReport,
    ) -> Result<(), BleTransportError> {
        let Some(ad) = Advertisement::parse(&report.data)? else {
            trace!("Ignoring advertisement from non-TileBus device {}", address);
            return Ok(());
        };

        match self.by_address.get(&address) {
            Some(&i) => {
                let record = &mut self.records[i];
                record.uuid = ad.device_uuid;
                record.pending_data = ad.pending_data;
                record.low_voltage = ad.low_voltage;
                record.user_connected = ad.user_connected;
                record.signal_strength = report.rssi;
            }
            None => {
                debug!(
                    "Found TileBus device 0x{:x} at {} ({} dBm)",
                    ad.device_uuid, address, report.rssi
                );
                self.by_address.insert(address.clone(), self.records.len());
                self.records.push(DeviceRecord {
                    connection_string: address.clone(),
                    address,
                    uuid: ad.device_uuid,
                    pending_data: ad.pending_data,
                    low_voltage: ad.low_voltage,
                    user_connected: ad.user_connected,
                    signal_strength: report.rssi,
                    voltage: None,
                    current_time: None,
                    visible_readings: Vec::new(),
                });
            }
        }
        Ok(())
    }

    fn on_scan_response(
        &mut self,
        address: &str,
        report: &ScanReport,
    ) -> Result<(), BleTransportError> {
        let Some(&i) = self.by_address.get(address) else {
            trace!("Ignoring scan response from unseen address {}", address);
            return Ok(());
        };

        let response = ScanResponseData::parse(&report.data)?;
        let record = &mut self.records[i];
        record.voltage = Some(response.voltage);
        record.current_time = Some(response.current_time);
        if let Some(reading) = response.reading {
            record.visible_readings = vec![reading];
        }
        Ok(())
    }

    /// Records in the order their devices were first seen
    pub fn finish(self) -> Vec<DeviceRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENDER: [u8; 6] = [0x55, 0x44, 0x33, 0x22, 0x11, 0xC0];

    fn advertisement(service: Uuid, device_uuid: u32, flags: u16) -> Vec<u8> {
        let mut data = vec![0x02, 0x01, 0x06, 17, 0x06];
        data.extend_from_slice(&service.to_bytes_le());
        data.extend_from_slice(&[9, 0xFF]);
        data.extend_from_slice(&0x03C0u16.to_le_bytes());
        data.extend_from_slice(&device_uuid.to_le_bytes());
        data.extend_from_slice(&flags.to_le_bytes());
        data
    }

    fn scan_response(voltage: u16, stream: u16, value: u32, time: u32, now: u32) -> Vec<u8> {
        let mut data = vec![30, 0xFF];
        data.extend_from_slice(&0x03C0u16.to_le_bytes());
        data.extend_from_slice(&voltage.to_le_bytes());
        data.extend_from_slice(&stream.to_le_bytes());
        data.extend_from_slice(&value.to_le_bytes());
        data.extend_from_slice(&time.to_le_bytes());
        data.extend_from_slice(&now.to_le_bytes());
        data.extend_from_slice(&[0u8; 11]);
        data
    }

    fn report(packet_type: u8, data: Vec<u8>) -> ScanReport {
        ScanReport {
            rssi: -60,
            packet_type,
            sender: SENDER,
            address_type: 1,
            bond: 0xFF,
            data,
        }
    }

    #[test]
    fn test_advertisement_flags() {
        let ad = Advertisement::parse(&advertisement(TILEBUS_SERVICE_UUID, 0x42, 0b101))
            .unwrap()
            .unwrap();
        assert_eq!(ad.device_uuid, 0x42);
        assert!(ad.pending_data);
        assert!(!ad.low_voltage);
        assert!(ad.user_connected);
    }

    #[test]
    fn test_service_uuid_uses_guid_byte_order() {
        let mut data = vec![0x02, 0x01, 0x06, 17, 0x06];
        data.extend_from_slice(&[
            0x63, 0x0f, 0xf6, 0x0f, 0x2c, 0x13, 0x11, 0xe6, 0xba, 0x53, 0xf7, 0x3f, 0x00, 0x20,
            0x00, 0x00,
        ]);
        data.extend_from_slice(&[9, 0xFF, 0xC0, 0x03, 0x42, 0, 0, 0, 0b101, 0]);

        let ad = Advertisement::parse(&data).unwrap().unwrap();
        assert_eq!(ad.device_uuid, 0x42);
        assert!(ad.pending_data);
        assert!(ad.user_connected);

        // Fully reversed bytes are a different uuid
        let mut reversed = data.clone();
        reversed[5..21].reverse();
        assert_eq!(Advertisement::parse(&reversed).unwrap(), None);
    }

    #[test]
    fn test_foreign_service_is_ignored() {
        let foreign = Uuid::from_u128(0x1234);
        assert_eq!(
            Advertisement::parse(&advertisement(foreign, 0x42, 0)).unwrap(),
            None
        );
    }

    #[test]
    fn test_short_advertisement_rejected() {
        let data = advertisement(TILEBUS_SERVICE_UUID, 1, 0);
        assert!(Advertisement::parse(&data[..28]).is_err());
        assert!(Advertisement::parse(&data[..30]).is_err());
    }

    #[test]
    fn test_voltage_scaling() {
        let response = ScanResponseData::parse(&scan_response(844, NO_STREAM, 0, 0, 77)).unwrap();
        assert_eq!(response.voltage, 3.296875);
        assert_eq!(response.current_time, 77);
        assert_eq!(response.reading, None);
    }

    #[test]
    fn test_scan_response_size_is_exact() {
        let mut data = scan_response(844, 1, 2, 3, 4);
        data.push(0);
        assert!(ScanResponseData::parse(&data).is_err());
    }

    #[test]
    fn test_accumulator_merges_scan_response() {
        let mut scan = ScanAccumulator::new();
        scan.process(&report(
            packet_type::CONNECTABLE_ADVERTISEMENT,
            advertisement(TILEBUS_SERVICE_UUID, 0x10, 0b010),
        ));
        scan.process(&report(
            packet_type::SCAN_RESPONSE,
            scan_response(844, 0x5001, 900, 120, 130),
        ));

        let records = scan.finish();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.address, "C0:11:22:33:44:55");
        assert_eq!(record.connection_string, record.address);
        assert!(record.low_voltage);
        assert_eq!(record.voltage, Some(3.296875));
        assert_eq!(record.current_time, Some(130));
        assert_eq!(
            record.visible_readings,
            vec![VisibleReading {
                stream_id: 0x5001,
                timestamp: 120,
                value: 900
            }]
        );
    }

    #[test]
    fn test_stray_scan_response_ignored() {
        let mut scan = ScanAccumulator::new();
        scan.process(&report(
            packet_type::SCAN_RESPONSE,
            scan_response(844, NO_STREAM, 0, 0, 0),
        ));
        assert!(scan.is_empty());
    }

    #[test]
    fn test_repeated_advertisement_last_write_wins() {
        let mut scan = ScanAccumulator::new();
        scan.process(&report(
            packet_type::DISCOVERABLE_ADVERTISEMENT,
            advertisement(TILEBUS_SERVICE_UUID, 0x10, 0b001),
        ));
        scan.process(&report(
            packet_type::DISCOVERABLE_ADVERTISEMENT,
            advertisement(TILEBUS_SERVICE_UUID, 0x10, 0b000),
        ));
        scan.process(&report(packet_type::CONNECTABLE_ADVERTISEMENT, vec![0; 5]));

        let records = scan.finish();
        assert_eq!(records.len(), 1);
        assert!(!records[0].pending_data);
    }
}
