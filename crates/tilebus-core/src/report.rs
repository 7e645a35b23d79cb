//! Reports streamed by a device once streaming is enabled

use serde::{Deserialize, Serialize};

/// Format code of a single-reading report
pub const INDIVIDUAL_READING_FORMAT: u8 = 0;

/// Encoded size of a single-reading report
pub const INDIVIDUAL_READING_SIZE: usize = 20;

/// One sensor reading pushed by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndividualReadingReport {
    pub stream: u16,
    pub uuid: u32,
    pub sent_timestamp: u32,
    pub reading_timestamp: u32,
    pub value: u32,
}

/// A report received on the streaming channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Report {
    IndividualReading(IndividualReadingReport),
    /// Any report format this crate does not interpret
    Raw(Vec<u8>),
}

impl Report {
    /// Interpret the bytes of one streaming notification
    pub fn parse(data: &[u8]) -> Self {
        if data.len() != INDIVIDUAL_READING_SIZE || data[0] != INDIVIDUAL_READING_FORMAT {
            return Report::Raw(data.to_vec());
        }

        let u32_at = |offset: usize| {
            u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ])
        };

        Report::IndividualReading(IndividualReadingReport {
            stream: u16::from_le_bytes([data[2], data[3]]),
            uuid: u32_at(4),
            sent_timestamp: u32_at(8),
            reading_timestamp: u32_at(12),
            value: u32_at(16),
        })
    }
}
