//! Data block layout and write-back encoding.
//!
//! The polled block is `channel_count` fixed-size records. Each record is big-endian:
//!
//! | Offset | Type | Field      |
//! |--------|------|------------|
//! | 0      | i16  | `ai`       |
//! | 2      | f32  | `pressure` |
//! | 6      | i16  | `position` |
//! | 8      | f32  | `angle`    |
//! | `status_offset` | u16 | status word (optional) |
//!
//! Results are written back as one big-endian i16 per channel.

use serde::{Deserialize, Serialize};

use super::{ChannelId, ChannelSample, RawBlock, RawFrame};
use crate::error::LinkError;

/// Size of the fixed part of a channel record
pub const BASE_RECORD_SIZE: usize = 12;

/// Layout of the polled data block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockLayout {
    /// Data block number on the PLC
    pub db_number: u16,
    /// Byte offset of the first record
    pub start_offset: usize,
    /// Number of channel records
    pub channel_count: u16,
    /// Bytes per record
    pub record_size: usize,
    /// Byte offset of the status word within a record
    pub status_offset: Option<usize>,
    /// Bits of the status word meaning test-active
    pub status_mask: u16,
}

impl Default for BlockLayout {
    fn default() -> Self {
        Self {
            db_number: 9,
            start_offset: 0,
            channel_count: 25,
            record_size: 14,
            status_offset: Some(12),
            status_mask: 0x0001,
        }
    }
}

impl BlockLayout {
    /// Total bytes to read for all channels
    pub fn block_len(&self) -> usize {
        usize::from(self.channel_count) * self.record_size
    }

    /// Reject layouts that cannot hold a record
    pub fn check(&self) -> Result<(), String> {
        if self.channel_count == 0 {
            return Err("link.layout.channel_count must be at least 1".to_string());
        }
        if self.record_size < BASE_RECORD_SIZE {
            return Err(format!(
                "link.layout.record_size {} is smaller than the {} byte base record",
                self.record_size, BASE_RECORD_SIZE
            ));
        }
        if let Some(offset) = self.status_offset {
            if offset + 2 > self.record_size {
                return Err(format!(
                    "link.layout.status_offset {} does not fit in a {} byte record",
                    offset, self.record_size
                ));
            }
            if self.status_mask == 0 {
                return Err("link.layout.status_mask must select at least one bit".to_string());
            }
        }
        Ok(())
    }

    /// Demultiplex a raw block into per-channel samples.
    ///
    /// A truncated block yields only its complete records. A block shorter than one
    /// record is malformed.
    pub fn decode(&self, block: &RawBlock, tick: u64) -> Result<RawFrame, LinkError> {
        let bytes = &block.bytes[..];
        if bytes.len() < self.record_size {
            return Err(LinkError::MalformedBlock {
                expected: self.block_len(),
                actual: bytes.len(),
            });
        }

        let samples = bytes
            .chunks_exact(self.record_size)
            .take(usize::from(self.channel_count))
            .enumerate()
            .map(|(index, record)| {
                let status = self.status_offset.map(|offset| {
                    let word = u16::from_be_bytes([record[offset], record[offset + 1]]);
                    word & self.status_mask != 0
                });
                ChannelSample {
                    // take(channel_count) bounds index to u16
                    channel: index as ChannelId,
                    tick,
                    captured_at: block.captured_at,
                    ai: i16::from_be_bytes([record[0], record[1]]),
                    pressure: f64::from(f32::from_be_bytes([
                        record[2], record[3], record[4], record[5],
                    ])),
                    position: i16::from_be_bytes([record[6], record[7]]),
                    angle: f64::from(f32::from_be_bytes([
                        record[8], record[9], record[10], record[11],
                    ])),
                    status,
                }
            })
            .collect();

        Ok(RawFrame::new(tick, block.captured_at, samples))
    }

    /// Encode one channel record. Used by the mock link and tests.
    pub fn encode_record(&self, sample: &RecordValues, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&sample.ai.to_be_bytes());
        out.extend_from_slice(&(sample.pressure as f32).to_be_bytes());
        out.extend_from_slice(&sample.position.to_be_bytes());
        out.extend_from_slice(&(sample.angle as f32).to_be_bytes());
        out.resize(start + self.record_size, 0);
        if let Some(offset) = self.status_offset {
            let word: u16 = if sample.active { self.status_mask } else { 0 };
            out[start + offset..start + offset + 2].copy_from_slice(&word.to_be_bytes());
        }
    }
}

/// Field values for one encoded record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordValues {
    /// Raw analog input
    pub ai: i16,
    /// Pressure in mbar
    pub pressure: f64,
    /// Actuator position
    pub position: i16,
    /// Actuator angle
    pub angle: f64,
    /// Test-active status bit
    pub active: bool,
}

/// Encoding of per-channel results and the fault register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultEncoding {
    /// Data block receiving results
    pub db_number: u16,
    /// Byte offset of channel 0's result word
    pub result_offset: usize,
    /// Bytes between consecutive channels' result words
    pub result_stride: usize,
    /// Probability multiplier for no-leak results
    pub scale: f64,
    /// Value written for a leak, and added to scaled no-leak results
    pub base: i16,
    /// Byte offset of the fault-code word
    pub fault_offset: usize,
}

impl Default for ResultEncoding {
    fn default() -> Self {
        Self {
            db_number: 9,
            result_offset: 400,
            result_stride: 2,
            scale: 10.0,
            base: 0,
            fault_offset: 398,
        }
    }
}

impl ResultEncoding {
    /// Byte offset of a channel's result word
    pub fn result_address(&self, channel: ChannelId) -> usize {
        self.result_offset + usize::from(channel) * self.result_stride
    }

    /// PLC value for a classification: `base` for a leak, otherwise
    /// `base + trunc(probability * scale)`, saturating at the i16 range.
    pub fn result_value(&self, leak: bool, probability: f64) -> i16 {
        if leak {
            return self.base;
        }
        let scaled = (probability * self.scale).trunc();
        let value = f64::from(self.base) + scaled;
        value.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;

    fn values(pressure: f64, active: bool) -> RecordValues {
        RecordValues {
            ai: 120,
            pressure,
            position: 45,
            angle: 12.5,
            active,
        }
    }

    fn block(layout: &BlockLayout, records: &[RecordValues]) -> RawBlock {
        let mut bytes = Vec::new();
        for record in records {
            layout.encode_record(record, &mut bytes);
        }
        RawBlock {
            bytes: Bytes::from(bytes),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn decodes_big_endian_records() {
        let layout = BlockLayout {
            channel_count: 2,
            ..Default::default()
        };
        let raw = block(&layout, &[values(950.5, false), values(612.25, true)]);

        let frame = layout.decode(&raw, 3).unwrap();
        assert_eq!(frame.samples().len(), 2);

        let second = frame.samples()[1];
        assert_eq!(second.channel, 1);
        assert_eq!(second.tick, 3);
        assert_eq!(second.ai, 120);
        assert_eq!(second.position, 45);
        assert!((second.pressure - 612.25).abs() < 1e-6);
        assert!((second.angle - 12.5).abs() < 1e-6);
        assert_eq!(second.status, Some(true));
        assert_eq!(frame.samples()[0].status, Some(false));
    }

    #[test]
    fn status_is_none_without_status_word() {
        let layout = BlockLayout {
            channel_count: 1,
            record_size: 12,
            status_offset: None,
            ..Default::default()
        };
        let raw = block(&layout, &[values(950.0, true)]);
        let frame = layout.decode(&raw, 0).unwrap();
        assert_eq!(frame.samples()[0].status, None);
    }

    #[test]
    fn truncated_block_keeps_complete_records() {
        let layout = BlockLayout {
            channel_count: 3,
            ..Default::default()
        };
        let mut raw = block(&layout, &[values(1.0, false), values(2.0, false), values(3.0, false)]);
        raw.bytes = raw.bytes.slice(..layout.record_size * 2 + 5);

        let frame = layout.decode(&raw, 0).unwrap();
        assert_eq!(frame.samples().len(), 2);
    }

    #[test]
    fn short_block_is_malformed() {
        let layout = BlockLayout::default();
        let raw = RawBlock {
            bytes: Bytes::from_static(&[0, 1, 2]),
            captured_at: Utc::now(),
        };
        assert!(matches!(
            layout.decode(&raw, 0),
            Err(LinkError::MalformedBlock { actual: 3, .. })
        ));
    }

    #[test]
    fn layout_check_rejects_status_outside_record() {
        let layout = BlockLayout {
            record_size: 12,
            status_offset: Some(12),
            ..Default::default()
        };
        assert!(layout.check().is_err());
        assert!(BlockLayout::default().check().is_ok());
    }

    #[test]
    fn result_value_encoding() {
        let enc = ResultEncoding::default();
        assert_eq!(enc.result_value(true, 0.1), 0);
        assert_eq!(enc.result_value(false, 0.87), 8);
        assert_eq!(enc.result_address(0), 400);
        assert_eq!(enc.result_address(3), 406);

        let offset = ResultEncoding {
            base: 100,
            ..Default::default()
        };
        assert_eq!(offset.result_value(false, 1.0), 110);
        assert_eq!(offset.result_value(true, 1.0), 100);
    }
}
