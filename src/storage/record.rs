use crate::error::{Error, Result};

use std::time::{SystemTime, UNIX_EPOCH};

/// The on-disk size of a record header.
pub const HEADER_SIZE: usize = 16;

/// The reserved value marking a key as deleted. The codec treats it as an
/// ordinary value; the store gives it meaning.
pub const TOMBSTONE: &[u8] = b"$$T$$";

/// A single log record, the unit of persistence. On disk it is encoded as a
/// 16-byte little-endian header `<crc, timestamp, key_size, value_size>`
/// followed immediately by the key bytes and then the value bytes, with no
/// padding. The CRC-32 covers the value bytes only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// CRC-32 of the value bytes.
    pub crc: u32,
    /// Wall-clock seconds since the Unix epoch, assigned at encode time.
    pub timestamp: u32,
    /// The key, as raw bytes.
    pub key: Vec<u8>,
    /// The value, as raw bytes.
    pub value: Vec<u8>,
}

impl Record {
    /// Creates a record for the given key and value, stamping the current
    /// wall-clock time and computing the value checksum. Keys and values
    /// whose length does not fit in 32 bits are rejected.
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Result<Self> {
        if key.len() > u32::MAX as usize {
            return Err(Error::Oversize(format!("key is {} bytes", key.len())));
        }
        if value.len() > u32::MAX as usize {
            return Err(Error::Oversize(format!("value is {} bytes", value.len())));
        }
        Ok(Self { crc: crc32fast::hash(&value), timestamp: unix_now(), key, value })
    }

    /// The record's full on-disk size, header included.
    pub fn size(&self) -> u64 {
        (HEADER_SIZE + self.key.len() + self.value.len()) as u64
    }

    /// Returns true if the value is the tombstone sentinel.
    pub fn is_tombstone(&self) -> bool {
        self.value == TOMBSTONE
    }

    /// Encodes the record as header + key + value.
    pub fn encode(&self) -> Vec<u8> {
        let header = Header {
            crc: self.crc,
            timestamp: self.timestamp,
            key_size: self.key.len() as u32,
            value_size: self.value.len() as u32,
        };
        let mut buf = Vec::with_capacity(self.size() as usize);
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        buf
    }

    /// Decodes a record from a buffer containing exactly one record,
    /// verifying that the recomputed CRC of the value matches the stored one.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Truncated(format!("record header needs 16 bytes, got {}", buf.len())));
        }
        let mut head = [0u8; HEADER_SIZE];
        head.copy_from_slice(&buf[..HEADER_SIZE]);
        let header = Header::decode(&head);
        if buf.len() as u64 != header.record_size() {
            return Err(Error::Corrupt(format!(
                "record body is {} bytes, header claims {}",
                buf.len() - HEADER_SIZE,
                header.record_size() as usize - HEADER_SIZE
            )));
        }
        let key_end = HEADER_SIZE + header.key_size as usize;
        let key = buf[HEADER_SIZE..key_end].to_vec();
        let value = buf[key_end..].to_vec();
        if crc32fast::hash(&value) != header.crc {
            return Err(Error::Corrupt(format!("CRC mismatch for key of {} bytes", key.len())));
        }
        Ok(Self { crc: header.crc, timestamp: header.timestamp, key, value })
    }
}

/// A decoded record header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub crc: u32,
    pub timestamp: u32,
    pub key_size: u32,
    pub value_size: u32,
}

impl Header {
    /// Decodes the four little-endian header fields.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self { crc: word(0), timestamp: word(4), key_size: word(8), value_size: word(12) }
    }

    /// Encodes the header as 16 little-endian bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.crc.to_le_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8..12].copy_from_slice(&self.key_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.value_size.to_le_bytes());
        buf
    }

    /// The full on-disk size of the record this header describes.
    pub fn record_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.key_size as u64 + self.value_size as u64
    }
}

/// Wall-clock seconds since the Unix epoch, truncated to 32 bits.
fn unix_now() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() as u32)
}
