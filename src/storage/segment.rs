use super::record::{Header, Record, HEADER_SIZE};
use crate::error::{Error, Result};

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// The default soft size cap for a segment file, in bytes.
pub const DEFAULT_SEGMENT_CAP: u64 = 1024;

/// Returns the path of the data file for a segment id.
pub(crate) fn data_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:04}.data"))
}

/// Returns the path of the hint sidecar for a segment id.
pub(crate) fn hint_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:04}.hint"))
}

/// A single segment file: a concatenation of records with no padding and no
/// trailer, named `NNNN.data` by its decimal id. The active segment is opened
/// in append mode and tracks its own write offset; frozen segments are opened
/// read-only on demand. A segment is full once its write offset reaches the
/// size cap. The cap is soft: the final record may cross it, and no record is
/// ever split across segments.
pub struct Segment {
    /// The segment's numeric id.
    id: u64,
    /// The opened segment file.
    file: File,
    /// The offset at which the next record will be appended. Equals the file
    /// size for segments opened for writing; unused for read-only segments.
    write_offset: u64,
    /// The soft size cap.
    cap: u64,
}

impl Segment {
    /// Creates a segment for writing, truncating any stale file at its path.
    pub fn create(dir: &Path, id: u64, cap: u64) -> Result<Self> {
        let path = data_path(dir, id);
        let file = OpenOptions::new().read(true).append(true).create(true).open(&path)?;
        file.set_len(0)?; // truncate file if it exists
        Ok(Self { id, file, write_offset: 0, cap })
    }

    /// Opens an existing segment read-only, for replay or point reads.
    pub fn open(dir: &Path, id: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(data_path(dir, id))?;
        Ok(Self { id, file, write_offset: 0, cap: DEFAULT_SEGMENT_CAP })
    }

    /// The segment's id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The offset at which the next record will be appended.
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// True once the write offset has reached the size cap.
    pub fn is_full(&self) -> bool {
        self.write_offset >= self.cap
    }

    /// Encodes and appends a record, forcing it to stable storage before
    /// returning. Returns the offset of the record's header along with the
    /// record itself (the caller needs its timestamp and size to index it).
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<(u64, Record)> {
        let record = Record::new(key.to_vec(), value.to_vec())?;
        self.file.write_all(&record.encode())?;
        self.sync()?;
        let offset = self.write_offset;
        self.write_offset += record.size();
        Ok((offset, record))
    }

    /// Reads the value of the record at the given offset. The lookup key is
    /// checked against the stored key bytes, and the value against its CRC,
    /// so a stale or misdirected keydir entry surfaces here rather than
    /// returning another key's data.
    pub fn read_value(&mut self, offset: u64, key: &[u8]) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut head = [0u8; HEADER_SIZE];
        self.file.read_exact(&mut head).map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::Invariant(format!(
                "no record at offset {offset} in segment {:04}",
                self.id
            )),
            _ => err.into(),
        })?;
        let header = Header::decode(&head);

        let mut stored_key = vec![0; header.key_size as usize];
        self.read_body(&mut stored_key, offset)?;
        if stored_key != key {
            return Err(Error::Invariant(format!(
                "record at offset {offset} in segment {:04} holds a different key",
                self.id
            )));
        }

        let mut value = vec![0; header.value_size as usize];
        self.read_body(&mut value, offset)?;
        if crc32fast::hash(&value) != header.crc {
            return Err(Error::Corrupt(format!(
                "CRC mismatch at offset {offset} in segment {:04}",
                self.id
            )));
        }
        Ok(value)
    }

    /// Reads record body bytes, mapping a short read to a corruption error.
    fn read_body(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact(buf).map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::Corrupt(format!(
                "record at offset {offset} in segment {:04} is short",
                self.id
            )),
            _ => err.into(),
        })
    }

    /// Returns an iterator over the segment's records from offset 0, yielding
    /// each record together with the offset immediately following it. The
    /// iteration ends cleanly at a record boundary; a file that ends
    /// mid-record yields an error instead.
    pub fn iter(&mut self) -> Result<SegmentIter<'_>> {
        let len = self.file.metadata()?.len();
        let mut reader = BufReader::new(&mut self.file);
        reader.seek(SeekFrom::Start(0))?;
        Ok(SegmentIter { id: self.id, reader, pos: 0, len })
    }

    /// Flushes the segment to stable storage.
    pub fn sync(&self) -> Result<()> {
        // Don't fsync in tests, to speed them up.
        #[cfg(not(test))]
        self.file.sync_all()?;
        Ok(())
    }

    /// Flushes and closes the segment.
    pub fn close(self) -> Result<()> {
        self.sync()
    }
}

/// A streaming decoder over a segment's records. Yields `(record, offset of
/// the following record)` pairs, and fuses after the first error.
pub struct SegmentIter<'a> {
    id: u64,
    reader: BufReader<&'a mut File>,
    pos: u64,
    len: u64,
}

impl SegmentIter<'_> {
    fn try_next(&mut self) -> Result<(Record, u64)> {
        if self.len - self.pos < HEADER_SIZE as u64 {
            return Err(Error::Truncated(format!(
                "segment {:04} ends mid-header at offset {}",
                self.id, self.pos
            )));
        }
        let mut head = [0u8; HEADER_SIZE];
        self.reader.read_exact(&mut head)?;
        let header = Header::decode(&head);

        let next_offset = self.pos + header.record_size();
        if next_offset > self.len {
            return Err(Error::Truncated(format!(
                "record at offset {} in segment {:04} extends past end of file",
                self.pos, self.id
            )));
        }

        let mut key = vec![0; header.key_size as usize];
        self.reader.read_exact(&mut key)?;
        let mut value = vec![0; header.value_size as usize];
        self.reader.read_exact(&mut value)?;
        if crc32fast::hash(&value) != header.crc {
            return Err(Error::Corrupt(format!(
                "CRC mismatch at offset {} in segment {:04}",
                self.pos, self.id
            )));
        }

        let record = Record { crc: header.crc, timestamp: header.timestamp, key, value };
        self.pos = next_offset;
        Ok((record, next_offset))
    }
}

impl Iterator for SegmentIter<'_> {
    type Item = Result<(Record, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.len {
            return None;
        }
        let result = self.try_next();
        if result.is_err() {
            self.pos = self.len; // don't resume past a bad record
        }
        Some(result)
    }
}
