use super::keydir::{self, HintEntry, Keydir, KeydirEntry};
use super::record::{HEADER_SIZE, TOMBSTONE};
use super::segment::{self, Segment, DEFAULT_SEGMENT_CAP};
use crate::error::{Error, Result};

use fs4::fs_std::FileExt;
use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// The advisory lock file taken out on the store directory.
const LOCK_FILE: &str = "LOCK";

/// A variant of BitCask, a log-structured key-value engine used e.g. by the
/// Riak database. It is not compatible with BitCask databases generated by
/// other implementations. See: https://riak.com/assets/bitcask-intro.pdf
///
/// BitCask writes key-value pairs to an append-only log, and keeps a mapping
/// of keys to file positions in memory (the keydir). All live keys must fit
/// in memory. Deletes write a tombstone value to the log. The log is
/// partitioned into segment files of capped size: all writes go to a single
/// active segment, which is frozen once it reaches the cap and replaced by a
/// new active segment with the next id. Reads are served from whichever
/// segment the keydir points at, through a short-lived read-only handle for
/// frozen segments.
///
/// On open, the keydir is rebuilt by replaying every segment in id order, or
/// from hint sidecar files where a compaction has left them; the two are
/// semantically equivalent, hints just skip the value bytes. To reclaim dead
/// space, the segment set can be compacted into a fresh directory, either
/// per segment (dropping records superseded within the same segment) or
/// globally (rewriting only the live keydir).
///
/// A store assumes a single writer and no concurrent readers; an exclusive
/// advisory lock on the directory enforces this across processes.
pub struct BitCask {
    /// The store directory.
    dir: PathBuf,
    /// The active segment, receiving all new records.
    active: Segment,
    /// Ids of frozen segments, ascending. Frozen segments are never written
    /// again; the active segment's id exceeds them all.
    segments: Vec<u64>,
    /// Maps keys to the position of their newest record across all segments.
    keydir: Keydir,
    /// The soft segment size cap.
    cap: u64,
    /// Holds the directory's advisory lock for the store's lifetime.
    _lockfile: File,
}

impl BitCask {
    /// Opens or creates a BitCask database in the given directory, with the
    /// default segment size cap.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_cap(dir, DEFAULT_SEGMENT_CAP)
    }

    /// Opens or creates a BitCask database with the given segment size cap.
    /// Takes out an exclusive lock on the directory until the store is
    /// closed, or errors if the lock is already held. Rebuilds the keydir
    /// from hint files where present, replaying data files otherwise, then
    /// opens a fresh active segment.
    pub fn open_with_cap(dir: impl Into<PathBuf>, cap: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        log::info!("Opening database {}", dir.display());

        let lockfile =
            OpenOptions::new().write(true).create(true).truncate(false).open(dir.join(LOCK_FILE))?;
        lockfile.try_lock_exclusive()?;

        let ids = list_segments(&dir)?;
        let mut keydir = Keydir::new();
        for &id in &ids {
            let hint = segment::hint_path(&dir, id);
            if hint.is_file() {
                keydir.merge(keydir::load_hint(&hint)?);
            } else {
                replay_segment(&dir, id, &mut keydir)?;
            }
        }
        log::info!(
            "Indexed {} live keys across {} segments in {}",
            keydir.len(),
            ids.len(),
            dir.display()
        );

        let active = Segment::create(&dir, ids.len() as u64 + 1, cap)?;
        Ok(Self { dir, active, segments: ids, keydir, cap, _lockfile: lockfile })
    }

    /// Gets the value for a key, or None if the key does not exist. The value
    /// is read back from whichever segment holds the key's newest record.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (file_id, offset) = match self.keydir.get(key) {
            Some(entry) => (entry.file_id, entry.record_offset),
            None => return Ok(None),
        };
        let value = if file_id == self.active.id() {
            self.active.read_value(offset, key)?
        } else {
            Segment::open(&self.dir, file_id)?.read_value(offset, key)?
        };
        Ok(Some(value))
    }

    /// Sets the value for a key, appending a record to the active segment and
    /// pointing the keydir at it. The keydir is only updated once the record
    /// is on stable storage. Setting the tombstone value deletes the key: a
    /// replay of the log would treat the record as a delete, so the live
    /// keydir must too. Rolls the active segment once it reaches the cap.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let (offset, record) = self.active.append(key, value)?;
        if record.is_tombstone() {
            self.keydir.delete(key);
        } else {
            self.keydir.put(KeydirEntry {
                file_id: self.active.id(),
                record_size: record.size(),
                record_offset: offset,
                timestamp: record.timestamp,
                key: key.to_vec(),
            });
        }
        if self.active.is_full() {
            self.roll()?;
        }
        Ok(())
    }

    /// Deletes a key. The keydir entry is removed before the tombstone is
    /// appended: a crash between the two leaves at worst a dead record on
    /// disk, never a resurrected key.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.keydir.delete(key);
        self.put(key, TOMBSTONE)
    }

    /// Flushes the active segment to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.active.sync()
    }

    /// Flushes and closes the store, releasing the directory lock.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// Freezes the active segment and opens a new one with the next id.
    fn roll(&mut self) -> Result<()> {
        let next = self.active.id() + 1;
        let old = std::mem::replace(&mut self.active, Segment::create(&self.dir, next, self.cap)?);
        let id = old.id();
        old.close()?;
        self.segments.push(id);
        log::debug!("Rolled segment {id:04}, active segment is now {next:04}");
        Ok(())
    }

    /// Returns engine status.
    pub fn status(&mut self) -> Result<Status> {
        let keys = self.keydir.len() as u64;
        let (size, live_disk_size) = self.keydir.iter().fold((0, 0), |(size, live), entry| {
            (size + entry.record_size - HEADER_SIZE as u64, live + entry.record_size)
        });
        let mut total_disk_size = self.active.write_offset();
        for &id in &self.segments {
            total_disk_size += fs::metadata(segment::data_path(&self.dir, id))?.len();
        }
        Ok(Status {
            keys,
            size,
            segments: self.segments.len() as u64 + 1,
            total_disk_size,
            live_disk_size,
            garbage_disk_size: total_disk_size - live_disk_size,
        })
    }
}

impl BitCask {
    /// Compacts the store's segments, one by one in ascending id order, into
    /// a destination directory, writing a same-id data file plus a hint
    /// sidecar for each. The destination must be a different directory; the
    /// source store is left untouched.
    ///
    /// Each pass is scoped to a single segment: only the segment's final
    /// record per key survives, so records superseded within the same segment
    /// are dropped, while values superseded in a later segment are preserved.
    /// Tombstones are carried through and recorded in the hint as deletion
    /// markers: a tombstone may cancel a key written in an earlier segment,
    /// and dropping it would resurrect that key in the destination. Repeating
    /// the pass with the destination as the new source reclaims further
    /// space.
    pub fn compact(&self, dst: impl Into<PathBuf>) -> Result<()> {
        let dst = dst.into();
        fs::create_dir_all(&dst)?;

        let mut ids = self.segments.clone();
        ids.push(self.active.id());
        for &id in &ids {
            self.compact_segment(id, &dst)?;
        }
        log::info!(
            "Compacted {} segments from {} into {}",
            ids.len(),
            self.dir.display(),
            dst.display()
        );
        Ok(())
    }

    /// Compacts a single segment into the destination directory.
    fn compact_segment(&self, id: u64, dst: &Path) -> Result<()> {
        let mut input = Segment::open(&self.dir, id)?;
        let mut output = Segment::create(dst, id, self.cap)?;

        // The segment's final record per key decides what survives.
        let mut latest = BTreeMap::new();
        for item in input.iter()? {
            let (record, _) = item?;
            latest.insert(record.key.clone(), record);
        }

        let mut hint = Vec::with_capacity(latest.len());
        for (key, record) in latest {
            if record.is_tombstone() {
                output.append(&key, TOMBSTONE)?;
                hint.push(HintEntry::Delete { key });
            } else {
                let (offset, written) = output.append(&key, &record.value)?;
                hint.push(HintEntry::Set(KeydirEntry {
                    file_id: id,
                    record_size: written.size(),
                    record_offset: offset,
                    timestamp: written.timestamp,
                    key,
                }));
            }
        }
        output.close()?;
        keydir::save_hint(&segment::hint_path(dst, id), &hint)?;
        Ok(())
    }

    /// Merges the store's live entries into a minimal segment set in a
    /// destination directory, with a hint sidecar per output segment. Unlike
    /// the per-segment [`BitCask::compact`], the destination contains no
    /// tombstones and no garbage; its segment ids restart from 0001. Entries
    /// are written in key order.
    pub fn merge(&mut self, dst: impl Into<PathBuf>) -> Result<()> {
        let dst = dst.into();
        fs::create_dir_all(&dst)?;

        let keys = self.keydir.iter().map(|entry| entry.key.clone()).sorted().collect_vec();
        let live = keys.len();

        let mut output = Segment::create(&dst, 1, self.cap)?;
        let mut hint = Keydir::new();
        for key in keys {
            let Some(value) = self.get(&key)? else { continue };
            let (offset, record) = output.append(&key, &value)?;
            hint.put(KeydirEntry {
                file_id: output.id(),
                record_size: record.size(),
                record_offset: offset,
                timestamp: record.timestamp,
                key,
            });
            if output.is_full() {
                hint.save(&segment::hint_path(&dst, output.id()))?;
                hint = Keydir::new();
                let next = output.id() + 1;
                let old = std::mem::replace(&mut output, Segment::create(&dst, next, self.cap)?);
                old.close()?;
            }
        }
        hint.save(&segment::hint_path(&dst, output.id()))?;
        let count = output.id();
        output.close()?;

        log::info!("Merged {live} live keys into {count} segments in {}", dst.display());
        Ok(())
    }
}

/// Attempt to flush the active segment when the store is closed.
impl Drop for BitCask {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            log::error!("failed to flush file: {}", error)
        }
    }
}

/// Engine status, recomputed on demand from the keydir and file metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// The number of live keys.
    pub keys: u64,
    /// The logical size of the live keys and values, in bytes.
    pub size: u64,
    /// The number of segment files, the active one included.
    pub segments: u64,
    /// The on-disk size of all segment files.
    pub total_disk_size: u64,
    /// The on-disk size of the live records, headers included.
    pub live_disk_size: u64,
    /// The on-disk size of garbage: replaced records and tombstones.
    pub garbage_disk_size: u64,
}

/// Lists the segment ids in a store directory, ascending.
fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("data") {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse().ok())
            .ok_or_else(|| Error::Corrupt(format!("invalid segment filename {}", path.display())))?;
        ids.push(id);
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Replays a segment's records into the keydir: a tombstone removes its key,
/// any other record supersedes the key's current entry. Corrupt or truncated
/// segments fail the replay; they are never repaired here.
fn replay_segment(dir: &Path, id: u64, keydir: &mut Keydir) -> Result<()> {
    let mut segment = Segment::open(dir, id)?;
    for item in segment.iter()? {
        let (record, next_offset) = item?;
        if record.is_tombstone() {
            keydir.delete(&record.key);
        } else {
            keydir.put(KeydirEntry {
                file_id: id,
                record_size: record.size(),
                record_offset: next_offset - record.size(),
                timestamp: record.timestamp,
                key: record.key,
            });
        }
    }
    Ok(())
}
