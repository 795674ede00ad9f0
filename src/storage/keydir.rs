use crate::error::Result;

use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write as _};
use std::path::Path;

/// The location of a key's newest record on disk. The key is echoed into the
/// entry so hint files are self-contained.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeydirEntry {
    /// The segment holding the record.
    pub file_id: u64,
    /// The record's full on-disk size, header included.
    pub record_size: u64,
    /// The byte offset of the record's header within the segment.
    pub record_offset: u64,
    /// The record's timestamp.
    pub timestamp: u32,
    /// The key.
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
}

/// A single hint file entry. A hint records the outcome of a segment's newest
/// record per key: a locator for a value, or a deletion marker for a
/// tombstone. Deletion markers matter across segments: a tombstone in a
/// later segment must cancel a key written in an earlier one when the keydir
/// is rebuilt from hints, just as it does during a full replay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HintEntry {
    /// The segment's newest record for this key holds a value.
    Set(KeydirEntry),
    /// The segment's newest record for this key is a tombstone.
    Delete {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
    },
}

/// The in-memory index: an unordered map from each live key to the location
/// of its newest record. Tombstones are never represented here; at most one
/// entry exists per key.
#[derive(Debug, Default, PartialEq)]
pub struct Keydir {
    map: HashMap<Vec<u8>, KeydirEntry>,
}

impl Keydir {
    /// Creates an empty keydir.
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    /// Inserts an entry, replacing any previous entry for its key.
    pub fn put(&mut self, entry: KeydirEntry) {
        self.map.insert(entry.key.clone(), entry);
    }

    /// Looks up the entry for a key.
    pub fn get(&self, key: &[u8]) -> Option<&KeydirEntry> {
        self.map.get(key)
    }

    /// Removes and returns the entry for a key, if any.
    pub fn delete(&mut self, key: &[u8]) -> Option<KeydirEntry> {
        self.map.remove(key)
    }

    /// Returns true if the key has a live entry.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    /// The number of live keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates over the live entries, in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &KeydirEntry> {
        self.map.values()
    }

    /// Applies hint entries in order: sets insert with key-by-key overwrite,
    /// deletes remove. Callers load hint files in ascending segment id order,
    /// so later entries supersede earlier ones.
    pub fn merge(&mut self, entries: Vec<HintEntry>) {
        for entry in entries {
            match entry {
                HintEntry::Set(entry) => self.put(entry),
                HintEntry::Delete { key } => {
                    self.delete(&key);
                }
            }
        }
    }

    /// Persists the keydir to a hint file as set entries in key order.
    pub fn save(&self, path: &Path) -> Result<()> {
        let entries = self
            .map
            .values()
            .sorted_by(|a, b| a.key.cmp(&b.key))
            .cloned()
            .map(HintEntry::Set)
            .collect_vec();
        save_hint(path, &entries)
    }

    /// Loads a hint file into a fresh keydir.
    pub fn load(path: &Path) -> Result<Self> {
        let mut keydir = Self::new();
        keydir.merge(load_hint(path)?);
        Ok(keydir)
    }
}

/// Writes hint entries to a sidecar file and forces them to stable storage.
pub fn save_hint(path: &Path, entries: &[HintEntry]) -> Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(&file);
    bincode::serialize_into(&mut w, entries)?;
    w.flush()?;
    file.sync_all()?;
    Ok(())
}

/// Reads hint entries back from a sidecar file.
pub fn load_hint(path: &Path) -> Result<Vec<HintEntry>> {
    let file = File::open(path)?;
    Ok(bincode::deserialize_from(BufReader::new(file))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file_id: u64, key: &[u8], offset: u64) -> KeydirEntry {
        KeydirEntry {
            file_id,
            record_size: 16 + key.len() as u64 + 5,
            record_offset: offset,
            timestamp: 1700000000,
            key: key.to_vec(),
        }
    }

    /// Tests basic map operations and key-by-key overwrite.
    #[test]
    fn point_ops() {
        let mut keydir = Keydir::new();
        assert!(keydir.is_empty());
        assert!(!keydir.contains(b"a"));

        keydir.put(entry(1, b"a", 0));
        keydir.put(entry(1, b"b", 21));
        assert_eq!(keydir.len(), 2);
        assert_eq!(keydir.get(b"a"), Some(&entry(1, b"a", 0)));

        // A later entry replaces the earlier one for the same key.
        keydir.put(entry(2, b"a", 42));
        assert_eq!(keydir.len(), 2);
        assert_eq!(keydir.get(b"a"), Some(&entry(2, b"a", 42)));

        assert_eq!(keydir.delete(b"a"), Some(entry(2, b"a", 42)));
        assert_eq!(keydir.delete(b"a"), None);
        assert!(!keydir.contains(b"a"));
        assert_eq!(keydir.len(), 1);
    }

    /// Tests that merge applies sets and deletes in order, as when hint files
    /// are loaded in ascending segment id order.
    #[test]
    fn merge_applies_in_order() {
        let mut keydir = Keydir::new();
        keydir.merge(vec![
            HintEntry::Set(entry(1, b"a", 0)),
            HintEntry::Set(entry(1, b"b", 21)),
        ]);
        keydir.merge(vec![
            HintEntry::Set(entry(2, b"a", 0)),
            HintEntry::Delete { key: b"b".to_vec() },
            HintEntry::Delete { key: b"never-written".to_vec() },
        ]);

        assert_eq!(keydir.len(), 1);
        assert_eq!(keydir.get(b"a"), Some(&entry(2, b"a", 0)));
        assert!(!keydir.contains(b"b"));
    }

    /// Tests that a keydir round-trips losslessly through a hint file.
    #[test]
    fn hint_round_trip() -> Result<()> {
        let mut keydir = Keydir::new();
        keydir.put(entry(1, b"a", 0));
        keydir.put(entry(2, b"b", 21));
        keydir.put(entry(3, b"", 42));

        let dir = tempfile::TempDir::with_prefix("caskdb")?;
        let path = dir.path().join("0001.hint");
        keydir.save(&path)?;
        assert_eq!(Keydir::load(&path)?, keydir);
        Ok(())
    }

    /// Tests that deletion markers survive the sidecar encoding.
    #[test]
    fn hint_preserves_deletes() -> Result<()> {
        let entries = vec![
            HintEntry::Set(entry(4, b"a", 0)),
            HintEntry::Delete { key: b"b".to_vec() },
        ];
        let dir = tempfile::TempDir::with_prefix("caskdb")?;
        let path = dir.path().join("0004.hint");
        save_hint(&path, &entries)?;
        assert_eq!(load_hint(&path)?, entries);
        Ok(())
    }
}
