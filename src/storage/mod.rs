//! The storage engine: an append-only log partitioned into capped segment
//! files, indexed by an in-memory [`Keydir`] mapping each live key to its
//! newest record on disk.

mod bitcask;
mod keydir;
mod record;
mod segment;

pub use bitcask::{BitCask, Status};
pub use keydir::{HintEntry, Keydir, KeydirEntry};
pub use record::{Header, Record, HEADER_SIZE, TOMBSTONE};
pub use segment::{Segment, SegmentIter, DEFAULT_SEGMENT_CAP};
