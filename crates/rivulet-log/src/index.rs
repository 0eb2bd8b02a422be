//! Offset index mapping offsets to file positions within a segment.
//!
//! The index is dense: one 16-byte entry per record, `relative_offset u32 |
//! position u32 | timestamp i64`, little-endian. It is kept fully in memory
//! and mirrored to a `.index` file beside the segment; on recovery it is
//! rebuilt from the segment scan and rewritten, since the scan validates
//! checksums anyway.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use byteorder::{LittleEndian, WriteBytesExt};
use rivulet_common::{Offset, Timestamp};

use crate::error::Result;

/// One index entry per record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub relative_offset: u32,
    pub position: u32,
    pub timestamp: Timestamp,
}

pub struct OffsetIndex {
    base_offset: Offset,
    path: PathBuf,
    file: File,
    entries: Vec<IndexEntry>,
}

impl OffsetIndex {
    /// Create or rewrite the index file with the given recovered entries.
    pub fn create(path: PathBuf, base_offset: Offset, entries: Vec<IndexEntry>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut buf = Vec::with_capacity(entries.len() * 16);
        for entry in &entries {
            write_entry(&mut buf, entry)?;
        }
        file.write_all(&buf)?;

        Ok(Self {
            base_offset,
            path,
            file,
            entries,
        })
    }

    pub fn append(&mut self, entry: IndexEntry) -> Result<()> {
        let mut buf = Vec::with_capacity(16);
        write_entry(&mut buf, &entry)?;
        self.file.write_all(&buf)?;
        self.entries.push(entry);
        Ok(())
    }

    /// File position of the record at `offset`, if indexed.
    pub fn position_for(&self, offset: Offset) -> Option<u64> {
        if offset < self.base_offset {
            return None;
        }
        let relative = (offset - self.base_offset) as usize;
        self.entries.get(relative).map(|e| u64::from(e.position))
    }

    /// First offset whose timestamp is at or after `ts`. Assumes timestamps
    /// are non-decreasing within the segment.
    pub fn first_offset_at_or_after(&self, ts: Timestamp) -> Option<Offset> {
        let idx = self.entries.partition_point(|e| e.timestamp < ts);
        self.entries
            .get(idx)
            .map(|e| self.base_offset + i64::from(e.relative_offset))
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.entries.last().map(|e| e.timestamp)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries for offsets greater than `to_offset` and shrink the
    /// index file to match. Returns the file position the segment should be
    /// truncated to, or `None` when no entry was removed.
    pub fn truncate(&mut self, to_offset: Offset) -> Result<Option<u64>> {
        let keep = if to_offset < self.base_offset {
            0
        } else {
            ((to_offset - self.base_offset) as usize + 1).min(self.entries.len())
        };
        if keep >= self.entries.len() {
            return Ok(None);
        }
        let segment_position = u64::from(self.entries[keep].position);
        self.entries.truncate(keep);
        self.file.set_len((keep * 16) as u64)?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(Some(segment_position))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

fn write_entry(buf: &mut Vec<u8>, entry: &IndexEntry) -> Result<()> {
    buf.write_u32::<LittleEndian>(entry.relative_offset)?;
    buf.write_u32::<LittleEndian>(entry.position)?;
    buf.write_i64::<LittleEndian>(entry.timestamp)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(relative: u32, position: u32, ts: i64) -> IndexEntry {
        IndexEntry {
            relative_offset: relative,
            position,
            timestamp: ts,
        }
    }

    #[test]
    fn test_position_lookup() {
        let dir = TempDir::new().unwrap();
        let mut index =
            OffsetIndex::create(dir.path().join("00000000.index"), 100, Vec::new()).unwrap();
        index.append(entry(0, 0, 10)).unwrap();
        index.append(entry(1, 64, 20)).unwrap();
        index.append(entry(2, 128, 30)).unwrap();

        assert_eq!(index.position_for(100), Some(0));
        assert_eq!(index.position_for(101), Some(64));
        assert_eq!(index.position_for(102), Some(128));
        assert_eq!(index.position_for(103), None);
        assert_eq!(index.position_for(99), None);
    }

    #[test]
    fn test_timestamp_search() {
        let dir = TempDir::new().unwrap();
        let entries = vec![entry(0, 0, 10), entry(1, 64, 20), entry(2, 128, 30)];
        let index = OffsetIndex::create(dir.path().join("x.index"), 0, entries).unwrap();

        assert_eq!(index.first_offset_at_or_after(5), Some(0));
        assert_eq!(index.first_offset_at_or_after(20), Some(1));
        assert_eq!(index.first_offset_at_or_after(21), Some(2));
        assert_eq!(index.first_offset_at_or_after(31), None);
    }

    #[test]
    fn test_truncate_returns_cut_position() {
        let dir = TempDir::new().unwrap();
        let entries = vec![entry(0, 0, 10), entry(1, 64, 20), entry(2, 128, 30)];
        let mut index = OffsetIndex::create(dir.path().join("x.index"), 0, entries).unwrap();

        let position = index.truncate(1).unwrap();
        assert_eq!(position, Some(128));
        assert_eq!(index.len(), 2);
        assert_eq!(index.position_for(2), None);

        assert_eq!(index.truncate(5).unwrap(), None);
    }
}
