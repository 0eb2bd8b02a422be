//! Log segment management.
//!
//! A segment is a pair of files named by the segment's base offset:
//! `<base>.log` holding framed records and `<base>.index` holding the dense
//! offset index. The last segment of a log is active for writing; earlier
//! segments are immutable. Reads open their own file handle so they never
//! contend with the writer.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use rivulet_common::{Message, Offset, Timestamp};
use tracing::warn;

use crate::error::{LogError, Result};
use crate::index::{IndexEntry, OffsetIndex};
use crate::record::{encode_record, read_record, RecordRead, TornReason};

pub fn segment_file_name(base_offset: Offset) -> String {
    format!("{base_offset:020}.log")
}

fn index_file_name(base_offset: Offset) -> String {
    format!("{base_offset:020}.index")
}

/// Parse a segment base offset out of a `<base>.log` file name.
pub fn parse_segment_base(name: &str) -> Option<Offset> {
    name.strip_suffix(".log")?.parse().ok()
}

pub struct Segment {
    base_offset: Offset,
    next_offset: Offset,
    log_path: PathBuf,
    file: File,
    index: OffsetIndex,
    size: u64,
}

impl Segment {
    /// Create a fresh, empty segment starting at `base_offset`.
    pub fn create(dir: &Path, base_offset: Offset) -> Result<Self> {
        let log_path = dir.join(segment_file_name(base_offset));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
        let index = OffsetIndex::create(dir.join(index_file_name(base_offset)), base_offset, Vec::new())?;

        Ok(Self {
            base_offset,
            next_offset: base_offset,
            log_path,
            file,
            index,
            size: 0,
        })
    }

    /// Open an existing segment, scanning its records to verify checksums and
    /// rebuild the index. A torn or corrupt tail is cut off.
    pub fn open(dir: &Path, base_offset: Offset) -> Result<Self> {
        let log_path = dir.join(segment_file_name(base_offset));
        let mut reader = BufReader::new(File::open(&log_path)?);
        let mut entries = Vec::new();
        let mut position = 0u64;
        let mut next_offset = base_offset;

        loop {
            match read_record(&mut reader)? {
                RecordRead::Record { message, len } => {
                    if message.offset != next_offset {
                        warn!(
                            segment = %log_path.display(),
                            expected = next_offset,
                            actual = message.offset,
                            "Non-contiguous offset during recovery, truncating tail"
                        );
                        break;
                    }
                    entries.push(IndexEntry {
                        relative_offset: (message.offset - base_offset) as u32,
                        position: position as u32,
                        timestamp: message.timestamp,
                    });
                    position += u64::from(len);
                    next_offset += 1;
                }
                RecordRead::Eof => break,
                RecordRead::Torn { reason } => {
                    warn!(
                        segment = %log_path.display(),
                        position,
                        reason = %reason,
                        "Torn record during recovery, truncating tail"
                    );
                    break;
                }
            }
        }

        let file = OpenOptions::new().write(true).open(&log_path)?;
        file.set_len(position)?;
        let index = OffsetIndex::create(dir.join(index_file_name(base_offset)), base_offset, entries)?;

        let mut segment = Self {
            base_offset,
            next_offset,
            log_path,
            file,
            index,
            size: position,
        };
        segment.file.seek(SeekFrom::End(0))?;
        Ok(segment)
    }

    pub fn base_offset(&self) -> Offset {
        self.base_offset
    }

    /// The offset the next appended record will receive.
    pub fn next_offset(&self) -> Offset {
        self.next_offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.next_offset == self.base_offset
    }

    pub fn is_full(&self, max_segment_bytes: u64) -> bool {
        self.size >= max_segment_bytes
    }

    /// Append pre-assigned messages. Offsets must continue the segment's
    /// sequence exactly.
    pub fn append(&mut self, messages: &[Message]) -> Result<()> {
        let mut buf = BytesMut::new();
        let mut entries = Vec::with_capacity(messages.len());
        let mut position = self.size;

        for message in messages {
            if message.offset != self.next_offset + entries.len() as i64 {
                return Err(LogError::NonContiguousAppend {
                    expected: self.next_offset + entries.len() as i64,
                    actual: message.offset,
                });
            }
            let len = encode_record(message, &mut buf);
            entries.push(IndexEntry {
                relative_offset: (message.offset - self.base_offset) as u32,
                position: position as u32,
                timestamp: message.timestamp,
            });
            position += u64::from(len);
        }

        self.file.write_all(&buf)?;
        for entry in entries {
            self.index.append(entry)?;
        }
        self.next_offset += messages.len() as i64;
        self.size = position;
        Ok(())
    }

    /// Read messages in offset order starting at `start`, up to and including
    /// `up_to`, bounded by `max_bytes` (always returning at least one message
    /// when any is available).
    pub fn read_from(&self, start: Offset, up_to: Offset, max_bytes: usize) -> Result<Vec<Message>> {
        let Some(position) = self.index.position_for(start) else {
            return Ok(Vec::new());
        };

        let mut reader = BufReader::new(File::open(&self.log_path)?);
        reader.seek(SeekFrom::Start(position))?;

        let mut messages = Vec::new();
        let mut bytes = 0usize;
        let mut offset = start;
        while offset <= up_to && offset < self.next_offset {
            match read_record(&mut reader)? {
                RecordRead::Record { message, len } => {
                    bytes += len as usize;
                    offset = message.offset + 1;
                    messages.push(message);
                    if bytes >= max_bytes {
                        break;
                    }
                }
                RecordRead::Eof => break,
                RecordRead::Torn { reason } => {
                    return Err(match reason {
                        TornReason::ChecksumMismatch { expected, actual } => {
                            LogError::ChecksumMismatch {
                                offset,
                                expected,
                                actual,
                            }
                        }
                        other => LogError::CorruptRecord {
                            position: position + bytes as u64,
                            reason: other.to_string(),
                        },
                    })
                }
            }
        }
        Ok(messages)
    }

    /// Remove all records with offset greater than `to_offset`. Idempotent.
    pub fn truncate(&mut self, to_offset: Offset) -> Result<()> {
        let Some(position) = self.index.truncate(to_offset)? else {
            return Ok(());
        };
        self.file.set_len(position)?;
        self.file.seek(SeekFrom::End(0))?;
        self.size = position;
        self.next_offset = to_offset.max(self.base_offset - 1) + 1;
        Ok(())
    }

    /// Flush buffered data and metadata to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// First offset at or after `ts` within this segment.
    pub fn offset_for_timestamp(&self, ts: Timestamp) -> Option<Offset> {
        self.index.first_offset_at_or_after(ts)
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.index.last_timestamp()
    }

    /// Delete the segment's files. Consumes the segment.
    pub fn remove(self) -> Result<()> {
        let index_path = self.index.path().clone();
        drop(self.index);
        drop(self.file);
        std::fs::remove_file(&self.log_path)?;
        std::fs::remove_file(&index_path)?;
        Ok(())
    }
}
