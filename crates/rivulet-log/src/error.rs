//! Commit log error types.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LogError>;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt record at position {position}: {reason}")]
    CorruptRecord { position: u64, reason: String },

    #[error("Checksum mismatch at offset {offset}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        offset: i64,
        expected: u32,
        actual: u32,
    },

    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Offset out of range: {offset} (oldest {oldest}, newest {newest})")]
    OffsetOutOfRange {
        offset: i64,
        oldest: i64,
        newest: i64,
    },

    #[error("High watermark {watermark} is past newest offset {newest}")]
    WatermarkOutOfRange { watermark: i64, newest: i64 },

    #[error("Non-contiguous append: expected offset {expected}, got {actual}")]
    NonContiguousAppend { expected: i64, actual: i64 },

    #[error("Log is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}
