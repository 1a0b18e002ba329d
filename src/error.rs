//! Error types for refzip
//!
//! Only the archive codec produces errors; the ownership kernel reports
//! policy failures (a denied promotion) as an empty result, not an error.

use std::io;

use thiserror::Error;

/// Result type for refzip archive operations
pub type Result<T> = std::result::Result<T, ZipError>;

/// Error types that can occur during ZIP operations
#[derive(Debug, Error)]
pub enum ZipError {
    /// I/O error from the backing byte stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid ZIP format or structure
    #[error("invalid ZIP format: {0}")]
    InvalidFormat(&'static str),

    /// Unsupported compression method
    #[error("unsupported compression method: {0}")]
    UnsupportedCompression(u16),

    /// Deflate stream error while compressing
    #[error("compression error: {0}")]
    Compress(#[from] flate2::CompressError),

    /// Inflate stream error while decompressing
    #[error("decompression error: {0}")]
    Decompress(#[from] flate2::DecompressError),
}
