//! Error types for offscan.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while opening, analyzing or searching a dump.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to open dump file: {0}")]
    DumpOpenFailed(String),

    #[error("invalid DOS signature at offset 0x{0:X}")]
    InvalidDosSignature(u64),

    #[error("invalid PE signature at offset 0x{0:X}")]
    InvalidPeSignature(u64),

    #[error("section '{name}' not found")]
    SectionNotFound { name: String },

    #[error("search configuration error: {0}")]
    Config(String),

    #[error("dump producer error: {0}")]
    Producer(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
