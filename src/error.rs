//! Crate error type
//!
//! Covers parse rejections, configuration errors and pipeline
//! construction failures. Hot-path reads and writes never return these:
//! malformed or late packets are dropped and counted, and frame reads
//! always fill the requested buffer (with silence if necessary).

use thiserror::Error;

/// Errors surfaced by parsers, builders and pipeline construction.
#[derive(Debug, Error)]
pub enum Error {
    /// Packet too short or structurally malformed.
    #[error("bad header: {0}")]
    BadHeader(&'static str),

    /// RTP version field is not 2.
    #[error("bad version: got {0}, expected 2")]
    BadVersion(u8),

    /// Payload length inconsistent with the declared padding or format.
    #[error("bad payload: {0}")]
    BadPayload(&'static str),

    /// Unknown or unsupported payload type / FEC scheme.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(&'static str),

    /// Rejected configuration value.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Malformed endpoint URI.
    #[error("bad endpoint uri: {0}")]
    BadUri(String),
}

/// Convenience alias used by parsers and constructors.
pub type Result<T> = std::result::Result<T, Error>;
