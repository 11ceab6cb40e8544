//! Forward error correction
//!
//! FECFRAME-style block protection: payload IDs on the wire, block
//! assembly and recovery on the receive side, block generation on the
//! send side, and two interchangeable code backends (Reed-Solomon m=8
//! and LDPC-Staircase).

mod block_reader;
mod block_writer;
mod ldpc;
pub mod payload_id;
mod rs8m;
mod scheme;

pub use block_reader::{BlockReader, BlockReaderStats, FecConfig};
pub use block_writer::BlockWriter;
pub use ldpc::{LdpcDecoder, LdpcEncoder};
pub use rs8m::{Rs8mDecoder, Rs8mEncoder};
pub use scheme::{BlockDecoder, BlockEncoder};

use crate::packet::FecScheme;

/// Decoder backend for a scheme.
pub fn make_decoder(scheme: FecScheme) -> Box<dyn BlockDecoder> {
    match scheme {
        FecScheme::ReedSolomonM8 => Box::new(Rs8mDecoder::new()),
        FecScheme::LdpcStaircase => Box::new(LdpcDecoder::new()),
    }
}

/// Encoder backend for a scheme.
pub fn make_encoder(scheme: FecScheme) -> Box<dyn BlockEncoder> {
    match scheme {
        FecScheme::ReedSolomonM8 => Box::new(Rs8mEncoder::new()),
        FecScheme::LdpcStaircase => Box::new(LdpcEncoder::new()),
    }
}
