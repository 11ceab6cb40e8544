//! Packet model and packet-side containers
//!
//! A packet is parsed once on the network thread and then moves through
//! the receiver as a shared immutable handle: the sorted queue, the FEC
//! reader and the depacketizer all hold clones of the same `Arc`. The
//! last drop releases the underlying buffer.

mod delayed;
mod queue;
mod router;

pub use delayed::DelayedReader;
pub use queue::{SharedQueue, SortedQueue};
pub use router::{Route, Router};

use std::sync::Arc;

use bytes::Bytes;

use crate::units::{Nanoseconds, Seqnum, StreamTimestamp};

/// Packet carries a parsed RTP header.
pub const FLAG_RTP: u32 = 1 << 0;
/// Packet carries a FEC payload ID (source or repair).
pub const FLAG_FEC: u32 = 1 << 1;
/// Packet belongs to the audio stream.
pub const FLAG_AUDIO: u32 = 1 << 2;
/// Packet belongs to the repair stream.
pub const FLAG_REPAIR: u32 = 1 << 3;
/// Packet carries a control (RTCP) payload.
pub const FLAG_CONTROL: u32 = 1 << 4;
/// Packet was reconstructed by the FEC decoder, not received.
pub const FLAG_RESTORED: u32 = 1 << 5;
/// Packet buffer was prepared by a composer.
pub const FLAG_PREPARED: u32 = 1 << 6;
/// Packet fields were composed into the buffer.
pub const FLAG_COMPOSED: u32 = 1 << 7;
/// Packet arrived over UDP (has a receive timestamp).
pub const FLAG_UDP: u32 = 1 << 8;

/// Shared immutable packet handle.
pub type PacketHandle = Arc<Packet>;

/// Parsed RTP fields, with slices into the owning buffer.
#[derive(Debug, Clone, Default)]
pub struct Rtp {
    /// RTP SSRC: identifies the stream within a session.
    pub source_id: u32,
    /// Sequence number, wraps at 2^16.
    pub seqnum: Seqnum,
    /// Sample index of the first sample, at the sender clock.
    pub stream_timestamp: StreamTimestamp,
    /// Samples per channel represented by this packet.
    pub duration: u32,
    /// Sender wall clock at the first sample, nanoseconds since Unix
    /// epoch. Zero until the RTCP mapping is known.
    pub capture_timestamp: Nanoseconds,
    /// Marker bit.
    pub marker: bool,
    /// Payload type.
    pub payload_type: u8,
    /// Header bytes (fixed header + CSRC + extension).
    pub header: Bytes,
    /// Payload bytes, padding excluded.
    pub payload: Bytes,
    /// Padding bytes, including the trailing count octet.
    pub padding: Bytes,
}

impl Rtp {
    /// Stream timestamp of the first sample.
    pub fn begin(&self) -> StreamTimestamp {
        self.stream_timestamp
    }

    /// Stream timestamp right after the last sample.
    pub fn end(&self) -> StreamTimestamp {
        self.stream_timestamp.wrapping_add(self.duration)
    }
}

/// FEC scheme identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecScheme {
    /// Reed-Solomon with 8-bit symbols (RFC 6865 profile).
    ReedSolomonM8,
    /// LDPC-Staircase (RFC 5170).
    LdpcStaircase,
}

impl FecScheme {
    /// Short name used in logs and endpoint URIs.
    pub fn name(self) -> &'static str {
        match self {
            FecScheme::ReedSolomonM8 => "rs8m",
            FecScheme::LdpcStaircase => "ldpc",
        }
    }
}

/// Parsed FEC payload ID fields.
#[derive(Debug, Clone)]
pub struct Fec {
    /// Scheme this packet belongs to.
    pub scheme: FecScheme,
    /// Source block number.
    pub source_block: u32,
    /// Encoding symbol ID: index of this packet within the block.
    pub symbol_id: u32,
    /// Number of source symbols in the block (K).
    pub block_source_count: usize,
    /// Total symbols in the block (N = K + M); for RS m=8 the wire fixes
    /// this at 255 and the actual count is configured out of band.
    pub block_total_count: usize,
    /// Protected symbol bytes: for source packets the entire original
    /// RTP packet, for repair packets the parity symbol.
    pub payload: Bytes,
}

/// A network packet: one datagram, parsed views, shared ownership.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    flags: u32,
    /// RTP fields, if `FLAG_RTP` is set.
    pub rtp: Option<Rtp>,
    /// FEC fields, if `FLAG_FEC` is set.
    pub fec: Option<Fec>,
    /// Local monotonic receive timestamp, for jitter accounting.
    /// Zero for packets not received from the network.
    pub queue_timestamp: Nanoseconds,
    /// The entire datagram.
    pub data: Bytes,
}

impl Packet {
    /// New empty packet with the given flags.
    pub fn new(flags: u32) -> Self {
        Packet {
            flags,
            ..Default::default()
        }
    }

    /// Check that all `flags` bits are set.
    pub fn has_flags(&self, flags: u32) -> bool {
        self.flags & flags == flags
    }

    /// Set additional flag bits.
    pub fn add_flags(&mut self, flags: u32) {
        self.flags |= flags;
    }

    /// All flag bits.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// RTP fields or panic; callers past the router only see RTP packets.
    pub fn rtp(&self) -> &Rtp {
        self.rtp.as_ref().expect("packet without rtp fields")
    }

    /// FEC fields or panic; callers past the router only see FEC packets
    /// on the repair path.
    pub fn fec(&self) -> &Fec {
        self.fec.as_ref().expect("packet without fec fields")
    }

    /// Wrap into a shared handle.
    pub fn into_handle(self) -> PacketHandle {
        Arc::new(self)
    }
}

/// Pull side of a packet stage. `None` means "nothing buffered right
/// now", never an error: the audio side fills silence instead of
/// blocking.
pub trait PacketReader {
    /// Pop the next packet, if one is ready.
    fn read(&mut self) -> Option<PacketHandle>;
}

/// Push side of a packet stage.
pub trait PacketWriter {
    /// Deliver one packet. Drops are internal; writes never fail.
    fn write(&mut self, packet: PacketHandle);
}

impl<T: PacketReader + ?Sized> PacketReader for Box<T> {
    fn read(&mut self) -> Option<PacketHandle> {
        (**self).read()
    }
}

impl<T: PacketWriter + ?Sized> PacketWriter for Box<T> {
    fn write(&mut self, packet: PacketHandle) {
        (**self).write(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let mut p = Packet::new(FLAG_RTP | FLAG_AUDIO);
        assert!(p.has_flags(FLAG_RTP));
        assert!(p.has_flags(FLAG_RTP | FLAG_AUDIO));
        assert!(!p.has_flags(FLAG_RESTORED));

        p.add_flags(FLAG_RESTORED);
        assert!(p.has_flags(FLAG_RTP | FLAG_AUDIO | FLAG_RESTORED));
    }

    #[test]
    fn test_rtp_end() {
        let rtp = Rtp {
            stream_timestamp: u32::MAX - 10,
            duration: 20,
            ..Default::default()
        };
        // End wraps around.
        assert_eq!(rtp.end(), 9);
    }
}
