//! RTP fixed header parsing and composition
//!
//! RFC 3550 fixed header, version 2. CSRC entries and header extensions
//! are tolerated and skipped; padding is validated against the declared
//! count octet. L16 payloads are 16-bit big-endian PCM.

use bytes::{BufMut, Bytes, BytesMut};

use super::encoding::EncodingMap;
use crate::error::{Error, Result};
use crate::packet::{Packet, Rtp, FLAG_RTP, FLAG_UDP};
use crate::units::{Seqnum, StreamTimestamp};

/// Fixed header length in bytes.
pub const HEADER_SIZE: usize = 12;

/// RTP protocol version.
pub const VERSION: u8 = 2;

/// RTP fixed header fields.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone)]
pub struct RtpHeader {
    /// RTP version (always 2).
    pub version: u8,
    /// Padding flag.
    pub padding: bool,
    /// Extension flag.
    pub extension: bool,
    /// CSRC count.
    pub csrc_count: u8,
    /// Marker bit.
    pub marker: bool,
    /// Payload type.
    pub payload_type: u8,
    /// Sequence number.
    pub sequence: Seqnum,
    /// Stream timestamp (sample index at the sender).
    pub timestamp: StreamTimestamp,
    /// Synchronization source ID.
    pub ssrc: u32,
}

impl RtpHeader {
    /// New header with defaults for an outgoing packet.
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            version: VERSION,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type,
            sequence: 0,
            timestamp: 0,
            ssrc,
        }
    }

    /// Serialize the fixed header.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0] = (self.version << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | (self.csrc_count & 0x0F);
        buf[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7F);
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        buf
    }

    /// Parse the fixed header, rejecting wrong versions.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::BadHeader("short rtp header"));
        }

        let version = (data[0] >> 6) & 0x03;
        if version != VERSION {
            return Err(Error::BadVersion(version));
        }

        Ok(Self {
            version,
            padding: (data[0] & 0x20) != 0,
            extension: (data[0] & 0x10) != 0,
            csrc_count: data[0] & 0x0F,
            marker: (data[1] & 0x80) != 0,
            payload_type: data[1] & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// Parse a datagram into an RTP packet.
///
/// On success the packet carries `FLAG_RTP | FLAG_UDP` plus whatever the
/// payload-type encoding adds (audio packets get `FLAG_AUDIO`), and its
/// `rtp` views reference the original buffer without copying.
pub fn parse(buffer: Bytes, encodings: &EncodingMap) -> Result<Packet> {
    let header = RtpHeader::from_bytes(&buffer)?;

    let mut header_size = HEADER_SIZE + header.csrc_count as usize * 4;
    if buffer.len() < header_size {
        return Err(Error::BadHeader("short rtp header: csrc list truncated"));
    }

    if header.extension {
        // Extension header: 2 bytes profile, 2 bytes length in words.
        if buffer.len() < header_size + 4 {
            return Err(Error::BadHeader("short rtp header: extension truncated"));
        }
        let words =
            u16::from_be_bytes([buffer[header_size + 2], buffer[header_size + 3]]) as usize;
        header_size += 4 + words * 4;
        if buffer.len() < header_size {
            return Err(Error::BadHeader("short rtp header: extension data truncated"));
        }
    }

    let payload_begin = header_size;
    let mut payload_end = buffer.len();

    let mut pad_size = 0usize;
    if header.padding {
        if payload_begin == payload_end {
            return Err(Error::BadPayload("padding flag set on empty payload"));
        }
        pad_size = buffer[payload_end - 1] as usize;
        if pad_size == 0 {
            return Err(Error::BadPayload("padding count octet is zero"));
        }
        if payload_end - payload_begin < pad_size {
            return Err(Error::BadPayload("padding longer than payload"));
        }
        payload_end -= pad_size;
    }

    let mut packet = Packet::new(FLAG_RTP | FLAG_UDP);

    let payload = buffer.slice(payload_begin..payload_end);
    let duration = encodings
        .find_by_pt(header.payload_type)
        .map(|e| e.packet_duration(payload.len()))
        .unwrap_or(0);
    if let Some(encoding) = encodings.find_by_pt(header.payload_type) {
        packet.add_flags(encoding.packet_flags);
    }

    packet.rtp = Some(Rtp {
        source_id: header.ssrc,
        seqnum: header.sequence,
        stream_timestamp: header.timestamp,
        duration,
        capture_timestamp: 0,
        marker: header.marker,
        payload_type: header.payload_type,
        header: buffer.slice(0..header_size),
        payload,
        padding: if pad_size != 0 {
            buffer.slice(payload_end..payload_end + pad_size)
        } else {
            Bytes::new()
        },
    });
    packet.data = buffer;

    Ok(packet)
}

/// Compose RTP fields back into a datagram.
///
/// Inverse of [`parse`] for packets this implementation produces
/// (no CSRC, no extension): parse-then-compose is byte-identical.
pub fn compose(rtp: &Rtp) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(HEADER_SIZE + rtp.payload.len() + rtp.padding.len());

    let mut header = RtpHeader::new(rtp.payload_type, rtp.source_id);
    header.padding = !rtp.padding.is_empty();
    header.marker = rtp.marker;
    header.sequence = rtp.seqnum;
    header.timestamp = rtp.stream_timestamp;

    buf.put_slice(&header.to_bytes());
    buf.put_slice(&rtp.payload);
    buf.put_slice(&rtp.padding);

    buf.freeze()
}
