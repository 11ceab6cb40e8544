//! FECFRAME payload IDs
//!
//! Reed-Solomon m=8 (RFC 6865 profile), 6 bytes:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Source Block Number (24 bits)       | Enc. Symb. ID |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Source Block Length (k)    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! LDPC-Staircase (RFC 5170), 6 bytes for source packets
//! `{SBN:16, ESI:16, K:16}`, 8 bytes for repair packets adding `N:16`.
//!
//! Either way the ID travels as a *footer* on source packets (appended
//! after the RTP packet, so the protected symbol is the original RTP
//! packet bit-for-bit) and as a *header* on repair packets.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::packet::{Fec, FecScheme, Packet, FLAG_FEC, FLAG_REPAIR, FLAG_UDP};
use crate::rtp::EncodingMap;

/// Payload ID length for source packets of a scheme.
pub fn source_id_len(scheme: FecScheme) -> usize {
    match scheme {
        FecScheme::ReedSolomonM8 => 6,
        FecScheme::LdpcStaircase => 6,
    }
}

/// Payload ID length for repair packets of a scheme.
pub fn repair_id_len(scheme: FecScheme) -> usize {
    match scheme {
        FecScheme::ReedSolomonM8 => 6,
        FecScheme::LdpcStaircase => 8,
    }
}

fn parse_id(scheme: FecScheme, repair: bool, id: &[u8]) -> Fec {
    match scheme {
        FecScheme::ReedSolomonM8 => Fec {
            scheme,
            source_block: ((id[0] as u32) << 16) | ((id[1] as u32) << 8) | id[2] as u32,
            symbol_id: id[3] as u32,
            block_source_count: u16::from_be_bytes([id[4], id[5]]) as usize,
            // The wire fixes N at the symbol-space limit; the real
            // count is configured out of band.
            block_total_count: 255,
            payload: Bytes::new(),
        },
        FecScheme::LdpcStaircase => Fec {
            scheme,
            source_block: u16::from_be_bytes([id[0], id[1]]) as u32,
            symbol_id: u16::from_be_bytes([id[2], id[3]]) as u32,
            block_source_count: u16::from_be_bytes([id[4], id[5]]) as usize,
            block_total_count: if repair {
                u16::from_be_bytes([id[6], id[7]]) as usize
            } else {
                0
            },
            payload: Bytes::new(),
        },
    }
}

fn write_id(scheme: FecScheme, repair: bool, fec: &Fec, buf: &mut BytesMut) {
    match scheme {
        FecScheme::ReedSolomonM8 => {
            debug_assert!(fec.source_block >> 24 == 0);
            debug_assert!(fec.symbol_id >> 8 == 0);
            buf.put_u8((fec.source_block >> 16) as u8);
            buf.put_u8((fec.source_block >> 8) as u8);
            buf.put_u8(fec.source_block as u8);
            buf.put_u8(fec.symbol_id as u8);
            buf.put_u16(fec.block_source_count as u16);
        }
        FecScheme::LdpcStaircase => {
            buf.put_u16(fec.source_block as u16);
            buf.put_u16(fec.symbol_id as u16);
            buf.put_u16(fec.block_source_count as u16);
            if repair {
                buf.put_u16(fec.block_total_count as u16);
            }
        }
    }
}

/// Chain-parse the FEC footer of a source packet already parsed as RTP.
///
/// Strips the payload ID from the RTP payload view, fixes the packet
/// duration accordingly, and records the protected symbol (the whole
/// datagram minus the footer).
pub fn parse_source(
    packet: &mut Packet,
    scheme: FecScheme,
    encodings: &EncodingMap,
) -> Result<()> {
    let id_len = source_id_len(scheme);

    let rtp = packet.rtp.as_mut().ok_or(Error::BadHeader("fec source without rtp"))?;
    if rtp.payload.len() < id_len {
        return Err(Error::BadPayload("fec source payload shorter than payload id"));
    }
    if !rtp.padding.is_empty() {
        // Padding would sit between the payload and the footer; the
        // schemes here never produce it.
        return Err(Error::BadPayload("fec source packet with rtp padding"));
    }

    let split = rtp.payload.len() - id_len;
    let id = rtp.payload.slice(split..);
    rtp.payload = rtp.payload.slice(..split);
    if let Some(encoding) = encodings.find_by_pt(rtp.payload_type) {
        rtp.duration = encoding.packet_duration(rtp.payload.len());
    }

    let mut fec = parse_id(scheme, false, &id);
    fec.payload = packet.data.slice(..packet.data.len() - id_len);
    packet.fec = Some(fec);
    packet.add_flags(FLAG_FEC);

    Ok(())
}

/// Parse a repair datagram: payload ID header, parity symbol body.
pub fn parse_repair(buffer: Bytes, scheme: FecScheme) -> Result<Packet> {
    let id_len = repair_id_len(scheme);
    if buffer.len() <= id_len {
        return Err(Error::BadHeader("short fec repair packet"));
    }

    let mut fec = parse_id(scheme, true, &buffer[..id_len]);
    fec.payload = buffer.slice(id_len..);

    let mut packet = Packet::new(FLAG_FEC | FLAG_REPAIR | FLAG_UDP);
    packet.fec = Some(fec);
    packet.data = buffer;
    Ok(packet)
}

/// Append a source payload ID to an RTP datagram.
pub fn compose_source(rtp_packet: &[u8], fec: &Fec) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(rtp_packet.len() + source_id_len(fec.scheme));
    buf.put_slice(rtp_packet);
    write_id(fec.scheme, false, fec, &mut buf);
    buf.freeze()
}

/// Build a repair datagram: payload ID header plus parity symbol.
pub fn compose_repair(symbol: &[u8], fec: &Fec) -> Bytes {
    let mut buf = BytesMut::with_capacity(symbol.len() + repair_id_len(fec.scheme));
    write_id(fec.scheme, true, fec, &mut buf);
    buf.put_slice(symbol);
    buf.freeze()
}
