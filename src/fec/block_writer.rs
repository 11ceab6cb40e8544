//! FEC block writer
//!
//! Encode-side mirror of the block reader: groups K consecutive source
//! packets into a block, appends their payload IDs, computes M repair
//! packets and emits everything downstream. All packets of a block
//! must be equally sized; the packetizer's fixed payload size
//! guarantees that.

use tracing::{debug, warn};

use super::payload_id::{compose_repair, compose_source, parse_repair, parse_source};
use super::scheme::BlockEncoder;
use crate::packet::{Fec, PacketHandle, PacketWriter};
use crate::rtp::EncodingMap;

use super::block_reader::FecConfig;

/// Packet stage adding FEC protection to an RTP stream.
pub struct BlockWriter<W> {
    writer: W,
    encoder: Box<dyn BlockEncoder>,
    config: FecConfig,
    encodings: EncodingMap,
    cur_sbn: u32,
    cur_esi: usize,
    symbol_len: Option<usize>,
    block_open: bool,
}

impl<W: PacketWriter> BlockWriter<W> {
    /// New writer protecting the stream with `config`.
    pub fn new(
        writer: W,
        encoder: Box<dyn BlockEncoder>,
        config: FecConfig,
        encodings: EncodingMap,
    ) -> Self {
        debug!(
            "fec writer: initializing: scheme={} k={} m={}",
            config.scheme.name(),
            config.source_count,
            config.repair_count
        );
        BlockWriter {
            writer,
            encoder,
            config,
            encodings,
            cur_sbn: 0,
            cur_esi: 0,
            symbol_len: None,
            block_open: false,
        }
    }

    fn fec_fields(&self, esi: usize) -> Fec {
        Fec {
            scheme: self.config.scheme,
            source_block: self.cur_sbn,
            symbol_id: esi as u32,
            block_source_count: self.config.source_count,
            block_total_count: self.config.total_count(),
            payload: bytes::Bytes::new(),
        }
    }

    fn finish_block(&mut self) {
        for (i, symbol) in self.encoder.build_repair().into_iter().enumerate() {
            let fec = self.fec_fields(self.config.source_count + i);
            let wire = compose_repair(&symbol, &fec);
            match parse_repair(wire, self.config.scheme) {
                Ok(packet) => self.writer.write(packet.into_handle()),
                Err(e) => warn!("fec writer: bad repair packet: {}", e),
            }
        }
        self.encoder.end();

        self.cur_sbn = self.cur_sbn.wrapping_add(1)
            & match self.config.scheme {
                crate::packet::FecScheme::ReedSolomonM8 => 0x00FF_FFFF,
                crate::packet::FecScheme::LdpcStaircase => 0x0000_FFFF,
            };
        self.cur_esi = 0;
        self.block_open = false;
    }
}

impl<W: PacketWriter> PacketWriter for BlockWriter<W> {
    fn write(&mut self, packet: PacketHandle) {
        let data = packet.data.clone();
        if data.is_empty() {
            warn!("fec writer: dropping packet without composed data");
            return;
        }

        let symbol_len = *self.symbol_len.get_or_insert(data.len());
        if data.len() != symbol_len {
            warn!(
                "fec writer: dropping packet with alien size: {} expected={}",
                data.len(),
                symbol_len
            );
            return;
        }

        if !self.block_open {
            if self
                .encoder
                .begin(self.config.source_count, self.config.total_count(), symbol_len)
                .is_err()
            {
                warn!("fec writer: cannot start block, passing packet through");
                self.writer.write(packet);
                return;
            }
            self.block_open = true;
        }

        self.encoder.set_symbol(self.cur_esi, &data);

        // Re-emit the source packet with its payload ID footer.
        let fec = self.fec_fields(self.cur_esi);
        let wire = compose_source(&data, &fec);
        match parse_protected(wire, self.config.scheme, &self.encodings) {
            Ok(out) => self.writer.write(out.into_handle()),
            Err(e) => warn!("fec writer: bad source packet: {}", e),
        }

        self.cur_esi += 1;
        if self.cur_esi == self.config.source_count {
            self.finish_block();
        }
    }
}

/// Parse a protected source datagram back into a packet with both RTP
/// and FEC views, exactly as the receiver will see it.
fn parse_protected(
    wire: bytes::Bytes,
    scheme: crate::packet::FecScheme,
    encodings: &EncodingMap,
) -> crate::error::Result<crate::packet::Packet> {
    let mut packet = crate::rtp::parse(wire, encodings)?;
    parse_source(&mut packet, scheme, encodings)?;
    Ok(packet)
}
