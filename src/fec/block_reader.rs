//! FEC block reader
//!
//! Decode-side assembly of FEC blocks. Consumes the source stream and
//! the repair stream, tracks which encoding symbols of the current
//! block have arrived, and when playback reaches a hole, attempts
//! recovery from the repair symbols. Recovered packets re-enter the
//! stream bit-identical to the originals, flagged as restored so they
//! stay out of the jitter statistics.
//!
//! Block commit is forward-only: once the reader moves past a block,
//! late repair packets for it are dropped.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, warn};

use super::scheme::BlockDecoder;
use crate::packet::{FecScheme, PacketHandle, PacketReader, FLAG_FEC, FLAG_RESTORED};
use crate::rtp::EncodingMap;
use crate::units::{blknum_diff, BlockNum};

/// FEC stream parameters, agreed out of band with the sender.
#[derive(Debug, Clone, Copy)]
pub struct FecConfig {
    /// Scheme in use.
    pub scheme: FecScheme,
    /// Source packets per block (K).
    pub source_count: usize,
    /// Repair packets per block (M).
    pub repair_count: usize,
    /// Resync if an arriving block number is this far ahead.
    pub max_block_distance: u16,
}

impl FecConfig {
    /// Conventional geometry for a scheme.
    pub fn new(scheme: FecScheme) -> Self {
        FecConfig {
            scheme,
            source_count: 20,
            repair_count: 10,
            max_block_distance: 32,
        }
    }

    /// Total symbols per block (N).
    pub fn total_count(&self) -> usize {
        self.source_count + self.repair_count
    }

    fn sbn_mask(&self) -> u32 {
        match self.scheme {
            FecScheme::ReedSolomonM8 => 0x00FF_FFFF,
            FecScheme::LdpcStaircase => 0x0000_FFFF,
        }
    }
}

struct Block {
    slots: Vec<Option<PacketHandle>>,
    n_present: usize,
}

impl Block {
    fn new(n: usize) -> Self {
        Block {
            slots: vec![None; n],
            n_present: 0,
        }
    }
}

/// Drop and repair counters, for statistics and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockReaderStats {
    /// Packets reconstructed from repair data.
    pub n_restored: u64,
    /// Source symbols given up on.
    pub n_unrecovered: u64,
    /// Packets for already-committed blocks.
    pub n_late: u64,
    /// Block-number resyncs.
    pub n_resync: u64,
}

/// Packet stage recovering lost source packets from repair packets.
pub struct BlockReader<S, R> {
    source_reader: S,
    repair_reader: R,
    decoder: Box<dyn BlockDecoder>,
    config: FecConfig,
    encodings: EncodingMap,
    /// Block number of `blocks[0]`, once known.
    cur_sbn: Option<BlockNum>,
    blocks: VecDeque<Block>,
    /// Next ESI of the current block to hand out.
    pos: usize,
    repair_attempted: bool,
    symbol_len: Option<usize>,
    /// Plain RTP packets forwarded around the block machinery.
    direct: VecDeque<PacketHandle>,
    saw_plain_rtp: bool,
    stats: BlockReaderStats,
}

impl<S: PacketReader, R: PacketReader> BlockReader<S, R> {
    /// New reader joining `source_reader` and `repair_reader`.
    pub fn new(
        source_reader: S,
        repair_reader: R,
        decoder: Box<dyn BlockDecoder>,
        config: FecConfig,
        encodings: EncodingMap,
    ) -> Self {
        debug!(
            "fec reader: initializing: scheme={} k={} m={}",
            config.scheme.name(),
            config.source_count,
            config.repair_count
        );
        BlockReader {
            source_reader,
            repair_reader,
            decoder,
            config,
            encodings,
            cur_sbn: None,
            blocks: VecDeque::new(),
            pos: 0,
            repair_attempted: false,
            symbol_len: None,
            direct: VecDeque::new(),
            saw_plain_rtp: false,
            stats: BlockReaderStats::default(),
        }
    }

    /// Counters.
    pub fn stats(&self) -> BlockReaderStats {
        self.stats
    }

    fn fill(&mut self) {
        while let Some(packet) = self.source_reader.read() {
            if !packet.has_flags(FLAG_FEC) {
                // Sender is not using FEC on this stream; pass through.
                if !self.saw_plain_rtp {
                    warn!("fec reader: source stream carries no fec payload ids");
                    self.saw_plain_rtp = true;
                }
                self.direct.push_back(packet);
                continue;
            }
            self.place(packet);
        }
        while let Some(packet) = self.repair_reader.read() {
            if packet.has_flags(FLAG_FEC) {
                self.place(packet);
            }
        }
    }

    fn place(&mut self, packet: PacketHandle) {
        let fec = packet.fec();
        let n = self.config.total_count();

        if fec.block_source_count != self.config.source_count {
            debug!(
                "fec reader: dropping packet with alien block size: k={} expected={}",
                fec.block_source_count, self.config.source_count
            );
            return;
        }
        let esi = fec.symbol_id as usize;
        if esi >= n {
            debug!("fec reader: dropping packet with esi out of range: esi={}", esi);
            return;
        }

        match self.symbol_len {
            None => self.symbol_len = Some(fec.payload.len()),
            Some(len) if len != fec.payload.len() => {
                debug!(
                    "fec reader: dropping packet with alien symbol size: {} expected={}",
                    fec.payload.len(),
                    len
                );
                return;
            }
            _ => {}
        }

        let sbn = fec.source_block;
        let cur = *self.cur_sbn.get_or_insert(sbn);

        let dist = blknum_diff(sbn, cur);
        if dist < 0 {
            self.stats.n_late += 1;
            debug!("fec reader: dropping late block packet: sbn={} cur={}", sbn, cur);
            return;
        }
        if dist as u16 >= self.config.max_block_distance {
            warn!(
                "fec reader: block number jump, resyncing: sbn={} cur={}",
                sbn, cur
            );
            self.stats.n_resync += 1;
            self.blocks.clear();
            self.cur_sbn = Some(sbn);
            self.pos = 0;
            self.repair_attempted = false;
            self.place(packet);
            return;
        }

        let dist = dist as usize;
        while self.blocks.len() <= dist {
            self.blocks.push_back(Block::new(n));
        }

        let block = &mut self.blocks[dist];
        if block.slots[esi].is_none() {
            block.slots[esi] = Some(packet);
            block.n_present += 1;
            if dist == 0 {
                // Fresh data for the current block: repair may work now.
                self.repair_attempted = false;
            }
        }
    }

    fn attempt_repair(&mut self) {
        self.repair_attempted = true;

        let Some(symbol_len) = self.symbol_len else {
            return;
        };
        let (k, n) = (self.config.source_count, self.config.total_count());
        let Some(block) = self.blocks.front() else {
            return;
        };

        if self.decoder.begin(k, n, symbol_len).is_err() {
            return;
        }
        for (esi, slot) in block.slots.iter().enumerate() {
            if let Some(packet) = slot {
                self.decoder.set_symbol(esi, &packet.fec().payload);
            }
        }

        let result = self.decoder.repair();
        self.decoder.end();

        let Some(recovered) = result else {
            debug!(
                "fec reader: block not recoverable: sbn={:?} present={}/{}",
                self.cur_sbn,
                block.n_present,
                n
            );
            return;
        };

        let mut restored = 0u64;
        for (esi, symbol) in recovered {
            match crate::rtp::parse(Bytes::from(symbol), &self.encodings) {
                Ok(mut packet) => {
                    packet.add_flags(FLAG_RESTORED);
                    let block = &mut self.blocks[0];
                    if block.slots[esi].is_none() {
                        block.slots[esi] = Some(packet.into_handle());
                        block.n_present += 1;
                        restored += 1;
                    }
                }
                Err(e) => {
                    debug!("fec reader: recovered symbol failed to parse: {}", e);
                }
            }
        }
        self.stats.n_restored += restored;
        if restored != 0 {
            debug!(
                "fec reader: repaired block: sbn={:?} restored={}",
                self.cur_sbn, restored
            );
        }
    }

    fn advance_block(&mut self) {
        self.blocks.pop_front();
        if let Some(sbn) = self.cur_sbn {
            self.cur_sbn = Some(sbn.wrapping_add(1) & self.config.sbn_mask());
        }
        self.pos = 0;
        self.repair_attempted = false;
    }

    /// A hole can be abandoned once nothing more can arrive for it:
    /// either a newer block has started, or the whole block is here and
    /// decoding still failed.
    fn hole_is_final(&self) -> bool {
        if self.blocks.iter().skip(1).any(|b| b.n_present > 0) {
            return true;
        }
        match self.blocks.front() {
            Some(block) => block.n_present == self.config.total_count(),
            None => true,
        }
    }
}

impl<S: PacketReader, R: PacketReader> PacketReader for BlockReader<S, R> {
    fn read(&mut self) -> Option<PacketHandle> {
        self.fill();

        loop {
            if let Some(packet) = self.direct.pop_front() {
                return Some(packet);
            }

            let k = self.config.source_count;

            if self.pos >= k {
                self.advance_block();
                continue;
            }
            self.blocks.front()?;

            if let Some(packet) = &self.blocks[0].slots[self.pos] {
                let packet = packet.clone();
                self.pos += 1;
                return Some(packet);
            }

            // Hole at the read position.
            if !self.repair_attempted && self.blocks[0].n_present >= k {
                self.attempt_repair();
                if self.blocks[0].slots[self.pos].is_some() {
                    continue;
                }
            }

            if self.hole_is_final() {
                self.stats.n_unrecovered += 1;
                self.pos += 1;
                continue;
            }

            // Repair data may still arrive; let the depacketizer wait.
            return None;
        }
    }
}
