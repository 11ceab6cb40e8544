//! RTP stream validator
//!
//! Ingress gate of a session: rejects packets that contradict the
//! stream state seen so far. A mid-stream SSRC or payload-type change,
//! or a sequence-number/timestamp jump beyond the configured thresholds,
//! means the packet belongs to a different or broken stream and must not
//! reach the jitter buffer.

use tracing::debug;

use crate::packet::{PacketHandle, PacketWriter, FLAG_RTP};
use crate::units::{
    seqnum_diff, timestamp_diff, timestamp_to_ns, Nanoseconds, SECOND,
};

/// Validator thresholds.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorConfig {
    /// Maximum allowed seqnum distance between consecutive packets.
    pub max_sn_jump: u16,
    /// Maximum allowed timestamp distance between consecutive packets.
    pub max_ts_jump: Nanoseconds,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            // A quarter of the 16-bit sequence space.
            max_sn_jump: 16384,
            max_ts_jump: 5 * SECOND,
        }
    }
}

/// Write-side stream validator wrapping the next pipeline stage.
pub struct Validator<W> {
    writer: W,
    config: ValidatorConfig,
    sample_rate: u32,
    prev: Option<PacketHandle>,
    n_rejected: u64,
}

impl<W: PacketWriter> Validator<W> {
    /// Wrap `writer`, validating against `config` at `sample_rate`.
    pub fn new(writer: W, config: ValidatorConfig, sample_rate: u32) -> Self {
        Validator {
            writer,
            config,
            sample_rate,
            prev: None,
            n_rejected: 0,
        }
    }

    /// Packets rejected so far.
    pub fn rejected(&self) -> u64 {
        self.n_rejected
    }

    /// The wrapped writer.
    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// The wrapped writer, mutable.
    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    fn check(&self, prev: &PacketHandle, next: &PacketHandle) -> bool {
        let prev = prev.rtp();
        let next = next.rtp();

        if prev.source_id != next.source_id {
            debug!(
                "rtp validator: source id jump: prev={} next={}",
                prev.source_id, next.source_id
            );
            return false;
        }

        if prev.payload_type != next.payload_type {
            debug!(
                "rtp validator: payload type jump: prev={} next={}",
                prev.payload_type, next.payload_type
            );
            return false;
        }

        let sn_dist = seqnum_diff(next.seqnum, prev.seqnum).unsigned_abs();
        if sn_dist > self.config.max_sn_jump {
            debug!(
                "rtp validator: too long seqnum jump: prev={} next={} dist={}",
                prev.seqnum, next.seqnum, sn_dist
            );
            return false;
        }

        let ts_dist = timestamp_diff(next.stream_timestamp, prev.stream_timestamp)
            .unsigned_abs() as i32;
        let ts_dist_ns = timestamp_to_ns(ts_dist, self.sample_rate);
        if ts_dist_ns > self.config.max_ts_jump {
            debug!(
                "rtp validator: too long timestamp jump: prev={} next={} dist={}",
                prev.stream_timestamp, next.stream_timestamp, ts_dist
            );
            return false;
        }

        true
    }
}

impl<W: PacketWriter> PacketWriter for Validator<W> {
    fn write(&mut self, packet: PacketHandle) {
        if !packet.has_flags(FLAG_RTP) {
            debug!("rtp validator: dropping non-rtp packet");
            self.n_rejected += 1;
            return;
        }

        if let Some(prev) = &self.prev {
            if !self.check(prev, &packet) {
                self.n_rejected += 1;
                return;
            }
        }

        // Remember the newest accepted packet; reordered older packets
        // are forwarded but do not move the reference point backwards.
        let newer = match &self.prev {
            Some(prev) => seqnum_diff(packet.rtp().seqnum, prev.rtp().seqnum) > 0,
            None => true,
        };
        if newer {
            self.prev = Some(packet.clone());
        }

        self.writer.write(packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, Rtp, FLAG_AUDIO};
    use std::sync::mpsc;

    struct ChanWriter(mpsc::Sender<PacketHandle>);

    impl PacketWriter for ChanWriter {
        fn write(&mut self, packet: PacketHandle) {
            self.0.send(packet).unwrap();
        }
    }

    fn packet(ssrc: u32, pt: u8, seqnum: u16, timestamp: u32) -> PacketHandle {
        let mut p = Packet::new(FLAG_RTP | FLAG_AUDIO);
        p.rtp = Some(Rtp {
            source_id: ssrc,
            payload_type: pt,
            seqnum,
            stream_timestamp: timestamp,
            duration: 320,
            ..Default::default()
        });
        p.into_handle()
    }

    fn make() -> (Validator<ChanWriter>, mpsc::Receiver<PacketHandle>) {
        let (tx, rx) = mpsc::channel();
        (
            Validator::new(ChanWriter(tx), ValidatorConfig::default(), 44100),
            rx,
        )
    }

    #[test]
    fn test_accepts_contiguous_stream() {
        let (mut v, rx) = make();
        for sn in 0..10u16 {
            v.write(packet(1, 10, sn, sn as u32 * 320));
        }
        assert_eq!(rx.try_iter().count(), 10);
        assert_eq!(v.rejected(), 0);
    }

    #[test]
    fn test_rejects_ssrc_change() {
        let (mut v, rx) = make();
        v.write(packet(1, 10, 0, 0));
        v.write(packet(2, 10, 1, 320));
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(v.rejected(), 1);
    }

    #[test]
    fn test_rejects_payload_type_change() {
        let (mut v, rx) = make();
        v.write(packet(1, 10, 0, 0));
        v.write(packet(1, 11, 1, 320));
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_rejects_seqnum_jump() {
        let (mut v, rx) = make();
        v.write(packet(1, 10, 0, 0));
        v.write(packet(1, 10, 20000, 320));
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_rejects_timestamp_jump() {
        let (mut v, rx) = make();
        v.write(packet(1, 10, 0, 0));
        // Six seconds ahead at 44100 Hz.
        v.write(packet(1, 10, 1, 6 * 44100));
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_accepts_wraparound() {
        let (mut v, rx) = make();
        v.write(packet(1, 10, 65535, u32::MAX - 319));
        v.write(packet(1, 10, 0, 0));
        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(v.rejected(), 0);
    }

    #[test]
    fn test_reordered_packet_not_reference() {
        let (mut v, rx) = make();
        v.write(packet(1, 10, 5, 5 * 320));
        v.write(packet(1, 10, 3, 3 * 320)); // late but close: accepted
        v.write(packet(1, 10, 6, 6 * 320)); // compared against 5, not 3
        assert_eq!(rx.try_iter().count(), 3);
    }
}
