//! Depacketizer
//!
//! The translation point between the packet-driven world and the
//! sample-clock-driven world. Pulls packets on demand and fills frames
//! left to right, synthesizing silence for gaps and dropping packets
//! whose samples are already in the past. Never blocks and never fails:
//! a frame is always filled completely.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::frame::{
    Frame, FrameReader, FRAME_NOT_BLANK, FRAME_NOT_COMPLETE, FRAME_PACKET_DROPS,
};
use super::pcm::FrameDecoder;
use super::sample_spec::SampleSpec;
use crate::packet::{PacketHandle, PacketReader, FLAG_RESTORED};
use crate::rtcp::TimestampMapping;
use crate::units::{timestamp_diff, timestamp_lt, StreamTimestamp};

/// Interval between loss-ratio debug reports, in stream time.
const REPORT_INTERVAL_SECONDS: u64 = 20;

/// Playback-position state shared with the latency monitor.
///
/// The depacketizer owns the pipeline position; the monitor only reads
/// it, so relaxed atomics suffice.
#[derive(Default)]
pub struct PlaybackPosition {
    next_timestamp: AtomicU32,
    started: AtomicBool,
}

impl PlaybackPosition {
    /// True once the first packet has been decoded.
    pub fn started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    /// Stream timestamp of the next sample to be emitted.
    pub fn timestamp(&self) -> StreamTimestamp {
        self.next_timestamp.load(Ordering::Relaxed)
    }

    pub(crate) fn update(&self, timestamp: StreamTimestamp) {
        self.next_timestamp.store(timestamp, Ordering::Relaxed);
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct FrameStats {
    n_decoded_samples: usize,
    n_dropped_packets: u64,
}

/// Converts a packet stream into a continuous sample stream.
pub struct Depacketizer<R> {
    reader: R,
    decoder: Box<dyn FrameDecoder + Send>,
    spec: SampleSpec,
    position: Arc<PlaybackPosition>,
    mapping: Option<Arc<TimestampMapping>>,
    packet: Option<PacketHandle>,
    next_timestamp: StreamTimestamp,
    first_packet: bool,
    beep: bool,
    /// Samples emitted before the first packet arrived.
    zero_samples: u64,
    /// Samples synthesized after playback started (true loss).
    missing_samples: u64,
    /// Samples decoded from packets.
    packet_samples: u64,
    restored_samples: u64,
    report_countdown: u64,
}

impl<R: PacketReader> Depacketizer<R> {
    /// New depacketizer pulling packets from `reader` and decoding them
    /// with `decoder` into frames of `spec`. With `beep` set, gaps are
    /// filled with an audible tone instead of silence (debug aid).
    pub fn new(
        reader: R,
        decoder: Box<dyn FrameDecoder + Send>,
        spec: SampleSpec,
        beep: bool,
    ) -> Self {
        debug!("depacketizer: initializing: n_channels={}", spec.num_channels());
        let report_countdown = REPORT_INTERVAL_SECONDS * spec.sample_rate() as u64;
        Depacketizer {
            reader,
            decoder,
            spec,
            position: Arc::new(PlaybackPosition::default()),
            mapping: None,
            packet: None,
            next_timestamp: 0,
            first_packet: true,
            beep,
            zero_samples: 0,
            missing_samples: 0,
            packet_samples: 0,
            restored_samples: 0,
            report_countdown,
        }
    }

    /// Attach the RTCP capture-timestamp mapping used to stamp frames.
    pub fn set_mapping(&mut self, mapping: Arc<TimestampMapping>) {
        self.mapping = Some(mapping);
    }

    /// Shared playback-position handle for the latency monitor.
    pub fn position_handle(&self) -> Arc<PlaybackPosition> {
        self.position.clone()
    }

    /// Fraction of synthesized samples since playback started.
    pub fn loss_ratio(&self) -> f64 {
        let total = self.missing_samples + self.packet_samples;
        if total == 0 {
            return 0.0;
        }
        self.missing_samples as f64 / total as f64
    }

    /// Samples decoded from FEC-restored packets.
    pub fn restored_samples(&self) -> u64 {
        self.restored_samples
    }

    fn fill_missing(&mut self, out: &mut [f32]) {
        let n_channels = self.spec.num_channels();
        let n_samples = out.len() / n_channels;

        if self.beep {
            for (i, s) in out.iter_mut().enumerate() {
                *s = (2.0 * PI / self.spec.sample_rate() as f32
                    * 880.0
                    * (i / n_channels) as f32)
                    .sin();
            }
        } else {
            out.fill(0.0);
        }

        self.next_timestamp = self.next_timestamp.wrapping_add(n_samples as u32);

        if self.first_packet {
            self.zero_samples += n_samples as u64;
        } else {
            self.missing_samples += n_samples as u64;
        }
    }

    fn fetch_packet(&mut self, stats: &mut FrameStats) {
        if self.packet.is_some() {
            return;
        }

        let mut n_dropped = 0u64;

        while let Some(packet) = self.reader.read() {
            let rtp = packet.rtp();
            self.decoder.begin(rtp.stream_timestamp, rtp.payload.clone());

            if self.first_packet {
                self.packet = Some(packet);
                break;
            }

            let pkt_end = self
                .decoder
                .position()
                .wrapping_add(self.decoder.available());

            if timestamp_lt(self.next_timestamp, pkt_end) {
                self.packet = Some(packet);
                break;
            }

            // The whole packet is in the past: playback has moved on.
            debug!(
                "depacketizer: dropping late packet: ts={} pkt_ts={}",
                self.next_timestamp, rtp.stream_timestamp
            );
            n_dropped += 1;
            self.decoder.end();
        }

        if n_dropped != 0 {
            debug!(
                "depacketizer: fetched={} dropped={}",
                self.packet.is_some(),
                n_dropped
            );
            stats.n_dropped_packets += n_dropped;
        }

        if self.packet.is_none() {
            return;
        }

        if self.first_packet {
            debug!(
                "depacketizer: got first packet: zero_samples={}",
                self.zero_samples
            );
            self.next_timestamp = self.decoder.position();
            self.first_packet = false;
            self.position.mark_started();
        }

        // Overlap: the packet starts before the playback head, typical
        // for a late packet still accepted by the queue. Skip the part
        // that has already been played.
        let pkt_position = self.decoder.position();
        if timestamp_lt(pkt_position, self.next_timestamp) {
            let overlap = timestamp_diff(self.next_timestamp, pkt_position) as u32;
            self.decoder.shift(overlap);
        }

        if let Some(packet) = &self.packet {
            if packet.has_flags(FLAG_RESTORED) {
                self.restored_samples += packet.rtp().duration as u64;
            }
        }
    }

    fn decode_step(&mut self, out: &mut [f32], stats: &mut FrameStats) -> usize {
        let n_channels = self.spec.num_channels();

        self.fetch_packet(stats);

        if self.packet.is_none() {
            self.fill_missing(out);
            return out.len();
        }

        let mut filled = 0;

        // Gap before the current packet: synthesize up to its start.
        let pkt_position = self.decoder.position();
        if self.next_timestamp != pkt_position {
            let gap = timestamp_diff(pkt_position, self.next_timestamp);
            debug_assert!(gap > 0);

            let gap_samples = (gap as usize * n_channels).min(out.len());
            self.fill_missing(&mut out[..gap_samples]);
            filled += gap_samples;
        }

        // Decode from the packet into the rest of the buffer.
        if filled < out.len() {
            let decoded = self.decoder.read(&mut out[filled..]);
            self.next_timestamp = self.next_timestamp.wrapping_add(decoded as u32);
            self.packet_samples += decoded as u64;
            stats.n_decoded_samples += decoded * n_channels;
            filled += decoded * n_channels;

            if self.decoder.available() == 0 {
                self.decoder.end();
                self.packet = None;
            }
        }

        filled
    }

    fn report_stats(&mut self, frame_samples: u64) {
        // Rate limited by stream time, not wall clock.
        self.report_countdown = self.report_countdown.saturating_sub(frame_samples);
        if self.report_countdown != 0 {
            return;
        }
        self.report_countdown = REPORT_INTERVAL_SECONDS * self.spec.sample_rate() as u64;
        debug!(
            "depacketizer: ts={} loss_ratio={:.5}",
            self.next_timestamp,
            self.loss_ratio()
        );
    }
}

impl<R: PacketReader> FrameReader for Depacketizer<R> {
    fn read(&mut self, frame: &mut Frame<'_>) {
        debug_assert_eq!(frame.len() % self.spec.num_channels(), 0);

        let started_before = !self.first_packet;
        let frame_start = self.next_timestamp;
        let mut stats = FrameStats::default();

        let mut pos = 0;
        while pos < frame.len() {
            let out = &mut frame.samples_mut()[pos..];
            let mut step_stats = FrameStats::default();
            let filled = self.decode_step(out, &mut step_stats);
            stats.n_decoded_samples += step_stats.n_decoded_samples;
            stats.n_dropped_packets += step_stats.n_dropped_packets;
            pos += filled;
        }

        let mut flags = 0;
        if stats.n_decoded_samples != 0 {
            flags |= FRAME_NOT_BLANK;
        }
        if stats.n_decoded_samples < frame.len() {
            flags |= FRAME_NOT_COMPLETE;
        }
        if stats.n_dropped_packets != 0 {
            flags |= FRAME_PACKET_DROPS;
        }
        frame.set_flags(flags);

        if started_before {
            if let Some(mapping) = &self.mapping {
                frame.set_capture_timestamp(
                    mapping.capture_timestamp(frame_start, self.spec.sample_rate()),
                );
            }
        }

        self.position.update(self.next_timestamp);
        self.report_stats((frame.len() / self.spec.num_channels()) as u64);
    }
}
