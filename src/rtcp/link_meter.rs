//! Link meter
//!
//! Per-stream ingress statistics: extended sequence numbers, expected
//! and lost packet counts, and interarrival jitter over a sliding
//! window. Sits on the write path before the jitter buffer and before
//! FEC, so every measured packet really crossed the network; restored
//! packets never pass through here and cannot pollute the timing data.

use tracing::debug;

use crate::audio::SampleSpec;
use crate::packet::{PacketHandle, PacketWriter, FLAG_RESTORED, FLAG_RTP, FLAG_UDP};
use crate::units::{seqnum_diff, timestamp_diff, Nanoseconds, Seqnum, StreamTimestamp};

/// Link meter tuning.
#[derive(Debug, Clone, Copy)]
pub struct LinkMeterConfig {
    /// Jitter sliding-window length, in packets.
    pub sliding_window_length: usize,
}

impl Default for LinkMeterConfig {
    fn default() -> Self {
        LinkMeterConfig {
            sliding_window_length: 30000,
        }
    }
}

/// Aggregated link statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkMetrics {
    /// First seqnum of the stream (extended).
    pub ext_first_seqnum: u32,
    /// Highest seqnum seen, extended with wrap cycles.
    pub ext_last_seqnum: u32,
    /// Packets the seqnum span says should have arrived.
    pub expected_packets: u64,
    /// Expected minus actually processed; negative with duplicates.
    pub lost_packets: i64,
    /// Mean interarrival jitter over the window.
    pub jitter: Nanoseconds,
    /// Interarrival jitter as the RFC 3550 (6.4.1) running estimate,
    /// the value reception reports carry.
    pub rtcp_jitter: Nanoseconds,
    /// Window maximum.
    pub max_jitter: Nanoseconds,
    /// Window minimum.
    pub min_jitter: Nanoseconds,
    /// Round-trip time, fed in from RTCP report processing.
    pub rtt: Nanoseconds,
}

struct MovingStats {
    window: std::collections::VecDeque<i64>,
    sum: i64,
    cap: usize,
}

impl MovingStats {
    fn new(cap: usize) -> Self {
        MovingStats {
            window: std::collections::VecDeque::new(),
            sum: 0,
            cap: cap.max(1),
        }
    }

    fn add(&mut self, value: i64) {
        self.window.push_back(value);
        self.sum += value;
        if self.window.len() > self.cap {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
    }

    fn avg(&self) -> i64 {
        if self.window.is_empty() {
            return 0;
        }
        self.sum / self.window.len() as i64
    }

    fn max(&self) -> i64 {
        self.window.iter().copied().max().unwrap_or(0)
    }

    fn min(&self) -> i64 {
        self.window.iter().copied().min().unwrap_or(0)
    }
}

/// Write-side statistics stage.
pub struct LinkMeter<W> {
    writer: W,
    spec: SampleSpec,
    first_packet: bool,
    first_seqnum: Seqnum,
    last_seqnum_hi: u32,
    last_seqnum_lo: Seqnum,
    processed_packets: u64,
    prev_queue_timestamp: Nanoseconds,
    prev_stream_timestamp: StreamTimestamp,
    jitter_stats: MovingStats,
    /// RFC 3550 running jitter estimate: j += (|d| - j) / 16.
    rtcp_jitter: f64,
    metrics: LinkMetrics,
    has_metrics: bool,
}

impl<W: PacketWriter> LinkMeter<W> {
    /// New meter for a stream in `spec`, forwarding to `writer`.
    pub fn new(writer: W, config: LinkMeterConfig, spec: SampleSpec) -> Self {
        LinkMeter {
            writer,
            spec,
            first_packet: true,
            first_seqnum: 0,
            last_seqnum_hi: 0,
            last_seqnum_lo: 0,
            processed_packets: 0,
            prev_queue_timestamp: 0,
            prev_stream_timestamp: 0,
            jitter_stats: MovingStats::new(config.sliding_window_length),
            rtcp_jitter: 0.0,
            metrics: LinkMetrics::default(),
            has_metrics: false,
        }
    }

    /// True once at least one packet was measured.
    pub fn has_metrics(&self) -> bool {
        self.has_metrics
    }

    /// Current statistics snapshot.
    pub fn metrics(&self) -> LinkMetrics {
        let mut m = self.metrics;
        m.jitter = self.jitter_stats.avg();
        m.rtcp_jitter = self.rtcp_jitter as Nanoseconds;
        m.max_jitter = self.jitter_stats.max();
        m.min_jitter = self.jitter_stats.min();
        m
    }

    /// Record the RTT computed by RTCP report processing.
    pub fn set_rtt(&mut self, rtt: Nanoseconds) {
        self.metrics.rtt = rtt;
    }

    fn update_seqnums(&mut self, seqnum: Seqnum) {
        // Before the first wrap, an earlier packet can move the stream
        // start backwards.
        if (self.first_packet || seqnum_diff(seqnum, self.first_seqnum) < 0)
            && self.last_seqnum_hi == 0
        {
            self.first_seqnum = seqnum;
        }

        if self.first_packet {
            self.last_seqnum_hi = 0;
            self.last_seqnum_lo = seqnum;
        } else if seqnum_diff(seqnum, self.last_seqnum_lo) > 0 {
            if seqnum < self.last_seqnum_lo {
                self.last_seqnum_hi += 1 << 16;
            }
            self.last_seqnum_lo = seqnum;
        }

        self.metrics.ext_first_seqnum = self.first_seqnum as u32;
        self.metrics.ext_last_seqnum = self.last_seqnum_hi + self.last_seqnum_lo as u32;
        self.metrics.expected_packets =
            (self.metrics.ext_last_seqnum - self.metrics.ext_first_seqnum + 1) as u64;
    }

    fn update_jitter(&mut self, packet: &PacketHandle) {
        let rtp = packet.rtp();

        let d_queue_ns = packet.queue_timestamp - self.prev_queue_timestamp;
        let d_stream = timestamp_diff(rtp.stream_timestamp, self.prev_stream_timestamp);
        let d_stream_ns = self.spec.samples_to_ns(d_stream);

        let deviation = (d_queue_ns - d_stream_ns).abs();
        self.jitter_stats.add(deviation);
        self.rtcp_jitter += (deviation as f64 - self.rtcp_jitter) / 16.0;
    }

    fn update_metrics(&mut self, packet: &PacketHandle) {
        let rtp = packet.rtp();
        self.update_seqnums(rtp.seqnum);

        if !self.first_packet {
            if self.prev_queue_timestamp > 0 && packet.queue_timestamp > 0 {
                self.update_jitter(packet);
            }
        } else {
            self.first_packet = false;
        }

        self.processed_packets += 1;
        self.metrics.lost_packets =
            self.metrics.expected_packets as i64 - self.processed_packets as i64;

        self.prev_queue_timestamp = packet.queue_timestamp;
        self.prev_stream_timestamp = rtp.stream_timestamp;
        self.has_metrics = true;
    }
}

impl<W: PacketWriter> PacketWriter for LinkMeter<W> {
    fn write(&mut self, packet: PacketHandle) {
        if packet.has_flags(FLAG_RESTORED) {
            // Restored packets carry no new timing information.
            debug!("link meter: skipping restored packet");
        } else if packet.has_flags(FLAG_RTP | FLAG_UDP) {
            self.update_metrics(&packet);
        }

        self.writer.write(packet);
    }
}
