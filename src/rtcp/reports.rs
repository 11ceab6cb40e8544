//! RTCP sender/receiver reports
//!
//! RFC 3550 SR and RR packets: wire parsing and building, plus the
//! receiver-side report state - the capture-timestamp mapping taken
//! from sender reports, and the reception report block derived from
//! link metrics (fraction lost, cumulative lost, extended seqnum,
//! jitter, LSR/DLSR echo).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use super::link_meter::LinkMetrics;
use super::loss::{LossEstimator, PacketCounter};
use super::ntp::{ntp_clamp_32, ntp_from_unix_ns, ntp_to_unix_ns, NtpTimestamp};
use crate::audio::SampleSpec;
use crate::error::{Error, Result};
use crate::units::{timestamp_diff, timestamp_to_ns, Nanoseconds, StreamTimestamp};

/// RTCP packet type of a sender report.
pub const PT_SENDER_REPORT: u8 = 200;
/// RTCP packet type of a receiver report.
pub const PT_RECEIVER_REPORT: u8 = 201;

const REPORT_BLOCK_LEN: usize = 24;

/// One reception report block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceptionReport {
    /// SSRC of the stream being reported on.
    pub ssrc: u32,
    /// Lost fraction of the previous interval, in 1/256 units.
    pub fraction_lost: u8,
    /// Cumulative packets lost, 24-bit signed.
    pub cumulative_lost: i32,
    /// Extended highest sequence number received.
    pub ext_highest_seqnum: u32,
    /// Interarrival jitter in stream-timestamp units.
    pub jitter: u32,
    /// Middle 32 bits of the last SR's NTP timestamp.
    pub last_sr: u32,
    /// Delay since that SR, in 1/65536 seconds.
    pub delay_since_last_sr: u32,
}

/// Parsed sender report.
#[derive(Debug, Clone, Default)]
pub struct SenderReport {
    /// Sender SSRC.
    pub ssrc: u32,
    /// Sender wall clock as a 64-bit NTP timestamp.
    pub ntp_timestamp: NtpTimestamp,
    /// Stream timestamp corresponding to the NTP timestamp.
    pub rtp_timestamp: StreamTimestamp,
    /// Sender's cumulative packet count.
    pub packet_count: u32,
    /// Sender's cumulative payload octet count.
    pub octet_count: u32,
    /// Attached reception reports.
    pub reports: Vec<ReceptionReport>,
}

/// Built receiver report.
#[derive(Debug, Clone, Default)]
pub struct ReceiverReport {
    /// Reporter (receiver) SSRC.
    pub ssrc: u32,
    /// Reception reports, one per measured stream.
    pub reports: Vec<ReceptionReport>,
}

fn put_report_block(buf: &mut BytesMut, report: &ReceptionReport) {
    buf.put_u32(report.ssrc);
    let lost24 = (report.cumulative_lost.clamp(-(1 << 23), (1 << 23) - 1)) as u32 & 0x00FF_FFFF;
    buf.put_u32(((report.fraction_lost as u32) << 24) | lost24);
    buf.put_u32(report.ext_highest_seqnum);
    buf.put_u32(report.jitter);
    buf.put_u32(report.last_sr);
    buf.put_u32(report.delay_since_last_sr);
}

fn get_report_block(data: &[u8]) -> ReceptionReport {
    let word = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
    let loss_word = word(4);
    let mut cumulative_lost = (loss_word & 0x00FF_FFFF) as i32;
    if cumulative_lost & 0x0080_0000 != 0 {
        cumulative_lost |= !0x00FF_FFFF; // sign-extend from 24 bits
    }
    ReceptionReport {
        ssrc: word(0),
        fraction_lost: (loss_word >> 24) as u8,
        cumulative_lost,
        ext_highest_seqnum: word(8),
        jitter: word(12),
        last_sr: word(16),
        delay_since_last_sr: word(20),
    }
}

fn put_header(buf: &mut BytesMut, pt: u8, rc: usize, words: usize) {
    buf.put_u8(0x80 | (rc as u8 & 0x1F));
    buf.put_u8(pt);
    buf.put_u16((words - 1) as u16);
}

fn check_header(data: &[u8], pt: u8) -> Result<usize> {
    if data.len() < 8 {
        return Err(Error::BadHeader("short rtcp packet"));
    }
    if data[0] >> 6 != 2 {
        return Err(Error::BadVersion(data[0] >> 6));
    }
    if data[1] != pt {
        return Err(Error::BadHeader("unexpected rtcp packet type"));
    }
    let words = u16::from_be_bytes([data[2], data[3]]) as usize + 1;
    if data.len() < words * 4 {
        return Err(Error::BadHeader("rtcp length exceeds packet"));
    }
    Ok(data[0] as usize & 0x1F)
}

/// Serialize a sender report.
pub fn build_sender_report(sr: &SenderReport) -> Bytes {
    let words = 7 + sr.reports.len() * 6;
    let mut buf = BytesMut::with_capacity(words * 4);

    put_header(&mut buf, PT_SENDER_REPORT, sr.reports.len(), words);
    buf.put_u32(sr.ssrc);
    buf.put_u64(sr.ntp_timestamp);
    buf.put_u32(sr.rtp_timestamp);
    buf.put_u32(sr.packet_count);
    buf.put_u32(sr.octet_count);
    for report in &sr.reports {
        put_report_block(&mut buf, report);
    }
    buf.freeze()
}

/// Parse a sender report.
pub fn parse_sender_report(data: &[u8]) -> Result<SenderReport> {
    let rc = check_header(data, PT_SENDER_REPORT)?;
    if data.len() < 28 + rc * REPORT_BLOCK_LEN {
        return Err(Error::BadHeader("short sender report"));
    }

    let word = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);

    Ok(SenderReport {
        ssrc: word(4),
        ntp_timestamp: ((word(8) as u64) << 32) | word(12) as u64,
        rtp_timestamp: word(16),
        packet_count: word(20),
        octet_count: word(24),
        reports: (0..rc)
            .map(|i| get_report_block(&data[28 + i * REPORT_BLOCK_LEN..]))
            .collect(),
    })
}

/// Serialize a receiver report.
pub fn build_receiver_report(rr: &ReceiverReport) -> Bytes {
    let words = 2 + rr.reports.len() * 6;
    let mut buf = BytesMut::with_capacity(words * 4);

    put_header(&mut buf, PT_RECEIVER_REPORT, rr.reports.len(), words);
    buf.put_u32(rr.ssrc);
    for report in &rr.reports {
        put_report_block(&mut buf, report);
    }
    buf.freeze()
}

/// Parse a receiver report.
pub fn parse_receiver_report(data: &[u8]) -> Result<ReceiverReport> {
    let rc = check_header(data, PT_RECEIVER_REPORT)?;
    if data.len() < 8 + rc * REPORT_BLOCK_LEN {
        return Err(Error::BadHeader("short receiver report"));
    }

    let word = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);

    Ok(ReceiverReport {
        ssrc: word(4),
        reports: (0..rc)
            .map(|i| get_report_block(&data[8 + i * REPORT_BLOCK_LEN..]))
            .collect(),
    })
}

/// Mapping between stream timestamps and sender wall clock, taken from
/// sender reports. Shared with the depacketizer, which stamps frames
/// from it; plain atomics since readers tolerate a torn update of
/// unrelated fields.
#[derive(Default)]
pub struct TimestampMapping {
    valid: AtomicBool,
    rtp_timestamp: AtomicU32,
    capture_ns: AtomicI64,
}

impl TimestampMapping {
    /// New, invalid mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a sender report established the mapping.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    /// Install a (stream timestamp, sender wall clock) anchor.
    pub fn set(&self, rtp_timestamp: StreamTimestamp, capture_ns: Nanoseconds) {
        self.rtp_timestamp.store(rtp_timestamp, Ordering::Relaxed);
        self.capture_ns.store(capture_ns, Ordering::Relaxed);
        self.valid.store(true, Ordering::Relaxed);
    }

    /// Capture timestamp of a given stream position, or 0 if unknown.
    pub fn capture_timestamp(&self, ts: StreamTimestamp, rate: u32) -> Nanoseconds {
        if !self.is_valid() {
            return 0;
        }
        let anchor_ts = self.rtp_timestamp.load(Ordering::Relaxed);
        let anchor_ns = self.capture_ns.load(Ordering::Relaxed);
        anchor_ns + timestamp_to_ns(timestamp_diff(ts, anchor_ts), rate)
    }
}

/// Receiver-side RTCP state for one stream.
pub struct ReceiverReporter {
    mapping: Arc<TimestampMapping>,
    spec: SampleSpec,
    loss: LossEstimator,
    counter: PacketCounter,
    last_sr_ntp: NtpTimestamp,
    last_sr_recv_ns: Nanoseconds,
}

impl ReceiverReporter {
    /// New reporter for a stream in `spec`.
    pub fn new(spec: SampleSpec) -> Self {
        ReceiverReporter {
            mapping: Arc::new(TimestampMapping::new()),
            spec,
            loss: LossEstimator::new(),
            counter: PacketCounter::new(),
            last_sr_ntp: 0,
            last_sr_recv_ns: 0,
        }
    }

    /// Shared mapping handle for the depacketizer.
    pub fn mapping(&self) -> Arc<TimestampMapping> {
        self.mapping.clone()
    }

    /// Ingest a sender report received at local wall clock `now_ns`.
    pub fn process_sender_report(&mut self, sr: &SenderReport, now_ns: Nanoseconds) {
        self.mapping
            .set(sr.rtp_timestamp, ntp_to_unix_ns(sr.ntp_timestamp));
        self.last_sr_ntp = sr.ntp_timestamp;
        self.last_sr_recv_ns = now_ns;
    }

    /// Build the reception report block for this stream.
    pub fn build_report(
        &mut self,
        ssrc: u32,
        metrics: &LinkMetrics,
        now_ns: Nanoseconds,
    ) -> ReceptionReport {
        // Expected count from the extended seqnum span; the counter
        // keeps it monotonic across 32-bit wraps of the extension.
        let expected = self
            .counter
            .update(metrics.ext_first_seqnum, metrics.ext_last_seqnum)
            + 1;

        let fraction = self.loss.update(expected, metrics.lost_packets);
        let fraction_lost = (fraction * 256.0).clamp(0.0, 255.0) as u8;

        let (last_sr, delay) = if self.last_sr_ntp != 0 {
            let lsr = (ntp_clamp_32(self.last_sr_ntp, u64::MAX) >> 16) as u32;
            let delay_ns = (now_ns - self.last_sr_recv_ns).max(0);
            let dlsr = ((delay_ns as u128 * 65536) / 1_000_000_000) as u32;
            (lsr, dlsr)
        } else {
            (0, 0)
        };

        ReceptionReport {
            ssrc,
            fraction_lost,
            cumulative_lost: metrics.lost_packets.clamp(-(1 << 23), (1 << 23) - 1) as i32,
            ext_highest_seqnum: metrics.ext_last_seqnum,
            jitter: self.spec.ns_to_samples(metrics.rtcp_jitter).max(0) as u32,
            last_sr,
            delay_since_last_sr: delay,
        }
    }
}

/// Round-trip time from an echoed report block: the peer echoes our SR
/// timestamp (LSR) and its holding delay (DLSR); subtracting both from
/// the current NTP time leaves the network round trip.
pub fn rtt_from_report(report: &ReceptionReport, now_ns: Nanoseconds) -> Option<Nanoseconds> {
    if report.last_sr == 0 {
        return None;
    }
    let now_mid = (ntp_clamp_32(ntp_from_unix_ns(now_ns), u64::MAX) >> 16) as u32;
    let rtt_units = now_mid
        .wrapping_sub(report.last_sr)
        .wrapping_sub(report.delay_since_last_sr);
    // 1/65536-second units.
    let rtt_ns = (rtt_units as i64 * 1_000_000_000) >> 16;
    (rtt_ns >= 0).then_some(rtt_ns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{MILLISECOND, SECOND};

    #[test]
    fn test_sender_report_roundtrip() {
        let sr = SenderReport {
            ssrc: 0xAABBCCDD,
            ntp_timestamp: 0x1122_3344_5566_7788,
            rtp_timestamp: 98765,
            packet_count: 1000,
            octet_count: 1_280_000,
            reports: vec![ReceptionReport {
                ssrc: 7,
                fraction_lost: 25,
                cumulative_lost: -3,
                ext_highest_seqnum: 70000,
                jitter: 42,
                last_sr: 0x12345678,
                delay_since_last_sr: 100,
            }],
        };

        let wire = build_sender_report(&sr);
        assert_eq!(wire.len() % 4, 0);

        let parsed = parse_sender_report(&wire).unwrap();
        assert_eq!(parsed.ssrc, sr.ssrc);
        assert_eq!(parsed.ntp_timestamp, sr.ntp_timestamp);
        assert_eq!(parsed.rtp_timestamp, sr.rtp_timestamp);
        assert_eq!(parsed.packet_count, sr.packet_count);
        assert_eq!(parsed.reports, sr.reports);
    }

    #[test]
    fn test_receiver_report_roundtrip() {
        let rr = ReceiverReport {
            ssrc: 9,
            reports: vec![ReceptionReport {
                ssrc: 1,
                fraction_lost: 0,
                cumulative_lost: 12,
                ext_highest_seqnum: 500,
                jitter: 3,
                last_sr: 0,
                delay_since_last_sr: 0,
            }],
        };
        let parsed = parse_receiver_report(&build_receiver_report(&rr)).unwrap();
        assert_eq!(parsed.ssrc, 9);
        assert_eq!(parsed.reports, rr.reports);
    }

    #[test]
    fn test_negative_cumulative_lost_survives() {
        let rr = ReceiverReport {
            ssrc: 1,
            reports: vec![ReceptionReport {
                cumulative_lost: -100,
                ..Default::default()
            }],
        };
        let parsed = parse_receiver_report(&build_receiver_report(&rr)).unwrap();
        assert_eq!(parsed.reports[0].cumulative_lost, -100);
    }

    #[test]
    fn test_bad_packets_rejected() {
        assert!(parse_sender_report(&[0x80, 200]).is_err());
        // Wrong version.
        let mut wire = build_sender_report(&SenderReport::default()).to_vec();
        wire[0] = 0x40 | (wire[0] & 0x3F);
        assert!(parse_sender_report(&wire).is_err());
        // Wrong packet type.
        let wire = build_receiver_report(&ReceiverReport::default());
        assert!(parse_sender_report(&wire).is_err());
    }

    #[test]
    fn test_mapping_from_sender_report() {
        let spec = SampleSpec::new(44100, 0b11);
        let mut reporter = ReceiverReporter::new(spec);
        let mapping = reporter.mapping();
        assert_eq!(mapping.capture_timestamp(0, 44100), 0);

        let capture_ns = 1_700_000_000 * SECOND;
        let sr = SenderReport {
            ssrc: 1,
            ntp_timestamp: ntp_from_unix_ns(capture_ns),
            rtp_timestamp: 44100,
            ..Default::default()
        };
        reporter.process_sender_report(&sr, 0);

        // One second of samples after the anchor.
        let cts = mapping.capture_timestamp(2 * 44100, 44100);
        assert!((cts - (capture_ns + SECOND)).abs() < 2);
        // Before the anchor, wrap-aware.
        let cts = mapping.capture_timestamp(0, 44100);
        assert!((cts - (capture_ns - SECOND)).abs() < 2);
    }

    #[test]
    fn test_reception_report_contents() {
        let spec = SampleSpec::new(44100, 0b11);
        let mut reporter = ReceiverReporter::new(spec);

        let sr = SenderReport {
            ntp_timestamp: ntp_from_unix_ns(100 * SECOND),
            rtp_timestamp: 0,
            ..Default::default()
        };
        reporter.process_sender_report(&sr, 100 * SECOND);

        let metrics = LinkMetrics {
            ext_first_seqnum: 0,
            ext_last_seqnum: 99,
            expected_packets: 100,
            lost_packets: 10,
            rtcp_jitter: 10 * MILLISECOND,
            ..Default::default()
        };
        // Report built one second after the SR arrived.
        let report = reporter.build_report(42, &metrics, 101 * SECOND);

        assert_eq!(report.ssrc, 42);
        // 10% interval loss in 1/256 units.
        assert_eq!(report.fraction_lost, 25);
        assert_eq!(report.cumulative_lost, 10);
        assert_eq!(report.ext_highest_seqnum, 99);
        // 10ms of jitter at 44100Hz.
        assert_eq!(report.jitter, 441);
        assert_ne!(report.last_sr, 0);
        // DLSR of one second in 1/65536 units.
        assert_eq!(report.delay_since_last_sr, 65536);
    }

    #[test]
    fn test_rtt_computation() {
        let sr_sent_ns = 50 * SECOND;
        let lsr = (ntp_clamp_32(ntp_from_unix_ns(sr_sent_ns), u64::MAX) >> 16) as u32;
        let report = ReceptionReport {
            last_sr: lsr,
            // Peer held our SR for 200ms.
            delay_since_last_sr: 65536 / 5,
            ..Default::default()
        };
        // Echo arrives 300ms after we sent the SR: RTT is 100ms.
        let rtt = rtt_from_report(&report, sr_sent_ns + 300 * MILLISECOND).unwrap();
        assert!((rtt - 100 * MILLISECOND).abs() < 2 * MILLISECOND, "rtt={}", rtt);
    }
}
