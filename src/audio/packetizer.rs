//! Packetizer
//!
//! Sender-side mirror of the depacketizer: accumulates frames until a
//! packet worth of samples is collected, encodes the payload, stamps
//! RTP fields and emits the packet downstream. The stream origin
//! (SSRC, initial seqnum and timestamp) is randomized at startup.

use bytes::Bytes;
use tracing::debug;

use super::frame::{Frame, FrameWriter};
use super::pcm::FrameEncoder;
use super::sample_spec::SampleSpec;
use crate::packet::{Packet, PacketWriter, Rtp, FLAG_AUDIO, FLAG_COMPOSED, FLAG_RTP};
use crate::rtp;
use crate::units::{Nanoseconds, Seqnum, StreamTimestamp};

/// Splits a frame stream into RTP packets.
pub struct Packetizer<W> {
    writer: W,
    encoder: Box<dyn FrameEncoder + Send>,
    spec: SampleSpec,
    samples_per_packet: u32,
    payload_type: u8,
    source_id: u32,
    seqnum: Seqnum,
    timestamp: StreamTimestamp,
    /// Samples per channel already encoded into the open packet.
    packet_pos: u32,
    packet_open: bool,
}

impl<W: PacketWriter> Packetizer<W> {
    /// New packetizer producing packets of `packet_length` each.
    pub fn new(
        writer: W,
        encoder: Box<dyn FrameEncoder + Send>,
        spec: SampleSpec,
        packet_length: Nanoseconds,
        payload_type: u8,
    ) -> Self {
        let samples_per_packet = spec.ns_to_samples(packet_length) as u32;
        debug!(
            "packetizer: initializing: n_channels={} samples_per_packet={}",
            spec.num_channels(),
            samples_per_packet
        );
        Packetizer {
            writer,
            encoder,
            spec,
            samples_per_packet,
            payload_type,
            source_id: rand::random(),
            seqnum: rand::random(),
            timestamp: rand::random(),
            packet_pos: 0,
            packet_open: false,
        }
    }

    /// Stream SSRC chosen at startup.
    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    /// Emit the open packet even if it is not full yet. The remainder
    /// of the payload stays zeroed (plays as silence).
    pub fn flush(&mut self) {
        if self.packet_open {
            self.end_packet();
        }
    }

    fn end_packet(&mut self) {
        let payload = self.encoder.end();

        let mut rtp_fields = Rtp {
            source_id: self.source_id,
            seqnum: self.seqnum,
            stream_timestamp: self.timestamp,
            duration: self.packet_pos,
            payload_type: self.payload_type,
            payload,
            ..Default::default()
        };

        let data: Bytes = rtp::compose(&rtp_fields);
        rtp_fields.header = data.slice(0..rtp::HEADER_SIZE);
        rtp_fields.payload = data.slice(rtp::HEADER_SIZE..);

        let mut packet = Packet::new(FLAG_RTP | FLAG_AUDIO | FLAG_COMPOSED);
        packet.rtp = Some(rtp_fields);
        packet.data = data;

        self.writer.write(packet.into_handle());

        self.seqnum = self.seqnum.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.packet_pos);
        self.packet_pos = 0;
        self.packet_open = false;
    }
}

impl<W: PacketWriter> FrameWriter for Packetizer<W> {
    fn write(&mut self, frame: &Frame<'_>) {
        debug_assert_eq!(frame.len() % self.spec.num_channels(), 0);

        let n_channels = self.spec.num_channels();
        let mut samples = frame.samples();

        while !samples.is_empty() {
            if !self.packet_open {
                self.encoder.begin(self.samples_per_packet as usize);
                self.packet_open = true;
            }

            let room = (self.samples_per_packet - self.packet_pos) as usize;
            let take = (samples.len() / n_channels).min(room);

            let written = self.encoder.write(&samples[..take * n_channels]);
            debug_assert_eq!(written, take);

            samples = &samples[take * n_channels..];
            self.packet_pos += take as u32;

            if self.packet_pos == self.samples_per_packet {
                self.end_packet();
            }
        }
    }
}
