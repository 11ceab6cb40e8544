//! L16 PCM payload codec
//!
//! 16-bit big-endian PCM, the format of RTP payload types 10/11.
//! Encode scales by 32768 and clamps to the int16 range; decode is the
//! inverse. Channel layouts are reconciled during the copy: channels
//! present on one side only are discarded or zero-filled respectively.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};

use super::sample_spec::{num_channels, ChannelMask, SampleSpec};
use crate::units::StreamTimestamp;

/// Bytes per sample per channel.
pub const SAMPLE_WIDTH: usize = 2;

/// Decodes packet payloads into sample buffers on demand.
///
/// Usage per packet: `begin`, any number of `read`/`shift`, `end`.
/// `position` is the stream timestamp of the next sample to decode.
pub trait FrameDecoder {
    /// Start decoding a payload whose first sample is `stream_timestamp`.
    fn begin(&mut self, stream_timestamp: StreamTimestamp, payload: Bytes);

    /// Stream timestamp of the next sample `read` would produce.
    fn position(&self) -> StreamTimestamp;

    /// Samples per channel remaining in the current payload.
    fn available(&self) -> u32;

    /// Decode up to `out.len() / output-channels` samples into `out`,
    /// interleaved. Returns samples per channel actually decoded.
    fn read(&mut self, out: &mut [f32]) -> usize;

    /// Skip forward without decoding. Returns samples actually skipped.
    fn shift(&mut self, n_samples: u32) -> u32;

    /// Finish the current payload.
    fn end(&mut self);
}

/// Encodes sample buffers into packet payloads.
pub trait FrameEncoder {
    /// Payload bytes needed for `n_samples` per channel.
    fn encoded_byte_count(&self, n_samples: usize) -> usize;

    /// Start a payload sized for `n_samples` per channel.
    fn begin(&mut self, n_samples: usize);

    /// Append interleaved samples. Returns samples per channel written.
    fn write(&mut self, samples: &[f32]) -> usize;

    /// Finish and take the payload.
    fn end(&mut self) -> Bytes;
}

#[inline]
fn pack(sample: f32) -> i16 {
    let scaled = (sample * 32768.0).clamp(-32768.0, 32767.0);
    scaled as i16
}

#[inline]
fn unpack(raw: i16) -> f32 {
    raw as f32 / 32768.0
}

/// L16 decoder with channel-mask mapping.
pub struct PcmDecoder {
    packet_spec: SampleSpec,
    out_mask: ChannelMask,
    out_channels: usize,
    payload: Bytes,
    start: StreamTimestamp,
    /// Decode offset in samples per channel.
    offset: u32,
    duration: u32,
}

impl PcmDecoder {
    /// New decoder translating `packet_spec` payloads to `out_mask`
    /// frames.
    pub fn new(packet_spec: SampleSpec, out_mask: ChannelMask) -> Self {
        PcmDecoder {
            packet_spec,
            out_mask,
            out_channels: num_channels(out_mask),
            payload: Bytes::new(),
            start: 0,
            offset: 0,
            duration: 0,
        }
    }
}

impl FrameDecoder for PcmDecoder {
    fn begin(&mut self, stream_timestamp: StreamTimestamp, payload: Bytes) {
        self.duration =
            (payload.len() / SAMPLE_WIDTH / self.packet_spec.num_channels()) as u32;
        self.payload = payload;
        self.start = stream_timestamp;
        self.offset = 0;
    }

    fn position(&self) -> StreamTimestamp {
        self.start.wrapping_add(self.offset)
    }

    fn available(&self) -> u32 {
        self.duration - self.offset
    }

    fn read(&mut self, out: &mut [f32]) -> usize {
        let requested = out.len() / self.out_channels;
        let n = requested.min(self.available() as usize);

        let in_mask = self.packet_spec.channel_mask();
        let in_channels = self.packet_spec.num_channels();
        let union_mask = in_mask | self.out_mask;

        let mut in_pos = self.offset as usize * in_channels;
        let mut out_pos = 0;

        for _ in 0..n {
            let mut ch = 1u32;
            while ch != 0 && ch <= union_mask {
                let mut sample = 0.0;
                if in_mask & ch != 0 {
                    let byte = in_pos * SAMPLE_WIDTH;
                    sample = unpack(BigEndian::read_i16(&self.payload[byte..byte + 2]));
                    in_pos += 1;
                }
                if self.out_mask & ch != 0 {
                    out[out_pos] = sample;
                    out_pos += 1;
                }
                ch <<= 1;
            }
        }

        self.offset += n as u32;
        n
    }

    fn shift(&mut self, n_samples: u32) -> u32 {
        let n = n_samples.min(self.available());
        self.offset += n;
        n
    }

    fn end(&mut self) {
        self.payload = Bytes::new();
        self.start = 0;
        self.offset = 0;
        self.duration = 0;
    }
}

/// L16 encoder with channel-mask mapping.
pub struct PcmEncoder {
    packet_spec: SampleSpec,
    in_mask: ChannelMask,
    in_channels: usize,
    buf: BytesMut,
    /// Write offset in samples per channel.
    offset: usize,
    capacity: usize,
}

impl PcmEncoder {
    /// New encoder translating `in_mask` frames to `packet_spec`
    /// payloads.
    pub fn new(packet_spec: SampleSpec, in_mask: ChannelMask) -> Self {
        PcmEncoder {
            packet_spec,
            in_mask,
            in_channels: num_channels(in_mask),
            buf: BytesMut::new(),
            offset: 0,
            capacity: 0,
        }
    }
}

impl FrameEncoder for PcmEncoder {
    fn encoded_byte_count(&self, n_samples: usize) -> usize {
        n_samples * SAMPLE_WIDTH * self.packet_spec.num_channels()
    }

    fn begin(&mut self, n_samples: usize) {
        let bytes = self.encoded_byte_count(n_samples);
        self.buf = BytesMut::zeroed(bytes);
        self.capacity = n_samples;
        self.offset = 0;
    }

    fn write(&mut self, samples: &[f32]) -> usize {
        let avail = samples.len() / self.in_channels;
        let n = avail.min(self.capacity - self.offset);

        let out_mask = self.packet_spec.channel_mask();
        let out_channels = self.packet_spec.num_channels();
        let union_mask = self.in_mask | out_mask;

        let mut in_pos = 0;
        let mut out_pos = self.offset * out_channels;

        for _ in 0..n {
            let mut ch = 1u32;
            while ch != 0 && ch <= union_mask {
                if self.in_mask & ch != 0 {
                    if out_mask & ch != 0 {
                        let byte = out_pos * SAMPLE_WIDTH;
                        BigEndian::write_i16(
                            &mut self.buf[byte..byte + 2],
                            pack(samples[in_pos]),
                        );
                    }
                    in_pos += 1;
                }
                if out_mask & ch != 0 {
                    out_pos += 1;
                }
                ch <<= 1;
            }
        }

        self.offset += n;
        n
    }

    fn end(&mut self) -> Bytes {
        self.capacity = 0;
        self.offset = 0;
        std::mem::take(&mut self.buf).freeze()
    }
}
