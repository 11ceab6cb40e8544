//! Payload-type encoding table
//!
//! Maps RTP payload types to sample formats. The static entries cover
//! the RFC 3551 L16 formats this transport uses on the wire:
//! PT 10 (L16 stereo, 44100 Hz) and PT 11 (L16 mono, 44100 Hz).

use crate::audio::SampleSpec;
use crate::packet::{FLAG_AUDIO, FLAG_RTP};

/// L16 stereo at 44100 Hz (RFC 3551).
pub const PAYLOAD_TYPE_L16_STEREO: u8 = 10;
/// L16 mono at 44100 Hz (RFC 3551).
pub const PAYLOAD_TYPE_L16_MONO: u8 = 11;

/// One payload-type entry.
#[derive(Debug, Clone)]
pub struct Encoding {
    /// RTP payload type.
    pub payload_type: u8,
    /// Sample rate and channel layout of the payload.
    pub sample_spec: SampleSpec,
    /// Bytes per sample per channel (2 for L16).
    pub sample_width: usize,
    /// Flags stamped onto packets of this type.
    pub packet_flags: u32,
}

impl Encoding {
    /// Samples per channel in a payload of `payload_len` bytes.
    pub fn packet_duration(&self, payload_len: usize) -> u32 {
        (payload_len / self.sample_width / self.sample_spec.num_channels()) as u32
    }

    /// Payload bytes needed for `n_samples` per channel.
    pub fn payload_size(&self, n_samples: usize) -> usize {
        n_samples * self.sample_width * self.sample_spec.num_channels()
    }
}

/// Registry of known payload types.
#[derive(Debug, Clone)]
pub struct EncodingMap {
    entries: Vec<Encoding>,
}

impl Default for EncodingMap {
    fn default() -> Self {
        EncodingMap {
            entries: vec![
                Encoding {
                    payload_type: PAYLOAD_TYPE_L16_STEREO,
                    sample_spec: SampleSpec::new(44100, 0b11),
                    sample_width: 2,
                    packet_flags: FLAG_RTP | FLAG_AUDIO,
                },
                Encoding {
                    payload_type: PAYLOAD_TYPE_L16_MONO,
                    sample_spec: SampleSpec::new(44100, 0b1),
                    sample_width: 2,
                    packet_flags: FLAG_RTP | FLAG_AUDIO,
                },
            ],
        }
    }
}

impl EncodingMap {
    /// Look up an encoding by payload type.
    pub fn find_by_pt(&self, payload_type: u8) -> Option<&Encoding> {
        self.entries.iter().find(|e| e.payload_type == payload_type)
    }

    /// Register an additional (dynamic) payload type.
    pub fn register(&mut self, encoding: Encoding) {
        self.entries.retain(|e| e.payload_type != encoding.payload_type);
        self.entries.push(encoding);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_entries() {
        let map = EncodingMap::default();

        let stereo = map.find_by_pt(PAYLOAD_TYPE_L16_STEREO).unwrap();
        assert_eq!(stereo.sample_spec.sample_rate(), 44100);
        assert_eq!(stereo.sample_spec.num_channels(), 2);
        // 320 samples x 2 channels x 2 bytes.
        assert_eq!(stereo.payload_size(320), 1280);
        assert_eq!(stereo.packet_duration(1280), 320);

        let mono = map.find_by_pt(PAYLOAD_TYPE_L16_MONO).unwrap();
        assert_eq!(mono.sample_spec.num_channels(), 1);

        assert!(map.find_by_pt(96).is_none());
    }

    #[test]
    fn test_register_dynamic() {
        let mut map = EncodingMap::default();
        map.register(Encoding {
            payload_type: 97,
            sample_spec: SampleSpec::new(48000, 0b11),
            sample_width: 2,
            packet_flags: FLAG_RTP | FLAG_AUDIO,
        });
        assert_eq!(map.find_by_pt(97).unwrap().sample_spec.sample_rate(), 48000);
    }
}
