//! Mixer
//!
//! Additive combination of concurrent streams. Each input is read into
//! a scratch buffer and summed into the output with saturation at the
//! full-scale bounds; frame flags are OR-ed so downstream stages see
//! the union of conditions. With a single input the mixer is a direct
//! delegate.

use super::frame::{Frame, FrameReader};

#[inline]
fn clamp(x: f32) -> f32 {
    x.clamp(-1.0, 1.0)
}

/// Sums sample streams with saturation.
pub struct Mixer {
    temp: Vec<f32>,
}

impl Mixer {
    /// New mixer with a scratch buffer of `frame_len` samples.
    pub fn new(frame_len: usize) -> Self {
        Mixer {
            temp: vec![0.0; frame_len.max(1)],
        }
    }

    /// Fill `frame` with the sum of all `readers`.
    ///
    /// An empty reader set produces silence with clear flags. A single
    /// reader is delegated to without copying.
    pub fn mix_into<'a, I>(&mut self, frame: &mut Frame<'_>, readers: I)
    where
        I: IntoIterator<Item = &'a mut (dyn FrameReader + 'a)>,
    {
        let mut readers = readers.into_iter();

        let Some(first) = readers.next() else {
            frame.clear();
            return;
        };

        let Some(second) = readers.next() else {
            first.read(frame);
            return;
        };

        frame.clear();
        self.accumulate(frame, first);
        self.accumulate(frame, second);
        for reader in readers {
            self.accumulate(frame, reader);
        }
    }

    fn accumulate(&mut self, frame: &mut Frame<'_>, reader: &mut dyn FrameReader) {
        let max_chunk = self.temp.len();
        let mut pos = 0;

        while pos < frame.len() {
            let chunk = (frame.len() - pos).min(max_chunk);

            let mut temp_frame = Frame::new(&mut self.temp[..chunk]);
            reader.read(&mut temp_frame);
            let flags = temp_frame.flags();
            let cts = temp_frame.capture_timestamp();

            for (out, add) in frame.samples_mut()[pos..pos + chunk]
                .iter_mut()
                .zip(&self.temp[..chunk])
            {
                *out = clamp(*out + add);
            }

            frame.add_flags(flags);
            if frame.capture_timestamp() == 0 && cts != 0 {
                frame.set_capture_timestamp(cts);
            }

            pos += chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::{FRAME_NOT_BLANK, FRAME_PACKET_DROPS};

    struct ConstReader {
        value: f32,
        flags: u32,
    }

    impl FrameReader for ConstReader {
        fn read(&mut self, frame: &mut Frame<'_>) {
            frame.samples_mut().fill(self.value);
            frame.set_flags(self.flags);
        }
    }

    fn read(mixer: &mut Mixer, readers: &mut [ConstReader], len: usize) -> (Vec<f32>, u32) {
        let mut buf = vec![0.0f32; len];
        let mut frame = Frame::new(&mut buf);
        mixer.mix_into(
            &mut frame,
            readers.iter_mut().map(|r| r as &mut (dyn FrameReader + '_)),
        );
        let flags = frame.flags();
        (buf, flags)
    }

    #[test]
    fn test_no_inputs_is_silence() {
        let mut mixer = Mixer::new(64);
        let (buf, flags) = read(&mut mixer, &mut [], 16);
        assert!(buf.iter().all(|&s| s == 0.0));
        assert_eq!(flags, 0);
    }

    #[test]
    fn test_single_input_delegates() {
        let mut mixer = Mixer::new(64);
        let mut readers = [ConstReader { value: 0.3, flags: FRAME_NOT_BLANK }];
        let (buf, flags) = read(&mut mixer, &mut readers, 16);
        assert!(buf.iter().all(|&s| (s - 0.3).abs() < 1e-6));
        assert_eq!(flags, FRAME_NOT_BLANK);
    }

    #[test]
    fn test_sum_of_two() {
        let mut mixer = Mixer::new(64);
        let mut readers = [
            ConstReader { value: 0.25, flags: FRAME_NOT_BLANK },
            ConstReader { value: 0.5, flags: FRAME_NOT_BLANK },
        ];
        let (buf, _) = read(&mut mixer, &mut readers, 16);
        assert!(buf.iter().all(|&s| (s - 0.75).abs() < 1e-6));
    }

    #[test]
    fn test_saturation() {
        let mut mixer = Mixer::new(64);
        let mut readers = [
            ConstReader { value: 0.8, flags: 0 },
            ConstReader { value: 0.9, flags: 0 },
        ];
        let (buf, _) = read(&mut mixer, &mut readers, 16);
        assert!(buf.iter().all(|&s| s == 1.0));

        let mut readers = [
            ConstReader { value: -0.8, flags: 0 },
            ConstReader { value: -0.9, flags: 0 },
        ];
        let (buf, _) = read(&mut mixer, &mut readers, 16);
        assert!(buf.iter().all(|&s| s == -1.0));
    }

    #[test]
    fn test_flags_are_unioned() {
        let mut mixer = Mixer::new(64);
        let mut readers = [
            ConstReader { value: 0.1, flags: FRAME_NOT_BLANK },
            ConstReader { value: 0.1, flags: FRAME_PACKET_DROPS },
        ];
        let (_, flags) = read(&mut mixer, &mut readers, 16);
        assert_eq!(flags, FRAME_NOT_BLANK | FRAME_PACKET_DROPS);
    }

    #[test]
    fn test_frame_larger_than_scratch() {
        // Scratch of 8 samples, frame of 32: mixed in chunks.
        let mut mixer = Mixer::new(8);
        let mut readers = [
            ConstReader { value: 0.25, flags: 0 },
            ConstReader { value: 0.25, flags: 0 },
        ];
        let (buf, _) = read(&mut mixer, &mut readers, 32);
        assert!(buf.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }
}
