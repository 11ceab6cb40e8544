//! Resampler
//!
//! Converts the stream sample rate to the device rate with a
//! time-varying scaling multiplier on top: scaling 1.001 plays the
//! input 0.1% faster, which is how the latency controller absorbs
//! sender/receiver clock drift. Two backends sit behind one contract:
//! a windowed-sinc resampler (rubato) for quality, and a built-in
//! linear interpolator for cheap operation. When the rates match and
//! scaling is 1.0 the whole stage is bypassed.

use std::collections::VecDeque;

use rubato::{
    Resampler, SincFixedOut, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use tracing::{debug, warn};

use super::frame::{Frame, FrameReader};
use super::sample_spec::SampleSpec;

/// Output chunk size the sinc backend produces per pass.
const SINC_CHUNK: usize = 256;

/// Widest scaling the backends accept, relative to the nominal ratio.
const MAX_SCALING: f32 = 4.0;
const MIN_SCALING: f32 = 1.0 / MAX_SCALING;

/// Resampler quality profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplerProfile {
    /// No resampler stage; rates must match and drift is not corrected.
    Disabled,
    /// Short sinc, cheapest.
    Low,
    /// Balanced quality and cost.
    #[default]
    Medium,
    /// Long sinc, best quality.
    High,
}

/// Resampler implementation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplerBackend {
    /// Windowed-sinc (rubato).
    #[default]
    Sinc,
    /// Built-in linear interpolator.
    Builtin,
}

/// Scaling knob exposed to the latency monitor.
pub trait ScalingControl {
    /// Set the rate conversion and drift multiplier. Returns false if
    /// the multiplier is outside the backend's range.
    fn set_scaling(&mut self, input_rate: u32, output_rate: u32, multiplier: f32) -> bool;
}

enum Backend {
    Passthrough,
    Sinc(SincState),
    Linear(LinearState),
}

struct SincState {
    resampler: SincFixedOut<f32>,
    /// Deinterleaved staging for the backend input.
    channel_bufs: Vec<Vec<f32>>,
}

struct LinearState {
    /// Interleaved input staging; `phase` indexes frames within it.
    input: Vec<f32>,
    /// Fractional read position in input frames.
    phase: f64,
    /// Input frames consumed per output frame.
    step: f64,
}

/// Pull-side resampling stage.
pub struct ResamplerReader<R> {
    inner: R,
    in_spec: SampleSpec,
    out_spec: SampleSpec,
    scaling: f32,
    backend: Backend,
    backend_kind: ResamplerBackend,
    profile: ResamplerProfile,
    /// Interleaved resampled samples waiting to be handed out.
    out_ring: VecDeque<f32>,
    /// Reused staging for inner reads; no per-refill allocation.
    staging: Vec<f32>,
    /// Flags accumulated from the inner reads feeding `out_ring`.
    pending_flags: u32,
}

fn sinc_parameters(profile: ResamplerProfile) -> SincInterpolationParameters {
    let (sinc_len, oversampling_factor) = match profile {
        ResamplerProfile::Low => (64, 64),
        ResamplerProfile::Medium => (128, 128),
        ResamplerProfile::High => (256, 256),
        ResamplerProfile::Disabled => (64, 64),
    };
    SincInterpolationParameters {
        sinc_len,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor,
        window: WindowFunction::BlackmanHarris2,
    }
}

impl<R: FrameReader> ResamplerReader<R> {
    /// New stage converting `in_spec` to `out_spec`.
    ///
    /// With `ResamplerProfile::Disabled` the stage is a permanent
    /// pass-through and the rates must be equal; that invariant is
    /// checked at session construction.
    pub fn new(
        inner: R,
        in_spec: SampleSpec,
        out_spec: SampleSpec,
        profile: ResamplerProfile,
        backend: ResamplerBackend,
    ) -> Self {
        debug!(
            "resampler: initializing: in_rate={} out_rate={} profile={:?}",
            in_spec.sample_rate(),
            out_spec.sample_rate(),
            profile
        );
        let mut reader = ResamplerReader {
            inner,
            in_spec,
            out_spec,
            scaling: 1.0,
            backend: Backend::Passthrough,
            backend_kind: backend,
            profile,
            out_ring: VecDeque::new(),
            staging: Vec::new(),
            pending_flags: 0,
        };
        reader.rebuild_backend(backend);
        reader
    }

    /// True when the stage currently bypasses the backend entirely.
    pub fn is_passthrough(&self) -> bool {
        matches!(self.backend, Backend::Passthrough)
    }

    fn nominal_ratio(&self) -> f64 {
        self.out_spec.sample_rate() as f64
            / (self.in_spec.sample_rate() as f64 * self.scaling as f64)
    }

    fn rebuild_backend(&mut self, backend: ResamplerBackend) {
        if self.profile == ResamplerProfile::Disabled
            || (self.in_spec.sample_rate() == self.out_spec.sample_rate()
                && self.scaling == 1.0)
        {
            self.backend = Backend::Passthrough;
            return;
        }

        match backend {
            ResamplerBackend::Sinc => {
                let channels = self.out_spec.num_channels();
                match SincFixedOut::<f32>::new(
                    self.nominal_ratio(),
                    MAX_SCALING as f64,
                    sinc_parameters(self.profile),
                    SINC_CHUNK,
                    channels,
                ) {
                    Ok(resampler) => {
                        self.backend = Backend::Sinc(SincState {
                            resampler,
                            channel_bufs: vec![Vec::new(); channels],
                        });
                    }
                    Err(e) => {
                        warn!("resampler: sinc backend construction failed: {}", e);
                        self.backend = Backend::Linear(self.linear_state());
                    }
                }
            }
            ResamplerBackend::Builtin => {
                self.backend = Backend::Linear(self.linear_state());
            }
        }
    }

    fn linear_state(&self) -> LinearState {
        LinearState {
            input: Vec::new(),
            phase: 0.0,
            step: 1.0 / self.nominal_ratio(),
        }
    }

    /// Pull `len` interleaved samples from the inner reader into the
    /// staging buffer, OR-ing the frame flags into the pending set.
    fn pull_inner(&mut self, len: usize) {
        self.staging.resize(len, 0.0);
        let mut frame = Frame::new(&mut self.staging);
        self.inner.read(&mut frame);
        self.pending_flags |= frame.flags();
    }

    fn refill_sinc(&mut self) {
        let channels = self.out_spec.num_channels();

        let Backend::Sinc(state) = &mut self.backend else {
            return;
        };
        let needed = state.resampler.input_frames_next();

        // Borrow dance: pull_inner needs &mut self.
        let backend = std::mem::replace(&mut self.backend, Backend::Passthrough);
        let Backend::Sinc(mut state) = backend else { unreachable!() };

        self.pull_inner(needed * channels);

        for (ch, buf) in state.channel_bufs.iter_mut().enumerate() {
            buf.clear();
            buf.extend(self.staging.iter().skip(ch).step_by(channels));
        }

        match state.resampler.process(&state.channel_bufs, None) {
            Ok(output) => {
                let out_frames = output[0].len();
                for i in 0..out_frames {
                    for chan in output.iter() {
                        self.out_ring.push_back(chan[i]);
                    }
                }
            }
            Err(e) => {
                warn!("resampler: process failed: {}", e);
                self.out_ring
                    .extend(std::iter::repeat(0.0).take(SINC_CHUNK * channels));
            }
        }

        self.backend = Backend::Sinc(state);
    }

    fn refill_linear(&mut self) {
        let channels = self.out_spec.num_channels();

        let backend = std::mem::replace(&mut self.backend, Backend::Passthrough);
        let Backend::Linear(mut state) = backend else {
            unreachable!("linear refill without linear backend")
        };

        // Keep at least two input frames ahead of the read phase.
        let mut produced = 0;
        while produced < SINC_CHUNK {
            let have_frames = state.input.len() / channels;
            if (state.phase as usize) + 2 > have_frames {
                self.pull_inner(SINC_CHUNK * channels);
                state.input.extend_from_slice(&self.staging);
                continue;
            }

            let idx = state.phase as usize;
            let frac = (state.phase - idx as f64) as f32;
            for ch in 0..channels {
                let a = state.input[idx * channels + ch];
                let b = state.input[(idx + 1) * channels + ch];
                self.out_ring.push_back(a + (b - a) * frac);
            }
            state.phase += state.step;
            produced += 1;
        }

        // Compact consumed input.
        let consumed = (state.phase as usize).saturating_sub(1);
        if consumed > 0 {
            state.input.drain(..consumed * channels);
            state.phase -= consumed as f64;
        }

        self.backend = Backend::Linear(state);
    }
}

impl<R: FrameReader> FrameReader for ResamplerReader<R> {
    fn read(&mut self, frame: &mut Frame<'_>) {
        if matches!(self.backend, Backend::Passthrough) && self.out_ring.is_empty() {
            self.inner.read(frame);
            return;
        }

        let mut pos = 0;
        while pos < frame.len() {
            if self.out_ring.is_empty() {
                match self.backend {
                    Backend::Passthrough => {
                        // Ring drained and bypass re-engaged: read the
                        // remainder straight through.
                        let remaining = frame.len() - pos;
                        self.pull_inner(remaining);
                        frame.samples_mut()[pos..].copy_from_slice(&self.staging);
                        pos = frame.len();
                        continue;
                    }
                    Backend::Sinc(_) => self.refill_sinc(),
                    Backend::Linear(_) => self.refill_linear(),
                }
            }
            while pos < frame.len() {
                match self.out_ring.pop_front() {
                    Some(sample) => {
                        frame.samples_mut()[pos] = sample;
                        pos += 1;
                    }
                    None => break,
                }
            }
        }

        frame.set_flags(std::mem::take(&mut self.pending_flags));
    }
}

impl<R: FrameReader> ScalingControl for ResamplerReader<R> {
    fn set_scaling(&mut self, input_rate: u32, output_rate: u32, multiplier: f32) -> bool {
        if !(MIN_SCALING..=MAX_SCALING).contains(&multiplier) {
            return false;
        }
        if self.profile == ResamplerProfile::Disabled {
            // No backend to drive; only the neutral setting is valid.
            return multiplier == 1.0;
        }

        debug_assert_eq!(input_rate, self.in_spec.sample_rate());
        debug_assert_eq!(output_rate, self.out_spec.sample_rate());
        self.scaling = multiplier;

        if matches!(self.backend, Backend::Passthrough) {
            if multiplier != 1.0 || input_rate != output_rate {
                // Leave the bypass and engage the configured backend;
                // it is constructed with the new scaling baked in.
                self.rebuild_backend(self.backend_kind);
            }
            return true;
        }

        match &mut self.backend {
            Backend::Passthrough => true,
            Backend::Sinc(state) => {
                let ratio = output_rate as f64 / (input_rate as f64 * multiplier as f64);
                state.resampler.set_resample_ratio(ratio, true).is_ok()
            }
            Backend::Linear(state) => {
                state.step = input_rate as f64 * multiplier as f64 / output_rate as f64;
                true
            }
        }
    }
}
