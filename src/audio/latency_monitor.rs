//! Latency monitor
//!
//! Measures the session latency after every frame: the distance between
//! the newest sample in the jitter buffer (stream tail) and the next
//! sample the depacketizer will emit (playback head). The measurement
//! drives the frequency estimator, whose output - trimmed to a small
//! band around 1.0 - becomes the resampler scaling. If the latency
//! leaves the configured bounds entirely, the session is terminated.

use std::sync::Arc;

use tracing::{debug, warn};

use super::depacketizer::PlaybackPosition;
use super::frame::{Frame, FrameReader};
use super::freq_estimator::FreqEstimator;
use super::resampler::ScalingControl;
use super::sample_spec::SampleSpec;
use crate::error::{Error, Result};
use crate::packet::SharedQueue;
use crate::units::{timestamp_diff, Nanoseconds, MILLISECOND, SECOND};

/// Interval between latency debug reports, in stream time.
const REPORT_INTERVAL_SECONDS: u64 = 5;

/// Latency control configuration.
#[derive(Debug, Clone, Copy)]
pub struct LatencyConfig {
    /// Setpoint the controller keeps the queue depth at.
    pub target_latency: Nanoseconds,
    /// Lower abort bound. Latency below this kills the session.
    pub min_latency: Nanoseconds,
    /// Upper abort bound. Latency above this kills the session.
    pub max_latency: Nanoseconds,
    /// How often a measurement is fed to the frequency estimator.
    pub fe_update_interval: Nanoseconds,
    /// Widest allowed deviation of the scaling from 1.0.
    pub max_scaling_delta: f32,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        let target = 200 * MILLISECOND;
        LatencyConfig {
            target_latency: target,
            min_latency: -target,
            max_latency: 3 * target,
            fe_update_interval: 5 * MILLISECOND,
            max_scaling_delta: 0.01,
        }
    }
}

impl LatencyConfig {
    /// Derive the dependent bounds for a given target.
    pub fn with_target(target_latency: Nanoseconds) -> Self {
        LatencyConfig {
            target_latency,
            min_latency: -target_latency,
            max_latency: 3 * target_latency,
            ..Default::default()
        }
    }
}

/// Frame stage running the latency control loop.
pub struct LatencyMonitor<R> {
    inner: R,
    queue: SharedQueue,
    position: Arc<PlaybackPosition>,
    fe: FreqEstimator,
    target_latency: i32,
    min_latency: i32,
    max_latency: i32,
    max_scaling_delta: f32,
    input_rate: u32,
    output_rate: u32,
    scaling_enabled: bool,
    /// Output-clock read position, in samples per channel.
    read_pos: u64,
    update_interval: u64,
    update_pos: u64,
    has_update_pos: bool,
    report_countdown: u64,
    alive: bool,
    out_channels: usize,
}

impl<R: FrameReader + ScalingControl> LatencyMonitor<R> {
    /// New monitor wrapping the resampler stage.
    ///
    /// `queue` and `position` are the two ends the latency is measured
    /// between. With `scaling_enabled` false the loop only observes and
    /// enforces bounds; the rates must then be equal.
    pub fn new(
        inner: R,
        queue: SharedQueue,
        position: Arc<PlaybackPosition>,
        config: LatencyConfig,
        input_spec: SampleSpec,
        output_spec: SampleSpec,
        scaling_enabled: bool,
    ) -> Result<Self> {
        let input_rate = input_spec.sample_rate();
        let output_rate = output_spec.sample_rate();

        debug!(
            "latency monitor: initializing: target_latency={}ms in_rate={} out_rate={}",
            config.target_latency / MILLISECOND,
            input_rate,
            output_rate
        );

        if config.fe_update_interval <= 0 {
            return Err(Error::InvalidConfig(format!(
                "fe_update_interval must be positive: {}",
                config.fe_update_interval
            )));
        }
        if config.target_latency <= 0
            || config.target_latency < config.min_latency
            || config.target_latency > config.max_latency
        {
            return Err(Error::InvalidConfig(format!(
                "target_latency {} outside [{}, {}]",
                config.target_latency, config.min_latency, config.max_latency
            )));
        }
        if !scaling_enabled && input_rate != output_rate {
            return Err(Error::InvalidConfig(format!(
                "rates must be equal when resampling is disabled: in={} out={}",
                input_rate, output_rate
            )));
        }

        let target_latency = input_spec.ns_to_samples(config.target_latency);
        let mut monitor = LatencyMonitor {
            inner,
            queue,
            position,
            fe: FreqEstimator::new(target_latency as u32),
            target_latency,
            min_latency: (config.min_latency as f64 / SECOND as f64 * input_rate as f64)
                .round() as i32,
            max_latency: input_spec.ns_to_samples(config.max_latency),
            max_scaling_delta: config.max_scaling_delta,
            input_rate,
            output_rate,
            scaling_enabled,
            read_pos: 0,
            update_interval: output_spec.ns_to_samples(config.fe_update_interval) as u64,
            update_pos: 0,
            has_update_pos: false,
            report_countdown: REPORT_INTERVAL_SECONDS * output_rate as u64,
            alive: true,
            out_channels: output_spec.num_channels(),
        };

        if scaling_enabled && !monitor.inner.set_scaling(input_rate, output_rate, 1.0) {
            return Err(Error::InvalidConfig(format!(
                "scaling factor out of bounds: in={} out={}",
                input_rate, output_rate
            )));
        }

        Ok(monitor)
    }

    /// False once the latency left its bounds or scaling failed.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Latency control target, in input-rate samples.
    pub fn target_latency(&self) -> i32 {
        self.target_latency
    }

    /// Last measured latency in input-rate samples, if measurable.
    pub fn latency(&self) -> Option<i32> {
        if !self.position.started() {
            return None;
        }
        let tail = self.queue.latest_end()?;
        let head = self.position.timestamp();
        Some(timestamp_diff(tail, head))
    }

    fn trim_scaling(&self, coeff: f32) -> f32 {
        coeff.clamp(1.0 - self.max_scaling_delta, 1.0 + self.max_scaling_delta)
    }

    fn check_bounds(&mut self, latency: i32) -> bool {
        if latency < self.min_latency {
            warn!(
                "latency monitor: latency out of bounds: latency={} min={}",
                latency, self.min_latency
            );
            return false;
        }
        if latency > self.max_latency {
            warn!(
                "latency monitor: latency out of bounds: latency={} max={}",
                latency, self.max_latency
            );
            return false;
        }
        true
    }

    fn update_scaling(&mut self, latency: i32) -> bool {
        let latency = latency.max(0) as u32;

        if !self.has_update_pos {
            self.has_update_pos = true;
            self.update_pos = self.read_pos;
        }
        while self.read_pos >= self.update_pos {
            self.fe.update(latency);
            self.update_pos += self.update_interval;
        }

        let coeff = self.fe.freq_coeff();
        let trimmed = self.trim_scaling(coeff);

        self.report_countdown = self
            .report_countdown
            .saturating_sub(self.update_interval.max(1));
        if self.report_countdown == 0 {
            self.report_countdown = REPORT_INTERVAL_SECONDS * self.output_rate as u64;
            debug!(
                "latency monitor: latency={} target={} fe={:.5} trim_fe={:.5}",
                latency, self.target_latency, coeff, trimmed
            );
        }

        if !self
            .inner
            .set_scaling(self.input_rate, self.output_rate, trimmed)
        {
            warn!(
                "latency monitor: scaling factor out of bounds: fe={:.5} trim_fe={:.5}",
                coeff, trimmed
            );
            return false;
        }

        true
    }
}

impl<R: FrameReader + ScalingControl> FrameReader for LatencyMonitor<R> {
    fn read(&mut self, frame: &mut Frame<'_>) {
        if !self.alive {
            frame.clear();
            return;
        }

        self.inner.read(frame);
        self.read_pos += (frame.len() / self.out_channels) as u64;

        let Some(latency) = self.latency() else {
            return;
        };

        if !self.check_bounds(latency) {
            self.alive = false;
            return;
        }

        if self.scaling_enabled && !self.update_scaling(latency) {
            self.alive = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::FRAME_NOT_BLANK;
    use crate::packet::{Packet, PacketWriter, Rtp, FLAG_AUDIO, FLAG_RTP};

    /// Inner stage stub recording the scaling it was given.
    struct StubStage {
        scaling: f32,
        reject: bool,
    }

    impl FrameReader for StubStage {
        fn read(&mut self, frame: &mut Frame<'_>) {
            frame.samples_mut().fill(0.1);
            frame.add_flags(FRAME_NOT_BLANK);
        }
    }

    impl ScalingControl for StubStage {
        fn set_scaling(&mut self, _in: u32, _out: u32, multiplier: f32) -> bool {
            self.scaling = multiplier;
            !self.reject
        }
    }

    fn spec() -> SampleSpec {
        SampleSpec::new(44100, 0b11)
    }

    fn push_packet(queue: &mut SharedQueue, seqnum: u16, timestamp: u32) {
        let mut p = Packet::new(FLAG_RTP | FLAG_AUDIO);
        p.rtp = Some(Rtp {
            seqnum,
            stream_timestamp: timestamp,
            duration: 320,
            ..Default::default()
        });
        queue.write(p.into_handle());
    }

    fn monitor(
        queue: SharedQueue,
        position: Arc<PlaybackPosition>,
    ) -> LatencyMonitor<StubStage> {
        LatencyMonitor::new(
            StubStage { scaling: 1.0, reject: false },
            queue,
            position,
            LatencyConfig::with_target(100 * MILLISECOND),
            spec(),
            spec(),
            true,
        )
        .unwrap()
    }

    fn read_one(m: &mut LatencyMonitor<StubStage>) -> u32 {
        let mut buf = [0.0f32; 64];
        let mut frame = Frame::new(&mut buf);
        m.read(&mut frame);
        frame.flags()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let queue = SharedQueue::new(16);
        let position = Arc::new(PlaybackPosition::default());
        let bad = LatencyConfig {
            target_latency: -1,
            ..Default::default()
        };
        assert!(LatencyMonitor::new(
            StubStage { scaling: 1.0, reject: false },
            queue,
            position,
            bad,
            spec(),
            spec(),
            true,
        )
        .is_err());
    }

    #[test]
    fn test_rates_must_match_without_scaling() {
        let queue = SharedQueue::new(16);
        let position = Arc::new(PlaybackPosition::default());
        assert!(LatencyMonitor::new(
            StubStage { scaling: 1.0, reject: false },
            queue,
            position,
            LatencyConfig::default(),
            SampleSpec::new(44100, 0b11),
            SampleSpec::new(48000, 0b11),
            false,
        )
        .is_err());
    }

    #[test]
    fn test_no_measurement_before_start() {
        let queue = SharedQueue::new(16);
        let position = Arc::new(PlaybackPosition::default());
        let mut m = monitor(queue, position);
        assert!(m.latency().is_none());
        read_one(&mut m);
        assert!(m.is_alive());
    }

    #[test]
    fn test_latency_measured_head_to_tail() {
        let mut queue = SharedQueue::new(16);
        let position = Arc::new(PlaybackPosition::default());
        position.mark_started();
        position.update(1000);
        push_packet(&mut queue, 0, 4000); // tail end = 4320

        let m = monitor(queue, position);
        assert_eq!(m.latency(), Some(3320));
    }

    #[test]
    fn test_terminates_when_over_max() {
        let mut queue = SharedQueue::new(16);
        let position = Arc::new(PlaybackPosition::default());
        position.mark_started();
        position.update(0);
        // 100ms target -> max 300ms = 13230 samples; tail way past it.
        push_packet(&mut queue, 0, 44100);

        let mut m = monitor(queue, position);
        read_one(&mut m);
        assert!(!m.is_alive());

        // Dead monitor serves silence with clear flags.
        let flags = read_one(&mut m);
        assert_eq!(flags, 0);
    }

    #[test]
    fn test_scaling_follows_queue_depth() {
        let mut queue = SharedQueue::new(64);
        let position = Arc::new(PlaybackPosition::default());
        position.mark_started();
        position.update(0);
        // Queue sits 50% above target: 4410 * 1.5.
        push_packet(&mut queue, 0, 6295);

        let mut m = monitor(queue, position);
        for _ in 0..2000 {
            read_one(&mut m);
        }
        assert!(m.is_alive());
        let scaling = m.inner.scaling;
        assert!(scaling > 1.0, "scaling={}", scaling);
        assert!(scaling <= 1.0 + m.max_scaling_delta);
    }

    #[test]
    fn test_scaling_failure_terminates() {
        let mut queue = SharedQueue::new(16);
        let position = Arc::new(PlaybackPosition::default());
        position.mark_started();
        position.update(0);
        push_packet(&mut queue, 0, 4000);

        let mut m = monitor(queue, position);
        m.inner.reject = true;
        read_one(&mut m);
        assert!(!m.is_alive());
    }

    #[test]
    fn test_wraparound_latency_is_small_positive() {
        let mut queue = SharedQueue::new(16);
        let position = Arc::new(PlaybackPosition::default());
        position.mark_started();
        position.update(u32::MAX - 100);
        push_packet(&mut queue, 0, u32::MAX - 20); // end wraps to 299

        let m = monitor(queue, position);
        assert_eq!(m.latency(), Some(400));
    }
}
