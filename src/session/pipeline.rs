//! Per-session receiver pipeline
//!
//! One session per SSRC. The ingress half runs on the network thread:
//! validator, link meter, and the shared jitter queue(s). The playback
//! half runs on the audio thread: delayer, FEC reader, depacketizer,
//! resampler, latency monitor and watchdog, assembled into a single
//! pull chain. The two halves meet only at the thread-safe queues.

use std::sync::Arc;

use tracing::debug;

use crate::audio::{
    Depacketizer, Frame, FrameReader, LatencyConfig, LatencyMonitor, PcmDecoder,
    PlaybackPosition, ResamplerBackend, ResamplerProfile, ResamplerReader, SampleSpec,
    Watchdog, WatchdogConfig,
};
use crate::error::Result;
use crate::fec::{make_decoder, BlockReader, FecConfig};
use crate::packet::{DelayedReader, PacketHandle, PacketReader, PacketWriter, SharedQueue};
use crate::rtcp::{LinkMeter, LinkMeterConfig, LinkMetrics, ReceiverReporter, SenderReport};
use crate::rtp::{EncodingMap, Validator, ValidatorConfig};
use crate::units::Nanoseconds;

/// Everything needed to build one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Latency control settings.
    pub latency: LatencyConfig,
    /// Watchdog settings.
    pub watchdog: WatchdogConfig,
    /// Validator thresholds.
    pub validator: ValidatorConfig,
    /// FEC parameters, when the endpoint protocol carries a scheme.
    pub fec: Option<FecConfig>,
    /// Resampler quality.
    pub resampler_profile: ResamplerProfile,
    /// Resampler implementation.
    pub resampler_backend: ResamplerBackend,
    /// Output (device) format.
    pub output_spec: SampleSpec,
    /// Fill gaps with a tone instead of silence.
    pub beep: bool,
    /// Jitter queue capacity, in packets.
    pub queue_capacity: usize,
}

/// Network-thread half of a session.
pub struct SessionIngress {
    validator: Validator<LinkMeter<SharedQueue>>,
    repair_queue: Option<SharedQueue>,
}

impl SessionIngress {
    /// Deliver a source-stream packet.
    pub fn write_source(&mut self, packet: PacketHandle) {
        self.validator.write(packet);
    }

    /// Deliver a repair-stream packet.
    pub fn write_repair(&mut self, packet: PacketHandle) {
        if let Some(queue) = &mut self.repair_queue {
            queue.write(packet);
        }
    }

    /// Current link statistics.
    pub fn metrics(&self) -> LinkMetrics {
        self.validator.writer().metrics()
    }

    /// Record an RTT measurement from RTCP processing.
    pub fn set_rtt(&mut self, rtt: Nanoseconds) {
        self.validator.writer_mut().set_rtt(rtt);
    }
}

type PipelineReader = Watchdog<
    LatencyMonitor<ResamplerReader<Depacketizer<Box<dyn PacketReader + Send>>>>,
>;

/// Audio-thread half of a session.
pub struct SessionPipeline {
    reader: PipelineReader,
    reporter: ReceiverReporter,
    position: Arc<PlaybackPosition>,
}

impl SessionPipeline {
    /// True while neither the watchdog nor the latency monitor fired.
    pub fn is_alive(&self) -> bool {
        self.reader.is_alive() && self.reader.inner().is_alive()
    }

    /// Shared playback position handle.
    pub fn position(&self) -> Arc<PlaybackPosition> {
        self.position.clone()
    }

    /// Last measured latency in stream samples.
    pub fn latency(&self) -> Option<i32> {
        self.reader.inner().latency()
    }

    /// Ingest a sender report (capture-timestamp mapping, RTT anchor).
    pub fn process_sender_report(&mut self, sr: &SenderReport, now_ns: Nanoseconds) {
        self.reporter.process_sender_report(sr, now_ns);
    }

    /// Build this session's reception report block.
    pub fn build_report(
        &mut self,
        ssrc: u32,
        metrics: &LinkMetrics,
        now_ns: Nanoseconds,
    ) -> crate::rtcp::ReceptionReport {
        self.reporter.build_report(ssrc, metrics, now_ns)
    }
}

impl FrameReader for SessionPipeline {
    fn read(&mut self, frame: &mut Frame<'_>) {
        self.reader.read(frame);
    }
}

/// Build the two halves of a session for a stream in `packet_spec`.
pub fn build_session(
    config: &SessionConfig,
    packet_spec: SampleSpec,
    encodings: &EncodingMap,
) -> Result<(SessionIngress, SessionPipeline)> {
    debug!(
        "session: building pipeline: in_rate={} out_rate={} fec={}",
        packet_spec.sample_rate(),
        config.output_spec.sample_rate(),
        config.fec.map(|f| f.scheme.name()).unwrap_or("none")
    );

    let source_queue = SharedQueue::new(config.queue_capacity);
    let repair_queue = config.fec.map(|_| SharedQueue::new(config.queue_capacity));

    // Ingress: validator -> link meter -> jitter queue.
    let meter = LinkMeter::new(
        source_queue.clone(),
        LinkMeterConfig::default(),
        packet_spec,
    );
    let validator = Validator::new(meter, config.validator, packet_spec.sample_rate());
    let ingress = SessionIngress {
        validator,
        repair_queue: repair_queue.clone(),
    };

    // Playback chain, bottom up.
    let input_spec = SampleSpec::new(
        packet_spec.sample_rate(),
        config.output_spec.channel_mask(),
    );

    let target_samples = input_spec.ns_to_samples(config.latency.target_latency);
    let delayed = DelayedReader::new(source_queue.clone(), target_samples);

    let packet_reader: Box<dyn PacketReader + Send> = match (&config.fec, repair_queue) {
        (Some(fec), Some(repair)) => Box::new(BlockReader::new(
            delayed,
            repair,
            make_decoder(fec.scheme),
            *fec,
            encodings.clone(),
        )),
        _ => Box::new(delayed),
    };

    let decoder = PcmDecoder::new(packet_spec, config.output_spec.channel_mask());
    let mut depacketizer =
        Depacketizer::new(packet_reader, Box::new(decoder), input_spec, config.beep);

    let reporter = ReceiverReporter::new(packet_spec);
    depacketizer.set_mapping(reporter.mapping());
    let position = depacketizer.position_handle();

    let resampler = ResamplerReader::new(
        depacketizer,
        input_spec,
        config.output_spec,
        config.resampler_profile,
        config.resampler_backend,
    );

    let monitor = LatencyMonitor::new(
        resampler,
        source_queue,
        position.clone(),
        config.latency,
        input_spec,
        config.output_spec,
        config.resampler_profile != ResamplerProfile::Disabled,
    )?;

    let watchdog = Watchdog::new(monitor, config.output_spec, config.watchdog)?;

    Ok((
        ingress,
        SessionPipeline {
            reader: watchdog,
            reporter,
            position,
        },
    ))
}
