//! Sample-domain pipeline stages
//!
//! Everything between packets and the output device: PCM codecs, the
//! depacketizer, mixing, watchdog supervision, and the latency /
//! clock-drift control loop with its resampler.

mod depacketizer;
mod frame;
mod freq_estimator;
mod latency_monitor;
mod mixer;
mod packetizer;
mod pcm;
mod resampler;
mod sample_spec;
mod watchdog;

pub use depacketizer::{Depacketizer, PlaybackPosition};
pub use frame::{
    Frame, FrameReader, FrameWriter, FRAME_NOT_BLANK, FRAME_NOT_COMPLETE,
    FRAME_PACKET_DROPS,
};
pub use freq_estimator::FreqEstimator;
pub use latency_monitor::{LatencyConfig, LatencyMonitor};
pub use mixer::Mixer;
pub use packetizer::Packetizer;
pub use pcm::{FrameDecoder, FrameEncoder, PcmDecoder, PcmEncoder, SAMPLE_WIDTH};
pub use resampler::{ResamplerBackend, ResamplerProfile, ResamplerReader, ScalingControl};
pub use sample_spec::{num_channels, ChannelMask, SampleSpec};
pub use watchdog::{Watchdog, WatchdogConfig};
