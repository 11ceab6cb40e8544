//! Configuration
//!
//! Receiver and sender settings with serde defaults and TOML loading.
//! Durations are written in milliseconds in the file and converted to
//! nanoseconds at the pipeline boundary.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::audio::{ChannelMask, LatencyConfig, ResamplerBackend, ResamplerProfile, WatchdogConfig};
use crate::rtp::ValidatorConfig;
use crate::units::{Nanoseconds, MILLISECOND};

/// What clocks the receiver pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    /// The output sink paces reads (audio device callback).
    #[default]
    External,
    /// The pipeline paces itself with a monotonic timer.
    Internal,
}

/// Latency control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySettings {
    /// Target latency the controller holds, in milliseconds.
    #[serde(default = "default_target_latency_ms")]
    pub target_latency_ms: u64,

    /// Lower abort bound; defaults to minus one target.
    #[serde(default)]
    pub min_latency_ms: Option<i64>,

    /// Upper abort bound; defaults to three targets.
    #[serde(default)]
    pub max_latency_ms: Option<i64>,
}

/// Watchdog timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TimeoutSettings {
    /// No-playback timeout; defaults to 4/3 of the target latency.
    #[serde(default)]
    pub no_playback_timeout_ms: Option<u64>,

    /// Choppy-playback timeout; defaults to 2000.
    #[serde(default)]
    pub choppy_playback_timeout_ms: Option<u64>,

    /// Choppy detection window; defaults to 300.
    #[serde(default)]
    pub choppy_playback_window_ms: Option<u64>,

    /// Warmup; defaults to one target latency.
    #[serde(default)]
    pub warmup_duration_ms: Option<u64>,
}

/// Resampler settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResamplerSettings {
    /// Quality profile.
    #[serde(default)]
    pub profile: ResamplerProfileSetting,

    /// Implementation selector.
    #[serde(default)]
    pub backend: ResamplerBackendSetting,
}

/// Serde-facing resampler profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResamplerProfileSetting {
    Disabled,
    Low,
    #[default]
    Medium,
    High,
}

/// Serde-facing resampler backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResamplerBackendSetting {
    #[default]
    Sinc,
    Builtin,
}

/// Stream validator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSettings {
    /// Maximum seqnum jump between consecutive packets.
    #[serde(default = "default_max_sn_jump")]
    pub max_sn_jump: u16,

    /// Maximum timestamp jump, in milliseconds.
    #[serde(default = "default_max_ts_jump_ms")]
    pub max_ts_jump_ms: u64,
}

/// FEC settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FecSettings {
    /// Source packets per block (K).
    #[serde(default = "default_fec_source_count")]
    pub source_count: usize,

    /// Repair packets per block (M).
    #[serde(default = "default_fec_repair_count")]
    pub repair_count: usize,

    /// Resync threshold on block-number jumps.
    #[serde(default = "default_fec_max_sbn_distance")]
    pub block_max_sbn_distance: u16,
}

/// Receiver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default)]
    pub latency: LatencySettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub resampler: ResamplerSettings,

    #[serde(default)]
    pub validator: ValidatorSettings,

    #[serde(default)]
    pub fec: FecSettings,

    /// What paces the pipeline.
    #[serde(default)]
    pub clock_source: ClockSource,

    /// Frame granularity of the pull chain, in milliseconds.
    #[serde(default = "default_frame_length_ms")]
    pub frame_length_ms: u64,

    /// Packet granularity of the sender, in milliseconds.
    #[serde(default = "default_packet_length_ms")]
    pub packet_length_ms: u64,

    /// Output (device) sample rate.
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,

    /// Output channel bitmask (0b11 is stereo).
    #[serde(default = "default_output_channels")]
    pub output_channels: ChannelMask,

    /// Fill gaps with a tone instead of silence (debug aid).
    #[serde(default)]
    pub beep_on_gaps: bool,

    /// Maximum concurrent sessions admitted.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_target_latency_ms() -> u64 { 200 }
fn default_max_sn_jump() -> u16 { 16384 }
fn default_max_ts_jump_ms() -> u64 { 5000 }
fn default_fec_source_count() -> usize { 20 }
fn default_fec_repair_count() -> usize { 10 }
fn default_fec_max_sbn_distance() -> u16 { 32 }
fn default_frame_length_ms() -> u64 { 10 }
fn default_packet_length_ms() -> u64 { 5 }
fn default_output_sample_rate() -> u32 { 44100 }
fn default_output_channels() -> ChannelMask { 0b11 }
fn default_max_sessions() -> usize { 16 }

impl Default for LatencySettings {
    fn default() -> Self {
        LatencySettings {
            target_latency_ms: default_target_latency_ms(),
            min_latency_ms: None,
            max_latency_ms: None,
        }
    }
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        ValidatorSettings {
            max_sn_jump: default_max_sn_jump(),
            max_ts_jump_ms: default_max_ts_jump_ms(),
        }
    }
}

impl Default for FecSettings {
    fn default() -> Self {
        FecSettings {
            source_count: default_fec_source_count(),
            repair_count: default_fec_repair_count(),
            block_max_sbn_distance: default_fec_max_sbn_distance(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            latency: LatencySettings::default(),
            timeouts: TimeoutSettings::default(),
            resampler: ResamplerSettings::default(),
            validator: ValidatorSettings::default(),
            fec: FecSettings::default(),
            clock_source: ClockSource::default(),
            frame_length_ms: default_frame_length_ms(),
            packet_length_ms: default_packet_length_ms(),
            output_sample_rate: default_output_sample_rate(),
            output_channels: default_output_channels(),
            beep_on_gaps: false,
            max_sessions: default_max_sessions(),
        }
    }
}

impl ReceiverConfig {
    /// Load from the conventional search path, falling back to
    /// defaults when no file exists.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "receiver.toml",
            "/etc/audiobridge/receiver.toml",
            "~/.config/audiobridge/receiver.toml",
        ];

        for path in config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::load_from_file(expanded.as_ref());
            }
        }

        tracing::warn!("no receiver.toml found, using defaults");
        Ok(Self::default())
    }

    /// Load from a specific file.
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("cannot read {}", path))?;
        let config: ReceiverConfig =
            toml::from_str(&content).with_context(|| format!("cannot parse {}", path))?;
        tracing::info!("configuration loaded from {}", path);
        Ok(config)
    }

    /// Write to a file.
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("cannot serialize configuration")?;
        fs::write(path, content).with_context(|| format!("cannot write {}", path))?;
        Ok(())
    }

    /// Target latency in nanoseconds.
    pub fn target_latency(&self) -> Nanoseconds {
        self.latency.target_latency_ms as Nanoseconds * MILLISECOND
    }

    /// Frame length in nanoseconds.
    pub fn frame_length(&self) -> Nanoseconds {
        self.frame_length_ms as Nanoseconds * MILLISECOND
    }

    /// Packet length in nanoseconds.
    pub fn packet_length(&self) -> Nanoseconds {
        self.packet_length_ms as Nanoseconds * MILLISECOND
    }

    /// Assembled latency-monitor configuration.
    pub fn latency_config(&self) -> LatencyConfig {
        let target = self.target_latency();
        let mut config = LatencyConfig::with_target(target);
        if let Some(min) = self.latency.min_latency_ms {
            config.min_latency = min * MILLISECOND;
        }
        if let Some(max) = self.latency.max_latency_ms {
            config.max_latency = max * MILLISECOND;
        }
        config
    }

    /// Assembled watchdog configuration.
    pub fn watchdog_config(&self) -> WatchdogConfig {
        let mut config = WatchdogConfig::deduce(self.target_latency());
        if let Some(v) = self.timeouts.no_playback_timeout_ms {
            config.no_playback_timeout = v as Nanoseconds * MILLISECOND;
        }
        if let Some(v) = self.timeouts.choppy_playback_timeout_ms {
            config.choppy_playback_timeout = v as Nanoseconds * MILLISECOND;
        }
        if let Some(v) = self.timeouts.choppy_playback_window_ms {
            config.choppy_playback_window = v as Nanoseconds * MILLISECOND;
        }
        if let Some(v) = self.timeouts.warmup_duration_ms {
            config.warmup_duration = v as Nanoseconds * MILLISECOND;
        }
        config
    }

    /// Assembled validator configuration.
    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            max_sn_jump: self.validator.max_sn_jump,
            max_ts_jump: self.validator.max_ts_jump_ms as Nanoseconds * MILLISECOND,
        }
    }

    /// Resampler profile for the pipeline.
    pub fn resampler_profile(&self) -> ResamplerProfile {
        match self.resampler.profile {
            ResamplerProfileSetting::Disabled => ResamplerProfile::Disabled,
            ResamplerProfileSetting::Low => ResamplerProfile::Low,
            ResamplerProfileSetting::Medium => ResamplerProfile::Medium,
            ResamplerProfileSetting::High => ResamplerProfile::High,
        }
    }

    /// Resampler backend for the pipeline.
    pub fn resampler_backend(&self) -> ResamplerBackend {
        match self.resampler.backend {
            ResamplerBackendSetting::Sinc => ResamplerBackend::Sinc,
            ResamplerBackendSetting::Builtin => ResamplerBackend::Builtin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReceiverConfig::default();
        assert_eq!(config.target_latency(), 200 * MILLISECOND);
        assert_eq!(config.output_sample_rate, 44100);
        assert_eq!(config.output_channels, 0b11);
        assert_eq!(config.clock_source, ClockSource::External);

        let watchdog = config.watchdog_config();
        assert_eq!(watchdog.no_playback_timeout, 200 * MILLISECOND * 4 / 3);
        assert_eq!(watchdog.warmup_duration, 200 * MILLISECOND);

        let latency = config.latency_config();
        assert_eq!(latency.min_latency, -(200 * MILLISECOND));
        assert_eq!(latency.max_latency, 600 * MILLISECOND);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            output_sample_rate = 48000

            [latency]
            target_latency_ms = 100

            [resampler]
            profile = "high"

            [fec]
            source_count = 10
            repair_count = 5
        "#;
        let config: ReceiverConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.output_sample_rate, 48000);
        assert_eq!(config.target_latency(), 100 * MILLISECOND);
        assert_eq!(config.resampler.profile, ResamplerProfileSetting::High);
        assert_eq!(config.fec.source_count, 10);
        // Untouched sections keep defaults.
        assert_eq!(config.validator.max_sn_jump, 16384);
        assert_eq!(config.frame_length_ms, 10);
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = ReceiverConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: ReceiverConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.output_sample_rate, config.output_sample_rate);
        assert_eq!(back.latency.target_latency_ms, config.latency.target_latency_ms);
    }

    #[test]
    fn test_explicit_overrides_win() {
        let toml = r#"
            [timeouts]
            no_playback_timeout_ms = 500

            [latency]
            target_latency_ms = 300
        "#;
        let config: ReceiverConfig = toml::from_str(toml).unwrap();
        let watchdog = config.watchdog_config();
        // Explicit value beats the 4/3-of-target deduction.
        assert_eq!(watchdog.no_playback_timeout, 500 * MILLISECOND);
        assert_eq!(watchdog.warmup_duration, 300 * MILLISECOND);
    }
}
