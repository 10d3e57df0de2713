use std::time::Duration;

use serde::Deserialize;

/// Heartbeat cadence used when none (or zero) is configured.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(41_250);

/// Mixing engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MixerConfig {
    /// Upper bound on simultaneously mixed sources.
    pub max_sources: usize,
    pub sample_rate: u32,
    pub channels: u16,
    /// Target bitrate advertised for the encoded stream.
    pub bitrate: u32,
    /// Length of each encoded output chunk.
    #[serde(with = "millis")]
    pub chunk_duration: Duration,
    /// Ramp length for volume and mute changes.
    #[serde(with = "millis")]
    pub smoothing_window: Duration,
    /// Capacity of the encoded-chunk channel. Chunks are dropped when full.
    pub output_buffer_chunks: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            max_sources: 16,
            sample_rate: 48_000,
            channels: 2,
            bitrate: 128_000,
            chunk_duration: Duration::from_millis(100),
            smoothing_window: Duration::from_millis(10),
            output_buffer_chunks: 32,
        }
    }
}

impl MixerConfig {
    pub fn channels(&self) -> usize {
        usize::from(self.channels.max(1))
    }

    /// Frames in one smoothing ramp (at least one).
    pub fn smoothing_frames(&self) -> usize {
        frames_for(self.sample_rate, self.smoothing_window).max(1)
    }

    /// Interleaved samples in one encoded chunk.
    pub fn chunk_samples(&self) -> usize {
        frames_for(self.sample_rate, self.chunk_duration).max(1) * self.channels()
    }
}

fn frames_for(sample_rate: u32, duration: Duration) -> usize {
    (u128::from(sample_rate) * duration.as_micros() / 1_000_000) as usize
}

/// Studio controller settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StudioConfig {
    pub broadcast_id: String,
    pub max_hosts: usize,
    pub max_guests: usize,
    pub max_callers: usize,
    /// Gateway WebSocket URL, e.g. `ws://localhost:4100/gateway`. Without it
    /// the studio runs local-only.
    pub gateway_url: Option<String>,
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    pub mixer: MixerConfig,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            broadcast_id: String::new(),
            max_hosts: 2,
            max_guests: 4,
            max_callers: 2,
            gateway_url: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            mixer: MixerConfig::default(),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
