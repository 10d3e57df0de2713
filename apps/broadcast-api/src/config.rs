use std::time::Duration;

/// Broadcast API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Maximum hosts a studio may attach (advertised to broadcasters).
    pub max_hosts: usize,
    /// Maximum guests a studio may attach (advertised to broadcasters).
    pub max_guests: usize,
    /// Maximum simultaneously active calls per broadcast.
    pub max_callers: usize,
    /// Maximum entries in a session's audio-source table.
    pub max_audio_sources: usize,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Output channel count.
    pub channels: u16,
    /// Target encoder bitrate in bits per second.
    pub bitrate: u32,
    /// Pending call requests older than this are expired by housekeeping.
    pub call_timeout: Duration,
    /// Cadence of the call-expiry sweep.
    pub call_sweep_interval: Duration,
    /// Cadence of the server statistics report.
    pub stats_interval: Duration,
    /// Heartbeat interval advertised to clients (ms).
    pub heartbeat_interval_ms: u64,
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: var_or("PORT", defaults.port),
            max_hosts: var_or("MAX_HOSTS", defaults.max_hosts),
            max_guests: var_or("MAX_GUESTS", defaults.max_guests),
            max_callers: var_or("MAX_CALLERS", defaults.max_callers),
            max_audio_sources: var_or("MAX_AUDIO_SOURCES", defaults.max_audio_sources),
            sample_rate: var_or("SAMPLE_RATE", defaults.sample_rate),
            channels: var_or("CHANNELS", defaults.channels),
            bitrate: var_or("BITRATE", defaults.bitrate),
            call_timeout: Duration::from_secs(var_or(
                "CALL_TIMEOUT_SECS",
                defaults.call_timeout.as_secs(),
            )),
            call_sweep_interval: Duration::from_secs(var_or(
                "CALL_SWEEP_INTERVAL_SECS",
                defaults.call_sweep_interval.as_secs(),
            )),
            stats_interval: Duration::from_secs(var_or(
                "STATS_INTERVAL_SECS",
                defaults.stats_interval.as_secs(),
            )),
            heartbeat_interval_ms: var_or("HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval_ms),
        }
        .validated()
    }

    /// Replace zero timer periods with their defaults. Timers cannot tick at
    /// a zero period.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        if self.call_sweep_interval.is_zero() {
            tracing::warn!("CALL_SWEEP_INTERVAL_SECS is zero, using default");
            self.call_sweep_interval = defaults.call_sweep_interval;
        }
        if self.stats_interval.is_zero() {
            tracing::warn!("STATS_INTERVAL_SECS is zero, using default");
            self.stats_interval = defaults.stats_interval;
        }
        if self.heartbeat_interval_ms == 0 {
            tracing::warn!("HEARTBEAT_INTERVAL_MS is zero, using default");
            self.heartbeat_interval_ms = defaults.heartbeat_interval_ms;
        }
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4100,
            max_hosts: 2,
            max_guests: 4,
            max_callers: 2,
            max_audio_sources: 16,
            sample_rate: 48_000,
            channels: 2,
            bitrate: 128_000,
            call_timeout: Duration::from_secs(5 * 60),
            call_sweep_interval: Duration::from_secs(30),
            stats_interval: Duration::from_secs(30),
            heartbeat_interval_ms: 41_250,
        }
    }
}

fn var_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
