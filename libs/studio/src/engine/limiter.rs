use super::dsp::{db_to_linear, linear_to_db, time_coeff, validate_float, MIN_DB};

/// Fixed dynamics settings for the broadcast bus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterSettings {
    pub threshold_db: f32,
    pub knee_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
}

impl LimiterSettings {
    /// Broadcast-safe bus limiting. Not user-tunable.
    pub const BROADCAST: Self = Self {
        threshold_db: -6.0,
        knee_db: 6.0,
        ratio: 12.0,
        attack_ms: 3.0,
        release_ms: 250.0,
    };
}

/// Soft-knee, stereo-linked limiter on interleaved frames.
#[derive(Debug)]
pub struct Limiter {
    settings: LimiterSettings,
    channels: usize,
    attack_coeff: f32,
    release_coeff: f32,
    /// Smoothed gain reduction in dB (>= 0).
    reduction_db: f32,
}

impl Limiter {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self::with_settings(LimiterSettings::BROADCAST, sample_rate, channels)
    }

    pub fn with_settings(settings: LimiterSettings, sample_rate: u32, channels: usize) -> Self {
        Self {
            settings,
            channels: channels.max(1),
            attack_coeff: time_coeff(settings.attack_ms, sample_rate),
            release_coeff: time_coeff(settings.release_ms, sample_rate),
            reduction_db: 0.0,
        }
    }

    pub fn settings(&self) -> LimiterSettings {
        self.settings
    }

    /// Current gain reduction in dB.
    pub fn reduction_db(&self) -> f32 {
        self.reduction_db
    }

    /// Static curve: output level for an input level, both in dB.
    fn curve(&self, input_db: f32) -> f32 {
        let LimiterSettings {
            threshold_db: t,
            knee_db: w,
            ratio: r,
            ..
        } = self.settings;
        let over = input_db - t;
        if 2.0 * over < -w {
            input_db
        } else if 2.0 * over.abs() <= w {
            input_db + (1.0 / r - 1.0) * (over + w / 2.0).powi(2) / (2.0 * w)
        } else {
            t + over / r
        }
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        for frame in samples.chunks_mut(self.channels) {
            let mut level = 0.0_f32;
            for s in frame.iter_mut() {
                *s = validate_float(*s);
                level = level.max(s.abs());
            }

            let input_db = linear_to_db(level);
            let target = if input_db <= MIN_DB {
                0.0
            } else {
                (input_db - self.curve(input_db)).max(0.0)
            };

            let coeff = if target > self.reduction_db {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.reduction_db = validate_float(target + (self.reduction_db - target) * coeff);

            let gain = db_to_linear(-self.reduction_db).clamp(0.001, 1.0);
            for s in frame.iter_mut() {
                *s = validate_float(*s * gain);
            }
        }
    }

    pub fn reset(&mut self) {
        self.reduction_db = 0.0;
    }
}
