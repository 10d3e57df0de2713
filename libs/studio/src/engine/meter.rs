//! Level metering stage.

use serde::Serialize;

/// Peak detector with slow decay for visual meters.
#[derive(Debug)]
pub struct PeakDetector {
    peak: f32,
    decay_factor: f32,
}

impl PeakDetector {
    pub fn new() -> Self {
        Self {
            peak: 0.0,
            decay_factor: 0.999,
        }
    }

    pub fn process(&mut self, samples: &[f32]) -> f32 {
        for &sample in samples {
            let abs_sample = sample.abs();
            if abs_sample > self.peak {
                self.peak = abs_sample;
            }
        }
        self.peak *= self.decay_factor;
        self.peak
    }
}

impl Default for PeakDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding-window RMS over the last 100 ms.
#[derive(Debug)]
pub struct RmsDetector {
    window: Vec<f32>,
    write_index: usize,
    sum_of_squares: f64,
}

impl RmsDetector {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        let window_size = ((sample_rate as usize / 10) * channels.max(1)).max(1);
        Self {
            window: vec![0.0; window_size],
            write_index: 0,
            sum_of_squares: 0.0,
        }
    }

    pub fn process(&mut self, samples: &[f32]) -> f32 {
        for &sample in samples {
            let old = self.window[self.write_index];
            self.sum_of_squares -= f64::from(old * old);
            self.window[self.write_index] = sample;
            self.sum_of_squares += f64::from(sample * sample);
            self.write_index = (self.write_index + 1) % self.window.len();
        }
        // Running sums drift slightly negative from rounding.
        (self.sum_of_squares.max(0.0) / self.window.len() as f64).sqrt() as f32
    }
}

/// Snapshot of the mix published after every render quantum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MixerMetrics {
    /// RMS of the summed mix before dynamics.
    pub input_level: f32,
    /// RMS after the limiter.
    pub output_level: f32,
    /// Decaying peak after the limiter.
    pub peak_level: f32,
    pub active_source_count: usize,
}

#[derive(Debug)]
pub struct LevelMeter {
    input: RmsDetector,
    output: RmsDetector,
    peak: PeakDetector,
}

impl LevelMeter {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            input: RmsDetector::new(sample_rate, channels),
            output: RmsDetector::new(sample_rate, channels),
            peak: PeakDetector::new(),
        }
    }

    pub fn measure_input(&mut self, samples: &[f32]) -> f32 {
        self.input.process(samples)
    }

    /// Returns `(rms, peak)` of the limited output.
    pub fn measure_output(&mut self, samples: &[f32]) -> (f32, f32) {
        (self.output.process(samples), self.peak.process(samples))
    }
}
