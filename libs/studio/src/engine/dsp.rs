//! Numeric guards shared by the processing stages.

const DENORMAL_THRESHOLD: f32 = 1e-15;
pub const MIN_DB: f32 = -100.0;
pub const MAX_DB: f32 = 40.0;
const MIN_LOG_INPUT: f32 = 1e-10;

/// Replace NaN, infinities and denormals with silence.
#[inline]
pub fn validate_float(x: f32) -> f32 {
    if !x.is_finite() || x.abs() < DENORMAL_THRESHOLD {
        0.0
    } else {
        x
    }
}

#[inline]
pub fn linear_to_db(x: f32) -> f32 {
    let x = x.abs();
    if x > MIN_LOG_INPUT {
        (20.0 * x.log10()).clamp(MIN_DB, MAX_DB)
    } else {
        MIN_DB
    }
}

#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db.clamp(MIN_DB, MAX_DB) / 20.0)
}

/// One-pole smoothing coefficient for a time constant in milliseconds.
#[inline]
pub fn time_coeff(ms: f32, sample_rate: u32) -> f32 {
    (-1.0 / (ms * 0.001 * sample_rate as f32)).exp()
}
