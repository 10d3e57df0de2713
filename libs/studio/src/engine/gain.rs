/// Per-source gain stage with linear ramps.
///
/// Changes are applied on the render boundary one frame at a time, so the
/// gain is continuous: consecutive frames never differ by more than
/// `|target - start| / ramp_frames`.
#[derive(Debug, Clone)]
pub struct GainControl {
    current: f32,
    target: f32,
    step: f32,
    remaining: usize,
}

impl GainControl {
    pub fn new(initial: f32) -> Self {
        Self {
            current: initial,
            target: initial,
            step: 0.0,
            remaining: 0,
        }
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn is_ramping(&self) -> bool {
        self.remaining > 0
    }

    /// Ramp from the current value to `target` over `frames` frames. A ramp in
    /// progress is restarted from wherever it has reached.
    pub fn ramp_to(&mut self, target: f32, frames: usize) {
        if frames == 0 {
            self.set_immediate(target);
            return;
        }
        self.target = target;
        self.step = (target - self.current) / frames as f32;
        self.remaining = frames;
    }

    pub fn set_immediate(&mut self, value: f32) {
        self.current = value;
        self.target = value;
        self.step = 0.0;
        self.remaining = 0;
    }

    /// Advance one frame and return the gain for it.
    #[inline]
    pub fn next_frame(&mut self) -> f32 {
        if self.remaining > 0 {
            self.remaining -= 1;
            self.current = if self.remaining == 0 {
                self.target
            } else {
                self.current + self.step
            };
        }
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_reaches_target_in_exact_frame_count() {
        let mut gain = GainControl::new(1.0);
        gain.ramp_to(0.0, 480);
        for _ in 0..479 {
            gain.next_frame();
        }
        assert!(gain.is_ramping());
        assert_eq!(gain.next_frame(), 0.0);
        assert!(!gain.is_ramping());
        assert_eq!(gain.next_frame(), 0.0);
    }

    #[test]
    fn ramp_is_continuous_even_when_retargeted() {
        let frames = 480;
        let mut gain = GainControl::new(1.0);
        gain.ramp_to(0.0, frames);
        let max_step = 1.0 / frames as f32 + 1e-6;

        let mut prev = gain.current();
        for i in 0..2_000 {
            if i == 100 {
                gain.ramp_to(0.8, frames);
            }
            let g = gain.next_frame();
            assert!((g - prev).abs() <= max_step, "jump of {} at frame {i}", (g - prev).abs());
            prev = g;
        }
        assert_eq!(gain.current(), 0.8);
    }
}
