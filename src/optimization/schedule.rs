use std::num::NonZeroUsize;

/// Decays the learning rate by `factor` once every `decay_steps` steps.
#[derive(Debug, Clone)]
pub struct ExponentialDecay {
    pub initial: f32,
    pub decay_steps: NonZeroUsize,
    pub factor: f32,
}

impl ExponentialDecay {
    pub fn new(initial: f32, decay_steps: NonZeroUsize, factor: f32) -> Self {
        Self {
            initial,
            decay_steps,
            factor,
        }
    }

    /// Returns the learning rate to use on `step`: `initial · factor^floor(step / decay_steps)`.
    #[inline]
    pub fn learning_rate(&self, step: u64) -> f32 {
        let periods = step / self.decay_steps.get() as u64;
        self.initial * self.factor.powf(periods as f32)
    }
}
