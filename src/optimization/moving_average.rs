use rayon::prelude::*;

use crate::{BrainErr, Result};

/// Keeps an exponentially smoothed shadow of a vector of values.
///
/// Every `apply` moves the shadow towards the values: `shadow -= (1 - decay) · (shadow - value)`.
#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    decay: f32,
    shadow: Option<Vec<f32>>,
}

impl ExponentialMovingAverage {
    /// Creates an average whose shadow is seeded by the first `apply`.
    pub fn new(decay: f32) -> Self {
        Self {
            decay,
            shadow: None,
        }
    }

    /// Creates an average whose shadow starts at `shadow`.
    pub fn with_shadow(decay: f32, shadow: Vec<f32>) -> Self {
        Self {
            decay,
            shadow: Some(shadow),
        }
    }

    /// The decay used after `num_updates` updates. Early on it is lowered to
    /// `(1 + num_updates) / (10 + num_updates)` so the shadow can catch up.
    pub fn decay(&self, num_updates: Option<u64>) -> f32 {
        match num_updates {
            Some(n) => {
                let n = n as f32;
                self.decay.min((1. + n) / (10. + n))
            }
            None => self.decay,
        }
    }

    /// Updates the shadow with new values.
    ///
    /// # Arguments
    /// * `values` - The latest values.
    /// * `num_updates` - If some, bounds the decay as in `decay`.
    ///
    /// # Returns
    /// The updated shadow, or an error if the values don't match the shadow's size.
    pub fn apply(&mut self, values: &[f32], num_updates: Option<u64>) -> Result<&[f32]> {
        let decay = self.decay(num_updates);

        let shadow = self.shadow.get_or_insert_with(|| values.to_vec());
        if shadow.len() != values.len() {
            return Err(BrainErr::SizeMismatch {
                what: "averaged values",
                got: values.len(),
                expected: shadow.len(),
            });
        }

        shadow
            .par_iter_mut()
            .zip(values.par_iter())
            .for_each(|(s, v)| *s -= (1. - decay) * (*s - v));

        Ok(shadow)
    }

    /// The current shadow, if any value was averaged yet.
    pub fn average(&self) -> Option<&[f32]> {
        self.shadow.as_deref()
    }
}
