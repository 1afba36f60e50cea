use ndarray::{Array, Dimension, ShapeBuilder};
use ndarray_rand::{RandomExt, rand_distr::Bernoulli};
use rand::Rng;

use crate::{BrainErr, Result};

/// Inverted dropout: kept units are scaled by `1 / keep_prob` so the expected activation is
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    keep_prob: f32,
}

impl Dropout {
    pub fn new(keep_prob: f32) -> Self {
        Self { keep_prob }
    }

    pub fn keep_prob(&self) -> f32 {
        self.keep_prob
    }

    /// Draws a mask to multiply activations of the given shape with.
    ///
    /// # Arguments
    /// * `shape` - The shape of the activations.
    /// * `rng` - The random number generator.
    ///
    /// # Returns
    /// `None` when every unit is kept, or an error if the keep probability is not in `(0, 1]`.
    pub fn mask<D, Sh, R>(&self, shape: Sh, rng: &mut R) -> Result<Option<Array<f32, D>>>
    where
        D: Dimension,
        Sh: ShapeBuilder<Dim = D>,
        R: Rng,
    {
        if self.keep_prob >= 1. {
            return Ok(None);
        }

        if !(self.keep_prob > 0.) {
            return Err(BrainErr::Config(format!(
                "can't drop units with keep probability {}",
                self.keep_prob
            )));
        }

        let bernoulli =
            Bernoulli::new(self.keep_prob as f64).map_err(|e| BrainErr::Config(e.to_string()))?;
        let scale = 1. / self.keep_prob;

        let mask = Array::random_using(shape, bernoulli, rng)
            .mapv(|keep: bool| if keep { scale } else { 0. });

        Ok(Some(mask))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Ix2;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn keeping_everything_needs_no_mask() {
        let mut rng = StdRng::seed_from_u64(0);
        let mask = Dropout::new(1.).mask((3, 3), &mut rng).unwrap();
        assert!(mask.is_none());
    }

    #[test]
    fn kept_units_are_scaled_up() {
        let mut rng = StdRng::seed_from_u64(0);
        let mask: Array<f32, Ix2> = Dropout::new(0.5).mask((40, 50), &mut rng).unwrap().unwrap();

        assert!(mask.iter().all(|&m| m == 0. || m == 2.));

        let kept = mask.iter().filter(|&&m| m > 0.).count() as f32 / mask.len() as f32;
        assert!((kept - 0.5).abs() < 0.1);
    }

    #[test]
    fn invalid_keep_probability_fails() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            Dropout::new(0.).mask(4, &mut rng),
            Err(BrainErr::Config(_))
        ));
    }
}
