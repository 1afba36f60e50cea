use std::num::NonZeroUsize;

use log::info;
use rand::{SeedableRng, rngs::StdRng};

use super::Trainer;
use crate::{
    BrainErr, Result,
    arch::{DeepBrain, loss::LossEngine, params::ParamRegistry},
    config::Config,
    optimization::{ExponentialDecay, GradientDescent},
};

/// Wires the model, its parameters, the learning rate schedule and both moving averages into
/// a `Trainer`.
#[derive(Default)]
pub struct TrainerBuilder;

impl TrainerBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Builds a new `Trainer` following a configuration.
    ///
    /// # Arguments
    /// * `config` - The resolved configuration of the run.
    /// * `num_channels` - The amount of signal channels of the features.
    ///
    /// # Returns
    /// The trainer with freshly initialized parameters, or the first error found while
    /// building the model.
    pub fn build(
        &self,
        config: &Config,
        num_channels: usize,
    ) -> Result<Trainer<GradientDescent, StdRng>> {
        let mut rng = self.generate_rng(config.seed);

        let mut registry = ParamRegistry::new();
        let model = DeepBrain::build(config, num_channels, &mut registry)?;
        let params = registry.initialize(&mut rng)?;

        info!(
            "built model with {} tensors and {} parameters",
            registry.entries().len(),
            params.len()
        );

        let loss = LossEngine::new(registry.weight_decays().to_vec(), config.blank());
        let schedule = self.resolve_schedule(config)?;
        let optimizer = GradientDescent::new(config.initial_lr);

        Ok(Trainer::new(
            model,
            params,
            loss,
            optimizer,
            schedule,
            config.moving_avg_decay,
            rng,
        ))
    }

    fn resolve_schedule(&self, config: &Config) -> Result<ExponentialDecay> {
        let steps = config.decay_steps()?;
        let decay_steps = NonZeroUsize::new(steps)
            .ok_or_else(|| BrainErr::Config("the learning rate needs a decay period".into()))?;

        Ok(ExponentialDecay::new(
            config.initial_lr,
            decay_steps,
            config.lr_decay_factor,
        ))
    }

    /// Seeded runs draw the same initial weights and dropout masks, otherwise the OS seeds it.
    fn generate_rng(&self, seed: Option<u64>) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            num_hidden: 4,
            num_filters: 2,
            num_classes: 5,
            seed: Some(7),
            ..Config::default()
        }
    }

    #[test]
    fn seeded_builds_are_reproducible() {
        let builder = TrainerBuilder::new();
        let a = builder.build(&config(), 3).unwrap();
        let b = builder.build(&config(), 3).unwrap();

        assert_eq!(a.params(), b.params());
        assert_eq!(a.params(), a.averaged_params());
        assert_eq!(a.global_step(), 0);
    }

    #[test]
    fn invalid_models_are_not_built() {
        let builder = TrainerBuilder::new();
        assert!(matches!(builder.build(&config(), 0), Err(BrainErr::Config(_))));

        let config = Config {
            num_epochs_per_decay: 0.,
            ..config()
        };
        assert!(matches!(builder.build(&config, 3), Err(BrainErr::Config(_))));
    }
}
