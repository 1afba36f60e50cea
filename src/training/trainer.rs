use log::{debug, warn};
use rand::Rng;

use super::{SmoothedLoss, StepSummary};
use crate::{
    BrainErr, Result,
    arch::{
        DeepBrain,
        loss::{LossEngine, LossReport},
    },
    dataset::Batch,
    optimization::{ExponentialDecay, ExponentialMovingAverage, Optimizer},
};

/// Decay of the moving average kept over the loss terms.
pub const LOSS_AVERAGE_DECAY: f32 = 0.9;

const TOTAL_TERM: &str = "total_loss";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    /// Ready for the next step.
    Idle,
    /// A step is in progress, or the last one failed midway.
    Stepping,
}

/// Owns the parameters of a `DeepBrain` and drives its optimization, one batch at a time.
pub struct Trainer<O: Optimizer, R: Rng> {
    model: DeepBrain,
    params: Vec<f32>,
    grad: Vec<f32>,
    loss: LossEngine,
    optimizer: O,
    schedule: ExponentialDecay,
    loss_average: ExponentialMovingAverage,
    weight_average: ExponentialMovingAverage,
    global_step: u64,
    state: TrainerState,
    rng: R,
}

impl<O: Optimizer, R: Rng> Trainer<O, R> {
    /// Creates a new `Trainer`.
    ///
    /// # Arguments
    /// * `model` - The model to train.
    /// * `params` - Its initialized parameters.
    /// * `loss` - The engine computing the objective.
    /// * `optimizer` - The optimizer applying the gradients.
    /// * `schedule` - The learning rate per step.
    /// * `moving_avg_decay` - The decay of the averaged parameters.
    /// * `rng` - The random number generator for dropout.
    pub fn new(
        model: DeepBrain,
        params: Vec<f32>,
        loss: LossEngine,
        optimizer: O,
        schedule: ExponentialDecay,
        moving_avg_decay: f32,
        rng: R,
    ) -> Self {
        let weight_average =
            ExponentialMovingAverage::with_shadow(moving_avg_decay, params.clone());

        Self {
            model,
            grad: vec![0.; params.len()],
            params,
            loss,
            optimizer,
            schedule,
            loss_average: ExponentialMovingAverage::new(LOSS_AVERAGE_DECAY),
            weight_average,
            global_step: 0,
            state: TrainerState::Idle,
            rng,
        }
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    /// The exponentially averaged parameters, which are the ones meant for evaluation.
    pub fn averaged_params(&self) -> &[f32] {
        self.weight_average.average().unwrap_or(&self.params)
    }

    /// Number of completed steps.
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Runs one optimization step over a batch.
    ///
    /// # Returns
    /// The step's summary, or an error. After an error the trainer refuses any further step.
    pub fn step(&mut self, batch: &Batch) -> Result<StepSummary> {
        if self.state == TrainerState::Stepping {
            return Err(BrainErr::StepAborted);
        }

        self.state = TrainerState::Stepping;
        let summary = self.try_step(batch).inspect_err(|e| {
            warn!("step {} failed: {e}", self.global_step + 1);
        })?;
        self.state = TrainerState::Idle;

        debug!("{summary}");
        Ok(summary)
    }

    fn try_step(&mut self, batch: &Batch) -> Result<StepSummary> {
        let learning_rate = self.schedule.learning_rate(self.global_step);
        self.optimizer.set_learning_rate(learning_rate);

        let inference = self.model.forward(
            &self.params,
            &batch.features,
            &batch.seq_lens,
            &mut self.rng,
        )?;
        let report = self.loss.compute(&self.params, &inference, &batch.labels)?;
        let (losses, total) = self.smooth(&report)?;

        self.grad.fill(0.);
        self.model.backward(&self.params, &mut self.grad, report.dlogits.view())?;
        self.loss.apply_decay_grads(&self.params, &mut self.grad)?;

        let grad_norm = self.grad.iter().map(|g| g * g).sum::<f32>().sqrt();
        if !grad_norm.is_finite() {
            return Err(BrainErr::InvalidInput(format!(
                "gradient of loss {} is not finite",
                report.total
            )));
        }

        self.optimizer.update_params(&mut self.params, &self.grad);
        self.global_step += 1;

        self.weight_average.apply(&self.params, Some(self.global_step))?;

        Ok(StepSummary {
            step: self.global_step,
            learning_rate,
            losses,
            total,
            grad_norm,
        })
    }

    /// Updates the loss average with the terms of `report` followed by its total.
    fn smooth(&mut self, report: &LossReport) -> Result<(Vec<SmoothedLoss>, SmoothedLoss)> {
        let raw: Vec<f32> = report
            .terms
            .iter()
            .map(|term| term.value)
            .chain([report.total])
            .collect();

        let smoothed = self.loss_average.apply(&raw, None)?;

        let losses: Vec<_> = report
            .terms
            .iter()
            .zip(smoothed)
            .map(|(term, &smoothed)| SmoothedLoss {
                name: term.name.clone(),
                raw: term.value,
                smoothed,
            })
            .collect();

        let total = SmoothedLoss {
            name: TOTAL_TERM.to_string(),
            raw: report.total,
            smoothed: smoothed[losses.len()],
        };

        Ok((losses, total))
    }

    /// Computes the loss of a batch with the averaged parameters. Dropout masks are drawn as in
    /// `step`, so with `keep_prob < 1` two evaluations of the same batch differ. Neither the
    /// parameters nor any average are updated.
    pub fn evaluate(&mut self, batch: &Batch) -> Result<LossReport> {
        let params = self.weight_average.average().unwrap_or(&self.params);

        let inference = self.model.forward(
            params,
            &batch.features,
            &batch.seq_lens,
            &mut self.rng,
        )?;

        self.loss.compute(params, &inference, &batch.labels)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use ndarray::Array3;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{
        arch::params::ParamRegistry,
        config::Config,
        dataset::{Features, SparseLabels},
        optimization::GradientDescent,
    };

    fn config() -> Config {
        Config {
            num_hidden: 4,
            num_filters: 2,
            num_classes: 5,
            keep_prob: 1.,
            initial_lr: 1e-2,
            moving_avg_decay: 0.5,
            weight_decay: Some(1e-3),
            temporal_stride: NonZeroUsize::new(2).unwrap(),
            ..Config::default()
        }
    }

    fn trainer(config: &Config) -> Trainer<GradientDescent, StdRng> {
        let mut registry = ParamRegistry::new();
        let model = DeepBrain::build(config, 3, &mut registry).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let params = registry.initialize(&mut rng).unwrap();

        Trainer::new(
            model,
            params,
            LossEngine::new(registry.weight_decays().to_vec(), config.blank()),
            GradientDescent::new(config.initial_lr),
            ExponentialDecay::new(config.initial_lr, NonZeroUsize::new(100).unwrap(), 0.9),
            config.moving_avg_decay,
            rng,
        )
    }

    fn batch() -> Batch {
        let features = Array3::from_shape_fn((2, 10, 3), |(b, t, c)| {
            ((b + 1) as f32 * 0.3 * t as f32 + c as f32).sin()
        });
        let labels = SparseLabels::from_sequences([vec![0u32, 1, 2], vec![3, 1]]);
        Batch::new(Features::Standard(features), labels, vec![10, 6]).unwrap()
    }

    #[test]
    fn step_updates_everything_once() {
        let mut trainer = trainer(&config());
        let before = trainer.params().to_vec();

        let summary = trainer.step(&batch()).unwrap();

        assert_eq!(summary.step, 1);
        assert_eq!(trainer.global_step(), 1);
        assert_eq!(trainer.state(), TrainerState::Idle);
        assert_eq!(summary.learning_rate, 1e-2);
        assert_ne!(trainer.params(), before);

        let names: Vec<_> = summary.losses.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "ctc_loss",
                "conv1/weights/weight_loss",
                "fully_connected/weights/weight_loss"
            ]
        );

        // The loss average is seeded with the first values.
        assert_eq!(summary.total.raw, summary.total.smoothed);
        let sum: f32 = summary.losses.iter().map(|l| l.raw).sum();
        assert!((sum - summary.total.raw).abs() < 1e-4);
        assert!(summary.grad_norm > 0.);
    }

    #[test]
    fn first_update_moves_the_shadow_most_of_the_way() {
        let mut trainer = trainer(&config());
        let before = trainer.params().to_vec();
        trainer.step(&batch()).unwrap();

        // On the first update the decay is bounded by (1 + 1) / (10 + 1).
        let decay = 2. / 11.;
        let pairs = trainer.averaged_params().iter().zip(trainer.params());
        for ((shadow, w), w0) in pairs.zip(&before) {
            let expected = w0 - (1. - decay) * (w0 - w);
            assert!((shadow - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn failed_steps_abort_the_trainer() {
        let mut trainer = trainer(&config());

        let labels = SparseLabels::from_sequences([vec![0u32; 12], vec![1]]);
        let features = Features::Standard(Array3::zeros((2, 10, 3)));
        let too_long = Batch::new(features, labels, vec![10, 10]).unwrap();

        assert!(matches!(
            trainer.step(&too_long),
            Err(BrainErr::LabelTooLong { example: 0, .. })
        ));
        assert_eq!(trainer.state(), TrainerState::Stepping);
        assert_eq!(trainer.global_step(), 0);
        assert!(matches!(trainer.step(&batch()), Err(BrainErr::StepAborted)));
    }

    #[test]
    fn evaluation_uses_the_averaged_parameters() {
        let mut trainer = trainer(&config());
        trainer.step(&batch()).unwrap();
        trainer.step(&batch()).unwrap();

        let params = trainer.params().to_vec();
        let averaged = trainer.averaged_params().to_vec();
        assert_ne!(params, averaged);

        let first = trainer.evaluate(&batch()).unwrap();
        let second = trainer.evaluate(&batch()).unwrap();

        assert_eq!(first.total, second.total);
        assert_eq!(trainer.params(), params);
        assert_eq!(trainer.averaged_params(), averaged);
        assert_eq!(trainer.global_step(), 2);
    }

    #[test]
    fn evaluation_draws_dropout_masks() {
        let config = Config {
            keep_prob: 0.5,
            ..config()
        };
        let mut trainer = trainer(&config);
        trainer.step(&batch()).unwrap();
        let averaged = trainer.averaged_params().to_vec();

        let first = trainer.evaluate(&batch()).unwrap();
        let second = trainer.evaluate(&batch()).unwrap();

        assert!(first.total.is_finite() && second.total.is_finite());
        assert_ne!(first.total, second.total);
        assert_eq!(trainer.averaged_params(), averaged);
        assert_eq!(trainer.global_step(), 1);
    }
}
