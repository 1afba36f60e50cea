use log::trace;
use ndarray::Array3;

use super::ctc_loss;
use crate::{
    BrainErr, Result,
    arch::{Inference, params::DecayTerm},
    dataset::SparseLabels,
};

/// A named scalar contributing to the total loss.
#[derive(Debug, Clone, PartialEq)]
pub struct LossTerm {
    pub name: String,
    pub value: f32,
}

/// The outcome of a loss computation.
#[derive(Debug, Clone)]
pub struct LossReport {
    /// `ctc_loss` first, then one term per registered weight decay.
    pub terms: Vec<LossTerm>,
    pub total: f32,
    /// Gradient of the total with respect to the logits.
    pub dlogits: Array3<f32>,
}

/// Computes the training objective: mean alignment loss plus every weight decay term.
#[derive(Debug, Clone)]
pub struct LossEngine {
    decays: Vec<DecayTerm>,
    blank: usize,
}

impl LossEngine {
    pub const CTC_TERM: &'static str = "ctc_loss";

    /// Creates a new `LossEngine`.
    ///
    /// # Arguments
    /// * `decays` - The decay terms registered while building the model.
    /// * `blank` - The class index of the blank symbol.
    pub fn new(decays: Vec<DecayTerm>, blank: usize) -> Self {
        Self { decays, blank }
    }

    /// Computes every loss term and their sum. Nothing is accumulated between calls, so computing
    /// the loss twice yields the same total.
    ///
    /// # Arguments
    /// * `params` - The parameters the inference was computed with.
    /// * `inference` - The output of the model's forward pass.
    /// * `labels` - The batch's label sequences.
    pub fn compute(
        &self,
        params: &[f32],
        inference: &Inference,
        labels: &SparseLabels,
    ) -> Result<LossReport> {
        let ctc = ctc_loss(inference.logits.view(), labels, &inference.seq_lens, self.blank)?;

        let mut terms = Vec::with_capacity(1 + self.decays.len());
        terms.push(LossTerm {
            name: Self::CTC_TERM.to_string(),
            value: ctc.mean() as f32,
        });

        for decay in &self.decays {
            let w = slice(params, decay)?;
            let value = decay.wd * w.iter().map(|w| w * w).sum::<f32>() / 2.;
            terms.push(LossTerm {
                name: decay.name.clone(),
                value,
            });
        }

        let total: f32 = terms.iter().map(|term| term.value).sum();
        trace!("losses {terms:?} add up to {total}");

        Ok(LossReport {
            terms,
            total,
            dlogits: ctc.grad,
        })
    }

    /// Adds the gradient of every weight decay term, `wd · w`, to `grad`.
    pub fn apply_decay_grads(&self, params: &[f32], grad: &mut [f32]) -> Result<()> {
        for decay in &self.decays {
            let w = slice(params, decay)?;
            let g = grad
                .get_mut(decay.range.clone())
                .ok_or(BrainErr::SizeMismatch {
                    what: "gradient",
                    got: w.len(),
                    expected: decay.range.end,
                })?;

            for (g, w) in g.iter_mut().zip(w) {
                *g += decay.wd * w;
            }
        }

        Ok(())
    }
}

fn slice<'a>(params: &'a [f32], decay: &DecayTerm) -> Result<&'a [f32]> {
    params
        .get(decay.range.clone())
        .ok_or(BrainErr::SizeMismatch {
            what: "parameters",
            got: params.len(),
            expected: decay.range.end,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::params::{Init, ParamRegistry};

    fn inference() -> Inference {
        Inference {
            logits: Array3::zeros((2, 1, 2)),
            seq_lens: vec![2],
        }
    }

    #[test]
    fn total_is_ctc_plus_every_decay() {
        let mut registry = ParamRegistry::new();
        registry.variable_with_weight_decay("conv1/weights", &[2], Init::Const(0.), Some(0.5));
        registry.variable("conv1/biases", &[1], Init::Const(0.));
        registry.variable_with_weight_decay(
            "fully_connected/weights",
            &[1],
            Init::Const(0.),
            Some(2.),
        );

        let engine = LossEngine::new(registry.weight_decays().to_vec(), 1);
        let params = [1., 2., 7., 3.];
        let labels = SparseLabels::from_sequences([[0u32]]);

        let report = engine.compute(&params, &inference(), &labels).unwrap();
        let names: Vec<_> = report.terms.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "ctc_loss",
                "conv1/weights/weight_loss",
                "fully_connected/weights/weight_loss"
            ]
        );

        let ctc = -(0.75f32.ln());
        assert!((report.terms[0].value - ctc).abs() < 1e-6);
        assert_eq!(report.terms[1].value, 0.5 * 5. / 2.);
        assert_eq!(report.terms[2].value, 2. * 9. / 2.);
        assert!((report.total - (ctc + 1.25 + 9.)).abs() < 1e-5);

        let again = engine.compute(&params, &inference(), &labels).unwrap();
        assert_eq!(again.total, report.total);
    }

    #[test]
    fn decay_gradients_are_added() {
        let mut registry = ParamRegistry::new();
        registry.variable("conv1/biases", &[1], Init::Const(0.));
        registry.variable_with_weight_decay(
            "fully_connected/weights",
            &[2],
            Init::Const(0.),
            Some(0.1),
        );

        let engine = LossEngine::new(registry.weight_decays().to_vec(), 1);
        let mut grad = [1., 1., 1.];
        engine.apply_decay_grads(&[5., 10., -20.], &mut grad).unwrap();

        assert_eq!(grad, [1., 2., -1.]);
    }

    #[test]
    fn no_decays_means_only_ctc() {
        let engine = LossEngine::new(Vec::new(), 1);
        let labels = SparseLabels::from_sequences([[0u32]]);

        let report = engine.compute(&[], &inference(), &labels).unwrap();
        assert_eq!(report.terms.len(), 1);
        assert_eq!(report.total, report.terms[0].value);
        assert_eq!(report.dlogits.dim(), (2, 1, 2));
    }
}
