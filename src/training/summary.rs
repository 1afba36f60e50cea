use std::fmt::{self, Display};

/// A loss term before and after smoothing.
#[derive(Debug, Clone, PartialEq)]
pub struct SmoothedLoss {
    pub name: String,
    pub raw: f32,
    /// The exponential moving average of `raw` over every step so far.
    pub smoothed: f32,
}

/// The scalars produced by one training step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSummary {
    /// The global step after the update.
    pub step: u64,
    pub learning_rate: f32,
    /// `ctc_loss` first, then every weight decay term.
    pub losses: Vec<SmoothedLoss>,
    pub total: SmoothedLoss,
    /// Euclidean norm of the gradient the update was made with.
    pub grad_norm: f32,
}

impl StepSummary {
    /// Looks up a loss term by name.
    pub fn loss(&self, name: &str) -> Option<&SmoothedLoss> {
        self.losses.iter().find(|loss| loss.name == name)
    }
}

impl Display for StepSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {}: loss = {:.4} ({:.4} smoothed), lr = {:e}, |grad| = {:.4}",
            self.step, self.total.raw, self.total.smoothed, self.learning_rate, self.grad_norm
        )?;

        for loss in &self.losses {
            write!(f, ", {} = {:.4}", loss.name, loss.raw)?;
        }

        Ok(())
    }
}
