mod ctc;
mod engine;

pub use ctc::{CtcOutput, ctc_loss, required_frames};
pub use engine::{LossEngine, LossReport, LossTerm};
