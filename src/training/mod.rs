mod builder;
mod summary;
mod trainer;

pub use builder::TrainerBuilder;
pub use summary::{SmoothedLoss, StepSummary};
pub use trainer::{LOSS_AVERAGE_DECAY, Trainer, TrainerState};
