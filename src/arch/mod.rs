pub mod activations;
pub mod layers;
pub mod loss;
mod model;
pub mod params;

pub use model::{DeepBrain, Inference};
