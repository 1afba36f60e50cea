mod adapter;
mod batch;
mod source;

pub use adapter::InputAdapter;
pub use batch::{Batch, Features, Partition, RawBatch, SparseLabels};
pub use source::{BatchRequest, BatchSource, Example, InMemorySource, SyntheticSpec};
