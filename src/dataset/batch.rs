use std::borrow::Cow;

use half::f16;
use ndarray::Array3;

use crate::{BrainErr, Result};

/// The partition of a patient's recordings a batch is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Train,
    Validation,
    Test,
}

/// Label sequences of a whole batch, concatenated in example order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SparseLabels {
    values: Vec<u32>,
    lengths: Vec<usize>,
}

impl SparseLabels {
    /// Creates a new `SparseLabels`.
    ///
    /// # Arguments
    /// * `values` - Every class index of the batch, example after example.
    /// * `lengths` - The amount of labels of each example.
    ///
    /// # Returns
    /// An error if the lengths don't add up to the amount of values.
    pub fn new(values: Vec<u32>, lengths: Vec<usize>) -> Result<Self> {
        let total: usize = lengths.iter().sum();

        if total != values.len() {
            return Err(BrainErr::SizeMismatch {
                what: "label values",
                got: values.len(),
                expected: total,
            });
        }

        Ok(Self { values, lengths })
    }

    /// Concatenates one label sequence per example.
    pub fn from_sequences<I, S>(sequences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u32]>,
    {
        let mut labels = Self::default();

        for seq in sequences {
            let seq = seq.as_ref();
            labels.values.extend_from_slice(seq);
            labels.lengths.push(seq.len());
        }

        labels
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn values(&self) -> &[u32] {
        &self.values
    }

    /// Iterates over the label sequence of each example.
    pub fn iter(&self) -> impl Iterator<Item = &[u32]> + '_ {
        self.lengths.iter().scan(0, |offset, &len| {
            let start = *offset;
            *offset += len;
            Some(&self.values[start..start + len])
        })
    }

    /// Returns the label sequence of the `i`-th example.
    pub fn sequence(&self, i: usize) -> Option<&[u32]> {
        self.iter().nth(i)
    }
}

/// Feature tensor (batch × time × channel) at the precision of the run.
#[derive(Debug, Clone, PartialEq)]
pub enum Features {
    Standard(Array3<f32>),
    Reduced(Array3<f16>),
}

impl Features {
    pub fn dim(&self) -> (usize, usize, usize) {
        match self {
            Features::Standard(x) => x.dim(),
            Features::Reduced(x) => x.dim(),
        }
    }

    /// Narrows the features to half precision.
    pub fn into_reduced(self) -> Self {
        match self {
            Features::Standard(x) => Features::Reduced(x.mapv(f16::from_f32)),
            reduced => reduced,
        }
    }

    /// Widens the features back to `f32`, borrowing when they are already there.
    pub fn to_standard(&self) -> Cow<'_, Array3<f32>> {
        match self {
            Features::Standard(x) => Cow::Borrowed(x),
            Features::Reduced(x) => Cow::Owned(x.mapv(f16::to_f32)),
        }
    }
}

/// A batch as produced by a `BatchSource`.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub features: Array3<f32>,
    pub labels: SparseLabels,
    pub seq_lens: Vec<usize>,
}

/// A validated batch ready for the model.
#[derive(Debug, Clone)]
pub struct Batch {
    pub features: Features,
    pub labels: SparseLabels,
    /// Time steps of each example before the stride reduction.
    pub seq_lens: Vec<usize>,
}

impl Batch {
    /// Creates a new `Batch` checking its invariants.
    ///
    /// # Returns
    /// An error if the amount of examples disagrees between features, labels and lengths or if a
    /// sequence length exceeds the time dimension.
    pub fn new(features: Features, labels: SparseLabels, seq_lens: Vec<usize>) -> Result<Self> {
        let (batch_size, time, _) = features.dim();

        if labels.len() != batch_size {
            return Err(BrainErr::SizeMismatch {
                what: "label sequences",
                got: labels.len(),
                expected: batch_size,
            });
        }

        if seq_lens.len() != batch_size {
            return Err(BrainErr::SizeMismatch {
                what: "sequence lengths",
                got: seq_lens.len(),
                expected: batch_size,
            });
        }

        if let Some((i, len)) = seq_lens.iter().enumerate().find(|(_, len)| **len > time) {
            return Err(BrainErr::InvalidInput(format!(
                "example {i} has length {len} but the batch only has {time} time steps"
            )));
        }

        Ok(Self {
            features,
            labels,
            seq_lens,
        })
    }

    pub fn len(&self) -> usize {
        self.seq_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq_lens.is_empty()
    }
}
