use std::{collections::HashMap, path::Path};

use log::debug;
use ndarray::{Array2, Array3, s};
use ndarray_rand::{RandomExt, rand_distr::StandardNormal};
use rand::{Rng, seq::SliceRandom};

use super::{Partition, RawBatch, SparseLabels};
use crate::{BrainErr, Result, config::Patient};

/// What a `BatchSource` is asked to produce.
#[derive(Debug, Clone, Copy)]
pub struct BatchRequest<'a> {
    pub patient: Patient,
    pub partition: Partition,
    pub data_dir: &'a Path,
    pub batch_size: usize,
    pub shuffle: bool,
}

/// Produces batches of recordings, usually by reading record files from `data_dir`.
pub trait BatchSource {
    /// Number of signal channels of every example.
    fn num_channels(&self) -> usize;

    /// Reads the next batch of the requested partition, advancing the source's iteration state.
    fn read(&mut self, request: &BatchRequest<'_>) -> Result<RawBatch>;
}

/// A single recording: time × channel features and its label sequence.
#[derive(Debug, Clone)]
pub struct Example {
    pub features: Array2<f32>,
    pub labels: Vec<u32>,
}

#[derive(Debug, Default)]
struct Split {
    examples: Vec<Example>,
    order: Vec<usize>,
    cursor: usize,
}

/// Shape of the random examples generated by `InMemorySource::synthetic`.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticSpec {
    pub num_channels: usize,
    pub max_time: usize,
    /// Includes the blank, which is never emitted as a label.
    pub num_classes: usize,
    pub max_labels: usize,
    pub examples_per_partition: usize,
}

/// A `BatchSource` over examples held in memory. Batches wrap around the partition and are
/// zero-padded to their longest example.
pub struct InMemorySource<R: Rng> {
    num_channels: usize,
    splits: HashMap<Partition, Split>,
    rng: R,
}

impl<R: Rng> InMemorySource<R> {
    /// Creates a new empty `InMemorySource`.
    ///
    /// # Arguments
    /// * `num_channels` - The amount of channels every example must have.
    /// * `rng` - The random number generator used for shuffling.
    pub fn new(num_channels: usize, rng: R) -> Self {
        Self {
            num_channels,
            splits: HashMap::new(),
            rng,
        }
    }

    /// Builds a source filled with random examples on every partition.
    pub fn synthetic(spec: SyntheticSpec, mut rng: R) -> Result<Self> {
        if spec.num_classes < 2 || spec.max_labels == 0 || spec.max_time == 0 {
            return Err(BrainErr::Config(format!(
                "can't generate synthetic examples from {spec:?}"
            )));
        }

        let mut examples = Vec::new();

        for partition in [Partition::Train, Partition::Validation, Partition::Test] {
            for _ in 0..spec.examples_per_partition {
                let time = rng.random_range(spec.max_time.div_ceil(2)..=spec.max_time);
                let features =
                    Array2::random_using((time, spec.num_channels), StandardNormal, &mut rng);
                let labels = random_labels(&mut rng, spec.num_classes - 1, spec.max_labels);
                examples.push((partition, Example { features, labels }));
            }
        }

        let mut source = Self::new(spec.num_channels, rng);
        for (partition, example) in examples {
            source.push(partition, example)?;
        }

        Ok(source)
    }

    /// Adds an example to a partition.
    ///
    /// # Returns
    /// An error if the example doesn't have the source's amount of channels.
    pub fn push(&mut self, partition: Partition, example: Example) -> Result<()> {
        if example.features.ncols() != self.num_channels {
            return Err(BrainErr::SizeMismatch {
                what: "example channels",
                got: example.features.ncols(),
                expected: self.num_channels,
            });
        }

        let split = self.splits.entry(partition).or_default();
        split.order.push(split.examples.len());
        split.examples.push(example);
        Ok(())
    }

    /// Number of examples in a partition.
    pub fn len(&self, partition: Partition) -> usize {
        self.splits
            .get(&partition)
            .map(|split| split.examples.len())
            .unwrap_or_default()
    }
}

impl<R: Rng> BatchSource for InMemorySource<R> {
    fn num_channels(&self) -> usize {
        self.num_channels
    }

    fn read(&mut self, request: &BatchRequest<'_>) -> Result<RawBatch> {
        let Some(split) = self
            .splits
            .get_mut(&request.partition)
            .filter(|split| !split.examples.is_empty())
        else {
            return Err(BrainErr::InvalidInput(format!(
                "there are no {:?} examples for patient {}",
                request.partition,
                request.patient.id()
            )));
        };

        let mut picked = Vec::with_capacity(request.batch_size);
        for _ in 0..request.batch_size {
            if split.cursor == split.order.len() {
                split.cursor = 0;
            }
            if split.cursor == 0 && request.shuffle {
                split.order.shuffle(&mut self.rng);
            }

            picked.push(&split.examples[split.order[split.cursor]]);
            split.cursor += 1;
        }

        let time = picked
            .iter()
            .map(|example| example.features.nrows())
            .max()
            .unwrap_or_default();

        let mut features = Array3::zeros((picked.len(), time, self.num_channels));
        for (i, example) in picked.iter().enumerate() {
            let len = example.features.nrows();
            features
                .slice_mut(s![i, ..len, ..])
                .assign(&example.features);
        }

        let labels = SparseLabels::from_sequences(picked.iter().map(|example| &example.labels));
        let seq_lens = picked
            .iter()
            .map(|example| example.features.nrows())
            .collect();

        debug!(
            "read {} {:?} examples padded to {time} steps",
            picked.len(),
            request.partition
        );

        Ok(RawBatch {
            features,
            labels,
            seq_lens,
        })
    }
}

/// Draws between 1 and `max_labels` labels below `blank`, never repeating a label twice in a row
/// so every sequence aligns within as many frames as it has labels.
fn random_labels<R: Rng>(rng: &mut R, blank: usize, max_labels: usize) -> Vec<u32> {
    let len = rng.random_range(1..=max_labels);
    let mut labels: Vec<u32> = Vec::with_capacity(len);

    while labels.len() < len {
        let label = rng.random_range(0..blank) as u32;
        if blank > 1 && labels.last() == Some(&label) {
            continue;
        }
        labels.push(label);
    }

    labels
}
