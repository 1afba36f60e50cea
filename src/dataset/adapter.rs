use std::path::PathBuf;

use log::trace;

use super::{Batch, BatchRequest, BatchSource, Features, Partition};
use crate::{
    BrainErr, Result,
    config::{Config, Patient, Precision},
};

/// Wraps a `BatchSource`, requesting fixed size batches for the configured patient and
/// narrowing their precision when the run asks for it.
pub struct InputAdapter<S: BatchSource> {
    source: S,
    patient: Patient,
    data_dir: PathBuf,
    batch_size: usize,
    precision: Precision,
}

impl<S: BatchSource> InputAdapter<S> {
    /// Creates a new `InputAdapter`.
    ///
    /// # Arguments
    /// * `config` - The run's configuration.
    /// * `source` - The source batches are read from.
    ///
    /// # Returns
    /// A configuration error if no data directory was supplied.
    pub fn new(config: &Config, source: S) -> Result<Self> {
        let Some(data_dir) = config.data_dir.clone() else {
            return Err(BrainErr::Config("please supply a data_dir".into()));
        };

        Ok(Self {
            source,
            patient: config.patient,
            data_dir,
            batch_size: config.total_batch_size(),
            precision: config.precision,
        })
    }

    /// Number of examples in every batch, across devices.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_channels(&self) -> usize {
        self.source.num_channels()
    }

    /// Reads the next batch of a partition.
    ///
    /// # Arguments
    /// * `partition` - The partition to read from.
    /// * `shuffle` - Whether the source should shuffle the partition.
    ///
    /// # Returns
    /// The batch or an error if the source failed or produced an inconsistent batch.
    pub fn inputs(&mut self, partition: Partition, shuffle: bool) -> Result<Batch> {
        let request = BatchRequest {
            patient: self.patient,
            partition,
            data_dir: &self.data_dir,
            batch_size: self.batch_size,
            shuffle,
        };

        let raw = self.source.read(&request)?;
        let got = raw.features.dim();

        if got.0 != self.batch_size {
            return Err(BrainErr::SizeMismatch {
                what: "batch",
                got: got.0,
                expected: self.batch_size,
            });
        }

        if got.2 != self.source.num_channels() {
            return Err(BrainErr::SizeMismatch {
                what: "feature channels",
                got: got.2,
                expected: self.source.num_channels(),
            });
        }

        let mut features = Features::Standard(raw.features);
        if self.precision.is_reduced() {
            features = features.into_reduced();
        }

        trace!("{partition:?} batch of shape {got:?}");
        Batch::new(features, raw.labels, raw.seq_lens)
    }
}
