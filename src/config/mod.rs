mod patient;
mod record;

use std::{fs, num::NonZeroUsize, path::{Path, PathBuf}};

use half::f16;
use log::info;
use ndarray::{Array, Dimension};
use serde::{Deserialize, Serialize};

pub use patient::Patient;
pub use record::{PARAMS_FILE_NAME, ParamRecord};

use crate::{BrainErr, Result};

/// The kind of recurrent cell used by every layer of the sequence encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CellKind {
    /// A gated memory cell.
    #[default]
    #[serde(rename = "LSTM")]
    Lstm,
    /// A gated memory cell with layer normalization on its gates and cell state.
    #[serde(rename = "CustomRNN")]
    LayerNormLstm,
}

/// The direction(s) in which the sequence encoder walks the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    #[serde(rename = "uni-dir")]
    Unidirectional,
    #[serde(rename = "bi-dir")]
    Bidirectional,
}

/// Numeric precision for the features and layer activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Standard,
    /// Half precision: values are rounded through `f16`.
    Reduced,
}

impl Precision {
    pub fn is_reduced(&self) -> bool {
        matches!(self, Precision::Reduced)
    }

    /// Rounds every element of `a` to the nearest value representable in this precision.
    pub fn quantize<D: Dimension>(&self, a: &mut Array<f32, D>) {
        if self.is_reduced() {
            a.mapv_inplace(|x| f16::from_f32(x).to_f32());
        }
    }
}

/// The hyperparameters of a run. Resolved once at startup and passed by reference to every
/// component afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub patient: Patient,
    /// Where checkpoints and the parameter record are written.
    pub train_dir: PathBuf,
    /// Where the record files live.
    pub data_dir: Option<PathBuf>,
    pub num_devices: NonZeroUsize,
    pub max_steps: usize,
    /// Examples per device in a batch.
    pub batch_size: NonZeroUsize,
    pub temporal_stride: NonZeroUsize,
    pub shuffle: bool,
    pub precision: Precision,
    pub keep_prob: f32,
    pub num_hidden: usize,
    pub num_conv_layers: usize,
    pub num_rnn_layers: usize,
    /// A checkpoint directory whose parameter record overrides the architecture.
    pub checkpoint: Option<PathBuf>,
    pub cell_kind: CellKind,
    pub direction: Direction,
    pub initial_lr: f32,
    pub num_filters: usize,
    pub moving_avg_decay: f32,
    pub num_epochs_per_decay: f32,
    pub lr_decay_factor: f32,
    /// L2 penalty for the convolution and projection weights, `None` disables it.
    pub weight_decay: Option<f32>,
    /// Number of output classes, the last one being the blank symbol.
    pub num_classes: usize,
    pub seed: Option<u64>,
    /// Steps between two logged summaries.
    pub log_every: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            patient: Patient::default(),
            train_dir: PathBuf::from("models/train"),
            data_dir: Some(PathBuf::from("data/records")),
            num_devices: NonZeroUsize::MIN,
            max_steps: 1000,
            batch_size: NonZeroUsize::new(2).unwrap_or(NonZeroUsize::MIN),
            temporal_stride: NonZeroUsize::new(2).unwrap_or(NonZeroUsize::MIN),
            shuffle: true,
            precision: Precision::Standard,
            keep_prob: 0.5,
            num_hidden: 2048,
            num_conv_layers: 1,
            num_rnn_layers: 1,
            checkpoint: None,
            cell_kind: CellKind::Lstm,
            direction: Direction::Unidirectional,
            initial_lr: 1e-5,
            num_filters: 64,
            moving_avg_decay: 0.9999,
            num_epochs_per_decay: 5.,
            lr_decay_factor: 0.9,
            weight_decay: None,
            num_classes: 40,
            seed: None,
            log_every: NonZeroUsize::new(10).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl Config {
    /// Reads a configuration from a json file, missing fields take their default value.
    ///
    /// # Arguments
    /// * `path` - The path to the json file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Applies the parameter record of the configured checkpoint (if any) and validates the
    /// result. This is the last step before the configuration gets frozen for the run.
    ///
    /// # Returns
    /// The resolved configuration or the first error found.
    pub fn resolve(self) -> Result<Self> {
        let config = match &self.checkpoint {
            Some(dir) => {
                let record = ParamRecord::load(dir)?;
                info!("overriding architecture from {}", dir.display());
                self.with_record(&record)
            }
            None => self,
        };

        config.validate()?;
        Ok(config)
    }

    /// Overrides the architecture-affecting fields with the ones of a persisted record.
    pub fn with_record(self, record: &ParamRecord) -> Self {
        Self {
            num_hidden: record.num_hidden,
            num_rnn_layers: record.num_rnn_layers,
            direction: record.rnn_type,
            num_filters: record.num_filters,
            precision: if record.use_fp16 {
                Precision::Reduced
            } else {
                Precision::Standard
            },
            temporal_stride: record.temporal_stride,
            initial_lr: record.initial_lr,
            ..self
        }
    }

    /// Checks that every hyperparameter is within its domain.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(BrainErr::Config(msg.to_string()));

        if !(self.keep_prob > 0. && self.keep_prob <= 1.) {
            return fail("keep_prob must be in (0, 1]");
        }
        if self.num_hidden == 0 {
            return fail("num_hidden must be greater than 0");
        }
        if self.num_conv_layers == 0 {
            return fail("at least one convolutional layer is required");
        }
        if self.num_rnn_layers == 0 {
            return fail("at least one recurrent layer is required");
        }
        if self.num_filters == 0 {
            return fail("num_filters must be greater than 0");
        }
        if self.num_classes < 2 {
            return fail("num_classes must account for at least one label and the blank");
        }
        if !(self.initial_lr > 0.) {
            return fail("initial_lr must be positive");
        }
        if !(self.lr_decay_factor > 0.) {
            return fail("lr_decay_factor must be positive");
        }
        if !(0. ..=1.).contains(&self.moving_avg_decay) {
            return fail("moving_avg_decay must be in [0, 1]");
        }
        if matches!(self.weight_decay, Some(wd) if wd < 0.) {
            return fail("weight_decay can't be negative");
        }

        self.decay_steps().map(|_| ())
    }

    /// Number of examples per optimization step across every device.
    pub fn total_batch_size(&self) -> usize {
        self.batch_size.get() * self.num_devices.get()
    }

    /// Number of steps between two learning rate decays.
    ///
    /// # Returns
    /// A configuration error if the schedule would decay on every fraction of a step.
    pub fn decay_steps(&self) -> Result<usize> {
        let batches_per_epoch = self.patient.train_examples() as f32 / self.batch_size.get() as f32;
        let steps = (batches_per_epoch * self.num_epochs_per_decay) as usize;

        if steps == 0 {
            return Err(BrainErr::Config(format!(
                "{} epochs per decay yields no decay steps",
                self.num_epochs_per_decay
            )));
        }

        Ok(steps)
    }

    /// The blank symbol of the alignment loss.
    pub fn blank(&self) -> usize {
        self.num_classes - 1
    }
}
