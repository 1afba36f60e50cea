use std::{fs, num::NonZeroUsize, path::Path};

use serde::{Deserialize, Serialize};

use super::{Config, Direction};
use crate::Result;

/// File name of the parameter record inside a checkpoint directory.
pub const PARAMS_FILE_NAME: &str = "deepBrain_parameters.json";

/// The architecture a checkpoint was trained with. Restoring a checkpoint requires building the
/// exact same model, so these fields take precedence over the run's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamRecord {
    pub num_hidden: usize,
    pub num_rnn_layers: usize,
    pub rnn_type: Direction,
    pub num_filters: usize,
    pub use_fp16: bool,
    pub temporal_stride: NonZeroUsize,
    pub initial_lr: f32,
}

impl ParamRecord {
    /// Reads the record stored in a checkpoint directory.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let raw = fs::read_to_string(dir.as_ref().join(PARAMS_FILE_NAME))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Writes this record in `dir`, creating the directory if needed.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        fs::write(dir.join(PARAMS_FILE_NAME), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl From<&Config> for ParamRecord {
    fn from(config: &Config) -> Self {
        Self {
            num_hidden: config.num_hidden,
            num_rnn_layers: config.num_rnn_layers,
            rnn_type: config.direction,
            num_filters: config.num_filters,
            use_fp16: config.precision.is_reduced(),
            temporal_stride: config.temporal_stride,
            initial_lr: config.initial_lr,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;

    #[test]
    fn parses_the_persisted_format() {
        let raw = r#"{
            "num_hidden": 1024,
            "num_rnn_layers": 2,
            "rnn_type": "bi-dir",
            "num_filters": 32,
            "use_fp16": false,
            "temporal_stride": 4,
            "initial_lr": 0.001
        }"#;

        let record: ParamRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.num_hidden, 1024);
        assert_eq!(record.rnn_type, Direction::Bidirectional);
        assert_eq!(record.temporal_stride.get(), 4);
    }

    #[test]
    fn save_then_resolve_overrides_config() {
        let dir = env::temp_dir().join(format!("deep_brain_record_{}", std::process::id()));
        let record = ParamRecord {
            num_hidden: 16,
            ..ParamRecord::from(&Config::default())
        };
        record.save(&dir).unwrap();

        let config = Config {
            checkpoint: Some(dir.clone()),
            ..Config::default()
        }
        .resolve()
        .unwrap();

        assert_eq!(config.num_hidden, 16);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_record_is_an_io_error() {
        let config = Config {
            checkpoint: Some(env::temp_dir().join("deep_brain_missing_checkpoint")),
            ..Config::default()
        };

        assert!(matches!(config.resolve(), Err(crate::BrainErr::Io(_))));
    }
}
