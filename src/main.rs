use std::env;

use anyhow::Result;
use deep_brain::{
    arch::loss::LossEngine,
    config::{Config, ParamRecord},
    dataset::{InMemorySource, InputAdapter, Partition, SyntheticSpec},
    training::TrainerBuilder,
};
use log::{info, warn};
use rand::{SeedableRng, rngs::StdRng};

const CONFIG_VAR: &str = "DEEPBRAIN_CONFIG";

/// Shape of the stand-in recordings used until a record reader is plugged in.
const SYNTHETIC_CHANNELS: usize = 16;
const SYNTHETIC_MAX_TIME: usize = 64;
const SYNTHETIC_MAX_LABELS: usize = 5;

fn load_config() -> Result<Config> {
    let config = match env::var(CONFIG_VAR) {
        Ok(path) => {
            info!("reading configuration from {path}");
            Config::from_file(path)?
        }
        Err(_) => {
            info!("{CONFIG_VAR} not set, using the default configuration");
            Config::default()
        }
    };

    Ok(config.resolve()?)
}

fn main() -> Result<()> {
    env_logger::init();

    let config = load_config()?;
    ParamRecord::from(&config).save(&config.train_dir)?;
    info!("parameter record written to {}", config.train_dir.display());
    info!(
        "patient {}: {} training and {} evaluation examples per epoch",
        config.patient.id(),
        config.patient.train_examples(),
        config.patient.eval_examples()
    );

    warn!("no record reader available, training on synthetic recordings");
    let spec = SyntheticSpec {
        num_channels: SYNTHETIC_CHANNELS,
        max_time: SYNTHETIC_MAX_TIME,
        num_classes: config.num_classes,
        max_labels: SYNTHETIC_MAX_LABELS,
        examples_per_partition: 4 * config.total_batch_size(),
    };
    let rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let source = InMemorySource::synthetic(spec, rng)?;
    let mut inputs = InputAdapter::new(&config, source)?;

    let mut trainer = TrainerBuilder::new().build(&config, inputs.num_channels())?;

    let mut last = None;
    for _ in 0..config.max_steps {
        let batch = inputs.inputs(Partition::Train, config.shuffle)?;
        let summary = trainer.step(&batch)?;

        if summary.step % config.log_every.get() as u64 == 0 {
            info!("{summary}");
        }
        last = Some(summary);
    }

    if let Some(ctc) = last.as_ref().and_then(|s| s.loss(LossEngine::CTC_TERM)) {
        info!("smoothed {} after training: {:.4}", ctc.name, ctc.smoothed);
    }

    let batch = inputs.inputs(Partition::Validation, false)?;
    let report = trainer.evaluate(&batch)?;
    info!(
        "validation loss after {} steps: {:.4}",
        trainer.global_step(),
        report.total
    );

    Ok(())
}
