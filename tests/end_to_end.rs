use std::num::NonZeroUsize;

use deep_brain::{
    BrainErr,
    config::{CellKind, Config, Direction},
    dataset::{
        Batch, Features, InMemorySource, InputAdapter, Partition, SparseLabels, SyntheticSpec,
    },
    training::TrainerBuilder,
};
use ndarray::Array3;
use rand::{SeedableRng, rngs::StdRng};

const CHANNELS: usize = 3;

fn config() -> Config {
    Config {
        num_conv_layers: 1,
        num_rnn_layers: 1,
        direction: Direction::Unidirectional,
        num_hidden: 4,
        num_filters: 2,
        num_classes: 5,
        keep_prob: 1.,
        initial_lr: 1e-2,
        temporal_stride: NonZeroUsize::new(2).unwrap(),
        seed: Some(11),
        ..Config::default()
    }
}

fn features() -> Features {
    Features::Standard(Array3::from_shape_fn((2, 10, CHANNELS), |(b, t, c)| {
        (0.7 * t as f32 + 1.3 * c as f32 + b as f32).cos()
    }))
}

fn batch() -> Batch {
    let labels = SparseLabels::from_sequences([vec![0u32, 1, 2], vec![3, 1]]);
    Batch::new(features(), labels, vec![10, 6]).unwrap()
}

#[test]
fn small_model_has_a_finite_loss() {
    let mut trainer = TrainerBuilder::new().build(&config(), CHANNELS).unwrap();
    let summary = trainer.step(&batch()).unwrap();

    assert!(summary.total.raw.is_finite());
    assert!(summary.total.raw > 0.);
    assert_eq!(trainer.global_step(), 1);
}

#[test]
fn labels_longer_than_the_strided_frames_are_rejected() {
    let mut trainer = TrainerBuilder::new().build(&config(), CHANNELS).unwrap();

    let long: Vec<u32> = (0..12).map(|i| i % 4).collect();
    let labels = SparseLabels::from_sequences([long, vec![1]]);
    let batch = Batch::new(features(), labels, vec![10, 6]).unwrap();

    assert!(matches!(
        trainer.step(&batch),
        Err(BrainErr::LabelTooLong {
            example: 0,
            required: 12,
            frames: 5
        })
    ));
}

#[test]
fn repeated_steps_reduce_the_loss() {
    let mut trainer = TrainerBuilder::new().build(&config(), CHANNELS).unwrap();
    let batch = batch();

    let first = trainer.step(&batch).unwrap();
    let mut last = first.clone();
    for _ in 1..30 {
        last = trainer.step(&batch).unwrap();
    }

    assert_eq!(last.step, 30);
    assert!(
        last.total.raw < first.total.raw,
        "{} did not improve on {}",
        last.total.raw,
        first.total.raw
    );
}

#[test]
fn every_architecture_trains_on_synthetic_batches() {
    let variants = [
        (CellKind::Lstm, Direction::Bidirectional),
        (CellKind::LayerNormLstm, Direction::Unidirectional),
        (CellKind::LayerNormLstm, Direction::Bidirectional),
    ];

    for (cell_kind, direction) in variants {
        let config = Config {
            cell_kind,
            direction,
            num_conv_layers: 2,
            num_rnn_layers: 2,
            keep_prob: 0.8,
            weight_decay: Some(1e-4),
            ..config()
        };

        let spec = SyntheticSpec {
            num_channels: CHANNELS,
            max_time: 24,
            num_classes: config.num_classes,
            max_labels: 2,
            examples_per_partition: 4,
        };
        let source = InMemorySource::synthetic(spec, StdRng::seed_from_u64(3)).unwrap();
        let mut inputs = InputAdapter::new(&config, source).unwrap();
        let mut trainer = TrainerBuilder::new().build(&config, inputs.num_channels()).unwrap();

        for _ in 0..3 {
            let batch = inputs.inputs(Partition::Train, true).unwrap();
            let summary = trainer.step(&batch).unwrap();
            assert!(summary.total.raw.is_finite());
            assert_eq!(summary.losses.len(), 4);
        }

        let batch = inputs.inputs(Partition::Validation, false).unwrap();
        assert!(trainer.evaluate(&batch).unwrap().total.is_finite());
    }
}
