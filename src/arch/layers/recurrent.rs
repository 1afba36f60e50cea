use ndarray::{Array2, Array3, ArrayView3, Axis, s};
use rand::Rng;

use super::{
    Dropout,
    cells::{Cell, CellCache, CellState},
};
use crate::{
    BrainErr, Result,
    arch::params::ParamRegistry,
    config::{Config, Direction, Precision},
};

/// Sequence lengths after the feature extractor: divided by the stride and clamped to the frames
/// actually produced.
///
/// # Arguments
/// * `seq_lens` - The lengths of the raw sequences.
/// * `stride` - The temporal stride.
/// * `frames` - The time dimension of the feature extractor's output.
pub fn adjusted_lengths(seq_lens: &[usize], stride: usize, frames: usize) -> Vec<usize> {
    seq_lens
        .iter()
        .map(|len| (len / stride).min(frames))
        .collect()
}

/// Reverses every sequence of a time-major batch within its own length. Steps past the length
/// are zeroed, which makes the operation its own inverse on valid steps.
pub fn reverse_sequences(x: ArrayView3<f32>, lens: &[usize]) -> Array3<f32> {
    let steps = x.dim().0;
    let mut out = Array3::zeros(x.raw_dim());

    for (b, &len) in lens.iter().enumerate() {
        let len = len.min(steps);
        out.slice_mut(s![..len, b, ..])
            .assign(&x.slice(s![..len;-1, b, ..]));
    }

    out
}

/// A recurrent cell unrolled over time, with output dropout. Steps at or past an example's
/// length output zero and carry the state unchanged.
#[derive(Debug, Clone)]
pub struct RecurrentLayer {
    cell: Cell,
    dropout: Dropout,
    precision: Precision,

    // Forward metadata
    input: usize,
    caches: Vec<CellCache>,
    live: Array2<f32>,
    mask: Option<Array3<f32>>,
}

impl RecurrentLayer {
    pub fn new(cell: Cell, dropout: Dropout, precision: Precision) -> Self {
        Self {
            cell,
            dropout,
            precision,
            input: 0,
            caches: Vec::new(),
            live: Array2::zeros((0, 0)),
            mask: None,
        }
    }

    pub fn hidden(&self) -> usize {
        self.cell.hidden()
    }

    /// Runs the cell over every step.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `x` - The input, time × batch × features.
    /// * `lens` - The length of each example.
    /// * `rng` - The random number generator for dropout.
    ///
    /// # Returns
    /// The outputs, time × batch × hidden.
    pub fn forward<R: Rng>(
        &mut self,
        params: &[f32],
        x: ArrayView3<f32>,
        lens: &[usize],
        rng: &mut R,
    ) -> Result<Array3<f32>> {
        let (steps, batch, input) = x.dim();
        if lens.len() != batch {
            return Err(BrainErr::SizeMismatch {
                what: "sequence lengths",
                got: lens.len(),
                expected: batch,
            });
        }

        let hidden = self.hidden();
        let live =
            Array2::from_shape_fn((steps, batch), |(t, b)| if t < lens[b] { 1. } else { 0. });

        let mut state = CellState::zeros(batch, hidden);
        let mut out = Array3::zeros((steps, batch, hidden));
        self.caches.clear();

        for t in 0..steps {
            let (next, cache) = self.cell.step(params, x.index_axis(Axis(0), t), &state)?;

            let m = live.row(t).insert_axis(Axis(1));
            let keep = m.mapv(|m| 1. - m);

            out.index_axis_mut(Axis(0), t).assign(&(&next.h * &m));
            state = CellState {
                h: &next.h * &m + &state.h * &keep,
                c: &next.c * &m + &state.c * &keep,
            };
            self.caches.push(cache);
        }

        self.mask = self.dropout.mask(out.raw_dim(), rng)?;
        if let Some(mask) = &self.mask {
            out *= mask;
        }

        self.precision.quantize(&mut out);

        self.input = input;
        self.live = live;
        Ok(out)
    }

    /// Backpropagates through time, accumulating the cell's gradients into `grad`.
    ///
    /// # Returns
    /// The gradient with respect to the layer's input.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        mut d: Array3<f32>,
    ) -> Result<Array3<f32>> {
        let (steps, batch, _) = d.dim();
        if steps != self.caches.len() {
            return Err(BrainErr::SizeMismatch {
                what: "recurrent output gradient steps",
                got: steps,
                expected: self.caches.len(),
            });
        }

        if let Some(mask) = &self.mask {
            d *= mask;
        }

        let hidden = self.hidden();
        let mut dh_next = Array2::zeros((batch, hidden));
        let mut dc_next = Array2::zeros((batch, hidden));
        let mut dx = Array3::zeros((steps, batch, self.input));

        for t in (0..steps).rev() {
            let m = self.live.row(t).insert_axis(Axis(1));
            let keep = m.mapv(|m| 1. - m);

            let dh = (&d.index_axis(Axis(0), t) + &dh_next) * &m;
            let dc = &dc_next * &m;

            let grads = self.cell.step_backward(
                params,
                grad,
                &self.caches[t],
                dh.view(),
                dc.view(),
            )?;

            dx.index_axis_mut(Axis(0), t).assign(&grads.dx);
            dh_next = grads.dh + &dh_next * &keep;
            dc_next = grads.dc + &dc_next * &keep;
        }

        Ok(dx)
    }
}

/// Recurrent layers applied one after the other, each with its own parameters.
#[derive(Debug, Clone)]
pub struct RecurrentStack {
    layers: Vec<RecurrentLayer>,
}

impl RecurrentStack {
    /// Creates `num_rnn_layers` layers of the configured cell kind.
    ///
    /// # Arguments
    /// * `registry` - Where the layers' tensors are allocated.
    /// * `scope` - The name prefix of the stack's tensors.
    /// * `input` - The width of the first layer's input.
    /// * `config` - Provides the layer count, cell kind, width, keep probability and precision.
    pub fn new(registry: &mut ParamRegistry, scope: &str, input: usize, config: &Config) -> Self {
        let layers = (0..config.num_rnn_layers)
            .map(|i| {
                let width = if i == 0 { input } else { config.num_hidden };
                let cell = Cell::new(
                    config.cell_kind,
                    registry,
                    &format!("{scope}/cell_{i}"),
                    width,
                    config.num_hidden,
                );

                RecurrentLayer::new(cell, Dropout::new(config.keep_prob), config.precision)
            })
            .collect();

        Self { layers }
    }

    pub fn forward<R: Rng>(
        &mut self,
        params: &[f32],
        x: ArrayView3<f32>,
        lens: &[usize],
        rng: &mut R,
    ) -> Result<Array3<f32>> {
        let mut h = x.to_owned();

        for layer in &mut self.layers {
            h = layer.forward(params, h.view(), lens, rng)?;
        }

        Ok(h)
    }

    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        mut d: Array3<f32>,
    ) -> Result<Array3<f32>> {
        for layer in self.layers.iter().rev() {
            d = layer.backward(params, grad, d)?;
        }

        Ok(d)
    }
}

/// Runs recurrent stacks over a time-major batch in one or both directions.
#[derive(Debug, Clone)]
pub enum SequenceEncoder {
    Unidirectional(RecurrentStack),
    /// The backward stack reads every sequence reversed within its length, its outputs are
    /// reversed back and summed with the forward ones.
    Bidirectional {
        fw: RecurrentStack,
        bw: RecurrentStack,
        lens: Vec<usize>,
    },
}

impl SequenceEncoder {
    pub fn new(registry: &mut ParamRegistry, input: usize, config: &Config) -> Self {
        match config.direction {
            Direction::Unidirectional => {
                Self::Unidirectional(RecurrentStack::new(registry, "rnn", input, config))
            }
            Direction::Bidirectional => Self::Bidirectional {
                fw: RecurrentStack::new(registry, "rnn/fw", input, config),
                bw: RecurrentStack::new(registry, "rnn/bw", input, config),
                lens: Vec::new(),
            },
        }
    }

    /// Encodes a batch.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `x` - The input, time × batch × features.
    /// * `lens` - The adjusted length of each example.
    /// * `rng` - The random number generator for dropout.
    ///
    /// # Returns
    /// The outputs, time × batch × hidden.
    pub fn forward<R: Rng>(
        &mut self,
        params: &[f32],
        x: ArrayView3<f32>,
        lens: &[usize],
        rng: &mut R,
    ) -> Result<Array3<f32>> {
        match self {
            Self::Unidirectional(stack) => stack.forward(params, x, lens, rng),
            Self::Bidirectional {
                fw,
                bw,
                lens: cached,
            } => {
                let out_fw = fw.forward(params, x, lens, rng)?;

                let reversed = reverse_sequences(x, lens);
                let out_bw = bw.forward(params, reversed.view(), lens, rng)?;

                *cached = lens.to_vec();
                Ok(out_fw + reverse_sequences(out_bw.view(), lens))
            }
        }
    }

    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        d: Array3<f32>,
    ) -> Result<Array3<f32>> {
        match self {
            Self::Unidirectional(stack) => stack.backward(params, grad, d),
            Self::Bidirectional { fw, bw, lens } => {
                let dx_bw = bw.backward(params, grad, reverse_sequences(d.view(), lens))?;
                let dx_fw = fw.backward(params, grad, d)?;

                Ok(dx_fw + reverse_sequences(dx_bw.view(), lens))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;
    use ndarray_rand::{RandomExt, rand_distr::Uniform};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::arch::{activations::ActFn, layers::cells::LstmCell};

    fn random_input(shape: (usize, usize, usize), seed: u64) -> Array3<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array::random_using(shape, Uniform::new(-1f32, 1.).unwrap(), &mut rng)
    }

    fn encoder_config(direction: Direction) -> Config {
        Config {
            num_hidden: 3,
            num_rnn_layers: 2,
            keep_prob: 1.,
            direction,
            ..Config::default()
        }
    }

    #[test]
    fn lengths_are_divided_by_the_stride() {
        assert_eq!(adjusted_lengths(&[10, 7, 3, 1], 2, 4), [4, 3, 1, 0]);
        assert_eq!(adjusted_lengths(&[9], 3, 5), [3]);
    }

    #[test]
    fn sequences_reverse_within_their_length() {
        let x = Array3::from_shape_fn((4, 2, 1), |(t, b, _)| (10 * b + t + 1) as f32);
        let r = reverse_sequences(x.view(), &[4, 2]);

        assert_eq!(r.slice(s![.., 0, 0]).to_vec(), [4., 3., 2., 1.]);
        assert_eq!(r.slice(s![.., 1, 0]).to_vec(), [12., 11., 0., 0.]);
    }

    #[test]
    fn padded_steps_output_zero_and_change_nothing() {
        let config = encoder_config(Direction::Bidirectional);
        let mut registry = ParamRegistry::new();
        let mut encoder = SequenceEncoder::new(&mut registry, 2, &config);

        let mut rng = StdRng::seed_from_u64(0);
        let params = registry.initialize(&mut rng).unwrap();
        let lens = [5, 3];

        let x = random_input((5, 2, 2), 1);
        let out = encoder.forward(&params, x.view(), &lens, &mut rng).unwrap();
        assert!(out.slice(s![3.., 1, ..]).iter().all(|&h| h == 0.));

        let mut noisy = x.clone();
        noisy.slice_mut(s![3.., 1, ..]).fill(42.);
        let noisy_out = encoder.forward(&params, noisy.view(), &lens, &mut rng).unwrap();
        assert_eq!(out, noisy_out);
    }

    #[test]
    fn bidirectional_sums_forward_and_reversed_passes() {
        let mut registry = ParamRegistry::new();
        let mut bi =
            SequenceEncoder::new(&mut registry, 2, &encoder_config(Direction::Bidirectional));
        let mut params = registry.initialize(&mut StdRng::seed_from_u64(2)).unwrap();

        let half = params.len() / 2;
        let (fw, bw) = params.split_at_mut(half);
        bw.copy_from_slice(fw);

        let mut registry = ParamRegistry::new();
        let mut uni =
            SequenceEncoder::new(&mut registry, 2, &encoder_config(Direction::Unidirectional));
        assert_eq!(registry.size(), half);

        let mut rng = StdRng::seed_from_u64(0);
        let lens = [6, 4];
        let x = random_input((6, 2, 2), 3);

        let both = bi.forward(&params, x.view(), &lens, &mut rng).unwrap();
        let forward = uni.forward(&params[..half], x.view(), &lens, &mut rng).unwrap();
        let reversed = reverse_sequences(x.view(), &lens);
        let backward = uni.forward(&params[..half], reversed.view(), &lens, &mut rng).unwrap();

        let expected = forward + reverse_sequences(backward.view(), &lens);
        for (a, b) in both.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn backpropagation_through_time_matches_finite_differences() {
        let mut registry = ParamRegistry::new();
        let cell = Cell::Lstm(LstmCell::with_act_fn(&mut registry, "cell", 2, 2, ActFn::sigmoid()));
        let mut layer = RecurrentLayer::new(cell, Dropout::new(1.), Precision::Standard);

        let mut rng = StdRng::seed_from_u64(4);
        let mut params = registry.initialize(&mut rng).unwrap();
        let lens = [4, 2];
        let x = random_input((4, 2, 2), 5);
        let weights = random_input((4, 2, 2), 6);

        let mut objective = |params: &[f32], x: &Array3<f32>| -> f32 {
            let out = layer.forward(params, x.view(), &lens, &mut rng).unwrap();
            (out * &weights).sum()
        };

        let base = objective(&params, &x);
        assert!(base.is_finite());

        let eps = 1e-2;
        let mut numeric_params = vec![0.; params.len()];
        for i in 0..params.len() {
            let w = params[i];
            params[i] = w + eps;
            let up = objective(&params, &x);
            params[i] = w - eps;
            let down = objective(&params, &x);
            params[i] = w;
            numeric_params[i] = (up - down) / (2. * eps);
        }

        let mut numeric_x = Array3::zeros(x.raw_dim());
        for (idx, v) in x.indexed_iter() {
            let mut shifted = x.clone();
            shifted[idx] = v + eps;
            let up = objective(&params, &shifted);
            shifted[idx] = v - eps;
            let down = objective(&params, &shifted);
            numeric_x[idx] = (up - down) / (2. * eps);
        }

        objective(&params, &x);
        let mut grad = vec![0.; params.len()];
        let dx = layer.backward(&params, &mut grad, weights.clone()).unwrap();

        let close = |n: f32, a: f32| (n - a).abs() <= 1e-2 + 0.05 * n.abs();
        for (n, a) in numeric_params.iter().zip(&grad) {
            assert!(close(*n, *a), "{n} != {a}");
        }
        for (n, a) in numeric_x.iter().zip(&dx) {
            assert!(close(*n, *a), "{n} != {a}");
        }
        assert!(dx.slice(s![2.., 1, ..]).iter().all(|&d| d == 0.));
    }
}
