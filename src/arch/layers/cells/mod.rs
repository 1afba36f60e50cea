mod layer_norm_lstm;
mod lstm;

use ndarray::{Array2, ArrayView2, s};

pub use layer_norm_lstm::{LayerNormLstmCache, LayerNormLstmCell};
pub use lstm::{LstmCache, LstmCell};

use crate::{
    BrainErr, Result,
    arch::{
        activations::{ActFn, Sigmoid},
        params::ParamRegistry,
    },
    config::CellKind,
};

const FORGET_BIAS: f32 = 1.0;

/// Activated gates of a step: input, candidate, forget and output, batch × hidden each.
#[derive(Debug, Clone)]
struct Gates {
    i: Array2<f32>,
    j: Array2<f32>,
    f: Array2<f32>,
    o: Array2<f32>,
}

impl Gates {
    /// Activates the gate pre-activations `z`, batch × 4·hidden in gate order.
    fn new(z: ArrayView2<f32>, act_fn: ActFn) -> Self {
        let h = z.ncols() / 4;

        Self {
            i: z.slice(s![.., ..h]).mapv(|z| Sigmoid.f(z)),
            j: z.slice(s![.., h..2 * h]).mapv(|z| act_fn.f(z)),
            f: z.slice(s![.., 2 * h..3 * h]).mapv(|z| Sigmoid.f(z + FORGET_BIAS)),
            o: z.slice(s![.., 3 * h..]).mapv(|z| Sigmoid.f(z)),
        }
    }

    /// New memory given the previous one.
    fn memory(&self, c_prev: &Array2<f32>) -> Array2<f32> {
        &self.f * c_prev + &self.i * &self.j
    }

    /// Gradient with respect to the pre-activations `z`.
    ///
    /// # Arguments
    /// * `z` - The pre-activations the gates were built from.
    /// * `act_fn` - The candidate activation.
    /// * `dc` - The gradient with respect to the new memory.
    /// * `c_prev` - The previous memory.
    /// * `d_o` - The gradient with respect to the output gate.
    fn backward(
        &self,
        z: ArrayView2<f32>,
        act_fn: ActFn,
        dc: &Array2<f32>,
        c_prev: &Array2<f32>,
        d_o: &Array2<f32>,
    ) -> Array2<f32> {
        let h = z.ncols() / 4;
        let logistic = |a: &Array2<f32>| a.mapv(|a| a * (1. - a));

        let mut dz = Array2::zeros(z.raw_dim());
        dz.slice_mut(s![.., ..h])
            .assign(&(dc * &self.j * logistic(&self.i)));
        dz.slice_mut(s![.., h..2 * h]).assign(
            &(dc * &self.i * z.slice(s![.., h..2 * h]).mapv(|z| act_fn.df(z))),
        );
        dz.slice_mut(s![.., 2 * h..3 * h])
            .assign(&(dc * c_prev * logistic(&self.f)));
        dz.slice_mut(s![.., 3 * h..])
            .assign(&(d_o * logistic(&self.o)));

        dz
    }
}

/// Hidden output and memory of a cell, batch × hidden each.
#[derive(Debug, Clone, PartialEq)]
pub struct CellState {
    pub h: Array2<f32>,
    pub c: Array2<f32>,
}

impl CellState {
    pub fn zeros(batch: usize, hidden: usize) -> Self {
        Self {
            h: Array2::zeros((batch, hidden)),
            c: Array2::zeros((batch, hidden)),
        }
    }
}

/// What a step keeps around for its backward pass.
#[derive(Debug, Clone)]
pub enum CellCache {
    Lstm(LstmCache),
    LayerNormLstm(LayerNormLstmCache),
}

/// Gradients flowing out of a step.
#[derive(Debug, Clone)]
pub struct CellGrads {
    /// With respect to the step's input.
    pub dx: Array2<f32>,
    /// With respect to the previous hidden output.
    pub dh: Array2<f32>,
    /// With respect to the previous memory.
    pub dc: Array2<f32>,
}

/// A recurrent cell.
#[derive(Debug, Clone)]
pub enum Cell {
    Lstm(LstmCell),
    LayerNormLstm(LayerNormLstmCell),
}

impl Cell {
    /// Creates a cell of the given kind, registering its tensors under `scope`.
    pub fn new(
        kind: CellKind,
        registry: &mut ParamRegistry,
        scope: &str,
        input: usize,
        hidden: usize,
    ) -> Self {
        match kind {
            CellKind::Lstm => Self::Lstm(LstmCell::new(registry, scope, input, hidden)),
            CellKind::LayerNormLstm => {
                Self::LayerNormLstm(LayerNormLstmCell::new(registry, scope, input, hidden))
            }
        }
    }

    pub fn hidden(&self) -> usize {
        match self {
            Self::Lstm(cell) => cell.hidden(),
            Self::LayerNormLstm(cell) => cell.hidden(),
        }
    }

    /// Advances the cell one step.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `x` - The step's input, batch × input.
    /// * `state` - The state left by the previous step.
    ///
    /// # Returns
    /// The next state, whose `h` is the step's output, and the cache for `step_backward`.
    pub fn step(
        &self,
        params: &[f32],
        x: ArrayView2<f32>,
        state: &CellState,
    ) -> Result<(CellState, CellCache)> {
        match self {
            Self::Lstm(cell) => {
                let (next, cache) = cell.step(params, x, state)?;
                Ok((next, CellCache::Lstm(cache)))
            }
            Self::LayerNormLstm(cell) => {
                let (next, cache) = cell.step(params, x, state)?;
                Ok((next, CellCache::LayerNormLstm(cache)))
            }
        }
    }

    /// Backward pass of a step, accumulating the cell's parameter gradients into `grad`.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `grad` - The gradient buffer.
    /// * `cache` - What `step` returned for this step.
    /// * `dh` - The gradient with respect to the step's hidden output.
    /// * `dc` - The gradient with respect to the step's memory.
    pub fn step_backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        cache: &CellCache,
        dh: ArrayView2<f32>,
        dc: ArrayView2<f32>,
    ) -> Result<CellGrads> {
        match (self, cache) {
            (Self::Lstm(cell), CellCache::Lstm(cache)) => {
                cell.step_backward(params, grad, cache, dh, dc)
            }
            (Self::LayerNormLstm(cell), CellCache::LayerNormLstm(cache)) => {
                cell.step_backward(params, grad, cache, dh, dc)
            }
            _ => Err(BrainErr::InvalidInput(
                "step cache belongs to another kind of cell".into(),
            )),
        }
    }
}
