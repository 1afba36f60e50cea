use std::ops::Range;

use ndarray::{Array2, ArrayView2, Axis, Ix1, Ix2, concatenate, linalg, s};

use super::{CellGrads, CellState, Gates};
use crate::{
    Result,
    arch::{
        activations::ActFn,
        params::{Init, ParamRegistry, view, view_mut},
    },
};

/// A gated memory cell.
///
/// With `z = [x, h] · W + b` split into input, candidate, forget and output pre-activations:
/// `c' = σ(f + 1) · c + σ(i) · act(j)` and `h' = σ(o) · act(c')`.
#[derive(Debug, Clone)]
pub struct LstmCell {
    input: usize,
    hidden: usize,
    weights: Range<usize>,
    biases: Range<usize>,
    act_fn: ActFn,
}

#[derive(Debug, Clone)]
pub struct LstmCache {
    xh: Array2<f32>,
    z: Array2<f32>,
    c_prev: Array2<f32>,
    c: Array2<f32>,
}

impl LstmCell {
    /// Creates a new `LstmCell` activated by a ReLU clipped at 6.
    pub fn new(registry: &mut ParamRegistry, scope: &str, input: usize, hidden: usize) -> Self {
        Self::with_act_fn(registry, scope, input, hidden, ActFn::relu6())
    }

    /// Creates a new `LstmCell`.
    ///
    /// # Arguments
    /// * `registry` - Where the cell's tensors are allocated.
    /// * `scope` - The name prefix of the cell's tensors.
    /// * `input` - The width of the step inputs.
    /// * `hidden` - The width of the hidden output and memory.
    /// * `act_fn` - The candidate and output activation.
    pub fn with_act_fn(
        registry: &mut ParamRegistry,
        scope: &str,
        input: usize,
        hidden: usize,
        act_fn: ActFn,
    ) -> Self {
        let weights = registry.variable(
            format!("{scope}/weights"),
            &[input + hidden, 4 * hidden],
            Init::XavierUniform {
                fan_in: input + hidden,
                fan_out: 4 * hidden,
            },
        );
        let biases = registry.variable(format!("{scope}/biases"), &[4 * hidden], Init::Const(0.));

        Self {
            input,
            hidden,
            weights,
            biases,
            act_fn,
        }
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    fn weights_dim(&self) -> (usize, usize) {
        (self.input + self.hidden, 4 * self.hidden)
    }

    pub fn step(
        &self,
        params: &[f32],
        x: ArrayView2<f32>,
        state: &CellState,
    ) -> Result<(CellState, LstmCache)> {
        let w = view::<Ix2, _>(params, &self.weights, self.weights_dim())?;
        let b = view::<Ix1, _>(params, &self.biases, 4 * self.hidden)?;

        let xh = concatenate(Axis(1), &[x, state.h.view()])?;
        let mut z = Array2::zeros((xh.nrows(), 4 * self.hidden));
        linalg::general_mat_mul(1.0, &xh, &w, 0.0, &mut z);
        z += &b;

        let gates = Gates::new(z.view(), self.act_fn);
        let c = gates.memory(&state.c);
        let h = &gates.o * &c.mapv(|c| self.act_fn.f(c));

        let cache = LstmCache {
            xh,
            z,
            c_prev: state.c.clone(),
            c: c.clone(),
        };

        Ok((CellState { h, c }, cache))
    }

    pub fn step_backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        cache: &LstmCache,
        dh: ArrayView2<f32>,
        dc: ArrayView2<f32>,
    ) -> Result<CellGrads> {
        let gates = Gates::new(cache.z.view(), self.act_fn);

        let dc = &dc + &(&dh * &gates.o * cache.c.mapv(|c| self.act_fn.df(c)));
        let d_o = &dh * &cache.c.mapv(|c| self.act_fn.f(c));
        let dz = gates.backward(cache.z.view(), self.act_fn, &dc, &cache.c_prev, &d_o);

        let mut dw = view_mut::<Ix2, _>(grad, &self.weights, self.weights_dim())?;
        linalg::general_mat_mul(1.0, &cache.xh.t(), &dz, 1.0, &mut dw);

        let mut db = view_mut::<Ix1, _>(grad, &self.biases, 4 * self.hidden)?;
        db += &dz.sum_axis(Axis(0));

        let w = view::<Ix2, _>(params, &self.weights, self.weights_dim())?;
        let mut dxh = Array2::zeros((dz.nrows(), self.input + self.hidden));
        linalg::general_mat_mul(1.0, &dz, &w.t(), 0.0, &mut dxh);

        Ok(CellGrads {
            dx: dxh.slice(s![.., ..self.input]).to_owned(),
            dh: dxh.slice(s![.., self.input..]).to_owned(),
            dc: dc * &gates.f,
        })
    }
}
