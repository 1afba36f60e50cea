use std::ops::Range;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Ix2, concatenate, linalg, s};

use super::{CellGrads, CellState, Gates};
use crate::{
    Result,
    arch::{
        activations::ActFn,
        params::{Init, ParamRegistry, view, view_mut},
    },
};

const EPSILON: f32 = 1e-5;

/// Gain and shift rows: one per gate and one for the memory.
const NORMS: usize = 5;
const MEMORY_NORM: usize = 4;

#[derive(Debug, Clone)]
struct NormCache {
    x_hat: Array2<f32>,
    inv_std: Array1<f32>,
}

/// Normalizes every row of `x` to zero mean and unit variance, then scales and shifts it.
fn layer_norm(
    x: ArrayView2<f32>,
    gain: ArrayView1<f32>,
    shift: ArrayView1<f32>,
) -> (Array2<f32>, NormCache) {
    let n = x.ncols() as f32;

    let mean = x.sum_axis(Axis(1)) / n;
    let centered = &x - &mean.insert_axis(Axis(1));
    let var = centered.mapv(|v| v * v).sum_axis(Axis(1)) / n;
    let inv_std = var.mapv(|v| 1. / (v + EPSILON).sqrt());

    let x_hat = centered * &inv_std.view().insert_axis(Axis(1));
    let y = &x_hat * &gain + &shift;

    (y, NormCache { x_hat, inv_std })
}

/// Backward pass of `layer_norm`.
///
/// # Returns
/// The gradients with respect to the input, the gain and the shift.
fn layer_norm_backward(
    dy: ArrayView2<f32>,
    gain: ArrayView1<f32>,
    cache: &NormCache,
) -> (Array2<f32>, Array1<f32>, Array1<f32>) {
    let n = dy.ncols() as f32;
    let x_hat = &cache.x_hat;

    let dgain = (&dy * x_hat).sum_axis(Axis(0));
    let dshift = dy.sum_axis(Axis(0));

    let dx_hat = &dy * &gain;
    let sum = dx_hat.sum_axis(Axis(1)).insert_axis(Axis(1));
    let dot = (&dx_hat * x_hat).sum_axis(Axis(1)).insert_axis(Axis(1));
    let scale = cache.inv_std.mapv(|s| s / n).insert_axis(Axis(1));

    let dx = (dx_hat * n - sum - x_hat * &dot) * scale;

    (dx, dgain, dshift)
}

/// A gated memory cell with layer normalization on every gate pre-activation and on the new
/// memory before its output activation. The gates take no bias, the learned shift replaces it.
#[derive(Debug, Clone)]
pub struct LayerNormLstmCell {
    input: usize,
    hidden: usize,
    weights: Range<usize>,
    gain: Range<usize>,
    shift: Range<usize>,
    act_fn: ActFn,
}

#[derive(Debug, Clone)]
pub struct LayerNormLstmCache {
    xh: Array2<f32>,
    zn: Array2<f32>,
    norms: Vec<NormCache>,
    c_prev: Array2<f32>,
    cn: Array2<f32>,
}

impl LayerNormLstmCell {
    /// Creates a new `LayerNormLstmCell` activated by a ReLU clipped at 6.
    pub fn new(registry: &mut ParamRegistry, scope: &str, input: usize, hidden: usize) -> Self {
        Self::with_act_fn(registry, scope, input, hidden, ActFn::relu6())
    }

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
        let gain = registry.variable(format!("{scope}/gain"), &[NORMS, hidden], Init::Const(1.));
        let shift = registry.variable(format!("{scope}/shift"), &[NORMS, hidden], Init::Const(0.));

        Self {
            input,
            hidden,
            weights,
            gain,
            shift,
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
    ) -> Result<(CellState, LayerNormLstmCache)> {
        let h = self.hidden;
        let w = view::<Ix2, _>(params, &self.weights, self.weights_dim())?;
        let gain = view::<Ix2, _>(params, &self.gain, (NORMS, h))?;
        let shift = view::<Ix2, _>(params, &self.shift, (NORMS, h))?;

        let xh = concatenate(Axis(1), &[x, state.h.view()])?;
        let mut z = Array2::zeros((xh.nrows(), 4 * h));
        linalg::general_mat_mul(1.0, &xh, &w, 0.0, &mut z);

        let mut zn = Array2::zeros(z.raw_dim());
        let mut norms = Vec::with_capacity(NORMS);
        for g in 0..4 {
            let cols = g * h..(g + 1) * h;
            let (y, cache) = layer_norm(z.slice(s![.., cols.clone()]), gain.row(g), shift.row(g));
            zn.slice_mut(s![.., cols]).assign(&y);
            norms.push(cache);
        }

        let gates = Gates::new(zn.view(), self.act_fn);
        let c = gates.memory(&state.c);

        let (cn, cache) = layer_norm(c.view(), gain.row(MEMORY_NORM), shift.row(MEMORY_NORM));
        norms.push(cache);

        let out = &gates.o * &cn.mapv(|c| self.act_fn.f(c));

        let cache = LayerNormLstmCache {
            xh,
            zn,
            norms,
            c_prev: state.c.clone(),
            cn,
        };

        Ok((CellState { h: out, c }, cache))
    }

    pub fn step_backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        cache: &LayerNormLstmCache,
        dh: ArrayView2<f32>,
        dc: ArrayView2<f32>,
    ) -> Result<CellGrads> {
        let h = self.hidden;
        let gain = view::<Ix2, _>(params, &self.gain, (NORMS, h))?;
        let gates = Gates::new(cache.zn.view(), self.act_fn);

        let mut dgain = Array2::zeros((NORMS, h));
        let mut dshift = Array2::zeros((NORMS, h));

        let dcn = &dh * &gates.o * cache.cn.mapv(|c| self.act_fn.df(c));
        let (dc_out, dg, ds) =
            layer_norm_backward(dcn.view(), gain.row(MEMORY_NORM), &cache.norms[MEMORY_NORM]);
        dgain.row_mut(MEMORY_NORM).assign(&dg);
        dshift.row_mut(MEMORY_NORM).assign(&ds);

        let dc = &dc + &dc_out;
        let d_o = &dh * &cache.cn.mapv(|c| self.act_fn.f(c));
        let dzn = gates.backward(cache.zn.view(), self.act_fn, &dc, &cache.c_prev, &d_o);

        let mut dz = Array2::zeros(dzn.raw_dim());
        for g in 0..4 {
            let cols = g * h..(g + 1) * h;
            let (dx, dg, ds) =
                layer_norm_backward(dzn.slice(s![.., cols.clone()]), gain.row(g), &cache.norms[g]);
            dz.slice_mut(s![.., cols]).assign(&dx);
            dgain.row_mut(g).assign(&dg);
            dshift.row_mut(g).assign(&ds);
        }

        let mut dw = view_mut::<Ix2, _>(grad, &self.weights, self.weights_dim())?;
        linalg::general_mat_mul(1.0, &cache.xh.t(), &dz, 1.0, &mut dw);

        let mut gain_grad = view_mut::<Ix2, _>(grad, &self.gain, (NORMS, h))?;
        gain_grad += &dgain;
        let mut shift_grad = view_mut::<Ix2, _>(grad, &self.shift, (NORMS, h))?;
        shift_grad += &dshift;

        let w = view::<Ix2, _>(params, &self.weights, self.weights_dim())?;
        let mut dxh = Array2::zeros((dz.nrows(), self.input + h));
        linalg::general_mat_mul(1.0, &dz, &w.t(), 0.0, &mut dxh);

        Ok(CellGrads {
            dx: dxh.slice(s![.., ..self.input]).to_owned(),
            dh: dxh.slice(s![.., self.input..]).to_owned(),
            dc: dc * &gates.f,
        })
    }
}
