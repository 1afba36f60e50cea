use std::ops::Range;

use ndarray::{Array2, ArrayView2, Axis, Ix1, Ix2, linalg};

use crate::{
    BrainErr, Result,
    arch::params::{Init, ParamRegistry, view, view_mut},
    config::Precision,
};

/// A fully connected layer without activation, mapping rows of `dim.0` features to `dim.1`.
#[derive(Debug, Clone)]
pub struct Dense {
    dim: (usize, usize),
    weights: Range<usize>,
    biases: Range<usize>,
    precision: Precision,

    // Forward metadata
    x: Array2<f32>,
}

impl Dense {
    /// Creates a new `Dense`, registering its weights and biases.
    ///
    /// # Arguments
    /// * `registry` - Where the layer's tensors are allocated.
    /// * `scope` - The name prefix of the layer's tensors.
    /// * `dim` - The input and output widths.
    /// * `precision` - The precision the outputs are rounded to.
    /// * `weight_decay` - The L2 penalty of the weights, if any.
    pub fn new(
        registry: &mut ParamRegistry,
        scope: &str,
        dim: (usize, usize),
        precision: Precision,
        weight_decay: Option<f32>,
    ) -> Self {
        let weights = registry.variable_with_weight_decay(
            format!("{scope}/weights"),
            &[dim.0, dim.1],
            Init::XavierUniform {
                fan_in: dim.0,
                fan_out: dim.1,
            },
            weight_decay,
        );
        let biases = registry.variable(format!("{scope}/biases"), &[dim.1], Init::Const(0.));

        Self {
            dim,
            weights,
            biases,
            precision,
            x: Array2::zeros((0, 0)),
        }
    }

    pub fn forward(&mut self, params: &[f32], x: Array2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.dim.0 {
            return Err(BrainErr::SizeMismatch {
                what: "dense input width",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let w = view::<Ix2, _>(params, &self.weights, self.dim)?;
        let b = view::<Ix1, _>(params, &self.biases, self.dim.1)?;

        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut z);
        z += &b;
        self.precision.quantize(&mut z);

        self.x = x;
        Ok(z)
    }

    /// Accumulates the weight and bias gradients into `grad`.
    ///
    /// # Returns
    /// The gradient with respect to the layer's input.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        let mut dw = view_mut::<Ix2, _>(grad, &self.weights, self.dim)?;
        linalg::general_mat_mul(1.0, &self.x.t(), &d, 1.0, &mut dw);

        let mut db = view_mut::<Ix1, _>(grad, &self.biases, self.dim.1)?;
        db += &d.sum_axis(Axis(0));

        let w = view::<Ix2, _>(params, &self.weights, self.dim)?;
        let mut dx = Array2::zeros((d.nrows(), self.dim.0));
        linalg::general_mat_mul(1.0, &d, &w.t(), 0.0, &mut dx);

        Ok(dx)
    }
}
