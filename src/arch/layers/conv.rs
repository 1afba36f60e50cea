use std::ops::Range;

use ndarray::{Array4, ArrayView4, Axis, Ix1, Ix4, Zip, linalg, s};
use rand::Rng;
use rayon::prelude::*;

use super::Dropout;
use crate::{
    BrainErr, Result,
    arch::{
        activations::ActFn,
        params::{Init, ParamRegistry, view, view_mut},
    },
    config::{Config, Precision},
};

/// Length of every kernel along the time axis.
pub const KERNEL_LENGTH: usize = 11;

const BIAS_INIT: f32 = -0.05;

/// One input position feeding one output position through one kernel tap.
#[derive(Debug, Clone, Copy)]
struct Tap {
    to: usize,
    wo: usize,
    kt: usize,
    kw: usize,
    ti: usize,
    wi: usize,
}

/// SAME padding geometry of a convolution strided along time only. The output keeps
/// `ceil(len / stride)` steps and the full width, the padding is split with the smaller half
/// before the input.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    stride: usize,
    kt: usize,
    kw: usize,
    pad_t: usize,
    pad_w: usize,
    t_in: usize,
    w_in: usize,
    t_out: usize,
}

impl Geometry {
    fn new((t_in, w_in): (usize, usize), (kt, kw): (usize, usize), stride: usize) -> Self {
        let t_out = t_in.div_ceil(stride);
        let pad_t = (t_out.saturating_sub(1) * stride + kt).saturating_sub(t_in) / 2;
        let pad_w = (w_in.saturating_sub(1) + kw).saturating_sub(w_in) / 2;

        Self {
            stride,
            kt,
            kw,
            pad_t,
            pad_w,
            t_in,
            w_in,
            t_out,
        }
    }

    fn taps(self) -> impl Iterator<Item = Tap> {
        let g = self;

        (0..g.t_out).flat_map(move |to| {
            (0..g.w_in).flat_map(move |wo| {
                (0..g.kt).flat_map(move |kt| {
                    (0..g.kw).filter_map(move |kw| {
                        let ti = (to * g.stride + kt).checked_sub(g.pad_t)?;
                        let wi = (wo + kw).checked_sub(g.pad_w)?;
                        (ti < g.t_in && wi < g.w_in).then_some(Tap {
                            to,
                            wo,
                            kt,
                            kw,
                            ti,
                            wi,
                        })
                    })
                })
            })
        })
    }
}

/// Convolves a batch with SAME padding, striding along time only.
///
/// # Arguments
/// * `x` - The input, batch × time × width × in depth.
/// * `k` - The kernel, length × width × in depth × filters.
/// * `stride` - The stride along time.
///
/// # Returns
/// The output, batch × ceil(time / stride) × width × filters.
pub fn conv_same(x: ArrayView4<f32>, k: ArrayView4<f32>, stride: usize) -> Result<Array4<f32>> {
    let (batch, t_in, w_in, depth) = x.dim();
    let (kt, kw, k_depth, filters) = k.dim();

    if depth != k_depth {
        return Err(BrainErr::SizeMismatch {
            what: "convolution input depth",
            got: depth,
            expected: k_depth,
        });
    }

    let geometry = Geometry::new((t_in, w_in), (kt, kw), stride);
    let mut out = Array4::zeros((batch, geometry.t_out, w_in, filters));

    Zip::from(out.outer_iter_mut())
        .and(x.outer_iter())
        .par_for_each(|mut example_out, example| {
            for tap in geometry.taps() {
                linalg::general_mat_vec_mul(
                    1.,
                    &k.slice(s![tap.kt, tap.kw, .., ..]).t(),
                    &example.slice(s![tap.ti, tap.wi, ..]),
                    1.,
                    &mut example_out.slice_mut(s![tap.to, tap.wo, ..]),
                );
            }
        });

    Ok(out)
}

/// Backward pass of `conv_same`.
///
/// # Arguments
/// * `x` - The input of the forward pass.
/// * `k` - The kernel of the forward pass.
/// * `d` - The gradient with respect to the output.
/// * `stride` - The stride along time.
///
/// # Returns
/// The gradients with respect to the input and the kernel.
pub fn conv_same_backward(
    x: ArrayView4<f32>,
    k: ArrayView4<f32>,
    d: ArrayView4<f32>,
    stride: usize,
) -> Result<(Array4<f32>, Array4<f32>)> {
    let (batch, t_in, w_in, _) = x.dim();
    let (kt, kw, _, filters) = k.dim();
    let geometry = Geometry::new((t_in, w_in), (kt, kw), stride);

    let expected = (batch, geometry.t_out, w_in, filters);
    if d.dim() != expected {
        return Err(BrainErr::SizeMismatch {
            what: "convolution output gradient",
            got: d.len(),
            expected: batch * geometry.t_out * w_in * filters,
        });
    }

    let mut dx = Array4::zeros(x.raw_dim());
    Zip::from(dx.outer_iter_mut())
        .and(d.outer_iter())
        .par_for_each(|mut example_dx, example_d| {
            for tap in geometry.taps() {
                linalg::general_mat_vec_mul(
                    1.,
                    &k.slice(s![tap.kt, tap.kw, .., ..]),
                    &example_d.slice(s![tap.to, tap.wo, ..]),
                    1.,
                    &mut example_dx.slice_mut(s![tap.ti, tap.wi, ..]),
                );
            }
        });

    let dk = (0..batch)
        .into_par_iter()
        .map(|i| {
            let (x, d) = (x.index_axis(Axis(0), i), d.index_axis(Axis(0), i));
            let mut dk = Array4::zeros(k.raw_dim());

            for tap in geometry.taps() {
                let xi = x.slice(s![tap.ti, tap.wi, ..]).insert_axis(Axis(1));
                let di = d.slice(s![tap.to, tap.wo, ..]).insert_axis(Axis(0));
                linalg::general_mat_mul(
                    1.,
                    &xi,
                    &di,
                    1.,
                    &mut dk.slice_mut(s![tap.kt, tap.kw, .., ..]),
                );
            }

            dk
        })
        .reduce(|| Array4::zeros(k.raw_dim()), |acc, dk| acc + dk);

    Ok((dx, dk))
}

/// A convolution block: strided SAME convolution, bias, ReLU and dropout.
#[derive(Debug, Clone)]
pub struct Conv2d {
    kernel: Range<usize>,
    kernel_dim: (usize, usize, usize, usize),
    biases: Range<usize>,
    stride: usize,
    act_fn: ActFn,
    dropout: Dropout,
    precision: Precision,

    // Forward metadata
    x: Array4<f32>,
    z: Array4<f32>,
    mask: Option<Array4<f32>>,
}

impl Conv2d {
    /// Creates a new `Conv2d`, registering its kernel and biases.
    ///
    /// # Arguments
    /// * `registry` - Where the layer's tensors are allocated.
    /// * `scope` - The name prefix of the layer's tensors.
    /// * `channels` - The width of the input, every kernel spans all of it.
    /// * `in_depth` - The amount of input feature maps.
    /// * `config` - Provides the filters, stride, keep probability, precision and weight decay.
    pub fn new(
        registry: &mut ParamRegistry,
        scope: &str,
        channels: usize,
        in_depth: usize,
        config: &Config,
    ) -> Self {
        let filters = config.num_filters;
        let kernel_dim = (KERNEL_LENGTH, channels, in_depth, filters);
        let receptive_field = KERNEL_LENGTH * channels;

        let kernel = registry.variable_with_weight_decay(
            format!("{scope}/weights"),
            &[KERNEL_LENGTH, channels, in_depth, filters],
            Init::XavierUniform {
                fan_in: receptive_field * in_depth,
                fan_out: receptive_field * filters,
            },
            config.weight_decay,
        );
        let biases = registry.variable(
            format!("{scope}/biases"),
            &[filters],
            Init::Const(BIAS_INIT),
        );

        Self {
            kernel,
            kernel_dim,
            biases,
            stride: config.temporal_stride.get(),
            act_fn: ActFn::relu(),
            dropout: Dropout::new(config.keep_prob),
            precision: config.precision,
            x: Array4::zeros((0, 0, 0, 0)),
            z: Array4::zeros((0, 0, 0, 0)),
            mask: None,
        }
    }

    pub fn filters(&self) -> usize {
        self.kernel_dim.3
    }

    pub fn forward<R: Rng>(
        &mut self,
        params: &[f32],
        x: Array4<f32>,
        rng: &mut R,
    ) -> Result<Array4<f32>> {
        let k = view::<Ix4, _>(params, &self.kernel, self.kernel_dim)?;
        let b = view::<Ix1, _>(params, &self.biases, self.filters())?;

        if x.dim().2 != self.kernel_dim.1 {
            return Err(BrainErr::SizeMismatch {
                what: "convolution input width",
                got: x.dim().2,
                expected: self.kernel_dim.1,
            });
        }

        let mut z = conv_same(x.view(), k, self.stride)?;
        z += &b;

        let mut a = z.mapv(|z| self.act_fn.f(z));

        self.mask = self.dropout.mask(a.raw_dim(), rng)?;
        if let Some(mask) = &self.mask {
            a *= mask;
        }

        self.precision.quantize(&mut a);

        self.x = x;
        self.z = z;
        Ok(a)
    }

    /// Accumulates the kernel and bias gradients into `grad`.
    ///
    /// # Returns
    /// The gradient with respect to the block's input.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        mut d: Array4<f32>,
    ) -> Result<Array4<f32>> {
        if let Some(mask) = &self.mask {
            d *= mask;
        }
        d.zip_mut_with(&self.z, |d, &z| *d *= self.act_fn.df(z));

        let k = view::<Ix4, _>(params, &self.kernel, self.kernel_dim)?;
        let (dx, dk) = conv_same_backward(self.x.view(), k, d.view(), self.stride)?;

        let mut dk_view = view_mut::<Ix4, _>(grad, &self.kernel, self.kernel_dim)?;
        dk_view += &dk;

        let db = d
            .sum_axis(Axis(0))
            .sum_axis(Axis(0))
            .sum_axis(Axis(0));
        let mut db_view = view_mut::<Ix1, _>(grad, &self.biases, self.filters())?;
        db_view += &db;

        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use ndarray::{Array, Array1};
    use ndarray_rand::{RandomExt, rand_distr::Uniform};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn column(values: &[f32]) -> Array4<f32> {
        Array1::from(values.to_vec())
            .into_shape_with_order((1, values.len(), 1, 1))
            .unwrap()
    }

    #[test]
    fn same_padding_sums_the_window() {
        let x = column(&[1., 2., 3., 4.]);
        let k = Array4::ones((3, 1, 1, 1));

        let out = conv_same(x.view(), k.view(), 1).unwrap();
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), [3., 6., 9., 7.]);

        let out = conv_same(x.view(), k.view(), 2).unwrap();
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), [6., 7.]);
    }

    #[test]
    fn output_length_is_the_ceiling_of_time_over_stride() {
        let k = Array4::zeros((KERNEL_LENGTH, 3, 1, 2));

        for (time, stride, expected) in [(7, 2, 4), (10, 3, 4), (10, 2, 5), (1, 4, 1)] {
            let x = Array4::zeros((2, time, 3, 1));
            let out = conv_same(x.view(), k.view(), stride).unwrap();
            assert_eq!(out.dim(), (2, expected, 3, 2));
        }
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(5);
        let dist = Uniform::new(-1f32, 1.).unwrap();
        let x = Array::random_using((2, 6, 3, 2), dist, &mut rng);
        let k = Array::random_using((4, 3, 2, 3), dist, &mut rng);
        let d = Array::random_using((2, 3, 3, 3), dist, &mut rng);

        let objective = |x: &Array4<f32>, k: &Array4<f32>| -> f32 {
            (conv_same(x.view(), k.view(), 2).unwrap() * &d).sum()
        };

        let (dx, dk) = conv_same_backward(x.view(), k.view(), d.view(), 2).unwrap();
        let eps = 1e-2;

        for idx in [(0, 0, 0, 0), (1, 3, 2, 1), (0, 5, 1, 1)] {
            let mut shifted = x.clone();
            shifted[idx] += eps;
            let numeric = (objective(&shifted, &k) - objective(&x, &k)) / eps;
            assert!((numeric - dx[idx]).abs() < 1e-2, "{numeric} != {}", dx[idx]);
        }

        for idx in [(0, 0, 0, 0), (3, 2, 1, 2), (1, 1, 0, 1)] {
            let mut shifted = k.clone();
            shifted[idx] += eps;
            let numeric = (objective(&x, &shifted) - objective(&x, &k)) / eps;
            assert!((numeric - dk[idx]).abs() < 1e-2, "{numeric} != {}", dk[idx]);
        }
    }

    #[test]
    fn stacked_blocks_shrink_time_per_block() {
        let config = Config {
            num_filters: 2,
            keep_prob: 1.,
            temporal_stride: NonZeroUsize::new(2).unwrap(),
            ..Config::default()
        };

        let mut registry = ParamRegistry::new();
        let mut conv1 = Conv2d::new(&mut registry, "conv1", 3, 1, &config);
        let mut conv2 = Conv2d::new(&mut registry, "conv2", 3, 2, &config);

        let mut rng = StdRng::seed_from_u64(0);
        let params = registry.initialize(&mut rng).unwrap();

        let x = Array4::ones((1, 9, 3, 1));
        let a = conv1.forward(&params, x, &mut rng).unwrap();
        assert_eq!(a.dim(), (1, 5, 3, 2));

        let a = conv2.forward(&params, a, &mut rng).unwrap();
        assert_eq!(a.dim(), (1, 3, 3, 2));
    }

    #[test]
    fn bias_gradient_counts_active_units() {
        let config = Config {
            num_filters: 2,
            keep_prob: 1.,
            temporal_stride: NonZeroUsize::new(2).unwrap(),
            ..Config::default()
        };

        let mut registry = ParamRegistry::new();
        let mut conv = Conv2d::new(&mut registry, "conv1", 3, 1, &config);
        let mut rng = StdRng::seed_from_u64(0);

        let mut params = vec![0.; registry.size()];
        let bias = registry.entries()[1].range.clone();
        params[bias.clone()].copy_from_slice(&[0.5, -0.5]);

        let a = conv.forward(&params, Array4::ones((2, 4, 3, 1)), &mut rng).unwrap();
        assert!(a.index_axis(Axis(3), 0).iter().all(|&a| a == 0.5));
        assert!(a.index_axis(Axis(3), 1).iter().all(|&a| a == 0.));

        let mut grad = vec![0.; registry.size()];
        let dx = conv.backward(&params, &mut grad, Array4::ones(a.raw_dim())).unwrap();

        assert_eq!(dx.dim(), (2, 4, 3, 1));
        assert_eq!(grad[bias], [12., 0.]);
    }
}
