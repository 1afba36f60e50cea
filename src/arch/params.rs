use std::ops::Range;

use log::debug;
use ndarray::{ArrayView, ArrayViewMut, Dimension, StrideShape};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::{BrainErr, Result};

/// How a learned tensor is initialized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Const(f32),
    /// Uniform in `±sqrt(6 / (fan_in + fan_out))`.
    XavierUniform { fan_in: usize, fan_out: usize },
}

impl Init {
    fn fill<R: Rng>(&self, rng: &mut R, out: &mut [f32]) -> Result<()> {
        match *self {
            Init::Const(value) => out.fill(value),
            Init::XavierUniform { fan_in, fan_out } => {
                let range = (6. / (fan_in + fan_out) as f32).sqrt();
                let uniform =
                    Uniform::new(-range, range).map_err(|e| BrainErr::Init(e.to_string()))?;

                for w in out {
                    *w = uniform.sample(rng);
                }
            }
        }

        Ok(())
    }
}

/// A learned tensor living inside the flat parameter buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub range: Range<usize>,
    init: Init,
}

/// An L2 penalty `wd * sum(w^2) / 2` over a learned tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct DecayTerm {
    pub name: String,
    pub range: Range<usize>,
    pub wd: f32,
}

/// Allocates the model's learned tensors as consecutive ranges of one flat buffer and keeps
/// track of the ones that contribute a weight decay term to the loss.
#[derive(Debug, Default)]
pub struct ParamRegistry {
    entries: Vec<ParamEntry>,
    decays: Vec<DecayTerm>,
    size: usize,
}

impl ParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new tensor.
    ///
    /// # Arguments
    /// * `name` - A unique name for the tensor, scoped like `conv1/weights`.
    /// * `shape` - The shape of the tensor.
    /// * `init` - How to initialize it.
    ///
    /// # Returns
    /// The tensor's range inside the parameter buffer.
    pub fn variable<S: Into<String>>(
        &mut self,
        name: S,
        shape: &[usize],
        init: Init,
    ) -> Range<usize> {
        let len: usize = shape.iter().product();
        let range = self.size..self.size + len;
        self.size += len;

        self.entries.push(ParamEntry {
            name: name.into(),
            shape: shape.to_vec(),
            range: range.clone(),
            init,
        });

        range
    }

    /// Allocates a new tensor that adds an L2 penalty to the loss when `wd` is some.
    pub fn variable_with_weight_decay<S: Into<String>>(
        &mut self,
        name: S,
        shape: &[usize],
        init: Init,
        wd: Option<f32>,
    ) -> Range<usize> {
        let name = name.into();
        let range = self.variable(name.clone(), shape, init);

        if let Some(wd) = wd {
            self.decays.push(DecayTerm {
                name: format!("{name}/weight_loss"),
                range: range.clone(),
                wd,
            });
        }

        range
    }

    /// Total amount of parameters.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    pub fn weight_decays(&self) -> &[DecayTerm] {
        &self.decays
    }

    /// Creates the parameter buffer with every tensor initialized.
    pub fn initialize<R: Rng>(&self, rng: &mut R) -> Result<Vec<f32>> {
        let mut params = vec![0.; self.size];

        for entry in &self.entries {
            entry.init.fill(rng, &mut params[entry.range.clone()])?;
            debug!("{} {:?} initialized", entry.name, entry.shape);
        }

        Ok(params)
    }
}

/// Views a range of a parameter buffer as a tensor.
pub(crate) fn view<'a, D, Sh>(
    params: &'a [f32],
    range: &Range<usize>,
    shape: Sh,
) -> Result<ArrayView<'a, f32, D>>
where
    D: Dimension,
    Sh: Into<StrideShape<D>>,
{
    let len = params.len();
    let slice = params
        .get(range.clone())
        .ok_or(BrainErr::SizeMismatch {
            what: "parameters",
            got: len,
            expected: range.end,
        })?;

    Ok(ArrayView::from_shape(shape, slice)?)
}

/// Views a range of a gradient buffer as a mutable tensor.
pub(crate) fn view_mut<'a, D, Sh>(
    grad: &'a mut [f32],
    range: &Range<usize>,
    shape: Sh,
) -> Result<ArrayViewMut<'a, f32, D>>
where
    D: Dimension,
    Sh: Into<StrideShape<D>>,
{
    let len = grad.len();
    let slice = grad
        .get_mut(range.clone())
        .ok_or(BrainErr::SizeMismatch {
            what: "gradient",
            got: len,
            expected: range.end,
        })?;

    Ok(ArrayViewMut::from_shape(shape, slice)?)
}
