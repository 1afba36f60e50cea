use log::trace;
use ndarray::{Array3, ArrayView3, Axis};
use rand::Rng;

use super::{
    layers::{Conv2d, Dense, SequenceEncoder, adjusted_lengths},
    params::ParamRegistry,
};
use crate::{BrainErr, Result, config::Config, dataset::Features};

/// The output of a forward pass.
#[derive(Debug, Clone)]
pub struct Inference {
    /// Unnormalized class scores, time' × batch × classes.
    pub logits: Array3<f32>,
    /// Example lengths after the stride reduction.
    pub seq_lens: Vec<usize>,
}

/// Convolutional feature extractor, recurrent sequence encoder and linear projector.
///
/// Tensors live in an external flat buffer, laid out by the `ParamRegistry` the model was built
/// with. The model only keeps what its backward pass needs from the last forward pass.
#[derive(Debug, Clone)]
pub struct DeepBrain {
    convs: Vec<Conv2d>,
    encoder: SequenceEncoder,
    projector: Dense,
    num_channels: usize,
    num_classes: usize,
    stride: usize,

    // Forward metadata
    conv_dim: (usize, usize, usize, usize),
}

impl DeepBrain {
    /// Builds the model, registering every tensor it needs.
    ///
    /// # Arguments
    /// * `config` - The run's configuration.
    /// * `num_channels` - The amount of signal channels of the features.
    /// * `registry` - Where the model's tensors are allocated.
    pub fn build(
        config: &Config,
        num_channels: usize,
        registry: &mut ParamRegistry,
    ) -> Result<Self> {
        if num_channels == 0 {
            return Err(BrainErr::Config("features need at least one channel".into()));
        }

        let filters = config.num_filters;
        let convs = (0..config.num_conv_layers)
            .map(|i| {
                let in_depth = if i == 0 { 1 } else { filters };
                Conv2d::new(registry, &format!("conv{}", i + 1), num_channels, in_depth, config)
            })
            .collect();

        let encoder = SequenceEncoder::new(registry, num_channels * filters, config);
        let projector = Dense::new(
            registry,
            "fully_connected",
            (config.num_hidden, config.num_classes),
            config.precision,
            config.weight_decay,
        );

        Ok(Self {
            convs,
            encoder,
            projector,
            num_channels,
            num_classes: config.num_classes,
            stride: config.temporal_stride.get(),
            conv_dim: (0, 0, 0, 0),
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Computes the logits of a batch.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `features` - The batch, batch × time × channels.
    /// * `seq_lens` - The length of each example before the stride reduction.
    /// * `rng` - The random number generator for dropout.
    ///
    /// # Returns
    /// The logits and the adjusted lengths.
    pub fn forward<R: Rng>(
        &mut self,
        params: &[f32],
        features: &Features,
        seq_lens: &[usize],
        rng: &mut R,
    ) -> Result<Inference> {
        let (batch, _, channels) = features.dim();

        if channels != self.num_channels {
            return Err(BrainErr::SizeMismatch {
                what: "feature channels",
                got: channels,
                expected: self.num_channels,
            });
        }
        if seq_lens.len() != batch {
            return Err(BrainErr::SizeMismatch {
                what: "sequence lengths",
                got: seq_lens.len(),
                expected: batch,
            });
        }

        let mut x = features.to_standard().into_owned().insert_axis(Axis(3));
        for conv in &mut self.convs {
            x = conv.forward(params, x, rng)?;
        }

        self.conv_dim = x.dim();
        let (_, frames, width, filters) = self.conv_dim;

        let x = x
            .into_shape_with_order((batch, frames, width * filters))?
            .permuted_axes([1, 0, 2]);

        let lens = adjusted_lengths(seq_lens, self.stride, frames);
        let h = self.encoder.forward(params, x.view(), &lens, rng)?;

        let hidden = h.dim().2;
        let h = h.into_shape_with_order((frames * batch, hidden))?;
        let logits = self
            .projector
            .forward(params, h)?
            .into_shape_with_order((frames, batch, self.num_classes))?;

        trace!("logits of shape {:?} for lengths {lens:?}", logits.dim());

        Ok(Inference {
            logits,
            seq_lens: lens,
        })
    }

    /// Accumulates the gradient of the loss with respect to every parameter into `grad`.
    ///
    /// # Arguments
    /// * `params` - The parameters of the last forward pass.
    /// * `grad` - The gradient buffer.
    /// * `dlogits` - The gradient of the loss with respect to the logits.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        dlogits: ArrayView3<f32>,
    ) -> Result<()> {
        let (batch, frames, width, filters) = self.conv_dim;

        let expected = (frames, batch, self.num_classes);
        if dlogits.dim() != expected {
            return Err(BrainErr::SizeMismatch {
                what: "logit gradient",
                got: dlogits.len(),
                expected: frames * batch * self.num_classes,
            });
        }

        let d = dlogits
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((frames * batch, self.num_classes))?;
        let dh = self.projector.backward(params, grad, d.view())?;

        let hidden = dh.ncols();
        let dh = dh.into_shape_with_order((frames, batch, hidden))?;
        let dx = self.encoder.backward(params, grad, dh)?;

        let mut d = dx
            .permuted_axes([1, 0, 2])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch, frames, width, filters))?;

        for conv in self.convs.iter_mut().rev() {
            d = conv.backward(params, grad, d)?;
        }

        Ok(())
    }
}
