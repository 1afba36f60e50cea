use ndarray::{Array2, Array3, ArrayView2, ArrayView3, s};
use rayon::prelude::*;

use crate::{BrainErr, Result, dataset::SparseLabels};

/// Per-example losses and the gradient of their mean with respect to the logits.
#[derive(Debug, Clone)]
pub struct CtcOutput {
    pub losses: Vec<f64>,
    /// Same shape as the logits, zero past every example's length.
    pub grad: Array3<f32>,
}

impl CtcOutput {
    pub fn mean(&self) -> f64 {
        self.losses.iter().sum::<f64>() / self.losses.len().max(1) as f64
    }
}

/// Frames needed to emit `labels`: one per label plus one blank between repeated neighbours.
pub fn required_frames(labels: &[u32]) -> usize {
    labels.len() + labels.windows(2).filter(|w| w[0] == w[1]).count()
}

/// Computes the connectionist temporal classification loss of a batch.
///
/// # Arguments
/// * `logits` - Unnormalized scores, time × batch × classes.
/// * `labels` - The label sequence of each example.
/// * `seq_lens` - The frames of each example that take part in the alignment.
/// * `blank` - The class index of the blank symbol.
///
/// # Returns
/// The loss of each example and the gradient of their mean, or an error if an example can't be
/// aligned.
pub fn ctc_loss(
    logits: ArrayView3<f32>,
    labels: &SparseLabels,
    seq_lens: &[usize],
    blank: usize,
) -> Result<CtcOutput> {
    let (frames, batch, classes) = logits.dim();

    if blank >= classes {
        return Err(BrainErr::InvalidInput(format!(
            "blank {blank} is not one of the {classes} classes"
        )));
    }
    if labels.len() != batch {
        return Err(BrainErr::SizeMismatch {
            what: "label sequences",
            got: labels.len(),
            expected: batch,
        });
    }
    if seq_lens.len() != batch {
        return Err(BrainErr::SizeMismatch {
            what: "sequence lengths",
            got: seq_lens.len(),
            expected: batch,
        });
    }

    let sequences: Vec<&[u32]> = labels.iter().collect();

    for (example, (seq, &len)) in sequences.iter().zip(seq_lens).enumerate() {
        if len == 0 || len > frames {
            return Err(BrainErr::InvalidInput(format!(
                "example {example} has length {len}, which is not within 1..={frames}"
            )));
        }

        if let Some(label) = seq.iter().find(|&&label| label as usize >= blank) {
            return Err(BrainErr::InvalidInput(format!(
                "example {example} has label {label} but labels must be below the blank {blank}"
            )));
        }

        let required = required_frames(seq);
        if required > len {
            return Err(BrainErr::LabelTooLong {
                example,
                required,
                frames: len,
            });
        }
    }

    let results = (0..batch)
        .into_par_iter()
        .map(|b| example_loss(logits.slice(s![..seq_lens[b], b, ..]), sequences[b], blank))
        .collect::<Result<Vec<_>>>()?;

    let scale = 1. / batch as f32;
    let mut grad = Array3::zeros(logits.raw_dim());
    let mut losses = Vec::with_capacity(batch);

    for (b, (loss, g)) in results.into_iter().enumerate() {
        grad.slice_mut(s![..g.nrows(), b, ..]).assign(&(g * scale));
        losses.push(loss);
    }

    Ok(CtcOutput { losses, grad })
}

fn log_add(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }

    a.max(b) + (-(a - b).abs()).exp().ln_1p()
}

fn log_softmax(logits: ArrayView2<f32>) -> Array2<f64> {
    let mut out = logits.mapv(f64::from);

    for mut row in out.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |m, &x| m.max(x));
        let log_sum = row.fold(0., |acc, &x| acc + (x - max).exp()).ln() + max;
        row.mapv_inplace(|x| x - log_sum);
    }

    out
}

/// Loss of a single example and the gradient of that loss with respect to its logits.
///
/// `alpha[t][s]` is the log probability of the prefixes ending at extended label `s` on frame
/// `t`, emissions up to and including `t`. `beta[t][s]` covers the suffixes from `s` on frame
/// `t`, emissions after `t` only.
fn example_loss(
    logits: ArrayView2<f32>,
    labels: &[u32],
    blank: usize,
) -> Result<(f64, Array2<f32>)> {
    let steps = logits.nrows();
    let lp = log_softmax(logits);

    let mut ext = Vec::with_capacity(2 * labels.len() + 1);
    ext.push(blank);
    for &label in labels {
        ext.push(label as usize);
        ext.push(blank);
    }
    let s_len = ext.len();
    let skippable = |s: usize| s >= 2 && ext[s] != blank && ext[s] != ext[s - 2];

    let mut alpha = Array2::from_elem((steps, s_len), f64::NEG_INFINITY);
    alpha[[0, 0]] = lp[[0, blank]];
    if s_len > 1 {
        alpha[[0, 1]] = lp[[0, ext[1]]];
    }

    for t in 1..steps {
        for s in 0..s_len {
            let mut a = alpha[[t - 1, s]];
            if s >= 1 {
                a = log_add(a, alpha[[t - 1, s - 1]]);
            }
            if skippable(s) {
                a = log_add(a, alpha[[t - 1, s - 2]]);
            }
            alpha[[t, s]] = a + lp[[t, ext[s]]];
        }
    }

    let mut beta = Array2::from_elem((steps, s_len), f64::NEG_INFINITY);
    beta[[steps - 1, s_len - 1]] = 0.;
    if s_len > 1 {
        beta[[steps - 1, s_len - 2]] = 0.;
    }

    for t in (0..steps - 1).rev() {
        for s in 0..s_len {
            let mut b = beta[[t + 1, s]] + lp[[t + 1, ext[s]]];
            if s + 1 < s_len {
                b = log_add(b, beta[[t + 1, s + 1]] + lp[[t + 1, ext[s + 1]]]);
            }
            if s + 2 < s_len && skippable(s + 2) {
                b = log_add(b, beta[[t + 1, s + 2]] + lp[[t + 1, ext[s + 2]]]);
            }
            beta[[t, s]] = b;
        }
    }

    let mut log_likelihood = alpha[[steps - 1, s_len - 1]];
    if s_len > 1 {
        log_likelihood = log_add(log_likelihood, alpha[[steps - 1, s_len - 2]]);
    }

    if !log_likelihood.is_finite() {
        return Err(BrainErr::InvalidInput(format!(
            "labels {labels:?} have no alignment within {steps} frames"
        )));
    }

    let mut grad = lp.mapv(f64::exp);
    for t in 0..steps {
        for (s, &k) in ext.iter().enumerate() {
            grad[[t, k]] -= (alpha[[t, s]] + beta[[t, s]] - log_likelihood).exp();
        }
    }

    Ok((-log_likelihood, grad.mapv(|g| g as f32)))
}

#[cfg(test)]
mod tests {
    use ndarray::{Array, Axis};
    use ndarray_rand::{RandomExt, rand_distr::Uniform};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn single_frame_is_the_label_probability() {
        let logits = Array3::zeros((1, 1, 2));
        let labels = SparseLabels::from_sequences([[0u32]]);

        let out = ctc_loss(logits.view(), &labels, &[1], 1).unwrap();
        assert!((out.losses[0] - 2f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn two_frames_sum_every_alignment() {
        // "a a", "a -" and "- a" each have probability 1/4.
        let logits = Array3::zeros((2, 1, 2));
        let labels = SparseLabels::from_sequences([[0u32]]);

        let out = ctc_loss(logits.view(), &labels, &[2], 1).unwrap();
        assert!((out.losses[0] + 0.75f64.ln()).abs() < 1e-9);
        assert!((out.mean() - out.losses[0]).abs() < 1e-12);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(9);
        let logits = Array::random_using((5, 2, 4), Uniform::new(-2f32, 2.).unwrap(), &mut rng);
        let labels = SparseLabels::from_sequences([vec![0u32, 1], vec![2, 2]]);
        let lens = [5, 4];

        let out = ctc_loss(logits.view(), &labels, &lens, 3).unwrap();
        let eps = 1e-2;

        for (idx, &analytic) in out.grad.indexed_iter() {
            let mut up = logits.clone();
            up[idx] += eps;
            let mut down = logits.clone();
            down[idx] -= eps;

            let numeric = (ctc_loss(up.view(), &labels, &lens, 3).unwrap().mean()
                - ctc_loss(down.view(), &labels, &lens, 3).unwrap().mean())
                / (2. * eps as f64);

            assert!(
                (numeric - analytic as f64).abs() < 1e-3,
                "{idx:?}: {numeric} != {analytic}"
            );
        }

        assert!(out.grad.slice(s![4, 1, ..]).iter().all(|&g| g == 0.));
    }

    #[test]
    fn gradient_of_each_frame_sums_to_zero() {
        let mut rng = StdRng::seed_from_u64(1);
        let logits = Array::random_using((6, 1, 5), Uniform::new(-1f32, 1.).unwrap(), &mut rng);
        let labels = SparseLabels::from_sequences([[3u32, 0, 3]]);

        let out = ctc_loss(logits.view(), &labels, &[6], 4).unwrap();
        for frame in out.grad.axis_iter(Axis(0)) {
            assert!(frame.sum().abs() < 1e-5);
        }
    }

    #[test]
    fn repeated_labels_need_a_blank_in_between() {
        assert_eq!(required_frames(&[1, 1, 2]), 4);
        assert_eq!(required_frames(&[1, 2, 1]), 3);
        assert_eq!(required_frames(&[]), 0);

        let logits = Array3::zeros((4, 1, 3));
        let labels = SparseLabels::from_sequences([[0u32, 0, 0]]);

        assert!(matches!(
            ctc_loss(logits.view(), &labels, &[4], 2),
            Err(BrainErr::LabelTooLong {
                example: 0,
                required: 5,
                frames: 4
            })
        ));
    }

    #[test]
    fn invalid_batches_are_rejected() {
        let logits = Array3::zeros((4, 2, 3));
        let labels = SparseLabels::from_sequences([[0u32], [1]]);

        let out_of_range = SparseLabels::from_sequences([[0u32], [2]]);
        assert!(matches!(
            ctc_loss(logits.view(), &out_of_range, &[4, 4], 2),
            Err(BrainErr::InvalidInput(_))
        ));
        assert!(matches!(
            ctc_loss(logits.view(), &labels, &[4, 0], 2),
            Err(BrainErr::InvalidInput(_))
        ));
        assert!(matches!(
            ctc_loss(logits.view(), &labels, &[4], 2),
            Err(BrainErr::SizeMismatch { .. })
        ));
    }
}
