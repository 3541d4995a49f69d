//! Classifier and classifier-free guidance.
//!
//! Classifier guidance shifts the predicted noise along the gradient of
//! `log p(y | x_t)` given by a classifier trained on noised images.
//! Diffusion Models Beat GANs on Image Synthesis, P. Dhariwal, A. Nichol, 2021.
//! https://arxiv.org/abs/2105.05233
//!
//! Classifier-free guidance extrapolates from the unconditional prediction towards the
//! conditional one, both being produced by the same denoiser.
//! Classifier-Free Diffusion Guidance, J. Ho, T. Salimans, 2022.
//! https://arxiv.org/abs/2207.12598
use crate::error::{Error, Result};
use crate::models::{Classifier, Denoiser};
use crate::utils::float_equal;
use tch::{Kind, Tensor};

/// Gradient of the log-probability of `labels` with respect to the noised input, scaled
/// by `scale`.
///
/// Gradients are enabled for the duration of the call only, the sampling loops run the
/// rest of their work without a graph.
pub fn classifier_gradient(
    classifier: &dyn Classifier,
    xs: &Tensor,
    timesteps: &Tensor,
    labels: &Tensor,
    scale: f64,
) -> Result<Tensor> {
    tch::with_grad(|| {
        let xs_in = xs.detach().set_requires_grad(true);
        let logits = classifier.logits(&xs_in, timesteps)?;
        let log_probs = logits.log_softmax(-1, Kind::Float);
        let selected = log_probs.gather(1, &labels.view([-1, 1]), false);
        let grads = Tensor::run_backward(&[selected.sum(Kind::Float)], &[&xs_in], false, false);
        match grads.into_iter().next() {
            Some(grad) => Ok(grad * scale),
            None => Err(Error::Numerical("the classifier returned no gradient".to_string())),
        }
    })
}

/// Checks that the labels can be combined with the null class of `model`, whose id
/// `num_classes` must be a row of the label table.
pub fn check_null_class(model: &dyn Denoiser, labels: &Tensor) -> Result<i64> {
    let num_classes = model.num_classes().ok_or_else(|| {
        Error::config("classifier-free guidance needs a class-conditional denoiser")
    })?;
    let rows = model.label_table_rows().unwrap_or(0);
    if rows <= num_classes {
        return Err(Error::config(format!(
            "the label table has {rows} rows, the null class {num_classes} is not one of them"
        )));
    }
    if labels.numel() > 0 {
        let max_label = labels.max().int64_value(&[]);
        if max_label >= num_classes || labels.min().int64_value(&[]) < 0 {
            return Err(Error::config(format!(
                "label {max_label} is outside of the {num_classes} classes of the denoiser"
            )));
        }
    }
    Ok(num_classes)
}

/// Evaluates the denoiser with classifier-free guidance.
///
/// With a scale of 1 the denoiser runs once on the conditional batch. Otherwise the batch
/// is doubled, the second half being labelled with the null class `num_classes`, and the
/// two predictions are combined as `uncond + scale * (cond - uncond)`. When the denoiser
/// also predicts a variance, only the mean channels are combined and the variance of the
/// conditional half is kept.
pub fn guided_forward(
    model: &dyn Denoiser,
    xs: &Tensor,
    timesteps: &Tensor,
    labels: Option<&Tensor>,
    scale: f64,
) -> Result<Tensor> {
    let labels = match labels {
        Some(labels) if !float_equal(scale, 1.) => labels,
        _ => return Ok(model.forward_t(xs, timesteps, labels, false)),
    };
    let num_classes = check_null_class(model, labels)?;
    let null_labels = labels.full_like(num_classes);
    let xs2 = Tensor::cat(&[xs, xs], 0);
    let timesteps2 = Tensor::cat(&[timesteps, timesteps], 0);
    let labels2 = Tensor::cat(&[labels, &null_labels], 0);
    let output = model.forward_t(&xs2, &timesteps2, Some(&labels2), false);
    let chunks = output.chunk(2, 0);
    let (cond, uncond) = (&chunks[0], &chunks[1]);
    let channels = xs.size()[1];
    if cond.size()[1] == channels {
        Ok(uncond + (cond - uncond) * scale)
    } else {
        let cond_mean = cond.narrow(1, 0, channels);
        let uncond_mean = uncond.narrow(1, 0, channels);
        let rest = cond.narrow(1, channels, cond.size()[1] - channels);
        let mean = &uncond_mean + (cond_mean - &uncond_mean) * scale;
        Ok(Tensor::cat(&[mean, rest], 1))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tch::Device;

    /// A denoiser returning its input shifted by the label, which makes the conditional
    /// and unconditional branches easy to tell apart.
    pub(crate) struct LabelShift {
        pub num_classes: i64,
        pub out_factor: i64,
    }

    impl Denoiser for LabelShift {
        fn forward_t(&self, xs: &Tensor, _t: &Tensor, labels: Option<&Tensor>, _train: bool) -> Tensor {
            let shift = match labels {
                Some(labels) => labels.to_kind(Kind::Float).view([-1, 1, 1, 1]),
                None => Tensor::zeros([1], (Kind::Float, xs.device())),
            };
            let out = xs + shift;
            if self.out_factor == 2 {
                Tensor::cat(&[&out, &out.full_like(-3.)], 1)
            } else {
                out
            }
        }

        fn in_channels(&self) -> i64 {
            3
        }

        fn num_classes(&self) -> Option<i64> {
            Some(self.num_classes)
        }
    }

    /// Two logits `(s, -s)` with `s` the sum of the input, so that
    /// `d log p(0 | x) / dx = 2 sigmoid(-2 s)` for every element and the opposite for label 1.
    pub(crate) struct LinearClassifier;

    impl Classifier for LinearClassifier {
        fn logits(&self, xs: &Tensor, _timesteps: &Tensor) -> Result<Tensor> {
            let s = xs.flatten(1, -1).sum_dim_intlist(Some([1i64].as_slice()), true, Kind::Float);
            Ok(Tensor::cat(&[&s, &(-&s)], 1))
        }
    }

    fn sigmoid(x: f64) -> f64 {
        1. / (1. + (-x).exp())
    }

    #[test]
    fn classifier_gradient_matches_closed_form() {
        let _no_grad = tch::no_grad_guard();
        // 12 elements at 0.1 per example, s = 1.2.
        let xs = Tensor::full([2, 3, 2, 2], 0.1, (Kind::Float, Device::Cpu));
        let t = Tensor::zeros([2], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice(&[0i64, 1]);
        let grad = classifier_gradient(&LinearClassifier, &xs, &t, &labels, 0.5).unwrap();
        assert_eq!(grad.size(), vec![2, 3, 2, 2]);
        let expected0 = 0.5 * 2. * sigmoid(-2.4);
        let expected1 = -0.5 * 2. * sigmoid(2.4);
        assert!((grad.double_value(&[0, 1, 1, 0]) - expected0).abs() < 1e-6);
        assert!((grad.double_value(&[1, 2, 0, 1]) - expected1).abs() < 1e-6);
        // Gradient tracking is off again once the call returns.
        assert!(!grad.requires_grad());
        let w = Tensor::ones([2], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        assert!(!(&w * 2.).requires_grad());
    }

    struct ShortTable;

    impl Denoiser for ShortTable {
        fn forward_t(&self, xs: &Tensor, _t: &Tensor, _labels: Option<&Tensor>, _train: bool) -> Tensor {
            xs.shallow_clone()
        }

        fn in_channels(&self) -> i64 {
            3
        }

        fn num_classes(&self) -> Option<i64> {
            Some(10)
        }

        fn label_table_rows(&self) -> Option<i64> {
            Some(10)
        }
    }

    #[test]
    fn the_null_class_needs_a_row() {
        let labels = Tensor::from_slice(&[1i64]);
        assert!(matches!(check_null_class(&ShortTable, &labels), Err(Error::Config(_))));
        let model = LabelShift { num_classes: 10, out_factor: 1 };
        assert_eq!(model.label_table_rows(), Some(11));
        assert_eq!(check_null_class(&model, &labels).unwrap(), 10);
    }

    #[test]
    fn unit_scale_skips_the_unconditional_branch() {
        let model = LabelShift { num_classes: 10, out_factor: 1 };
        let xs = Tensor::zeros([2, 3, 2, 2], (Kind::Float, Device::Cpu));
        let t = Tensor::zeros([2], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice(&[1i64, 2]);
        let out = guided_forward(&model, &xs, &t, Some(&labels), 1.).unwrap();
        assert_eq!(out.size(), vec![2, 3, 2, 2]);
        assert_eq!(out.double_value(&[1, 0, 0, 0]), 2.);
    }

    #[test]
    fn guidance_extrapolates_from_the_null_class() {
        let model = LabelShift { num_classes: 10, out_factor: 2 };
        let xs = Tensor::zeros([2, 3, 2, 2], (Kind::Float, Device::Cpu));
        let t = Tensor::zeros([2], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice(&[1i64, 2]);
        let out = guided_forward(&model, &xs, &t, Some(&labels), 2.).unwrap();
        assert_eq!(out.size(), vec![2, 6, 2, 2]);
        // uncond = 10, cond = 1: 10 + 2 * (1 - 10) = -8
        assert_eq!(out.double_value(&[0, 0, 0, 0]), -8.);
        assert_eq!(out.double_value(&[0, 4, 0, 0]), -3.);
    }

    #[test]
    fn labels_must_fit_the_label_table() {
        let model = LabelShift { num_classes: 10, out_factor: 1 };
        assert!(check_null_class(&model, &Tensor::from_slice(&[3i64, 9])).is_ok());
        assert!(matches!(check_null_class(&model, &Tensor::from_slice(&[10i64])), Err(Error::Config(_))));
    }
}
