//! # Denoising Diffusion Implicit Models
//!
//! The Denoising Diffusion Implicit Models (DDIM) sampler shares its marginals with the
//! ancestral sampler of the diffusion process but uses a non-Markovian reverse process,
//! which stays accurate with a few dozen steps and is deterministic when `eta = 0`.
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use super::guidance::{check_null_class, classifier_gradient, guided_forward};
use super::{check_decoder, finish_sample};
use crate::diffusion::respace::RespacedDiffusion;
use crate::diffusion::DiffusionConfig;
use crate::error::{Error, Result};
use crate::models::{Classifier, Denoiser, LatentDecoder};
use crate::schedulers::NoiseSchedule;
use crate::utils::float_equal;
use tch::{Kind, Tensor};

/// The configuration for the DDIM sampler.
#[derive(Debug, Clone, Copy)]
pub struct DDIMSamplerConfig {
    /// The number of reverse steps.
    pub num_steps: usize,
    /// The amount of noise to be added at each step, 0 gives the deterministic sampler.
    pub eta: f64,
    /// Clamp the predicted clean sample to [-1, 1] at each step.
    pub clip_denoised: bool,
    /// Classifier-free guidance scale, 1 disables it.
    pub guidance_scale: f64,
    /// Scale of the classifier gradient when a classifier is supplied.
    pub classifier_scale: f64,
}

impl Default for DDIMSamplerConfig {
    fn default() -> Self {
        Self { num_steps: 50, eta: 0., clip_denoised: true, guidance_scale: 1., classifier_scale: 1. }
    }
}

/// The DDIM sampler.
#[derive(Debug, Clone)]
pub struct DDIMSampler {
    diffusion: RespacedDiffusion,
    pub config: DDIMSamplerConfig,
}

impl DDIMSampler {
    /// Creates a new DDIM sampler walking `config.num_steps` steps of a process trained
    /// with `schedule`. The steps are strided the same way as at training time when
    /// fewer steps than the training ones are requested.
    pub fn new(schedule: &NoiseSchedule, diffusion_config: DiffusionConfig, config: DDIMSamplerConfig) -> Result<Self> {
        if config.num_steps < 1 {
            return Err(Error::config("the DDIM sampler needs at least one step"));
        }
        let section_counts = if config.num_steps < schedule.len() {
            format!("ddim{}", config.num_steps)
        } else {
            schedule.len().to_string()
        };
        let diffusion = RespacedDiffusion::from_section_counts(schedule, diffusion_config, &section_counts)?;
        Ok(Self { diffusion, config })
    }

    /// The original timesteps visited, in decreasing order.
    pub fn timesteps(&self) -> Vec<usize> {
        self.diffusion.use_timesteps().iter().rev().copied().collect()
    }

    pub fn diffusion(&self) -> &RespacedDiffusion {
        &self.diffusion
    }

    /// Performs a backward step from respaced index `index`.
    pub fn step(
        &self,
        model: &dyn Denoiser,
        xs: &Tensor,
        index: usize,
        labels: Option<&Tensor>,
        classifier: Option<&dyn Classifier>,
    ) -> Result<Tensor> {
        let diffusion = &self.diffusion;
        let batch = xs.size()[0];
        let t = Tensor::full([batch], index as i64, (Kind::Int64, xs.device()));
        let scaled_t = diffusion.scale_timesteps(&t);
        let output = guided_forward(model, xs, &scaled_t, labels, self.config.guidance_scale)?;
        let out = diffusion.mean_variance_from_output(&output, xs, &t, self.config.clip_denoised)?;

        let alpha_prod_t = diffusion.alphas_cumprod()[index];
        let alpha_prod_t_prev = if index > 0 { diffusion.alphas_cumprod()[index - 1] } else { 1. };

        let mut pred_epsilon = diffusion.predict_eps_from_xstart(xs, &t, &out.pred_xstart);
        let mut pred_original_sample = out.pred_xstart;
        if let (Some(classifier), Some(labels)) = (classifier, labels) {
            let grad = classifier_gradient(classifier, xs, &scaled_t, labels, self.config.classifier_scale)?;
            pred_epsilon = pred_epsilon - grad * (1. - alpha_prod_t).sqrt();
            pred_original_sample = diffusion.predict_xstart_from_eps(xs, &t, &pred_epsilon);
        }

        let variance =
            (1. - alpha_prod_t_prev) / (1. - alpha_prod_t) * (1. - alpha_prod_t / alpha_prod_t_prev);
        let std_dev_t = self.config.eta * variance.sqrt();

        let pred_sample_direction =
            (1. - alpha_prod_t_prev - std_dev_t * std_dev_t).max(0.).sqrt() * pred_epsilon;
        let prev_sample = alpha_prod_t_prev.sqrt() * pred_original_sample + pred_sample_direction;
        if self.config.eta > 0. && index > 0 {
            Ok(&prev_sample + Tensor::randn_like(&prev_sample) * std_dev_t)
        } else {
            Ok(prev_sample)
        }
    }

    /// Runs the whole reverse chain starting from `noise`, decoding latents to pixels when
    /// the denoiser works in a latent space.
    pub fn sample(
        &self,
        model: &dyn Denoiser,
        noise: &Tensor,
        labels: Option<&Tensor>,
        classifier: Option<&dyn Classifier>,
        decoder: Option<&dyn LatentDecoder>,
    ) -> Result<Tensor> {
        let _no_grad_guard = tch::no_grad_guard();
        check_decoder(model, decoder)?;
        if let Some(labels) = labels {
            if !float_equal(self.config.guidance_scale, 1.) {
                check_null_class(model, labels)?;
            }
        }
        let mut xs = noise.shallow_clone();
        for index in (0..self.diffusion.num_timesteps()).rev() {
            xs = self.step(model, &xs, index, labels, classifier)?;
        }
        finish_sample(model, xs, decoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedulers::guidance::tests::LinearClassifier;
    use crate::schedulers::BetaSchedule;
    use tch::Device;

    struct Identity;

    impl Denoiser for Identity {
        fn forward_t(&self, xs: &Tensor, _t: &Tensor, _labels: Option<&Tensor>, _train: bool) -> Tensor {
            xs.shallow_clone()
        }

        fn in_channels(&self) -> i64 {
            3
        }

        fn num_classes(&self) -> Option<i64> {
            None
        }
    }

    fn config(num_steps: usize) -> DDIMSamplerConfig {
        DDIMSamplerConfig { num_steps, clip_denoised: false, ..Default::default() }
    }

    #[test]
    fn zero_steps_are_rejected() {
        let schedule = NoiseSchedule::new(BetaSchedule::Cosine, 100).unwrap();
        assert!(matches!(DDIMSampler::new(&schedule, Default::default(), config(0)), Err(Error::Config(_))));
    }

    #[test]
    fn single_step_matches_closed_form() {
        tch::manual_seed(0);
        let schedule = NoiseSchedule::new(BetaSchedule::Cosine, 100).unwrap();
        let sampler = DDIMSampler::new(&schedule, Default::default(), config(1)).unwrap();
        assert_eq!(sampler.timesteps(), vec![0]);
        let noise = Tensor::randn([2, 3, 4, 4], (Kind::Float, Device::Cpu));
        let out = sampler.sample(&Identity, &noise, None, None, None).unwrap();
        let a0 = schedule.alphas_cumprod()[0];
        let factor = (1. - (1. - a0).sqrt()) / a0.sqrt();
        let err = (out - &noise * factor).abs().max().double_value(&[]);
        assert!(err < 1e-5, "max error {err}");
    }

    #[test]
    fn timesteps_are_strided_and_decreasing() {
        let schedule = NoiseSchedule::new(BetaSchedule::Cosine, 1000).unwrap();
        let sampler = DDIMSampler::new(&schedule, Default::default(), config(50)).unwrap();
        let timesteps = sampler.timesteps();
        assert_eq!(timesteps.len(), 50);
        assert_eq!(timesteps[0], 980);
        assert_eq!(timesteps[49], 0);
    }

    #[test]
    fn classifier_shifts_the_predicted_noise() {
        let _no_grad = tch::no_grad_guard();
        let schedule = NoiseSchedule::new(BetaSchedule::Cosine, 100).unwrap();
        let config = DDIMSamplerConfig { classifier_scale: 0.5, ..config(10) };
        let sampler = DDIMSampler::new(&schedule, Default::default(), config).unwrap();
        // At x = 0 the identity denoiser predicts eps = 0 and the classifier gradient is
        // +0.5 for label 0, -0.5 for label 1. The shifted noise is eps = -g sqrt(1 - a_t).
        let xs = Tensor::zeros([2, 3, 4, 4], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice(&[0i64, 1]);
        let index = 5;
        let plain = sampler.step(&Identity, &xs, index, Some(&labels), None).unwrap();
        assert_eq!(plain.abs().max().double_value(&[]), 0.);
        let guided = sampler.step(&Identity, &xs, index, Some(&labels), Some(&LinearClassifier)).unwrap();
        let a_t = sampler.diffusion().alphas_cumprod()[index];
        let a_prev = sampler.diffusion().alphas_cumprod()[index - 1];
        let g = 0.5;
        let eps = -g * (1. - a_t).sqrt();
        let x0 = -(1. - a_t).sqrt() * eps / a_t.sqrt();
        let expected = a_prev.sqrt() * x0 + (1. - a_prev).sqrt() * eps;
        assert!((guided.double_value(&[0, 0, 0, 0]) - expected).abs() < 1e-5);
        assert!((guided.double_value(&[1, 2, 3, 3]) + expected).abs() < 1e-5);
        assert!(!guided.requires_grad());
    }

    #[test]
    fn eta_zero_is_deterministic() {
        let schedule = NoiseSchedule::new(BetaSchedule::Cosine, 100).unwrap();
        let sampler = DDIMSampler::new(&schedule, Default::default(), config(10)).unwrap();
        let noise = Tensor::randn([1, 3, 4, 4], (Kind::Float, Device::Cpu)) * 0.1;
        let a = sampler.sample(&Identity, &noise, None, None, None).unwrap();
        let b = sampler.sample(&Identity, &noise, None, None, None).unwrap();
        assert!(a.equal(&b));
    }
}
