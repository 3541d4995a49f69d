//! # Heun sampler
//!
//! Second order integration of the probability-flow ODE in the noise-level
//! parameterisation `x_sigma = x_0 + sigma * eps`, with `sigma = sqrt((1 - a_t) / a_t)`.
//! Each step takes an Euler step to the next noise level and corrects it with the
//! slope measured at the end point, the last step down to `sigma = 0` stays first order.
//!
//! Elucidating the Design Space of Diffusion-Based Generative Models, T. Karras et al, 2022.
//! https://arxiv.org/abs/2206.00364
use super::guidance::{check_null_class, classifier_gradient, guided_forward};
use super::{check_decoder, finish_sample, interp};
use crate::diffusion::MeanType;
use crate::error::{Error, Result};
use crate::models::{Classifier, Denoiser, LatentDecoder};
use crate::schedulers::NoiseSchedule;
use crate::utils::float_equal;
use tch::{Kind, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct HeunSamplerConfig {
    /// Number of noise levels visited, the denoiser is called `2 * num_steps - 1` times.
    pub num_steps: usize,
    /// Exponent of the Karras spacing of the noise levels.
    pub rho: f64,
    /// Classifier-free guidance scale, 1 disables it.
    pub guidance_scale: f64,
    /// Scale of the classifier gradient when a classifier is supplied.
    pub classifier_scale: f64,
    /// What the denoiser predicts.
    pub mean_type: MeanType,
}

impl Default for HeunSamplerConfig {
    fn default() -> Self {
        Self {
            num_steps: 18,
            rho: 7.,
            guidance_scale: 1.,
            classifier_scale: 1.,
            mean_type: MeanType::Epsilon,
        }
    }
}

pub struct HeunSampler {
    sigmas: Vec<f64>,
    log_sigmas: Vec<f64>,
    train_indexes: Vec<f64>,
    pub config: HeunSamplerConfig,
}

impl HeunSampler {
    pub fn new(schedule: &NoiseSchedule, config: HeunSamplerConfig) -> Result<Self> {
        if config.num_steps < 1 {
            return Err(Error::config("the Heun sampler needs at least one step"));
        }
        if config.mean_type == MeanType::PreviousX {
            return Err(Error::config("the Heun sampler cannot use a previous-x denoiser"));
        }
        let log_sigmas: Vec<f64> =
            schedule.alphas_cumprod().iter().map(|a| ((1. - a) / a).sqrt().ln()).collect();
        let sigma_min = log_sigmas[0].exp();
        let sigma_max = log_sigmas[log_sigmas.len() - 1].exp();
        let n = config.num_steps;
        let min_inv_rho = sigma_min.powf(1. / config.rho);
        let max_inv_rho = sigma_max.powf(1. / config.rho);
        let mut sigmas: Vec<f64> = (0..n)
            .map(|i| {
                let frac = if n > 1 { i as f64 / (n - 1) as f64 } else { 0. };
                (max_inv_rho + frac * (min_inv_rho - max_inv_rho)).powf(config.rho)
            })
            .collect();
        sigmas.push(0.);
        let train_indexes = (0..log_sigmas.len()).map(|i| i as f64).collect();
        Ok(Self { sigmas, log_sigmas, train_indexes, config })
    }

    /// The noise levels, decreasing and ending with 0.
    pub fn sigmas(&self) -> &[f64] {
        self.sigmas.as_slice()
    }

    pub fn init_noise_sigma(&self) -> f64 {
        self.sigmas[0]
    }

    /// The continuous timestep, in the [0, 1000) range seen at training time, whose noise
    /// level is `sigma`.
    pub fn timestep_for_sigma(&self, sigma: f64) -> f64 {
        let index = interp(sigma.ln(), &self.log_sigmas, &self.train_indexes);
        index * 1000. / self.log_sigmas.len() as f64
    }

    /// The denoised estimate `D(x, sigma) = x - sigma * eps`, the denoiser sees the input
    /// rescaled to unit variance.
    fn denoise(
        &self,
        model: &dyn Denoiser,
        xs: &Tensor,
        sigma: f64,
        labels: Option<&Tensor>,
        classifier: Option<&dyn Classifier>,
    ) -> Result<Tensor> {
        let c_in = 1. / (sigma * sigma + 1.).sqrt();
        let sqrt_alpha = c_in;
        let sqrt_one_minus_alpha = sigma * c_in;
        let xs_in = xs * c_in;
        let batch = xs.size()[0];
        let t = Tensor::full([batch], self.timestep_for_sigma(sigma), (Kind::Float, xs.device()));
        let output = guided_forward(model, &xs_in, &t, labels, self.config.guidance_scale)?;
        let output = output.narrow(1, 0, xs.size()[1]);
        let mut eps = match self.config.mean_type {
            MeanType::Epsilon => output,
            MeanType::StartX => (&xs_in - output * sqrt_alpha) / sqrt_one_minus_alpha,
            MeanType::Velocity => output * sqrt_alpha + &xs_in * sqrt_one_minus_alpha,
            MeanType::PreviousX => {
                return Err(Error::config("the Heun sampler cannot use a previous-x denoiser"))
            }
        };
        if let (Some(classifier), Some(labels)) = (classifier, labels) {
            let grad = classifier_gradient(classifier, &xs_in, &t, labels, self.config.classifier_scale)?;
            eps = eps - grad * sqrt_one_minus_alpha;
        }
        Ok(xs - eps * sigma)
    }

    /// Integrates from `noise`, a unit Gaussian batch, down to a clean sample. Latent
    /// samples are decoded to pixels through `decoder`.
    pub fn sample(
        &self,
        model: &dyn Denoiser,
        noise: &Tensor,
        labels: Option<&Tensor>,
        classifier: Option<&dyn Classifier>,
        decoder: Option<&dyn LatentDecoder>,
    ) -> Result<Tensor> {
        let _no_grad_guard = tch::no_grad_guard();
        if noise.size()[1] != model.in_channels() {
            return Err(Error::config(format!(
                "noise has {} channels but the denoiser expects {}",
                noise.size()[1],
                model.in_channels()
            )));
        }
        check_decoder(model, decoder)?;
        if let Some(labels) = labels {
            if !float_equal(self.config.guidance_scale, 1.) {
                check_null_class(model, labels)?;
            }
        }
        let mut xs = noise * self.sigmas[0];
        let num_steps = self.sigmas.len() - 1;
        for i in 0..num_steps {
            let (sigma, sigma_next) = (self.sigmas[i], self.sigmas[i + 1]);
            let denoised = self.denoise(model, &xs, sigma, labels, classifier)?;
            let derivative = (&xs - denoised) / sigma;
            let dt = sigma_next - sigma;
            let mut xs_next = &xs + &derivative * dt;
            if i < num_steps - 1 {
                // 2nd order correction
                let denoised = self.denoise(model, &xs_next, sigma_next, labels, classifier)?;
                let derivative_next = (&xs_next - denoised) / sigma_next;
                xs_next = &xs + (derivative + derivative_next) * (0.5 * dt);
            }
            xs = xs_next;
        }
        finish_sample(model, xs, decoder)
    }
}
