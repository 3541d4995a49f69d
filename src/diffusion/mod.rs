//! # Gaussian diffusion
//!
//! The forward process noises an image `x_0` into `x_t = sqrt(a_t) x_0 + sqrt(1 - a_t) eps`
//! where `a_t` is the cumulative product of `1 - beta`. This module owns the tables derived
//! from the noise schedule, the reverse-process mean and variance, and the training losses.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
//! Improved Denoising Diffusion Probabilistic Models, A. Nichol, P. Dhariwal, 2021.
//! https://arxiv.org/abs/2102.09672
use crate::error::{Error, Result};
use crate::models::Denoiser;
use crate::schedulers::NoiseSchedule;
use crate::utils::all_finite;
use std::str::FromStr;
use tch::{Kind, Tensor};

pub mod losses;
pub mod resample;
pub mod respace;

use losses::{discretized_gaussian_log_likelihood, mean_flat, normal_kl};

/// Log signal-to-noise ratios are clamped to this range before weighting, the end points
/// of the schedule would otherwise give infinite weights.
const LOG_SNR_CLAMP: f64 = 20.;

/// Default `k` for the SNR-clipped weightings when the name has no suffix.
const DEFAULT_SNR_K: f64 = 5.;

/// Which quantity the denoiser predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeanType {
    /// The mean of `x_{t-1}`.
    PreviousX,
    /// The clean sample `x_0`.
    StartX,
    /// The noise that was added.
    Epsilon,
    /// `sqrt(a_t) eps - sqrt(1 - a_t) x_0`, see section 2.4 of
    /// https://imagen.research.google/video/paper.pdf
    Velocity,
}

/// How the reverse-process variance is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    /// beta_t, except at t = 0 where the posterior variance is used.
    FixedLarge,
    /// The posterior variance of q(x_{t-1} | x_t, x_0).
    FixedSmall,
    /// The denoiser outputs the log-variance directly.
    Learned,
    /// The denoiser outputs an interpolation factor in [-1, 1] between the two fixed
    /// log-variances.
    LearnedRange,
}

impl VarType {
    pub fn is_learned(&self) -> bool {
        matches!(self, Self::Learned | Self::LearnedRange)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossType {
    Mse,
    L1,
    /// Regression loss with the variational bound rescaled to the 1000 step range.
    RescaledMse,
    /// The variational lower bound.
    Kl,
    /// The variational lower bound multiplied by the number of steps.
    RescaledKl,
    /// Regression in noise space whatever the mean type, residuals have unit scale at
    /// every timestep.
    MappedMse,
    /// Regression loss plus the variational bound.
    Mixed,
}

impl LossType {
    pub fn is_kl(&self) -> bool {
        matches!(self, Self::Kl | Self::RescaledKl)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Mse => "MSE",
            Self::L1 => "L1",
            Self::RescaledMse => "RESCALED_MSE",
            Self::Kl => "KL",
            Self::RescaledKl => "RESCALED_KL",
            Self::MappedMse => "MAPPED_MSE",
            Self::Mixed => "MIXED",
        }
    }
}

/// Per-timestep weighting of the regression loss, as a function of `SNR(t) = a_t / (1 - a_t)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightType {
    Constant,
    /// min(SNR, k)
    MinSnr(f64),
    /// min(SNR, k) / (SNR + 1)
    VMinSnr(f64),
    /// max(SNR, k)
    MaxSnr(f64),
    /// 0 when SNR < 1, SNR otherwise.
    TruncSnr,
    Snr,
    InvSnr,
}

impl WeightType {
    pub fn weight(&self, log_snr: f64) -> f64 {
        let snr = log_snr.clamp(-LOG_SNR_CLAMP, LOG_SNR_CLAMP).exp();
        match *self {
            Self::Constant => 1.,
            Self::MinSnr(k) => snr.min(k),
            Self::VMinSnr(k) => snr.min(k) / (snr + 1.),
            Self::MaxSnr(k) => snr.max(k),
            Self::TruncSnr => {
                if snr < 1. {
                    0.
                } else {
                    snr
                }
            }
            Self::Snr => snr,
            Self::InvSnr => 1. / snr,
        }
    }
}

fn parse_snr_k(name: &str, prefix: &str) -> Option<Result<f64>> {
    let rest = name.strip_prefix(prefix)?;
    let k = match rest.strip_prefix('_') {
        None if rest.is_empty() => return Some(Ok(DEFAULT_SNR_K)),
        None => return None,
        Some("k") => DEFAULT_SNR_K,
        Some(k) => match k.parse::<f64>() {
            Ok(k) => k,
            Err(_) => return Some(Err(Error::config(format!("invalid k in weight type {name}")))),
        },
    };
    if k > 0. {
        Some(Ok(k))
    } else {
        Some(Err(Error::config(format!("weight type {name} needs k > 0"))))
    }
}

impl FromStr for WeightType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.to_lowercase();
        match name.as_str() {
            "constant" => return Ok(Self::Constant),
            "trunc_snr" => return Ok(Self::TruncSnr),
            "snr" => return Ok(Self::Snr),
            "inv_snr" => return Ok(Self::InvSnr),
            _ => {}
        }
        // vmin must be tried before min as "vmin_snr" does not start with "min_snr".
        if let Some(k) = parse_snr_k(&name, "vmin_snr") {
            return k.map(Self::VMinSnr);
        }
        if let Some(k) = parse_snr_k(&name, "min_snr") {
            return k.map(Self::MinSnr);
        }
        if let Some(k) = parse_snr_k(&name, "max_snr") {
            return k.map(Self::MaxSnr);
        }
        Err(Error::config(format!("unknown weight type {s}")))
    }
}

impl FromStr for MeanType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "PREVIOUS_X" => Ok(Self::PreviousX),
            "START_X" => Ok(Self::StartX),
            "EPSILON" => Ok(Self::Epsilon),
            "VELOCITY" => Ok(Self::Velocity),
            _ => Err(Error::config(format!("unknown mean type {s}"))),
        }
    }
}

impl FromStr for VarType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "FIXED_LARGE" => Ok(Self::FixedLarge),
            "FIXED_SMALL" => Ok(Self::FixedSmall),
            "LEARNED" => Ok(Self::Learned),
            "LEARNED_RANGE" => Ok(Self::LearnedRange),
            _ => Err(Error::config(format!("unknown variance type {s}"))),
        }
    }
}

impl FromStr for LossType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "MSE" => Ok(Self::Mse),
            "L1" => Ok(Self::L1),
            "RESCALED_MSE" => Ok(Self::RescaledMse),
            "KL" => Ok(Self::Kl),
            "RESCALED_KL" => Ok(Self::RescaledKl),
            "MAPPED_MSE" => Ok(Self::MappedMse),
            "MIXED" => Ok(Self::Mixed),
            _ => Err(Error::config(format!("unknown loss type {s}"))),
        }
    }
}

/// The mean, variance and loss settings of a diffusion process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffusionConfig {
    pub mean_type: MeanType,
    pub var_type: VarType,
    pub loss_type: LossType,
    pub weight_type: WeightType,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            mean_type: MeanType::Epsilon,
            var_type: VarType::FixedLarge,
            loss_type: LossType::MappedMse,
            weight_type: WeightType::Constant,
        }
    }
}

impl DiffusionConfig {
    /// Checks that the loss can be computed from what the denoiser predicts.
    pub fn validate(&self) -> Result<()> {
        let needs_variance = self.loss_type.is_kl() || self.loss_type == LossType::Mixed;
        if needs_variance && !self.var_type.is_learned() {
            return Err(Error::config(format!(
                "loss {:?} needs a predicted variance but the variance type is {:?}",
                self.loss_type, self.var_type
            )));
        }
        Ok(())
    }
}

/// The reverse-process distribution at one step.
#[derive(Debug)]
pub struct MeanVariance {
    pub mean: Tensor,
    pub variance: Tensor,
    pub log_variance: Tensor,
    pub pred_xstart: Tensor,
}

/// Per-example training terms.
#[derive(Debug)]
pub struct TrainingLosses {
    /// The weighted loss to minimize, shape (batch,).
    pub loss: Tensor,
    /// The unweighted regression residual, when the loss type has one.
    pub mse: Option<Tensor>,
    /// The variational bound term in bits per dimension, when computed.
    pub vb: Option<Tensor>,
}

/// A diffusion process over a fixed noise schedule.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    num_timesteps: usize,
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    log_betas: Vec<f64>,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    fixed_large_variance: Vec<f64>,
    fixed_large_log_variance: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
    loss_weights: Vec<f64>,
    /// The index in the original process of each step, identity unless respaced.
    timestep_map: Vec<i64>,
    original_num_steps: usize,
    pub config: DiffusionConfig,
}

impl GaussianDiffusion {
    pub fn new(schedule: &NoiseSchedule, config: DiffusionConfig) -> Result<Self> {
        let timestep_map = (0..schedule.len() as i64).collect();
        Self::with_timestep_map(schedule, config, timestep_map, schedule.len())
    }

    pub(crate) fn with_timestep_map(
        schedule: &NoiseSchedule,
        config: DiffusionConfig,
        timestep_map: Vec<i64>,
        original_num_steps: usize,
    ) -> Result<Self> {
        config.validate()?;
        let betas = schedule.betas().to_vec();
        let num_timesteps = betas.len();
        let alphas_cumprod = schedule.alphas_cumprod();
        let alphas_cumprod_prev: Vec<f64> =
            std::iter::once(1.).chain(alphas_cumprod[..num_timesteps - 1].iter().copied()).collect();

        let map = |f: &dyn Fn(usize) -> f64| (0..num_timesteps).map(f).collect::<Vec<f64>>();
        let sqrt_alphas_cumprod = map(&|i| alphas_cumprod[i].sqrt());
        let sqrt_one_minus_alphas_cumprod = map(&|i| (1. - alphas_cumprod[i]).sqrt());
        let log_one_minus_alphas_cumprod = map(&|i| (-alphas_cumprod[i]).ln_1p());
        let log_betas = map(&|i| betas[i].ln());
        let sqrt_recip_alphas_cumprod = map(&|i| (1. / alphas_cumprod[i]).sqrt());
        let sqrt_recipm1_alphas_cumprod = map(&|i| (1. / alphas_cumprod[i] - 1.).sqrt());
        let posterior_variance =
            map(&|i| betas[i] * (1. - alphas_cumprod_prev[i]) / (1. - alphas_cumprod[i]));
        // The posterior variance is 0 at the start of the chain, the log is clipped by
        // reusing the value of the next step.
        let posterior_log_variance_clipped = map(&|i| {
            let v = if i == 0 && num_timesteps > 1 { posterior_variance[1] } else { posterior_variance[i] };
            v.max(1e-20).ln()
        });
        let fixed_large_variance =
            map(&|i| if i == 0 && num_timesteps > 1 { posterior_variance[1] } else { betas[i] });
        let fixed_large_log_variance = map(&|i| fixed_large_variance[i].max(1e-20).ln());
        let posterior_mean_coef1 =
            map(&|i| betas[i] * alphas_cumprod_prev[i].sqrt() / (1. - alphas_cumprod[i]));
        let posterior_mean_coef2 = map(&|i| {
            (1. - alphas_cumprod_prev[i]) * (1. - betas[i]).sqrt() / (1. - alphas_cumprod[i])
        });
        let loss_weights = map(&|i| {
            let log_snr = alphas_cumprod[i].ln() - log_one_minus_alphas_cumprod[i];
            config.weight_type.weight(log_snr)
        });
        Ok(Self {
            num_timesteps,
            betas,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            log_betas,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            fixed_large_variance,
            fixed_large_log_variance,
            posterior_mean_coef1,
            posterior_mean_coef2,
            loss_weights,
            timestep_map,
            original_num_steps,
            config,
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn posterior_variance(&self) -> &[f64] {
        &self.posterior_variance
    }

    pub fn timestep_map(&self) -> &[i64] {
        &self.timestep_map
    }

    /// The per-timestep multipliers applied to the regression loss.
    pub fn loss_weights(&self) -> &[f64] {
        &self.loss_weights
    }

    /// Gathers `arr[t]` for each example and reshapes it so that it broadcasts against `like`.
    fn extract(&self, arr: &[f64], t: &Tensor, like: &Tensor) -> Tensor {
        let mut shape = vec![-1i64];
        shape.resize(like.dim(), 1);
        Tensor::from_slice(arr)
            .to_device(t.device())
            .index_select(0, t)
            .to_kind(like.kind())
            .view(shape.as_slice())
    }

    /// The timesteps as seen by the denoiser: indexes in the original process scaled to
    /// the [0, 1000) range used at training time.
    pub fn scale_timesteps(&self, t: &Tensor) -> Tensor {
        let map = Tensor::from_slice(&self.timestep_map).to_device(t.device());
        map.index_select(0, t).to_kind(Kind::Float) * (1000. / self.original_num_steps as f64)
    }

    /// Noises `x_start` to step `t`.
    pub fn q_sample(&self, x_start: &Tensor, t: &Tensor, noise: &Tensor) -> Tensor {
        self.extract(&self.sqrt_alphas_cumprod, t, x_start) * x_start
            + self.extract(&self.sqrt_one_minus_alphas_cumprod, t, x_start) * noise
    }

    /// Mean, variance and clipped log-variance of `q(x_{t-1} | x_t, x_0)`.
    pub fn q_posterior_mean_variance(&self, x_start: &Tensor, x_t: &Tensor, t: &Tensor) -> (Tensor, Tensor, Tensor) {
        let mean = self.extract(&self.posterior_mean_coef1, t, x_t) * x_start
            + self.extract(&self.posterior_mean_coef2, t, x_t) * x_t;
        let variance = self.extract(&self.posterior_variance, t, x_t);
        let log_variance = self.extract(&self.posterior_log_variance_clipped, t, x_t);
        (mean, variance, log_variance)
    }

    pub fn predict_xstart_from_eps(&self, x_t: &Tensor, t: &Tensor, eps: &Tensor) -> Tensor {
        self.extract(&self.sqrt_recip_alphas_cumprod, t, x_t) * x_t
            - self.extract(&self.sqrt_recipm1_alphas_cumprod, t, x_t) * eps
    }

    pub fn predict_eps_from_xstart(&self, x_t: &Tensor, t: &Tensor, pred_xstart: &Tensor) -> Tensor {
        (self.extract(&self.sqrt_recip_alphas_cumprod, t, x_t) * x_t - pred_xstart)
            / self.extract(&self.sqrt_recipm1_alphas_cumprod, t, x_t)
    }

    fn predict_xstart_from_xprev(&self, x_t: &Tensor, t: &Tensor, xprev: &Tensor) -> Tensor {
        let coef1 = self.extract(&self.posterior_mean_coef1, t, x_t);
        let coef2 = self.extract(&self.posterior_mean_coef2, t, x_t);
        (xprev - coef2 * x_t) / coef1
    }

    fn predict_xstart_from_v(&self, x_t: &Tensor, t: &Tensor, v: &Tensor) -> Tensor {
        self.extract(&self.sqrt_alphas_cumprod, t, x_t) * x_t
            - self.extract(&self.sqrt_one_minus_alphas_cumprod, t, x_t) * v
    }

    /// The velocity target `sqrt(a_t) eps - sqrt(1 - a_t) x_0`.
    pub fn velocity(&self, x_start: &Tensor, t: &Tensor, noise: &Tensor) -> Tensor {
        self.extract(&self.sqrt_alphas_cumprod, t, x_start) * noise
            - self.extract(&self.sqrt_one_minus_alphas_cumprod, t, x_start) * x_start
    }

    /// Converts the mean part of a denoiser output into a prediction of `x_0`.
    pub fn pred_xstart_from_output(&self, output: &Tensor, x_t: &Tensor, t: &Tensor) -> Tensor {
        match self.config.mean_type {
            MeanType::PreviousX => self.predict_xstart_from_xprev(x_t, t, output),
            MeanType::StartX => output.shallow_clone(),
            MeanType::Epsilon => self.predict_xstart_from_eps(x_t, t, output),
            MeanType::Velocity => self.predict_xstart_from_v(x_t, t, output),
        }
    }

    /// Converts the mean part of a denoiser output into a prediction of the noise.
    pub fn eps_from_output(&self, output: &Tensor, x_t: &Tensor, t: &Tensor) -> Tensor {
        match self.config.mean_type {
            MeanType::Epsilon => output.shallow_clone(),
            MeanType::Velocity => {
                self.extract(&self.sqrt_alphas_cumprod, t, x_t) * output
                    + self.extract(&self.sqrt_one_minus_alphas_cumprod, t, x_t) * x_t
            }
            MeanType::PreviousX | MeanType::StartX => {
                let pred_xstart = self.pred_xstart_from_output(output, x_t, t);
                self.predict_eps_from_xstart(x_t, t, &pred_xstart)
            }
        }
    }

    /// Splits a raw denoiser output into its mean part and, for learned variances, its
    /// variance part.
    pub fn split_output(&self, output: &Tensor, x_t: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        let channels = x_t.size()[1];
        let out_channels = output.size()[1];
        if self.config.var_type.is_learned() {
            if out_channels != 2 * channels {
                return Err(Error::config(format!(
                    "learned variance needs {} output channels, got {out_channels}",
                    2 * channels
                )));
            }
            Ok((output.narrow(1, 0, channels), Some(output.narrow(1, channels, channels))))
        } else {
            if out_channels != channels {
                return Err(Error::config(format!(
                    "expected {channels} output channels, got {out_channels}"
                )));
            }
            Ok((output.shallow_clone(), None))
        }
    }

    /// Computes the reverse-process distribution from a raw denoiser output.
    pub fn mean_variance_from_output(
        &self,
        output: &Tensor,
        x_t: &Tensor,
        t: &Tensor,
        clip_denoised: bool,
    ) -> Result<MeanVariance> {
        let (mean_output, var_output) = self.split_output(output, x_t)?;
        let (variance, log_variance) = match (self.config.var_type, var_output) {
            (VarType::Learned, Some(log_variance)) => (log_variance.exp(), log_variance),
            (VarType::LearnedRange, Some(values)) => {
                let min_log = self.extract(&self.posterior_log_variance_clipped, t, x_t);
                let max_log = self.extract(&self.log_betas, t, x_t);
                let frac = (values + 1.) / 2.;
                let log_variance = &frac * max_log + (1. - &frac) * min_log;
                (log_variance.exp(), log_variance)
            }
            (VarType::FixedLarge, _) => (
                self.extract(&self.fixed_large_variance, t, x_t),
                self.extract(&self.fixed_large_log_variance, t, x_t),
            ),
            (VarType::FixedSmall, _) => (
                self.extract(&self.posterior_variance, t, x_t),
                self.extract(&self.posterior_log_variance_clipped, t, x_t),
            ),
            (var_type, None) => {
                return Err(Error::config(format!("no variance output for {var_type:?}")))
            }
        };
        let pred_xstart = self.pred_xstart_from_output(&mean_output, x_t, t);
        let pred_xstart = if clip_denoised { pred_xstart.clamp(-1., 1.) } else { pred_xstart };
        let mean = match self.config.mean_type {
            MeanType::PreviousX => mean_output,
            _ => self.q_posterior_mean_variance(&pred_xstart, x_t, t).0,
        };
        Ok(MeanVariance { mean, variance, log_variance, pred_xstart })
    }

    /// Applies the denoiser and returns the distribution of `x_{t-1}`.
    pub fn p_mean_variance(
        &self,
        model: &dyn Denoiser,
        x: &Tensor,
        t: &Tensor,
        labels: Option<&Tensor>,
        clip_denoised: bool,
    ) -> Result<MeanVariance> {
        let output = model.forward_t(x, &self.scale_timesteps(t), labels, false);
        self.mean_variance_from_output(&output, x, t, clip_denoised)
    }

    /// One ancestral sampling step from `x_t` to `x_{t-1}`, no noise is added at t = 0.
    pub fn p_sample(
        &self,
        model: &dyn Denoiser,
        x: &Tensor,
        t: &Tensor,
        labels: Option<&Tensor>,
        clip_denoised: bool,
    ) -> Result<Tensor> {
        let out = self.p_mean_variance(model, x, t, labels, clip_denoised)?;
        let noise = Tensor::randn_like(x);
        let nonzero_mask = self.nonzero_mask(t, x);
        Ok(out.mean + nonzero_mask * (out.log_variance * 0.5).exp() * noise)
    }

    pub(crate) fn nonzero_mask(&self, t: &Tensor, like: &Tensor) -> Tensor {
        let mut shape = vec![-1i64];
        shape.resize(like.dim(), 1);
        t.ne(0).to_kind(like.kind()).view(shape.as_slice())
    }

    /// The variational bound term for one step in bits per dimension: the KL between the
    /// true and predicted posteriors, or the decoder negative log-likelihood at t = 0.
    pub fn vb_terms_bpd(&self, x_start: &Tensor, x_t: &Tensor, t: &Tensor, out: &MeanVariance) -> Tensor {
        let (true_mean, _, true_log_variance) = self.q_posterior_mean_variance(x_start, x_t, t);
        let kl = normal_kl(&true_mean, &true_log_variance, &out.mean, &out.log_variance);
        let kl = mean_flat(&kl) / std::f64::consts::LN_2;
        let decoder_nll =
            -discretized_gaussian_log_likelihood(x_start, &out.mean, &(&out.log_variance * 0.5));
        let decoder_nll = mean_flat(&decoder_nll) / std::f64::consts::LN_2;
        decoder_nll.where_self(&t.eq(0), &kl)
    }

    /// The regression target implied by the mean type.
    fn target(&self, x_start: &Tensor, x_t: &Tensor, t: &Tensor, noise: &Tensor) -> Tensor {
        match self.config.mean_type {
            MeanType::PreviousX => self.q_posterior_mean_variance(x_start, x_t, t).0,
            MeanType::StartX => x_start.shallow_clone(),
            MeanType::Epsilon => noise.shallow_clone(),
            MeanType::Velocity => self.velocity(x_start, t, noise),
        }
    }

    /// Draws fresh noise and computes the training losses for a batch.
    pub fn training_losses(
        &self,
        model: &dyn Denoiser,
        x_start: &Tensor,
        t: &Tensor,
        labels: Option<&Tensor>,
    ) -> Result<TrainingLosses> {
        let noise = Tensor::randn_like(x_start);
        self.training_losses_with_noise(model, x_start, t, labels, &noise)
    }

    /// Computes the training losses for a batch using the given noise realisation. The
    /// denoiser is evaluated exactly once.
    pub fn training_losses_with_noise(
        &self,
        model: &dyn Denoiser,
        x_start: &Tensor,
        t: &Tensor,
        labels: Option<&Tensor>,
        noise: &Tensor,
    ) -> Result<TrainingLosses> {
        let x_t = self.q_sample(x_start, t, noise);
        let output = model.forward_t(&x_t, &self.scale_timesteps(t), labels, true);
        let weights = self.extract(&self.loss_weights, t, &Tensor::zeros([1], (Kind::Float, t.device())));
        let losses = match self.config.loss_type {
            LossType::Kl | LossType::RescaledKl => {
                let out = self.mean_variance_from_output(&output, &x_t, t, false)?;
                let vb = self.vb_terms_bpd(x_start, &x_t, t, &out);
                let loss = if self.config.loss_type == LossType::RescaledKl {
                    &vb * self.num_timesteps as f64
                } else {
                    vb.shallow_clone()
                };
                TrainingLosses { loss: loss * weights, mse: None, vb: Some(vb) }
            }
            loss_type => {
                let (mean_output, var_output) = self.split_output(&output, &x_t)?;
                // The variance is only trained through the bound, gradients do not reach
                // the mean prediction from this term.
                let vb = match var_output {
                    Some(var_output) => {
                        let frozen = Tensor::cat(&[mean_output.detach(), var_output], 1);
                        let out = self.mean_variance_from_output(&frozen, &x_t, t, false)?;
                        let vb = self.vb_terms_bpd(x_start, &x_t, t, &out);
                        if loss_type == LossType::RescaledMse {
                            Some(vb * (self.num_timesteps as f64 / 1000.))
                        } else {
                            Some(vb)
                        }
                    }
                    None => None,
                };
                let mse = match loss_type {
                    LossType::L1 => {
                        mean_flat(&(self.target(x_start, &x_t, t, noise) - &mean_output).abs())
                    }
                    LossType::MappedMse => {
                        let eps = self.eps_from_output(&mean_output, &x_t, t);
                        mean_flat(&(noise - eps).square())
                    }
                    _ => mean_flat(&(self.target(x_start, &x_t, t, noise) - &mean_output).square()),
                };
                let loss = match &vb {
                    Some(vb) => &mse * weights + vb,
                    None => &mse * weights,
                };
                TrainingLosses { loss, mse: Some(mse), vb }
            }
        };
        if !all_finite(&losses.loss) {
            return Err(Error::Numerical(format!(
                "non-finite training loss for {:?} at timesteps {:?}",
                self.config.loss_type,
                Vec::<i64>::try_from(t.to_device(tch::Device::Cpu)).unwrap_or_default()
            )));
        }
        Ok(losses)
    }
}
