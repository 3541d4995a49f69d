//! # Noise schedules and reverse-process samplers
//!
//! The noise schedule sets how much of the signal survives at every training step,
//! the samplers walk the reverse process from pure noise back to an image.
use crate::error::{Error, Result};
use crate::models::{Classifier, Denoiser, LatentDecoder};
use std::str::FromStr;
use tch::Tensor;

pub mod ddim;
pub mod guidance;
pub mod heun;

/// Largest beta allowed by the alpha-bar discretisation, avoids singularities close to
/// the end of the schedule.
pub const MAX_BETA: f64 = 0.999;

/// Number of channels of the images produced by the samplers.
pub const PIXEL_CHANNELS: i64 = 3;

/// Scaling applied to autoencoder latents at training time.
pub const LATENT_SCALE: f64 = 0.18215;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BetaSchedule {
    /// Linear interpolation between two endpoints defined for a 1000 step process,
    /// rescaled so that the same endpoints can be used for any step count.
    Linear { beta_start: f64, beta_end: f64 },
    /// Glide cosine schedule
    Cosine,
    /// Generalised cosine schedule where the signal-to-noise ratio follows
    /// `cot(pi s / 2)^(2k)`. `k = 1` gives back the cosine schedule, larger values
    /// concentrate the steps around SNR = 1.
    Optim { k: f64 },
}

impl BetaSchedule {
    /// Resolves a schedule name as used in configuration files.
    pub fn from_name(name: &str, k: f64, beta_start: f64, beta_end: f64) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "linear" => Ok(Self::Linear { beta_start, beta_end }),
            "cosine" => Ok(Self::Cosine),
            "optim" => Ok(Self::Optim { k }),
            other => Err(Error::config(format!("unknown beta schedule {other}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Linear { .. } => "linear",
            Self::Cosine => "cosine",
            Self::Optim { .. } => "optim",
        }
    }

    /// Builds the per-step betas for a process with `num_timesteps` steps.
    pub fn betas(&self, num_timesteps: usize) -> Result<Vec<f64>> {
        if num_timesteps < 1 {
            return Err(Error::config("the number of diffusion steps must be at least 1"));
        }
        match *self {
            Self::Linear { beta_start, beta_end } => {
                let scale = 1000. / num_timesteps as f64;
                let (beta_start, beta_end) = (scale * beta_start, scale * beta_end);
                if !(beta_start > 0. && beta_end < 1. && beta_start <= beta_end) {
                    return Err(Error::config(format!(
                        "linear schedule endpoints ({beta_start}, {beta_end}) out of range for {num_timesteps} steps"
                    )));
                }
                Ok(linspace(beta_start, beta_end, num_timesteps))
            }
            Self::Cosine => Ok(betas_for_alpha_bar(num_timesteps, MAX_BETA, |s| {
                f64::cos(s * std::f64::consts::FRAC_PI_2).powi(2)
            })),
            Self::Optim { k } => {
                if !(k > 0.) {
                    return Err(Error::config(format!("optim schedule needs k > 0, got {k}")));
                }
                Ok(betas_for_alpha_bar(num_timesteps, MAX_BETA, |s| {
                    let tan = f64::tan(s * std::f64::consts::FRAC_PI_2);
                    1. / (1. + tan.powf(2. * k))
                }))
            }
        }
    }
}

/// An immutable sequence of per-step noise variances.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(schedule: BetaSchedule, num_timesteps: usize) -> Result<Self> {
        Self::from_betas(schedule.betas(num_timesteps)?)
    }

    /// Linear schedule using the endpoints as given, without any step-count rescaling.
    pub fn linear_range(beta_start: f64, beta_end: f64, num_timesteps: usize) -> Result<Self> {
        if num_timesteps < 1 {
            return Err(Error::config("the number of diffusion steps must be at least 1"));
        }
        Self::from_betas(linspace(beta_start, beta_end, num_timesteps))
    }

    pub fn from_betas(betas: Vec<f64>) -> Result<Self> {
        if betas.is_empty() {
            return Err(Error::config("empty noise schedule"));
        }
        if let Some(beta) = betas.iter().find(|b| !(**b > 0. && **b < 1.)) {
            return Err(Error::config(format!("beta {beta} is outside of (0, 1)")));
        }
        Ok(Self { betas })
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn len(&self) -> usize {
        self.betas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }

    /// The cumulative products of `1 - beta`.
    pub fn alphas_cumprod(&self) -> Vec<f64> {
        let mut acc = 1.;
        self.betas
            .iter()
            .map(|beta| {
                acc *= 1. - beta;
                acc
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    Ddim,
    Heun,
}

impl FromStr for SamplerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ddim" => Ok(Self::Ddim),
            "heun" => Ok(Self::Heun),
            _ => Err(Error::config(format!("unknown sampler {s}"))),
        }
    }
}

/// One of the reverse-process samplers, selected once at configuration time.
pub enum Sampler {
    Ddim(ddim::DDIMSampler),
    Heun(heun::HeunSampler),
}

impl Sampler {
    /// Generates images in [-1, 1] from a unit Gaussian batch.
    pub fn sample(
        &self,
        model: &dyn Denoiser,
        noise: &Tensor,
        labels: Option<&Tensor>,
        classifier: Option<&dyn Classifier>,
        decoder: Option<&dyn LatentDecoder>,
    ) -> Result<Tensor> {
        match self {
            Self::Ddim(s) => s.sample(model, noise, labels, classifier, decoder),
            Self::Heun(s) => s.sample(model, noise, labels, classifier, decoder),
        }
    }
}

/// Checks that samples of `model` can be turned into pixels.
pub(crate) fn check_decoder(model: &dyn Denoiser, decoder: Option<&dyn LatentDecoder>) -> Result<()> {
    let channels = model.in_channels();
    if channels == PIXEL_CHANNELS {
        return Ok(());
    }
    match decoder {
        Some(decoder) if decoder.latent_channels() == channels => Ok(()),
        Some(decoder) => Err(Error::config(format!(
            "the denoiser has {channels} channels but the decoder expects {}",
            decoder.latent_channels()
        ))),
        None => Err(Error::config(format!(
            "a latent decoder is needed for a denoiser with {channels} channels"
        ))),
    }
}

/// Decodes latent samples, pixel samples are returned unchanged.
pub(crate) fn finish_sample(model: &dyn Denoiser, xs: Tensor, decoder: Option<&dyn LatentDecoder>) -> Result<Tensor> {
    check_decoder(model, decoder)?;
    match decoder {
        Some(decoder) if model.in_channels() != PIXEL_CHANNELS => decoder.decode(&(xs / LATENT_SCALE)),
        _ => Ok(xs),
    }
}

fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    if steps == 1 {
        return vec![start];
    }
    let delta = (end - start) / (steps - 1) as f64;
    (0..steps).map(|i| start + delta * i as f64).collect()
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
///
/// The time argument is shifted by a small offset so that the first beta stays positive
/// even for schedules where `alpha_bar(0) = 1`.
pub(crate) fn betas_for_alpha_bar<F>(num_diffusion_timesteps: usize, max_beta: f64, alpha_bar: F) -> Vec<f64>
where
    F: Fn(f64) -> f64,
{
    let alpha_bar = |s: f64| alpha_bar((s + 0.008) / 1.008);
    (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_diffusion_timesteps as f64;
            let t2 = (i + 1) as f64 / num_diffusion_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

/// One-dimensional linear interpolation for monotonically increasing sample
/// points, mimicking np.interp().
pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let n = xp.len();
    if n == 0 {
        return f64::NAN;
    }
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[n - 1] {
        return fp[n - 1];
    }
    let idx = xp.partition_point(|&v| v <= x).clamp(1, n - 1);
    let (x0, x1, y0, y1) = (xp[idx - 1], xp[idx], fp[idx - 1], fp[idx]);
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_monotonic(schedule: BetaSchedule) {
        let schedule = NoiseSchedule::new(schedule, 1000).unwrap();
        let acp = schedule.alphas_cumprod();
        assert_eq!(acp.len(), 1000);
        assert!(acp.windows(2).all(|w| w[1] <= w[0]), "{schedule:?} is not monotonic");
        assert!(acp[0] > 0.99, "alpha_bar_0 = {}", acp[0]);
        assert!(acp[999] < 1e-3, "alpha_bar_T = {}", acp[999]);
    }

    #[test]
    fn alphas_cumprod_are_non_increasing() {
        check_monotonic(BetaSchedule::Linear { beta_start: 1e-4, beta_end: 0.02 });
        check_monotonic(BetaSchedule::Cosine);
        check_monotonic(BetaSchedule::Optim { k: 3. });
        check_monotonic(BetaSchedule::Optim { k: 0.5 });
    }

    #[test]
    fn linear_endpoints_scale_with_step_count() {
        let betas = BetaSchedule::Linear { beta_start: 1e-4, beta_end: 0.02 }.betas(500).unwrap();
        assert!((betas[0] - 2e-4).abs() < 1e-12);
        assert!((betas[499] - 0.04).abs() < 1e-12);
    }

    #[test]
    fn optim_with_unit_k_is_cosine() {
        let cosine = BetaSchedule::Cosine.betas(100).unwrap();
        let optim = BetaSchedule::Optim { k: 1. }.betas(100).unwrap();
        for (a, b) in cosine.iter().zip(optim.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn invalid_schedules_are_rejected() {
        assert!(matches!(BetaSchedule::Cosine.betas(0), Err(Error::Config(_))));
        assert!(matches!(BetaSchedule::Optim { k: 0. }.betas(10), Err(Error::Config(_))));
        assert!(matches!(BetaSchedule::Optim { k: -1. }.betas(10), Err(Error::Config(_))));
        let linear = BetaSchedule::Linear { beta_start: 1e-4, beta_end: 0.02 };
        assert!(matches!(linear.betas(4), Err(Error::Config(_))));
        assert!(BetaSchedule::from_name("quadratic", 1., 1e-4, 0.02).is_err());
    }

    #[test]
    fn interp_matches_numpy() {
        let xp = [0., 1., 2.];
        let fp = [0., 10., 30.];
        assert_eq!(interp(-1., &xp, &fp), 0.);
        assert_eq!(interp(0.5, &xp, &fp), 5.);
        assert_eq!(interp(1.5, &xp, &fp), 20.);
        assert_eq!(interp(3., &xp, &fp), 30.);
    }
}
