//! Diffusion processes that skip steps of a base process.
//!
//! Sampling with a few hundred, or a few dozen, steps reuses a denoiser trained on the
//! full process: the kept steps define a shorter chain with the same `alpha_bar` values,
//! and the denoiser keeps receiving timesteps expressed in the original range.
use super::{DiffusionConfig, GaussianDiffusion};
use crate::error::{Error, Result};
use crate::schedulers::NoiseSchedule;
use std::collections::BTreeSet;

/// Picks the steps to keep from a process with `num_timesteps` steps.
///
/// `section_counts` is either `"ddimN"`, the strided subset used by DDIM with exactly `N`
/// steps, or a comma separated list such as `"10,15,20"`: the process is cut in that many
/// equal sections and each section keeps the given number of evenly spaced steps.
pub fn space_timesteps(num_timesteps: usize, section_counts: &str) -> Result<BTreeSet<usize>> {
    let section_counts = section_counts.trim();
    if let Some(desired) = section_counts.strip_prefix("ddim") {
        let desired: usize = desired
            .parse()
            .map_err(|_| Error::config(format!("invalid step count in {section_counts}")))?;
        for stride in 1..=num_timesteps {
            if (0..num_timesteps).step_by(stride).count() == desired {
                return Ok((0..num_timesteps).step_by(stride).collect());
            }
        }
        return Err(Error::config(format!(
            "cannot create exactly {desired} steps with an integer stride over {num_timesteps} steps"
        )));
    }
    let counts = section_counts
        .split(',')
        .map(|s| s.trim().parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::config(format!("invalid section counts {section_counts}")))?;
    let size_per = num_timesteps / counts.len();
    let extra = num_timesteps % counts.len();
    let mut start_idx = 0;
    let mut all_steps = BTreeSet::new();
    for (i, &section_count) in counts.iter().enumerate() {
        let size = size_per + usize::from(i < extra);
        if size < section_count {
            return Err(Error::config(format!(
                "cannot divide section of {size} steps into {section_count}"
            )));
        }
        let frac_stride =
            if section_count <= 1 { 1. } else { (size - 1) as f64 / (section_count - 1) as f64 };
        let mut cur_idx = 0f64;
        for _ in 0..section_count {
            all_steps.insert(start_idx + cur_idx.round() as usize);
            cur_idx += frac_stride;
        }
        start_idx += size;
    }
    if all_steps.is_empty() {
        return Err(Error::config(format!("{section_counts} keeps no step")));
    }
    Ok(all_steps)
}

/// A diffusion process restricted to a subset of the steps of a base process.
#[derive(Debug, Clone)]
pub struct RespacedDiffusion {
    inner: GaussianDiffusion,
    use_timesteps: Vec<usize>,
}

impl RespacedDiffusion {
    pub fn new(base: &NoiseSchedule, config: DiffusionConfig, use_timesteps: &BTreeSet<usize>) -> Result<Self> {
        if let Some(&last) = use_timesteps.iter().next_back() {
            if last >= base.len() {
                return Err(Error::config(format!(
                    "step {last} is out of range for a process with {} steps",
                    base.len()
                )));
            }
        }
        let mut last_alpha_cumprod = 1.;
        let mut betas = Vec::with_capacity(use_timesteps.len());
        let mut timestep_map = Vec::with_capacity(use_timesteps.len());
        for (i, alpha_cumprod) in base.alphas_cumprod().into_iter().enumerate() {
            if use_timesteps.contains(&i) {
                betas.push(1. - alpha_cumprod / last_alpha_cumprod);
                last_alpha_cumprod = alpha_cumprod;
                timestep_map.push(i as i64);
            }
        }
        let schedule = NoiseSchedule::from_betas(betas)?;
        let inner = GaussianDiffusion::with_timestep_map(&schedule, config, timestep_map, base.len())?;
        Ok(Self { inner, use_timesteps: use_timesteps.iter().copied().collect() })
    }

    /// Respaces `base` according to a `section_counts` string, see [`space_timesteps`].
    pub fn from_section_counts(base: &NoiseSchedule, config: DiffusionConfig, section_counts: &str) -> Result<Self> {
        let use_timesteps = space_timesteps(base.len(), section_counts)?;
        Self::new(base, config, &use_timesteps)
    }

    pub fn use_timesteps(&self) -> &[usize] {
        &self.use_timesteps
    }
}

impl std::ops::Deref for RespacedDiffusion {
    type Target = GaussianDiffusion;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
