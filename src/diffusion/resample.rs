//! Choice of the training timestep for each example.
//!
//! Importance sampling lowers the variance of the variational bound: steps with a large
//! loss second moment get drawn more often and their loss is down-weighted by
//! `1 / (T p(t))`, keeping the weighted loss an unbiased estimate of the uniform one.
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::str::FromStr;
use tch::{Device, Kind, Tensor};

/// Number of recent losses kept per timestep, a timestep is warmed up once it is full.
pub const HISTORY_PER_TERM: usize = 10;

/// Probability mass always spread uniformly over the timesteps.
pub const UNIFORM_PROB: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSamplerKind {
    Uniform,
    LossSecondMoment,
}

impl FromStr for StepSamplerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uniform" => Ok(Self::Uniform),
            "loss-second-moment" | "loss_second_moment" => Ok(Self::LossSecondMoment),
            _ => Err(Error::config(format!("unknown step sampler {s}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LossSecondMomentState {
    history: Vec<VecDeque<f64>>,
}

impl LossSecondMomentState {
    fn new(num_timesteps: usize) -> Self {
        Self { history: vec![VecDeque::with_capacity(HISTORY_PER_TERM); num_timesteps] }
    }

    fn warmed_up(&self, t: usize) -> bool {
        self.history[t].len() == HISTORY_PER_TERM
    }

    fn rms(&self, t: usize) -> f64 {
        let h = &self.history[t];
        (h.iter().map(|l| l * l).sum::<f64>() / h.len() as f64).sqrt()
    }

    fn weights(&self) -> Vec<f64> {
        let n = self.history.len();
        let uniform = 1. / n as f64;
        let warm: Vec<usize> = (0..n).filter(|&t| self.warmed_up(t)).collect();
        if warm.is_empty() {
            return vec![uniform; n];
        }
        // Cold timesteps keep their uniform share, the rest of the mass follows the RMS
        // of the recent losses.
        let warm_mass = warm.len() as f64 * uniform;
        let rms: Vec<f64> = warm.iter().map(|&t| self.rms(t)).collect();
        let total: f64 = rms.iter().sum();
        let mut weights = vec![uniform; n];
        for (&t, r) in warm.iter().zip(rms.iter()) {
            weights[t] = if total > 0. { warm_mass * r / total } else { uniform };
        }
        weights.iter().map(|w| w * (1. - UNIFORM_PROB) + UNIFORM_PROB * uniform).collect()
    }

    fn update(&mut self, timesteps: &[i64], losses: &[f64]) {
        for (&t, &loss) in timesteps.iter().zip(losses.iter()) {
            let h = &mut self.history[t as usize];
            if h.len() == HISTORY_PER_TERM {
                h.pop_front();
            }
            h.push_back(loss);
        }
    }
}

/// A distribution over the timesteps of a diffusion process.
#[derive(Debug, Clone)]
pub enum StepSampler {
    Uniform { num_timesteps: usize },
    LossSecondMoment(LossSecondMomentState),
}

impl StepSampler {
    pub fn new(kind: StepSamplerKind, num_timesteps: usize) -> Self {
        match kind {
            StepSamplerKind::Uniform => Self::Uniform { num_timesteps },
            StepSamplerKind::LossSecondMoment => {
                Self::LossSecondMoment(LossSecondMomentState::new(num_timesteps))
            }
        }
    }

    pub fn num_timesteps(&self) -> usize {
        match self {
            Self::Uniform { num_timesteps } => *num_timesteps,
            Self::LossSecondMoment(state) => state.history.len(),
        }
    }

    /// The unnormalized sampling weight of each timestep.
    pub fn weights(&self) -> Vec<f64> {
        match self {
            Self::Uniform { num_timesteps } => vec![1.; *num_timesteps],
            Self::LossSecondMoment(state) => state.weights(),
        }
    }

    /// The normalized sampling probabilities.
    pub fn probabilities(&self) -> Vec<f64> {
        let weights = self.weights();
        let total: f64 = weights.iter().sum();
        weights.into_iter().map(|w| w / total).collect()
    }

    /// Draws `batch_size` timesteps, returns them as an int64 tensor along with the
    /// importance weights `1 / (T p(t))` as a float tensor.
    pub fn sample(&self, batch_size: i64, device: Device) -> (Tensor, Tensor) {
        let probs = self.probabilities();
        let num_timesteps = probs.len() as f64;
        let p = Tensor::from_slice(&probs).to_kind(Kind::Float);
        let indices = p.multinomial(batch_size, true);
        let weights = (p.index_select(0, &indices) * num_timesteps).reciprocal();
        (indices.to_device(device), weights.to_device(device))
    }

    /// Records the losses observed at the given timesteps, the values must be detached.
    /// A no-op for the uniform sampler.
    pub fn update_with_local_losses(&mut self, timesteps: &[i64], losses: &[f64]) {
        if let Self::LossSecondMoment(state) = self {
            state.update(timesteps, losses)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_before_warm_up() {
        let mut sampler = StepSampler::new(StepSamplerKind::LossSecondMoment, 8);
        for _ in 0..HISTORY_PER_TERM - 1 {
            sampler.update_with_local_losses(&[0, 1, 2, 3, 4, 5, 6, 7], &[1., 2., 3., 4., 5., 6., 7., 8.]);
        }
        let probs = sampler.probabilities();
        assert!(probs.iter().all(|p| (p - 0.125).abs() < 1e-12));
    }

    #[test]
    fn probabilities_follow_the_loss_magnitude() {
        let mut sampler = StepSampler::new(StepSamplerKind::LossSecondMoment, 4);
        for _ in 0..3 * HISTORY_PER_TERM {
            sampler.update_with_local_losses(&[0, 1, 2, 3], &[1., 1., 2., 4.]);
        }
        let probs = sampler.probabilities();
        assert!((probs.iter().sum::<f64>() - 1.).abs() < 1e-12);
        let expected = [0.125, 0.125, 0.25, 0.5];
        for (p, e) in probs.iter().zip(expected.iter()) {
            assert!((p - e).abs() < 1e-3, "{probs:?}");
        }
    }

    #[test]
    fn cold_timesteps_keep_a_uniform_share() {
        let mut sampler = StepSampler::new(StepSamplerKind::LossSecondMoment, 4);
        for _ in 0..HISTORY_PER_TERM {
            sampler.update_with_local_losses(&[0, 1], &[1., 3.]);
        }
        let probs = sampler.probabilities();
        assert!((probs[2] - probs[3]).abs() < 1e-12);
        assert!((probs[2] - 0.25).abs() < 1e-3);
        assert!(probs[1] > probs[0]);
        assert!((probs.iter().sum::<f64>() - 1.).abs() < 1e-12);
    }

    #[test]
    fn importance_weights_invert_the_probabilities() {
        tch::manual_seed(0);
        let mut sampler = StepSampler::new(StepSamplerKind::LossSecondMoment, 5);
        for _ in 0..HISTORY_PER_TERM {
            sampler.update_with_local_losses(&[0, 1, 2, 3, 4], &[0.5, 1., 1.5, 2., 2.5]);
        }
        let probs = sampler.probabilities();
        let (t, weights) = sampler.sample(64, Device::Cpu);
        let t = Vec::<i64>::try_from(t).unwrap();
        let weights = Vec::<f64>::try_from(weights.to_kind(Kind::Double)).unwrap();
        for (t, w) in t.iter().zip(weights.iter()) {
            let expected = 1. / (5. * probs[*t as usize]);
            assert!((w - expected).abs() / expected < 1e-5);
        }
    }

    #[test]
    fn uniform_sampler_has_unit_weights() {
        let sampler = StepSampler::new(StepSamplerKind::Uniform, 10);
        let (t, weights) = sampler.sample(32, Device::Cpu);
        assert_eq!(t.size(), vec![32]);
        assert!((weights - 1.).abs().max().double_value(&[]) < 1e-6);
        assert!(t.max().int64_value(&[]) < 10);
    }
}
