//! Optimizer, gradient scaling and learning-rate schedule.
//!
//! The Adam state is kept next to the parameter names so that it can be written to and
//! restored from a checkpoint.
use crate::error::{Error, Result};
use crate::utils::all_finite;
use std::collections::{BTreeMap, HashMap};
use tch::{Kind, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self { beta1: 0.9, beta2: 0.999, eps: 1e-8, weight_decay: 0. }
    }
}

#[derive(Debug)]
pub struct Adam {
    pub config: AdamConfig,
    step: i64,
    exp_avg: BTreeMap<String, Tensor>,
    exp_avg_sq: BTreeMap<String, Tensor>,
}

impl Adam {
    pub fn new(config: AdamConfig) -> Self {
        Self { config, step: 0, exp_avg: BTreeMap::new(), exp_avg_sq: BTreeMap::new() }
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> i64 {
        self.step
    }

    /// Applies one update with learning rate `lr` to every parameter holding a gradient.
    pub fn step(&mut self, params: &BTreeMap<String, Tensor>, lr: f64) {
        let _no_grad = tch::no_grad_guard();
        let AdamConfig { beta1, beta2, eps, weight_decay } = self.config;
        self.step += 1;
        let bias_correction1 = 1. - beta1.powi(self.step as i32);
        let bias_correction2 = 1. - beta2.powi(self.step as i32);
        for (name, param) in params.iter() {
            let grad = param.grad();
            if !grad.defined() {
                continue;
            }
            let grad = if weight_decay != 0. { grad + param * weight_decay } else { grad };
            let exp_avg = self.exp_avg.entry(name.clone()).or_insert_with(|| param.zeros_like());
            let updated = &*exp_avg * beta1 + &grad * (1. - beta1);
            exp_avg.copy_(&updated);
            let exp_avg_sq =
                self.exp_avg_sq.entry(name.clone()).or_insert_with(|| param.zeros_like());
            let updated = &*exp_avg_sq * beta2 + grad.square() * (1. - beta2);
            exp_avg_sq.copy_(&updated);
            let denom = exp_avg_sq.sqrt() / bias_correction2.sqrt() + eps;
            let update = &*exp_avg / denom * (lr / bias_correction1);
            let mut param = param.shallow_clone();
            let updated = &param - update;
            param.copy_(&updated);
        }
    }

    /// The optimizer state as named tensors.
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut tensors = vec![("step".to_string(), Tensor::from_slice(&[self.step]))];
        for (name, t) in self.exp_avg.iter() {
            tensors.push((format!("exp_avg.{name}"), t.shallow_clone()));
        }
        for (name, t) in self.exp_avg_sq.iter() {
            tensors.push((format!("exp_avg_sq.{name}"), t.shallow_clone()));
        }
        tensors
    }

    /// Restores a state written by [`Adam::state_tensors`].
    pub fn load_state(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let step = tensors
            .get("step")
            .ok_or_else(|| Error::config("optimizer state without step counter"))?;
        self.step = step.int64_value(&[0]);
        self.exp_avg.clear();
        self.exp_avg_sq.clear();
        for (name, t) in tensors.iter() {
            if let Some(param) = name.strip_prefix("exp_avg_sq.") {
                self.exp_avg_sq.insert(param.to_string(), t.shallow_clone());
            } else if let Some(param) = name.strip_prefix("exp_avg.") {
                self.exp_avg.insert(param.to_string(), t.shallow_clone());
            }
        }
        Ok(())
    }
}

pub fn zero_grad(params: &BTreeMap<String, Tensor>) {
    for param in params.values() {
        let mut param = param.shallow_clone();
        param.zero_grad();
    }
}

/// Rescales the gradients so that their global L2 norm is at most `max_norm`, returns the
/// norm before clipping.
pub fn clip_grad_norm(params: &BTreeMap<String, Tensor>, max_norm: f64) -> f64 {
    let _no_grad = tch::no_grad_guard();
    let grads: Vec<Tensor> =
        params.values().map(|p| p.grad()).filter(|g| g.defined()).collect();
    if grads.is_empty() {
        return 0.;
    }
    let norms: Vec<Tensor> = grads
        .iter()
        .map(|g| g.to_kind(Kind::Float).square().sum(Kind::Float).to_device(tch::Device::Cpu))
        .collect();
    let total_norm = Tensor::stack(&norms, 0).sum(Kind::Float).sqrt().double_value(&[]);
    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1. {
        for mut g in grads {
            let clipped = &g * clip_coef;
            g.copy_(&clipped);
        }
    }
    total_norm
}

/// Dynamic loss scaling for mixed-precision training: the loss is multiplied by a large
/// factor before the backward pass, steps with overflowing gradients are skipped and the
/// factor backs off.
#[derive(Debug, Clone)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: u32,
    growth_tracker: u32,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: 65536.,
            growth_factor: 2.,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }

    pub fn scale(&self) -> f64 {
        if self.enabled {
            self.scale
        } else {
            1.
        }
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Tensor {
        loss * self.scale()
    }

    /// Divides the gradients by the current scale, returns false when some gradient is
    /// not finite.
    pub fn unscale(&self, params: &BTreeMap<String, Tensor>) -> bool {
        let _no_grad = tch::no_grad_guard();
        let inv_scale = 1. / self.scale();
        let mut finite = true;
        for param in params.values() {
            let mut grad = param.grad();
            if !grad.defined() {
                continue;
            }
            if self.enabled {
                let unscaled = &grad * inv_scale;
                grad.copy_(&unscaled);
            }
            finite &= all_finite(&grad);
        }
        finite
    }

    /// Adjusts the scale after a step, `found_inf` being the negation of what
    /// [`GradScaler::unscale`] returned.
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker == self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        }
    }
}

/// Learning-rate multiplier: linear warm-up over `warmup_steps`, then either constant or
/// a cosine decay reaching `final_lr / lr` at `total_steps`.
pub fn warmup_cosine_lr(
    step: usize,
    warmup_steps: usize,
    total_steps: usize,
    lr: f64,
    final_lr: f64,
    cosine_decay: bool,
) -> f64 {
    if step < warmup_steps {
        return step as f64 / warmup_steps as f64;
    }
    if !cosine_decay {
        return 1.;
    }
    let progress = if total_steps > warmup_steps {
        ((step - warmup_steps) as f64 / (total_steps - warmup_steps) as f64).min(1.)
    } else {
        1.
    };
    let cosine = 0.5 * (1. + (std::f64::consts::PI * progress).cos());
    (final_lr + (lr - final_lr) * cosine) / lr
}
