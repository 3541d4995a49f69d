//! Exponential moving average of the model parameters.
//!
//! The live and shadow parameters live in two variable stores holding the same model
//! structure. Only the main replica updates its shadow copy, the other replicas receive it
//! through [`EmaCoordinator::broadcast`] before any sampling that depends on it.
use super::distributed::{broadcast_variables, RuntimeContext};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tch::{nn, Tensor};

/// The variables of a store, sorted by name so that every replica walks them in the same
/// order.
pub fn named_variables(vs: &nn::VarStore) -> BTreeMap<String, Tensor> {
    vs.variables().into_iter().collect()
}

fn paired(live: &nn::VarStore, shadow: &nn::VarStore) -> Result<Vec<(Tensor, Tensor)>> {
    let live = named_variables(live);
    let mut shadow = named_variables(shadow);
    if live.len() != shadow.len() {
        return Err(Error::config(format!(
            "the EMA model has {} parameters, the live model {}",
            shadow.len(),
            live.len()
        )));
    }
    live.into_iter()
        .map(|(name, l)| match shadow.remove(&name) {
            Some(s) if s.size() == l.size() => Ok((l, s)),
            Some(s) => Err(Error::config(format!(
                "shape mismatch for {name}: {:?} vs {:?}",
                l.size(),
                s.size()
            ))),
            None => Err(Error::config(format!("{name} is missing from the EMA model"))),
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct EmaCoordinator {
    decay: f64,
}

impl EmaCoordinator {
    pub fn new(decay: f64) -> Result<Self> {
        if !(0. ..=1.).contains(&decay) {
            return Err(Error::config(format!("EMA decay {decay} is outside of [0, 1]")));
        }
        Ok(Self { decay })
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Sets the shadow parameters to the live ones.
    pub fn reset(&self, live: &nn::VarStore, shadow: &mut nn::VarStore) -> Result<()> {
        let _no_grad = tch::no_grad_guard();
        for (l, mut s) in paired(live, shadow)? {
            s.copy_(&l);
        }
        Ok(())
    }

    /// `shadow = decay * shadow + (1 - decay) * live`, parameter by parameter.
    pub fn update(&self, live: &nn::VarStore, shadow: &mut nn::VarStore) -> Result<()> {
        let _no_grad = tch::no_grad_guard();
        for (l, mut s) in paired(live, shadow)? {
            let updated = &s * self.decay + l.to_device(s.device()) * (1. - self.decay);
            s.copy_(&updated);
        }
        Ok(())
    }

    /// Overwrites the shadow parameters of every replica with the ones of the main replica.
    pub fn broadcast(&self, shadow: &mut nn::VarStore, ctx: &RuntimeContext) -> Result<()> {
        broadcast_variables(shadow, ctx, 0)
    }
}
