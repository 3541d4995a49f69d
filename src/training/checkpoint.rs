//! Checkpoints holding the live model, its moving average, the optimizer state and the
//! step counter in a single tensor archive.
use super::distributed::RuntimeContext;
use super::ema::named_variables;
use super::optim::Adam;
use crate::error::{Error, Result};
use crate::utils::ensure_exists;
use std::collections::HashMap;
use std::path::Path;
use tch::{nn, Tensor};

const MODEL_PREFIX: &str = "model.";
const EMA_PREFIX: &str = "ema.";
const OPTIM_PREFIX: &str = "optim.";
const STEP_KEY: &str = "step";

/// The state restored from a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restored {
    pub step: usize,
    pub has_ema: bool,
    pub has_optimizer: bool,
}

/// Writes the training state to `path`. Only the main replica writes, the others wait for
/// the file to be complete.
pub fn save(
    path: &Path,
    model: &nn::VarStore,
    ema: &nn::VarStore,
    optimizer: &Adam,
    step: usize,
    ctx: &RuntimeContext,
) -> Result<()> {
    ctx.barrier()?;
    let result = if ctx.is_main() { write(path, model, ema, optimizer, step) } else { Ok(()) };
    ctx.barrier()?;
    result
}

fn write(path: &Path, model: &nn::VarStore, ema: &nn::VarStore, optimizer: &Adam, step: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tensors: Vec<(String, Tensor)> = vec![(STEP_KEY.to_string(), Tensor::from_slice(&[step as i64]))];
    for (name, t) in named_variables(model) {
        tensors.push((format!("{MODEL_PREFIX}{name}"), t));
    }
    for (name, t) in named_variables(ema) {
        tensors.push((format!("{EMA_PREFIX}{name}"), t));
    }
    for (name, t) in optimizer.state_tensors() {
        tensors.push((format!("{OPTIM_PREFIX}{name}"), t));
    }
    Tensor::save_multi(&tensors, path)?;
    tracing::info!(?path, step, "saved checkpoint");
    Ok(())
}

fn restore_vars(vs: &mut nn::VarStore, tensors: &HashMap<String, Tensor>, prefix: &str, path: &Path) -> Result<()> {
    let _no_grad = tch::no_grad_guard();
    for (name, mut var) in named_variables(vs) {
        let key = format!("{prefix}{name}");
        match tensors.get(&key) {
            Some(value) if value.size() == var.size() => var.copy_(value),
            Some(value) => {
                return Err(Error::resource(
                    path,
                    format!("{key} has shape {:?}, expected {:?}", value.size(), var.size()),
                ))
            }
            None => return Err(Error::resource(path, format!("{key} is missing"))),
        }
    }
    Ok(())
}

/// Restores a checkpoint written by [`save`]. The moving average falls back to the live
/// weights when the archive does not have one.
pub fn load(
    path: &Path,
    model: &mut nn::VarStore,
    ema: &mut nn::VarStore,
    optimizer: Option<&mut Adam>,
) -> Result<Restored> {
    ensure_exists(path, "checkpoint")?;
    let tensors: HashMap<String, Tensor> =
        Tensor::load_multi_with_device(path, model.device())?.into_iter().collect();
    let step = tensors
        .get(STEP_KEY)
        .map(|t| t.int64_value(&[0]) as usize)
        .ok_or_else(|| Error::resource(path, "no step counter"))?;
    restore_vars(model, &tensors, MODEL_PREFIX, path)?;
    let has_ema = tensors.keys().any(|k| k.starts_with(EMA_PREFIX));
    let ema_prefix = if has_ema { EMA_PREFIX } else { MODEL_PREFIX };
    restore_vars(ema, &tensors, ema_prefix, path)?;
    let optim_state: HashMap<String, Tensor> = tensors
        .iter()
        .filter_map(|(k, t)| k.strip_prefix(OPTIM_PREFIX).map(|k| (k.to_string(), t.shallow_clone())))
        .collect();
    let has_optimizer = !optim_state.is_empty();
    if let (Some(optimizer), true) = (optimizer, has_optimizer) {
        optimizer.load_state(&optim_state)?;
    }
    tracing::info!(?path, step, has_ema, "restored checkpoint");
    Ok(Restored { step, has_ema, has_optimizer })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn store(value: f64) -> nn::VarStore {
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = vs.root().var("w", &[2, 2], nn::Init::Const(value));
        vs
    }

    #[test]
    fn round_trip_restores_every_part() {
        let dir = std::env::temp_dir().join(format!("guided-diffusion-ckpt-{}", std::process::id()));
        let path = dir.join("ckpt_7.ot");
        let model = store(1.);
        let ema = store(2.);
        let mut adam = Adam::new(Default::default());
        let params = named_variables(&model);
        (&params["w"] * 3.).sum(Kind::Float).backward();
        adam.step(&params, 0.1);
        let ctx = RuntimeContext::single(Device::Cpu);
        save(&path, &model, &ema, &adam, 7, &ctx).unwrap();

        let mut model2 = store(0.);
        let mut ema2 = store(0.);
        let mut adam2 = Adam::new(Default::default());
        let restored = load(&path, &mut model2, &mut ema2, Some(&mut adam2)).unwrap();
        assert_eq!(restored, Restored { step: 7, has_ema: true, has_optimizer: true });
        assert!(named_variables(&model2)["w"].allclose(&named_variables(&model)["w"], 0., 0., false));
        assert_eq!(named_variables(&ema2)["w"].double_value(&[0, 0]), 2.);
        assert_eq!(adam2.step_count(), 1);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_checkpoint_is_a_resource_error() {
        let mut model = store(0.);
        let mut ema = store(0.);
        let err = load(Path::new("/nonexistent/ckpt.ot"), &mut model, &mut ema, None);
        assert!(matches!(err, Err(Error::Resource { .. })));
    }
}
