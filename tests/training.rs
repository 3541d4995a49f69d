// Short training runs on synthetic data, with one and two replicas.
use guided_diffusion::training::data::TrainingSet;
use guided_diffusion::training::ema::named_variables;
use guided_diffusion::training::{LocalGroup, RuntimeContext, TrainConfig, Trainer};
use std::path::PathBuf;
use tch::{Device, Kind, Tensor};

fn tiny_config(name: &str) -> TrainConfig {
    let dir = std::env::temp_dir().join(format!("guided-diffusion-{name}-{}", std::process::id()));
    TrainConfig {
        image_size: 8,
        num_classes: 2,
        num_timesteps: 10,
        loss_type: "MSE".to_string(),
        model_channels: 16,
        channel_mult: vec![1, 2],
        num_res_blocks: 1,
        dropout: 0.,
        total_steps: 3,
        warmup_steps: 1,
        batch_size: 4,
        ema_decay: 0.9,
        cpu: true,
        sampler: "ddim".to_string(),
        sample_timesteps: 2,
        sample_size: 4,
        sample_step: 0,
        save_step: 3,
        eval: false,
        logdir: dir.join("logs"),
        checkpoint_dir: dir.join("checkpoint"),
        ..Default::default()
    }
}

fn synthetic_set() -> TrainingSet {
    let images = Tensor::rand([8, 3, 8, 8], (Kind::Float, Device::Cpu)) * 2. - 1.;
    let labels = Tensor::from_slice(&[0i64, 1, 0, 1, 0, 1, 0, 1]);
    TrainingSet::new(images, labels).unwrap()
}

fn run_dir(config: &TrainConfig) -> PathBuf {
    config.checkpoint_dir.parent().unwrap().to_path_buf()
}

#[test]
fn short_run_checkpoints_and_samples() {
    let config = tiny_config("short-run");
    let mut trainer = Trainer::new(config.clone(), RuntimeContext::single(Device::Cpu)).unwrap();
    let mut loader = trainer.loader(&synthetic_set()).unwrap();
    let first = trainer.train_step(&mut loader).unwrap();
    // The first update happens with the warm-up multiplier of step 0.
    assert_eq!(first.lr, 0.);
    assert!(first.loss.is_finite());
    trainer.run(&mut loader, None).unwrap();
    assert_eq!(trainer.step(), 3);
    let checkpoint = config.checkpoint_dir.join("MSE_optim_3.0_3.ot");
    assert!(checkpoint.is_file());

    let (images, labels) = trainer.generate_samples(5).unwrap();
    assert_eq!(images.size(), [5, 8, 8, 3]);
    assert_eq!(images.kind(), Kind::Uint8);
    assert_eq!(labels.unwrap().size(), [5]);

    // Resuming restores the step counter and the weights.
    let resumed_config = TrainConfig { resume: Some(checkpoint), ..config.clone() };
    let resumed = Trainer::new(resumed_config, RuntimeContext::single(Device::Cpu)).unwrap();
    assert_eq!(resumed.step(), 3);
    let original = named_variables(trainer.ema_vars());
    for (name, value) in named_variables(resumed.ema_vars()) {
        assert!(value.equal(&original[&name]), "{name}");
    }
    std::fs::remove_dir_all(run_dir(&config)).unwrap();
}

#[test]
fn replicas_stay_in_lock_step() {
    let config = TrainConfig { save_step: 0, total_steps: 2, ..tiny_config("replicas") };
    let results = LocalGroup::run(2, true, |ctx| {
        let ctx_copy = ctx.clone();
        let mut trainer = Trainer::new(config.clone(), ctx)?;
        let mut loader = trainer.loader(&synthetic_set())?;
        trainer.run(&mut loader, None)?;
        trainer.generate_samples(2)?;
        let flatten = |vs: &tch::nn::VarStore| {
            let vars: Vec<Tensor> = named_variables(vs).values().map(|t| t.flatten(0, -1)).collect();
            Tensor::cat(&vars, 0)
        };
        let live = ctx_copy.all_gather(&flatten(trainer.model_vars()))?;
        let ema = ctx_copy.all_gather(&flatten(trainer.ema_vars()))?;
        Ok((live[0].equal(&live[1]), ema[0].equal(&ema[1])))
    })
    .unwrap();
    assert_eq!(results, vec![(true, true), (true, true)]);
}

#[test]
fn evaluation_only_needs_a_checkpoint() {
    let config = TrainConfig { train: false, ..tiny_config("eval-only") };
    assert!(Trainer::new(config, RuntimeContext::single(Device::Cpu)).is_err());
}
