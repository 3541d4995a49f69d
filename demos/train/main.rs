// Trains a class-conditional diffusion model, periodically sampling from the moving
// average of its weights, checkpointing it and computing FID/IS.
//
// CIFAR-10 is read from the binary version of the dataset:
//
// mkdir -p data && cd data
// wget https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz
// tar xzf cifar-10-binary.tar.gz --strip-components=1
//
// Evaluation uses an activation network exported with torch.jit.trace, taking uint8 NHWC
// batches and returning a (pool_features, logits) tuple, and reference statistics stored
// in a .npz file with mu and sigma arrays.
//
//   cargo run --release --example train --features clap,tracing-subscriber -- \
//     --config run.json --world-size 2
use clap::Parser;
use guided_diffusion::training::data::TrainingSet;
use guided_diffusion::training::{Evaluation, LocalGroup, TrainConfig, Trainer};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// A JSON file with the run configuration, missing keys take their default value.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of replicas, each one running on its own thread and accelerator.
    #[arg(long, default_value_t = 1)]
    world_size: usize,

    /// When set, use the CPU even if some CUDA devices are available.
    #[arg(long)]
    cpu: bool,

    /// Checkpoint to resume from.
    #[arg(long, value_name = "FILE")]
    resume: Option<PathBuf>,

    /// Only evaluate the moving average of the resumed checkpoint.
    #[arg(long)]
    eval_only: bool,

    #[arg(long)]
    total_steps: Option<usize>,

    #[arg(long)]
    batch_size: Option<i64>,

    /// Either ddim or heun.
    #[arg(long)]
    sampler: Option<String>,

    #[arg(long)]
    sample_timesteps: Option<usize>,

    #[arg(long)]
    guidance_scale: Option<f64>,

    #[arg(long)]
    logdir: Option<PathBuf>,
}

impl Args {
    fn train_config(&self) -> anyhow::Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_json_file(path)?,
            None => TrainConfig::default(),
        };
        config.cpu |= self.cpu;
        if let Some(resume) = &self.resume {
            config.resume = Some(resume.clone());
        }
        if self.eval_only {
            config.train = false;
            config.eval = true;
        }
        if let Some(v) = self.total_steps {
            config.total_steps = v
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v
        }
        if let Some(v) = &self.sampler {
            config.sampler = v.clone()
        }
        if let Some(v) = self.sample_timesteps {
            config.sample_timesteps = v
        }
        if let Some(v) = self.guidance_scale {
            config.guidance_scale = v
        }
        if let Some(v) = &self.logdir {
            config.logdir = v.clone()
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();
    let args = Args::parse();
    tch::maybe_init_cuda();
    let config = args.train_config()?;
    config.validate(args.world_size)?;
    if config.eval {
        Evaluation::check_resources(&config)?;
    }
    tracing::info!(cuda = tch::Cuda::is_available(), world_size = args.world_size, "starting");

    LocalGroup::run(args.world_size, config.cpu, |ctx| {
        let device = ctx.device;
        let is_main = ctx.is_main();
        let mut trainer = Trainer::new(config.clone(), ctx)?;
        let evaluation = if is_main && config.eval { Some(Evaluation::load(&config, device)?) } else { None };
        if config.train {
            let set = TrainingSet::load(&config)?;
            let mut loader = trainer.loader(&set)?;
            trainer.run(&mut loader, evaluation.as_ref())?;
        } else {
            trainer.evaluate(evaluation.as_ref())?;
        }
        Ok(())
    })?;
    Ok(())
}
