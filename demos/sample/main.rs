// Generates a grid of images from the moving average stored in a training checkpoint.
//
//   cargo run --release --example sample --features clap,tracing-subscriber -- \
//     --checkpoint checkpoint/MAPPED_MSE_optim_3.0_400000.ot --sampler ddim --n-steps 50
use clap::Parser;
use guided_diffusion::training::trainer::save_grid;
use guided_diffusion::training::{RuntimeContext, TrainConfig, Trainer};
use std::path::PathBuf;
use tch::Device;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The checkpoint written by the training example.
    #[arg(long, value_name = "FILE")]
    checkpoint: PathBuf,

    /// The JSON configuration used for training.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// When set, use the CPU even if some CUDA devices are available.
    #[arg(long)]
    cpu: bool,

    /// Either ddim or heun.
    #[arg(long, default_value = "heun")]
    sampler: String,

    /// The number of steps to run the sampler for.
    #[arg(long, default_value_t = 18)]
    n_steps: usize,

    #[arg(long, default_value_t = 1.5)]
    guidance_scale: f64,

    #[arg(long, default_value_t = 64)]
    num_samples: i64,

    #[arg(long, default_value_t = 42)]
    seed: i64,

    /// The name of the final image to generate.
    #[arg(long, value_name = "FILE", default_value = "samples.png")]
    final_image: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();
    let args = Args::parse();
    tch::maybe_init_cuda();
    let device = if args.cpu { Device::Cpu } else { Device::cuda_if_available() };

    let mut config = match &args.config {
        Some(path) => TrainConfig::from_json_file(path)?,
        None => TrainConfig::default(),
    };
    config.train = false;
    config.resume = Some(args.checkpoint);
    config.sampler = args.sampler;
    config.sample_timesteps = args.n_steps;
    config.guidance_scale = args.guidance_scale;
    config.sample_size = args.num_samples;
    config.seed = args.seed;

    let mut trainer = Trainer::new(config, RuntimeContext::single(device))?;
    let (images, labels) = trainer.generate_samples(args.num_samples as usize)?;
    if let Some(labels) = labels {
        tracing::info!(labels = ?Vec::<i64>::try_from(labels)?, "sampled classes");
    }
    save_grid(&images, &args.final_image)?;
    tracing::info!(path = ?args.final_image, "saved samples");
    Ok(())
}
