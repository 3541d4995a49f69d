//! The training loop.
//!
//! Every replica runs the same sequence of steps on its own shard of the data. Gradients
//! are averaged over the replicas before each optimizer step so that the live models stay
//! identical. The moving average is only maintained by the main replica and broadcast
//! before anything samples from it.
use super::checkpoint;
use super::config::{ResolvedConfig, TrainConfig};
use super::data::{drop_labels, CyclicLoader, TrainingSet};
use super::distributed::{all_reduce_gradients, broadcast_variables, RuntimeContext};
use super::ema::{named_variables, EmaCoordinator};
use super::optim::{clip_grad_norm, warmup_cosine_lr, zero_grad, Adam, AdamConfig, GradScaler};
use crate::diffusion::resample::StepSampler;
use crate::diffusion::GaussianDiffusion;
use crate::error::{Error, Result};
use crate::evaluation::archive::{samples_file_name, write_samples, MetricsLog};
use crate::evaluation::{evaluate_samples, Evaluator, FidStatistics, TorchScriptEvaluator};
use crate::models::unet::{UNetConfig, UNetModel};
use crate::models::{Classifier, LatentDecoder, TorchScriptClassifier, TorchScriptDecoder};
use crate::schedulers::ddim::DDIMSampler;
use crate::schedulers::heun::HeunSampler;
use crate::schedulers::{NoiseSchedule, Sampler, SamplerKind, PIXEL_CHANNELS};
use crate::utils::{ensure_exists, to_uint8_nhwc};
use std::path::{Path, PathBuf};
use tch::{nn, Device, Kind, Tensor};

/// Interval, in steps, between two training log lines.
const LOG_EVERY: usize = 100;

/// Padding, in pixels, between the images of a sample grid.
const GRID_PADDING: i64 = 2;

/// Images per row of a sample grid.
const GRID_ROW: i64 = 8;

/// Metrics reported after each evaluation.
pub const METRICS: [&str; 2] = ["IS_EMA", "FID_EMA"];

/// What happened during one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    /// The importance-weighted batch loss.
    pub loss: f64,
    pub lr: f64,
    /// The gradient norm before clipping, when clipping is enabled.
    pub grad_norm: Option<f64>,
    /// True when the update was skipped because of overflowing gradients.
    pub skipped: bool,
}

/// The evaluation resources, only loaded on the main replica.
pub struct Evaluation {
    pub evaluator: Box<dyn Evaluator>,
    pub reference: FidStatistics,
    pub metrics: MetricsLog,
}

impl Evaluation {
    /// Fails when a file needed by [`Evaluation::load`] is missing, meant to be called
    /// before the replicas start.
    pub fn check_resources(config: &TrainConfig) -> Result<()> {
        ensure_exists(&config.fid_cache, "reference statistics")?;
        ensure_exists(&config.inception, "activation network")
    }

    pub fn load(config: &TrainConfig, device: Device) -> Result<Self> {
        tracing::info!(path = ?config.fid_cache, "reading reference statistics");
        let reference = crate::evaluation::archive::read_statistics(&config.fid_cache, false)?;
        let evaluator = TorchScriptEvaluator::load(&config.inception, device)?;
        let metrics = MetricsLog::new(config.dataset_dir().join("evaluate"), &config.run_name(), &METRICS)?;
        Ok(Self { evaluator: Box::new(evaluator), reference, metrics })
    }
}

pub struct Trainer {
    ctx: RuntimeContext,
    config: TrainConfig,
    model_vs: nn::VarStore,
    model: UNetModel,
    ema_vs: nn::VarStore,
    ema_model: UNetModel,
    diffusion: GaussianDiffusion,
    step_sampler: StepSampler,
    optimizer: Adam,
    scaler: GradScaler,
    ema: EmaCoordinator,
    sampler: Sampler,
    classifier: Option<TorchScriptClassifier>,
    decoder: Option<TorchScriptDecoder>,
    step: usize,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer").field("ctx", &self.ctx).field("step", &self.step).finish()
    }
}

impl TrainConfig {
    /// `<logdir>/<dataset>`, the root of the files written by a run.
    pub fn dataset_dir(&self) -> PathBuf {
        self.logdir.join(self.dataset.name())
    }

    pub fn unet_config(&self, resolved: &ResolvedConfig) -> UNetConfig {
        UNetConfig {
            model_channels: self.model_channels,
            channel_mult: self.channel_mult.clone(),
            num_res_blocks: self.num_res_blocks,
            dropout: self.dropout,
            norm_num_groups: gcd(self.model_channels, 32),
            num_classes: self.class_cond.then_some(self.num_classes),
            learn_sigma: resolved.diffusion.var_type.is_learned(),
            ..Default::default()
        }
    }

    fn build_sampler(&self, resolved: &ResolvedConfig, schedule: &NoiseSchedule) -> Result<Sampler> {
        Ok(match resolved.sampler {
            SamplerKind::Ddim => {
                Sampler::Ddim(DDIMSampler::new(schedule, resolved.diffusion, self.ddim_config())?)
            }
            SamplerKind::Heun => Sampler::Heun(HeunSampler::new(
                schedule,
                self.heun_config(resolved.diffusion.mean_type),
            )?),
        })
    }
}

impl Trainer {
    /// Builds the models, the diffusion process and the samplers of a replica, restoring
    /// the checkpoint given by `config.resume` if any.
    pub fn new(config: TrainConfig, ctx: RuntimeContext) -> Result<Self> {
        let resolved = config.validate(ctx.world_size)?;
        tch::manual_seed(config.seed + ctx.rank as i64);
        let schedule = NoiseSchedule::new(resolved.beta_schedule, config.num_timesteps)?;
        let diffusion = GaussianDiffusion::new(&schedule, resolved.diffusion)?;
        let sampler = config.build_sampler(&resolved, &schedule)?;

        let unet_config = config.unet_config(&resolved);
        let mut model_vs = nn::VarStore::new(ctx.device);
        let model = UNetModel::new(model_vs.root(), config.in_chans, unet_config.clone());
        let mut ema_vs = nn::VarStore::new(ctx.device);
        let ema_model = UNetModel::new(ema_vs.root(), config.in_chans, unet_config);
        // Replicas start from the weights of the main one.
        broadcast_variables(&mut model_vs, &ctx, 0)?;
        let ema = EmaCoordinator::new(config.ema_decay)?;
        ema.reset(&model_vs, &mut ema_vs)?;

        let classifier = match &config.use_classifier {
            Some(path) => Some(TorchScriptClassifier::load(path, ctx.device)?),
            None => None,
        };
        let decoder = match &config.vae_decoder {
            Some(path) => Some(TorchScriptDecoder::load(path, config.in_chans, ctx.device)?),
            None => None,
        };

        let mut optimizer = Adam::new(AdamConfig::default());
        let mut step = 0;
        if let Some(path) = &config.resume {
            step = checkpoint::load(path, &mut model_vs, &mut ema_vs, Some(&mut optimizer))?.step;
        } else if !config.train {
            return Err(Error::config("evaluation without training needs a checkpoint to resume from"));
        }

        if ctx.is_main() {
            let num_params: i64 = model_vs.trainable_variables().iter().map(|t| t.numel() as i64).sum();
            tracing::info!(
                params_m = num_params as f64 / 1024. / 1024.,
                world_size = ctx.world_size,
                step,
                "model ready"
            );
        }
        Ok(Self {
            step_sampler: StepSampler::new(resolved.step_sampler, config.num_timesteps),
            scaler: GradScaler::new(config.amp),
            ctx,
            config,
            model_vs,
            model,
            ema_vs,
            ema_model,
            diffusion,
            optimizer,
            ema,
            sampler,
            classifier,
            decoder,
            step,
        })
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn ctx(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn model_vars(&self) -> &nn::VarStore {
        &self.model_vs
    }

    pub fn ema_vars(&self) -> &nn::VarStore {
        &self.ema_vs
    }

    pub fn step_sampler(&self) -> &StepSampler {
        &self.step_sampler
    }

    /// The loader feeding this replica.
    pub fn loader(&self, set: &TrainingSet) -> Result<CyclicLoader> {
        let batch_size = self.config.local_batch_size(self.ctx.world_size);
        CyclicLoader::new(set, self.ctx.rank, self.ctx.world_size, batch_size, self.ctx.device)
    }

    /// Runs one optimizer step on the next batch of `loader`.
    pub fn train_step(&mut self, loader: &mut CyclicLoader) -> Result<StepOutput> {
        let (images, labels) = loader.next_batch();
        let labels = self
            .config
            .class_cond
            .then(|| drop_labels(&labels, self.config.drop_label_prob, self.config.num_classes));
        let params = named_variables(&self.model_vs);
        zero_grad(&params);

        let batch_size = images.size()[0];
        let (t, weights) = self.step_sampler.sample(batch_size, self.ctx.device);
        let losses = tch::autocast(self.config.amp, || {
            self.diffusion.training_losses(&self.model, &images, &t, labels.as_ref())
        })?;
        let per_example = losses.loss.detach().to_kind(Kind::Double).to_device(Device::Cpu);
        let loss = (losses.loss.to_kind(Kind::Float) * &weights).mean(Kind::Float);
        let loss_value = loss.double_value(&[]);
        self.scaler.scale_loss(&loss).backward();

        all_reduce_gradients(&params, &self.ctx)?;
        let finite = self.scaler.unscale(&params);
        if !finite && !self.config.amp {
            return Err(Error::Numerical(format!("non-finite gradients at step {}", self.step + 1)));
        }
        let grad_norm = match self.config.grad_clip {
            Some(max_norm) if finite => Some(clip_grad_norm(&params, max_norm)),
            _ => None,
        };
        // The multiplier of the update number `step + 1` is the one of `step`, the first
        // update thus happens with a zero learning rate under warm-up.
        let lr = self.config.lr
            * warmup_cosine_lr(
                self.step,
                self.config.warmup_steps,
                self.config.total_steps,
                self.config.lr,
                self.config.final_lr,
                self.config.cosine_decay,
            );
        if finite {
            self.optimizer.step(&params, lr);
        } else {
            tracing::warn!(step = self.step + 1, scale = self.scaler.scale(), "skipping step with overflowing gradients");
        }
        self.scaler.update(!finite);
        self.step += 1;

        if self.ctx.is_main() {
            self.ema.update(&self.model_vs, &mut self.ema_vs)?;
        }
        self.ctx.barrier()?;

        self.record_losses(&t, &per_example)?;
        Ok(StepOutput { loss: loss_value, lr, grad_norm, skipped: !finite })
    }

    fn record_losses(&mut self, t: &Tensor, losses: &Tensor) -> Result<()> {
        if matches!(self.step_sampler, StepSampler::Uniform { .. }) {
            return Ok(());
        }
        let t = t.to_device(Device::Cpu);
        let (t, losses) = if self.config.sync_step_sampler && self.ctx.world_size > 1 {
            (Tensor::cat(&self.ctx.all_gather(&t)?, 0), Tensor::cat(&self.ctx.all_gather(losses)?, 0))
        } else {
            (t, losses.shallow_clone())
        };
        let t = Vec::<i64>::try_from(t)?;
        let losses = Vec::<f64>::try_from(losses)?;
        self.step_sampler.update_with_local_losses(&t, &losses);
        Ok(())
    }

    /// Trains until `config.total_steps`, sampling, checkpointing and evaluating at the
    /// configured intervals. `evaluation` is only needed on the main replica.
    pub fn run(&mut self, loader: &mut CyclicLoader, evaluation: Option<&Evaluation>) -> Result<()> {
        while self.step < self.config.total_steps {
            let out = self.train_step(loader)?;
            let step = self.step;
            if self.ctx.is_main() && (step % LOG_EVERY == 0 || step == 1) {
                tracing::info!(step, loss = out.loss, lr = out.lr, grad_norm = ?out.grad_norm, "train");
            }
            if self.config.sample_step > 0 && step % self.config.sample_step == 0 {
                let path = self.config.dataset_dir().join("sample").join(format!("{step}.png"));
                self.save_sample_grid(&path)?;
            }
            if self.config.save_step > 0 && step % self.config.save_step == 0 {
                self.save_checkpoint()?;
            }
            if self.config.eval && self.config.eval_step > 0 && step % self.config.eval_step == 0 {
                self.evaluate(evaluation)?;
            }
        }
        Ok(())
    }

    pub fn save_checkpoint(&self) -> Result<PathBuf> {
        let path = self.config.checkpoint_dir.join(self.config.checkpoint_name(self.step));
        checkpoint::save(&path, &self.model_vs, &self.ema_vs, &self.optimizer, self.step, &self.ctx)?;
        Ok(path)
    }

    /// Samples `num_samples` images from the moving-average model, spread over all the
    /// replicas. Every replica returns the gathered uint8 channel-last images, and the
    /// labels for class-conditional models.
    pub fn generate_samples(&mut self, num_samples: usize) -> Result<(Tensor, Option<Tensor>)> {
        self.ema.broadcast(&mut self.ema_vs, &self.ctx)?;
        let world_size = self.ctx.world_size as i64;
        let per_replica = (self.config.sample_size + world_size - 1) / world_size;
        let channels = self.config.in_chans;
        let size = self.config.image_size;
        let (mut images, mut labels) = (vec![], vec![]);
        let mut generated = 0;
        while generated < num_samples {
            let noise = Tensor::randn([per_replica, channels, size, size], (Kind::Float, self.ctx.device));
            let batch_labels = self.config.class_cond.then(|| {
                Tensor::randint(self.config.num_classes, [per_replica], (Kind::Int64, self.ctx.device))
            });
            let samples = self.sampler.sample(
                &self.ema_model,
                &noise,
                batch_labels.as_ref(),
                self.classifier.as_ref().map(|c| c as &dyn Classifier),
                self.decoder.as_ref().map(|d| d as &dyn LatentDecoder),
            )?;
            let samples = to_uint8_nhwc(&samples);
            let gathered = self.ctx.all_gather(&samples)?;
            generated += gathered.iter().map(|t| t.size()[0] as usize).sum::<usize>();
            images.extend(gathered);
            if let Some(batch_labels) = batch_labels {
                labels.extend(self.ctx.all_gather(&batch_labels)?);
            }
            if self.ctx.is_main() {
                tracing::debug!(generated, num_samples, "sampling");
            }
        }
        let images = Tensor::cat(&images, 0).narrow(0, 0, num_samples as i64).to_device(Device::Cpu);
        let labels = (!labels.is_empty())
            .then(|| Tensor::cat(&labels, 0).narrow(0, 0, num_samples as i64).to_device(Device::Cpu));
        Ok((images, labels))
    }

    /// Writes a grid of `sample_size` images from the moving-average model.
    pub fn save_sample_grid(&mut self, path: &Path) -> Result<()> {
        let (images, _) = self.generate_samples(self.config.sample_size as usize)?;
        if self.ctx.is_main() {
            save_grid(&images, path)?;
            tracing::info!(?path, "saved samples");
        }
        self.ctx.barrier()?;
        Ok(())
    }

    /// Samples `num_samples` images, writes them next to the other outputs of the run and
    /// reports IS and FID against the reference statistics.
    pub fn evaluate(&mut self, evaluation: Option<&Evaluation>) -> Result<()> {
        let (images, labels) = self.generate_samples(self.config.num_samples)?;
        let result = match (self.ctx.is_main(), evaluation) {
            (false, _) => Ok(()),
            (true, None) => Err(Error::config("evaluation resources are missing on the main replica")),
            (true, Some(evaluation)) => {
                let path = self
                    .config
                    .dataset_dir()
                    .join("generate_sample")
                    .join(samples_file_name(self.config.dataset.name(), &images));
                tracing::info!(?path, "saving samples");
                write_samples(&path, &images, labels.as_ref())?;
                let summary = evaluate_samples(
                    evaluation.evaluator.as_ref(),
                    &images,
                    self.config.sample_size,
                    &evaluation.reference,
                )?;
                tracing::info!(step = self.step, is = summary.inception_score, fid = summary.fid, "Model(EMA)");
                evaluation.metrics.append(
                    self.step,
                    &[("IS_EMA", Some(summary.inception_score)), ("FID_EMA", Some(summary.fid))],
                )
            }
        };
        self.ctx.barrier()?;
        result
    }
}

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Tiles uint8 channel-last images into rows of [`GRID_ROW`] separated by mid-grey padding
/// and writes the result as an image file.
pub fn save_grid(images: &Tensor, path: &Path) -> Result<()> {
    let (n, h, w, c) = images.size4()?;
    if c != PIXEL_CHANNELS {
        return Err(Error::config(format!("cannot write a grid of {c}-channel images")));
    }
    let ncols = n.min(GRID_ROW).max(1);
    let nrows = (n + ncols - 1) / ncols;
    let (cell_h, cell_w) = (h + GRID_PADDING, w + GRID_PADDING);
    let grid = Tensor::full(
        [nrows * cell_h + GRID_PADDING, ncols * cell_w + GRID_PADDING, c],
        128i64,
        (Kind::Uint8, Device::Cpu),
    );
    let images = images.to_device(Device::Cpu).to_kind(Kind::Uint8);
    for i in 0..n {
        let (row, col) = (i / ncols, i % ncols);
        grid.narrow(0, row * cell_h + GRID_PADDING, h)
            .narrow(1, col * cell_w + GRID_PADDING, w)
            .copy_(&images.get(i));
    }
    let (grid_h, grid_w) = (grid.size()[0] as u32, grid.size()[1] as u32);
    let data = Vec::<u8>::try_from(grid.flatten(0, -1))?;
    let image = image::RgbImage::from_raw(grid_w, grid_h, data)
        .ok_or_else(|| Error::config("inconsistent sample grid buffer"))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image.save(path).map_err(|e| Error::resource(path, e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_has_padded_cells() {
        let dir = std::env::temp_dir().join(format!("guided-diffusion-grid-{}", std::process::id()));
        let path = dir.join("grid.png");
        let images = Tensor::full([10, 4, 4, 3], 255i64, (Kind::Uint8, Device::Cpu));
        save_grid(&images, &path).unwrap();
        let grid = image::open(&path).unwrap().to_rgb8();
        // 8 columns and 2 rows of 4x4 images with 2 pixels of padding.
        assert_eq!(grid.dimensions(), (8 * 6 + 2, 2 * 6 + 2));
        assert_eq!(grid.get_pixel(0, 0).0, [128, 128, 128]);
        assert_eq!(grid.get_pixel(2, 2).0, [255, 255, 255]);
        // The last row only has two images.
        assert_eq!(grid.get_pixel(6 * 3 + 2, 6 + 2).0, [128, 128, 128]);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_evaluation_files_are_reported_early() {
        let config = TrainConfig { fid_cache: "/nonexistent/stats.npz".into(), ..Default::default() };
        assert!(matches!(Evaluation::check_resources(&config), Err(Error::Resource { .. })));
    }

    #[test]
    fn grids_need_rgb_images() {
        let images = Tensor::zeros([2, 4, 4, 1], (Kind::Uint8, Device::Cpu));
        assert!(matches!(save_grid(&images, Path::new("unused.png")), Err(Error::Config(_))));
    }
}
