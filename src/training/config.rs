//! Training run configuration.
//!
//! The configuration is a plain serde structure so that runs can be described in a JSON
//! file. String-keyed choices are resolved into enums once by [`TrainConfig::resolve`].
use crate::diffusion::resample::StepSamplerKind;
use crate::diffusion::{DiffusionConfig, LossType, MeanType, VarType, WeightType};
use crate::error::{Error, Result};
use crate::schedulers::ddim::DDIMSamplerConfig;
use crate::schedulers::heun::HeunSamplerConfig;
use crate::schedulers::{BetaSchedule, SamplerKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetKind {
    #[serde(rename = "CIFAR-10")]
    Cifar10,
    ImageNet,
    #[serde(rename = "LSUN")]
    Lsun,
    #[serde(rename = "Encoded_ImageNet")]
    EncodedImageNet,
}

impl DatasetKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cifar10 => "CIFAR-10",
            Self::ImageNet => "ImageNet",
            Self::Lsun => "LSUN",
            Self::EncodedImageNet => "Encoded_ImageNet",
        }
    }
}

impl FromStr for DatasetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CIFAR-10" => Ok(Self::Cifar10),
            "ImageNet" => Ok(Self::ImageNet),
            "LSUN" => Ok(Self::Lsun),
            "Encoded_ImageNet" => Ok(Self::EncodedImageNet),
            _ => Err(Error::config(format!("unknown dataset {s}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub train: bool,
    pub eval: bool,
    pub data_dir: PathBuf,
    pub dataset: DatasetKind,
    pub in_chans: i64,
    pub image_size: i64,
    pub num_classes: i64,
    pub seed: i64,

    // Gaussian diffusion
    pub beta_schedule: String,
    pub k: f64,
    pub beta_1: f64,
    pub beta_t: f64,
    #[serde(rename = "T")]
    pub num_timesteps: usize,
    pub mean_type: String,
    pub var_type: String,
    pub loss_type: String,
    pub weight_type: String,

    // Model
    pub model_channels: i64,
    pub channel_mult: Vec<i64>,
    pub num_res_blocks: usize,

    // Training
    pub lr: f64,
    pub final_lr: f64,
    pub grad_clip: Option<f64>,
    pub dropout: f64,
    pub drop_label_prob: f64,
    pub total_steps: usize,
    pub warmup_steps: usize,
    pub batch_size: i64,
    pub ema_decay: f64,
    pub sampler_type: String,
    /// All-gather the sampled timesteps and losses before updating the loss-aware step
    /// sampler, so that every replica keeps the same history.
    pub sync_step_sampler: bool,
    pub cosine_decay: bool,
    pub class_cond: bool,
    pub amp: bool,
    pub resume: Option<PathBuf>,
    /// Force the CPU even when an accelerator is available.
    pub cpu: bool,

    // Logging and sampling
    pub sampler: String,
    pub sample_timesteps: usize,
    pub logdir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub sample_size: i64,
    pub sample_step: usize,
    pub use_classifier: Option<PathBuf>,
    pub classifier_scale: f64,
    pub guidance_scale: f64,
    pub vae_decoder: Option<PathBuf>,

    // Evaluation
    pub save_step: usize,
    pub eval_step: usize,
    pub num_samples: usize,
    pub fid_cache: PathBuf,
    pub inception: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train: true,
            eval: true,
            data_dir: PathBuf::from("./data"),
            dataset: DatasetKind::Cifar10,
            in_chans: 3,
            image_size: 32,
            num_classes: 10,
            seed: 42,
            beta_schedule: "optim".to_string(),
            k: 3.0,
            beta_1: 1e-4,
            beta_t: 0.02,
            num_timesteps: 1000,
            mean_type: "EPSILON".to_string(),
            var_type: "FIXED_LARGE".to_string(),
            loss_type: "MAPPED_MSE".to_string(),
            weight_type: "constant".to_string(),
            model_channels: 128,
            channel_mult: vec![1, 2, 2, 2],
            num_res_blocks: 2,
            lr: 1e-4,
            final_lr: 1e-5,
            grad_clip: None,
            dropout: 0.2,
            drop_label_prob: 0.1,
            total_steps: 400000,
            warmup_steps: 5000,
            batch_size: 128,
            ema_decay: 0.9999,
            sampler_type: "loss-second-moment".to_string(),
            sync_step_sampler: false,
            cosine_decay: true,
            class_cond: true,
            amp: false,
            resume: None,
            cpu: false,
            sampler: "heun".to_string(),
            sample_timesteps: 10,
            logdir: PathBuf::from("./logs"),
            checkpoint_dir: PathBuf::from("./checkpoint"),
            sample_size: 64,
            sample_step: 5000,
            use_classifier: None,
            classifier_scale: 1.0,
            guidance_scale: 1.5,
            vae_decoder: None,
            save_step: 100000,
            eval_step: 100000,
            num_samples: 50000,
            fid_cache: PathBuf::from("./stats/fid_stats_cifar10_train.npz"),
            inception: PathBuf::from("./stats/inception.pt"),
        }
    }
}

/// The string-keyed choices of a [`TrainConfig`] resolved into enums.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedConfig {
    pub beta_schedule: BetaSchedule,
    pub diffusion: DiffusionConfig,
    pub step_sampler: StepSamplerKind,
    pub sampler: SamplerKind,
}

impl TrainConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| Error::resource(path, format!("cannot open configuration: {e}")))?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| Error::config(format!("{path:?}: {e}")))
    }

    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let beta_schedule =
            BetaSchedule::from_name(&self.beta_schedule, self.k, self.beta_1, self.beta_t)?;
        let diffusion = DiffusionConfig {
            mean_type: MeanType::from_str(&self.mean_type)?,
            var_type: VarType::from_str(&self.var_type)?,
            loss_type: LossType::from_str(&self.loss_type)?,
            weight_type: WeightType::from_str(&self.weight_type)?,
        };
        diffusion.validate()?;
        Ok(ResolvedConfig {
            beta_schedule,
            diffusion,
            step_sampler: StepSamplerKind::from_str(&self.sampler_type)?,
            sampler: SamplerKind::from_str(&self.sampler)?,
        })
    }

    /// Checks everything that can be checked before any tensor is allocated.
    pub fn validate(&self, world_size: usize) -> Result<ResolvedConfig> {
        let resolved = self.resolve()?;
        // Builds the schedule for its validation errors.
        resolved.beta_schedule.betas(self.num_timesteps)?;
        if self.dataset == DatasetKind::ImageNet && ![64, 128, 256].contains(&self.image_size) {
            return Err(Error::config(format!(
                "ImageNet is available at 64, 128 or 256 pixels, not {}",
                self.image_size
            )));
        }
        if self.batch_size < 1 || self.batch_size % world_size as i64 != 0 {
            return Err(Error::config(format!(
                "batch size {} is not divisible by the {world_size} replicas",
                self.batch_size
            )));
        }
        if self.sample_size < 1 {
            return Err(Error::config("the sample size must be at least 1"));
        }
        if self.sample_timesteps < 1 {
            return Err(Error::config("sampling needs at least one step"));
        }
        if !self.class_cond && !crate::utils::float_equal(self.guidance_scale, 1.) {
            return Err(Error::config("classifier-free guidance needs class_cond"));
        }
        if self.use_classifier.is_some() && !self.class_cond {
            return Err(Error::config("classifier guidance needs class_cond"));
        }
        if !(0. ..1.).contains(&self.drop_label_prob) {
            return Err(Error::config(format!("drop_label_prob {} is outside of [0, 1)", self.drop_label_prob)));
        }
        Ok(resolved)
    }

    /// Per-replica batch size.
    pub fn local_batch_size(&self, world_size: usize) -> i64 {
        self.batch_size / world_size as i64
    }

    pub fn ddim_config(&self) -> DDIMSamplerConfig {
        DDIMSamplerConfig {
            num_steps: self.sample_timesteps,
            guidance_scale: if self.class_cond { self.guidance_scale } else { 1. },
            classifier_scale: self.classifier_scale,
            ..Default::default()
        }
    }

    pub fn heun_config(&self, mean_type: MeanType) -> HeunSamplerConfig {
        HeunSamplerConfig {
            num_steps: self.sample_timesteps,
            guidance_scale: if self.class_cond { self.guidance_scale } else { 1. },
            classifier_scale: self.classifier_scale,
            mean_type,
            ..Default::default()
        }
    }

    /// The schedule as it appears in file names, `optim_<k>` for the optim schedule.
    fn schedule_tag(&self) -> String {
        match BetaSchedule::from_name(&self.beta_schedule, self.k, self.beta_1, self.beta_t) {
            Ok(BetaSchedule::Optim { k }) => format!("optim_{k:?}"),
            Ok(schedule) => schedule.name().to_string(),
            Err(_) => self.beta_schedule.clone(),
        }
    }

    /// `<loss>_<schedule>[_<k>]_<step>.ot`
    pub fn checkpoint_name(&self, step: usize) -> String {
        format!("{}_{}_{step}.ot", self.loss_type, self.schedule_tag())
    }

    /// A file stem describing the hyper-parameters of the run, used for the metrics table.
    pub fn run_name(&self) -> String {
        let mut params = format!("{}_UNet-{}_", self.dataset.name(), self.image_size);
        params.push_str(&format!("lr_{:?}_", self.lr));
        params.push_str(&format!("dropout_{:?}_", self.dropout));
        params.push_str(&format!("drop_label_{:?}_", self.drop_label_prob));
        params.push_str(&format!("sample_t_{}_", self.sample_timesteps));
        params.push_str(&format!("cfg_{:?}_", self.guidance_scale));
        params.push_str(&format!("beta_sched_{}_", self.schedule_tag()));
        params.push_str(&format!("loss_{}_", self.loss_type));
        params.push_str(&format!("weight_{}_", self.weight_type));
        if let Some(grad_clip) = self.grad_clip {
            params.push_str(&format!("gradclip_{grad_clip:?}_"));
        }
        if self.class_cond {
            params.push_str("cond_");
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TrainConfig::default();
        let resolved = config.validate(4).unwrap();
        assert_eq!(resolved.beta_schedule, BetaSchedule::Optim { k: 3. });
        assert_eq!(resolved.diffusion.loss_type, LossType::MappedMse);
        assert_eq!(resolved.sampler, SamplerKind::Heun);
        assert_eq!(config.local_batch_size(4), 32);
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        let base = TrainConfig::default();
        let cases = [
            TrainConfig { num_timesteps: 0, ..base.clone() },
            TrainConfig { k: 0., ..base.clone() },
            TrainConfig { loss_type: "KL".to_string(), ..base.clone() },
            TrainConfig { dataset: DatasetKind::ImageNet, image_size: 32, ..base.clone() },
            TrainConfig { batch_size: 130, ..base.clone() },
            TrainConfig { sample_timesteps: 0, ..base.clone() },
            TrainConfig { class_cond: false, ..base.clone() },
            TrainConfig { weight_type: "min_snr_-1".to_string(), ..base.clone() },
        ];
        for config in cases {
            assert!(matches!(config.validate(4), Err(Error::Config(_))), "{config:?}");
        }
    }

    #[test]
    fn json_round_trip_uses_the_run_script_names() {
        let json = r#"{"dataset": "Encoded_ImageNet", "T": 250, "in_chans": 4, "beta_schedule": "cosine"}"#;
        let config: TrainConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.dataset, DatasetKind::EncodedImageNet);
        assert_eq!(config.num_timesteps, 250);
        assert_eq!(config.lr, 1e-4);
        let back = serde_json::to_string(&config).unwrap();
        assert!(back.contains("\"T\":250"));
    }

    #[test]
    fn file_names_follow_the_hyper_parameters() {
        let config = TrainConfig::default();
        assert_eq!(config.checkpoint_name(5000), "MAPPED_MSE_optim_3.0_5000.ot");
        let config = TrainConfig { beta_schedule: "cosine".to_string(), ..config };
        assert_eq!(config.checkpoint_name(10), "MAPPED_MSE_cosine_10.ot");
        assert!(config.run_name().starts_with("CIFAR-10_UNet-32_lr_0.0001_dropout_0.2_"));
        assert!(config.run_name().ends_with("cond_"));
        assert!(config.run_name().contains("_beta_sched_cosine_"));
    }

    #[test]
    fn schedule_names_are_case_insensitive_in_file_names() {
        let config = TrainConfig { beta_schedule: "Optim".to_string(), k: 2., ..TrainConfig::default() };
        assert_eq!(config.resolve().unwrap().beta_schedule, BetaSchedule::Optim { k: 2. });
        assert_eq!(config.checkpoint_name(7), "MAPPED_MSE_optim_2.0_7.ot");
        assert!(config.run_name().contains("_beta_sched_optim_2.0_"));
    }
}
