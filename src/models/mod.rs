//! # Models
//!
//! The diffusion code only sees networks through the traits defined here: a denoiser
//! predicting the quantity selected by the mean type, an optional noisy-image classifier
//! for classifier guidance and an optional decoder mapping latents back to pixels.
//! A small class-conditional UNet is provided so that training runs end to end, the
//! other networks are loaded as TorchScript modules.
use crate::error::Result;
use crate::utils::ensure_exists;
use std::path::Path;
use tch::{CModule, Device, Tensor};

pub mod embeddings;
pub mod resnet;
pub mod unet;

/// A network mapping a noised batch, the (rescaled, floating point) timesteps and the
/// optional class labels to a prediction with the same spatial shape as the input.
/// When the variance is learned the prediction has twice as many channels.
pub trait Denoiser {
    fn forward_t(&self, xs: &Tensor, timesteps: &Tensor, labels: Option<&Tensor>, train: bool) -> Tensor;

    /// Number of channels of the samples the denoiser works on.
    fn in_channels(&self) -> i64;

    /// Number of real classes, the label table holds one extra row for the null class
    /// used by classifier-free guidance. `None` for unconditional models.
    fn num_classes(&self) -> Option<i64>;

    /// Number of rows of the label table, `None` for unconditional models.
    fn label_table_rows(&self) -> Option<i64> {
        self.num_classes().map(|n| n + 1)
    }
}

/// A classifier trained on noised images.
pub trait Classifier {
    fn logits(&self, xs: &Tensor, timesteps: &Tensor) -> Result<Tensor>;
}

/// A fixed decoder from the latent space back to pixel space.
pub trait LatentDecoder {
    fn latent_channels(&self) -> i64;
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;
}

/// A classifier exported with `torch.jit.trace`, taking `(xs, timesteps)`.
pub struct TorchScriptClassifier {
    module: CModule,
}

impl TorchScriptClassifier {
    pub fn load<P: AsRef<Path>>(path: P, device: Device) -> Result<Self> {
        ensure_exists(&path, "classifier weights")?;
        let mut module = CModule::load_on_device(path.as_ref(), device)?;
        module.set_eval();
        Ok(Self { module })
    }
}

impl Classifier for TorchScriptClassifier {
    fn logits(&self, xs: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        Ok(self.module.forward_ts(&[xs, timesteps])?)
    }
}

/// An autoencoder decoder exported with `torch.jit.trace`.
pub struct TorchScriptDecoder {
    module: CModule,
    latent_channels: i64,
}

impl TorchScriptDecoder {
    pub fn load<P: AsRef<Path>>(path: P, latent_channels: i64, device: Device) -> Result<Self> {
        ensure_exists(&path, "latent decoder")?;
        let mut module = CModule::load_on_device(path.as_ref(), device)?;
        module.set_eval();
        Ok(Self { module, latent_channels })
    }
}

impl LatentDecoder for TorchScriptDecoder {
    fn latent_channels(&self) -> i64 {
        self.latent_channels
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        Ok(self.module.forward_ts(&[latents])?)
    }
}
