//! # Guided diffusion training and sampling
//!
//! Training and sampling of image diffusion models using Torch via
//! [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - Noise schedules (linear, cosine and the generalised `optim` cosine) and a Gaussian
//!   diffusion process with several mean, variance and loss parameterisations.
//! - Importance sampling of the training timesteps.
//! - DDIM and Heun samplers with classifier and classifier-free guidance.
//! - A multi-replica training loop with an exponential moving average of the weights,
//!   periodic sampling, checkpointing and FID/IS evaluation.
//!
//! Classifiers, latent decoders and the evaluation network are loaded as TorchScript
//! modules.

pub mod diffusion;
pub mod error;
pub mod evaluation;
pub mod models;
pub mod schedulers;
pub mod training;
pub mod utils;

pub use error::{Error, Result};
