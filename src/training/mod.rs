//! # Distributed training
//!
//! Configuration, data, optimisation and the training loop itself. Replicas communicate
//! through the [`distributed::RuntimeContext`] they are given, a single-process run uses
//! [`distributed::RuntimeContext::single`].
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod ema;
pub mod optim;
pub mod trainer;

pub use config::TrainConfig;
pub use distributed::{LocalGroup, RuntimeContext};
pub use trainer::{Evaluation, Trainer};
