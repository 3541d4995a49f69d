//! Error types shared by the diffusion, sampling and training code.
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid schedule, loss, variance or dataset configuration. Raised at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A file required to run (checkpoint, classifier weights, reference statistics) is
    /// missing or unusable.
    #[error("cannot use {path:?}: {reason}")]
    Resource { path: PathBuf, reason: String },

    /// NaN or infinite values reached the loss computation.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// A replica failed while the others were waiting on a collective operation.
    #[error("distributed coordination failed: {0}")]
    Coordination(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn resource(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Resource { path: path.into(), reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
