//! # Sample quality evaluation
//!
//! Generated images are fed to an Inception-style activation network. The pooled features
//! give the Fréchet distance against precomputed reference statistics and the class
//! predictions give the Inception Score.
use crate::error::{Error, Result};
use crate::utils::ensure_exists;
use std::path::Path;
use tch::{CModule, Device, Kind, Tensor};

pub mod archive;

/// Number of predictions per split of the Inception Score.
pub const INCEPTION_SPLIT_SIZE: i64 = 5000;

/// An activation network taking uint8 channel-last image batches.
pub trait Evaluator {
    /// Returns the pooled features `(b, d)` and the class logits `(b, k)` of a batch.
    fn activations(&self, images: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Runs [`Evaluator::activations`] over all batches and concatenates the results.
    fn compute_activations(&self, batches: &[Tensor]) -> Result<(Tensor, Tensor)> {
        let _no_grad = tch::no_grad_guard();
        let mut pools = vec![];
        let mut logits = vec![];
        for batch in batches {
            let (pool, logit) = self.activations(batch)?;
            pools.push(pool.to_device(Device::Cpu).to_kind(Kind::Double));
            logits.push(logit.to_device(Device::Cpu).to_kind(Kind::Double));
        }
        if pools.is_empty() {
            return Err(Error::config("no batch to evaluate"));
        }
        Ok((Tensor::cat(&pools, 0), Tensor::cat(&logits, 0)))
    }
}

/// An activation network exported with `torch.jit.trace`, returning a `(pool, logits)`
/// tuple.
pub struct TorchScriptEvaluator {
    module: CModule,
    device: Device,
}

impl TorchScriptEvaluator {
    pub fn load<P: AsRef<Path>>(path: P, device: Device) -> Result<Self> {
        ensure_exists(&path, "activation network")?;
        let mut module = CModule::load_on_device(path.as_ref(), device)?;
        module.set_eval();
        Ok(Self { module, device })
    }
}

impl Evaluator for TorchScriptEvaluator {
    fn activations(&self, images: &Tensor) -> Result<(Tensor, Tensor)> {
        let images = images.to_device(self.device);
        let outputs = self.module.forward_is(&[tch::IValue::Tensor(images)])?;
        match outputs {
            tch::IValue::Tuple(values) => match values.as_slice() {
                [tch::IValue::Tensor(pool), tch::IValue::Tensor(logits), ..] => {
                    Ok((pool.flatten(1, -1), logits.shallow_clone()))
                }
                _ => Err(Error::config("the activation network must return (pool, logits)")),
            },
            _ => Err(Error::config("the activation network must return a tuple")),
        }
    }
}

/// Mean and covariance of a set of activations.
#[derive(Debug)]
pub struct FidStatistics {
    pub mu: Tensor,
    pub sigma: Tensor,
}

impl FidStatistics {
    /// Statistics of `(n, d)` activations, the covariance is unbiased.
    pub fn compute(activations: &Tensor) -> Result<Self> {
        let acts = activations.to_kind(Kind::Double);
        let (n, _) = acts.size2()?;
        if n < 2 {
            return Err(Error::config("at least two activations are needed for a covariance"));
        }
        let mu = acts.mean_dim(Some([0i64].as_slice()), false, Kind::Double);
        let centered = &acts - &mu;
        let sigma = centered.transpose(0, 1).matmul(&centered) / (n - 1) as f64;
        Ok(Self { mu, sigma })
    }

    /// The Fréchet distance between the two Gaussians,
    /// `|mu1 - mu2|^2 + tr(s1) + tr(s2) - 2 tr((s1 s2)^1/2)`.
    pub fn frechet_distance(&self, other: &Self) -> Result<f64> {
        if self.mu.size() != other.mu.size() || self.sigma.size() != other.sigma.size() {
            return Err(Error::config(format!(
                "statistics of dimension {:?} and {:?} cannot be compared",
                self.mu.size(),
                other.mu.size()
            )));
        }
        let s1 = self.sigma.to_kind(Kind::Double);
        let s2 = other.sigma.to_kind(Kind::Double);
        let diff = (&self.mu - &other.mu).to_kind(Kind::Double);
        // tr((s1 s2)^1/2) = tr((s1^1/2 s2 s1^1/2)^1/2), the latter being symmetric.
        let sqrt_s1 = symmetric_sqrt(&s1);
        let inner = sqrt_s1.matmul(&s2).matmul(&sqrt_s1);
        let inner = (&inner + inner.transpose(0, 1)) * 0.5;
        let tr_covmean = inner.linalg_eigvalsh("L").clamp_min(0.).sqrt().sum(Kind::Double);
        let fid = diff.dot(&diff) + s1.trace() + s2.trace() - tr_covmean * 2.;
        let fid = fid.double_value(&[]);
        if !fid.is_finite() {
            return Err(Error::Numerical("non-finite Fréchet distance".to_string()));
        }
        Ok(fid)
    }
}

/// Square root of a symmetric positive semi-definite matrix, small negative eigenvalues
/// coming from rounding errors are clamped to 0.
fn symmetric_sqrt(m: &Tensor) -> Tensor {
    let (eigenvalues, eigenvectors) = m.linalg_eigh("L");
    let roots = eigenvalues.clamp_min(0.).sqrt();
    (&eigenvectors * roots.unsqueeze(0)).matmul(&eigenvectors.transpose(0, 1))
}

/// The Inception Score of class logits, averaged over splits of `split_size` predictions.
pub fn inception_score(logits: &Tensor, split_size: i64) -> Result<f64> {
    let preds = logits.to_kind(Kind::Double).softmax(-1, Kind::Double);
    let n = preds.size().first().copied().unwrap_or(0);
    if n == 0 || split_size < 1 {
        return Err(Error::config("no prediction to score"));
    }
    let mut scores = vec![];
    for part in preds.split(split_size, 0) {
        let marginal = part.mean_dim(Some([0i64].as_slice()), true, Kind::Double);
        let kl = &part * (part.clamp_min(1e-12).log() - marginal.clamp_min(1e-12).log());
        let kl = kl.sum_dim_intlist(Some([1i64].as_slice()), false, Kind::Double).mean(Kind::Double);
        scores.push(kl.double_value(&[]).exp());
    }
    Ok(scores.iter().sum::<f64>() / scores.len() as f64)
}

/// IS and FID of a set of generated images.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationSummary {
    pub inception_score: f64,
    pub fid: f64,
}

/// Scores uint8 channel-last samples against reference statistics, in batches of
/// `batch_size` images.
pub fn evaluate_samples(
    evaluator: &dyn Evaluator,
    samples: &Tensor,
    batch_size: i64,
    reference: &FidStatistics,
) -> Result<EvaluationSummary> {
    let batches = samples.split(batch_size.max(1), 0);
    let (pool, logits) = evaluator.compute_activations(&batches)?;
    let stats = FidStatistics::compute(&pool)?;
    Ok(EvaluationSummary {
        inception_score: inception_score(&logits, INCEPTION_SPLIT_SIZE)?,
        fid: stats.frechet_distance(reference)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_statistics_are_at_distance_zero() {
        tch::manual_seed(0);
        let acts = Tensor::randn([200, 4], (Kind::Double, Device::Cpu));
        let stats = FidStatistics::compute(&acts).unwrap();
        let other = FidStatistics::compute(&acts).unwrap();
        assert!(stats.frechet_distance(&other).unwrap().abs() < 1e-8);
    }

    #[test]
    fn distance_between_isotropic_gaussians() {
        // mu shifted by (3, 4), covariances I and 4 I in 2d:
        // 25 + 2 + 8 - 2 * tr(2 I) = 27.
        let s1 = FidStatistics { mu: Tensor::from_slice(&[0f64, 0.]), sigma: Tensor::eye(2, (Kind::Double, Device::Cpu)) };
        let s2 = FidStatistics {
            mu: Tensor::from_slice(&[3f64, 4.]),
            sigma: Tensor::eye(2, (Kind::Double, Device::Cpu)) * 4.,
        };
        let fid = s1.frechet_distance(&s2).unwrap();
        assert!((fid - 27.).abs() < 1e-9, "{fid}");
        let s3 = FidStatistics { mu: Tensor::zeros([3], (Kind::Double, Device::Cpu)), sigma: Tensor::eye(3, (Kind::Double, Device::Cpu)) };
        assert!(s1.frechet_distance(&s3).is_err());
    }

    #[test]
    fn inception_score_bounds() {
        // Confident and uniformly spread predictions reach the number of classes.
        let confident = Tensor::eye(4, (Kind::Double, Device::Cpu)).repeat([5, 1]) * 100.;
        let score = inception_score(&confident, INCEPTION_SPLIT_SIZE).unwrap();
        assert!((score - 4.).abs() < 1e-6, "{score}");
        // Identical predictions give a score of 1.
        let constant = Tensor::ones([20, 4], (Kind::Double, Device::Cpu));
        let score = inception_score(&constant, 7).unwrap();
        assert!((score - 1.).abs() < 1e-9, "{score}");
    }

    struct Moments;

    impl Evaluator for Moments {
        fn activations(&self, images: &Tensor) -> Result<(Tensor, Tensor)> {
            let xs = images.to_kind(Kind::Double).flatten(1, -1);
            let pool = Tensor::stack(&[xs.mean_dim(Some([1i64].as_slice()), false, Kind::Double), xs.std_dim(Some([1i64].as_slice()), false, false)], 1);
            Ok((pool.shallow_clone(), pool))
        }
    }

    #[test]
    fn samples_are_scored_batch_by_batch() {
        tch::manual_seed(1);
        let samples = Tensor::randint(256, [30, 4, 4, 3], (Kind::Uint8, Device::Cpu));
        let (pool, _) = Moments.compute_activations(&samples.split(7, 0)).unwrap();
        assert_eq!(pool.size(), [30, 2]);
        let reference = FidStatistics::compute(&pool).unwrap();
        let summary = evaluate_samples(&Moments, &samples, 7, &reference).unwrap();
        assert!(summary.fid.abs() < 1e-6);
        assert!(summary.inception_score >= 1.);
    }
}
