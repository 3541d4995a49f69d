//! Closed-form Gaussian log-likelihood helpers used by the variational bound.
use tch::{Kind, Tensor};

/// KL divergence between two diagonal Gaussians given by mean and log-variance.
/// Shapes are broadcast, the result is elementwise.
pub fn normal_kl(mean1: &Tensor, logvar1: &Tensor, mean2: &Tensor, logvar2: &Tensor) -> Tensor {
    let diff = mean1 - mean2;
    ((logvar2 - logvar1) - 1. + (logvar1 - logvar2).exp() + diff.square() * (-logvar2).exp())
        * 0.5
}

/// A fast approximation of the cumulative distribution function of the
/// standard normal.
pub fn approx_standard_normal_cdf(xs: &Tensor) -> Tensor {
    let c = (2. / std::f64::consts::PI).sqrt();
    ((c * (xs + xs.pow_tensor_scalar(3) * 0.044715)).tanh() + 1.) * 0.5
}

/// Log-likelihood of a Gaussian discretizing to a given image, the targets are uint8
/// values rescaled to [-1, 1] so each bin has width 2/255.
pub fn discretized_gaussian_log_likelihood(xs: &Tensor, means: &Tensor, log_scales: &Tensor) -> Tensor {
    let centered_x = xs - means;
    let inv_stdv = (-log_scales).exp();
    let plus_in = &inv_stdv * (&centered_x + 1. / 255.);
    let cdf_plus = approx_standard_normal_cdf(&plus_in);
    let min_in = &inv_stdv * (&centered_x - 1. / 255.);
    let cdf_min = approx_standard_normal_cdf(&min_in);
    let log_cdf_plus = cdf_plus.clamp_min(1e-12).log();
    let log_one_minus_cdf_min = (1. - &cdf_min).clamp_min(1e-12).log();
    let cdf_delta = &cdf_plus - &cdf_min;
    let log_cdf_delta = cdf_delta.clamp_min(1e-12).log();
    let upper = log_one_minus_cdf_min.where_self(&xs.gt(0.999), &log_cdf_delta);
    log_cdf_plus.where_self(&xs.lt(-0.999), &upper)
}

/// Takes the mean over all non-batch dimensions.
pub fn mean_flat(xs: &Tensor) -> Tensor {
    xs.flatten(1, -1).mean_dim(Some([1].as_slice()), false, Kind::Float)
}
