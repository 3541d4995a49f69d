use crate::error::{Error, Result};
use std::path::Path;
use tch::{Device, Kind, Tensor};

/// Fails with a resource error when `path` does not point to an existing file.
pub(crate) fn ensure_exists<P: AsRef<Path>>(path: P, what: &str) -> Result<()> {
    let path = path.as_ref();
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::resource(path, format!("{what} not found")))
    }
}

/// Picks the accelerator for a replica: the `rank`-th CUDA device when available, the
/// CPU otherwise or when `cpu` is set.
pub fn replica_device(rank: usize, cpu: bool) -> Device {
    if cpu {
        return Device::Cpu;
    }
    let n_cuda = tch::Cuda::device_count() as usize;
    if n_cuda > 0 {
        Device::Cuda(rank % n_cuda)
    } else if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::Cpu
    }
}

/// Maps images in [-1, 1] with shape (b, c, h, w) to uint8 channel-last (b, h, w, c).
pub fn to_uint8_nhwc(images: &Tensor) -> Tensor {
    ((images + 1.) * 127.5)
        .clamp(0., 255.)
        .to_kind(Kind::Uint8)
        .permute([0, 2, 3, 1])
        .contiguous()
}

/// Returns true when every element of `xs` is finite.
pub(crate) fn all_finite(xs: &Tensor) -> bool {
    xs.isfinite().all().to_kind(Kind::Int64).int64_value(&[]) == 1
}

pub(crate) fn float_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-8
}
