//! Reference statistics, generated sample archives and the metrics table.
use super::FidStatistics;
use crate::error::{Error, Result};
use crate::utils::ensure_exists;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tch::{Kind, Tensor};

fn read_archive(path: &Path, what: &str) -> Result<HashMap<String, Tensor>> {
    ensure_exists(path, what)?;
    let tensors = Tensor::read_npz(path).map_err(|e| Error::resource(path, e.to_string()))?;
    Ok(tensors.into_iter().collect())
}

/// Loads reference statistics, `mu`/`sigma` or the spatial `mu_s`/`sigma_s` pair.
pub fn read_statistics<P: AsRef<Path>>(path: P, spatial: bool) -> Result<FidStatistics> {
    let path = path.as_ref();
    let mut tensors = read_archive(path, "reference statistics")?;
    let (mu_key, sigma_key) = if spatial { ("mu_s", "sigma_s") } else { ("mu", "sigma") };
    let mut take = |key: &str| {
        tensors
            .remove(key)
            .map(|t| t.to_kind(Kind::Double))
            .ok_or_else(|| Error::resource(path, format!("no {key} array")))
    };
    let mu = take(mu_key)?;
    let sigma = take(sigma_key)?;
    let d = mu.size().first().copied().unwrap_or(0);
    if mu.dim() != 1 || sigma.size() != [d, d] {
        return Err(Error::resource(
            path,
            format!("inconsistent statistics shapes {:?} and {:?}", mu.size(), sigma.size()),
        ));
    }
    Ok(FidStatistics { mu, sigma })
}

/// Loads the reference activations stored under `arr_0`.
pub fn read_activations<P: AsRef<Path>>(path: P) -> Result<Tensor> {
    let path = path.as_ref();
    read_archive(path, "reference activations")?
        .remove("arr_0")
        .ok_or_else(|| Error::resource(path, "no arr_0 array"))
}

/// Writes uint8 channel-last samples as `arr_0` and their labels, if any, as `arr_1`.
pub fn write_samples<P: AsRef<Path>>(path: P, images: &Tensor, labels: Option<&Tensor>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut arrays = vec![("arr_0", images.shallow_clone())];
    if let Some(labels) = labels {
        arrays.push(("arr_1", labels.shallow_clone()));
    }
    Tensor::write_npz(&arrays, path)?;
    Ok(())
}

/// `<dataset>_<H>x<W>_samples.npz`
pub fn samples_file_name(dataset: &str, images: &Tensor) -> String {
    let size = images.size();
    let shape: Vec<String> = size.iter().skip(1).take(2).map(|d| d.to_string()).collect();
    format!("{dataset}_{}_samples.npz", shape.join("x"))
}

/// An append-only CSV table with one row per evaluation.
#[derive(Debug, Clone)]
pub struct MetricsLog {
    path: PathBuf,
    columns: Vec<String>,
}

impl MetricsLog {
    /// The table for a run, its file name is `run_name` with the characters that are not
    /// safe in file names replaced by underscores.
    pub fn new<P: AsRef<Path>>(dir: P, run_name: &str, columns: &[&str]) -> Result<Self> {
        let re = regex::Regex::new(r"[^\w\-_\. ]").map_err(|e| Error::config(e.to_string()))?;
        let name = re.replace_all(run_name, "_");
        let name = name.trim_end_matches('_');
        Ok(Self {
            path: dir.as_ref().join(format!("{name}.csv")),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends the metrics of `step`, writing the header first when the file is new.
    /// Missing metrics are left empty.
    pub fn append(&self, step: usize, metrics: &[(&str, Option<f64>)]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let is_new = !self.path.exists();
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        if is_new {
            writeln!(file, "Step,{}", self.columns.join(","))?;
        }
        let values: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                metrics
                    .iter()
                    .find(|(name, _)| *name == c.as_str())
                    .and_then(|(_, v)| *v)
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            })
            .collect();
        writeln!(file, "{step},{}", values.join(","))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("guided-diffusion-{name}-{}", std::process::id()))
    }

    #[test]
    fn metrics_table_has_a_single_header() {
        let dir = temp_dir("metrics");
        let log = MetricsLog::new(&dir, "CIFAR-10_UNet_lr_0.0001_cfg_1.5_(a/b)_cond_", &["IS_EMA", "FID_EMA"]).unwrap();
        assert_eq!(log.path().file_name().unwrap(), "CIFAR-10_UNet_lr_0.0001_cfg_1.5__a_b__cond.csv");
        log.append(100, &[("IS_EMA", Some(9.5)), ("FID_EMA", Some(3.25))]).unwrap();
        log.append(200, &[("FID_EMA", Some(2.5))]).unwrap();
        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content, "Step,IS_EMA,FID_EMA\n100,9.5,3.25\n200,,2.5\n");
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn statistics_round_trip_through_npz() {
        let dir = temp_dir("stats");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ref.npz");
        let mu = Tensor::from_slice(&[1f64, 2.]);
        let sigma = Tensor::eye(2, (Kind::Double, Device::Cpu));
        Tensor::write_npz(&[("mu", &mu), ("sigma", &sigma)], &path).unwrap();
        let stats = read_statistics(&path, false).unwrap();
        assert!(stats.mu.equal(&mu));
        assert!(matches!(read_statistics(&path, true), Err(Error::Resource { .. })));
        assert!(matches!(read_statistics(dir.join("missing.npz"), false), Err(Error::Resource { .. })));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn samples_are_stored_as_numbered_arrays() {
        let dir = temp_dir("samples");
        let images = Tensor::ones([2, 4, 4, 3], (Kind::Uint8, Device::Cpu));
        let path = dir.join(samples_file_name("LSUN", &images));
        write_samples(&path, &images, Some(&Tensor::from_slice(&[1i64, 0]))).unwrap();
        assert!(read_activations(&path).unwrap().equal(&images));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn samples_are_named_after_their_size() {
        let images = Tensor::zeros([5, 32, 16, 3], (Kind::Uint8, Device::Cpu));
        assert_eq!(samples_file_name("CIFAR-10", &images), "CIFAR-10_32x16_samples.npz");
    }
}
