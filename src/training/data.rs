//! Training data.
//!
//! The whole training split is held in host memory. Each replica owns a fixed strided
//! shard of it and walks that shard in a new random order every epoch, indefinitely.
use super::config::{DatasetKind, TrainConfig};
use crate::error::{Error, Result};
use crate::schedulers::LATENT_SCALE;
use crate::utils::ensure_exists;
use tch::{Device, Kind, Tensor};

/// Images in [-1, 1] (or scaled latents) with shape (n, c, h, w) and int64 labels.
#[derive(Debug)]
pub struct TrainingSet {
    pub images: Tensor,
    pub labels: Tensor,
}

impl TrainingSet {
    pub fn new(images: Tensor, labels: Tensor) -> Result<Self> {
        let n = images.size().first().copied().unwrap_or(0);
        if images.dim() != 4 || labels.size() != [n] {
            return Err(Error::config(format!(
                "expected (n, c, h, w) images and (n,) labels, got {:?} and {:?}",
                images.size(),
                labels.size()
            )));
        }
        if n == 0 {
            return Err(Error::config("the training set is empty"));
        }
        Ok(Self { images, labels: labels.to_kind(Kind::Int64) })
    }

    pub fn len(&self) -> i64 {
        self.labels.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads the training split selected by `config` and checks its geometry.
    pub fn load(config: &TrainConfig) -> Result<Self> {
        let set = match config.dataset {
            DatasetKind::Cifar10 => {
                let dataset = tch::vision::cifar::load_dir(&config.data_dir).map_err(|e| {
                    Error::resource(&config.data_dir, format!("cannot load CIFAR-10: {e}"))
                })?;
                Self::new(to_signed_range(&dataset.train_images), dataset.train_labels)?
            }
            kind => {
                let ot = config.data_dir.join(format!("{}.ot", kind.name()));
                let path = if ot.is_file() { ot } else { config.data_dir.join(format!("{}.npz", kind.name())) };
                Self::from_archive(&path, kind == DatasetKind::EncodedImageNet)?
            }
        };
        let (_, c, h, w) = set.images.size4()?;
        if c != config.in_chans || h != config.image_size || w != config.image_size {
            return Err(Error::config(format!(
                "{} samples have shape ({c}, {h}, {w}), the model expects ({}, {}, {})",
                config.dataset.name(),
                config.in_chans,
                config.image_size,
                config.image_size
            )));
        }
        let max_label = set.labels.max().int64_value(&[]);
        if max_label >= config.num_classes {
            return Err(Error::config(format!(
                "label {max_label} is out of range for {} classes",
                config.num_classes
            )));
        }
        Ok(set)
    }

    /// Reads a `.npz` or `.ot` archive holding `images` (uint8, channel last) and `labels`. Latent archives
    /// hold unscaled float `(n, c, h, w)` encodings instead.
    pub fn from_archive(path: &std::path::Path, latents: bool) -> Result<Self> {
        ensure_exists(path, "dataset archive")?;
        let tensors = match path.extension().and_then(|e| e.to_str()) {
            Some("ot") => Tensor::load_multi(path)?,
            _ => Tensor::read_npz(path)?,
        };
        let find = |names: &[&str]| {
            tensors
                .iter()
                .find(|(name, _)| names.contains(&name.as_str()))
                .map(|(_, t)| t.shallow_clone())
                .ok_or_else(|| Error::resource(path, format!("no {} array", names[0])))
        };
        let images = find(&["images", "arr_0"])?;
        let labels = find(&["labels", "arr_1"])?;
        let images = if latents {
            images.to_kind(Kind::Float) * LATENT_SCALE
        } else {
            to_signed_range(&images.permute([0, 3, 1, 2]))
        };
        Self::new(images, labels)
    }
}

/// Maps uint8 pixels, or floats in [0, 1], to [-1, 1].
fn to_signed_range(images: &Tensor) -> Tensor {
    let unit = if images.kind() == Kind::Uint8 {
        images.to_kind(Kind::Float) / 255.
    } else {
        images.to_kind(Kind::Float)
    };
    unit * 2. - 1.
}

/// Endless batches over the shard of one replica. Incomplete batches at the end of an
/// epoch are dropped.
#[derive(Debug)]
pub struct CyclicLoader {
    images: Tensor,
    labels: Tensor,
    batch_size: i64,
    device: Device,
    order: Tensor,
    position: i64,
    epoch: usize,
}

impl CyclicLoader {
    pub fn new(
        set: &TrainingSet,
        rank: usize,
        world_size: usize,
        batch_size: i64,
        device: Device,
    ) -> Result<Self> {
        let (rank, world_size) = (rank as i64, world_size as i64);
        // Every shard gets the same number of examples.
        let per_replica = set.len() / world_size;
        if per_replica < batch_size || batch_size < 1 {
            return Err(Error::config(format!(
                "{} examples cannot feed batches of {batch_size} on {world_size} replicas",
                set.len()
            )));
        }
        let shard = Tensor::arange_start_step(rank, per_replica * world_size, world_size, (Kind::Int64, Device::Cpu));
        let images = set.images.index_select(0, &shard);
        let labels = set.labels.index_select(0, &shard);
        let mut loader = Self {
            images,
            labels,
            batch_size,
            device,
            order: Tensor::empty([0], (Kind::Int64, Device::Cpu)),
            position: 0,
            epoch: 0,
        };
        loader.shuffle();
        Ok(loader)
    }

    fn shuffle(&mut self) {
        let n = self.labels.size()[0];
        self.order = Tensor::randperm(n, (Kind::Int64, Device::Cpu));
        self.position = 0;
    }

    /// Number of complete passes over the shard.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn batches_per_epoch(&self) -> i64 {
        self.labels.size()[0] / self.batch_size
    }

    /// The next `(images, labels)` batch, on the device of the replica.
    pub fn next_batch(&mut self) -> (Tensor, Tensor) {
        if self.position + self.batch_size > self.order.size()[0] {
            self.epoch += 1;
            self.shuffle();
        }
        let index = self.order.narrow(0, self.position, self.batch_size);
        self.position += self.batch_size;
        (
            self.images.index_select(0, &index).to_device(self.device),
            self.labels.index_select(0, &index).to_device(self.device),
        )
    }
}

/// Replaces each label by the null class `num_classes` with probability `prob`, so that
/// the same network also learns the unconditional model.
pub fn drop_labels(labels: &Tensor, prob: f64, num_classes: i64) -> Tensor {
    if prob <= 0. {
        return labels.shallow_clone();
    }
    let drop = labels.to_kind(Kind::Float).rand_like().lt(prob);
    labels.where_self(&drop.logical_not(), &labels.full_like(num_classes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_set(n: i64) -> TrainingSet {
        let images = Tensor::arange(n, (Kind::Float, Device::Cpu)).view([n, 1, 1, 1]).expand([n, 3, 2, 2], false).contiguous();
        let labels = Tensor::arange(n, (Kind::Int64, Device::Cpu));
        TrainingSet::new(images, labels).unwrap()
    }

    #[test]
    fn shards_are_disjoint_and_cover_an_epoch() {
        let set = toy_set(10);
        let mut seen = vec![];
        for rank in 0..2 {
            let mut loader = CyclicLoader::new(&set, rank, 2, 2, Device::Cpu).unwrap();
            assert_eq!(loader.batches_per_epoch(), 2);
            for _ in 0..2 {
                let (images, labels) = loader.next_batch();
                assert_eq!(images.size(), [2, 3, 2, 2]);
                let labels = Vec::<i64>::try_from(labels).unwrap();
                assert!(labels.iter().all(|l| l % 2 == rank as i64));
                seen.extend(labels);
            }
            assert_eq!(loader.epoch(), 0);
            loader.next_batch();
            assert_eq!(loader.epoch(), 1);
        }
        seen.sort();
        seen.dedup();
        // Each shard holds 5 examples, one of them is dropped with batches of 2.
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn images_and_labels_stay_paired() {
        let set = toy_set(6);
        let mut loader = CyclicLoader::new(&set, 0, 1, 3, Device::Cpu).unwrap();
        for _ in 0..5 {
            let (images, labels) = loader.next_batch();
            let pixel = images.select(1, 0).select(1, 0).select(1, 0).to_kind(Kind::Int64);
            assert!(pixel.equal(&labels));
        }
    }

    #[test]
    fn too_small_shards_are_rejected() {
        let set = toy_set(4);
        assert!(matches!(CyclicLoader::new(&set, 0, 2, 3, Device::Cpu), Err(Error::Config(_))));
        let bad = TrainingSet::new(Tensor::zeros([2, 3], (Kind::Float, Device::Cpu)), Tensor::zeros([2], (Kind::Int64, Device::Cpu)));
        assert!(bad.is_err());
    }

    #[test]
    fn label_dropout_uses_the_null_class() {
        let labels = Tensor::from_slice(&[1i64; 1000]);
        assert!(drop_labels(&labels, 0., 10).equal(&labels));
        let dropped = Vec::<i64>::try_from(drop_labels(&labels, 0.5, 10)).unwrap();
        assert!(dropped.iter().all(|&l| l == 1 || l == 10));
        let n_null = dropped.iter().filter(|&&l| l == 10).count();
        assert!(n_null > 350 && n_null < 650, "{n_null}");
    }

    #[test]
    fn pixels_are_mapped_to_the_signed_range() {
        let pixels = Tensor::from_slice(&[0u8, 255]);
        let mapped = Vec::<f32>::try_from(to_signed_range(&pixels)).unwrap();
        assert_eq!(mapped, vec![-1., 1.]);
    }
}
