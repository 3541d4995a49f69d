//! Timestep and class-label embeddings.
use tch::{nn, nn::Module, Device, Kind, Tensor};

/// Sinusoidal features of the (continuous) timesteps.
#[derive(Debug)]
pub struct SinusoidalEmbedding {
    num_channels: i64,
    max_period: f64,
    device: Device,
}

impl SinusoidalEmbedding {
    pub fn new(num_channels: i64, device: Device) -> Self {
        Self { num_channels, max_period: 10000., device }
    }
}

impl Module for SinusoidalEmbedding {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let half_dim = self.num_channels / 2;
        let exponent =
            Tensor::arange(half_dim, (Kind::Float, self.device)) * -f64::ln(self.max_period);
        let freqs = (exponent / half_dim as f64).exp();
        // emb = timesteps[:, None].float() * freqs[None, :]
        let emb = xs.to_kind(Kind::Float).unsqueeze(-1) * freqs.unsqueeze(0);
        let emb = Tensor::cat(&[emb.cos(), emb.sin()], -1);
        if self.num_channels % 2 == 1 {
            emb.pad([0, 1, 0, 0], "constant", None)
        } else {
            emb
        }
    }
}

/// Maps the timesteps and the optional labels to the conditioning vector added to every
/// residual block.
///
/// The label table has `num_classes + 1` rows, the last one being the null class used for
/// unconditional predictions.
#[derive(Debug)]
pub struct ConditionEmbedding {
    time_proj: SinusoidalEmbedding,
    linear_1: nn::Linear,
    linear_2: nn::Linear,
    label_embedding: Option<nn::Embedding>,
    num_classes: Option<i64>,
}

impl ConditionEmbedding {
    // act_fn: "silu"
    pub fn new(vs: nn::Path, channels: i64, embed_dim: i64, num_classes: Option<i64>) -> Self {
        let time_proj = SinusoidalEmbedding::new(channels, vs.device());
        let linear_cfg = Default::default();
        let linear_1 = nn::linear(&vs / "linear_1", channels, embed_dim, linear_cfg);
        let linear_2 = nn::linear(&vs / "linear_2", embed_dim, embed_dim, linear_cfg);
        let label_embedding = num_classes.map(|n| {
            nn::embedding(&vs / "label_embedding", n + 1, embed_dim, Default::default())
        });
        Self { time_proj, linear_1, linear_2, label_embedding, num_classes }
    }

    pub fn num_classes(&self) -> Option<i64> {
        self.num_classes
    }

    pub fn label_table_rows(&self) -> Option<i64> {
        self.label_embedding.as_ref().map(|e| e.ws.size()[0])
    }

    /// Unconditional calls on a class-conditional model use the null class.
    pub fn forward(&self, timesteps: &Tensor, labels: Option<&Tensor>) -> Tensor {
        let emb = timesteps.apply(&self.time_proj).apply(&self.linear_1).silu().apply(&self.linear_2);
        match (&self.label_embedding, self.num_classes) {
            (Some(label_embedding), Some(num_classes)) => {
                let labels = match labels {
                    Some(labels) => labels.shallow_clone(),
                    None => Tensor::full([timesteps.size()[0]], num_classes, (Kind::Int64, timesteps.device())),
                };
                emb + labels.apply(label_embedding)
            }
            _ => emb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sinusoidal_features_have_the_requested_width() {
        let emb = SinusoidalEmbedding::new(7, Device::Cpu);
        let out = emb.forward(&Tensor::from_slice(&[0f32, 500., 999.]));
        assert_eq!(out.size(), vec![3, 7]);
        // cos(0) = 1, sin(0) = 0 at t = 0.
        assert_eq!(out.double_value(&[0, 0]), 1.);
        assert_eq!(out.double_value(&[0, 3]), 0.);
    }

    #[test]
    fn missing_labels_use_the_null_class() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let emb = ConditionEmbedding::new(vs.root(), 8, 16, Some(4));
        let t = Tensor::from_slice(&[3f32, 3.]);
        let null = Tensor::from_slice(&[4i64, 4]);
        let a = emb.forward(&t, None);
        let b = emb.forward(&t, Some(&null));
        assert!(a.equal(&b));
        assert_eq!(a.size(), vec![2, 16]);
        assert_eq!(emb.label_table_rows(), Some(5));
        let unconditional = ConditionEmbedding::new(vs.root() / "uncond", 8, 16, None);
        assert_eq!(unconditional.label_table_rows(), None);
    }
}
