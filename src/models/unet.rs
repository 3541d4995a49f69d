//! Class-conditional UNet
//!
//! A compact residual UNet taking a noisy sample, the rescaled timesteps and optional class
//! labels. It predicts the quantity selected by the mean type and, when the variance is
//! learned, the variance values on as many extra channels.
use crate::models::embeddings::ConditionEmbedding;
use crate::models::resnet::{ResnetBlock, ResnetBlockConfig};
use crate::models::Denoiser;
use tch::{nn, Tensor};

#[derive(Debug, Clone)]
pub struct UNetConfig {
    pub model_channels: i64,
    /// Channel multiplier of each resolution, the spatial size is halved between two
    /// consecutive levels.
    pub channel_mult: Vec<i64>,
    pub num_res_blocks: usize,
    pub dropout: f64,
    pub norm_num_groups: i64,
    pub norm_eps: f64,
    /// Number of real classes, `None` for an unconditional model.
    pub num_classes: Option<i64>,
    /// Double the output channels to also predict the variance.
    pub learn_sigma: bool,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            model_channels: 128,
            channel_mult: vec![1, 2, 2, 2],
            num_res_blocks: 2,
            dropout: 0.1,
            norm_num_groups: 32,
            norm_eps: 1e-6,
            num_classes: None,
            learn_sigma: false,
        }
    }
}

#[derive(Debug)]
enum DownLayer {
    Res(ResnetBlock),
    Downsample(nn::Conv2D),
}

#[derive(Debug)]
struct UpLevel {
    resnets: Vec<ResnetBlock>,
    upsample: Option<nn::Conv2D>,
}

#[derive(Debug)]
pub struct UNetModel {
    conv_in: nn::Conv2D,
    embedding: ConditionEmbedding,
    down_layers: Vec<DownLayer>,
    mid_blocks: Vec<ResnetBlock>,
    up_levels: Vec<UpLevel>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2D,
    in_channels: i64,
    pub config: UNetConfig,
}

impl UNetModel {
    pub fn new(vs: nn::Path, in_channels: i64, config: UNetConfig) -> Self {
        let ch = config.model_channels;
        let time_embed_dim = ch * 4;
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let conv_in = nn::conv2d(&vs / "conv_in", in_channels, ch, 3, conv_cfg);
        let embedding =
            ConditionEmbedding::new(&vs / "embedding", ch, time_embed_dim, config.num_classes);
        let res_cfg = |out_channels| ResnetBlockConfig {
            out_channels: Some(out_channels),
            temb_channels: time_embed_dim,
            groups: config.norm_num_groups,
            eps: config.norm_eps,
            dropout: config.dropout,
        };

        let n_levels = config.channel_mult.len();
        let vs_down = &vs / "down_blocks";
        let mut down_layers = vec![];
        let mut skip_channels = vec![ch];
        let mut cur = ch;
        for (level, mult) in config.channel_mult.iter().enumerate() {
            let out_channels = ch * mult;
            for i in 0..config.num_res_blocks {
                let block = ResnetBlock::new(&vs_down / level / i, cur, res_cfg(out_channels));
                down_layers.push(DownLayer::Res(block));
                cur = out_channels;
                skip_channels.push(cur);
            }
            if level + 1 < n_levels {
                let down_cfg = nn::ConvConfig { stride: 2, padding: 1, ..Default::default() };
                let conv = nn::conv2d(&vs_down / level / "downsample", cur, cur, 3, down_cfg);
                down_layers.push(DownLayer::Downsample(conv));
                skip_channels.push(cur);
            }
        }

        let vs_mid = &vs / "mid_block";
        let mid_blocks =
            (0..2).map(|i| ResnetBlock::new(&vs_mid / i, cur, res_cfg(cur))).collect();

        let vs_up = &vs / "up_blocks";
        let mut up_levels = vec![];
        for (level, mult) in config.channel_mult.iter().enumerate().rev() {
            let out_channels = ch * mult;
            let mut resnets = vec![];
            for i in 0..=config.num_res_blocks {
                let skip = skip_channels.pop().unwrap_or(ch);
                let block =
                    ResnetBlock::new(&vs_up / level / i, cur + skip, res_cfg(out_channels));
                resnets.push(block);
                cur = out_channels;
            }
            let upsample = (level > 0)
                .then(|| nn::conv2d(&vs_up / level / "upsample", cur, cur, 3, conv_cfg));
            up_levels.push(UpLevel { resnets, upsample });
        }

        let group_cfg = nn::GroupNormConfig { eps: config.norm_eps, ..Default::default() };
        let conv_norm_out =
            nn::group_norm(&vs / "conv_norm_out", config.norm_num_groups, cur, group_cfg);
        let out_channels = if config.learn_sigma { 2 * in_channels } else { in_channels };
        let out_cfg = nn::ConvConfig { ws_init: nn::Init::Const(0.), ..conv_cfg };
        let conv_out = nn::conv2d(&vs / "conv_out", cur, out_channels, 3, out_cfg);
        Self {
            conv_in,
            embedding,
            down_layers,
            mid_blocks,
            up_levels,
            conv_norm_out,
            conv_out,
            in_channels,
            config,
        }
    }
}

impl Denoiser for UNetModel {
    fn forward_t(&self, xs: &Tensor, timesteps: &Tensor, labels: Option<&Tensor>, train: bool) -> Tensor {
        let emb = self.embedding.forward(timesteps, labels);
        let mut xs = xs.apply(&self.conv_in);
        let mut skips = vec![xs.shallow_clone()];
        for layer in self.down_layers.iter() {
            xs = match layer {
                DownLayer::Res(block) => block.forward_t(&xs, &emb, train),
                DownLayer::Downsample(conv) => xs.apply(conv),
            };
            skips.push(xs.shallow_clone());
        }
        for block in self.mid_blocks.iter() {
            xs = block.forward_t(&xs, &emb, train);
        }
        for level in self.up_levels.iter() {
            for block in level.resnets.iter() {
                let skip = match skips.pop() {
                    Some(skip) => skip,
                    None => break,
                };
                xs = block.forward_t(&Tensor::cat(&[&xs, &skip], 1), &emb, train);
            }
            if let Some(upsample) = &level.upsample {
                let (_, _, h, w) = xs.size4().unwrap_or((0, 0, 0, 0));
                xs = xs.upsample_nearest2d([2 * h, 2 * w], None, None).apply(upsample);
            }
        }
        xs.apply(&self.conv_norm_out).silu().apply(&self.conv_out)
    }

    fn in_channels(&self) -> i64 {
        self.in_channels
    }

    fn num_classes(&self) -> Option<i64> {
        self.embedding.num_classes()
    }

    fn label_table_rows(&self) -> Option<i64> {
        self.embedding.label_table_rows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn small_config() -> UNetConfig {
        UNetConfig {
            model_channels: 16,
            channel_mult: vec![1, 2],
            num_res_blocks: 1,
            norm_num_groups: 8,
            ..Default::default()
        }
    }

    #[test]
    fn output_matches_the_input_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = UNetModel::new(vs.root(), 3, small_config());
        let xs = Tensor::randn([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[10f32, 900.]);
        let out = model.forward_t(&xs, &t, None, true);
        assert_eq!(out.size(), vec![2, 3, 8, 8]);
        assert_eq!(model.num_classes(), None);
    }

    #[test]
    fn learned_variance_doubles_the_channels() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = UNetConfig { learn_sigma: true, num_classes: Some(10), ..small_config() };
        let model = UNetModel::new(vs.root(), 4, config);
        let xs = Tensor::randn([2, 4, 8, 8], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[10f32, 900.]);
        let labels = Tensor::from_slice(&[3i64, 10]);
        let out = model.forward_t(&xs, &t, Some(&labels), false);
        assert_eq!(out.size(), vec![2, 8, 8, 8]);
        assert_eq!(model.num_classes(), Some(10));
        assert_eq!(model.label_table_rows(), Some(11));
    }
}
