use tch::{nn, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct ResnetBlockConfig {
    pub out_channels: Option<i64>,
    pub temb_channels: i64,
    pub groups: i64,
    pub eps: f64,
    pub dropout: f64,
    // non_linearity: silu
}

impl Default for ResnetBlockConfig {
    fn default() -> Self {
        Self { out_channels: None, temb_channels: 512, groups: 32, eps: 1e-6, dropout: 0. }
    }
}

/// A residual block conditioned on the timestep and label embedding, dropout is applied
/// between the two convolutions when training.
#[derive(Debug)]
pub struct ResnetBlock {
    norm1: nn::GroupNorm,
    conv1: nn::Conv2D,
    norm2: nn::GroupNorm,
    conv2: nn::Conv2D,
    emb_proj: nn::Linear,
    conv_shortcut: Option<nn::Conv2D>,
    config: ResnetBlockConfig,
}

impl ResnetBlock {
    pub fn new(vs: nn::Path, in_channels: i64, config: ResnetBlockConfig) -> Self {
        let out_channels = config.out_channels.unwrap_or(in_channels);
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let group_cfg = nn::GroupNormConfig { eps: config.eps, affine: true, ..Default::default() };
        let norm1 = nn::group_norm(&vs / "norm1", config.groups, in_channels, group_cfg);
        let conv1 = nn::conv2d(&vs / "conv1", in_channels, out_channels, 3, conv_cfg);
        let norm2 = nn::group_norm(&vs / "norm2", config.groups, out_channels, group_cfg);
        // The second convolution starts at zero so that each block is the identity at
        // initialisation.
        let zero_cfg = nn::ConvConfig { ws_init: nn::Init::Const(0.), ..conv_cfg };
        let conv2 = nn::conv2d(&vs / "conv2", out_channels, out_channels, 3, zero_cfg);
        let conv_shortcut = if in_channels != out_channels {
            let conv_cfg = nn::ConvConfig { stride: 1, padding: 0, ..Default::default() };
            Some(nn::conv2d(&vs / "conv_shortcut", in_channels, out_channels, 1, conv_cfg))
        } else {
            None
        };
        let emb_proj =
            nn::linear(&vs / "emb_proj", config.temb_channels, out_channels, Default::default());
        Self { norm1, conv1, norm2, conv2, emb_proj, conv_shortcut, config }
    }

    pub fn forward_t(&self, xs: &Tensor, emb: &Tensor, train: bool) -> Tensor {
        let shortcut_xs = match &self.conv_shortcut {
            Some(conv_shortcut) => xs.apply(conv_shortcut),
            None => xs.shallow_clone(),
        };
        let xs = xs.apply(&self.norm1).silu().apply(&self.conv1);
        let xs = emb.silu().apply(&self.emb_proj).unsqueeze(-1).unsqueeze(-1) + xs;
        let xs = xs
            .apply(&self.norm2)
            .silu()
            .dropout(self.config.dropout, train)
            .apply(&self.conv2);
        shortcut_xs + xs
    }
}
