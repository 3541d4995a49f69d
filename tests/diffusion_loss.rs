// End-to-end checks of the diffusion process against hand-computed values.
use guided_diffusion::diffusion::resample::{StepSampler, StepSamplerKind};
use guided_diffusion::diffusion::{DiffusionConfig, GaussianDiffusion, LossType, MeanType, VarType, WeightType};
use guided_diffusion::models::Denoiser;
use guided_diffusion::schedulers::NoiseSchedule;
use tch::{Device, Kind, Tensor};

struct ZeroDenoiser;

impl Denoiser for ZeroDenoiser {
    fn forward_t(&self, xs: &Tensor, _timesteps: &Tensor, _labels: Option<&Tensor>, _train: bool) -> Tensor {
        xs.zeros_like()
    }

    fn in_channels(&self) -> i64 {
        3
    }

    fn num_classes(&self) -> Option<i64> {
        None
    }
}

fn small_process(loss_type: LossType) -> GaussianDiffusion {
    let schedule = NoiseSchedule::linear_range(1e-4, 0.02, 4).unwrap();
    let config = DiffusionConfig {
        mean_type: MeanType::Epsilon,
        var_type: VarType::FixedLarge,
        loss_type,
        weight_type: WeightType::Constant,
    };
    GaussianDiffusion::new(&schedule, config).unwrap()
}

#[test]
fn cumulative_alphas_of_a_short_linear_schedule() {
    let diffusion = small_process(LossType::Mse);
    let betas = [1e-4, 1e-4 + 0.0199 / 3., 1e-4 + 2. * 0.0199 / 3., 0.02];
    let mut expected = 1.;
    for (i, beta) in betas.iter().enumerate() {
        expected *= 1. - beta;
        assert!((diffusion.betas()[i] - beta).abs() < 1e-12);
        assert!((diffusion.alphas_cumprod()[i] - expected).abs() < 1e-12);
    }
}

#[test]
fn zero_denoiser_loss_is_the_noise_energy() {
    tch::manual_seed(0);
    let diffusion = small_process(LossType::Mse);
    let x0 = Tensor::rand([4, 3, 8, 8], (Kind::Float, Device::Cpu)) * 2. - 1.;
    let t = Tensor::from_slice(&[0i64, 1, 2, 3]);
    let noise = Tensor::randn([4, 3, 8, 8], (Kind::Float, Device::Cpu));
    let losses = diffusion.training_losses_with_noise(&ZeroDenoiser, &x0, &t, None, &noise).unwrap();
    let expected = noise.square().mean_dim(Some([1i64, 2, 3].as_slice()), false, Kind::Float);
    let err = (&losses.loss - &expected).abs().max().double_value(&[]);
    assert!(err < 1e-6, "{err}");
    assert!(losses.vb.is_none());
    // Mapping the prediction to the noise space changes nothing for an epsilon model.
    let mapped = small_process(LossType::MappedMse)
        .training_losses_with_noise(&ZeroDenoiser, &x0, &t, None, &noise)
        .unwrap();
    assert!(mapped.loss.allclose(&expected, 1e-5, 1e-6, false));
}

#[test]
fn importance_weights_are_uniform_before_warm_up() {
    let sampler = StepSampler::new(StepSamplerKind::LossSecondMoment, 4);
    let (t, weights) = sampler.sample(16, Device::Cpu);
    assert_eq!(t.size(), [16]);
    assert!(weights.allclose(&Tensor::ones([16], (Kind::Float, Device::Cpu)), 1e-6, 1e-6, false));
}
