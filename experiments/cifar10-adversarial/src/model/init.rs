//! Parameter initialization from an explicit seeded RNG.
//!
//! Candle cannot seed its own generator, so weights are drawn on the host and
//! uploaded. All draws are uniform in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.

use burn::{
    module::Param,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Initializer, Linear, PaddingConfig2d,
    },
    tensor::{backend::Backend, Tensor, TensorData},
};
use rand::{rngs::StdRng, Rng};

pub fn linear_from_rng<B: Backend>(
    rng: &mut StdRng,
    device: &B::Device,
    fan_in: usize,
    fan_out: usize,
) -> Linear<B> {
    let limit = fan_in_limit(fan_in);
    let weight = random_tensor::<B, 2>(rng, [fan_in, fan_out], limit, device);
    let bias = random_tensor::<B, 1>(rng, [fan_out], limit, device);

    Linear {
        weight: Param::from_tensor(weight),
        bias: Some(Param::from_tensor(bias)),
    }
}

/// Square-kernel convolution without bias (every conv here feeds a batch norm).
pub fn conv2d_from_rng<B: Backend>(
    rng: &mut StdRng,
    device: &B::Device,
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Conv2d<B> {
    let [channels_in, channels_out] = channels;
    let mut conv = Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .with_initializer(Initializer::Zeros)
        .init(device);

    let limit = fan_in_limit(channels_in * kernel * kernel);
    conv.weight = Param::from_tensor(random_tensor::<B, 4>(
        rng,
        [channels_out, channels_in, kernel, kernel],
        limit,
        device,
    ));
    conv
}

fn fan_in_limit(fan_in: usize) -> f32 {
    (1.0f32 / fan_in as f32).sqrt()
}

fn random_tensor<B: Backend, const D: usize>(
    rng: &mut StdRng,
    shape: [usize; D],
    limit: f32,
    device: &B::Device,
) -> Tensor<B, D> {
    let total: usize = shape.iter().product();
    let values: Vec<f32> = (0..total)
        .map(|_| rng.gen::<f32>() * 2.0 * limit - limit)
        .collect();

    Tensor::<B, D>::from_floats(TensorData::new(values, shape), device)
}
