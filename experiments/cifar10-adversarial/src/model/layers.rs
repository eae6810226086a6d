use burn::{
    module::Module,
    nn::{conv::Conv2d, BatchNorm, BatchNormConfig},
    tensor::{backend::Backend, Tensor},
};
use rand::rngs::StdRng;

use super::{init::conv2d_from_rng, Mode};

/// Convolution followed by batch norm. Activation is left to the caller.
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> ConvNorm<B> {
    pub fn init(
        rng: &mut StdRng,
        device: &B::Device,
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
    ) -> Self {
        let conv = conv2d_from_rng(rng, device, channels, kernel, stride, kernel / 2);
        let norm = BatchNormConfig::new(channels[1]).init(device);
        Self { conv, norm }
    }

    pub fn forward(&self, x: Tensor<B, 4>, mode: Mode) -> Tensor<B, 4> {
        normalize(&self.norm, self.conv.forward(x), mode)
    }
}

/// Batch norm with an explicit mode.
///
/// burn picks batch statistics whenever the backend tracks gradients, which
/// would make an evaluation-mode forward impossible on the autodiff backend.
/// Evaluation here always normalizes with the running estimates and never
/// touches them.
pub fn normalize<B: Backend>(norm: &BatchNorm<B, 2>, x: Tensor<B, 4>, mode: Mode) -> Tensor<B, 4> {
    match mode {
        Mode::Training => norm.forward(x),
        Mode::Evaluation => {
            let shape = [1, x.dims()[1], 1, 1];
            let mean = norm.running_mean.value_sync().reshape(shape);
            let std = norm
                .running_var
                .value_sync()
                .add_scalar(norm.epsilon)
                .sqrt()
                .reshape(shape);
            let gamma = norm.gamma.val().reshape(shape);
            let beta = norm.beta.val().reshape(shape);

            (x - mean) / std * gamma + beta
        }
    }
}

/// 2x2 max pooling with stride 2. Odd trailing rows/columns are dropped.
///
/// The four window positions are sliced out of a 6-D view and combined with
/// `max_pair`, whose backward is a mask. burn-candle has no pooling backward
/// and the gather behind `max_dim` fails on the 6-D view.
pub fn max_pool_2x2<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch, channels, height, width] = x.dims();
    let (rows, cols) = (height / 2, width / 2);
    let x = if height % 2 == 1 || width % 2 == 1 {
        x.slice([0..batch, 0..channels, 0..rows * 2, 0..cols * 2])
    } else {
        x
    };

    let windows = x.reshape([batch, channels, rows, 2, cols, 2]);
    let corner = |i: usize, j: usize| {
        windows
            .clone()
            .slice([0..batch, 0..channels, 0..rows, i..i + 1, 0..cols, j..j + 1])
    };

    corner(0, 0)
        .max_pair(corner(0, 1))
        .max_pair(corner(1, 0).max_pair(corner(1, 1)))
        .reshape([batch, channels, rows, cols])
}

/// Mean over the spatial grid: `[batch, channels, h, w]` -> `[batch, channels]`.
pub fn global_average<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch, channels, _, _] = x.dims();
    x.mean_dim(3).mean_dim(2).reshape([batch, channels])
}

#[cfg(test)]
mod tests {
    use super::*;
    use advtrain_core::seeded_rng;
    use burn::tensor::TensorData;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn max_pool_picks_block_maxima() {
        let device = Default::default();
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let x = Tensor::<TestBackend, 4>::from_floats(TensorData::new(values, [1, 1, 4, 4]), &device);

        let pooled = max_pool_2x2(x).into_data().to_vec::<f32>().unwrap();
        assert_eq!(pooled, vec![5.0, 7.0, 13.0, 15.0]);
    }

    #[test]
    fn max_pool_drops_odd_edge() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([2, 3, 5, 5], &device);
        assert_eq!(max_pool_2x2(x).dims(), [2, 3, 2, 2]);
    }

    #[test]
    fn global_average_means_each_channel() {
        let device = Default::default();
        let values = vec![1.0, 3.0, 5.0, 7.0, 0.0, 0.0, 2.0, 2.0];
        let x = Tensor::<TestBackend, 4>::from_floats(TensorData::new(values, [1, 2, 2, 2]), &device);

        let averaged = global_average(x).into_data().to_vec::<f32>().unwrap();
        assert_eq!(averaged, vec![4.0, 1.0]);
    }

    #[test]
    fn fresh_norm_in_evaluation_is_identity() {
        let device = Default::default();
        let block = ConvNorm::<TestBackend>::init(&mut seeded_rng(1), &device, [2, 2], 3, 1);
        let x = Tensor::<TestBackend, 4>::ones([1, 2, 3, 3], &device) * 0.5;

        // Running mean 0, variance 1, gamma 1, beta 0.
        let normalized = normalize(&block.norm, x.clone(), Mode::Evaluation);
        let diff = (normalized - x).abs().max().into_scalar();
        assert!(diff < 1e-4);
    }

    #[test]
    fn evaluation_does_not_update_running_stats() {
        let device = Default::default();
        let block = ConvNorm::<TestBackend>::init(&mut seeded_rng(1), &device, [2, 2], 3, 1);
        let x = Tensor::<TestBackend, 4>::ones([2, 2, 4, 4], &device) * 3.0;

        let _ = block.forward(x.clone(), Mode::Evaluation);
        let mean = running_mean(&block);
        assert_eq!(mean, vec![0.0, 0.0]);

        let _ = block.forward(x, Mode::Training);
        let mean = running_mean(&block);
        assert!(mean.iter().any(|m| *m != 0.0));
    }

    fn running_mean(block: &ConvNorm<TestBackend>) -> Vec<f32> {
        block.norm.running_mean.value_sync().into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn evaluation_uses_the_latest_running_stats() {
        let device = Default::default();
        let block = ConvNorm::<TestBackend>::init(&mut seeded_rng(3), &device, [2, 2], 3, 1);
        let x = Tensor::<TestBackend, 4>::ones([2, 2, 4, 4], &device) * 3.0;

        let fresh = block.forward(x.clone(), Mode::Evaluation);
        let _ = block.forward(x.clone(), Mode::Training);
        let updated = block.forward(x, Mode::Evaluation);
        let diff = (updated - fresh).abs().max().into_scalar();
        assert!(diff > 1e-4);
    }

    #[test]
    fn max_pool_gradient_flows_to_block_maxima() {
        let device = Default::default();
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let x =
            Tensor::<TestBackend, 4>::from_floats(TensorData::new(values, [1, 1, 4, 4]), &device)
                .require_grad();

        let grads = max_pool_2x2(x.clone()).sum().backward();
        let grad = x.grad(&grads).unwrap().into_data().to_vec::<f32>().unwrap();
        let expected: Vec<f32> = (0..16)
            .map(|v| if [5, 7, 13, 15].contains(&v) { 1.0 } else { 0.0 })
            .collect();
        assert_eq!(grad, expected);
    }
}
