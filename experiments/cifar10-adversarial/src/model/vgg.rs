use anyhow::{ensure, Result};
use burn::{
    module::Module,
    nn::Linear,
    tensor::{activation::relu, backend::Backend, Tensor},
};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::{
    init::linear_from_rng,
    layers::{global_average, max_pool_2x2, ConvNorm},
    ImageClassifier, Mode,
};

/// VGG with batch norm: stages of 3x3 conv + BN + ReLU, each stage closed by
/// 2x2 max pooling, then a single linear classifier over the pooled features.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VggConfig {
    pub in_channels: usize,
    /// Output channels of every convolution, grouped by pooling stage.
    pub stages: Vec<Vec<usize>>,
    pub num_classes: usize,
}

impl VggConfig {
    /// VGG-16 layout for 3x32x32 inputs.
    pub fn vgg16(num_classes: usize) -> Self {
        Self {
            in_channels: 3,
            stages: vec![
                vec![64, 64],
                vec![128, 128],
                vec![256, 256, 256],
                vec![512, 512, 512],
                vec![512, 512, 512],
            ],
            num_classes,
        }
    }

    pub fn tiny(in_channels: usize, num_classes: usize) -> Self {
        Self {
            in_channels,
            stages: vec![vec![4], vec![8]],
            num_classes,
        }
    }

    /// Smallest square input that survives every pooling stage.
    pub fn min_image_size(&self) -> usize {
        1 << self.stages.len()
    }

    pub fn validate(&self, height: usize, width: usize) -> Result<()> {
        ensure!(!self.stages.is_empty(), "VGG needs at least one stage");
        ensure!(
            self.stages.iter().all(|stage| !stage.is_empty()),
            "VGG stages must contain at least one convolution"
        );
        ensure!(
            height.min(width) >= self.min_image_size(),
            "{}x{} images are too small for {} pooling stages",
            height,
            width,
            self.stages.len()
        );
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device, rng: &mut StdRng) -> Vgg<B> {
        let mut channels = self.in_channels;
        let mut stages = Vec::with_capacity(self.stages.len());

        for widths in &self.stages {
            let mut layers = Vec::with_capacity(widths.len());
            for &width in widths {
                layers.push(ConvNorm::init(rng, device, [channels, width], 3, 1));
                channels = width;
            }
            stages.push(VggStage { layers });
        }

        let classifier = linear_from_rng(rng, device, channels, self.num_classes);
        Vgg { stages, classifier }
    }
}

#[derive(Module, Debug)]
pub struct VggStage<B: Backend> {
    layers: Vec<ConvNorm<B>>,
}

impl<B: Backend> VggStage<B> {
    fn forward(&self, x: Tensor<B, 4>, mode: Mode) -> Tensor<B, 4> {
        let x = self
            .layers
            .iter()
            .fold(x, |x, layer| relu(layer.forward(x, mode)));
        max_pool_2x2(x)
    }
}

#[derive(Module, Debug)]
pub struct Vgg<B: Backend> {
    stages: Vec<VggStage<B>>,
    classifier: Linear<B>,
}

impl<B: Backend> ImageClassifier<B> for Vgg<B> {
    fn forward(&self, images: Tensor<B, 4>, mode: Mode) -> Tensor<B, 2> {
        let features = self
            .stages
            .iter()
            .fold(images, |x, stage| stage.forward(x, mode));
        // 1x1 after the last pool at 32x32, where this equals flattening.
        self.classifier.forward(global_average(features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use advtrain_core::seeded_rng;
    use burn::{
        nn::loss::CrossEntropyLossConfig,
        tensor::{Int, TensorData},
    };
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;
    use rand::Rng;

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn vgg16_layout() {
        let config = VggConfig::vgg16(10);
        assert_eq!(config.stages.iter().map(Vec::len).sum::<usize>(), 13);
        assert_eq!(config.min_image_size(), 32);
        assert!(config.validate(32, 32).is_ok());
        assert!(config.validate(16, 16).is_err());
    }

    #[test]
    fn tiny_forward_shape() {
        let device = Default::default();
        let config = VggConfig::tiny(3, 2);
        let model: Vgg<TestBackend> = config.init(&device, &mut seeded_rng(11));

        let images = Tensor::<TestBackend, 4>::ones([5, 3, 8, 8], &device) * 0.5;
        let logits = model.forward(images.clone(), Mode::Training);
        assert_eq!(logits.dims(), [5, 2]);

        let logits = model.forward(images, Mode::Evaluation);
        assert_eq!(logits.dims(), [5, 2]);
    }

    #[test]
    fn same_seed_same_model() {
        let device = Default::default();
        let config = VggConfig::tiny(3, 2);
        let a: Vgg<TestBackend> = config.init(&device, &mut seeded_rng(4));
        let b: Vgg<TestBackend> = config.init(&device, &mut seeded_rng(4));

        let images = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);
        let a = a.forward(images.clone(), Mode::Evaluation).into_data().to_vec::<f32>().unwrap();
        let b = b.forward(images, Mode::Evaluation).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn gradients_reach_the_input_through_every_pool() {
        let device = Default::default();
        let model: Vgg<TestBackend> = VggConfig::tiny(3, 2).init(&device, &mut seeded_rng(6));

        let mut rng = seeded_rng(9);
        let values: Vec<f32> = (0..2 * 3 * 8 * 8).map(|_| rng.gen()).collect();
        let images =
            Tensor::<TestBackend, 4>::from_floats(TensorData::new(values, [2, 3, 8, 8]), &device)
                .require_grad();
        let labels = Tensor::<TestBackend, 1, Int>::from_ints([0, 1], &device);

        let logits = model.forward(images.clone(), Mode::Training);
        let loss = CrossEntropyLossConfig::new().init(&device).forward(logits, labels);
        let grads = loss.backward();

        let grad = images.grad(&grads).unwrap();
        assert_eq!(grad.dims(), [2, 3, 8, 8]);
        let magnitude = grad.abs().sum().into_scalar();
        assert!(magnitude.is_finite() && magnitude > 0.0);
    }
}
