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
    layers::{global_average, ConvNorm},
    ImageClassifier, Mode,
};

/// CIFAR-style residual network: a 3x3 stem (no pooling), stages of basic
/// blocks where every stage after the first halves the resolution, then
/// global average pooling and a linear classifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResNetConfig {
    pub in_channels: usize,
    pub stem_width: usize,
    pub stage_widths: Vec<usize>,
    pub blocks_per_stage: usize,
    pub num_classes: usize,
}

impl ResNetConfig {
    pub fn resnet18(num_classes: usize) -> Self {
        Self {
            in_channels: 3,
            stem_width: 64,
            stage_widths: vec![64, 128, 256, 512],
            blocks_per_stage: 2,
            num_classes,
        }
    }

    pub fn tiny(in_channels: usize, num_classes: usize) -> Self {
        Self {
            in_channels,
            stem_width: 4,
            stage_widths: vec![4, 8],
            blocks_per_stage: 1,
            num_classes,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.stage_widths.is_empty(), "ResNet needs at least one stage");
        ensure!(self.blocks_per_stage > 0, "ResNet stages need at least one block");
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device, rng: &mut StdRng) -> ResNet<B> {
        let stem = ConvNorm::init(rng, device, [self.in_channels, self.stem_width], 3, 1);

        let mut channels = self.stem_width;
        let mut blocks = Vec::with_capacity(self.stage_widths.len() * self.blocks_per_stage);
        for (stage, &width) in self.stage_widths.iter().enumerate() {
            for block in 0..self.blocks_per_stage {
                let stride = if stage > 0 && block == 0 { 2 } else { 1 };
                blocks.push(BasicBlock::init(rng, device, [channels, width], stride));
                channels = width;
            }
        }

        let classifier = linear_from_rng(rng, device, channels, self.num_classes);
        ResNet {
            stem,
            blocks,
            classifier,
        }
    }
}

#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    first: ConvNorm<B>,
    second: ConvNorm<B>,
    /// 1x1 projection when the block changes resolution or width.
    shortcut: Option<ConvNorm<B>>,
}

impl<B: Backend> BasicBlock<B> {
    fn init(rng: &mut StdRng, device: &B::Device, channels: [usize; 2], stride: usize) -> Self {
        let [channels_in, channels_out] = channels;
        let first = ConvNorm::init(rng, device, channels, 3, stride);
        let second = ConvNorm::init(rng, device, [channels_out, channels_out], 3, 1);
        let shortcut = (stride != 1 || channels_in != channels_out)
            .then(|| ConvNorm::init(rng, device, channels, 1, stride));

        Self {
            first,
            second,
            shortcut,
        }
    }

    fn forward(&self, x: Tensor<B, 4>, mode: Mode) -> Tensor<B, 4> {
        let out = relu(self.first.forward(x.clone(), mode));
        let out = self.second.forward(out, mode);
        let identity = match &self.shortcut {
            Some(projection) => projection.forward(x, mode),
            None => x,
        };
        relu(out + identity)
    }
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    stem: ConvNorm<B>,
    blocks: Vec<BasicBlock<B>>,
    classifier: Linear<B>,
}

impl<B: Backend> ImageClassifier<B> for ResNet<B> {
    fn forward(&self, images: Tensor<B, 4>, mode: Mode) -> Tensor<B, 2> {
        let x = relu(self.stem.forward(images, mode));
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x, mode));
        self.classifier.forward(global_average(x))
    }
}
