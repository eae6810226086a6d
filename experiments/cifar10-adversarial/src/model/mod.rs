//! Classifier architectures and the capabilities the training loop relies on.

mod init;
mod layers;
pub mod resnet;
pub mod vgg;

use std::marker::PhantomData;

use advtrain_core::MultiStepSchedule;
use anyhow::{anyhow, Result};
use burn::{
    module::Module,
    optim::{decay::WeightDecayConfig, momentum::MomentumConfig, SgdConfig},
    tensor::{backend::Backend, Tensor},
};

pub use resnet::ResNetConfig;
pub use vgg::{Vgg, VggConfig};

/// Whether batch norm uses batch statistics (and updates its running
/// estimates) or the running estimates alone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Training,
    Evaluation,
}

/// A module mapping `[batch, channels, height, width]` images in `[0, 1]` to
/// `[batch, classes]` logits.
pub trait ImageClassifier<B: Backend>: Module<B> {
    fn forward(&self, images: Tensor<B, 4>, mode: Mode) -> Tensor<B, 2>;
}

/// Read-only evaluation-mode view of a classifier.
///
/// The snapshot shares tensor storage with the model it was taken from, but
/// none of its parameters require gradients, so backpropagating through it
/// only ever produces gradients for its inputs.
#[derive(Debug)]
pub struct FrozenClassifier<B: Backend, M> {
    model: M,
    _backend: PhantomData<B>,
}

impl<B: Backend, M: ImageClassifier<B>> FrozenClassifier<B, M> {
    pub fn snapshot(model: &M) -> Self {
        Self {
            model: model.clone().no_grad(),
            _backend: PhantomData,
        }
    }

    pub fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.model.forward(images, Mode::Evaluation)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModelKind {
    Vgg16,
    ResNet18,
}

impl ModelKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "vgg16" => Ok(Self::Vgg16),
            "resnet18" => Ok(Self::ResNet18),
            other => Err(anyhow!("unsupported model {}", other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Vgg16 => "vgg16",
            Self::ResNet18 => "resnet18",
        }
    }

    pub fn hyperparameters(&self) -> Hyperparameters {
        match self {
            Self::Vgg16 => VGG16_HYPERPARAMETERS,
            Self::ResNet18 => RESNET18_HYPERPARAMETERS,
        }
    }
}

/// Per-architecture optimization defaults.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hyperparameters {
    pub epochs: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f32,
    pub milestones: &'static [usize],
    pub gamma: f64,
}

const VGG16_HYPERPARAMETERS: Hyperparameters = Hyperparameters {
    epochs: 200,
    learning_rate: 0.05,
    momentum: 0.9,
    weight_decay: 5e-4,
    milestones: &[60, 120, 160],
    gamma: 0.1,
};

const RESNET18_HYPERPARAMETERS: Hyperparameters = Hyperparameters {
    epochs: 350,
    learning_rate: 0.1,
    momentum: 0.9,
    weight_decay: 5e-4,
    milestones: &[150, 250],
    gamma: 0.1,
};

impl Hyperparameters {
    pub fn schedule(&self) -> MultiStepSchedule {
        MultiStepSchedule::new(self.learning_rate, self.milestones, self.gamma)
    }

    /// SGD with heavy-ball momentum (no dampening) and L2 weight decay.
    pub fn optimizer(&self) -> SgdConfig {
        SgdConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay)))
            .with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(self.momentum)
                    .with_dampening(0.0),
            ))
    }
}
