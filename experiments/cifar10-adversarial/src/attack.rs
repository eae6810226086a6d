//! Projected gradient descent on the input images.

use anyhow::{anyhow, ensure, Result};
use burn::{
    nn::loss::CrossEntropyLoss,
    tensor::{backend::AutodiffBackend, ElementConversion, Int, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::model::{FrozenClassifier, ImageClassifier};

/// L-infinity PGD parameters. Pixel values live in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PgdConfig {
    /// Radius of the perturbation ball.
    pub epsilon: f32,
    /// Size of each signed-gradient step.
    pub step_size: f32,
    pub iterations: usize,
}

impl Default for PgdConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.013,
            step_size: 0.01,
            iterations: 7,
        }
    }
}

impl PgdConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.epsilon.is_finite() && self.epsilon >= 0.0,
            "attack epsilon must be a non-negative number, got {}",
            self.epsilon
        );
        ensure!(
            self.step_size.is_finite() && self.step_size >= 0.0,
            "attack step size must be a non-negative number, got {}",
            self.step_size
        );
        Ok(())
    }

    pub fn is_identity(&self) -> bool {
        self.epsilon == 0.0 || self.iterations == 0
    }
}

/// Perturbs `images` to increase the cross-entropy of `model` on `labels`.
///
/// Every iteration moves the working image by `step_size * sign(grad)` and
/// projects it back into the intersection of the epsilon ball around the
/// input and the valid pixel range. The returned tensor carries no graph.
pub fn pgd_attack<B, M>(
    model: &FrozenClassifier<B, M>,
    loss_fn: &CrossEntropyLoss<B>,
    images: Tensor<B, 4>,
    labels: Tensor<B, 1, Int>,
    config: &PgdConfig,
) -> Result<Tensor<B, 4>>
where
    B: AutodiffBackend,
    M: ImageClassifier<B>,
{
    config.validate()?;
    // Work on the inner backend; each iteration lifts a fresh leaf to differentiate.
    let clean = images.inner();
    if config.is_identity() {
        return Ok(Tensor::from_inner(clean));
    }

    let lower = clean.clone().sub_scalar(config.epsilon).clamp_min(0.0);
    let upper = clean.clone().add_scalar(config.epsilon).clamp_max(1.0);

    let mut adversarial = clean;
    for iteration in 0..config.iterations {
        let input = Tensor::<B, 4>::from_inner(adversarial.clone()).require_grad();
        let loss = loss_fn.forward(model.logits(input.clone()), labels.clone());

        let value = loss.clone().into_scalar().elem::<f32>();
        ensure!(
            value.is_finite(),
            "attack loss became non-finite at iteration {}",
            iteration
        );

        let grads = loss.backward();
        let grad = input
            .grad(&grads)
            .ok_or_else(|| anyhow!("attack produced no input gradient"))?;
        let magnitude = grad.clone().abs().sum().into_scalar().elem::<f32>();
        ensure!(
            magnitude.is_finite(),
            "attack gradient became non-finite at iteration {}",
            iteration
        );

        adversarial = (adversarial + grad.sign().mul_scalar(config.step_size))
            .max_pair(lower.clone())
            .min_pair(upper.clone());
    }

    tracing::trace!(iterations = config.iterations, "pgd attack finished");
    Ok(Tensor::from_inner(adversarial))
}
