use anyhow::{ensure, Result};
use burn::{
    module::AutodiffModule,
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use burn_dataset::Dataset;
use rand::rngs::StdRng;

use crate::{
    attack::{pgd_attack, PgdConfig},
    data::{BatchLoader, ImageItem},
    model::{FrozenClassifier, ImageClassifier, Mode},
};

/// Mean losses of one epoch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochLosses {
    pub train: f32,
    pub test: f32,
    /// Present only when adversarial training is enabled.
    pub adversarial: Option<f32>,
}

pub struct Trainer<B: AutodiffBackend> {
    device: B::Device,
    loss_fn: CrossEntropyLoss<B>,
    eval_loss_fn: CrossEntropyLoss<B::InnerBackend>,
    attack: Option<PgdConfig>,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(device: &B::Device, attack: Option<PgdConfig>) -> Result<Self> {
        if let Some(config) = &attack {
            config.validate()?;
        }

        Ok(Self {
            device: device.clone(),
            loss_fn: CrossEntropyLossConfig::new().init(device),
            eval_loss_fn: CrossEntropyLossConfig::new().init(device),
            attack,
        })
    }

    pub fn is_adversarial(&self) -> bool {
        self.attack.is_some()
    }

    /// Runs one epoch: the held-out loss pass, then one clean (and, when
    /// enabled, one adversarial) optimizer step per training batch.
    pub fn train_epoch<M, O, TrainSet, TestSet>(
        &self,
        mut model: M,
        optimizer: &mut O,
        learning_rate: f64,
        train: &BatchLoader<'_, TrainSet>,
        test: &BatchLoader<'_, TestSet>,
        rng: &mut StdRng,
    ) -> Result<(M, EpochLosses)>
    where
        M: ImageClassifier<B> + AutodiffModule<B>,
        M::InnerModule: ImageClassifier<B::InnerBackend>,
        O: Optimizer<M, B>,
        TrainSet: Dataset<ImageItem>,
        TestSet: Dataset<ImageItem>,
    {
        ensure!(!train.is_empty(), "training split is empty");
        ensure!(!test.is_empty(), "held-out split is empty");

        let test_loss = self.held_out_loss(&model.valid(), test)?;

        let mut clean = RunningMean::default();
        let mut adversarial = RunningMean::default();

        for batch in train.epoch::<B>(&self.device, rng) {
            let batch = batch?;

            let logits = model.forward(batch.images.clone(), Mode::Training);
            let loss = self.loss_fn.forward(logits, batch.labels.clone());
            clean.push(finite_loss(loss.clone(), "training")?);

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(learning_rate, model, grads);

            if let Some(attack) = &self.attack {
                let frozen = FrozenClassifier::snapshot(&model);
                let perturbed = pgd_attack(
                    &frozen,
                    &self.loss_fn,
                    batch.images,
                    batch.labels.clone(),
                    attack,
                )?;

                let logits = model.forward(perturbed, Mode::Training);
                let loss = self.loss_fn.forward(logits, batch.labels);
                adversarial.push(finite_loss(loss.clone(), "adversarial")?);

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optimizer.step(learning_rate, model, grads);
            }
        }

        let losses = EpochLosses {
            train: clean.mean(),
            test: test_loss,
            adversarial: self.attack.map(|_| adversarial.mean()),
        };
        tracing::debug!(
            learning_rate,
            batches = clean.count,
            train = losses.train,
            test = losses.test,
            adversarial = ?losses.adversarial,
            "epoch losses"
        );

        Ok((model, losses))
    }

    fn held_out_loss<M, D>(&self, model: &M, test: &BatchLoader<'_, D>) -> Result<f32>
    where
        M: ImageClassifier<B::InnerBackend>,
        D: Dataset<ImageItem>,
    {
        let mut mean = RunningMean::default();
        for batch in test.sequential::<B::InnerBackend>(&self.device) {
            let batch = batch?;
            let logits = model.forward(batch.images, Mode::Evaluation);
            let loss = self.eval_loss_fn.forward(logits, batch.labels);
            mean.push(finite_loss(loss, "held-out")?);
        }
        Ok(mean.mean())
    }
}

fn finite_loss<B: Backend>(loss: Tensor<B, 1>, label: &str) -> Result<f32> {
    let value = loss.into_scalar().elem::<f32>();
    ensure!(value.is_finite(), "{} loss became non-finite ({})", label, value);
    Ok(value)
}

/// Unweighted mean over batches.
#[derive(Default)]
struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    fn push(&mut self, value: f32) {
        self.sum += value as f64;
        self.count += 1;
    }

    fn mean(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::toy, model::testing::LinearHead, model::ModelKind};
    use advtrain_core::seeded_rng;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn run_frozen_epoch(attack: Option<PgdConfig>) -> (Vec<f32>, Vec<f32>, EpochLosses) {
        let device = Default::default();
        let train_set = toy::two_class(8, 1);
        let test_set = toy::two_class(4, 2);
        let train = BatchLoader::new(&train_set, toy::SHAPE, 4).shuffled();
        let test = BatchLoader::new(&test_set, toy::SHAPE, 4);

        let model = LinearHead::<TestBackend>::new(&device, toy::SHAPE.len(), 2);
        let before = model.weights();
        let mut optimizer = ModelKind::Vgg16
            .hyperparameters()
            .optimizer()
            .init::<TestBackend, LinearHead<TestBackend>>();

        let trainer = Trainer::<TestBackend>::new(&device, attack).unwrap();
        let (model, losses) = trainer
            .train_epoch(model, &mut optimizer, 0.0, &train, &test, &mut seeded_rng(3))
            .unwrap();

        (before, model.weights(), losses)
    }

    #[test]
    fn zero_learning_rate_leaves_parameters_unchanged() {
        let (before, after, losses) = run_frozen_epoch(None);
        assert_eq!(before, after);
        assert!(losses.train.is_finite() && losses.train >= 0.0);
        assert!(losses.test.is_finite() && losses.test >= 0.0);
        assert!(losses.adversarial.is_none());
    }

    #[test]
    fn zero_learning_rate_with_attack_leaves_parameters_unchanged() {
        let (before, after, losses) = run_frozen_epoch(Some(PgdConfig::default()));
        assert_eq!(before, after);
        let adversarial = losses.adversarial.unwrap();
        assert!(adversarial.is_finite() && adversarial >= 0.0);
    }

    #[test]
    fn training_reduces_loss_on_separable_data() {
        let device = Default::default();
        let train_set = toy::two_class(16, 5);
        let test_set = toy::two_class(8, 6);
        let train = BatchLoader::new(&train_set, toy::SHAPE, 4).shuffled();
        let test = BatchLoader::new(&test_set, toy::SHAPE, 4);

        let mut model = LinearHead::<TestBackend>::new(&device, toy::SHAPE.len(), 2);
        let mut optimizer =
            burn::optim::SgdConfig::new().init::<TestBackend, LinearHead<TestBackend>>();
        let trainer = Trainer::<TestBackend>::new(&device, None).unwrap();
        let mut rng = seeded_rng(9);

        let mut history = Vec::new();
        for _ in 0..5 {
            let (next, losses) = trainer
                .train_epoch(model, &mut optimizer, 0.002, &train, &test, &mut rng)
                .unwrap();
            model = next;
            history.push(losses.test);
        }
        assert!(history[4] < history[0]);
    }

    #[test]
    fn invalid_attack_is_rejected_up_front() {
        let device = Default::default();
        let attack = PgdConfig {
            epsilon: -1.0,
            ..PgdConfig::default()
        };
        assert!(Trainer::<TestBackend>::new(&device, Some(attack)).is_err());
    }

    #[test]
    fn running_mean_averages_per_batch() {
        let mut mean = RunningMean::default();
        assert_eq!(mean.mean(), 0.0);
        mean.push(1.0);
        mean.push(2.0);
        mean.push(6.0);
        assert!((mean.mean() - 3.0).abs() < 1e-6);
    }
}
