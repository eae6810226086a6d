//! The epoch loop tying trainer, evaluator, schedule and persistence together.

use std::{
    fs,
    path::{Path, PathBuf},
};

use advtrain_core::{EpochMetrics, MetricSeries};
use anyhow::{anyhow, Context, Result};
use burn::{
    module::{AutodiffModule, Module},
    record::{BinFileRecorder, FullPrecisionSettings},
    tensor::backend::{AutodiffBackend, Backend},
};
use burn_dataset::Dataset;
use rand::rngs::StdRng;

use crate::{
    attack::PgdConfig,
    data::{BatchLoader, ImageItem},
    evaluator::evaluate,
    model::{Hyperparameters, ImageClassifier},
    trainer::Trainer,
};

/// Everything the epoch loop needs besides the model and the data.
#[derive(Clone, Debug)]
pub struct RunPlan {
    pub dataset: String,
    pub model_name: String,
    pub epochs: usize,
    pub hyperparameters: Hyperparameters,
    /// `Some` enables adversarial training with these attack constants.
    pub attack: Option<PgdConfig>,
    pub model_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl RunPlan {
    /// `<model-dir>/<dataset>-<model>[-adv]`; the recorder appends `.bin`.
    pub fn checkpoint_stem(&self) -> PathBuf {
        let suffix = if self.attack.is_some() { "-adv" } else { "" };
        self.model_dir
            .join(format!("{}-{}{}", self.dataset, self.model_name, suffix))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_stem().with_extension("bin")
    }
}

pub struct RunOutcome<M> {
    pub model: M,
    pub metrics: MetricSeries,
    pub checkpoint: PathBuf,
    pub metric_files: Vec<PathBuf>,
}

/// Trains for `plan.epochs` epochs, saving the checkpoint after every epoch
/// and the metric arrays at the end.
pub fn run<B, M, TrainSet, TestSet>(
    plan: &RunPlan,
    mut model: M,
    train: &BatchLoader<'_, TrainSet>,
    test: &BatchLoader<'_, TestSet>,
    device: &B::Device,
    rng: &mut StdRng,
) -> Result<RunOutcome<M>>
where
    B: AutodiffBackend,
    M: ImageClassifier<B> + AutodiffModule<B>,
    M::InnerModule: ImageClassifier<B::InnerBackend>,
    TrainSet: Dataset<ImageItem>,
    TestSet: Dataset<ImageItem>,
{
    for dir in [&plan.model_dir, &plan.log_dir] {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    let trainer = Trainer::<B>::new(device, plan.attack)?;
    let mut optimizer = plan.hyperparameters.optimizer().init::<B, M>();
    let mut schedule = plan.hyperparameters.schedule();
    let mut metrics = MetricSeries::new(trainer.is_adversarial());
    let checkpoint = plan.checkpoint_stem();

    let train_total = train.len() as f32;
    let test_total = test.len() as f32;

    for epoch in 0..plan.epochs {
        let learning_rate = schedule.current();
        let (next, losses) =
            trainer.train_epoch(model, &mut optimizer, learning_rate, train, test, rng)?;
        model = next;

        let counts = evaluate::<B::InnerBackend, _, _, _>(&model.valid(), train, test, device)?;
        schedule.step();

        let epoch_metrics = EpochMetrics {
            epoch,
            learning_rate,
            train_loss: losses.train,
            test_loss: losses.test,
            adversarial_loss: losses.adversarial,
            train_accuracy: counts.train_correct as f32 / train_total,
            test_accuracy: counts.test_correct as f32 / test_total,
        };
        metrics.push(epoch_metrics)?;

        save_checkpoint::<B, M>(&model, &checkpoint)?;
        println!("{}", epoch_line(&epoch_metrics));
    }

    let metric_files = metrics.save(&plan.log_dir)?;
    tracing::info!(
        epochs = metrics.len(),
        files = metric_files.len(),
        log_dir = %plan.log_dir.display(),
        "saved metric arrays"
    );

    Ok(RunOutcome {
        model,
        metrics,
        checkpoint: plan.checkpoint_path(),
        metric_files,
    })
}

fn save_checkpoint<B: Backend, M: Module<B>>(model: &M, stem: &Path) -> Result<()> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(stem.to_path_buf(), &recorder)
        .map_err(|err| anyhow!("failed to save checkpoint {}: {err:?}", stem.display()))?;
    tracing::debug!(path = %stem.display(), "checkpoint saved");
    Ok(())
}

/// One console line per epoch; the adversarial loss appears only when present.
pub fn epoch_line(metrics: &EpochMetrics) -> String {
    match metrics.adversarial_loss {
        Some(adversarial) => format!(
            "Epoch {}: train loss = {:.6}; test loss = {:.6}; adv. train loss = {:.6}; train acc. = {:.6}; test acc. = {:.6}.",
            metrics.epoch,
            metrics.train_loss,
            metrics.test_loss,
            adversarial,
            metrics.train_accuracy,
            metrics.test_accuracy
        ),
        None => format!(
            "Epoch {}: train loss = {:.6}; test loss = {:.6}; train acc. = {:.6}; test acc. = {:.6}.",
            metrics.epoch,
            metrics.train_loss,
            metrics.test_loss,
            metrics.train_accuracy,
            metrics.test_accuracy
        ),
    }
}
