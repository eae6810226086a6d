use anyhow::Result;
use burn::tensor::{backend::Backend, ElementConversion, Int, Tensor};
use burn_dataset::Dataset;

use crate::{
    data::{BatchLoader, ImageItem},
    model::{ImageClassifier, Mode},
};

/// Correct predictions per split, before dividing by split sizes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AccuracyCounts {
    pub train_correct: usize,
    pub test_correct: usize,
}

/// Counts correct top-1 predictions on both splits in evaluation mode.
///
/// `model` is expected on a backend without gradient tracking (the inner
/// backend of the training model), so no graph is recorded.
pub fn evaluate<B, M, TrainSet, TestSet>(
    model: &M,
    train: &BatchLoader<'_, TrainSet>,
    test: &BatchLoader<'_, TestSet>,
    device: &B::Device,
) -> Result<AccuracyCounts>
where
    B: Backend,
    M: ImageClassifier<B>,
    TrainSet: Dataset<ImageItem>,
    TestSet: Dataset<ImageItem>,
{
    Ok(AccuracyCounts {
        train_correct: count_correct(model, train, device)?,
        test_correct: count_correct(model, test, device)?,
    })
}

fn count_correct<B, M, D>(
    model: &M,
    loader: &BatchLoader<'_, D>,
    device: &B::Device,
) -> Result<usize>
where
    B: Backend,
    M: ImageClassifier<B>,
    D: Dataset<ImageItem>,
{
    let mut correct = 0;
    for batch in loader.sequential::<B>(device) {
        let batch = batch?;
        let logits = model.forward(batch.images, Mode::Evaluation);
        correct += accuracy_counts(logits, batch.labels).0;
    }
    Ok(correct)
}

/// `(correct, total)` for one batch of logits.
pub fn accuracy_counts<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> (usize, usize) {
    let predictions = logits.argmax(1).squeeze(1);
    let correct = predictions
        .equal(targets.clone())
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize;
    let total = targets.dims()[0];

    (correct, total)
}
