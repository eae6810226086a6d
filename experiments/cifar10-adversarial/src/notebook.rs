//! Rendering of the run notebook (`<log-dir>/report.md`).

use std::{fmt::Write, path::Path};

use advtrain_core::{
    encode_planar_png_data_url, EpochMetrics, MetricSeries, Report, ReportSection,
    DEFAULT_REPORT_TEMPLATE,
};
use anyhow::{anyhow, Result};
use burn::{
    nn::loss::CrossEntropyLossConfig,
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
};
use burn_dataset::Dataset;

use crate::{
    attack::{pgd_attack, PgdConfig},
    data::{Augmentation, ImageBatch, ImageItem, ImageShape},
    driver::RunPlan,
    model::{FrozenClassifier, ImageClassifier},
};

/// Settings shown in the configuration section besides the run plan.
pub struct ReportContext<'a> {
    pub plan: &'a RunPlan,
    pub seed: u64,
    pub batch_size: usize,
    pub device: String,
    pub augmentation: Augmentation,
    /// Attack used for the sample gallery (and for training when enabled).
    pub attack: PgdConfig,
    pub train_examples: usize,
    pub test_examples: usize,
}

pub struct AdversarialSample {
    pub index: usize,
    pub label: usize,
    pub clean_prediction: usize,
    pub adversarial_prediction: usize,
    pub clean_image: String,
    pub adversarial_image: String,
}

pub fn write_report(
    path: &Path,
    context: &ReportContext<'_>,
    metrics: &MetricSeries,
    samples: &[AdversarialSample],
    class_names: &[&str],
) -> Result<()> {
    let report = Report::open(path, DEFAULT_REPORT_TEMPLATE)?;
    let sections = [
        ReportSection::new("configuration", render_configuration_section(context)),
        ReportSection::new("metrics", render_metrics_section(metrics)),
        ReportSection::new(
            "adversarial-samples",
            render_samples_section(&context.attack, samples, class_names),
        ),
    ];
    report.update(&sections)
}

/// Attacks the first `count` images of `dataset` with the frozen model and
/// records both predictions alongside the encoded images.
pub fn adversarial_samples<B, M, D>(
    model: &M,
    dataset: &D,
    shape: ImageShape,
    count: usize,
    attack: &PgdConfig,
    device: &B::Device,
) -> Result<Vec<AdversarialSample>>
where
    B: AutodiffBackend,
    M: ImageClassifier<B>,
    D: Dataset<ImageItem>,
{
    let available = count.min(dataset.len());
    if available == 0 {
        return Ok(Vec::new());
    }

    let mut items = Vec::with_capacity(available);
    for index in 0..available {
        let item = dataset
            .get(index)
            .ok_or_else(|| anyhow!("dataset index {} out of bounds", index))?;
        items.push(item);
    }

    let batch = ImageBatch::<B>::from_items(device, shape, &items)?;
    let frozen = FrozenClassifier::snapshot(model);
    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let perturbed = pgd_attack(
        &frozen,
        &loss_fn,
        batch.images.clone(),
        batch.labels,
        attack,
    )?;

    let clean_predictions = predictions(frozen.logits(batch.images.clone()))?;
    let adversarial_predictions = predictions(frozen.logits(perturbed.clone()))?;
    let clean_pixels = pixels(batch.images)?;
    let adversarial_pixels = pixels(perturbed)?;

    let (width, height) = (shape.width as u32, shape.height as u32);
    let mut samples = Vec::with_capacity(available);
    for (index, item) in items.iter().enumerate() {
        let range = index * shape.len()..(index + 1) * shape.len();
        samples.push(AdversarialSample {
            index,
            label: item.label,
            clean_prediction: clean_predictions[index],
            adversarial_prediction: adversarial_predictions[index],
            clean_image: encode_planar_png_data_url(
                shape.channels,
                width,
                height,
                &clean_pixels[range.clone()],
            )?,
            adversarial_image: encode_planar_png_data_url(
                shape.channels,
                width,
                height,
                &adversarial_pixels[range],
            )?,
        });
    }

    Ok(samples)
}

fn predictions<B: Backend>(logits: Tensor<B, 2>) -> Result<Vec<usize>> {
    let predicted: Tensor<B, 1, Int> = logits.argmax(1).squeeze(1);
    let values = predicted
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| anyhow!("failed to decode predictions: {err:?}"))?;
    Ok(values.into_iter().map(|v| v as usize).collect())
}

fn pixels<B: Backend>(images: Tensor<B, 4>) -> Result<Vec<f32>> {
    images
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow!("failed to decode images: {err:?}"))
}

fn render_configuration_section(context: &ReportContext<'_>) -> String {
    let plan = context.plan;
    let hp = &plan.hyperparameters;
    let mut output = String::new();

    let _ = writeln!(
        &mut output,
        "- Dataset: {} ({} train / {} test)",
        plan.dataset, context.train_examples, context.test_examples
    );
    let _ = writeln!(&mut output, "- Model: {}", plan.model_name);
    let _ = writeln!(&mut output, "- Adversarial training: {}", plan.attack.is_some());
    let _ = writeln!(&mut output, "- Device: {}", context.device);
    let _ = writeln!(&mut output, "- Seed: {}", context.seed);
    let _ = writeln!(&mut output, "- Batch size: {}", context.batch_size);
    let _ = writeln!(&mut output, "- Epochs: {}", plan.epochs);
    let _ = writeln!(
        &mut output,
        "- SGD: lr {}, momentum {}, weight decay {}, milestones {:?}, gamma {}",
        hp.learning_rate, hp.momentum, hp.weight_decay, hp.milestones, hp.gamma
    );
    let _ = writeln!(
        &mut output,
        "- Augmentation: crop padding {}, horizontal flip {}",
        context.augmentation.crop_padding, context.augmentation.horizontal_flip
    );
    let _ = writeln!(
        &mut output,
        "- PGD: epsilon {}, step size {}, iterations {}",
        context.attack.epsilon, context.attack.step_size, context.attack.iterations
    );
    let _ = writeln!(&mut output, "- Checkpoint: {}", plan.checkpoint_path().display());

    output
}

fn render_metrics_section(metrics: &MetricSeries) -> String {
    let Some(last) = metrics.last() else {
        return "No epochs completed.".to_string();
    };

    let mut output = String::new();
    let _ = writeln!(
        &mut output,
        "- Final train loss: {:.4}\n- Final test loss: {:.4}",
        last.train_loss, last.test_loss
    );
    if let Some(adversarial) = last.adversarial_loss {
        let _ = writeln!(&mut output, "- Final adversarial train loss: {:.4}", adversarial);
    }
    let _ = writeln!(
        &mut output,
        "- Final train accuracy: {:.2}%\n- Final test accuracy: {:.2}%\n",
        last.train_accuracy * 100.0,
        last.test_accuracy * 100.0
    );

    if metrics.is_adversarial() {
        let _ = writeln!(
            &mut output,
            "| Epoch | LR | Train Loss | Test Loss | Adv. Loss | Train Acc. (%) | Test Acc. (%) |"
        );
        let _ = writeln!(&mut output, "| --- | --- | --- | --- | --- | --- | --- |");
    } else {
        let _ = writeln!(
            &mut output,
            "| Epoch | LR | Train Loss | Test Loss | Train Acc. (%) | Test Acc. (%) |"
        );
        let _ = writeln!(&mut output, "| --- | --- | --- | --- | --- | --- |");
    }

    for epoch in summarize_history(metrics.epochs()) {
        let adversarial = epoch
            .adversarial_loss
            .map(|loss| format!(" {:.4} |", loss))
            .unwrap_or_default();
        let _ = writeln!(
            &mut output,
            "| {} | {:.4} | {:.4} | {:.4} |{} {:.2} | {:.2} |",
            epoch.epoch,
            epoch.learning_rate,
            epoch.train_loss,
            epoch.test_loss,
            adversarial,
            epoch.train_accuracy * 100.0,
            epoch.test_accuracy * 100.0
        );
    }

    output
}

/// A handful of representative epochs: early ones, round numbers, and the last.
fn summarize_history(history: &[EpochMetrics]) -> Vec<&EpochMetrics> {
    let Some(last) = history.last() else {
        return Vec::new();
    };

    let mut checkpoints = vec![0, 1, 5, 10, 25, 50, 100, 150, 200, 250, 300, last.epoch];
    checkpoints.retain(|&epoch| epoch <= last.epoch);
    checkpoints.sort_unstable();
    checkpoints.dedup();

    checkpoints
        .into_iter()
        .filter_map(|target| history.iter().find(|m| m.epoch == target))
        .collect()
}

fn render_samples_section(
    attack: &PgdConfig,
    samples: &[AdversarialSample],
    class_names: &[&str],
) -> String {
    if samples.is_empty() {
        return "No held-out samples available.".to_string();
    }

    let name = |class: usize| class_names.get(class).copied().unwrap_or("?");
    let mut output = String::new();
    let _ = writeln!(
        &mut output,
        "PGD with epsilon {}, step size {}, {} iterations against the final model.\n",
        attack.epsilon, attack.step_size, attack.iterations
    );

    for (i, sample) in samples.iter().enumerate() {
        let _ = writeln!(
            &mut output,
            "#### Sample {} (index {})\n- True label: {}\n- Clean prediction: {}\n- Adversarial prediction: {}\n\n![Clean image]({}) ![Adversarial image]({})\n",
            i + 1,
            sample.index,
            name(sample.label),
            name(sample.clean_prediction),
            name(sample.adversarial_prediction),
            sample.clean_image,
            sample.adversarial_image
        );
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::toy,
        model::{Hyperparameters, VggConfig},
    };
    use advtrain_core::seeded_rng;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn metrics_row(epoch: usize, adversarial_loss: Option<f32>) -> EpochMetrics {
        EpochMetrics {
            epoch,
            learning_rate: 0.1,
            train_loss: 1.0,
            test_loss: 1.5,
            adversarial_loss,
            train_accuracy: 0.5,
            test_accuracy: 0.25,
        }
    }

    #[test]
    fn history_summary_keeps_round_epochs_and_last() {
        let history: Vec<EpochMetrics> = (0..37).map(|e| metrics_row(e, None)).collect();
        let epochs: Vec<usize> = summarize_history(&history).iter().map(|m| m.epoch).collect();
        assert_eq!(epochs, vec![0, 1, 5, 10, 25, 36]);
    }

    #[test]
    fn metrics_table_has_adversarial_column_only_when_adversarial() {
        let mut clean = MetricSeries::new(false);
        clean.push(metrics_row(0, None)).unwrap();
        let rendered = render_metrics_section(&clean);
        assert!(rendered.contains("- Final test accuracy: 25.00%"));
        assert!(!rendered.contains("Adv. Loss"));

        let mut adversarial = MetricSeries::new(true);
        adversarial.push(metrics_row(0, Some(2.0))).unwrap();
        let rendered = render_metrics_section(&adversarial);
        assert!(rendered.contains("Adv. Loss"));
        assert!(rendered.contains("| 0 | 0.1000 | 1.0000 | 1.5000 | 2.0000 | 50.00 | 25.00 |"));
    }

    #[test]
    fn report_contains_sample_gallery() {
        let device = Default::default();
        let test_set = toy::two_class(3, 4);
        let model = VggConfig::tiny(3, 2).init::<TestBackend>(&device, &mut seeded_rng(1));
        let attack = PgdConfig::default();

        let samples = adversarial_samples::<TestBackend, _, _>(
            &model,
            &test_set,
            toy::SHAPE,
            2,
            &attack,
            &device,
        )
        .unwrap();
        assert_eq!(samples.len(), 2);
        assert!(samples[0].clean_image.starts_with("data:image/png;base64,"));
        assert!(samples.iter().all(|s| s.clean_prediction < 2 && s.adversarial_prediction < 2));

        let dir = tempfile::tempdir().unwrap();
        let plan = RunPlan {
            dataset: "TOY".to_string(),
            model_name: "vgg-tiny".to_string(),
            epochs: 1,
            hyperparameters: Hyperparameters {
                epochs: 1,
                learning_rate: 0.1,
                momentum: 0.9,
                weight_decay: 5e-4,
                milestones: &[],
                gamma: 0.1,
            },
            attack: None,
            model_dir: dir.path().join("save"),
            log_dir: dir.path().join("log"),
        };
        let context = ReportContext {
            plan: &plan,
            seed: 666,
            batch_size: 4,
            device: "cpu".to_string(),
            augmentation: Augmentation::default(),
            attack,
            train_examples: 8,
            test_examples: 3,
        };
        let mut metrics = MetricSeries::new(false);
        metrics.push(metrics_row(0, None)).unwrap();

        let path = plan.log_dir.join("report.md");
        write_report(&path, &context, &metrics, &samples, &["dark", "bright"]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("- Seed: 666"));
        assert!(content.contains("#### Sample 2 (index 1)\n- True label: bright"));
        assert!(content.contains("![Adversarial image](data:image/png;base64,"));
    }
}
