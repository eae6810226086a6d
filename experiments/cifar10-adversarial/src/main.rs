mod attack;
mod data;
mod driver;
mod evaluator;
mod model;
mod notebook;
mod trainer;

use advtrain_core::{load_or_init, stream_rng, DeviceSelector, RngStream, TrainArgs};
use anyhow::Result;
use burn::{module::AutodiffModule, tensor::backend::AutodiffBackend};
use burn_autodiff::Autodiff;
use burn_candle::{Candle, CandleDevice};
use burn_dataset::Dataset;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::{
    attack::PgdConfig,
    data::{
        ensure_supported_dataset, Augmentation, BatchLoader, Cifar10Dataset, Split,
        CIFAR10_CLASSES, CIFAR10_LABELS, CIFAR10_SHAPE,
    },
    driver::RunPlan,
    model::{ImageClassifier, ModelKind, ResNetConfig, VggConfig},
    notebook::{adversarial_samples, write_report, ReportContext},
};

type TrainingBackend = Autodiff<Candle<f32, i64>>;
type InferenceBackend = <TrainingBackend as AutodiffBackend>::InnerBackend;

const PROGRAM: &str = "advtrain-cifar10";
const CONFIG_FILE: &str = "config.json";
const REPORT_FILE: &str = "report.md";

/// Per-run settings kept in `<log-dir>/config.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct RunSettings {
    seed: u64,
    attack: PgdConfig,
    augmentation: Augmentation,
    /// Held-out images shown in the report's adversarial gallery.
    report_samples: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            seed: 666,
            attack: PgdConfig::default(),
            augmentation: Augmentation::default(),
            report_samples: 4,
        }
    }
}

struct Datasets {
    train: Cifar10Dataset,
    test: Cifar10Dataset,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let args = TrainArgs::parse_from_env()?;
    if args.help_requested() {
        println!("{}", TrainArgs::usage(PROGRAM));
        return Ok(());
    }

    ensure_supported_dataset(&args.dataset)?;
    let kind = ModelKind::from_name(&args.model)?;
    let settings: RunSettings =
        load_or_init(&args.log_dir.join(CONFIG_FILE), RunSettings::default)?;
    settings.attack.validate()?;
    let device = resolve_device(args.device);

    let datasets = Datasets {
        train: Cifar10Dataset::load(&args.data_dir, Split::Train)?,
        test: Cifar10Dataset::load(&args.data_dir, Split::Test)?,
    };
    println!("data: {} from {}", args.dataset, args.data_dir.display());
    println!("  train examples: {}", datasets.train.len());
    println!("  test examples:  {}", datasets.test.len());

    let hyperparameters = kind.hyperparameters();
    let plan = RunPlan {
        dataset: args.dataset.clone(),
        model_name: kind.name().to_string(),
        epochs: args.epochs.unwrap_or(hyperparameters.epochs),
        hyperparameters,
        attack: args.adv_train.then_some(settings.attack),
        model_dir: args.model_dir.clone(),
        log_dir: args.log_dir.clone(),
    };
    println!("model: {}", plan.model_name);
    println!("  adversarial training: {}", args.adv_train);
    println!("  epochs: {}", plan.epochs);
    println!("  device: {}", args.device);
    println!("  checkpoint: {}", plan.checkpoint_path().display());

    let mut init_rng = stream_rng(settings.seed, RngStream::ModelInit);
    match kind {
        ModelKind::Vgg16 => {
            let config = VggConfig::vgg16(CIFAR10_CLASSES);
            config.validate(CIFAR10_SHAPE.height, CIFAR10_SHAPE.width)?;
            let model = config.init::<TrainingBackend>(&device, &mut init_rng);
            execute(&args, &settings, &plan, model, &datasets, &device)
        }
        ModelKind::ResNet18 => {
            let config = ResNetConfig::resnet18(CIFAR10_CLASSES);
            config.validate()?;
            let model = config.init::<TrainingBackend>(&device, &mut init_rng);
            execute(&args, &settings, &plan, model, &datasets, &device)
        }
    }
}

fn execute<M>(
    args: &TrainArgs,
    settings: &RunSettings,
    plan: &RunPlan,
    model: M,
    datasets: &Datasets,
    device: &CandleDevice,
) -> Result<()>
where
    M: ImageClassifier<TrainingBackend> + AutodiffModule<TrainingBackend>,
    M::InnerModule: ImageClassifier<InferenceBackend>,
{
    let train = BatchLoader::new(&datasets.train, CIFAR10_SHAPE, args.batch_size)
        .shuffled()
        .with_augmentation(settings.augmentation);
    let test = BatchLoader::new(&datasets.test, CIFAR10_SHAPE, args.batch_size);
    let mut data_rng = stream_rng(settings.seed, RngStream::Data);

    println!(
        "training for {} epochs ({} batches of up to {} per epoch)",
        plan.epochs,
        train.num_batches(),
        args.batch_size
    );
    let outcome = driver::run::<TrainingBackend, _, _, _>(
        plan,
        model,
        &train,
        &test,
        device,
        &mut data_rng,
    )?;

    let samples = adversarial_samples::<TrainingBackend, _, _>(
        &outcome.model,
        &datasets.test,
        CIFAR10_SHAPE,
        settings.report_samples,
        &settings.attack,
        device,
    )?;
    let report_path = args.log_dir.join(REPORT_FILE);
    let context = ReportContext {
        plan,
        seed: settings.seed,
        batch_size: args.batch_size,
        device: args.device.to_string(),
        augmentation: settings.augmentation,
        attack: settings.attack,
        train_examples: train.len(),
        test_examples: test.len(),
    };
    write_report(
        &report_path,
        &context,
        &outcome.metrics,
        &samples,
        &CIFAR10_LABELS,
    )?;

    if let Some(last) = outcome.metrics.last() {
        println!(
            "final test accuracy {:.2}% after {} epochs",
            last.test_accuracy * 100.0,
            outcome.metrics.len()
        );
    }
    println!("checkpoint saved to {}", outcome.checkpoint.display());
    for path in &outcome.metric_files {
        println!("metrics saved to {}", path.display());
    }
    println!("report updated at {}", report_path.display());

    Ok(())
}

fn resolve_device(selector: DeviceSelector) -> CandleDevice {
    match selector {
        DeviceSelector::Cpu => CandleDevice::Cpu,
        DeviceSelector::Cuda(index) => CandleDevice::cuda(index),
        DeviceSelector::Metal(index) => CandleDevice::metal(index),
    }
}
