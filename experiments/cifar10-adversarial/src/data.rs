//! CIFAR10 loading, augmentation and minibatching.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use burn_dataset::Dataset;
use rand::{rngs::StdRng, seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

pub const CIFAR10: &str = "CIFAR10";
pub const CIFAR10_CLASSES: usize = 10;
pub const CIFAR10_SHAPE: ImageShape = ImageShape {
    channels: 3,
    height: 32,
    width: 32,
};
pub const CIFAR10_LABELS: [&str; CIFAR10_CLASSES] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

const CIFAR10_SUBDIR: &str = "cifar-10-batches-bin";
const CIFAR10_TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const CIFAR10_TEST_FILES: [&str; 1] = ["test_batch.bin"];

/// Binary distribution; unpacks to `cifar-10-batches-bin/`.
pub const CIFAR10_ARCHIVE_URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";

pub fn ensure_supported_dataset(name: &str) -> Result<()> {
    if name == CIFAR10 {
        Ok(())
    } else {
        Err(anyhow!("unsupported dataset {}", name))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub fn len(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// One labeled image, pixels stored channel-major (`[c][y][x]`) as bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageItem {
    pub pixels: Vec<u8>,
    pub label: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }
}

/// CIFAR10 from the binary distribution (`cifar-10-batches-bin`).
#[derive(Clone, Debug)]
pub struct Cifar10Dataset {
    items: Vec<ImageItem>,
}

impl Cifar10Dataset {
    /// Reads the split from `dir` or from `dir/cifar-10-batches-bin`.
    pub fn load(dir: &Path, split: Split) -> Result<Self> {
        let root = resolve_root(dir);
        let files: &[&str] = match split {
            Split::Train => &CIFAR10_TRAIN_FILES,
            Split::Test => &CIFAR10_TEST_FILES,
        };

        let mut items = Vec::new();
        for name in files {
            let path = root.join(name);
            let bytes = fs::read(&path).with_context(|| {
                format!(
                    "failed to read CIFAR10 {} batch {} (download and unpack {})",
                    split.label(),
                    path.display(),
                    CIFAR10_ARCHIVE_URL
                )
            })?;
            let records = Self::parse_records(&bytes)
                .with_context(|| format!("malformed CIFAR10 batch {}", path.display()))?;
            tracing::debug!(
                path = %path.display(),
                records = records.len(),
                "loaded CIFAR10 batch"
            );
            items.extend(records);
        }

        Ok(Self { items })
    }

    /// Each record is one label byte followed by 3072 channel-major pixel bytes.
    pub fn parse_records(bytes: &[u8]) -> Result<Vec<ImageItem>> {
        let record_len = 1 + CIFAR10_SHAPE.len();
        ensure!(
            bytes.len() % record_len == 0,
            "{} bytes is not a whole number of {}-byte records",
            bytes.len(),
            record_len
        );

        bytes
            .chunks_exact(record_len)
            .map(|record| {
                let label = record[0] as usize;
                if label >= CIFAR10_CLASSES {
                    bail!("label {} out of range", label);
                }
                Ok(ImageItem {
                    pixels: record[1..].to_vec(),
                    label,
                })
            })
            .collect()
    }
}

impl Dataset<ImageItem> for Cifar10Dataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

fn resolve_root(dir: &Path) -> PathBuf {
    let nested = dir.join(CIFAR10_SUBDIR);
    if nested.is_dir() {
        nested
    } else {
        dir.to_path_buf()
    }
}

/// Random crop with zero padding, then random horizontal flip.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Augmentation {
    pub crop_padding: usize,
    pub horizontal_flip: bool,
}

impl Default for Augmentation {
    fn default() -> Self {
        Self {
            crop_padding: 4,
            horizontal_flip: true,
        }
    }
}

impl Augmentation {
    pub const NONE: Self = Self {
        crop_padding: 0,
        horizontal_flip: false,
    };

    pub fn is_identity(&self) -> bool {
        self.crop_padding == 0 && !self.horizontal_flip
    }

    pub fn apply(&self, pixels: &[u8], shape: ImageShape, rng: &mut StdRng) -> Vec<u8> {
        if self.is_identity() {
            return pixels.to_vec();
        }

        let pad = self.crop_padding as isize;
        let (dy, dx) = if pad > 0 {
            (rng.gen_range(-pad..=pad), rng.gen_range(-pad..=pad))
        } else {
            (0, 0)
        };
        let flip = self.horizontal_flip && rng.gen_bool(0.5);

        let (height, width) = (shape.height as isize, shape.width as isize);
        let mut out = vec![0u8; pixels.len()];
        for channel in 0..shape.channels {
            let plane = channel * shape.height * shape.width;
            for y in 0..height {
                for x in 0..width {
                    let sx = if flip { width - 1 - x } else { x } + dx;
                    let sy = y + dy;
                    if (0..height).contains(&sy) && (0..width).contains(&sx) {
                        let src = plane + (sy * width + sx) as usize;
                        out[plane + (y * width + x) as usize] = pixels[src];
                    }
                }
            }
        }
        out
    }
}

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn from_items(device: &B::Device, shape: ImageShape, items: &[ImageItem]) -> Result<Self> {
        let mut images = Vec::with_capacity(items.len() * shape.len());
        let mut labels = Vec::with_capacity(items.len());

        for item in items {
            ensure!(
                item.pixels.len() == shape.len(),
                "image has {} pixels, expected {}",
                item.pixels.len(),
                shape.len()
            );
            images.extend(item.pixels.iter().map(|&pixel| pixel as f32 / 255.0));
            labels.push(item.label as i64);
        }

        let dims = [items.len(), shape.channels, shape.height, shape.width];
        let images = Tensor::<B, 4>::from_floats(TensorData::new(images, dims), device);
        let labels = Tensor::<B, 1, Int>::from_ints(TensorData::new(labels, [items.len()]), device);

        Ok(Self { images, labels })
    }
}

/// Splits a dataset into minibatches, once per epoch.
///
/// [`BatchLoader::epoch`] applies shuffling and augmentation when configured;
/// [`BatchLoader::sequential`] always walks the dataset in index order with
/// the raw images.
#[derive(Debug)]
pub struct BatchLoader<'a, D> {
    dataset: &'a D,
    shape: ImageShape,
    batch_size: usize,
    shuffle: bool,
    augmentation: Augmentation,
}

impl<'a, D: Dataset<ImageItem>> BatchLoader<'a, D> {
    pub fn new(dataset: &'a D, shape: ImageShape, batch_size: usize) -> Self {
        Self {
            dataset,
            shape,
            batch_size: batch_size.max(1),
            shuffle: false,
            augmentation: Augmentation::NONE,
        }
    }

    pub fn shuffled(mut self) -> Self {
        self.shuffle = true;
        self
    }

    pub fn with_augmentation(mut self, augmentation: Augmentation) -> Self {
        self.augmentation = augmentation;
        self
    }

    /// Number of examples in the underlying dataset.
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    pub fn epoch<'l, B: Backend>(
        &'l self,
        device: &B::Device,
        rng: &'l mut StdRng,
    ) -> EpochBatches<'l, 'a, D, B> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if self.shuffle {
            order.shuffle(rng);
        }
        EpochBatches {
            loader: self,
            plan: self.plan(order),
            device: device.clone(),
            rng: Some(rng),
        }
    }

    pub fn sequential<'l, B: Backend>(&'l self, device: &B::Device) -> EpochBatches<'l, 'a, D, B> {
        EpochBatches {
            loader: self,
            plan: self.plan((0..self.len()).collect()),
            device: device.clone(),
            rng: None,
        }
    }

    fn plan(&self, order: Vec<usize>) -> std::vec::IntoIter<Vec<usize>> {
        order
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn load<B: Backend>(
        &self,
        indices: &[usize],
        device: &B::Device,
        rng: Option<&mut StdRng>,
    ) -> Result<ImageBatch<B>> {
        let mut items = Vec::with_capacity(indices.len());
        for &index in indices {
            let item = self
                .dataset
                .get(index)
                .ok_or_else(|| anyhow!("dataset index {} out of bounds", index))?;
            items.push(item);
        }

        if let Some(rng) = rng {
            if !self.augmentation.is_identity() {
                for item in &mut items {
                    item.pixels = self.augmentation.apply(&item.pixels, self.shape, rng);
                }
            }
        }

        ImageBatch::from_items(device, self.shape, &items)
    }
}

/// Iterator over the batches of one pass, see [`BatchLoader`].
pub struct EpochBatches<'l, 'a, D, B: Backend> {
    loader: &'l BatchLoader<'a, D>,
    plan: std::vec::IntoIter<Vec<usize>>,
    device: B::Device,
    rng: Option<&'l mut StdRng>,
}

impl<D: Dataset<ImageItem>, B: Backend> Iterator for EpochBatches<'_, '_, D, B> {
    type Item = Result<ImageBatch<B>>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.plan.next()?;
        let rng = self.rng.as_deref_mut();
        Some(self.loader.load(&indices, &self.device, rng))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.plan.size_hint()
    }
}
