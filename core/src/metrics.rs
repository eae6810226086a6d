use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::config::write_json;

pub const TRAIN_LOSS_FILE: &str = "losses-train.json";
pub const TEST_LOSS_FILE: &str = "losses-test.json";
pub const TRAIN_ACCURACY_FILE: &str = "acc-train.json";
pub const TEST_ACCURACY_FILE: &str = "acc-test.json";
pub const ADVERSARIAL_LOSS_FILE: &str = "losses-adv.json";

/// Scalars produced by one completed epoch. Accuracies are ratios in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f32,
    pub test_loss: f32,
    pub adversarial_loss: Option<f32>,
    pub train_accuracy: f32,
    pub test_accuracy: f32,
}

/// Append-only per-epoch history. The adversarial series exists only for
/// adversarial runs, and then every epoch must carry it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricSeries {
    adversarial: bool,
    epochs: Vec<EpochMetrics>,
}

impl MetricSeries {
    pub fn new(adversarial: bool) -> Self {
        Self {
            adversarial,
            epochs: Vec::new(),
        }
    }

    pub fn push(&mut self, metrics: EpochMetrics) -> Result<()> {
        if self.adversarial != metrics.adversarial_loss.is_some() {
            return Err(anyhow!(
                "epoch {} adversarial loss presence does not match the run mode",
                metrics.epoch
            ));
        }
        self.epochs.push(metrics);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn is_adversarial(&self) -> bool {
        self.adversarial
    }

    pub fn epochs(&self) -> &[EpochMetrics] {
        &self.epochs
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    pub fn train_loss(&self) -> Vec<f32> {
        self.column(|m| m.train_loss)
    }

    pub fn test_loss(&self) -> Vec<f32> {
        self.column(|m| m.test_loss)
    }

    pub fn train_accuracy(&self) -> Vec<f32> {
        self.column(|m| m.train_accuracy)
    }

    pub fn test_accuracy(&self) -> Vec<f32> {
        self.column(|m| m.test_accuracy)
    }

    pub fn adversarial_loss(&self) -> Option<Vec<f32>> {
        self.adversarial
            .then(|| self.column(|m| m.adversarial_loss.unwrap_or_default()))
    }

    /// Write each series as a flat JSON array into `dir`, returning the paths written.
    pub fn save(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut series = vec![
            (TRAIN_LOSS_FILE, self.train_loss()),
            (TEST_LOSS_FILE, self.test_loss()),
            (TRAIN_ACCURACY_FILE, self.train_accuracy()),
            (TEST_ACCURACY_FILE, self.test_accuracy()),
        ];
        if let Some(adversarial) = self.adversarial_loss() {
            series.push((ADVERSARIAL_LOSS_FILE, adversarial));
        }

        let mut written = Vec::with_capacity(series.len());
        for (name, values) in series {
            let path = dir.join(name);
            write_json(&path, &values)?;
            written.push(path);
        }
        Ok(written)
    }

    fn column(&self, select: impl Fn(&EpochMetrics) -> f32) -> Vec<f32> {
        self.epochs.iter().map(select).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(epoch: usize, adversarial_loss: Option<f32>) -> EpochMetrics {
        EpochMetrics {
            epoch,
            learning_rate: 0.1,
            train_loss: 1.0 + epoch as f32,
            test_loss: 2.0 + epoch as f32,
            adversarial_loss,
            train_accuracy: 0.5,
            test_accuracy: 0.25,
        }
    }

    #[test]
    fn columns_follow_push_order() {
        let mut series = MetricSeries::new(false);
        series.push(epoch(0, None)).unwrap();
        series.push(epoch(1, None)).unwrap();

        assert_eq!(series.len(), 2);
        assert_eq!(series.train_loss(), vec![1.0, 2.0]);
        assert_eq!(series.test_loss(), vec![2.0, 3.0]);
        assert!(series.adversarial_loss().is_none());
    }

    #[test]
    fn adversarial_presence_must_match_mode() {
        let mut clean = MetricSeries::new(false);
        assert!(clean.push(epoch(0, Some(0.3))).is_err());

        let mut adversarial = MetricSeries::new(true);
        assert!(adversarial.push(epoch(0, None)).is_err());
        adversarial.push(epoch(0, Some(0.3))).unwrap();
        assert_eq!(adversarial.adversarial_loss(), Some(vec![0.3]));
        assert_eq!(adversarial.len(), 1);
    }

    #[test]
    fn save_writes_one_file_per_series() {
        let dir = tempfile::tempdir().unwrap();
        let mut series = MetricSeries::new(true);
        series.push(epoch(0, Some(0.7))).unwrap();

        let written = series.save(dir.path()).unwrap();
        assert_eq!(written.len(), 5);

        let raw = std::fs::read_to_string(dir.path().join(ADVERSARIAL_LOSS_FILE)).unwrap();
        let values: Vec<f32> = serde_json::from_str(&raw).unwrap();
        assert_eq!(values, vec![0.7]);
        assert!(dir.path().join(TEST_ACCURACY_FILE).exists());
    }
}
