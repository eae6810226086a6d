use std::{env, fmt, path::PathBuf};

use anyhow::{anyhow, Context, Result};

pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Accelerator selection, resolved to a backend device by the experiment binary.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DeviceSelector {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSelector {
    /// Accepts `cpu`, `cuda`, `cuda:N`, `metal`, `metal:N`, or a bare GPU index.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim().to_ascii_lowercase();
        if value == "cpu" {
            return Ok(Self::Cpu);
        }
        if let Ok(index) = value.parse::<usize>() {
            return Ok(Self::Cuda(index));
        }

        let (kind, index) = match value.split_once(':') {
            Some((kind, index)) => {
                let index = index
                    .parse::<usize>()
                    .with_context(|| format!("invalid device index in {value:?}"))?;
                (kind, index)
            }
            None => (value.as_str(), 0),
        };

        match kind {
            "cuda" | "gpu" => Ok(Self::Cuda(index)),
            "metal" => Ok(Self::Metal(index)),
            _ => Err(anyhow!("invalid device: {}", value)),
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(index) => write!(f, "cuda:{index}"),
            Self::Metal(index) => write!(f, "metal:{index}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrainArgs {
    pub data_dir: PathBuf,
    pub model_dir: PathBuf,
    pub log_dir: PathBuf,
    pub dataset: String,
    pub model: String,
    pub batch_size: usize,
    /// Overrides the per-model default when set.
    pub epochs: Option<usize>,
    pub device: DeviceSelector,
    pub adv_train: bool,
    help_requested: bool,
}

impl Default for TrainArgs {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/cifar10"),
            model_dir: PathBuf::from("save"),
            log_dir: PathBuf::from("log"),
            dataset: "CIFAR10".to_string(),
            model: "vgg16".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            epochs: None,
            device: DeviceSelector::Cpu,
            adv_train: false,
            help_requested: false,
        }
    }
}

impl TrainArgs {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args().skip(1))
    }

    /// Parses `--flag value` and `--flag=value` forms. Underscores in flag
    /// names are accepted in place of dashes (`--data_dir`). `--adv-train` may
    /// stand alone or take a boolean value.
    pub fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut iter = args.into_iter().peekable();

        while let Some(arg) = iter.next() {
            if arg == "--help" || arg == "-h" {
                parsed.help_requested = true;
                continue;
            }

            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) => (flag.replace('_', "-"), Some(value.to_string())),
                None => (arg.replace('_', "-"), None),
            };

            if flag == "--adv-train" {
                parsed.adv_train = match inline {
                    Some(value) => parse_bool(&flag, &value)?,
                    // `--adv_train True` as well as a bare switch.
                    None => {
                        let next = iter.peek().and_then(|next| parse_bool(&flag, next).ok());
                        if next.is_some() {
                            iter.next();
                        }
                        next.unwrap_or(true)
                    }
                };
                continue;
            }

            if !flag.starts_with("--") {
                return Err(anyhow!("unexpected argument: {}", arg));
            }

            let value = match inline {
                Some(value) => value,
                None => iter
                    .next()
                    .ok_or_else(|| anyhow!("expected value after {}", flag))?,
            };

            match flag.as_str() {
                "--data-dir" => parsed.data_dir = PathBuf::from(value),
                "--model-dir" => parsed.model_dir = PathBuf::from(value),
                "--log-dir" => parsed.log_dir = PathBuf::from(value),
                "--dataset" => parsed.dataset = value,
                "--model" => parsed.model = value,
                "--batch-size" => parsed.batch_size = parse_count(&flag, &value)?,
                "--epochs" => parsed.epochs = Some(parse_count(&flag, &value)?),
                "--device" | "--gpu-id" => parsed.device = DeviceSelector::parse(&value)?,
                _ => return Err(anyhow!("unexpected argument: {}", arg)),
            }
        }

        Ok(parsed)
    }

    pub fn help_requested(&self) -> bool {
        self.help_requested
    }

    pub fn usage(program: &str) -> String {
        format!(
            "Usage: {program} [options]\n\n\
             Options:\n  \
             --data-dir <path>     CIFAR10 binary batches (default data/cifar10)\n  \
             --model-dir <path>    checkpoint directory (default save)\n  \
             --log-dir <path>      metric arrays, config and report (default log)\n  \
             --dataset <name>      dataset name (CIFAR10)\n  \
             --model <name>        vgg16 | resnet18 (default vgg16)\n  \
             --batch-size <n>      minibatch size (default {DEFAULT_BATCH_SIZE})\n  \
             --epochs <n>          override the model's default epoch count\n  \
             --device <sel>        cpu | cuda[:N] | metal[:N] | N (default cpu)\n  \
             --adv-train[=bool]    enable PGD adversarial training\n  \
             -h, --help            print this message"
        )
    }
}

fn parse_count(flag: &str, value: &str) -> Result<usize> {
    let count = value
        .parse::<usize>()
        .with_context(|| format!("invalid value for {flag}: {value:?}"))?;
    if count == 0 {
        return Err(anyhow!("{} must be greater than zero", flag));
    }
    Ok(count)
}

fn parse_bool(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(anyhow!("invalid boolean for {}: {:?}", flag, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn defaults_without_arguments() {
        let parsed = TrainArgs::parse(Vec::new()).unwrap();
        assert_eq!(parsed, TrainArgs::default());
        assert_eq!(parsed.batch_size, DEFAULT_BATCH_SIZE);
        assert!(!parsed.adv_train);
        assert!(parsed.epochs.is_none());
    }

    #[test]
    fn parses_separate_and_inline_values() {
        let parsed = TrainArgs::parse(args(&[
            "--model",
            "resnet18",
            "--batch-size=64",
            "--epochs",
            "3",
            "--log_dir",
            "/tmp/logs",
            "--device=cuda:1",
        ]))
        .unwrap();

        assert_eq!(parsed.model, "resnet18");
        assert_eq!(parsed.batch_size, 64);
        assert_eq!(parsed.epochs, Some(3));
        assert_eq!(parsed.log_dir, PathBuf::from("/tmp/logs"));
        assert_eq!(parsed.device, DeviceSelector::Cuda(1));
    }

    #[test]
    fn adv_train_flag_forms() {
        assert!(TrainArgs::parse(args(&["--adv-train"])).unwrap().adv_train);
        assert!(TrainArgs::parse(args(&["--adv_train=True"])).unwrap().adv_train);
        assert!(!TrainArgs::parse(args(&["--adv-train=False"])).unwrap().adv_train);
        assert!(TrainArgs::parse(args(&["--adv-train=maybe"])).is_err());
    }

    #[test]
    fn adv_train_accepts_separate_boolean() {
        let parsed = TrainArgs::parse(args(&["--adv_train", "True", "--epochs", "2"])).unwrap();
        assert!(parsed.adv_train);
        assert_eq!(parsed.epochs, Some(2));

        let parsed = TrainArgs::parse(args(&["--adv_train", "False"])).unwrap();
        assert!(!parsed.adv_train);

        let parsed = TrainArgs::parse(args(&["--adv-train", "--model", "resnet18"])).unwrap();
        assert!(parsed.adv_train);
        assert_eq!(parsed.model, "resnet18");
    }

    #[test]
    fn rejects_unknown_and_malformed_arguments() {
        assert!(TrainArgs::parse(args(&["--learning-rate", "0.1"])).is_err());
        assert!(TrainArgs::parse(args(&["positional"])).is_err());
        assert!(TrainArgs::parse(args(&["--batch-size", "zero"])).is_err());
        assert!(TrainArgs::parse(args(&["--batch-size", "0"])).is_err());
        assert!(TrainArgs::parse(args(&["--model"])).is_err());
    }

    #[test]
    fn help_is_recorded() {
        let parsed = TrainArgs::parse(args(&["-h"])).unwrap();
        assert!(parsed.help_requested());
        assert!(TrainArgs::usage("advtrain").contains("--adv-train"));
    }

    #[test]
    fn device_selectors() {
        assert_eq!(DeviceSelector::parse("cpu").unwrap(), DeviceSelector::Cpu);
        assert_eq!(DeviceSelector::parse("0").unwrap(), DeviceSelector::Cuda(0));
        assert_eq!(DeviceSelector::parse("cuda").unwrap(), DeviceSelector::Cuda(0));
        assert_eq!(DeviceSelector::parse("Metal:2").unwrap(), DeviceSelector::Metal(2));
        assert!(DeviceSelector::parse("tpu").is_err());
        assert!(DeviceSelector::parse("cuda:x").is_err());
        assert_eq!(DeviceSelector::Cuda(3).to_string(), "cuda:3");
    }
}
