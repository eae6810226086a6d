use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Load a JSON configuration from disk, creating it with the provided initializer if missing.
pub fn load_or_init<T, F>(path: &Path, initializer: F) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> T,
{
    if path.exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded run config");
        return Ok(value);
    }

    let value = initializer();
    write_json(path, &value)?;
    tracing::info!(path = %path.display(), "wrote default run config");
    Ok(value)
}

/// Serialize `value` as pretty JSON, creating parent directories and replacing any existing file.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(value)?;
    fs::write(path, serialized)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Settings {
        seed: u64,
    }

    #[test]
    fn creates_then_reuses_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");

        let first: Settings = load_or_init(&path, || Settings { seed: 7 }).unwrap();
        assert_eq!(first, Settings { seed: 7 });
        assert!(path.exists());

        let second: Settings = load_or_init(&path, || Settings { seed: 99 }).unwrap();
        assert_eq!(second, Settings { seed: 7 });
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let err = load_or_init(&path, || Settings { seed: 1 }).unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn write_json_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.json");

        write_json(&path, &[1.0f32, 2.0]).unwrap();
        write_json(&path, &[3.0f32]).unwrap();

        let values: Vec<f32> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(values, vec![3.0]);
    }
}
