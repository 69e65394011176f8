//! Multi-file configuration loading.
//!
//! Every file is interpolated and parsed into a YAML mapping, the mappings are
//! deep-merged in order (later files win key by key), and the result is
//! deserialized once. Partial files therefore only need the keys they change.

use std::path::Path;

use serde_yaml::{Mapping, Value};
use snafu::prelude::*;

use crate::config::{ConfigPath, HoserConfig, interpolate, is_yaml_file};
use crate::error::{ConfigError, ReadFileSnafu, YamlParseSnafu};

/// Load and merge every configuration source into one config.
///
/// All sources are attempted; failures are reported together.
pub fn load_from_paths(paths: &[ConfigPath]) -> Result<HoserConfig, ConfigError> {
    let mut merged = Value::Mapping(Mapping::new());
    let mut errors = Vec::new();

    for path in paths {
        let loaded = match path {
            ConfigPath::File(file) => load_file(file).map(|value| vec![value]),
            ConfigPath::Dir(dir) => load_dir(dir),
        };
        match loaded {
            Ok(values) => values.into_iter().for_each(|v| merge_values(&mut merged, v)),
            Err(e) => {
                let shown = match path {
                    ConfigPath::File(p) | ConfigPath::Dir(p) => p.display().to_string(),
                };
                errors.push(format!("{shown}: {e}"));
            }
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::MultipleErrors { errors });
    }
    from_value(merged)
}

/// Deep-merge `other` into `base`. Mappings merge key by key, anything else
/// is replaced.
pub fn merge_values(base: &mut Value, other: Value) {
    match (base, other) {
        (Value::Mapping(base), Value::Mapping(other)) => {
            for (key, value) in other {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, other) => *base = other,
    }
}

pub(crate) fn parse_document(contents: &str) -> Result<Value, ConfigError> {
    let result = interpolate(contents);
    if !result.is_ok() {
        return Err(ConfigError::EnvInterpolation {
            message: result.errors.join("\n"),
        });
    }

    let value: Value = serde_yaml::from_str(&result.text).context(YamlParseSnafu)?;
    match value {
        Value::Null => Ok(Value::Mapping(Mapping::new())),
        Value::Mapping(_) => Ok(value),
        _ => Err(ConfigError::NotAMapping),
    }
}

pub(crate) fn from_value(value: Value) -> Result<HoserConfig, ConfigError> {
    serde_yaml::from_value(value).context(YamlParseSnafu)
}

fn load_file(path: &Path) -> Result<Value, ConfigError> {
    if !is_yaml_file(path) {
        return Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).context(ReadFileSnafu)?;
    parse_document(&contents)
}

fn load_dir(dir: &Path) -> Result<Vec<Value>, ConfigError> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .map_err(|source| ConfigError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_yaml_file(path))
        .collect();
    files.sort();

    files.iter().map(|path| load_file(path)).collect()
}
