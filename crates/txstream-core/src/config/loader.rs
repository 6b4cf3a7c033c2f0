//! Layered configuration loading.
//!
//! Compiled-in defaults form the base layer. The operator's YAML file is
//! env-interpolated and deep-merged on top: mappings merge key by key, any
//! other value replaces the default outright.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde_yaml::Value;
use snafu::prelude::*;
use tracing::warn;

use crate::config::{interpolate, is_yaml_file};
use crate::error::{ConfigError, ReadFileSnafu, YamlParseSnafu};

/// Deep-merge `overlay` into `base`.
pub fn merge_yaml(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        // An explicit null in the overlay does not erase a default
        (_, Value::Null) => {}
        (base, overlay) => *base = overlay,
    }
}

/// Load `T` from compiled-in `defaults` overlaid with the file at `path`.
///
/// A missing file is not an error: the defaults are used alone and
/// validation downstream decides whether that is enough.
pub fn load_layered<T: DeserializeOwned>(defaults: &str, path: &Path) -> Result<T, ConfigError> {
    let mut merged: Value = serde_yaml::from_str(defaults).context(YamlParseSnafu)?;

    match std::fs::read_to_string(path) {
        Ok(contents) => {
            if !is_yaml_file(path) {
                return Err(ConfigError::UnsupportedFormat {
                    path: path.to_path_buf(),
                });
            }

            let result = interpolate(&contents);
            if !result.is_ok() {
                return Err(ConfigError::EnvInterpolation {
                    message: result.errors.join("\n"),
                });
            }

            let overlay: Value = serde_yaml::from_str(&result.text).context(YamlParseSnafu)?;
            merge_yaml(&mut merged, overlay);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Config file not found, using defaults only");
        }
        Err(source) => {
            return Err(source).context(ReadFileSnafu {
                path: path.to_path_buf(),
            });
        }
    }

    serde_yaml::from_value(merged).context(YamlParseSnafu)
}
