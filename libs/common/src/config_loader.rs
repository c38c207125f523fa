//! Configuration loading helper functions
//!
//! Thin layer over figment: defaults from the type itself, then an optional
//! file, then prefixed environment variables.

use std::path::Path;

use errors::{PlcError, PlcResult};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Pick the figment provider matching the file extension
fn file_figment(path: &Path) -> PlcResult<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| PlcError::Configuration("Config file must have an extension".to_string()))?;

    match extension {
        "toml" => Ok(Figment::new().merge(Toml::file(path))),
        "yaml" | "yml" => Ok(Figment::new().merge(Yaml::file(path))),
        "json" => Ok(Figment::new().merge(Json::file(path))),
        _ => Err(PlcError::Configuration(format!(
            "Unsupported config file format: {}",
            extension
        ))),
    }
}

/// Load configuration from a specific file
pub fn load_config_from_file<T, P>(path: P) -> PlcResult<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if !path.exists() {
        return Err(PlcError::Configuration(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    file_figment(path)?.extract().map_err(|e| {
        PlcError::Configuration(format!("Failed to load configuration from file: {}", e))
    })
}

/// Load configuration from multiple sources
///
/// Priority (highest to lowest):
/// 1. Environment variables starting with `env_prefix` (`__` separates nested keys)
/// 2. The optional config file
/// 3. `defaults`
pub fn load_layered<T>(defaults: &T, file: Option<&Path>, env_prefix: &str) -> PlcResult<T>
where
    T: Serialize + for<'de> Deserialize<'de>,
{
    let mut figment = Figment::from(Serialized::defaults(defaults));

    if let Some(path) = file {
        debug!("Merging configuration file {}", path.display());
        figment = figment.merge(file_figment(path)?);
    }

    figment
        .merge(Env::prefixed(env_prefix).split("__"))
        .extract()
        .map_err(|e| PlcError::Configuration(format!("Failed to load configuration: {}", e)))
}
