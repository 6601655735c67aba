//! Configuration loading helpers built on figment
//!
//! Layering, lowest to highest priority:
//! defaults → `config/{service}.{toml,yaml,json}` → explicit file → `{SERVICE}_` env vars

use std::path::Path;

use errors::{CollectError, CollectResult};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};

/// Build the figment for a service without extracting it
///
/// Nested keys in environment variables use a double underscore:
/// `COLLECTSRV_COLLECTOR__IO_TIMEOUT_MS=500`.
pub fn service_figment<T>(service_name: &str, explicit: Option<&Path>) -> CollectResult<Figment>
where
    T: Serialize + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()))
        .merge(Toml::file(format!("config/{}.toml", service_name)))
        .merge(Yaml::file(format!("config/{}.yaml", service_name)))
        .merge(Json::file(format!("config/{}.json", service_name)));

    if let Some(path) = explicit {
        figment = merge_file(figment, path)?;
    }

    Ok(figment.merge(Env::prefixed(&format!("{}_", service_name.to_uppercase())).split("__")))
}

/// Load a service configuration from all layers
pub fn load_config<T>(service_name: &str, explicit: Option<&Path>) -> CollectResult<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    service_figment::<T>(service_name, explicit)?
        .extract()
        .map_err(|e| CollectError::config(format!("Failed to load configuration: {}", e)))
}

/// Load configuration from a single file, format chosen by extension
pub fn load_config_from_file<T, P>(path: P) -> CollectResult<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    merge_file(Figment::new(), path.as_ref())?
        .extract()
        .map_err(|e| CollectError::config(format!("Failed to load configuration from file: {}", e)))
}

fn merge_file(figment: Figment, path: &Path) -> CollectResult<Figment> {
    if !path.exists() {
        return Err(CollectError::config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CollectError::config("Config file must have an extension"))?;

    match extension {
        "toml" => Ok(figment.merge(Toml::file(path))),
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        "json" => Ok(figment.merge(Json::file(path))),
        _ => Err(CollectError::config(format!(
            "Unsupported config file format: {}",
            extension
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
    #[serde(default)]
    struct TestConfig {
        name: String,
        port: u16,
        nested: NestedConfig,
    }

    #[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
    #[serde(default)]
    struct NestedConfig {
        enabled: bool,
        value: i32,
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("svc.yaml");
        std::fs::write(&path, "name: pump\nport: 502\nnested:\n  enabled: true\n  value: 7\n")
            .unwrap();

        let loaded: TestConfig = load_config_from_file(&path).unwrap();
        assert_eq!(loaded.name, "pump");
        assert_eq!(loaded.port, 502);
        assert_eq!(
            loaded.nested,
            NestedConfig {
                enabled: true,
                value: 7
            }
        );
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("svc.ini");
        std::fs::write(&path, "name=x").unwrap();

        let err = load_config_from_file::<TestConfig, _>(&path).unwrap_err();
        assert!(err.to_string().contains("Unsupported config file format"));
    }

    #[test]
    fn test_missing_explicit_file() {
        let err =
            load_config::<TestConfig>("fieldlinktest", Some(Path::new("/nonexistent/x.toml")))
                .unwrap_err();
        assert!(matches!(err, CollectError::Configuration(_)));
    }

    #[test]
    fn test_explicit_file_over_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("svc.toml");
        std::fs::write(&path, "port = 1502\n").unwrap();

        let loaded: TestConfig = load_config("fieldlinktest", Some(&path)).unwrap();
        assert_eq!(loaded.port, 1502);
        assert_eq!(loaded.name, "");
        assert!(!loaded.nested.enabled);
    }
}
