//! Per-host JSON configuration.
//!
//! Each machine gets a `<hostname>.json` file in the configuration directory,
//! with `template.json` as the fallback for hosts that do not have their own.
//! The directory comes from the `CLIM_CONFIG_DIR` environmental variable unless
//! a path is given explicitly.
use std::{
    env,
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};

pub const CONFIG_DIR_VAR: &str = "CLIM_CONFIG_DIR";
pub const TEMPLATE_NAME: &str = "template.json";

#[derive(Debug, thiserror::Error)]
pub enum HostConfigError {
    #[error("{CONFIG_DIR_VAR} environmental variable not set")]
    DirNotSet,
    #[error("No configuration found for host {host:?} in {}", .dir.display())]
    NotFound { host: Option<String>, dir: PathBuf },
    #[error("Could not read {}: {reason}", .path.display())]
    Unreadable { path: PathBuf, reason: String },
    #[error("{} does not contain a JSON object at the top level", .0.display())]
    NotAnObject(PathBuf),
}

/// The configuration directory from [`CONFIG_DIR_VAR`].
pub fn config_dir_from_env() -> Result<PathBuf, HostConfigError> {
    env::var_os(CONFIG_DIR_VAR)
        .map(PathBuf::from)
        .ok_or(HostConfigError::DirNotSet)
}

/// Find the configuration file for `host` (the `HOSTNAME` of this machine when `None`).
pub fn config_path(dir: &Path, host: Option<&str>) -> Result<PathBuf, HostConfigError> {
    let host = host
        .map(|h| h.to_string())
        .or_else(|| env::var("HOSTNAME").ok());

    if let Some(h) = &host {
        let p = dir.join(format!("{h}.json"));
        if p.exists() {
            return Ok(p);
        }
    }

    let p = dir.join(TEMPLATE_NAME);
    if p.exists() {
        Ok(p)
    } else {
        Err(HostConfigError::NotFound {
            host,
            dir: dir.to_path_buf(),
        })
    }
}

/// A loaded host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    path: PathBuf,
    values: Map<String, Value>,
}

impl HostConfig {
    pub fn load(dir: &Path, host: Option<&str>) -> Result<Self, HostConfigError> {
        let path = config_path(dir, host)?;
        Self::from_file(path)
    }

    pub fn from_file(path: PathBuf) -> Result<Self, HostConfigError> {
        let text = std::fs::read_to_string(&path).map_err(|e| HostConfigError::Unreadable {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|e| HostConfigError::Unreadable {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        match value {
            Value::Object(values) => Ok(Self { path, values }),
            _ => Err(HostConfigError::NotAnObject(path)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up one key; missing keys give `None`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Look up several keys at once, in order.
    pub fn get_many(&self, keys: &[&str]) -> Vec<Option<Value>> {
        keys.iter().map(|k| self.get(k).cloned()).collect()
    }

    /// Convenience for keys that hold paths.
    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).and_then(|v| v.as_str()).map(PathBuf::from)
    }
}

/// Load this host's configuration from [`CONFIG_DIR_VAR`] and return the requested keys.
pub fn load_config(keys: &[&str]) -> Result<Vec<Option<Value>>, HostConfigError> {
    let dir = config_dir_from_env()?;
    Ok(HostConfig::load(&dir, None)?.get_many(keys))
}

/// Single-key variant of [`load_config`].
pub fn load_config_value(key: &str) -> Result<Option<Value>, HostConfigError> {
    let mut values = load_config(&[key])?;
    Ok(values.pop().flatten())
}
