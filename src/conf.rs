//! The serializable configuration data structures used for setup.
use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{device::ClosePolicy, error::ConfigError};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerKind {
    Log(PathBuf),
    #[default]
    StdOut,
    StdErr,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceConf {
    pub path: PathBuf,

    #[serde(default)]
    pub name: Option<String>,

    /// Only events whose kind is listed here are emitted. Empty means all.
    #[serde(default)]
    pub kinds: Vec<String>,

    /// Stop reading after this many emitted events.
    #[serde(default)]
    pub limit: Option<u64>,
}

impl DeviceConf {
    pub fn from_path(path: PathBuf) -> Self {
        Self {
            path,
            name: None,
            kinds: Vec::new(),
            limit: None,
        }
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.path.display().to_string(),
        }
    }

    pub fn accepts(&self, kind: Option<&str>) -> bool {
        if self.kinds.is_empty() {
            return true;
        }
        kind.is_some_and(|kind| self.kinds.iter().any(|k| k.eq_ignore_ascii_case(kind)))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(default = "default_cfg_ver")]
    pub version: u32,

    #[serde(default)]
    pub close_policy: ClosePolicy,

    #[serde(default)]
    pub format: OutputFormat,

    #[serde(default)]
    pub output: ConsumerKind,

    #[serde(default)]
    pub device: Vec<DeviceConf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_cfg_ver(),
            close_policy: ClosePolicy::default(),
            format: OutputFormat::default(),
            output: ConsumerKind::default(),
            device: Vec::new(),
        }
    }
}

impl Config {
    /// Parses a config file, picking the format from its extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| ConfigError::MissingExtension(path.to_path_buf()))?;
        let text = fs::read_to_string(path)?;

        let config: Config = match ext {
            "toml" => toml::from_str(&text)?,
            "yaml" | "yml" => serde_yaml::from_str(&text)?,
            "json" => serde_json::from_str(&text)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_owned())),
        };
        tracing::debug!(path = %path.display(), devices = config.device.len(), "loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        Ok(())
    }
}

fn default_cfg_ver() -> u32 {
    1
}
