//! Uses clap to define the CLI interface declaratively.
use std::path::PathBuf;

use clap::Parser;

use crate::{
    conf::{Config, DeviceConf, OutputFormat},
    error::ConfigError,
};

const DEFAULT_CONFIG: &str = "evaio.toml";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// config file (.toml, .yaml or .json); defaults to evaio.toml
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// print one JSON object per event
    #[arg(long)]
    pub json: bool,

    /// stop each device after COUNT events
    #[arg(short = 'n', long, value_name = "COUNT")]
    pub count: Option<u64>,

    /// device nodes to read, replacing the devices from the config
    #[arg(value_name = "DEVICE")]
    pub devices: Vec<PathBuf>,
}

impl Cli {
    /// Builds the effective configuration from the config file and flags.
    pub fn resolve(&self) -> Result<Config, ConfigError> {
        let mut config = match (&self.config, self.devices.is_empty()) {
            (Some(path), _) => Config::load(path)?,
            (None, true) => Config::load(DEFAULT_CONFIG.as_ref())?,
            (None, false) => Config::default(),
        };

        if !self.devices.is_empty() {
            config.device = self
                .devices
                .iter()
                .cloned()
                .map(DeviceConf::from_path)
                .collect();
        }
        if self.json {
            config.format = OutputFormat::Json;
        }
        if let Some(count) = self.count {
            for dev in &mut config.device {
                dev.limit = Some(count);
            }
        }

        config.validate()?;
        Ok(config)
    }
}
