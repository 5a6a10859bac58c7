//! Error taxonomy surfaced by device handles and configuration loading.
//!
//! OS errors never cross the handle boundary as raw errno values. The common
//! cases get their own variant and everything else is carried as the OS
//! description inside [`DeviceError::Other`].
use std::{io, path::PathBuf};

use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("not found")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    /// Explicit close, peer hangup and end-of-stream all collapse into this.
    #[error("closed")]
    Closed,

    #[error("busy")]
    Busy,

    #[error("not busy")]
    NotBusy,

    #[error("already closed")]
    AlreadyClosed,

    #[error("interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}

impl DeviceError {
    /// Maps a failed `open(2)` onto the handle taxonomy.
    pub(crate) fn from_open(err: io::Error) -> Self {
        match err.raw_os_error().map(Errno::from_raw) {
            Some(Errno::ENOENT) => Self::NotFound,
            Some(Errno::EACCES) => Self::PermissionDenied,
            Some(errno) => errno.into(),
            None => Self::Other(err.to_string()),
        }
    }
}

impl From<Errno> for DeviceError {
    fn from(errno: Errno) -> Self {
        Self::Other(errno.desc().to_owned())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    #[error("invalid toml config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid yaml config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported config format `{0}`")]
    UnsupportedFormat(String),

    #[error("config path {} has no extension", .0.display())]
    MissingExtension(PathBuf),

    #[error("no devices configured")]
    NoDevices,
}
