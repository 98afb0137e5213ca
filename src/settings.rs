use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{grid::GridKind, runtime::SystemKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("invalid value `{value}` for `{key}`")]
    Invalid { key: String, value: String },
    #[error("`{0}` must be positive")]
    NotPositive(String),
}

/// Startup configuration of a [`Context`](crate::context::Context).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Settings {
    pub system: SystemKind,
    /// Logical device layout used for block sizing and placement.
    pub cluster_shape: Vec<usize>,
    pub device_grid: GridKind,
    /// Worker count. Ignored by the serial system.
    pub num_devices: usize,
    /// Target size of one block in bytes.
    pub block_memory: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let num_devices = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1);
        Self {
            system: SystemKind::default(),
            cluster_shape: vec![1],
            device_grid: GridKind::default(),
            num_devices,
            block_memory: 64 << 20,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::Invalid {
        key: key.into(),
        value: value.into(),
    })
}

impl Settings {
    pub const SYSTEM: &'static str = "MOSAIC_SYSTEM";
    pub const CLUSTER_SHAPE: &'static str = "MOSAIC_CLUSTER_SHAPE";
    pub const DEVICE_GRID: &'static str = "MOSAIC_DEVICE_GRID";
    pub const NUM_DEVICES: &'static str = "MOSAIC_NUM_DEVICES";
    pub const BLOCK_MEMORY: &'static str = "MOSAIC_BLOCK_MEMORY";

    /// Defaults overridden by the `MOSAIC_*` environment variables.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_vars(std::env::vars())
    }

    /// Defaults overridden by matching `(key, value)` pairs. Unknown keys are ignored.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, SettingsError> {
        let mut settings = Self::default();
        for (key, value) in vars {
            match key.as_str() {
                Self::SYSTEM => settings.system = parse(&key, &value)?,
                Self::DEVICE_GRID => settings.device_grid = parse(&key, &value)?,
                Self::NUM_DEVICES => settings.num_devices = parse(&key, &value)?,
                Self::BLOCK_MEMORY => settings.block_memory = parse(&key, &value)?,
                Self::CLUSTER_SHAPE => {
                    settings.cluster_shape = value
                        .split(',')
                        .map(|axis| parse(&key, axis))
                        .collect::<Result<_, _>>()?
                }
                _ => continue,
            }
            log::debug!("{key} = {value}");
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.cluster_shape.is_empty() || self.cluster_shape.contains(&0) {
            return Err(SettingsError::NotPositive("cluster_shape".into()));
        }
        if self.num_devices == 0 {
            return Err(SettingsError::NotPositive("num_devices".into()));
        }
        if self.block_memory == 0 {
            return Err(SettingsError::NotPositive("block_memory".into()));
        }
        Ok(())
    }
}
