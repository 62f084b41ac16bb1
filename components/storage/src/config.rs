use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tsumiki_common::{
    DEFAULT_B_DEPTH, DEFAULT_K_DEPTH, DEFAULT_MAX_BLOCKS, MAX_BLOCK_SIZE,
};
use tsumiki_utils::readable_size::ReadableSize;

use crate::err::{ConfigSnafu, Result};

pub const ENV_DATA_ROOT: &str = "TSUMIKI_DATA_ROOT";
pub const ENV_BLOCK_SIZE: &str = "TSUMIKI_BLOCK_SIZE";
pub const ENV_MAX_BLOCKS: &str = "TSUMIKI_MAX_BLOCKS";
pub const ENV_B_DEPTH: &str = "TSUMIKI_B_DEPTH";
pub const ENV_K_DEPTH: &str = "TSUMIKI_K_DEPTH";

/// Backend configuration. Unset fields fall back to the process
/// environment, then to defaults; `data_root` and `block_size` must come
/// from one of the two.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_root: Option<PathBuf>,
    pub block_size: Option<ReadableSize>,
    pub max_blocks: Option<u64>,
    pub b_depth: Option<usize>,
    pub k_depth: Option<usize>,
}

impl StorageConfig {
    pub fn with_data_root(self, data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: Some(data_root.into()),
            ..self
        }
    }

    pub fn with_block_size(self, block_size: ReadableSize) -> Self {
        Self {
            block_size: Some(block_size),
            ..self
        }
    }

    pub fn with_max_blocks(self, max_blocks: u64) -> Self {
        Self {
            max_blocks: Some(max_blocks),
            ..self
        }
    }

    pub(crate) fn resolve(&self) -> Result<Geometry> {
        let data_root = match &self.data_root {
            Some(root) => root.clone(),
            None => PathBuf::from(required_env(ENV_DATA_ROOT)?),
        };
        let block_size = match self.block_size {
            Some(size) => size,
            None => parse_env_value::<ReadableSize>(ENV_BLOCK_SIZE, required_env(ENV_BLOCK_SIZE)?)?,
        }
        .as_bytes_usize();
        let max_blocks = resolve_field(self.max_blocks, ENV_MAX_BLOCKS, DEFAULT_MAX_BLOCKS)?;
        let b_depth = resolve_field(self.b_depth, ENV_B_DEPTH, DEFAULT_B_DEPTH)?;
        let k_depth = resolve_field(self.k_depth, ENV_K_DEPTH, DEFAULT_K_DEPTH)?;

        if block_size == 0 || block_size > MAX_BLOCK_SIZE {
            return ConfigSnafu {
                reason: format!("block_size {block_size} out of range"),
            }
            .fail();
        }
        if max_blocks == 0 {
            return ConfigSnafu {
                reason: "max_blocks must be at least 1".to_string(),
            }
            .fail();
        }

        Ok(Geometry {
            data_root,
            block_size,
            max_blocks,
            b_depth,
            k_depth,
        })
    }
}

/// Fully resolved backend geometry.
#[derive(Debug, Clone)]
pub(crate) struct Geometry {
    pub data_root: PathBuf,
    pub block_size: usize,
    pub max_blocks: u64,
    pub b_depth: usize,
    pub k_depth: usize,
}

/// Environment lookup through [dotenvy], so a `.env` file next to the host
/// process works in development. An unset key is `Ok(None)`; a key that
/// exists but cannot be read is a config error.
fn env_var(key: &str) -> Result<Option<String>> {
    match dotenvy::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(dotenvy::Error::EnvVar(std::env::VarError::NotPresent)) => Ok(None),
        Err(e) => ConfigSnafu {
            reason: format!("unreadable environment variable {key}: {e}"),
        }
        .fail(),
    }
}

fn required_env(key: &str) -> Result<String> {
    env_var(key)?.ok_or_else(|| {
        ConfigSnafu {
            reason: format!("{key} must be set when the config leaves it unset"),
        }
        .build()
    })
}

/// Explicit value, else environment, else default.
fn resolve_field<T>(explicit: Option<T>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match explicit {
        Some(value) => Ok(value),
        None => match env_var(key)? {
            Some(raw) => parse_env_value(key, raw),
            None => Ok(default),
        },
    }
}

fn parse_env_value<T>(key: &str, raw: String) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e| {
        ConfigSnafu {
            reason: format!("bad {key} value {raw:?}: {e}"),
        }
        .build()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_config_resolves() {
        let cfg = StorageConfig::default()
            .with_data_root("/tmp/somewhere")
            .with_block_size(ReadableSize::mb(1));
        let geometry = cfg.resolve().unwrap();
        assert_eq!(geometry.data_root, PathBuf::from("/tmp/somewhere"));
        assert_eq!(geometry.block_size, 1 << 20);
        assert_eq!(geometry.max_blocks, DEFAULT_MAX_BLOCKS);
        assert_eq!(geometry.b_depth, 2);
        assert_eq!(geometry.k_depth, 2);
    }

    #[test]
    fn zero_geometry_rejected() {
        let cfg = StorageConfig::default()
            .with_data_root("/tmp/somewhere")
            .with_block_size(ReadableSize(0));
        assert!(cfg.resolve().is_err());

        let cfg = StorageConfig::default()
            .with_data_root("/tmp/somewhere")
            .with_block_size(ReadableSize::kb(4))
            .with_max_blocks(0);
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn parse_errors_name_the_key() {
        let err = parse_env_value::<u64>(ENV_MAX_BLOCKS, "many".to_string()).unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_BLOCKS));
    }
}
