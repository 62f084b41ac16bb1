use std::str::FromStr;
use std::time::Duration;

use tsumiki_common::{
    DEFAULT_MANIFEST_SAVE_INTERVAL, DEFAULT_MAX_BUFFER_SIZE, DEFAULT_WRITERS_PER_UPLOAD,
    DEFAULT_WRITER_POOL_SIZE,
};
use tsumiki_utils::readable_size::ReadableSize;

use crate::err::{ConfigSnafu, Result};

pub const ENV_MAX_BUFFER_SIZE: &str = "TSUMIKI_UPLOAD_MAX_BUFFER_SIZE";
pub const ENV_MANIFEST_SAVE_INTERVAL_MS: &str = "TSUMIKI_MANIFEST_SAVE_INTERVAL_MS";
pub const ENV_WRITER_POOL_SIZE: &str = "TSUMIKI_WRITER_POOL_SIZE";
pub const ENV_WRITERS_PER_UPLOAD: &str = "TSUMIKI_WRITERS_PER_UPLOAD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Bytes an upload may hold in flight before new chunks are deferred.
    pub max_buffer_size: ReadableSize,
    /// How often the current manifest is pushed to the external collaborator.
    pub manifest_save_interval: Duration,
    /// Writers shared by every upload of the process.
    pub pool_size: usize,
    /// Writers one upload takes from the pool for its lifetime.
    pub writers_per_upload: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: ReadableSize(DEFAULT_MAX_BUFFER_SIZE as u64),
            manifest_save_interval: DEFAULT_MANIFEST_SAVE_INTERVAL,
            pool_size: DEFAULT_WRITER_POOL_SIZE,
            writers_per_upload: DEFAULT_WRITERS_PER_UPLOAD,
        }
    }
}

impl UploadConfig {
    /// Defaults overlaid with any process-environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(size) = env_override(ENV_MAX_BUFFER_SIZE)? {
            config.max_buffer_size = size;
        }
        if let Some(ms) = env_override::<u64>(ENV_MANIFEST_SAVE_INTERVAL_MS)? {
            config.manifest_save_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_override(ENV_WRITER_POOL_SIZE)? {
            config.pool_size = n;
        }
        if let Some(n) = env_override(ENV_WRITERS_PER_UPLOAD)? {
            config.writers_per_upload = n;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 || self.writers_per_upload == 0 {
            return ConfigSnafu {
                reason: "writer pool and per-upload writer count must be at least 1".to_string(),
            }
            .fail();
        }
        if self.writers_per_upload > self.pool_size {
            return ConfigSnafu {
                reason: format!(
                    "writers_per_upload {} exceeds pool size {}",
                    self.writers_per_upload, self.pool_size
                ),
            }
            .fail();
        }
        if self.max_buffer_size.as_bytes() == 0 {
            return ConfigSnafu {
                reason: "max_buffer_size must be positive".to_string(),
            }
            .fail();
        }
        Ok(())
    }
}

/// Parsed environment override through [dotenvy] (a `.env` file works in
/// development). An unset key is `Ok(None)`; an unreadable or unparseable
/// one is a config error.
fn env_override<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = match dotenvy::var(key) {
        Ok(value) => value,
        Err(dotenvy::Error::EnvVar(std::env::VarError::NotPresent)) => return Ok(None),
        Err(e) => {
            return ConfigSnafu {
                reason: format!("unreadable environment variable {key}: {e}"),
            }
            .fail()
        }
    };
    raw.parse().map(Some).map_err(|e| {
        ConfigSnafu {
            reason: format!("bad {key} value {raw:?}: {e}"),
        }
        .build()
    })
}
