//! The hidden `.version.data` record pins the geometry a partition was
//! created with. A partition written with one geometry cannot be reopened
//! with a larger block size or block count: slot offsets would no longer
//! line up with the data already on disk.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use snafu::ResultExt;
use tracing::debug;

use crate::err::{Result, UnknownIOSnafu, VersionMismatchSnafu};

pub const BACKEND_ID: &str = "tsumiki_block_backend";
pub const VERSION_NUMBER: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionFile {
    pub backend_id: String,
    pub version_number: u32,
    pub block_size: usize,
    pub max_blocks: u64,
    pub b_depth: usize,
    pub k_depth: usize,
}

impl VersionFile {
    pub fn current(block_size: usize, max_blocks: u64, b_depth: usize, k_depth: usize) -> Self {
        Self {
            backend_id: BACKEND_ID.to_string(),
            version_number: VERSION_NUMBER,
            block_size,
            max_blocks,
            b_depth,
            k_depth,
        }
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        let _ = writeln!(out, "backend_id {}", self.backend_id);
        let _ = writeln!(out, "version_number {}", self.version_number);
        let _ = writeln!(out, "block_size {}", self.block_size);
        let _ = writeln!(out, "max_blocks {}", self.max_blocks);
        let _ = writeln!(out, "b_depth {}", self.b_depth);
        let _ = writeln!(out, "k_depth {}", self.k_depth);
        fs::write(path, out).context(UnknownIOSnafu)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).context(UnknownIOSnafu)?;
        let mut version = VersionFile {
            backend_id: String::new(),
            version_number: 0,
            block_size: 0,
            max_blocks: 0,
            b_depth: 0,
            k_depth: 0,
        };
        for line in text.lines() {
            let Some((field, value)) = line.split_once(' ') else {
                continue;
            };
            let value = value.trim();
            match field {
                "backend_id" => version.backend_id = value.to_string(),
                "version_number" => version.version_number = parse(path, field, value)?,
                "block_size" => version.block_size = parse(path, field, value)?,
                "max_blocks" => version.max_blocks = parse(path, field, value)?,
                "b_depth" => version.b_depth = parse(path, field, value)?,
                "k_depth" => version.k_depth = parse(path, field, value)?,
                other => debug!("ignoring unknown version file field {other:?}"),
            }
        }
        Ok(version)
    }

    /// Startup check against the configured geometry. The configured block
    /// size and block count may not exceed what the partition was created
    /// with, and the nesting depths must match exactly.
    pub fn check(&self, block_size: usize, max_blocks: u64, b_depth: usize, k_depth: usize) -> Result<()> {
        if self.backend_id != BACKEND_ID {
            return VersionMismatchSnafu {
                reason: format!("partition belongs to backend {:?}", self.backend_id),
            }
            .fail();
        }
        if self.version_number != VERSION_NUMBER {
            return VersionMismatchSnafu {
                reason: format!("unsupported version {}", self.version_number),
            }
            .fail();
        }
        if block_size > self.block_size {
            return VersionMismatchSnafu {
                reason: format!(
                    "configured block_size {} exceeds stored {}",
                    block_size, self.block_size
                ),
            }
            .fail();
        }
        if max_blocks > self.max_blocks {
            return VersionMismatchSnafu {
                reason: format!(
                    "configured max_blocks {} exceeds stored {}",
                    max_blocks, self.max_blocks
                ),
            }
            .fail();
        }
        if b_depth != self.b_depth || k_depth != self.k_depth {
            return VersionMismatchSnafu {
                reason: format!(
                    "configured depths {}/{} differ from stored {}/{}",
                    b_depth, k_depth, self.b_depth, self.k_depth
                ),
            }
            .fail();
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(path: &Path, field: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        VersionMismatchSnafu {
            reason: format!("bad {field} value {value:?} in {}", path.display()),
        }
        .build()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".version.data");
        let version = VersionFile::current(1 << 20, 512, 2, 2);
        version.write_to(&path).unwrap();
        assert_eq!(VersionFile::load_from(&path).unwrap(), version);
    }

    #[test]
    fn check_enforces_geometry() {
        let stored = VersionFile::current(1024, 64, 2, 2);
        stored.check(1024, 64, 2, 2).unwrap();
        // shrinking the configured geometry is allowed
        stored.check(512, 32, 2, 2).unwrap();
        assert!(stored.check(2048, 64, 2, 2).is_err());
        assert!(stored.check(1024, 128, 2, 2).is_err());
        assert!(stored.check(1024, 64, 3, 2).is_err());
        assert!(stored.check(1024, 64, 2, 1).is_err());
    }

    #[test]
    fn check_rejects_foreign_backend() {
        let mut stored = VersionFile::current(1024, 64, 2, 2);
        stored.backend_id = "some_other_backend".to_string();
        assert!(stored.check(1024, 64, 2, 2).is_err());
    }
}
