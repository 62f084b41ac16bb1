// Copyright 2025 tsumiki
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The per-partition facade. Routes `get`/`put`/`delete` to the block or
//! plain path by bucket prefix and key width, owns partition startup
//! (directory creation, case probe, version file) and the fold surface.

use std::fs;
use std::sync::Arc;

use serde::Serialize;
use snafu::ResultExt;
use tracing::{debug, info};
use tsumiki_common::{is_block_bucket, BLOCK_KEY_BYTES, VERSION_FILE_NAME};
use tsumiki_types::{BlockKey, Capabilities};

use crate::config::StorageConfig;
use crate::err::{Result, UnknownIOSnafu};
use crate::fold;
use crate::layout::FileLayout;
use crate::path;
use crate::version::VersionFile;

pub struct Backend {
    partition: String,
    layout: FileLayout,
}

impl Backend {
    /// Brings a partition up: resolves configuration, creates the partition
    /// directory, refuses case-insensitive filesystems, and creates or
    /// validates the version file.
    pub fn start(partition: &str, config: &StorageConfig) -> Result<Backend> {
        let geometry = config.resolve()?;
        let partition_dir = geometry.data_root.join(partition);
        fs::create_dir_all(&partition_dir).context(UnknownIOSnafu)?;
        path::assert_case_sensitive(&partition_dir)?;

        let version_path = partition_dir.join(VERSION_FILE_NAME);
        if version_path.exists() {
            let stored = VersionFile::load_from(&version_path)?;
            stored.check(
                geometry.block_size,
                geometry.max_blocks,
                geometry.b_depth,
                geometry.k_depth,
            )?;
        } else {
            VersionFile::current(
                geometry.block_size,
                geometry.max_blocks,
                geometry.b_depth,
                geometry.k_depth,
            )
            .write_to(&version_path)?;
        }

        info!(
            "started partition {partition} at {} (block_size={}, max_blocks={})",
            partition_dir.display(),
            geometry.block_size,
            geometry.max_blocks
        );
        Ok(Backend {
            partition: partition.to_string(),
            layout: FileLayout::new(
                partition_dir,
                geometry.block_size,
                geometry.max_blocks,
                geometry.b_depth,
                geometry.k_depth,
            ),
        })
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    pub fn block_size(&self) -> usize {
        self.layout.block_size()
    }

    fn as_block_key(bucket: &[u8], key: &[u8]) -> Option<BlockKey> {
        if is_block_bucket(bucket) && key.len() == BLOCK_KEY_BYTES {
            BlockKey::decode(key).ok()
        } else {
            None
        }
    }

    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        match Self::as_block_key(bucket, key) {
            Some(block) => self.layout.read_block(bucket, &block),
            None => self.layout.plain_get(bucket, key),
        }
    }

    pub fn put(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        match Self::as_block_key(bucket, key) {
            Some(block) => self.layout.put_block(bucket, &block, value, false),
            None => self.layout.plain_put(bucket, key, value),
        }
    }

    /// Marks a block key deleted without reclaiming its file. Plain keys
    /// have no tombstone representation and are simply deleted.
    pub fn put_tombstone(&self, bucket: &[u8], key: &[u8]) -> Result<()> {
        match Self::as_block_key(bucket, key) {
            Some(block) => self.layout.put_block(bucket, &block, &[], true),
            None => self.layout.plain_delete(bucket, key),
        }
    }

    pub fn delete(&self, bucket: &[u8], key: &[u8]) -> Result<()> {
        match Self::as_block_key(bucket, key) {
            Some(block) => self.layout.delete_block(bucket, &block),
            None => self.layout.plain_delete(bucket, key),
        }
    }

    pub fn fold_buckets<A, F>(&self, acc: A, f: F) -> Result<A>
    where
        F: FnMut(&[u8], A) -> A,
    {
        fold::fold_buckets(&self.layout, acc, f)
    }

    pub fn fold_keys<A, F>(&self, acc: A, f: F) -> Result<A>
    where
        F: FnMut(&[u8], &[u8], A) -> A,
    {
        fold::fold_keys(&self.layout, acc, f)
    }

    pub fn fold_objects<A, F>(&self, acc: A, f: F) -> Result<A>
    where
        F: FnMut(&[u8], &[u8], Vec<u8>, A) -> A,
    {
        fold::fold_objects(&self.layout, acc, f)
    }

    /// The fold driver as a thunk, for hosts that run folds on their own
    /// schedule.
    pub fn fold_buckets_lazy<A, F>(self: &Arc<Self>, acc: A, f: F) -> impl FnOnce() -> Result<A>
    where
        A: Send + 'static,
        F: FnMut(&[u8], A) -> A + Send + 'static,
    {
        let backend = Arc::clone(self);
        move || fold::fold_buckets(&backend.layout, acc, f)
    }

    pub fn fold_keys_lazy<A, F>(self: &Arc<Self>, acc: A, f: F) -> impl FnOnce() -> Result<A>
    where
        A: Send + 'static,
        F: FnMut(&[u8], &[u8], A) -> A + Send + 'static,
    {
        let backend = Arc::clone(self);
        move || fold::fold_keys(&backend.layout, acc, f)
    }

    pub fn fold_objects_lazy<A, F>(self: &Arc<Self>, acc: A, f: F) -> impl FnOnce() -> Result<A>
    where
        A: Send + 'static,
        F: FnMut(&[u8], &[u8], Vec<u8>, A) -> A + Send + 'static,
    {
        let backend = Arc::clone(self);
        move || fold::fold_objects(&backend.layout, acc, f)
    }

    pub fn is_empty(&self) -> Result<bool> {
        fold::is_empty(&self.layout)
    }

    /// Removes everything in the partition and brings the directory back
    /// empty, version file re-stamped.
    pub fn destroy(&self) -> Result<()> {
        let dir = self.layout.partition_dir();
        debug!("destroying partition {} at {}", self.partition, dir.display());
        match fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(UnknownIOSnafu),
        }
        fs::create_dir_all(dir).context(UnknownIOSnafu)?;
        VersionFile::current(
            self.layout.block_size(),
            self.layout.max_blocks(),
            self.layout.b_depth(),
            self.layout.k_depth(),
        )
        .write_to(&dir.join(VERSION_FILE_NAME))
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            async_fold: true,
            write_once_keys: true,
            put_plus_object: true,
        }
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            partition: self.partition.clone(),
            partition_dir: self.layout.partition_dir().display().to_string(),
            block_size: self.layout.block_size(),
            max_blocks: self.layout.max_blocks(),
            b_depth: self.layout.b_depth(),
            k_depth: self.layout.k_depth(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub partition: String,
    pub partition_dir: String,
    pub block_size: usize,
    pub max_blocks: u64,
    pub b_depth: usize,
    pub k_depth: usize,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("partition", &self.partition)
            .field("dir", &self.layout.partition_dir())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tsumiki_utils::readable_size::ReadableSize;
    use uuid::Uuid;

    fn start(dir: &Path, block_size: u64) -> Backend {
        let config = StorageConfig::default()
            .with_data_root(dir)
            .with_block_size(ReadableSize(block_size))
            .with_max_blocks(64);
        Backend::start("p0", &config).unwrap()
    }

    fn block_key(uuid: Uuid, n: u64) -> Vec<u8> {
        BlockKey::new(uuid, n).encode().to_vec()
    }

    #[test]
    fn block_round_trip_through_facade() {
        let dir = tempfile::tempdir().unwrap();
        let backend = start(dir.path(), 1024);
        let uuid = Uuid::new_v4();

        backend.put(b"0b:media", &block_key(uuid, 0), b"first").unwrap();
        assert_eq!(backend.get(b"0b:media", &block_key(uuid, 0)).unwrap(), b"first");

        // a 24-byte key in a plain bucket is still a plain key
        backend.put(b"media", &block_key(uuid, 0), b"plain").unwrap();
        assert_eq!(backend.get(b"media", &block_key(uuid, 0)).unwrap(), b"plain");
    }

    #[test]
    fn oversize_block_put_is_rejected_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let backend = start(dir.path(), 10);
        let key = block_key(Uuid::nil(), 0);

        let err = backend.put(b"0b:media", &key, &[0u8; 11]).unwrap_err();
        assert!(matches!(
            err,
            crate::err::Error::InvalidUserArgument { .. }
        ));
        assert!(backend.is_empty().unwrap());
    }

    #[test]
    fn fold_buckets_dedups_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = start(dir.path(), 1024);

        backend.put(b"C", b"k", b"v").unwrap();
        backend.put(b"A", b"k", b"v").unwrap();
        backend.put(b"B", b"k1", b"v").unwrap();
        backend.put(b"B", b"k2", b"v").unwrap();

        let buckets = backend
            .fold_buckets(Vec::new(), |bucket, mut acc| {
                acc.push(bucket.to_vec());
                acc
            })
            .unwrap();
        assert_eq!(buckets, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
    }

    #[test]
    fn fold_objects_is_sorted_across_bucket_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let backend = start(dir.path(), 1024);
        let uuid = Uuid::new_v4();

        backend.put(b"animals", b"bee", b"buzz").unwrap();
        backend.put(b"animals", b"ant", b"march").unwrap();
        backend.put(b"0b:media", &block_key(uuid, 1), b"block-1").unwrap();
        backend.put(b"0b:media", &block_key(uuid, 0), b"block-0").unwrap();

        let entries = backend
            .fold_objects(Vec::new(), |bucket, key, value, mut acc| {
                acc.push((bucket.to_vec(), key.to_vec(), value));
                acc
            })
            .unwrap();
        // "0b:media" sorts before "animals"; block keys ascend by number
        assert_eq!(
            entries,
            vec![
                (b"0b:media".to_vec(), block_key(uuid, 0), b"block-0".to_vec()),
                (b"0b:media".to_vec(), block_key(uuid, 1), b"block-1".to_vec()),
                (b"animals".to_vec(), b"ant".to_vec(), b"march".to_vec()),
                (b"animals".to_vec(), b"bee".to_vec(), b"buzz".to_vec()),
            ]
        );
    }

    #[test]
    fn deleting_one_block_hides_the_group_from_folds() {
        let dir = tempfile::tempdir().unwrap();
        let backend = start(dir.path(), 1024);
        let uuid = Uuid::new_v4();

        backend.put(b"0b:media", &block_key(uuid, 0), b"v0").unwrap();
        backend.put(b"0b:media", &block_key(uuid, 1), b"v1").unwrap();
        backend.delete(b"0b:media", &block_key(uuid, 1)).unwrap();

        let count = backend.fold_objects(0usize, |_, _, _, acc| acc + 1).unwrap();
        assert_eq!(count, 0);
        assert!(backend.is_empty().unwrap());
    }

    #[test]
    fn tombstone_hides_without_unlinking() {
        let dir = tempfile::tempdir().unwrap();
        let backend = start(dir.path(), 1024);
        let uuid = Uuid::new_v4();
        let key = block_key(uuid, 0);

        backend.put(b"0b:media", &key, b"v0").unwrap();
        backend.put_tombstone(b"0b:media", &key).unwrap();

        assert!(backend.get(b"0b:media", &key).unwrap_err().is_not_found());
        assert!(backend.is_empty().unwrap());
        // the marker file itself is still on disk
        assert!(backend
            .layout()
            .block_file_path(b"0b:media", &BlockKey::new(uuid, 0))
            .exists());
    }

    #[test]
    fn lazy_fold_runs_later() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(start(dir.path(), 1024));
        backend.put(b"b", b"k", b"v").unwrap();

        let thunk = backend.fold_keys_lazy(0usize, |_, _, acc| acc + 1);
        drop(backend);
        assert_eq!(thunk().unwrap(), 1);
    }

    #[test]
    fn destroy_resets_partition() {
        let dir = tempfile::tempdir().unwrap();
        let backend = start(dir.path(), 1024);
        backend.put(b"b", b"k", b"v").unwrap();
        assert!(!backend.is_empty().unwrap());

        backend.destroy().unwrap();
        assert!(backend.is_empty().unwrap());
        assert!(backend.get(b"b", b"k").unwrap_err().is_not_found());
        // still startable with the same geometry
        start(dir.path(), 1024);
    }

    #[test]
    fn version_file_guards_geometry() {
        let dir = tempfile::tempdir().unwrap();
        start(dir.path(), 1024);

        // growing block_size past the stored geometry must refuse startup
        let config = StorageConfig::default()
            .with_data_root(dir.path())
            .with_block_size(ReadableSize(2048))
            .with_max_blocks(64);
        assert!(Backend::start("p0", &config).is_err());

        // shrinking is fine
        let config = StorageConfig::default()
            .with_data_root(dir.path())
            .with_block_size(ReadableSize(512))
            .with_max_blocks(64);
        Backend::start("p0", &config).unwrap();
    }

    #[test]
    fn capabilities_are_advertised() {
        let dir = tempfile::tempdir().unwrap();
        let backend = start(dir.path(), 1024);
        let caps = backend.capabilities();
        assert!(caps.async_fold);
        assert!(caps.write_once_keys);
        assert!(caps.put_plus_object);
    }
}
