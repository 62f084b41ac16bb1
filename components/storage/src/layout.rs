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

//! Maps `(uuid, block_number)` to `(file, offset)` and performs the
//! positioned reads and writes. Up to `max_blocks` consecutive blocks of one
//! object pack into a single host file; slot `max_blocks` is reserved for
//! the trailer record that marks a file as possibly holed.
//!
//! All I/O here is synchronous `std::fs`; async callers go through
//! `spawn_blocking`. Files are opened per call, no handle is held across
//! calls.

use std::fs::{self, File, OpenOptions, Permissions};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::debug;
use tsumiki_common::{group_slot, BlockNumber, HEADER_SIZE, TMP_WRITE_SUFFIX};
use tsumiki_types::BlockKey;
use uuid::Uuid;

use crate::codec;
use crate::err::{InvalidUserArgumentSnafu, NotFoundSnafu, Result, UnknownIOSnafu};
use crate::path::{encode, nest};

/// Marker record written at the trailer slot the first time a file is
/// written out of order. Its presence is permanent: later sequential
/// rewrites do not clear it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Trailer {
    written_sequentially: bool,
}

#[derive(Debug, Clone)]
pub struct FileLayout {
    partition_dir: PathBuf,
    block_size: usize,
    max_blocks: u64,
    b_depth: usize,
    k_depth: usize,
}

impl FileLayout {
    pub fn new(
        partition_dir: PathBuf,
        block_size: usize,
        max_blocks: u64,
        b_depth: usize,
        k_depth: usize,
    ) -> Self {
        Self {
            partition_dir,
            block_size,
            max_blocks,
            b_depth,
            k_depth,
        }
    }

    pub fn partition_dir(&self) -> &Path {
        &self.partition_dir
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn max_blocks(&self) -> u64 {
        self.max_blocks
    }

    pub fn b_depth(&self) -> usize {
        self.b_depth
    }

    pub fn k_depth(&self) -> usize {
        self.k_depth
    }

    /// Reserved width of one block slot, header included.
    fn slot_width(&self) -> u64 {
        (HEADER_SIZE + self.block_size) as u64
    }

    fn slot_offset(&self, n: BlockNumber) -> u64 {
        group_slot(n, self.max_blocks) * self.slot_width()
    }

    fn trailer_offset(&self) -> u64 {
        self.max_blocks * self.slot_width()
    }

    pub fn bucket_dir(&self, bucket: &[u8]) -> PathBuf {
        let token = encode(bucket);
        let mut dir = self.partition_dir.clone();
        for component in nest(&token, self.b_depth) {
            dir.push(component);
        }
        dir.push(token);
        dir
    }

    fn key_path(&self, bucket: &[u8], key_token: &str) -> PathBuf {
        let mut path = self.bucket_dir(bucket);
        for component in nest(key_token, self.k_depth) {
            path.push(component);
        }
        path.push(key_token);
        path
    }

    /// Host file holding `key`'s group.
    pub fn block_file_path(&self, bucket: &[u8], key: &BlockKey) -> PathBuf {
        let group = key.group_key(self.max_blocks);
        self.key_path(bucket, &encode(&group.encode()))
    }

    pub fn plain_path(&self, bucket: &[u8], key: &[u8]) -> PathBuf {
        self.key_path(bucket, &encode(key))
    }

    // ===== block operations

    /// Reads one block. Every failure mode short of a config error reports
    /// as not-found: missing or tombstoned file, short read, bad checksum.
    pub fn read_block(&self, bucket: &[u8], key: &BlockKey) -> Result<Vec<u8>> {
        let path = self.block_file_path(bucket, key);
        let file = File::open(&path).map_err(|_| NotFoundSnafu.build())?;
        let md = file.metadata().map_err(|_| NotFoundSnafu.build())?;
        if is_tombstoned(&md) {
            return NotFoundSnafu.fail();
        }

        let mut buf = vec![0u8; self.slot_width() as usize];
        let filled = read_at_full(&file, &mut buf, self.slot_offset(key.number))
            .map_err(|_| NotFoundSnafu.build())?;
        let value = codec::unpack(&buf[..filled])?;
        Ok(value.to_vec())
    }

    /// Writes one block at its deterministic slot. A write that is not the
    /// next sequential slot of the file also stamps the trailer record so
    /// enumerators know the file may contain holes. A tombstone request
    /// flips the marker bit instead of writing data. Puts against an
    /// already tombstoned file are accepted and ignored.
    pub fn put_block(
        &self,
        bucket: &[u8],
        key: &BlockKey,
        value: &[u8],
        tombstone_request: bool,
    ) -> Result<()> {
        snafu::ensure!(
            value.len() <= self.block_size,
            InvalidUserArgumentSnafu {
                len: value.len(),
                block_size: self.block_size,
            }
        );

        let path = self.block_file_path(bucket, key);
        let md = match fs::metadata(&path) {
            Ok(md) => {
                if is_tombstoned(&md) {
                    return Ok(());
                }
                Some(md)
            }
            Err(_) => None,
        };

        if tombstone_request {
            return self.tombstone_file(&path, md);
        }

        let out_of_order = !self.is_next_sequential(key.number, md.as_ref());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context(UnknownIOSnafu)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(&path)
            .context(UnknownIOSnafu)?;

        let packed = codec::pack(value, self.block_size)?;
        file.write_all_at(&packed, self.slot_offset(key.number))
            .context(UnknownIOSnafu)?;

        if out_of_order {
            debug!("out-of-order write of block {}, stamping trailer", key);
            self.write_trailer(&file)?;
        }
        Ok(())
    }

    /// Unlinks the group file. Every sibling block packed into the same
    /// file goes with it; callers delete the rest of the group promptly.
    pub fn delete_block(&self, bucket: &[u8], key: &BlockKey) -> Result<()> {
        let path = self.block_file_path(bucket, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(UnknownIOSnafu),
        }
    }

    /// Block numbers present in the group file starting at `base`.
    ///
    /// A file whose size stays under the trailer offset was written
    /// sequentially and is dense, so its population is implied by its size.
    /// Once the size reaches the trailer offset the file may have holes and
    /// each slot is probed individually.
    pub fn enumerate_chunks_in_file(
        &self,
        bucket: &[u8],
        uuid: &Uuid,
        base: BlockNumber,
    ) -> Result<Vec<BlockNumber>> {
        let group = BlockKey::new(*uuid, base);
        let path = self.block_file_path(bucket, &group);
        let md = match fs::metadata(&path) {
            Ok(md) => md,
            Err(_) => return Ok(vec![]),
        };
        if is_tombstoned(&md) || md.len() == 0 {
            return Ok(vec![]);
        }

        let max_block = (md.len() - 1) / self.slot_width();
        if max_block >= self.max_blocks {
            let mut present = Vec::new();
            for i in 0..self.max_blocks {
                let key = BlockKey::new(*uuid, base + i);
                if self.read_block(bucket, &key).is_ok() {
                    present.push(base + i);
                }
            }
            Ok(present)
        } else {
            Ok((0..=max_block).map(|i| base + i).collect())
        }
    }

    // ===== plain operations

    pub fn plain_get(&self, bucket: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let path = self.plain_path(bucket, key);
        let md = fs::metadata(&path).map_err(|_| NotFoundSnafu.build())?;
        if is_tombstoned(&md) {
            return NotFoundSnafu.fail();
        }
        fs::read(&path).map_err(|_| NotFoundSnafu.build())
    }

    /// Writes to `<path>.tmpwrite` then renames so readers never observe a
    /// half-written value.
    pub fn plain_put(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        let path = self.plain_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context(UnknownIOSnafu)?;
        }
        let tmp = tmp_write_path(&path);
        fs::write(&tmp, value).context(UnknownIOSnafu)?;
        fs::rename(&tmp, &path).context(UnknownIOSnafu)
    }

    pub fn plain_delete(&self, bucket: &[u8], key: &[u8]) -> Result<()> {
        let path = self.plain_path(bucket, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(UnknownIOSnafu),
        }
    }

    // ===== internals

    /// A write is in order iff it lands on the very next unwritten slot:
    /// slot 0 of a fresh file, or one past the highest slot implied by the
    /// current file size.
    fn is_next_sequential(&self, n: BlockNumber, md: Option<&fs::Metadata>) -> bool {
        let slot = group_slot(n, self.max_blocks);
        match md {
            None => slot == 0,
            Some(md) if md.len() == 0 => slot == 0,
            Some(md) => slot == (md.len() - 1) / self.slot_width() + 1,
        }
    }

    fn tombstone_file(&self, path: &Path, md: Option<fs::Metadata>) -> Result<()> {
        let md = match md {
            Some(md) => md,
            None => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).context(UnknownIOSnafu)?;
                }
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .mode(0o600)
                    .open(path)
                    .context(UnknownIOSnafu)?;
                file.metadata().context(UnknownIOSnafu)?
            }
        };
        fs::set_permissions(path, Permissions::from_mode(md.mode() | TOMBSTONE_BIT))
            .context(UnknownIOSnafu)
    }

    fn write_trailer(&self, file: &File) -> Result<()> {
        let record = Trailer {
            written_sequentially: false,
        };
        let encoded = bincode::serialize(&record).expect("trailer record serializes");
        let packed = codec::pack(&encoded, self.block_size)?;
        let mut footer = [0u8; 4];
        BigEndian::write_u32(&mut footer, packed.len() as u32);

        let offset = self.trailer_offset();
        file.write_all_at(&packed, offset).context(UnknownIOSnafu)?;
        file.write_all_at(&footer, offset + packed.len() as u64)
            .context(UnknownIOSnafu)
    }
}

/// Tombstones reuse the setgid mode bit; the filesystem gives us no richer
/// per-file metadata to work with.
const TOMBSTONE_BIT: u32 = libc::S_ISGID as u32;

pub fn is_tombstoned(md: &fs::Metadata) -> bool {
    md.permissions().mode() & TOMBSTONE_BIT != 0
}

fn tmp_write_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .expect("key paths always have a file name")
        .to_os_string();
    name.push(TMP_WRITE_SUFFIX);
    path.with_file_name(name)
}

/// Reads as much of `buf` as the file holds at `offset`. A slot at the end
/// of a file is routinely shorter than its reserved width.
fn read_at_full(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsumiki_common::HEADER_SIZE;

    fn layout(dir: &Path, block_size: usize, max_blocks: u64) -> FileLayout {
        FileLayout::new(dir.to_path_buf(), block_size, max_blocks, 2, 2)
    }

    #[test]
    fn sequential_two_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let fl = layout(dir.path(), 22, 512);
        let uuid = Uuid::new_v4();
        let b0 = vec![0x2A; 22];
        let b1 = vec![0x2B; 22];

        fl.put_block(b"0b:x", &BlockKey::new(uuid, 0), &b0, false).unwrap();
        fl.put_block(b"0b:x", &BlockKey::new(uuid, 1), &b1, false).unwrap();

        assert_eq!(fl.read_block(b"0b:x", &BlockKey::new(uuid, 0)).unwrap(), b0);
        assert_eq!(fl.read_block(b"0b:x", &BlockKey::new(uuid, 1)).unwrap(), b1);

        // dense file, no trailer: exactly two slots long
        let path = fl.block_file_path(b"0b:x", &BlockKey::new(uuid, 0));
        assert_eq!(fs::metadata(&path).unwrap().len(), 2 * (HEADER_SIZE + 22) as u64);
        assert_eq!(
            fl.enumerate_chunks_in_file(b"0b:x", &uuid, 0).unwrap(),
            vec![0, 1]
        );
    }

    #[test]
    fn out_of_order_stamps_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let fl = layout(dir.path(), 22, 512);
        let uuid = Uuid::new_v4();
        let b0 = vec![0x2A; 22];
        let b1 = vec![0x2B; 22];

        fl.put_block(b"0b:x", &BlockKey::new(uuid, 1), &b1, false).unwrap();
        fl.put_block(b"0b:x", &BlockKey::new(uuid, 0), &b0, false).unwrap();

        assert_eq!(fl.read_block(b"0b:x", &BlockKey::new(uuid, 0)).unwrap(), b0);
        assert_eq!(fl.read_block(b"0b:x", &BlockKey::new(uuid, 1)).unwrap(), b1);

        let path = fl.block_file_path(b"0b:x", &BlockKey::new(uuid, 0));
        let size = fs::metadata(&path).unwrap().len();
        assert!(size >= 512 * (HEADER_SIZE + 22) as u64);

        // holes are probed, not assumed dense
        assert_eq!(
            fl.enumerate_chunks_in_file(b"0b:x", &uuid, 0).unwrap(),
            vec![0, 1]
        );
    }

    #[test]
    fn skipped_block_is_a_hole() {
        let dir = tempfile::tempdir().unwrap();
        let fl = layout(dir.path(), 16, 64);
        let uuid = Uuid::new_v4();

        fl.put_block(b"0b:x", &BlockKey::new(uuid, 0), b"aaaa", false).unwrap();
        fl.put_block(b"0b:x", &BlockKey::new(uuid, 2), b"cccc", false).unwrap();

        assert_eq!(
            fl.enumerate_chunks_in_file(b"0b:x", &uuid, 0).unwrap(),
            vec![0, 2]
        );
        assert!(fl
            .read_block(b"0b:x", &BlockKey::new(uuid, 1))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn oversize_put_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let fl = layout(dir.path(), 10, 512);
        let uuid = Uuid::nil();
        let err = fl
            .put_block(b"0b:x", &BlockKey::new(uuid, 0), &[0u8; 11], false)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::err::Error::InvalidUserArgument { len: 11, block_size: 10, .. }
        ));
        let path = fl.block_file_path(b"0b:x", &BlockKey::new(uuid, 0));
        assert!(!path.exists());
    }

    #[test]
    fn tombstone_hides_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let fl = layout(dir.path(), 16, 64);
        let uuid = Uuid::new_v4();

        fl.put_block(b"0b:x", &BlockKey::new(uuid, 0), b"v0", false).unwrap();
        fl.put_block(b"0b:x", &BlockKey::new(uuid, 1), b"v1", false).unwrap();
        fl.put_block(b"0b:x", &BlockKey::new(uuid, 1), b"", true).unwrap();

        for n in 0..2 {
            assert!(fl
                .read_block(b"0b:x", &BlockKey::new(uuid, n))
                .unwrap_err()
                .is_not_found());
        }
        assert!(fl.enumerate_chunks_in_file(b"0b:x", &uuid, 0).unwrap().is_empty());

        // further puts against the tombstoned group are accepted no-ops
        let path = fl.block_file_path(b"0b:x", &BlockKey::new(uuid, 0));
        let before = fs::metadata(&path).unwrap().len();
        fl.put_block(b"0b:x", &BlockKey::new(uuid, 0), b"v0-again", false).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), before);
    }

    #[test]
    fn tombstone_without_prior_file_creates_marker() {
        let dir = tempfile::tempdir().unwrap();
        let fl = layout(dir.path(), 16, 64);
        let uuid = Uuid::new_v4();

        fl.put_block(b"0b:x", &BlockKey::new(uuid, 3), b"", true).unwrap();
        let path = fl.block_file_path(b"0b:x", &BlockKey::new(uuid, 3));
        assert!(is_tombstoned(&fs::metadata(&path).unwrap()));
        assert!(fl
            .read_block(b"0b:x", &BlockKey::new(uuid, 3))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn delete_block_unlinks_group() {
        let dir = tempfile::tempdir().unwrap();
        let fl = layout(dir.path(), 16, 64);
        let uuid = Uuid::new_v4();

        fl.put_block(b"0b:x", &BlockKey::new(uuid, 0), b"v0", false).unwrap();
        fl.put_block(b"0b:x", &BlockKey::new(uuid, 1), b"v1", false).unwrap();
        fl.delete_block(b"0b:x", &BlockKey::new(uuid, 1)).unwrap();

        assert!(fl
            .read_block(b"0b:x", &BlockKey::new(uuid, 0))
            .unwrap_err()
            .is_not_found());
        // idempotent
        fl.delete_block(b"0b:x", &BlockKey::new(uuid, 1)).unwrap();
    }

    #[test]
    fn groups_split_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let fl = layout(dir.path(), 16, 4);
        let uuid = Uuid::new_v4();

        for n in 0..6u64 {
            fl.put_block(b"0b:x", &BlockKey::new(uuid, n), &[n as u8; 4], false)
                .unwrap();
        }
        let first = fl.block_file_path(b"0b:x", &BlockKey::new(uuid, 0));
        let second = fl.block_file_path(b"0b:x", &BlockKey::new(uuid, 4));
        assert_ne!(first, second);
        assert_eq!(fl.enumerate_chunks_in_file(b"0b:x", &uuid, 0).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(fl.enumerate_chunks_in_file(b"0b:x", &uuid, 4).unwrap(), vec![4, 5]);
        assert_eq!(
            fl.read_block(b"0b:x", &BlockKey::new(uuid, 5)).unwrap(),
            vec![5u8; 4]
        );
    }

    #[test]
    fn plain_round_trip_and_atomic_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let fl = layout(dir.path(), 16, 64);

        fl.plain_put(b"settings", b"mykey", b"myvalue").unwrap();
        assert_eq!(fl.plain_get(b"settings", b"mykey").unwrap(), b"myvalue");

        // no temp remnant next to the value
        let parent = fl.plain_path(b"settings", b"mykey");
        let mut names: Vec<_> = fs::read_dir(parent.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names.len(), 1);
        assert!(!names[0].ends_with(TMP_WRITE_SUFFIX));

        fl.plain_delete(b"settings", b"mykey").unwrap();
        assert!(fl.plain_get(b"settings", b"mykey").unwrap_err().is_not_found());
        fl.plain_delete(b"settings", b"mykey").unwrap();
    }

    #[test]
    fn rewriting_an_existing_slot_counts_as_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let fl = layout(dir.path(), 16, 64);
        let uuid = Uuid::new_v4();

        fl.put_block(b"0b:x", &BlockKey::new(uuid, 0), b"v0", false).unwrap();
        fl.put_block(b"0b:x", &BlockKey::new(uuid, 0), b"v0x", false).unwrap();
        let path = fl.block_file_path(b"0b:x", &BlockKey::new(uuid, 0));
        let size = fs::metadata(&path).unwrap().len();
        assert!(size > 64 * (HEADER_SIZE + 16) as u64);
        assert_eq!(fl.read_block(b"0b:x", &BlockKey::new(uuid, 0)).unwrap(), b"v0x");
        assert_eq!(fl.enumerate_chunks_in_file(b"0b:x", &uuid, 0).unwrap(), vec![0]);
    }
}
