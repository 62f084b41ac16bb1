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

use std::time::Duration;

pub const TSUMIKI: &str = "tsumiki";
pub const TSUMIKI_DEBUG_DATA_ROOT: &str = "/tmp/tsumiki.data";

/// Buckets whose name starts with this prefix hold block keys
/// (`uuid || block_number`); every other bucket is a plain bucket.
pub const BLOCK_BUCKET_PREFIX: &[u8] = b"0b:";

pub const UUID_BYTES: usize = 16;
/// The block-number half of a block key, big-endian.
pub const BLOCK_FIELD_BYTES: usize = 8;
pub const BLOCK_KEY_BYTES: usize = UUID_BYTES + BLOCK_FIELD_BYTES;

/// Per-slot frame header: `CRC32 (4B) || VALSIZE (4B)`, both big-endian.
pub const HEADER_SIZE: usize = 8;
/// Unpacked big-endian length footer written after the trailer record.
pub const TRAILER_FOOTER_BYTES: usize = 4;

/// Hidden per-partition geometry record. The path encoder never emits a
/// leading dot, so this name cannot collide with an encoded bucket.
pub const VERSION_FILE_NAME: &str = ".version.data";
pub const TMP_WRITE_SUFFIX: &str = ".tmpwrite";

pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20; // 1 MiB
/// `block_size` must fit the 32-bit VALSIZE field.
pub const MAX_BLOCK_SIZE: usize = u32::MAX as usize;
/// How many consecutive blocks of one object pack into one host file.
pub const DEFAULT_MAX_BLOCKS: u64 = 512;
pub const DEFAULT_B_DEPTH: usize = 2;
pub const DEFAULT_K_DEPTH: usize = 2;

pub const DEFAULT_MAX_BUFFER_SIZE: usize = 8 << 20; // 8 MiB
pub const DEFAULT_MANIFEST_SAVE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_WRITER_POOL_SIZE: usize = 8;
pub const DEFAULT_WRITERS_PER_UPLOAD: usize = 2;

pub type BlockNumber = u64;
pub type BlockSize = usize;
pub type WriterId = usize;

/// First block number of the file group containing `n`.
pub fn group_base(n: BlockNumber, max_blocks: u64) -> BlockNumber {
    (n / max_blocks) * max_blocks
}

/// Slot index of `n` inside its file group.
pub fn group_slot(n: BlockNumber, max_blocks: u64) -> u64 {
    n % max_blocks
}

pub fn is_block_bucket(bucket: &[u8]) -> bool {
    bucket.starts_with(BLOCK_BUCKET_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_math() {
        assert_eq!(group_base(0, 512), 0);
        assert_eq!(group_base(511, 512), 0);
        assert_eq!(group_base(512, 512), 512);
        assert_eq!(group_base(1025, 512), 1024);
        assert_eq!(group_slot(1025, 512), 1);
    }

    #[test]
    fn bucket_classes() {
        assert!(is_block_bucket(b"0b:photos"));
        assert!(!is_block_bucket(b"photos"));
        assert!(!is_block_bucket(b""));
    }
}
