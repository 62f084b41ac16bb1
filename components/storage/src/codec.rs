//! Per-slot frame: `CRC32 || VALSIZE || VALUE`, header fields big-endian.
//! The checksum covers `VALSIZE || VALUE`, so a torn header and a torn value
//! are equally detectable.

use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;
use snafu::ensure;
use tsumiki_common::HEADER_SIZE;

use crate::err::{BadCrcSnafu, InvalidUserArgumentSnafu, Result};

/// Frames `value` for one block slot. Values longer than `block_size` are
/// rejected before any buffer is allocated.
pub fn pack(value: &[u8], block_size: usize) -> Result<Vec<u8>> {
    ensure!(
        value.len() <= block_size,
        InvalidUserArgumentSnafu {
            len: value.len(),
            block_size,
        }
    );

    let mut len_be = [0u8; 4];
    BigEndian::write_u32(&mut len_be, value.len() as u32);

    let mut hasher = Hasher::new();
    hasher.update(&len_be);
    hasher.update(value);

    let mut buf = Vec::with_capacity(HEADER_SIZE + value.len());
    buf.extend_from_slice(&[0u8; 4]);
    BigEndian::write_u32(&mut buf[..4], hasher.finalize());
    buf.extend_from_slice(&len_be);
    buf.extend_from_slice(value);
    Ok(buf)
}

/// Recovers the value from a framed slot. Short headers, short values and
/// checksum mismatches all fail as `BadCrc`; a partial value is never
/// returned.
pub fn unpack(buf: &[u8]) -> Result<&[u8]> {
    ensure!(buf.len() >= HEADER_SIZE, BadCrcSnafu);
    let stored_crc = BigEndian::read_u32(&buf[..4]);
    let val_size = BigEndian::read_u32(&buf[4..8]) as usize;
    ensure!(buf.len() - HEADER_SIZE >= val_size, BadCrcSnafu);

    let mut hasher = Hasher::new();
    hasher.update(&buf[4..HEADER_SIZE + val_size]);
    ensure!(hasher.finalize() == stored_crc, BadCrcSnafu);

    Ok(&buf[HEADER_SIZE..HEADER_SIZE + val_size])
}
