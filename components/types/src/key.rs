use std::fmt::{Display, Formatter};

use byteorder::{BigEndian, ByteOrder};
use snafu::{ensure, Location, Snafu};
use tsumiki_common::{
    group_base, BlockNumber, BLOCK_FIELD_BYTES, BLOCK_KEY_BYTES, UUID_BYTES,
};
use uuid::Uuid;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("block key must be {} bytes, got {}", BLOCK_KEY_BYTES, len))]
    InvalidBlockKeyLen {
        len: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Address of one block of a large object: `uuid || block_number`,
/// the block number stored as an unsigned big-endian integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey {
    pub uuid: Uuid,
    pub number: BlockNumber,
}

impl BlockKey {
    pub fn new(uuid: Uuid, number: BlockNumber) -> Self {
        Self { uuid, number }
    }

    pub fn encode(&self) -> [u8; BLOCK_KEY_BYTES] {
        let mut buf = [0u8; BLOCK_KEY_BYTES];
        buf[..UUID_BYTES].copy_from_slice(self.uuid.as_bytes());
        BigEndian::write_u64(&mut buf[UUID_BYTES..], self.number);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        ensure!(
            buf.len() == BLOCK_KEY_BYTES,
            InvalidBlockKeyLenSnafu { len: buf.len() }
        );
        let uuid = Uuid::from_slice(&buf[..UUID_BYTES]).expect("uuid half is 16 bytes");
        let number = BigEndian::read_u64(&buf[UUID_BYTES..UUID_BYTES + BLOCK_FIELD_BYTES]);
        Ok(Self { uuid, number })
    }

    /// The key of the first block in this key's file group, which names the
    /// host file all blocks of the group pack into.
    pub fn group_key(&self, max_blocks: u64) -> BlockKey {
        BlockKey {
            uuid: self.uuid,
            number: group_base(self.number, max_blocks),
        }
    }
}

impl Display for BlockKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.uuid.simple(), self.number)
    }
}

impl TryFrom<&[u8]> for BlockKey {
    type Error = Error;

    fn try_from(buf: &[u8]) -> Result<Self, Self::Error> {
        BlockKey::decode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let key = BlockKey::new(Uuid::new_v4(), 0x0102_0304_0506_0708);
        let buf = key.encode();
        assert_eq!(buf.len(), BLOCK_KEY_BYTES);
        // block number is big-endian in the tail
        assert_eq!(&buf[UUID_BYTES..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(BlockKey::decode(&buf).unwrap(), key);
    }

    #[test]
    fn decode_rejects_bad_len() {
        assert!(BlockKey::decode(&[0u8; 23]).is_err());
        assert!(BlockKey::decode(&[0u8; 25]).is_err());
    }

    #[test]
    fn group_key_is_base() {
        let uuid = Uuid::new_v4();
        let key = BlockKey::new(uuid, 1037);
        assert_eq!(key.group_key(512), BlockKey::new(uuid, 1024));
        assert_eq!(BlockKey::new(uuid, 0).group_key(512), BlockKey::new(uuid, 0));
    }
}
