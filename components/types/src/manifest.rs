use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata of one streaming upload, periodically handed to the external
/// manifest collaborator and returned to the caller on finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
    pub uuid: Uuid,
    pub content_length: u64,
    pub content_type: Option<String>,
    pub block_size: usize,
    pub bytes_received: u64,
    pub blocks_written: u64,
    pub done: bool,
}

impl Manifest {
    pub fn new(
        bucket: Vec<u8>,
        key: Vec<u8>,
        uuid: Uuid,
        content_length: u64,
        content_type: Option<String>,
        block_size: usize,
    ) -> Self {
        Self {
            bucket,
            key,
            uuid,
            content_length,
            content_type,
            block_size,
            bytes_received: 0,
            blocks_written: 0,
            done: false,
        }
    }

    /// Total number of blocks the object splits into.
    pub fn block_count(&self) -> u64 {
        self.content_length.div_ceil(self.block_size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_count_rounds_up() {
        let mut m = Manifest::new(b"b".to_vec(), b"k".to_vec(), Uuid::new_v4(), 0, None, 1024);
        assert_eq!(m.block_count(), 0);
        m.content_length = 1024;
        assert_eq!(m.block_count(), 1);
        m.content_length = 1025;
        assert_eq!(m.block_count(), 2);
    }
}
