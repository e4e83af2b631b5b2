use std::fmt;

use serde::{Deserialize, Serialize};

/// Chain-native transaction identifier, kept opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub Vec<u8>);

impl TxId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s.trim_start_matches("0x")).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

/// Chain-native block reference.
///
/// The height is what finality depth is measured against; the hash tells two
/// blocks at the same height apart after a reorg.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub height: u64,
    pub hash: Vec<u8>,
}

impl BlockId {
    pub fn new(height: u64, hash: impl Into<Vec<u8>>) -> Self {
        Self {
            height,
            hash: hash.into(),
        }
    }

    /// Number of blocks `self` is ahead of `other`, zero if behind.
    pub fn depth_over(&self, other: &BlockId) -> u64 {
        self.height.saturating_sub(other.height)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} (0x{})", self.height, hex::encode(&self.hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_id_hex() {
        let tx = TxId::from_hex("0xdeadbeef").unwrap();
        assert_eq!(tx.as_bytes(), &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(tx.to_string(), "0xdeadbeef");
        assert!(TxId::from_hex("zz").is_err());
    }

    #[test]
    fn test_block_depth() {
        let anchor = BlockId::new(10, vec![1]);
        let head = BlockId::new(16, vec![2]);
        assert_eq!(head.depth_over(&anchor), 6);
        assert_eq!(anchor.depth_over(&head), 0);
    }
}
