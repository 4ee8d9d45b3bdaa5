use serde::{Deserialize, Serialize};
use std::fmt;

/// Block height. One consensus round runs per height.
pub type Height = u64;

/// View number within a height, starting at 0.
pub type View = u32;

/// Position of a validator within the ordered validator list for a height.
pub type ValidatorIndex = u16;

/// 32-byte hash used for blocks, transactions, and preparation hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash(arr))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Canonical block header structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub prev_hash: Hash,
    pub height: Height,
    pub timestamp_ms: u64,
    pub tx_root: Hash,
    pub state_root: Hash,
}

/// A commitment signature from one validator, part of a block's finality witness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessSignature {
    pub signer: ValidatorIndex,
    pub signature: Vec<u8>,
}

/// Finalized block: header, its hash, the ordered transaction hashes, and the
/// quorum of commitment signatures that finalized it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub hash: Hash,
    pub tx_hashes: Vec<Hash>,
    pub witness: Vec<WitnessSignature>,
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block(height={}, txs={}, hash={})",
            self.header.height,
            self.tx_hashes.len(),
            self.hash
        )
    }
}
