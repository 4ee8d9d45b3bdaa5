use crate::types::{Height, ValidatorIndex};
use thiserror::Error;

/// Main error type for the talos node.
#[derive(Error, Debug)]
pub enum TalosError {
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Consensus protocol errors.
///
/// Only `Configuration` is fatal. Round-local rejections (stale views,
/// phase violations, hash mismatches) are not errors at all: they are
/// expected traffic under the fault model and surface as rejection
/// outcomes on the round context, logged and dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("invalid validator set size {size}: dBFT requires N >= 4 and (N - 1) % 3 == 0")]
    Configuration { size: usize },

    #[error("unknown validator index {0}")]
    UnknownValidator(ValidatorIndex),
}

/// Cryptographic operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}

/// Binary decode errors, local to a single message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of input: needed {needed} more bytes")]
    UnexpectedEnd { needed: usize },

    #[error("unknown message kind tag {0:#04x}")]
    UnknownKind(u8),

    #[error("declared length {declared} exceeds remaining input {remaining}")]
    LengthOverflow { declared: usize, remaining: usize },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("invalid field length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
}

/// Collaborator failures while validating or applying a block.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("proposal invalid: {0}")]
    Invalid(String),

    #[error("execution did not complete within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("execution failed: {0}")]
    Failed(String),
}

/// Ledger store failure persisting a finalized block. Surfaced loudly:
/// losing a finalized block is a safety violation, not a transient fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to persist finalized block at height {height}: {reason}")]
pub struct PersistenceError {
    pub height: Height,
    pub reason: String,
}

/// Result type alias for talos operations.
pub type TalosResult<T> = Result<T, TalosError>;
