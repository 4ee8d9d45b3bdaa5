//! Collaborator seams. The consensus core coordinates; executing
//! transactions, persisting the chain, and moving bytes are someone else's
//! job, reached through these traits.

use async_trait::async_trait;
use talos_common::{Block, ExecutionError, Hash, Height, PersistenceError, ValidatorIndex};

/// Summary of a persisted block header, as much as proposal validation
/// needs from the chain head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSummary {
    pub hash: Hash,
    pub timestamp_ms: u64,
}

/// Deterministic transaction execution, supplied by the node.
///
/// Calls are bounded by the configured execution timeout; a slow collaborator
/// is treated as a validation failure for that proposal, never a crash.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Select the transaction set for a block this node is about to propose.
    /// Called only when this validator is the primary.
    async fn propose_transaction_set(&self, parent: &HeaderSummary)
        -> Result<Vec<Hash>, ExecutionError>;

    /// Check a received proposal's transaction set against the parent state.
    async fn validate_proposal(
        &self,
        height: Height,
        parent: &HeaderSummary,
        tx_hashes: &[Hash],
    ) -> Result<(), ExecutionError>;

    /// Execute a finalized block, returning the resulting state root.
    async fn apply_block(&self, block: &Block) -> Result<Hash, ExecutionError>;
}

/// Chain persistence, supplied by the node.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Height of the last persisted block.
    async fn current_height(&self) -> Height;

    /// Header summary at a height, if persisted.
    async fn block_header(&self, height: Height) -> Option<HeaderSummary>;

    /// Persist a finalized block. Failure here is loud: the engine retries
    /// and then halts the height rather than silently losing the block.
    async fn persist_block(&self, block: &Block) -> Result<(), PersistenceError>;

    /// Ordered validator public keys for a height.
    async fn validator_set(&self, height: Height) -> Vec<Vec<u8>>;
}

/// Message transport, supplied by the node. Fire-and-forget: delivery is
/// unreliable and asynchronous, and neither call may block the state machine
/// on delivery confirmation.
#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    async fn broadcast(&self, bytes: Vec<u8>);

    async fn send_to(&self, index: ValidatorIndex, bytes: Vec<u8>);
}
