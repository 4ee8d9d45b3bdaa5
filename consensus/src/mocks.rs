//! In-memory collaborator doubles for tests: a deterministic execution
//! engine, a ledger over a HashMap, and a network that captures outbound
//! traffic instead of sending it.

use crate::traits::{ExecutionEngine, HeaderSummary, LedgerStore, NetworkAdapter};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use talos_common::{Block, ExecutionError, Hash, Height, PersistenceError, ValidatorIndex};

/// Execution engine returning a fixed transaction set, with switches for
/// failure injection.
#[derive(Default)]
pub struct MockExecution {
    pub tx_hashes: Vec<Hash>,
    pub reject_proposals: Mutex<bool>,
    /// Delay applied to `validate_proposal`, to exercise the execution
    /// timeout bound.
    pub validation_delay: Mutex<Option<Duration>>,
    pub applied: Mutex<Vec<Block>>,
}

impl MockExecution {
    pub fn with_txs(tx_hashes: Vec<Hash>) -> Self {
        Self {
            tx_hashes,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ExecutionEngine for MockExecution {
    async fn propose_transaction_set(
        &self,
        _parent: &HeaderSummary,
    ) -> Result<Vec<Hash>, ExecutionError> {
        Ok(self.tx_hashes.clone())
    }

    async fn validate_proposal(
        &self,
        _height: Height,
        _parent: &HeaderSummary,
        _tx_hashes: &[Hash],
    ) -> Result<(), ExecutionError> {
        let delay = *self.validation_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.reject_proposals.lock() {
            return Err(ExecutionError::Invalid("rejected by mock".into()));
        }
        Ok(())
    }

    async fn apply_block(&self, block: &Block) -> Result<Hash, ExecutionError> {
        self.applied.lock().push(block.clone());
        // state root derived from the block hash, deterministic across nodes
        Ok(talos_common::sha256(block.hash.as_ref()))
    }
}

/// Ledger over in-memory maps, seeded with a genesis header.
pub struct MockLedger {
    pub validators: Vec<Vec<u8>>,
    headers: Mutex<HashMap<Height, HeaderSummary>>,
    height: Mutex<Height>,
    pub persisted: Mutex<Vec<Block>>,
    pub fail_persists: Mutex<u32>,
}

impl MockLedger {
    /// Seed with headers up to `head_height` so consensus can start at
    /// `head_height + 1`.
    pub fn new(validators: Vec<Vec<u8>>, head_height: Height) -> Self {
        let mut headers = HashMap::new();
        for h in 0..=head_height {
            headers.insert(
                h,
                HeaderSummary {
                    hash: talos_common::sha256(&h.to_le_bytes()),
                    timestamp_ms: h * 1_000,
                },
            );
        }
        Self {
            validators,
            headers: Mutex::new(headers),
            height: Mutex::new(head_height),
            persisted: Mutex::new(Vec::new()),
            fail_persists: Mutex::new(0),
        }
    }

    pub fn head(&self) -> HeaderSummary {
        let height = *self.height.lock();
        self.headers.lock()[&height]
    }
}

#[async_trait]
impl LedgerStore for MockLedger {
    async fn current_height(&self) -> Height {
        *self.height.lock()
    }

    async fn block_header(&self, height: Height) -> Option<HeaderSummary> {
        self.headers.lock().get(&height).copied()
    }

    async fn persist_block(&self, block: &Block) -> Result<(), PersistenceError> {
        {
            let mut failures = self.fail_persists.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(PersistenceError {
                    height: block.header.height,
                    reason: "mock persistence failure".into(),
                });
            }
        }
        let height = block.header.height;
        self.headers.lock().insert(
            height,
            HeaderSummary {
                hash: block.hash,
                timestamp_ms: block.header.timestamp_ms,
            },
        );
        *self.height.lock() = height;
        self.persisted.lock().push(block.clone());
        Ok(())
    }

    async fn validator_set(&self, _height: Height) -> Vec<Vec<u8>> {
        self.validators.clone()
    }
}

/// Network that records everything instead of delivering it.
#[derive(Default)]
pub struct MockNetwork {
    pub broadcasts: Mutex<Vec<Vec<u8>>>,
    pub directed: Mutex<Vec<(ValidatorIndex, Vec<u8>)>>,
}

impl MockNetwork {
    /// Drain captured broadcasts.
    pub fn take_broadcasts(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.broadcasts.lock())
    }

    pub fn take_directed(&self) -> Vec<(ValidatorIndex, Vec<u8>)> {
        std::mem::take(&mut self.directed.lock())
    }
}

#[async_trait]
impl NetworkAdapter for MockNetwork {
    async fn broadcast(&self, bytes: Vec<u8>) {
        self.broadcasts.lock().push(bytes);
    }

    async fn send_to(&self, index: ValidatorIndex, bytes: Vec<u8>) {
        self.directed.lock().push((index, bytes));
    }
}
