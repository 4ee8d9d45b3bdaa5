//! dBFT consensus core for the talos node.
//!
//! Drives agreement among a fixed set of N = 3f+1 validators on the next
//! block, tolerating up to f Byzantine validators. The engine is a
//! single-consumer reactive state machine: inbound messages and timer fires
//! are serialized through one event queue, and each event is fully processed
//! before the next. Execution, persistence, and transport are collaborator
//! traits ([`traits`]); this crate owns the protocol itself.

pub mod config;
pub mod context;
pub mod engine;
pub mod mocks;
pub mod payload;
pub mod recovery;
pub mod timer;
pub mod traits;
pub mod validators;
pub mod wire;

pub use config::ConsensusConfig;
pub use context::{RecordOutcome, RejectReason, RoundContext};
pub use engine::{ConsensusEngine, ConsensusEvent, EngineHandle, Phase};
pub use payload::{ConsensusPayload, Envelope, MessageKind, RecoveryPayload};
pub use timer::{RoundTimer, TimerEpoch};
pub use traits::{ExecutionEngine, HeaderSummary, LedgerStore, NetworkAdapter};
pub use validators::{Validator, ValidatorSet};
