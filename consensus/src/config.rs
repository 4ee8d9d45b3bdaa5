use serde::{Deserialize, Serialize};
use std::time::Duration;
use talos_common::{TalosError, TalosResult, View};

/// Tunable consensus parameters.
///
/// The timeout base and multiplier are policy, not protocol: they affect
/// liveness under a given network latency but never safety, so operators
/// tune them per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Round timeout at view 0, in milliseconds.
    pub base_timeout_ms: u64,

    /// Backoff factor applied per view ("exponential view timeout"): the
    /// timeout at view v is base * multiplier^v, capped below.
    pub timeout_multiplier: u32,

    /// Upper bound on the per-view timeout.
    pub max_timeout_ms: u64,

    /// How far a proposal timestamp may lie ahead of local time.
    pub timestamp_tolerance_ms: u64,

    /// Bound on any single call into the execution engine. Exceeding it is
    /// treated as a validation failure for that proposal, not a crash.
    pub execution_timeout_ms: u64,

    /// Attempts to persist a finalized block before halting the height.
    pub persist_retries: u32,

    /// Depth of the inbound event queue feeding the state machine.
    pub event_queue_depth: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: 4_000,
            timeout_multiplier: 2,
            max_timeout_ms: 60_000,
            timestamp_tolerance_ms: 10_000,
            execution_timeout_ms: 2_000,
            persist_retries: 3,
            event_queue_depth: 1_024,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> TalosResult<()> {
        if self.base_timeout_ms == 0 {
            return Err(TalosError::Config(
                "base_timeout_ms must be positive".into(),
            ));
        }
        if self.timeout_multiplier == 0 {
            return Err(TalosError::Config(
                "timeout_multiplier must be at least 1".into(),
            ));
        }
        if self.max_timeout_ms < self.base_timeout_ms {
            return Err(TalosError::Config(
                "max_timeout_ms must not be below base_timeout_ms".into(),
            ));
        }
        if self.event_queue_depth == 0 {
            return Err(TalosError::Config(
                "event_queue_depth must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Timeout for a given view, with exponential backoff and a cap.
    pub fn view_timeout(&self, view: View) -> Duration {
        let factor = (self.timeout_multiplier as u64)
            .checked_pow(view.min(32))
            .unwrap_or(u64::MAX);
        let ms = self
            .base_timeout_ms
            .saturating_mul(factor)
            .min(self.max_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}
