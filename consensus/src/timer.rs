//! Round timer: detects stalled rounds and feeds timeout events back into
//! the engine's queue.
//!
//! One logical timer per round, re-armed on every view/height transition.
//! Every armed timer carries an epoch (height, view, generation); a fire
//! whose epoch no longer matches is a no-op, so a timer that outlives its
//! round cannot act.

use crate::engine::ConsensusEvent;
use std::time::Duration;
use talos_common::{Height, View};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Identity of one armed timer. Checked on fire before acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEpoch {
    pub height: Height,
    pub view: View,
    pub generation: u64,
}

/// Owns at most one pending timeout task.
#[derive(Debug)]
pub struct RoundTimer {
    events: mpsc::Sender<ConsensusEvent>,
    generation: u64,
    current: Option<TimerEpoch>,
    task: Option<JoinHandle<()>>,
}

impl RoundTimer {
    pub fn new(events: mpsc::Sender<ConsensusEvent>) -> Self {
        Self {
            events,
            generation: 0,
            current: None,
            task: None,
        }
    }

    /// Arm the timer for a round, cancelling any previous one.
    pub fn arm(&mut self, height: Height, view: View, timeout: Duration) -> TimerEpoch {
        self.disarm();
        self.generation += 1;
        let epoch = TimerEpoch {
            height,
            view,
            generation: self.generation,
        };
        self.current = Some(epoch);
        let events = self.events.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // the engine re-checks the epoch; a send failure just means the
            // engine already shut down
            let _ = events.send(ConsensusEvent::TimerFired(epoch)).await;
        }));
        trace!(height, view, generation = self.generation, ?timeout, "timer armed");
        epoch
    }

    /// Cancel the pending timeout, if any.
    pub fn disarm(&mut self) {
        self.current = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether a fired epoch still belongs to the live timer.
    pub fn is_current(&self, epoch: &TimerEpoch) -> bool {
        self.current.as_ref() == Some(epoch)
    }

    /// Epoch of the currently armed timer, if any.
    pub fn current(&self) -> Option<TimerEpoch> {
        self.current
    }
}

impl Drop for RoundTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn armed_timer_fires_with_its_epoch() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timer = RoundTimer::new(tx);
        let epoch = timer.arm(5, 0, Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(150)).await;
        match rx.recv().await {
            Some(ConsensusEvent::TimerFired(fired)) => {
                assert_eq!(fired, epoch);
                assert!(timer.is_current(&fired));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_invalidates_the_previous_epoch() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timer = RoundTimer::new(tx);
        let first = timer.arm(5, 0, Duration::from_millis(100));
        let second = timer.arm(5, 1, Duration::from_millis(100));

        assert!(!timer.is_current(&first));
        assert!(timer.is_current(&second));

        tokio::time::advance(Duration::from_millis(150)).await;
        // only the second task is still alive
        let fired = rx.recv().await.unwrap();
        assert!(matches!(
            fired,
            ConsensusEvent::TimerFired(e) if e == second
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_timer_never_fires() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timer = RoundTimer::new(tx);
        timer.arm(5, 0, Duration::from_millis(100));
        timer.disarm();

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }
}
