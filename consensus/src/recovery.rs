//! Building and merging recovery snapshots.
//!
//! A recovery message is a replay of everything one validator has recorded
//! for the current round: the accepted proposal plus every vote. Merging one
//! pushes each inner envelope through the same verify-then-record path as
//! live traffic, so a snapshot can only add information and merging the same
//! snapshot twice is a no-op.

use crate::context::{RecordOutcome, RoundContext};
use crate::payload::RecoveryPayload;
use tracing::debug;

/// Counts from one merge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub recorded: usize,
    pub rejected: usize,
}

/// Snapshot the round as a [`RecoveryPayload`].
pub fn build(context: &RoundContext) -> RecoveryPayload {
    RecoveryPayload {
        proposal: context.proposal().cloned().map(Box::new),
        acknowledgments: context.acknowledgment_envelopes().cloned().collect(),
        commitments: context.commitment_envelopes().cloned().collect(),
        change_views: context.change_view_envelopes().cloned().collect(),
    }
}

/// Record the votes carried by a recovery snapshot.
///
/// Acknowledgments land before commitments so the ack-before-commit phase
/// rule sees a consistent order regardless of how the sender's round
/// unfolded. The embedded proposal is the caller's concern; it needs the
/// full content-validation path, not just the record rules.
pub fn merge_votes(context: &mut RoundContext, recovery: &RecoveryPayload) -> MergeStats {
    let mut stats = MergeStats::default();
    let votes = recovery
        .acknowledgments
        .iter()
        .chain(recovery.commitments.iter())
        .chain(recovery.change_views.iter());
    for envelope in votes {
        if let Err(e) = envelope.verify(context.validators()) {
            debug!(signer = envelope.signer, error = %e, "skipping unverifiable recovery vote");
            stats.rejected += 1;
            continue;
        }
        match context.record_message(envelope.clone()) {
            RecordOutcome::Recorded => stats.recorded += 1,
            RecordOutcome::Rejected(_) => stats.rejected += 1,
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ConsensusPayload, Envelope};
    use crate::validators::ValidatorSet;
    use std::sync::Arc;
    use talos_common::{Hash, SigningKeyPair};

    struct Fixture {
        keypairs: Vec<SigningKeyPair>,
        validators: Arc<ValidatorSet>,
    }

    impl Fixture {
        fn new() -> Self {
            let keypairs: Vec<_> = (0..4).map(|_| SigningKeyPair::generate()).collect();
            let keys = keypairs.iter().map(|k| k.public_key_bytes().to_vec()).collect();
            let validators = Arc::new(ValidatorSet::new(keys).unwrap());
            Self { keypairs, validators }
        }

        fn context(&self) -> RoundContext {
            RoundContext::new(5, Arc::clone(&self.validators))
        }

        fn proposal(&self, context: &mut RoundContext) -> Hash {
            let primary = context.primary();
            let envelope = Envelope::signed(
                5,
                0,
                ConsensusPayload::Proposal {
                    prev_hash: Hash::ZERO,
                    timestamp_ms: 1_000,
                    tx_hashes: vec![],
                },
                primary,
                &self.keypairs[primary as usize],
            );
            assert_eq!(context.record_message(envelope), RecordOutcome::Recorded);
            context.current_proposal_hash().unwrap()
        }

        fn ack(&self, signer: u16, proposal_hash: Hash) -> Envelope {
            Envelope::signed(
                5,
                0,
                ConsensusPayload::Acknowledgment { proposal_hash },
                signer,
                &self.keypairs[signer as usize],
            )
        }
    }

    #[test]
    fn build_snapshots_proposal_and_votes() {
        let fx = Fixture::new();
        let mut ctx = fx.context();
        let hash = fx.proposal(&mut ctx);
        for signer in 0..4u16 {
            if signer != ctx.primary() {
                ctx.record_message(fx.ack(signer, hash));
            }
        }

        let snapshot = build(&ctx);
        assert!(snapshot.proposal.is_some());
        assert_eq!(snapshot.acknowledgments.len(), 3);
        assert!(snapshot.commitments.is_empty());
        assert!(snapshot.change_views.is_empty());
    }

    #[test]
    fn merge_records_missing_votes() {
        let fx = Fixture::new();

        let mut full = fx.context();
        let hash = fx.proposal(&mut full);
        for signer in 0..4u16 {
            if signer != full.primary() {
                full.record_message(fx.ack(signer, hash));
            }
        }
        let snapshot = build(&full);

        let mut behind = fx.context();
        fx.proposal(&mut behind);
        let stats = merge_votes(&mut behind, &snapshot);
        assert_eq!(stats.recorded, 3);
        assert_eq!(stats.rejected, 0);
        assert_eq!(behind.acknowledgment_count(), full.acknowledgment_count());
    }

    #[test]
    fn merge_is_idempotent() {
        let fx = Fixture::new();
        let mut full = fx.context();
        let hash = fx.proposal(&mut full);
        for signer in 0..4u16 {
            if signer != full.primary() {
                full.record_message(fx.ack(signer, hash));
            }
        }
        let snapshot = build(&full);

        let mut behind = fx.context();
        fx.proposal(&mut behind);
        merge_votes(&mut behind, &snapshot);
        let again = merge_votes(&mut behind, &snapshot);
        assert_eq!(again.recorded, 0);
        assert_eq!(again.rejected, 3);
        assert_eq!(behind.acknowledgment_count(), 4);
    }

    #[test]
    fn merge_skips_tampered_votes() {
        let fx = Fixture::new();
        let mut full = fx.context();
        let hash = fx.proposal(&mut full);
        let signer = (full.primary() + 1) % 4;
        let mut forged = fx.ack(signer, hash);
        forged.signature[0] ^= 0xff;
        let snapshot = RecoveryPayload {
            proposal: None,
            acknowledgments: vec![forged],
            commitments: vec![],
            change_views: vec![],
        };

        let stats = merge_votes(&mut full, &snapshot);
        assert_eq!(stats.recorded, 0);
        assert_eq!(stats.rejected, 1);
    }
}
