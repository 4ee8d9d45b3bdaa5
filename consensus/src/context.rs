//! Per-height round state: collected messages, the proposal under
//! construction, and the commit/lock discipline.

use crate::payload::{proposal_digest, ConsensusPayload, Envelope, MessageKind};
use crate::validators::ValidatorSet;
use std::collections::BTreeMap;
use std::sync::Arc;
use talos_common::{crypto, Hash, Height, ValidatorIndex, View, WitnessSignature};

/// Result of offering a message to the round context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    Rejected(RejectReason),
}

/// Why a structurally valid, authenticated message was still not recorded.
/// All of these are local drops, never escalated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Message view below the current view; a lagging validator's past-view
    /// message carries no information.
    StaleView { got: View, current: View },
    /// Proposal/Acknowledgment/Commitment for a view we have not reached.
    FutureView { got: View, current: View },
    /// Message for a height already finished.
    StaleHeight { got: Height, current: Height },
    /// Message for a height not yet started here.
    FutureHeight { got: Height, current: Height },
    /// Byte-identical resend of an already recorded message.
    Duplicate,
    /// Commitment from a sender with no recorded acknowledgment this view.
    PhaseViolation,
    /// Proposal from someone other than the designated primary.
    WrongPrimary {
        got: ValidatorIndex,
        expected: ValidatorIndex,
    },
    /// A second, different proposal from the primary. Evidence of primary
    /// misbehavior; the first accepted proposal stands.
    ConflictingProposal,
    /// Acknowledgment or commitment bound to a hash that does not match the
    /// accepted proposal.
    HashMismatch,
    /// Round already locked on a commitment quorum; view changes for this
    /// height are no longer processed.
    Locked,
}

/// Mutable state of one consensus round (one height).
///
/// Exclusively owned by the state machine; message handling and recovery
/// merges are the only writers, and the engine serializes them through its
/// event queue.
#[derive(Debug, Clone)]
pub struct RoundContext {
    height: Height,
    view: View,
    validators: Arc<ValidatorSet>,
    /// Accepted proposal for the current view, from the designated primary.
    proposal: Option<Envelope>,
    proposal_hash: Option<Hash>,
    acknowledgments: BTreeMap<ValidatorIndex, Envelope>,
    commitments: BTreeMap<ValidatorIndex, Envelope>,
    /// Latest change-view signal per validator. Survives view advances so
    /// quorum evidence for further escalation is not discarded.
    change_views: BTreeMap<ValidatorIndex, Envelope>,
    locked: bool,
}

impl RoundContext {
    pub fn new(height: Height, validators: Arc<ValidatorSet>) -> Self {
        Self {
            height,
            view: 0,
            validators,
            proposal: None,
            proposal_hash: None,
            acknowledgments: BTreeMap::new(),
            commitments: BTreeMap::new(),
            change_views: BTreeMap::new(),
            locked: false,
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn validators(&self) -> &Arc<ValidatorSet> {
        &self.validators
    }

    pub fn primary(&self) -> ValidatorIndex {
        self.validators.primary_index(self.height, self.view)
    }

    pub fn current_proposal_hash(&self) -> Option<Hash> {
        self.proposal_hash
    }

    pub fn proposal(&self) -> Option<&Envelope> {
        self.proposal.as_ref()
    }

    pub fn acknowledgment_envelopes(&self) -> impl Iterator<Item = &Envelope> {
        self.acknowledgments.values()
    }

    pub fn commitment_envelopes(&self) -> impl Iterator<Item = &Envelope> {
        self.commitments.values()
    }

    pub fn change_view_envelopes(&self) -> impl Iterator<Item = &Envelope> {
        self.change_views.values()
    }

    /// Non-mutating admission check for a proposal. The engine validates
    /// proposal content against the ledger and execution collaborators
    /// between this check and `record_message`, so an invalid proposal is
    /// never accepted into the context.
    pub fn check_proposal(&self, envelope: &Envelope) -> Result<Hash, RejectReason> {
        debug_assert_eq!(envelope.kind(), MessageKind::Proposal);
        self.check_round(envelope)?;
        let expected = self.primary();
        if envelope.signer != expected {
            return Err(RejectReason::WrongPrimary {
                got: envelope.signer,
                expected,
            });
        }
        let hash = match &envelope.payload {
            ConsensusPayload::Proposal {
                prev_hash,
                timestamp_ms,
                tx_hashes,
            } => proposal_digest(self.height, prev_hash, *timestamp_ms, tx_hashes),
            _ => unreachable!("check_proposal called with non-proposal payload"),
        };
        if let Some(existing) = self.proposal_hash {
            if existing == hash {
                return Err(RejectReason::Duplicate);
            }
            return Err(RejectReason::ConflictingProposal);
        }
        Ok(hash)
    }

    fn check_round(&self, envelope: &Envelope) -> Result<(), RejectReason> {
        if envelope.height != self.height {
            if envelope.height < self.height {
                return Err(RejectReason::StaleHeight {
                    got: envelope.height,
                    current: self.height,
                });
            }
            return Err(RejectReason::FutureHeight {
                got: envelope.height,
                current: self.height,
            });
        }
        if envelope.view < self.view {
            return Err(RejectReason::StaleView {
                got: envelope.view,
                current: self.view,
            });
        }
        if envelope.view > self.view {
            return Err(RejectReason::FutureView {
                got: envelope.view,
                current: self.view,
            });
        }
        Ok(())
    }

    /// Record an authenticated message. The caller has already verified the
    /// envelope signature and, for proposals, validated the content.
    ///
    /// A resend from the same validator replaces the stored message (latest
    /// kept); a byte-identical resend is rejected as `Duplicate`, which
    /// keeps recovery merges idempotent.
    pub fn record_message(&mut self, envelope: Envelope) -> RecordOutcome {
        match envelope.kind() {
            MessageKind::Proposal => self.record_proposal(envelope),
            MessageKind::Acknowledgment => self.record_acknowledgment(envelope),
            MessageKind::Commitment => self.record_commitment(envelope),
            MessageKind::ChangeView => self.record_change_view(envelope),
            MessageKind::RecoveryRequest | MessageKind::RecoveryMessage => {
                // Recovery traffic is handled by the engine, not stored.
                RecordOutcome::Rejected(RejectReason::Duplicate)
            }
        }
    }

    fn record_proposal(&mut self, envelope: Envelope) -> RecordOutcome {
        let hash = match self.check_proposal(&envelope) {
            Ok(hash) => hash,
            Err(reason) => return RecordOutcome::Rejected(reason),
        };
        self.proposal_hash = Some(hash);
        self.proposal = Some(envelope);
        RecordOutcome::Recorded
    }

    fn record_acknowledgment(&mut self, envelope: Envelope) -> RecordOutcome {
        if let Err(reason) = self.check_round(&envelope) {
            return RecordOutcome::Rejected(reason);
        }
        if let (Some(accepted), ConsensusPayload::Acknowledgment { proposal_hash }) =
            (self.proposal_hash, &envelope.payload)
        {
            // Once a proposal is accepted, an acknowledgment for any other
            // hash can never count toward quorum.
            if *proposal_hash != accepted {
                return RecordOutcome::Rejected(RejectReason::HashMismatch);
            }
        }
        self.insert_latest(MessageKind::Acknowledgment, envelope)
    }

    fn record_commitment(&mut self, envelope: Envelope) -> RecordOutcome {
        if let Err(reason) = self.check_round(&envelope) {
            return RecordOutcome::Rejected(reason);
        }
        // No commit without a prior acknowledgment from the same sender.
        // The primary's accepted proposal stands in for its acknowledgment.
        if !self.has_prepared(envelope.signer) {
            return RecordOutcome::Rejected(RejectReason::PhaseViolation);
        }
        self.insert_latest(MessageKind::Commitment, envelope)
    }

    fn record_change_view(&mut self, envelope: Envelope) -> RecordOutcome {
        if self.locked {
            return RecordOutcome::Rejected(RejectReason::Locked);
        }
        if envelope.height != self.height {
            return RecordOutcome::Rejected(if envelope.height < self.height {
                RejectReason::StaleHeight {
                    got: envelope.height,
                    current: self.height,
                }
            } else {
                RejectReason::FutureHeight {
                    got: envelope.height,
                    current: self.height,
                }
            });
        }
        let target = match &envelope.payload {
            ConsensusPayload::ChangeView { new_view, .. } => *new_view,
            _ => return RecordOutcome::Rejected(RejectReason::Duplicate),
        };
        if target <= self.view {
            return RecordOutcome::Rejected(RejectReason::StaleView {
                got: target,
                current: self.view,
            });
        }
        self.insert_latest(MessageKind::ChangeView, envelope)
    }

    fn insert_latest(&mut self, kind: MessageKind, envelope: Envelope) -> RecordOutcome {
        let map = match kind {
            MessageKind::Acknowledgment => &mut self.acknowledgments,
            MessageKind::Commitment => &mut self.commitments,
            MessageKind::ChangeView => &mut self.change_views,
            _ => unreachable!("insert_latest only stores vote kinds"),
        };
        if map.get(&envelope.signer) == Some(&envelope) {
            return RecordOutcome::Rejected(RejectReason::Duplicate);
        }
        map.insert(envelope.signer, envelope);
        RecordOutcome::Recorded
    }

    /// Has this validator bound itself to the accepted proposal this view?
    fn has_prepared(&self, signer: ValidatorIndex) -> bool {
        if self.acknowledgments.contains_key(&signer) {
            return true;
        }
        matches!(&self.proposal, Some(p) if p.signer == signer)
    }

    /// Distinct validators bound to the accepted proposal hash. The primary
    /// counts via its accepted proposal.
    pub fn acknowledgment_count(&self) -> usize {
        let Some(accepted) = self.proposal_hash else {
            return 0;
        };
        let mut count = self
            .acknowledgments
            .values()
            .filter(|env| {
                matches!(
                    &env.payload,
                    ConsensusPayload::Acknowledgment { proposal_hash } if *proposal_hash == accepted
                )
            })
            .count();
        if let Some(proposal) = &self.proposal {
            if !self.acknowledgments.contains_key(&proposal.signer) {
                count += 1;
            }
        }
        count
    }

    /// Distinct validators with a commitment whose signature verifies over
    /// the accepted proposal hash and whose acknowledgment is on record.
    pub fn commitment_count(&self) -> usize {
        self.valid_commitments().count()
    }

    fn valid_commitments(&self) -> impl Iterator<Item = &Envelope> {
        let accepted = self.proposal_hash;
        self.commitments.values().filter(move |env| {
            let Some(hash) = accepted else { return false };
            let ConsensusPayload::Commitment { signature } = &env.payload else {
                return false;
            };
            let Some(public_key) = self.validators.public_key(env.signer) else {
                return false;
            };
            crypto::verify_signature(public_key, hash.as_ref(), signature).is_ok()
        })
    }

    /// Quorum of the given kind against its matching criterion: proposal
    /// hash for acknowledgments/commitments, target view for change views.
    pub fn quorum_reached(&self, kind: MessageKind) -> bool {
        let quorum = self.validators.quorum_size();
        match kind {
            MessageKind::Acknowledgment => self.acknowledgment_count() >= quorum,
            MessageKind::Commitment => self.commitment_count() >= quorum,
            MessageKind::ChangeView => self.change_view_target().is_some(),
            _ => false,
        }
    }

    /// Highest view t above the current one such that at least 2f+1
    /// validators requested a view >= t.
    pub fn change_view_target(&self) -> Option<View> {
        let quorum = self.validators.quorum_size();
        let mut targets: Vec<View> = self
            .change_views
            .values()
            .filter_map(|env| match &env.payload {
                ConsensusPayload::ChangeView { new_view, .. } => Some(*new_view),
                _ => None,
            })
            .filter(|target| *target > self.view)
            .collect();
        if targets.len() < quorum {
            return None;
        }
        // The k-th largest target (k = quorum) is the highest view at least
        // 2f+1 validators agree to reach.
        targets.sort_unstable_by(|a, b| b.cmp(a));
        Some(targets[quorum - 1])
    }

    /// Lock the round: a commitment quorum exists for the accepted hash.
    /// From here the round finalizes exactly that block.
    pub fn lock(&mut self) {
        debug_assert!(self.quorum_reached(MessageKind::Commitment));
        self.locked = true;
    }

    /// Commitment signatures forming the finality witness for the block.
    pub fn witness(&self) -> Vec<WitnessSignature> {
        self.valid_commitments()
            .map(|env| match &env.payload {
                ConsensusPayload::Commitment { signature } => WitnessSignature {
                    signer: env.signer,
                    signature: signature.clone(),
                },
                _ => unreachable!("valid_commitments yields only commitments"),
            })
            .collect()
    }

    /// Advance to a new view after a change-view quorum: the proposal and
    /// the acknowledgment/commitment tallies reset, change-view signals for
    /// views beyond the target are retained.
    pub fn advance_view(&mut self, target: View) {
        debug_assert!(target > self.view);
        debug_assert!(!self.locked);
        self.view = target;
        self.proposal = None;
        self.proposal_hash = None;
        self.acknowledgments.clear();
        self.commitments.clear();
        self.change_views
            .retain(|_, env| match &env.payload {
                ConsensusPayload::ChangeView { new_view, .. } => *new_view > target,
                _ => false,
            });
    }
}
