//! Consensus message kinds, signed envelopes, and their binary codec.
//!
//! Wire layout of an envelope: 1-byte kind tag, u64 height, u32 view,
//! kind-specific payload, then a detachable signature block (u16 signer
//! index + 64-byte Ed25519 signature). The signature covers exactly the
//! bytes preceding the signature block.

use crate::validators::ValidatorSet;
use crate::wire::{WireReader, WireWriter};
use serde::{Deserialize, Serialize};
use talos_common::{
    crypto, ConsensusError, Hash, Height, SigningKeyPair, TalosError, ValidatorIndex, View,
    WireError, SIGNATURE_LENGTH,
};

/// Kind tags on the wire. Values match the original protocol's payload
/// numbering, grouped by phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    ChangeView = 0x00,
    Proposal = 0x20,
    Acknowledgment = 0x21,
    Commitment = 0x30,
    RecoveryRequest = 0x40,
    RecoveryMessage = 0x41,
}

impl MessageKind {
    pub fn from_tag(tag: u8) -> Result<Self, WireError> {
        match tag {
            0x00 => Ok(MessageKind::ChangeView),
            0x20 => Ok(MessageKind::Proposal),
            0x21 => Ok(MessageKind::Acknowledgment),
            0x30 => Ok(MessageKind::Commitment),
            0x40 => Ok(MessageKind::RecoveryRequest),
            0x41 => Ok(MessageKind::RecoveryMessage),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Aggregated round state sent in response to a RecoveryRequest.
///
/// Every inner item is a complete signed envelope so the receiver applies
/// the same verification as for individually delivered messages. Nested
/// recovery kinds are rejected at decode, so the structure is at most one
/// level deep.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecoveryPayload {
    pub proposal: Option<Box<Envelope>>,
    pub acknowledgments: Vec<Envelope>,
    pub commitments: Vec<Envelope>,
    pub change_views: Vec<Envelope>,
}

/// One consensus message, minus the envelope fields shared by all kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusPayload {
    /// Primary's proposed block content.
    Proposal {
        prev_hash: Hash,
        timestamp_ms: u64,
        tx_hashes: Vec<Hash>,
    },
    /// Backup's preparation: it validated the Proposal and binds itself to
    /// that exact content via the preparation hash.
    Acknowledgment { proposal_hash: Hash },
    /// Irrevocable vote to finalize: Ed25519 signature over the block hash.
    Commitment { signature: Vec<u8> },
    /// Request to abandon the current view.
    ChangeView { new_view: View, timestamp_ms: u64 },
    /// Ask peers to resend enough state to catch up.
    RecoveryRequest,
    /// Response reconstructing round state for the requester.
    RecoveryMessage(RecoveryPayload),
}

impl ConsensusPayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            ConsensusPayload::Proposal { .. } => MessageKind::Proposal,
            ConsensusPayload::Acknowledgment { .. } => MessageKind::Acknowledgment,
            ConsensusPayload::Commitment { .. } => MessageKind::Commitment,
            ConsensusPayload::ChangeView { .. } => MessageKind::ChangeView,
            ConsensusPayload::RecoveryRequest => MessageKind::RecoveryRequest,
            ConsensusPayload::RecoveryMessage(_) => MessageKind::RecoveryMessage,
        }
    }

    fn encode(&self, w: &mut WireWriter) {
        match self {
            ConsensusPayload::Proposal {
                prev_hash,
                timestamp_ms,
                tx_hashes,
            } => {
                w.write_hash(prev_hash);
                w.write_u64(*timestamp_ms);
                w.write_hashes(tx_hashes);
            }
            ConsensusPayload::Acknowledgment { proposal_hash } => {
                w.write_hash(proposal_hash);
            }
            ConsensusPayload::Commitment { signature } => {
                w.write_raw(signature);
            }
            ConsensusPayload::ChangeView {
                new_view,
                timestamp_ms,
            } => {
                w.write_u32(*new_view);
                w.write_u64(*timestamp_ms);
            }
            ConsensusPayload::RecoveryRequest => {}
            ConsensusPayload::RecoveryMessage(recovery) => {
                match &recovery.proposal {
                    Some(proposal) => {
                        w.write_u8(1);
                        w.write_bytes(&proposal.encode());
                    }
                    None => w.write_u8(0),
                }
                for group in [
                    &recovery.acknowledgments,
                    &recovery.commitments,
                    &recovery.change_views,
                ] {
                    w.write_u32(group.len() as u32);
                    for envelope in group.iter() {
                        w.write_bytes(&envelope.encode());
                    }
                }
            }
        }
    }

    fn decode(kind: MessageKind, r: &mut WireReader<'_>) -> Result<Self, WireError> {
        match kind {
            MessageKind::Proposal => Ok(ConsensusPayload::Proposal {
                prev_hash: r.read_hash()?,
                timestamp_ms: r.read_u64()?,
                tx_hashes: r.read_hashes()?,
            }),
            MessageKind::Acknowledgment => Ok(ConsensusPayload::Acknowledgment {
                proposal_hash: r.read_hash()?,
            }),
            MessageKind::Commitment => Ok(ConsensusPayload::Commitment {
                signature: r.read_raw(SIGNATURE_LENGTH)?.to_vec(),
            }),
            MessageKind::ChangeView => Ok(ConsensusPayload::ChangeView {
                new_view: r.read_u32()?,
                timestamp_ms: r.read_u64()?,
            }),
            MessageKind::RecoveryRequest => Ok(ConsensusPayload::RecoveryRequest),
            MessageKind::RecoveryMessage => {
                let proposal = match r.read_u8()? {
                    0 => None,
                    1 => {
                        let bytes = r.read_bytes()?;
                        let envelope = Envelope::decode_inner(&bytes)?;
                        Some(Box::new(envelope))
                    }
                    other => return Err(WireError::UnknownKind(other)),
                };
                let mut groups: [Vec<Envelope>; 3] = Default::default();
                for group in groups.iter_mut() {
                    let count = r.read_u32()? as usize;
                    if count > r.remaining() {
                        return Err(WireError::LengthOverflow {
                            declared: count,
                            remaining: r.remaining(),
                        });
                    }
                    for _ in 0..count {
                        let bytes = r.read_bytes()?;
                        group.push(Envelope::decode_inner(&bytes)?);
                    }
                }
                let [acknowledgments, commitments, change_views] = groups;
                Ok(ConsensusPayload::RecoveryMessage(RecoveryPayload {
                    proposal,
                    acknowledgments,
                    commitments,
                    change_views,
                }))
            }
        }
    }
}

/// A signed consensus message from one validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub height: Height,
    pub view: View,
    pub payload: ConsensusPayload,
    pub signer: ValidatorIndex,
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Construct and sign in one step.
    pub fn signed(
        height: Height,
        view: View,
        payload: ConsensusPayload,
        signer: ValidatorIndex,
        keypair: &SigningKeyPair,
    ) -> Self {
        let mut envelope = Envelope {
            height,
            view,
            payload,
            signer,
            signature: Vec::new(),
        };
        envelope.signature = keypair.sign(&envelope.signed_bytes()).to_vec();
        envelope
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// The exact bytes covered by the signature: everything before the
    /// signature block.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_u8(self.kind() as u8);
        w.write_u64(self.height);
        w.write_u32(self.view);
        self.payload.encode(&mut w);
        w.into_bytes()
    }

    /// Full wire encoding: signed bytes followed by the signature block.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_raw(&self.signed_bytes());
        w.write_u16(self.signer);
        w.write_raw(&self.signature);
        w.into_bytes()
    }

    /// Decode a full envelope, rejecting trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let envelope = Self::decode_any(bytes)?;
        Ok(envelope)
    }

    /// Decode an envelope nested inside a RecoveryMessage. Recovery kinds
    /// are not allowed to nest.
    fn decode_inner(bytes: &[u8]) -> Result<Self, WireError> {
        let envelope = Self::decode_any(bytes)?;
        match envelope.kind() {
            MessageKind::RecoveryRequest | MessageKind::RecoveryMessage => {
                Err(WireError::UnknownKind(envelope.kind() as u8))
            }
            _ => Ok(envelope),
        }
    }

    fn decode_any(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(bytes);
        let kind = MessageKind::from_tag(r.read_u8()?)?;
        let height = r.read_u64()?;
        let view = r.read_u32()?;
        let payload = ConsensusPayload::decode(kind, &mut r)?;
        let signer = r.read_u16()?;
        let signature = r.read_raw(SIGNATURE_LENGTH)?.to_vec();
        r.finish()?;
        Ok(Envelope {
            height,
            view,
            payload,
            signer,
            signature,
        })
    }

    /// Verify the signature against the signer's public key as resolved
    /// through the validator set for this height.
    pub fn verify(&self, validators: &ValidatorSet) -> Result<(), TalosError> {
        let public_key = validators
            .public_key(self.signer)
            .ok_or(ConsensusError::UnknownValidator(self.signer))?;
        crypto::verify_signature(public_key, &self.signed_bytes(), &self.signature)?;
        Ok(())
    }
}

/// Deterministic digest identifying a proposed block: all honest nodes
/// derive the same hash from the same proposal content. The state root is
/// deliberately absent; it is computed by execution after finalization.
pub fn proposal_digest(
    height: Height,
    prev_hash: &Hash,
    timestamp_ms: u64,
    tx_hashes: &[Hash],
) -> Hash {
    let mut w = WireWriter::new();
    w.write_u64(height);
    w.write_hash(prev_hash);
    w.write_u64(timestamp_ms);
    w.write_hashes(tx_hashes);
    crypto::sha256(w.as_slice())
}

/// Transaction root over the ordered transaction hashes.
pub fn tx_root(tx_hashes: &[Hash]) -> Hash {
    let parts: Vec<&[u8]> = tx_hashes.iter().map(|h| h.as_ref()).collect();
    crypto::sha256_parts(&parts)
}
