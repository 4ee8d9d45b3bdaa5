use serde::{Deserialize, Serialize};
use talos_common::{ConsensusError, Height, ValidatorIndex, View};

/// A single validator: its public key and position in the ordered list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub index: ValidatorIndex,
    pub public_key: Vec<u8>,
}

/// Immutable validator set snapshot for one height.
///
/// Rotation between heights is the ledger store's concern; within a height
/// the set never changes and is freely shared read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
}

impl ValidatorSet {
    /// Build a snapshot from ordered public keys.
    ///
    /// dBFT requires N = 3f + 1, so construction fails fast unless
    /// N >= 4 and (N - 1) % 3 == 0. This is the one fatal configuration
    /// check in the core, performed once at startup.
    pub fn new(public_keys: Vec<Vec<u8>>) -> Result<Self, ConsensusError> {
        let n = public_keys.len();
        if n < 4 || (n - 1) % 3 != 0 {
            return Err(ConsensusError::Configuration { size: n });
        }
        let validators = public_keys
            .into_iter()
            .enumerate()
            .map(|(i, public_key)| Validator {
                index: i as ValidatorIndex,
                public_key,
            })
            .collect();
        Ok(Self { validators })
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Maximum number of Byzantine validators tolerated: f = (N - 1) / 3.
    pub fn fault_tolerance(&self) -> usize {
        (self.validators.len() - 1) / 3
    }

    /// Minimum agreeing set guaranteeing any two quorums intersect in an
    /// honest validator: 2f + 1.
    pub fn quorum_size(&self) -> usize {
        2 * self.fault_tolerance() + 1
    }

    /// Primary (proposer) index for a given height and view.
    ///
    /// Deterministic round-robin so all honest nodes derive the same
    /// primary without communication.
    pub fn primary_index(&self, height: Height, view: View) -> ValidatorIndex {
        ((height + view as u64) % self.validators.len() as u64) as ValidatorIndex
    }

    pub fn get(&self, index: ValidatorIndex) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    /// Public key for a validator index, if the index is in range.
    pub fn public_key(&self, index: ValidatorIndex) -> Option<&[u8]> {
        self.validators
            .get(index as usize)
            .map(|v| v.public_key.as_slice())
    }

    /// Look up the index of a validator by its public key.
    pub fn index_of(&self, public_key: &[u8]) -> Option<ValidatorIndex> {
        self.validators
            .iter()
            .find(|v| v.public_key == public_key)
            .map(|v| v.index)
    }

    pub fn contains(&self, index: ValidatorIndex) -> bool {
        (index as usize) < self.validators.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }
}
