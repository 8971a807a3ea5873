//! Tally aggregation over resolved votes.
//!
//! For each recipient the aggregator sums the integer square roots of every
//! contributor's allocation (the quadratic vote count) and the raw voice
//! credits (the linear spend).  Roots are summed before any squaring; the
//! square only appears inside the allocation formula.

use crate::arith::isqrt;
use crate::commitment::field_element_from_bytes;
use crate::error::{Result, RoundError};
use crate::replay::ResolvedVotes;
use num_bigint::BigUint;
use num_traits::Zero;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// Per-recipient quadratic and linear totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientTallyEntry {
    /// Recipient (vote option) index.
    pub recipient_index: usize,
    /// Sum over contributors of `isqrt(voice credits)`.
    #[serde(with = "crate::arith::decimal")]
    pub quadratic_votes: BigUint,
    /// Sum over contributors of raw voice credits.
    #[serde(with = "crate::arith::decimal")]
    pub linear_spent: BigUint,
    /// Salt of the results commitment this entry is proven against.
    #[serde(with = "crate::arith::decimal")]
    pub salt: BigUint,
}

impl RecipientTallyEntry {
    /// `quadratic_votes²`, the matching weight used by the allocation formula.
    pub fn quadratic_weight(&self) -> BigUint {
        &self.quadratic_votes * &self.quadratic_votes
    }
}

/// Complete tally for a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    /// One entry per recipient index, ascending.
    pub entries: Vec<RecipientTallyEntry>,
    /// Total voice credits spent across all contributors.
    pub total_spent: BigUint,
    /// Salt of the results commitment.
    pub results_salt: BigUint,
    /// Salt of the per-recipient spent commitment.
    pub per_vo_salt: BigUint,
    /// Salt of the total-spent commitment.
    pub spent_salt: BigUint,
}

impl Tally {
    /// Number of recipient slots.
    pub fn recipient_count(&self) -> usize {
        self.entries.len()
    }

    /// Entry for `recipient_index`.
    pub fn entry(&self, recipient_index: usize) -> Result<&RecipientTallyEntry> {
        self.entries
            .get(recipient_index)
            .ok_or(RoundError::RecipientIndexOutOfBounds {
                index: recipient_index,
                count: self.entries.len(),
            })
    }

    /// Sum of the linear spend over all recipients.
    pub fn linear_total(&self) -> BigUint {
        self.entries
            .iter()
            .fold(BigUint::zero(), |acc, entry| acc + &entry.linear_spent)
    }

    /// Checks that per-recipient linear totals add up to the total spent.
    pub fn check_spent_total(&self) -> Result<()> {
        let linear = self.linear_total();
        if linear != self.total_spent {
            return Err(RoundError::mismatch(format!(
                "per-recipient spend sums to {linear} but total spent is {}",
                self.total_spent
            )));
        }
        Ok(())
    }
}

/// Deterministic source of commitment salts.
///
/// Salts are field elements derived from a 32-byte seed, so recomputing the
/// tally from the same inputs is byte-identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaltSource {
    seed: [u8; 32],
}

impl SaltSource {
    /// Uses `seed` verbatim.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { seed }
    }

    /// Draws a fresh seed from the operating system RNG.
    pub fn random() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self { seed }
    }

    /// Parses a 64-character hex seed (optional `0x` prefix).
    pub fn from_hex(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(digits)
            .map_err(|err| RoundError::params(format!("invalid salt seed: {err}")))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            RoundError::params(format!("salt seed must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self { seed })
    }

    /// Hex encoding of the seed.
    pub fn to_hex(&self) -> String {
        hex::encode(self.seed)
    }

    /// Salt for the commitment named `label`.
    pub fn derive(&self, label: &str) -> BigUint {
        let mut hasher = Keccak256::new();
        hasher.update(b"QF_ROUND_SALT");
        hasher.update(self.seed);
        hasher.update((label.len() as u64).to_be_bytes());
        hasher.update(label.as_bytes());
        field_element_from_bytes(&hasher.finalize())
    }
}

/// Folds resolved votes into per-recipient totals.
#[derive(Debug, Clone, Copy)]
pub struct TallyAggregator {
    recipient_count: usize,
}

impl TallyAggregator {
    /// Aggregator for `recipient_count` recipient slots.
    pub fn new(recipient_count: usize) -> Self {
        Self { recipient_count }
    }

    /// Produces one entry per recipient, zero entries included.
    ///
    /// Votes outside the recipient range are rejected here; the replayer
    /// already excludes them, so this only fires for hand-built input.
    pub fn aggregate(&self, votes: &ResolvedVotes, salts: &SaltSource) -> Result<Tally> {
        let mut quadratic = vec![BigUint::zero(); self.recipient_count];
        let mut linear = vec![BigUint::zero(); self.recipient_count];
        for user in votes.users.values() {
            for (&recipient_index, entry) in &user.votes {
                if recipient_index >= self.recipient_count {
                    return Err(RoundError::RecipientIndexOutOfBounds {
                        index: recipient_index,
                        count: self.recipient_count,
                    });
                }
                quadratic[recipient_index] += isqrt(&entry.voice_credits);
                linear[recipient_index] += &entry.voice_credits;
            }
        }
        let results_salt = salts.derive("results");
        let entries = quadratic
            .into_iter()
            .zip(linear)
            .enumerate()
            .map(|(recipient_index, (quadratic_votes, linear_spent))| RecipientTallyEntry {
                recipient_index,
                quadratic_votes,
                linear_spent,
                salt: results_salt.clone(),
            })
            .collect();
        // counted per contributor, independently of the per-recipient columns
        let tally = Tally {
            entries,
            total_spent: votes.total_spent(),
            results_salt,
            per_vo_salt: salts.derive("perVOSpentVoiceCredits"),
            spent_salt: salts.derive("totalSpentVoiceCredits"),
        };
        tally.check_spent_total()?;
        tracing::debug!(
            recipients = self.recipient_count,
            contributors = votes.users.len(),
            total_spent = %tally.total_spent,
            "tally aggregated"
        );
        Ok(tally)
    }
}
