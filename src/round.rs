//! Funding round lifecycle.
//!
//! `Open → VotingClosed → Tallying → Finalized`, with `Cancelled` reachable
//! from every phase before `Finalized`.  Only a finalized round pays recipient
//! claims; only a cancelled round refunds contributors.  The state serialises
//! to JSON so a driver can stop and resume between transactions.

use crate::allocation::{self, alpha_precision, AllocationParams};
use crate::arith::{decimal, decimal_opt, mul_word};
use crate::claim::{self, RecipientClaimData};
use crate::commitment::{self, CommitmentScheme};
use crate::error::{Result, RoundError};
use crate::tally_data::{TallyCommitments, TallyData};
use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Lifecycle phase of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoundPhase {
    /// Accepting contributions and votes.
    Open,
    /// Voting deadline passed; awaiting the tally commitment.
    VotingClosed,
    /// Tally committed; per-recipient results being uploaded.
    Tallying,
    /// Alpha locked in; claims unlocked.
    Finalized,
    /// Round abandoned; refunds unlocked.
    Cancelled,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Open => "open",
            Self::VotingClosed => "voting-closed",
            Self::Tallying => "tallying",
            Self::Finalized => "finalized",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// A contributor's deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    /// Token amount deposited.
    #[serde(with = "decimal")]
    pub amount: BigUint,
    /// Whether the refund has been paid.
    pub withdrawn: bool,
}

/// Per-recipient result accepted by the round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedResult {
    /// Quadratic vote count.
    #[serde(with = "decimal")]
    pub quadratic_votes: BigUint,
    /// Linear spend.
    #[serde(with = "decimal")]
    pub linear_spent: BigUint,
}

/// A paid recipient claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientClaim {
    /// Amount transferred.
    #[serde(with = "decimal")]
    pub amount: BigUint,
}

/// Values revealed at finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeRequest {
    /// Total voice credits spent.
    pub total_spent: BigUint,
    /// Salt of the total-spent commitment.
    pub total_spent_salt: BigUint,
    /// Explicit alpha; derived from the budget when absent.
    pub alpha: Option<BigUint>,
}

/// Blending coefficient that spends the budget left after contributions.
///
/// `alpha = (budget − totalSpent × factor) × 10^18 / (factor × (Σq² − totalSpent))`,
/// capped at `10^18`.
pub fn derive_alpha(
    budget: &BigUint,
    quadratic_weight_total: &BigUint,
    total_spent: &BigUint,
    voice_credit_factor: &BigUint,
) -> Result<BigUint> {
    if voice_credit_factor.is_zero() {
        return Err(RoundError::params("voice credit factor must be positive"));
    }
    let contributions = mul_word(total_spent, voice_credit_factor, "totalSpent × factor")?;
    if *budget < contributions {
        return Err(RoundError::params(format!(
            "budget {budget} is below contributed amount {contributions}"
        )));
    }
    if quadratic_weight_total <= total_spent {
        return Err(RoundError::params(
            "no recipient received more than one vote; alpha is undefined",
        ));
    }
    let numerator = mul_word(&(budget - &contributions), &alpha_precision(), "alpha numerator")?;
    let denominator = mul_word(
        voice_credit_factor,
        &(quadratic_weight_total - total_spent),
        "alpha denominator",
    )?;
    Ok((numerator / denominator).min(alpha_precision()))
}

/// State of one funding round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingRound {
    #[serde(with = "decimal")]
    matching_pool: BigUint,
    #[serde(with = "decimal")]
    voice_credit_factor: BigUint,
    recipient_count: usize,
    recipient_tree_depth: u8,
    phase: RoundPhase,
    contributions: BTreeMap<String, Contribution>,
    #[serde(default)]
    commitments: Option<TallyCommitments>,
    #[serde(default)]
    tally_checksum: Option<String>,
    #[serde(default)]
    uploaded: Vec<UploadedResult>,
    #[serde(default, with = "decimal_opt")]
    total_spent: Option<BigUint>,
    #[serde(default, with = "decimal_opt")]
    alpha: Option<BigUint>,
    #[serde(default)]
    claims: BTreeMap<usize, RecipientClaim>,
}

impl FundingRound {
    /// Opens a round.
    pub fn new(
        matching_pool: BigUint,
        voice_credit_factor: BigUint,
        recipient_count: usize,
        recipient_tree_depth: u8,
    ) -> Result<Self> {
        if voice_credit_factor.is_zero() {
            return Err(RoundError::params("voice credit factor must be positive"));
        }
        commitment::ensure_capacity(recipient_tree_depth, recipient_count)?;
        Ok(Self {
            matching_pool,
            voice_credit_factor,
            recipient_count,
            recipient_tree_depth,
            phase: RoundPhase::Open,
            contributions: BTreeMap::new(),
            commitments: None,
            tally_checksum: None,
            uploaded: Vec::new(),
            total_spent: None,
            alpha: None,
            claims: BTreeMap::new(),
        })
    }

    /// Reads a persisted round.
    pub fn load(path: &Path) -> Result<Self> {
        crate::io::read_json(path)
    }

    /// Persists the round.
    pub fn save(&self, path: &Path) -> Result<()> {
        crate::io::write_json(path, self)
    }

    /// Current phase.
    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    /// Matching pool size.
    pub fn matching_pool(&self) -> &BigUint {
        &self.matching_pool
    }

    /// Token units per voice credit.
    pub fn voice_credit_factor(&self) -> &BigUint {
        &self.voice_credit_factor
    }

    /// Number of recipient slots.
    pub fn recipient_count(&self) -> usize {
        self.recipient_count
    }

    /// Number of recipient results accepted so far.
    pub fn uploaded_count(&self) -> usize {
        self.uploaded.len()
    }

    /// Final alpha, once finalized.
    pub fn alpha(&self) -> Option<&BigUint> {
        self.alpha.as_ref()
    }

    /// Commitments recorded at tally submission.
    pub fn commitments(&self) -> Option<&TallyCommitments> {
        self.commitments.as_ref()
    }

    /// Checksum of the submitted tally file.
    pub fn tally_checksum(&self) -> Option<&str> {
        self.tally_checksum.as_deref()
    }

    /// Sum of all contributions.
    pub fn total_contributions(&self) -> BigUint {
        self.contributions
            .values()
            .fold(BigUint::zero(), |acc, c| acc + &c.amount)
    }

    /// Matching pool plus contributions.
    pub fn budget(&self) -> BigUint {
        &self.matching_pool + self.total_contributions()
    }

    fn require(&self, expected: RoundPhase, action: &'static str) -> Result<()> {
        if self.phase == RoundPhase::Finalized && expected != RoundPhase::Finalized {
            return Err(RoundError::AlreadyFinalized);
        }
        if self.phase != expected {
            return Err(RoundError::InvalidStateTransition {
                phase: self.phase,
                action,
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: RoundPhase) {
        tracing::info!(from = %self.phase, to = %next, "round phase changed");
        self.phase = next;
    }

    /// Records a contribution; one per contributor, only while open.
    pub fn contribute(&mut self, contributor: &str, amount: BigUint) -> Result<()> {
        self.require(RoundPhase::Open, "contribute")?;
        let contributor = contributor.trim();
        if contributor.is_empty() {
            return Err(RoundError::invalid_input("contributor address is empty"));
        }
        if amount.is_zero() {
            return Err(RoundError::invalid_input("contribution amount must be positive"));
        }
        if self.contributions.contains_key(contributor) {
            return Err(RoundError::invalid_input(format!(
                "{contributor} has already contributed"
            )));
        }
        self.contributions.insert(
            contributor.to_string(),
            Contribution {
                amount,
                withdrawn: false,
            },
        );
        Ok(())
    }

    /// Closes voting once the external deadline has elapsed.
    pub fn close_voting(&mut self, deadline_elapsed: bool) -> Result<()> {
        self.require(RoundPhase::Open, "close voting")?;
        if !deadline_elapsed {
            return Err(RoundError::InvalidStateTransition {
                phase: self.phase,
                action: "close voting before the deadline",
            });
        }
        self.transition(RoundPhase::VotingClosed);
        Ok(())
    }

    /// Accepts the tally commitment recorded on-chain.
    ///
    /// `data` is the revealed tally file; its recomputed commitments must equal
    /// `committed` exactly.
    pub fn submit_tally(
        &mut self,
        committed: &TallyCommitments,
        data: &TallyData,
        scheme: &dyn CommitmentScheme,
    ) -> Result<()> {
        self.require(RoundPhase::VotingClosed, "submit a tally")?;
        let count = data.recipient_count();
        if count > self.recipient_count {
            return Err(RoundError::RecipientIndexOutOfBounds {
                index: self.recipient_count,
                count: self.recipient_count,
            });
        }
        if count < self.recipient_count {
            return Err(RoundError::invalid_input(format!(
                "tally covers {count} recipients but the round has {}",
                self.recipient_count
            )));
        }
        if data.tree_depth() != self.recipient_tree_depth {
            return Err(RoundError::invalid_input(format!(
                "tally tree depth {} differs from round depth {}",
                data.tree_depth(),
                self.recipient_tree_depth
            )));
        }
        data.validate()?;
        let computed = data.verified_commitments(scheme)?;
        if computed != *committed {
            return Err(RoundError::mismatch(
                "tally file does not reproduce the committed tally",
            ));
        }
        self.commitments = Some(computed);
        self.tally_checksum = Some(data.checksum()?);
        self.transition(RoundPhase::Tallying);
        Ok(())
    }

    /// Uploads results for recipients `start ..`; returns the uploaded count.
    ///
    /// Re-sending already accepted entries is allowed when they are identical,
    /// so an interrupted upload resumes from any earlier position.
    pub fn upload_tally_batch(
        &mut self,
        start: usize,
        batch: &[RecipientClaimData],
        scheme: &dyn CommitmentScheme,
    ) -> Result<usize> {
        self.require(RoundPhase::Tallying, "upload tally results")?;
        let commitments = self
            .commitments
            .clone()
            .ok_or_else(|| RoundError::mismatch("no tally commitment recorded"))?;
        if start > self.uploaded.len() {
            return Err(RoundError::invalid_input(format!(
                "batch starts at {start} but only {} results are uploaded",
                self.uploaded.len()
            )));
        }
        for (offset, claim) in batch.iter().enumerate() {
            let index = start + offset;
            if claim.recipient_index != index {
                return Err(RoundError::invalid_input(format!(
                    "batch position {offset} holds recipient {} instead of {index}",
                    claim.recipient_index
                )));
            }
            if index >= self.recipient_count {
                return Err(RoundError::RecipientIndexOutOfBounds {
                    index,
                    count: self.recipient_count,
                });
            }
            if claim.recipient_tree_depth != self.recipient_tree_depth {
                return Err(RoundError::invalid_input(format!(
                    "recipient {index}: proof depth {} differs from round depth {}",
                    claim.recipient_tree_depth, self.recipient_tree_depth
                )));
            }
            claim::verify_claim_data(claim, &commitments, scheme)?;
            let result = UploadedResult {
                quadratic_votes: claim.result.clone(),
                linear_spent: claim.spent.clone(),
            };
            match self.uploaded.get(index) {
                Some(existing) if *existing == result => {}
                Some(_) => {
                    return Err(RoundError::mismatch(format!(
                        "recipient {index} was already uploaded with different values"
                    )))
                }
                None => self.uploaded.push(result),
            }
        }
        tracing::info!(
            start,
            batch = batch.len(),
            uploaded = self.uploaded.len(),
            total = self.recipient_count,
            "tally results uploaded"
        );
        Ok(self.uploaded.len())
    }

    /// Locks in the total spend and alpha; returns the final alpha.
    pub fn finalize(
        &mut self,
        request: FinalizeRequest,
        scheme: &dyn CommitmentScheme,
    ) -> Result<BigUint> {
        self.require(RoundPhase::Tallying, "finalize")?;
        if self.uploaded.len() != self.recipient_count {
            return Err(RoundError::invalid_input(format!(
                "only {} of {} recipient results are uploaded",
                self.uploaded.len(),
                self.recipient_count
            )));
        }
        if request.total_spent.is_zero() {
            return Err(RoundError::params("no votes were cast"));
        }
        let commitments = self
            .commitments
            .as_ref()
            .ok_or_else(|| RoundError::mismatch("no tally commitment recorded"))?;
        let spent_commitment =
            commitment::spent_commitment(scheme, &request.total_spent, &request.total_spent_salt);
        if spent_commitment != commitments.total_spent {
            return Err(RoundError::mismatch(
                "total spent and salt do not match the committed value",
            ));
        }
        let linear_total = self
            .uploaded
            .iter()
            .fold(BigUint::zero(), |acc, r| acc + &r.linear_spent);
        if linear_total != request.total_spent {
            return Err(RoundError::mismatch(format!(
                "uploaded spend sums to {linear_total} but total spent is {}",
                request.total_spent
            )));
        }
        let alpha = match request.alpha {
            Some(alpha) => alpha,
            None => {
                let quadratic_total = self.uploaded.iter().fold(BigUint::zero(), |acc, r| {
                    acc + &r.quadratic_votes * &r.quadratic_votes
                });
                derive_alpha(
                    &self.budget(),
                    &quadratic_total,
                    &request.total_spent,
                    &self.voice_credit_factor,
                )?
            }
        };
        let params = AllocationParams::new(alpha.clone(), self.voice_credit_factor.clone())?;
        let allocated = self.uploaded.iter().try_fold(BigUint::zero(), |acc, r| {
            Ok::<_, RoundError>(
                acc + allocation::allocated_amount(&r.quadratic_votes, &r.linear_spent, &params)?,
            )
        })?;
        if allocated > self.budget() {
            return Err(RoundError::params(format!(
                "alpha {alpha} allocates {allocated}, above the budget of {}",
                self.budget()
            )));
        }
        tracing::info!(
            alpha = %alpha,
            total_spent = %request.total_spent,
            budget = %self.budget(),
            "round finalized"
        );
        self.alpha = Some(alpha.clone());
        self.total_spent = Some(request.total_spent);
        self.transition(RoundPhase::Finalized);
        Ok(alpha)
    }

    /// Cancels the round; terminal.
    pub fn cancel(&mut self) -> Result<()> {
        match self.phase {
            RoundPhase::Finalized => Err(RoundError::AlreadyFinalized),
            RoundPhase::Cancelled => Err(RoundError::InvalidStateTransition {
                phase: self.phase,
                action: "cancel",
            }),
            _ => {
                self.transition(RoundPhase::Cancelled);
                Ok(())
            }
        }
    }

    /// Refunds a contribution in a cancelled round.
    pub fn withdraw(&mut self, contributor: &str) -> Result<BigUint> {
        self.require(RoundPhase::Cancelled, "withdraw")?;
        let contributor = contributor.trim();
        let entry = self.contributions.get_mut(contributor).ok_or_else(|| {
            RoundError::invalid_input(format!("{contributor} has no contribution"))
        })?;
        if entry.withdrawn {
            return Err(RoundError::AlreadyWithdrawn(contributor.to_string()));
        }
        entry.withdrawn = true;
        tracing::info!(contributor, amount = %entry.amount, "contribution refunded");
        Ok(entry.amount.clone())
    }

    /// Amount recipient `recipient_index` is entitled to; pure, repeatable.
    pub fn allocated_amount(&self, recipient_index: usize) -> Result<BigUint> {
        if self.phase != RoundPhase::Finalized {
            return Err(RoundError::InvalidStateTransition {
                phase: self.phase,
                action: "compute allocations",
            });
        }
        let result = self.uploaded.get(recipient_index).ok_or(
            RoundError::RecipientIndexOutOfBounds {
                index: recipient_index,
                count: self.recipient_count,
            },
        )?;
        let alpha = self.alpha.clone().unwrap_or_default();
        let params = AllocationParams::new(alpha, self.voice_credit_factor.clone())?;
        allocation::allocated_amount(&result.quadratic_votes, &result.linear_spent, &params)
    }

    /// Pays recipient `recipient_index`; single use.
    pub fn claim(&mut self, recipient_index: usize) -> Result<BigUint> {
        if self.phase != RoundPhase::Finalized {
            return Err(RoundError::InvalidStateTransition {
                phase: self.phase,
                action: "claim funds",
            });
        }
        if self.claims.contains_key(&recipient_index) {
            return Err(RoundError::AlreadyClaimed(recipient_index));
        }
        let amount = self.allocated_amount(recipient_index)?;
        let paid = self.total_claimed() + &amount;
        if paid > self.budget() {
            return Err(RoundError::params(format!(
                "claim of {amount} would pay out {paid}, above the budget of {}",
                self.budget()
            )));
        }
        self.claims.insert(
            recipient_index,
            RecipientClaim {
                amount: amount.clone(),
            },
        );
        tracing::info!(recipient_index, amount = %amount, "recipient claimed");
        Ok(amount)
    }

    /// Sum of the claims paid so far.
    pub fn total_claimed(&self) -> BigUint {
        self.claims
            .values()
            .fold(BigUint::zero(), |acc, c| acc + &c.amount)
    }

    /// Whether `recipient_index` has claimed.
    pub fn is_claimed(&self, recipient_index: usize) -> bool {
        self.claims.contains_key(&recipient_index)
    }

    /// Checks that `data` is byte-for-byte the tally that was submitted.
    pub fn verify_tally_checksum(&self, data: &TallyData) -> Result<()> {
        let recorded = self
            .tally_checksum
            .as_deref()
            .ok_or_else(|| RoundError::mismatch("no tally has been submitted"))?;
        let actual = data.checksum()?;
        if actual != recorded {
            return Err(RoundError::mismatch(format!(
                "tally checksum {actual} does not match submitted {recorded}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::KeccakFieldCommitment;
    use crate::io::temp_path;

    fn big(v: u64) -> BigUint {
        BigUint::from(v)
    }

    // R1: one voter with 81 credits; R2: voters with 36 and 4 credits.
    fn tally() -> TallyData {
        TallyData::from_json_str(
            r#"{
                "maci": "0x00000000000000000000000000000000000000aa",
                "pollId": "0",
                "recipientTreeDepth": 1,
                "results": {"tally": ["0", "9", "8"], "salt": "71"},
                "perVOSpentVoiceCredits": {"tally": ["0", "81", "40"], "salt": "72"},
                "totalSpentVoiceCredits": {"spent": "121", "salt": "73"}
            }"#,
        )
        .unwrap()
    }

    fn open_round(pool: u64) -> FundingRound {
        let mut round = FundingRound::new(big(pool), big(1), 3, 1).unwrap();
        round.contribute("0xa", big(81)).unwrap();
        round.contribute("0xb", big(36)).unwrap();
        round.contribute("0xc", big(4)).unwrap();
        round
    }

    fn tallying_round(pool: u64) -> (FundingRound, TallyData) {
        let scheme = KeccakFieldCommitment;
        let data = tally();
        let committed = data.compute_commitments(&scheme).unwrap();
        let mut round = open_round(pool);
        round.close_voting(true).unwrap();
        round.submit_tally(&committed, &data, &scheme).unwrap();
        (round, data)
    }

    fn upload_all(round: &mut FundingRound, data: &TallyData) {
        let scheme = KeccakFieldCommitment;
        let batch = claim::tally_results_batch(data, 0, 10, &scheme).unwrap();
        assert_eq!(round.upload_tally_batch(0, &batch, &scheme).unwrap(), 3);
    }

    fn finalize_request(alpha: Option<BigUint>) -> FinalizeRequest {
        FinalizeRequest {
            total_spent: big(121),
            total_spent_salt: big(73),
            alpha,
        }
    }

    #[test]
    fn derived_alpha_exhausts_budget() {
        let scheme = KeccakFieldCommitment;
        let (mut round, data) = tallying_round(12);
        upload_all(&mut round, &data);
        let alpha = round.finalize(finalize_request(None), &scheme).unwrap();
        assert_eq!(alpha, big(500_000_000_000_000_000));
        assert_eq!(round.claim(1).unwrap(), big(81));
        assert_eq!(round.claim(2).unwrap(), big(52));
        assert_eq!(round.claim(0).unwrap(), big(0));
        assert_eq!(round.budget(), big(133));
        assert_eq!(round.total_claimed(), big(133));
    }

    #[test]
    fn explicit_alpha_cannot_exceed_budget() {
        let scheme = KeccakFieldCommitment;
        let (mut round, data) = tallying_round(12);
        upload_all(&mut round, &data);
        // 81 + 64 at full quadratic weight against a budget of 133
        assert!(matches!(
            round.finalize(finalize_request(Some(alpha_precision())), &scheme),
            Err(RoundError::InvalidParameters(_))
        ));
        assert_eq!(round.phase(), RoundPhase::Tallying);
        assert_eq!(round.alpha(), None);
        let alpha = round
            .finalize(finalize_request(Some(big(500_000_000_000_000_000))), &scheme)
            .unwrap();
        assert_eq!(alpha, big(500_000_000_000_000_000));
    }

    #[test]
    fn claims_never_pay_past_budget() {
        let scheme = KeccakFieldCommitment;
        let (mut round, data) = tallying_round(12);
        upload_all(&mut round, &data);
        round.finalize(finalize_request(None), &scheme).unwrap();
        let mut state = serde_json::to_value(&round).unwrap();
        state["alpha"] = serde_json::Value::from("1000000000000000000");
        let mut round: FundingRound = serde_json::from_value(state).unwrap();
        assert_eq!(round.claim(1).unwrap(), big(81));
        assert!(matches!(round.claim(2), Err(RoundError::InvalidParameters(_))));
        assert!(!round.is_claimed(2));
        assert_eq!(round.total_claimed(), big(81));
    }

    #[test]
    fn derive_alpha_edges() {
        let precision = alpha_precision();
        assert_eq!(derive_alpha(&big(10_000), &big(145), &big(121), &big(1)).unwrap(), precision);
        assert_eq!(derive_alpha(&big(121), &big(145), &big(121), &big(1)).unwrap(), big(0));
        assert!(matches!(
            derive_alpha(&big(100), &big(145), &big(121), &big(1)),
            Err(RoundError::InvalidParameters(_))
        ));
        assert!(matches!(
            derive_alpha(&big(1_000), &big(121), &big(121), &big(1)),
            Err(RoundError::InvalidParameters(_))
        ));
    }

    #[test]
    fn claims_are_single_use() {
        let scheme = KeccakFieldCommitment;
        let (mut round, data) = tallying_round(12);
        upload_all(&mut round, &data);
        round.finalize(finalize_request(Some(big(0))), &scheme).unwrap();
        assert_eq!(round.allocated_amount(1).unwrap(), big(81));
        round.claim(1).unwrap();
        assert_eq!(round.claim(1), Err(RoundError::AlreadyClaimed(1)));
        assert_eq!(round.allocated_amount(1).unwrap(), big(81));
        assert!(round.is_claimed(1));
        assert!(matches!(
            round.claim(3),
            Err(RoundError::RecipientIndexOutOfBounds { index: 3, count: 3 })
        ));
    }

    #[test]
    fn finalization_is_one_time_and_excludes_cancel() {
        let scheme = KeccakFieldCommitment;
        let (mut round, data) = tallying_round(12);
        upload_all(&mut round, &data);
        round.finalize(finalize_request(None), &scheme).unwrap();
        assert_eq!(
            round.finalize(finalize_request(None), &scheme),
            Err(RoundError::AlreadyFinalized)
        );
        assert_eq!(round.cancel(), Err(RoundError::AlreadyFinalized));
        assert!(matches!(round.withdraw("0xa"), Err(RoundError::AlreadyFinalized)));
    }

    #[test]
    fn finalize_preconditions() {
        let scheme = KeccakFieldCommitment;
        let (mut round, data) = tallying_round(12);
        assert!(matches!(
            round.finalize(finalize_request(None), &scheme),
            Err(RoundError::InvalidInput(_))
        ));
        upload_all(&mut round, &data);
        let mut wrong_salt = finalize_request(None);
        wrong_salt.total_spent_salt = big(74);
        assert!(matches!(
            round.finalize(wrong_salt, &scheme),
            Err(RoundError::CommitmentMismatch(_))
        ));
        let mut no_votes = finalize_request(None);
        no_votes.total_spent = big(0);
        assert!(matches!(
            round.finalize(no_votes, &scheme),
            Err(RoundError::InvalidParameters(_))
        ));
        let too_high = finalize_request(Some(alpha_precision() + 1u32));
        assert!(matches!(
            round.finalize(too_high, &scheme),
            Err(RoundError::InvalidParameters(_))
        ));
        assert_eq!(round.phase(), RoundPhase::Tallying);
    }

    #[test]
    fn lifecycle_gates() {
        let scheme = KeccakFieldCommitment;
        let data = tally();
        let committed = data.compute_commitments(&scheme).unwrap();
        let mut round = open_round(0);
        assert!(matches!(
            round.submit_tally(&committed, &data, &scheme),
            Err(RoundError::InvalidStateTransition { phase: RoundPhase::Open, .. })
        ));
        assert!(round.close_voting(false).is_err());
        assert!(round.claim(1).is_err());
        round.close_voting(true).unwrap();
        assert!(matches!(
            round.contribute("0xd", big(1)),
            Err(RoundError::InvalidStateTransition { .. })
        ));
        let mut forged = committed.clone();
        forged.results += 1u32;
        assert!(matches!(
            round.submit_tally(&forged, &data, &scheme),
            Err(RoundError::CommitmentMismatch(_))
        ));
        assert_eq!(round.phase(), RoundPhase::VotingClosed);
        round.submit_tally(&committed, &data, &scheme).unwrap();
        round.verify_tally_checksum(&data).unwrap();
        let mut edited = data.clone();
        edited.maci = "0x00000000000000000000000000000000000000bb".into();
        assert!(round.verify_tally_checksum(&edited).is_err());
    }

    #[test]
    fn contributions_and_refunds() {
        let mut round = open_round(0);
        assert!(round.contribute("0xa", big(5)).is_err());
        assert!(round.contribute("0xe", big(0)).is_err());
        assert!(matches!(
            round.withdraw("0xa"),
            Err(RoundError::InvalidStateTransition { .. })
        ));
        round.cancel().unwrap();
        assert!(round.cancel().is_err());
        assert_eq!(round.withdraw("0xa").unwrap(), big(81));
        assert_eq!(
            round.withdraw("0xa"),
            Err(RoundError::AlreadyWithdrawn("0xa".into()))
        );
        assert!(round.withdraw("0xz").is_err());
        assert!(matches!(
            round.finalize(finalize_request(None), &KeccakFieldCommitment),
            Err(RoundError::InvalidStateTransition { phase: RoundPhase::Cancelled, .. })
        ));
    }

    #[test]
    fn upload_resumes_and_rejects_conflicts() {
        let scheme = KeccakFieldCommitment;
        let (mut round, data) = tallying_round(12);
        let all = claim::tally_results_batch(&data, 0, 10, &scheme).unwrap();
        assert_eq!(round.upload_tally_batch(0, &all[..2], &scheme).unwrap(), 2);
        // overlap with identical values is skipped
        assert_eq!(round.upload_tally_batch(1, &all[1..], &scheme).unwrap(), 3);
        assert!(matches!(
            round.upload_tally_batch(4, &all[..1], &scheme),
            Err(RoundError::InvalidInput(_))
        ));
        let mut forged = all[1].clone();
        forged.result += 1u32;
        assert!(matches!(
            round.upload_tally_batch(1, &[forged], &scheme),
            Err(RoundError::CommitmentMismatch(_))
        ));
        assert_eq!(round.uploaded_count(), 3);
    }

    #[test]
    fn state_survives_save_and_load() {
        let scheme = KeccakFieldCommitment;
        let (mut round, data) = tallying_round(12);
        upload_all(&mut round, &data);
        round.finalize(finalize_request(None), &scheme).unwrap();
        round.claim(2).unwrap();
        let path = temp_path("round").join("round.json");
        round.save(&path).unwrap();
        let mut loaded = FundingRound::load(&path).unwrap();
        assert_eq!(loaded, round);
        assert_eq!(loaded.claim(2), Err(RoundError::AlreadyClaimed(2)));
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
