//! Recipient claim proofs and batch upload planning.
//!
//! A claim carries the recipient's quadratic result and linear spend together
//! with their quinary Merkle paths, so the round contract can check both
//! against the committed roots without trusting this crate.

use crate::arith::{decimal, decimal_nested};
use crate::commitment::{self, CommitmentScheme, QuinTree};
use crate::error::{Result, RoundError};
use crate::tally_data::{TallyCommitments, TallyData};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Proof data submitted when a recipient's tally result is uploaded or claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientClaimData {
    /// Recipient index.
    pub recipient_index: usize,
    /// Depth of the recipient tree the proofs walk.
    pub recipient_tree_depth: u8,
    /// Quadratic vote count.
    #[serde(with = "decimal")]
    pub result: BigUint,
    /// Merkle path of `result` in the results tree.
    #[serde(with = "decimal_nested")]
    pub result_proof: Vec<Vec<BigUint>>,
    /// Salt of the results commitment.
    #[serde(with = "decimal")]
    pub result_salt: BigUint,
    /// Linear spend.
    #[serde(with = "decimal")]
    pub spent: BigUint,
    /// Merkle path of `spent` in the per-recipient spend tree.
    #[serde(with = "decimal_nested")]
    pub spent_proof: Vec<Vec<BigUint>>,
    /// Salt of the per-recipient spend commitment.
    #[serde(with = "decimal")]
    pub spent_salt: BigUint,
    /// `hash2(totalSpent, salt)`.
    #[serde(with = "decimal")]
    pub spent_voice_credits_commitment: BigUint,
    /// Commitment to the per-recipient spend tree.
    #[serde(with = "decimal")]
    pub per_vo_spent_voice_credits_commitment: BigUint,
}

struct ClaimBuilder<'a> {
    data: &'a TallyData,
    depth: u8,
    results: QuinTree,
    spent: QuinTree,
    commitments: TallyCommitments,
}

impl<'a> ClaimBuilder<'a> {
    fn new(data: &'a TallyData, scheme: &dyn CommitmentScheme) -> Result<Self> {
        data.validate()?;
        let depth = data.tree_depth();
        Ok(Self {
            data,
            depth,
            results: QuinTree::new(scheme, depth, &data.results.tally)?,
            spent: QuinTree::new(scheme, depth, &data.per_vo_spent_voice_credits.tally)?,
            commitments: data.verified_commitments(scheme)?,
        })
    }

    fn build(&self, recipient_index: usize) -> Result<RecipientClaimData> {
        let count = self.data.recipient_count();
        if recipient_index >= count {
            return Err(RoundError::RecipientIndexOutOfBounds {
                index: recipient_index,
                count,
            });
        }
        Ok(RecipientClaimData {
            recipient_index,
            recipient_tree_depth: self.depth,
            result: self.data.results.tally[recipient_index].clone(),
            result_proof: self.results.path(recipient_index)?,
            result_salt: self.data.results.salt.clone(),
            spent: self.data.per_vo_spent_voice_credits.tally[recipient_index].clone(),
            spent_proof: self.spent.path(recipient_index)?,
            spent_salt: self.data.per_vo_spent_voice_credits.salt.clone(),
            spent_voice_credits_commitment: self.commitments.total_spent.clone(),
            per_vo_spent_voice_credits_commitment: self.commitments.per_vo_spent.clone(),
        })
    }
}

/// Claim data for one recipient.
pub fn claim_data(
    data: &TallyData,
    recipient_index: usize,
    scheme: &dyn CommitmentScheme,
) -> Result<RecipientClaimData> {
    ClaimBuilder::new(data, scheme)?.build(recipient_index)
}

/// Claim data for recipients `start .. min(start + batch_size, count)`.
pub fn tally_results_batch(
    data: &TallyData,
    start: usize,
    batch_size: usize,
    scheme: &dyn CommitmentScheme,
) -> Result<Vec<RecipientClaimData>> {
    if batch_size == 0 {
        return Err(RoundError::params("batch size must be positive"));
    }
    let count = data.recipient_count();
    if start >= count {
        return Err(RoundError::RecipientIndexOutOfBounds { index: start, count });
    }
    let builder = ClaimBuilder::new(data, scheme)?;
    let end = start.saturating_add(batch_size).min(count);
    (start..end).map(|index| builder.build(index)).collect()
}

/// Checks both Merkle proofs and the commitments a claim references.
pub fn verify_claim_data(
    claim: &RecipientClaimData,
    commitments: &TallyCommitments,
    scheme: &dyn CommitmentScheme,
) -> Result<()> {
    let depth = usize::from(claim.recipient_tree_depth);
    if claim.result_proof.len() != depth || claim.spent_proof.len() != depth {
        return Err(RoundError::invalid_input(format!(
            "recipient {}: proofs must have {depth} levels",
            claim.recipient_index
        )));
    }
    if claim.spent_voice_credits_commitment != commitments.total_spent {
        return Err(RoundError::mismatch(format!(
            "recipient {}: total spent commitment differs from the round's",
            claim.recipient_index
        )));
    }
    if claim.per_vo_spent_voice_credits_commitment != commitments.per_vo_spent {
        return Err(RoundError::mismatch(format!(
            "recipient {}: per-recipient spent commitment differs from the round's",
            claim.recipient_index
        )));
    }
    let sections = [
        ("result", &claim.result, &claim.result_proof, &claim.result_salt, &commitments.results),
        ("spent", &claim.spent, &claim.spent_proof, &claim.spent_salt, &commitments.per_vo_spent),
    ];
    for (label, leaf, proof, salt, expected) in sections {
        let root = commitment::root_from_path(scheme, claim.recipient_index, leaf, proof)
            .ok_or_else(|| {
                RoundError::invalid_input(format!(
                    "recipient {}: malformed {label} proof",
                    claim.recipient_index
                ))
            })?;
        if &scheme.hash2(&root, salt) != expected {
            return Err(RoundError::mismatch(format!(
                "recipient {}: {label} proof does not match the committed root",
                claim.recipient_index
            )));
        }
    }
    Ok(())
}

/// Half-open range of recipient indices uploaded in one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadRange {
    /// First recipient index.
    pub start: usize,
    /// One past the last recipient index.
    pub end: usize,
}

/// Ascending batches covering `uploaded .. total`.
pub fn upload_ranges(total: usize, uploaded: usize, batch_size: usize) -> Result<Vec<UploadRange>> {
    if batch_size == 0 {
        return Err(RoundError::params("batch size must be positive"));
    }
    if uploaded > total {
        return Err(RoundError::invalid_input(format!(
            "{uploaded} entries uploaded but only {total} exist"
        )));
    }
    Ok((uploaded..total)
        .step_by(batch_size)
        .map(|start| UploadRange {
            start,
            end: start.saturating_add(batch_size).min(total),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::KeccakFieldCommitment;

    fn data() -> TallyData {
        TallyData::from_json_str(
            r#"{
                "maci": "0x00000000000000000000000000000000000000aa",
                "pollId": "4",
                "recipientTreeDepth": 2,
                "results": {"tally": ["0", "3", "15", "0", "7", "2", "1"], "salt": "901"},
                "perVOSpentVoiceCredits": {"tally": ["0", "9", "130", "0", "49", "4", "1"], "salt": "902"},
                "totalSpentVoiceCredits": {"spent": "193", "salt": "903"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn every_claim_verifies() {
        let scheme = KeccakFieldCommitment;
        let data = data();
        let commitments = data.compute_commitments(&scheme).unwrap();
        let claims = tally_results_batch(&data, 0, 100, &scheme).unwrap();
        assert_eq!(claims.len(), 7);
        for claim in &claims {
            assert_eq!(claim.result_proof.len(), 2);
            verify_claim_data(claim, &commitments, &scheme).unwrap();
        }
        assert_eq!(claim_data(&data, 4, &scheme).unwrap(), claims[4]);
    }

    #[test]
    fn tampered_claim_rejected() {
        let scheme = KeccakFieldCommitment;
        let data = data();
        let commitments = data.compute_commitments(&scheme).unwrap();
        let mut claim = claim_data(&data, 2, &scheme).unwrap();
        claim.result = BigUint::from(16u32);
        assert!(matches!(
            verify_claim_data(&claim, &commitments, &scheme),
            Err(RoundError::CommitmentMismatch(_))
        ));
        let mut claim = claim_data(&data, 2, &scheme).unwrap();
        claim.spent_proof.pop();
        assert!(matches!(
            verify_claim_data(&claim, &commitments, &scheme),
            Err(RoundError::InvalidInput(_))
        ));
    }

    #[test]
    fn batch_bounds() {
        let scheme = KeccakFieldCommitment;
        let data = data();
        let tail = tally_results_batch(&data, 5, 3, &scheme).unwrap();
        assert_eq!(
            tail.iter().map(|c| c.recipient_index).collect::<Vec<_>>(),
            vec![5, 6]
        );
        assert!(matches!(
            tally_results_batch(&data, 7, 3, &scheme),
            Err(RoundError::RecipientIndexOutOfBounds { index: 7, count: 7 })
        ));
        assert!(matches!(
            claim_data(&data, 9, &scheme),
            Err(RoundError::RecipientIndexOutOfBounds { index: 9, count: 7 })
        ));
    }

    #[test]
    fn upload_plan_resumes_from_count() {
        let ranges = upload_ranges(7, 3, 2).unwrap();
        assert_eq!(
            ranges,
            vec![
                UploadRange { start: 3, end: 5 },
                UploadRange { start: 5, end: 7 },
            ]
        );
        assert!(upload_ranges(7, 7, 2).unwrap().is_empty());
        assert!(upload_ranges(7, 8, 2).is_err());
        assert!(upload_ranges(7, 0, 0).is_err());
    }
}
