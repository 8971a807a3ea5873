//! Tally data file exchanged with the MACI tooling and the round contract.
//!
//! All big integers are decimal strings.  `results.tally[i]` holds recipient
//! `i`'s quadratic vote count and `perVOSpentVoiceCredits.tally[i]` its linear
//! spend.  Commitment fields are optional on input; when present they are
//! checked against recomputed values.

use crate::arith::{decimal, decimal_opt, decimal_vec};
use crate::commitment::{self, CommitmentScheme};
use crate::error::{Result, RoundError};
use crate::tally::{RecipientTallyEntry, Tally};
use blake2::digest::{consts::U32, Digest};
use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::path::Path;

type Blake2b256 = blake2::Blake2b<U32>;

/// One per-recipient section of the tally file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallySection {
    /// Value per recipient index.
    #[serde(with = "decimal_vec")]
    pub tally: Vec<BigUint>,
    /// Commitment salt.
    #[serde(with = "decimal")]
    pub salt: BigUint,
    /// `hash2(root(tally), salt)`, when recorded.
    #[serde(default, with = "decimal_opt", skip_serializing_if = "Option::is_none")]
    pub commitment: Option<BigUint>,
}

/// Total voice credits spent in the round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentSection {
    /// Total spent.
    #[serde(with = "decimal")]
    pub spent: BigUint,
    /// Commitment salt.
    #[serde(with = "decimal")]
    pub salt: BigUint,
    /// `hash2(spent, salt)`, when recorded.
    #[serde(default, with = "decimal_opt", skip_serializing_if = "Option::is_none")]
    pub commitment: Option<BigUint>,
}

/// Full tally file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyData {
    /// Address of the MACI instance the poll belongs to.
    pub maci: String,
    /// Poll identifier.
    #[serde(with = "decimal")]
    pub poll_id: BigUint,
    /// Depth of the recipient Merkle tree, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_tree_depth: Option<u8>,
    /// Quadratic vote counts.
    pub results: TallySection,
    /// Linear spend per recipient.
    #[serde(rename = "perVOSpentVoiceCredits")]
    pub per_vo_spent_voice_credits: TallySection,
    /// Total spend.
    pub total_spent_voice_credits: SpentSection,
}

/// The three commitments a round records for a tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyCommitments {
    /// Commitment to the quadratic vote counts.
    #[serde(with = "decimal")]
    pub results: BigUint,
    /// Commitment to the per-recipient linear spend.
    #[serde(with = "decimal")]
    pub per_vo_spent: BigUint,
    /// Commitment to the total spend.
    #[serde(with = "decimal")]
    pub total_spent: BigUint,
}

impl TallyData {
    /// Builds the file form of `tally`, recording all three commitments.
    pub fn from_tally(
        tally: &Tally,
        maci: impl Into<String>,
        poll_id: BigUint,
        depth: u8,
        scheme: &dyn CommitmentScheme,
    ) -> Result<Self> {
        let mut data = Self {
            maci: maci.into(),
            poll_id,
            recipient_tree_depth: Some(depth),
            results: TallySection {
                tally: tally.entries.iter().map(|e| e.quadratic_votes.clone()).collect(),
                salt: tally.results_salt.clone(),
                commitment: None,
            },
            per_vo_spent_voice_credits: TallySection {
                tally: tally.entries.iter().map(|e| e.linear_spent.clone()).collect(),
                salt: tally.per_vo_salt.clone(),
                commitment: None,
            },
            total_spent_voice_credits: SpentSection {
                spent: tally.total_spent.clone(),
                salt: tally.spent_salt.clone(),
                commitment: None,
            },
        };
        let commitments = data.compute_commitments(scheme)?;
        data.results.commitment = Some(commitments.results);
        data.per_vo_spent_voice_credits.commitment = Some(commitments.per_vo_spent);
        data.total_spent_voice_credits.commitment = Some(commitments.total_spent);
        Ok(data)
    }

    /// Parses a tally file body.
    pub fn from_json_str(input: &str) -> Result<Self> {
        serde_json::from_str(input)
            .map_err(|err| RoundError::Decode(format!("invalid tally data: {err}")))
    }

    /// Reads a tally file.
    pub fn load(path: &Path) -> Result<Self> {
        crate::io::read_json(path)
    }

    /// Writes a tally file.
    pub fn save(&self, path: &Path) -> Result<()> {
        crate::io::write_json(path, self)
    }

    /// Number of recipient slots.
    pub fn recipient_count(&self) -> usize {
        self.results.tally.len()
    }

    /// Recorded tree depth, or the smallest depth covering every recipient.
    pub fn tree_depth(&self) -> u8 {
        self.recipient_tree_depth
            .unwrap_or_else(|| commitment::min_depth(self.recipient_count()))
    }

    /// Structural checks: matching section lengths and spend totals.
    pub fn validate(&self) -> Result<()> {
        let count = self.recipient_count();
        let per_vo = self.per_vo_spent_voice_credits.tally.len();
        if per_vo != count {
            return Err(RoundError::invalid_input(format!(
                "results has {count} entries but perVOSpentVoiceCredits has {per_vo}"
            )));
        }
        if self.maci.trim().is_empty() {
            return Err(RoundError::invalid_input("tally data is missing the maci address"));
        }
        commitment::ensure_capacity(self.tree_depth(), count)?;
        self.to_tally()?.check_spent_total()
    }

    /// Converts back into a [`Tally`].
    pub fn to_tally(&self) -> Result<Tally> {
        let per_vo = &self.per_vo_spent_voice_credits.tally;
        if per_vo.len() != self.results.tally.len() {
            return Err(RoundError::invalid_input(format!(
                "results has {} entries but perVOSpentVoiceCredits has {}",
                self.results.tally.len(),
                per_vo.len()
            )));
        }
        let entries = self
            .results
            .tally
            .iter()
            .zip(per_vo)
            .enumerate()
            .map(|(recipient_index, (quadratic, linear))| RecipientTallyEntry {
                recipient_index,
                quadratic_votes: quadratic.clone(),
                linear_spent: linear.clone(),
                salt: self.results.salt.clone(),
            })
            .collect();
        Ok(Tally {
            entries,
            total_spent: self.total_spent_voice_credits.spent.clone(),
            results_salt: self.results.salt.clone(),
            per_vo_salt: self.per_vo_spent_voice_credits.salt.clone(),
            spent_salt: self.total_spent_voice_credits.salt.clone(),
        })
    }

    /// Recomputes the three commitments from the file contents.
    pub fn compute_commitments(&self, scheme: &dyn CommitmentScheme) -> Result<TallyCommitments> {
        let depth = self.tree_depth();
        Ok(TallyCommitments {
            results: commitment::tally_result_commitment(
                scheme,
                depth,
                &self.results.tally,
                &self.results.salt,
            )?,
            per_vo_spent: commitment::tally_result_commitment(
                scheme,
                depth,
                &self.per_vo_spent_voice_credits.tally,
                &self.per_vo_spent_voice_credits.salt,
            )?,
            total_spent: commitment::spent_commitment(
                scheme,
                &self.total_spent_voice_credits.spent,
                &self.total_spent_voice_credits.salt,
            ),
        })
    }

    /// Recomputes the commitments and checks any recorded in the file.
    pub fn verified_commitments(&self, scheme: &dyn CommitmentScheme) -> Result<TallyCommitments> {
        let computed = self.compute_commitments(scheme)?;
        let recorded = [
            ("results", &self.results.commitment, &computed.results),
            (
                "perVOSpentVoiceCredits",
                &self.per_vo_spent_voice_credits.commitment,
                &computed.per_vo_spent,
            ),
            (
                "totalSpentVoiceCredits",
                &self.total_spent_voice_credits.commitment,
                &computed.total_spent,
            ),
        ];
        for (section, recorded, computed) in recorded {
            if let Some(recorded) = recorded {
                if recorded != computed {
                    return Err(RoundError::mismatch(format!(
                        "{section} commitment {recorded} does not match recomputed {computed}"
                    )));
                }
            }
        }
        Ok(computed)
    }

    /// Commitments as recorded in the file, without recomputing them.
    pub fn recorded_commitments(&self) -> Result<TallyCommitments> {
        let recorded = |section: &str, value: &Option<BigUint>| {
            value.clone().ok_or_else(|| {
                RoundError::invalid_input(format!("{section} records no commitment"))
            })
        };
        Ok(TallyCommitments {
            results: recorded("results", &self.results.commitment)?,
            per_vo_spent: recorded(
                "perVOSpentVoiceCredits",
                &self.per_vo_spent_voice_credits.commitment,
            )?,
            total_spent: recorded(
                "totalSpentVoiceCredits",
                &self.total_spent_voice_credits.commitment,
            )?,
        })
    }

    /// Sum of the quadratic weights `Σ quadratic_votes²`.
    pub fn quadratic_weight_total(&self) -> BigUint {
        self.results
            .tally
            .iter()
            .fold(BigUint::zero(), |acc, votes| acc + votes * votes)
    }

    /// BLAKE2b-256 of the canonical (compact) JSON encoding, hex encoded.
    pub fn checksum(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)
            .map_err(|err| RoundError::Decode(format!("failed to encode tally data: {err}")))?;
        let mut hasher = Blake2b256::new();
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::KeccakFieldCommitment;
    use crate::io::temp_path;

    fn sample(scheme: &KeccakFieldCommitment) -> TallyData {
        let json = r#"{
            "maci": "0x00000000000000000000000000000000000000aa",
            "pollId": "0",
            "results": {"tally": ["0", "0", "15"], "salt": "11"},
            "perVOSpentVoiceCredits": {"tally": ["0", "0", "130"], "salt": "12"},
            "totalSpentVoiceCredits": {"spent": "130", "salt": "13"}
        }"#;
        let data = TallyData::from_json_str(json).unwrap();
        data.verified_commitments(scheme).unwrap();
        data
    }

    #[test]
    fn parses_file_and_derives_depth() {
        let scheme = KeccakFieldCommitment;
        let data = sample(&scheme);
        assert_eq!(data.recipient_count(), 3);
        assert_eq!(data.tree_depth(), 1);
        data.validate().unwrap();
        let tally = data.to_tally().unwrap();
        assert_eq!(tally.entry(2).unwrap().linear_spent, BigUint::from(130u32));
        assert_eq!(data.quadratic_weight_total(), BigUint::from(225u32));
    }

    #[test]
    fn recorded_commitments_are_checked() {
        let scheme = KeccakFieldCommitment;
        let data = sample(&scheme);
        let rebuilt = TallyData::from_tally(
            &data.to_tally().unwrap(),
            data.maci.clone(),
            data.poll_id.clone(),
            1,
            &scheme,
        )
        .unwrap();
        let commitments = rebuilt.verified_commitments(&scheme).unwrap();
        assert_eq!(rebuilt.results.commitment.as_ref(), Some(&commitments.results));

        let mut tampered = rebuilt.clone();
        tampered.results.tally[2] = BigUint::from(16u32);
        assert!(matches!(
            tampered.verified_commitments(&scheme),
            Err(RoundError::CommitmentMismatch(_))
        ));
    }

    #[test]
    fn recorded_commitments_read_as_written() {
        let scheme = KeccakFieldCommitment;
        let data = sample(&scheme);
        assert!(matches!(
            data.recorded_commitments(),
            Err(RoundError::InvalidInput(_))
        ));

        let mut rebuilt = TallyData::from_tally(
            &data.to_tally().unwrap(),
            data.maci.clone(),
            data.poll_id.clone(),
            1,
            &scheme,
        )
        .unwrap();
        let computed = rebuilt.compute_commitments(&scheme).unwrap();
        assert_eq!(rebuilt.recorded_commitments().unwrap(), computed);

        // recorded values are returned verbatim, not recomputed
        rebuilt.results.commitment = Some(BigUint::from(5u32));
        let recorded = rebuilt.recorded_commitments().unwrap();
        assert_eq!(recorded.results, BigUint::from(5u32));
        assert_ne!(recorded, computed);

        rebuilt.total_spent_voice_credits.commitment = None;
        assert!(matches!(
            rebuilt.recorded_commitments(),
            Err(RoundError::InvalidInput(_))
        ));
    }

    #[test]
    fn inconsistent_sections_rejected() {
        let scheme = KeccakFieldCommitment;
        let mut data = sample(&scheme);
        data.total_spent_voice_credits.spent = BigUint::from(131u32);
        assert!(matches!(data.validate(), Err(RoundError::CommitmentMismatch(_))));
        data.per_vo_spent_voice_credits.tally.pop();
        assert!(matches!(data.validate(), Err(RoundError::InvalidInput(_))));
    }

    #[test]
    fn checksum_survives_save_and_load() {
        let scheme = KeccakFieldCommitment;
        let data = sample(&scheme);
        let path = temp_path("tally").join("tally.json");
        data.save(&path).unwrap();
        let loaded = TallyData::load(&path).unwrap();
        assert_eq!(loaded.checksum().unwrap(), data.checksum().unwrap());
        let mut changed = loaded.clone();
        changed.results.salt += 1u32;
        assert_ne!(changed.checksum().unwrap(), data.checksum().unwrap());
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
