//! Matching-fund allocation.
//!
//! ```text
//! quadratic = quadraticVotes² × voiceCreditFactor × alpha
//! linear    = linearSpent × voiceCreditFactor × (ALPHA_PRECISION − alpha)
//! claimable = (quadratic + linear) / ALPHA_PRECISION
//! ```
//!
//! Products are formed left to right and the single division happens last,
//! exactly as the on-chain contract evaluates it.  Every intermediate value
//! must fit in a 256-bit word.

use crate::arith::{add_word, decimal, mul_word};
use crate::error::{Result, RoundError};
use crate::tally::RecipientTallyEntry;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Fixed-point scale of `alpha` (18 decimals).
pub const ALPHA_PRECISION: u64 = 1_000_000_000_000_000_000;

/// [`ALPHA_PRECISION`] as a big integer.
pub fn alpha_precision() -> BigUint {
    BigUint::from(ALPHA_PRECISION)
}

/// Round parameters the allocation formula depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationParams {
    alpha: BigUint,
    voice_credit_factor: BigUint,
}

impl AllocationParams {
    /// Validates `alpha ∈ [0, ALPHA_PRECISION]`.
    pub fn new(alpha: BigUint, voice_credit_factor: BigUint) -> Result<Self> {
        if alpha > alpha_precision() {
            return Err(RoundError::params(format!(
                "alpha {alpha} exceeds precision {ALPHA_PRECISION}"
            )));
        }
        Ok(Self {
            alpha,
            voice_credit_factor,
        })
    }

    /// Blending coefficient.
    pub fn alpha(&self) -> &BigUint {
        &self.alpha
    }

    /// Token units per voice credit.
    pub fn voice_credit_factor(&self) -> &BigUint {
        &self.voice_credit_factor
    }
}

/// Claimable amount for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    /// Recipient index.
    pub recipient_index: usize,
    /// Token amount the recipient may claim.
    #[serde(with = "decimal")]
    pub amount: BigUint,
}

/// Evaluates the allocation formula for one recipient.
pub fn allocated_amount(
    quadratic_votes: &BigUint,
    linear_spent: &BigUint,
    params: &AllocationParams,
) -> Result<BigUint> {
    let precision = alpha_precision();
    let squared = mul_word(quadratic_votes, quadratic_votes, "quadraticVotes²")?;
    let quadratic = mul_word(
        &mul_word(&squared, &params.voice_credit_factor, "quadraticVotes² × factor")?,
        &params.alpha,
        "quadratic term",
    )?;
    let linear = mul_word(
        &mul_word(linear_spent, &params.voice_credit_factor, "linearSpent × factor")?,
        &(&precision - &params.alpha),
        "linear term",
    )?;
    Ok(add_word(&quadratic, &linear, "quadratic + linear")? / precision)
}

/// Allocations for every entry, in entry order.
pub fn allocate(entries: &[RecipientTallyEntry], params: &AllocationParams) -> Result<Vec<Allocation>> {
    entries
        .iter()
        .map(|entry| {
            Ok(Allocation {
                recipient_index: entry.recipient_index,
                amount: allocated_amount(&entry.quadratic_votes, &entry.linear_spent, params)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arith::word_max;
    use proptest::prelude::*;

    fn big(v: u128) -> BigUint {
        BigUint::from(v)
    }

    fn params(alpha: u128, factor: u128) -> AllocationParams {
        AllocationParams::new(big(alpha), big(factor)).unwrap()
    }

    #[test]
    fn boundary_alphas() {
        let linear_only = params(0, 7);
        assert_eq!(allocated_amount(&big(15), &big(130), &linear_only).unwrap(), big(910));
        let quadratic_only = params(ALPHA_PRECISION as u128, 7);
        assert_eq!(allocated_amount(&big(15), &big(130), &quadratic_only).unwrap(), big(1575));
    }

    #[test]
    fn blended_alpha_truncates_once() {
        // alpha = 1/3: (100·1·a + 50·1·(P − a)) / P = 66.66…
        let third = ALPHA_PRECISION as u128 / 3;
        let amount = allocated_amount(&big(10), &big(50), &params(third, 1)).unwrap();
        assert_eq!(amount, big(66));
    }

    #[test]
    fn alpha_above_precision_rejected() {
        let err = AllocationParams::new(big(ALPHA_PRECISION as u128 + 1), big(1)).unwrap_err();
        assert!(matches!(err, RoundError::InvalidParameters(_)));
    }

    #[test]
    fn overflowing_product_rejected() {
        let huge = word_max();
        let err = allocated_amount(&huge, &big(1), &params(1, 1)).unwrap_err();
        assert!(matches!(err, RoundError::ArithmeticOverflow(_)));
    }

    #[test]
    fn allocate_preserves_order() {
        let entries: Vec<RecipientTallyEntry> = (0..3)
            .map(|i| RecipientTallyEntry {
                recipient_index: i,
                quadratic_votes: big(i as u128 * 2),
                linear_spent: big(i as u128 * 4),
                salt: big(0),
            })
            .collect();
        let allocations = allocate(&entries, &params(ALPHA_PRECISION as u128, 10)).unwrap();
        let amounts: Vec<_> = allocations.iter().map(|a| a.amount.clone()).collect();
        assert_eq!(amounts, vec![big(0), big(40), big(160)]);
        assert_eq!(allocations[2].recipient_index, 2);
    }

    proptest! {
        #[test]
        fn amount_lies_between_pure_terms(
            q in 0u64..1_000_000,
            extra in 0u64..1_000_000,
            factor in 1u64..1_000_000,
            alpha in 0u64..=ALPHA_PRECISION,
        ) {
            let linear = q as u128 + extra as u128;
            let p = params(alpha as u128, factor as u128);
            let amount = allocated_amount(&big(q as u128), &big(linear), &p).unwrap();
            let quadratic_only = big(q as u128 * q as u128 * factor as u128);
            let linear_only = big(linear * factor as u128);
            let (lo, hi) = if quadratic_only < linear_only {
                (quadratic_only, linear_only)
            } else {
                (linear_only, quadratic_only)
            };
            prop_assert!(amount >= lo && amount <= hi);
        }

        #[test]
        fn zero_alpha_is_exactly_linear(q in any::<u64>(), l in any::<u64>(), factor in any::<u64>()) {
            let p = params(0, factor as u128);
            let amount = allocated_amount(&big(q as u128), &big(l as u128), &p).unwrap();
            prop_assert_eq!(amount, big(l as u128 * factor as u128));
        }
    }
}
