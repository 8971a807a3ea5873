//! Commitments binding tally results to the on-chain record.
//!
//! The production hash (Poseidon over BN254) lives in the external MACI
//! library and is plugged in through [`CommitmentScheme`].  The crate ships
//! [`KeccakFieldCommitment`], a domain-separated Keccak-256 reduced into the
//! BN254 scalar field, so tallies can be committed and verified end to end
//! without that library.
//!
//! Per-recipient values are accumulated in a quinary Merkle tree (five
//! children per node, zero-valued empty leaves) whose root is then bound to a
//! salt: `commitment = hash2(root, salt)`.

use crate::error::{Result, RoundError};
use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use num_bigint::BigUint;
use num_traits::Zero;
use sha3::{Digest, Keccak256};

/// Number of children per Merkle node.
pub const LEAVES_PER_NODE: usize = 5;

const HASH2_DOMAIN: &[u8] = b"QF_ROUND_HASH2";
const HASH5_DOMAIN: &[u8] = b"QF_ROUND_HASH5";

/// Field hash used for tally commitments and Merkle nodes.
pub trait CommitmentScheme: Send + Sync {
    /// Identifier recorded alongside commitments.
    fn name(&self) -> &'static str;
    /// Hashes two field elements.
    fn hash2(&self, left: &BigUint, right: &BigUint) -> BigUint;
    /// Hashes one Merkle node's five children.
    fn hash5(&self, children: &[BigUint; LEAVES_PER_NODE]) -> BigUint;
}

/// Keccak-256 over canonical field encodings, reduced into BN254 `Fr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeccakFieldCommitment;

impl KeccakFieldCommitment {
    fn digest<'a>(domain: &[u8], inputs: impl IntoIterator<Item = &'a BigUint>) -> BigUint {
        let mut hasher = Keccak256::new();
        hasher.update(domain);
        for input in inputs {
            hasher.update(to_field(input).into_bigint().to_bytes_be());
        }
        field_element_from_bytes(&hasher.finalize())
    }
}

impl CommitmentScheme for KeccakFieldCommitment {
    fn name(&self) -> &'static str {
        "keccak-bn254"
    }

    fn hash2(&self, left: &BigUint, right: &BigUint) -> BigUint {
        Self::digest(HASH2_DOMAIN, [left, right])
    }

    fn hash5(&self, children: &[BigUint; LEAVES_PER_NODE]) -> BigUint {
        Self::digest(HASH5_DOMAIN, children.iter())
    }
}

/// Order of the BN254 scalar field.
pub fn field_modulus() -> BigUint {
    BigUint::from_bytes_be(&Fr::MODULUS.to_bytes_be())
}

/// Reduces an integer into the scalar field.
pub fn to_field(value: &BigUint) -> Fr {
    Fr::from_be_bytes_mod_order(&value.to_bytes_be())
}

/// Canonical integer representative of a field element.
pub fn from_field(value: Fr) -> BigUint {
    BigUint::from_bytes_be(&value.into_bigint().to_bytes_be())
}

/// Interprets big-endian bytes as an integer reduced modulo the field order.
pub fn field_element_from_bytes(bytes: &[u8]) -> BigUint {
    from_field(Fr::from_be_bytes_mod_order(bytes))
}

/// Number of leaves a tree of `depth` levels holds, if it fits in `usize`.
pub fn tree_capacity(depth: u8) -> Option<usize> {
    LEAVES_PER_NODE.checked_pow(u32::from(depth))
}

/// Smallest depth whose tree holds `count` leaves.
pub fn min_depth(count: usize) -> u8 {
    let mut depth = 0u8;
    while tree_capacity(depth).map_or(false, |cap| cap < count) {
        depth += 1;
    }
    depth
}

/// Fails with [`RoundError::InvalidParameters`] if `count` leaves do not fit.
pub fn ensure_capacity(depth: u8, count: usize) -> Result<()> {
    match tree_capacity(depth) {
        Some(cap) if cap < count => Err(RoundError::params(format!(
            "tree depth {depth} holds {cap} leaves but {count} recipients were supplied"
        ))),
        _ => Ok(()),
    }
}

/// Quinary Merkle tree over per-recipient values.
#[derive(Debug, Clone)]
pub struct QuinTree {
    depth: u8,
    levels: Vec<Vec<BigUint>>,
    zeros: Vec<BigUint>,
}

impl QuinTree {
    /// Builds a tree of `depth` levels whose first leaves are `leaves`.
    pub fn new(scheme: &dyn CommitmentScheme, depth: u8, leaves: &[BigUint]) -> Result<Self> {
        ensure_capacity(depth, leaves.len())?;
        let mut zeros = vec![BigUint::zero()];
        for level in 0..usize::from(depth) {
            let zero = zeros[level].clone();
            zeros.push(scheme.hash5(&std::array::from_fn(|_| zero.clone())));
        }
        let mut levels = vec![leaves.to_vec()];
        for level in 0..usize::from(depth) {
            let next: Vec<BigUint> = levels[level]
                .chunks(LEAVES_PER_NODE)
                .map(|chunk| {
                    let children = std::array::from_fn(|slot| {
                        chunk.get(slot).cloned().unwrap_or_else(|| zeros[level].clone())
                    });
                    scheme.hash5(&children)
                })
                .collect();
            levels.push(next);
        }
        Ok(Self {
            depth,
            levels,
            zeros,
        })
    }

    /// Tree depth.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Root of the tree.
    pub fn root(&self) -> BigUint {
        let top = usize::from(self.depth);
        self.levels[top]
            .first()
            .cloned()
            .unwrap_or_else(|| self.zeros[top].clone())
    }

    /// Sibling values along the path from leaf `index` to the root, four per level.
    pub fn path(&self, index: usize) -> Result<Vec<Vec<BigUint>>> {
        let count = self.levels[0].len();
        if index >= count {
            return Err(RoundError::RecipientIndexOutOfBounds { index, count });
        }
        let mut idx = index;
        let mut path = Vec::with_capacity(usize::from(self.depth));
        for level in 0..usize::from(self.depth) {
            let base = idx - idx % LEAVES_PER_NODE;
            let siblings = (0..LEAVES_PER_NODE)
                .filter(|slot| base + slot != idx)
                .map(|slot| {
                    self.levels[level]
                        .get(base + slot)
                        .cloned()
                        .unwrap_or_else(|| self.zeros[level].clone())
                })
                .collect();
            path.push(siblings);
            idx /= LEAVES_PER_NODE;
        }
        Ok(path)
    }
}

/// Recomputes the root from a leaf and its path; `None` for a malformed path.
pub fn root_from_path(
    scheme: &dyn CommitmentScheme,
    index: usize,
    leaf: &BigUint,
    path: &[Vec<BigUint>],
) -> Option<BigUint> {
    let mut idx = index;
    let mut hash = leaf.clone();
    for siblings in path {
        if siblings.len() != LEAVES_PER_NODE - 1 {
            return None;
        }
        let slot = idx % LEAVES_PER_NODE;
        let mut rest = siblings.iter();
        let children: [BigUint; LEAVES_PER_NODE] = std::array::from_fn(|pos| {
            if pos == slot {
                hash.clone()
            } else {
                rest.next().cloned().unwrap_or_default()
            }
        });
        hash = scheme.hash5(&children);
        idx /= LEAVES_PER_NODE;
    }
    // leftover index bits mean the leaf lies outside a tree of this depth
    (idx == 0).then_some(hash)
}

/// `hash2(root(values), salt)` for a per-recipient tally section.
pub fn tally_result_commitment(
    scheme: &dyn CommitmentScheme,
    depth: u8,
    values: &[BigUint],
    salt: &BigUint,
) -> Result<BigUint> {
    let tree = QuinTree::new(scheme, depth, values)?;
    Ok(scheme.hash2(&tree.root(), salt))
}

/// `hash2(total_spent, salt)`.
pub fn spent_commitment(scheme: &dyn CommitmentScheme, total_spent: &BigUint, salt: &BigUint) -> BigUint {
    scheme.hash2(total_spent, salt)
}
