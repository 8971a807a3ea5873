#![deny(missing_docs)]

//! # qf_round
//!
//! **qf_round** is the tally and allocation engine of a MACI-style
//! quadratic-funding round.  It replays the vote message log a poll collected,
//! aggregates a deterministic per-recipient tally, commits to it, and computes
//! the matching funds each recipient may claim, bit-for-bit with the on-chain
//! arithmetic.
//!
//! ## Pipeline
//!
//! * [`message`] parses sign-ups and message batches (highest nonce first, as
//!   physically submitted).
//! * [`replay`] restores ascending nonce order per contributor and resolves
//!   the final vote for every (contributor, recipient) pair.
//! * [`tally`] sums integer square roots per recipient (quadratic votes) and
//!   raw voice credits (linear spend).
//! * [`commitment`] and [`tally_data`] bind the tally to salted quinary Merkle
//!   commitments and the JSON tally file.
//! * [`allocation`] applies the alpha-blended matching formula.
//! * [`round`] gates all of the above behind the round lifecycle:
//!   `Open → VotingClosed → Tallying → Finalized`, or `Cancelled`.
//!
//! ## Usage
//!
//! ```rust
//! use num_bigint::BigUint;
//! use qf_round::{
//!     compute_allocations, compute_tally, KeccakFieldCommitment, Message, MessageLog, PubKey,
//!     SaltSource, TallyParams, ALPHA_PRECISION,
//! };
//!
//! let mut log = MessageLog::default();
//! log.sign_up(1, PubKey::new("alice"), 25);
//! log.sign_up(2, PubKey::new("bob"), 25);
//! log.submit_batch(vec![Message::vote(1, 1, 1, 25)]);
//! log.submit_batch(vec![Message::vote(2, 1, 1, 25)]);
//!
//! let params = TallyParams::new("0x00000000000000000000000000000000000000aa", 0u32.into(), 2);
//! let outcome = compute_tally(&log, &params, &SaltSource::from_seed([0; 32]), &KeccakFieldCommitment)?;
//! // two contributors of 25 credits each: 5 + 5 quadratic votes
//! assert_eq!(outcome.data.results.tally[1], BigUint::from(10u32));
//!
//! let allocations = compute_allocations(&outcome.data, &BigUint::from(ALPHA_PRECISION), &1u32.into())?;
//! assert_eq!(allocations[1].amount, BigUint::from(100u32));
//! # Ok::<(), qf_round::RoundError>(())
//! ```

pub mod allocation;
pub mod arith;
pub mod claim;
pub mod commitment;
pub mod config;
mod error;
pub mod io;
pub mod message;
pub mod pipeline;
pub mod replay;
pub mod round;
pub mod tally;
pub mod tally_data;

pub use allocation::{allocate, allocated_amount, Allocation, AllocationParams, ALPHA_PRECISION};
pub use arith::integer_sqrt;
pub use claim::{upload_ranges, verify_claim_data, RecipientClaimData, UploadRange};
pub use commitment::{CommitmentScheme, KeccakFieldCommitment, QuinTree};
pub use config::{DeploymentRegistry, RecipientRegistryKind, RoundConfig};
pub use error::{Result, RoundError};
pub use message::{Command, Message, MessageLog, PubKey, SignUp};
pub use pipeline::{compute_allocations, compute_claim_data, compute_tally, TallyOutcome, TallyParams};
pub use replay::{ReplayMode, ReplayReport, Replayer, ResolvedVotes};
pub use round::{derive_alpha, FinalizeRequest, FundingRound, RoundPhase};
pub use tally::{RecipientTallyEntry, SaltSource, Tally, TallyAggregator};
pub use tally_data::{TallyCommitments, TallyData};
