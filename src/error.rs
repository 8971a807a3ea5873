//! Error taxonomy shared by every stage of the tally pipeline.

use crate::round::RoundPhase;
use thiserror::Error;

/// Errors raised while replaying messages, tallying, allocating or driving a round.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoundError {
    #[error("invalid input: {0}")]
    /// Malformed message or artifact; rejected before any processing.
    InvalidInput(String),
    #[error("recipient index {index} out of bounds (recipient count {count})")]
    /// A vote or tally entry references a recipient beyond the registry range.
    RecipientIndexOutOfBounds {
        /// Offending recipient index.
        index: usize,
        /// Number of recipient slots known to the round.
        count: usize,
    },
    #[error("commitment mismatch: {0}")]
    /// Recomputed commitment or total disagrees with the committed value.
    CommitmentMismatch(String),
    #[error("arithmetic overflow: {0}")]
    /// An intermediate value does not fit in a 256-bit word.
    ArithmeticOverflow(String),
    #[error("invalid parameters: {0}")]
    /// Round or allocation parameters are outside their legal range.
    InvalidParameters(String),
    #[error("recipient {0} has already claimed funds")]
    /// The recipient's single-use claim was already taken.
    AlreadyClaimed(usize),
    #[error("round has already been finalized")]
    /// Finalization is a one-time event.
    AlreadyFinalized,
    #[error("cannot {action} while round is {phase}")]
    /// The requested action is not legal in the current lifecycle phase.
    InvalidStateTransition {
        /// Phase the round was in when the action was attempted.
        phase: RoundPhase,
        /// Action that was attempted.
        action: &'static str,
    },
    #[error("contributor {0} has already withdrawn")]
    /// Refund already paid out for this contributor.
    AlreadyWithdrawn(String),
    #[error("io error: {0}")]
    /// Underlying filesystem failure.
    Io(String),
    #[error("decode error: {0}")]
    /// Artifact decoding or encoding failure.
    Decode(String),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, RoundError>;

impl RoundError {
    pub(crate) fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub(crate) fn mismatch(msg: impl Into<String>) -> Self {
        Self::CommitmentMismatch(msg.into())
    }

    pub(crate) fn params(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }
}
