//! The three pure entry points: log to tally, tally to claim proof, tally to
//! allocations.  Each call depends only on its arguments, so an interrupted
//! driver can recompute any of them and obtain identical output.

use crate::allocation::{self, Allocation, AllocationParams};
use crate::claim::{self, RecipientClaimData};
use crate::commitment::{self, CommitmentScheme};
use crate::config::RoundConfig;
use crate::error::Result;
use crate::message::MessageLog;
use crate::replay::{ReplayMode, ReplayReport, Replayer};
use crate::tally::{SaltSource, Tally, TallyAggregator};
use crate::tally_data::TallyData;
use num_bigint::BigUint;

/// Inputs to [`compute_tally`] beyond the message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyParams {
    /// MACI instance address recorded in the tally file.
    pub maci: String,
    /// Poll identifier recorded in the tally file.
    pub poll_id: BigUint,
    /// Vote-option slots.
    pub recipient_count: usize,
    /// Depth of the recipient Merkle tree.
    pub recipient_tree_depth: u8,
    /// Message replay ordering.
    pub replay_mode: ReplayMode,
}

impl TallyParams {
    /// Parameters with the smallest tree that holds `recipient_count` slots.
    pub fn new(maci: impl Into<String>, poll_id: BigUint, recipient_count: usize) -> Self {
        Self {
            maci: maci.into(),
            poll_id,
            recipient_count,
            recipient_tree_depth: commitment::min_depth(recipient_count),
            replay_mode: ReplayMode::default(),
        }
    }

    /// Parameters taken from a round configuration.
    pub fn from_config(config: &RoundConfig) -> Result<Self> {
        Ok(Self {
            maci: config.maci.clone(),
            poll_id: config.poll_id.clone(),
            recipient_count: config.recipient_count()?,
            recipient_tree_depth: config.recipient_tree_depth,
            replay_mode: config.replay_mode,
        })
    }
}

/// Result of [`compute_tally`].
#[derive(Debug, Clone)]
pub struct TallyOutcome {
    /// Per-recipient totals.
    pub tally: Tally,
    /// File form, with commitments recorded.
    pub data: TallyData,
    /// Messages excluded during replay and over-budget contributors.
    pub report: ReplayReport,
}

/// Replays `log`, aggregates the tally and commits to it.
pub fn compute_tally(
    log: &MessageLog,
    params: &TallyParams,
    salts: &SaltSource,
    scheme: &dyn CommitmentScheme,
) -> Result<TallyOutcome> {
    commitment::ensure_capacity(params.recipient_tree_depth, params.recipient_count)?;
    let (votes, report) = Replayer::new(params.recipient_count, params.replay_mode).replay(log)?;
    let tally = TallyAggregator::new(params.recipient_count).aggregate(&votes, salts)?;
    let data = TallyData::from_tally(
        &tally,
        params.maci.clone(),
        params.poll_id.clone(),
        params.recipient_tree_depth,
        scheme,
    )?;
    tracing::info!(
        recipients = params.recipient_count,
        total_spent = %tally.total_spent,
        excluded = report.excluded.len(),
        over_budget = report.over_budget.len(),
        scheme = scheme.name(),
        "tally computed"
    );
    Ok(TallyOutcome {
        tally,
        data,
        report,
    })
}

/// Claim proof for `recipient_index`.
pub fn compute_claim_data(
    data: &TallyData,
    recipient_index: usize,
    scheme: &dyn CommitmentScheme,
) -> Result<RecipientClaimData> {
    claim::claim_data(data, recipient_index, scheme)
}

/// Claimable amount for every recipient in `data`.
pub fn compute_allocations(
    data: &TallyData,
    alpha: &BigUint,
    voice_credit_factor: &BigUint,
) -> Result<Vec<Allocation>> {
    data.validate()?;
    let params = AllocationParams::new(alpha.clone(), voice_credit_factor.clone())?;
    allocation::allocate(&data.to_tally()?.entries, &params)
}
