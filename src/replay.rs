//! Message log replay.
//!
//! Contributors submit batches with the highest nonce first, while override
//! semantics are defined on ascending nonce.  The replayer therefore splits
//! the log per contributor, restores ascending order inside every batch and
//! walks the result, keeping the active key and the latest allocation for
//! each recipient.
//!
//! Two orderings are supported, see [`ReplayMode`].  In both, a vote for a
//! recipient outside the registry range is excluded and reported rather than
//! aborting the replay.

use crate::error::{Result, RoundError};
use crate::message::{Command, Message, MessageLog, PubKey, SignUp};
use num_bigint::BigUint;
use num_traits::Zero;
#[cfg(not(target_arch = "wasm32"))]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// How a contributor's batches are ordered and which messages are honoured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    /// Batches in submission order, each restored to ascending nonce; every
    /// vote overwrites the previous allocation for its recipient.  Messages
    /// are assumed to be signature-checked upstream.
    #[default]
    Sequential,
    /// Newest batch first, each in ascending nonce.  A message applies only if
    /// it is signed by the active key, carries the next expected nonce and
    /// keeps the contributor within their voice-credit balance.
    Verified,
}

impl ReplayMode {
    /// Stable textual name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Verified => "verified",
        }
    }
}

impl FromStr for ReplayMode {
    type Err = RoundError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "verified" => Ok(Self::Verified),
            other => Err(RoundError::params(format!(
                "unknown replay mode '{other}' (expected sequential|verified)"
            ))),
        }
    }
}

impl fmt::Display for ReplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allocation to one recipient and the nonce of the message that set it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteEntry {
    /// Voice credits currently allocated.
    pub voice_credits: BigUint,
    /// Nonce of the message that set this value.
    pub nonce: u64,
}

/// Final effective vote state of one contributor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserVotes {
    /// Contributor state index.
    pub state_index: u64,
    /// Key active after the last applied message.
    pub active_key: PubKey,
    /// Voice credit balance granted at sign-up.
    pub balance: BigUint,
    /// Recipient index to current allocation.
    pub votes: BTreeMap<usize, VoteEntry>,
}

impl UserVotes {
    fn new(sign_up: &SignUp) -> Self {
        Self {
            state_index: sign_up.state_index,
            active_key: sign_up.public_key.clone(),
            balance: sign_up.voice_credit_balance.clone(),
            votes: BTreeMap::new(),
        }
    }

    /// Sum of voice credits allocated across all recipients.
    pub fn total_spent(&self) -> BigUint {
        self.votes
            .values()
            .fold(BigUint::zero(), |acc, entry| acc + &entry.voice_credits)
    }

    /// Voice credits allocated to `recipient_index` (zero when never voted).
    pub fn credits_for(&self, recipient_index: usize) -> BigUint {
        self.votes
            .get(&recipient_index)
            .map(|entry| entry.voice_credits.clone())
            .unwrap_or_default()
    }
}

/// Resolved vote state for every contributor, keyed by state index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedVotes {
    /// Per-contributor effective votes.
    pub users: BTreeMap<u64, UserVotes>,
}

impl ResolvedVotes {
    /// Effective votes of one contributor.
    pub fn user(&self, state_index: u64) -> Option<&UserVotes> {
        self.users.get(&state_index)
    }

    /// Total voice credits spent by all contributors.
    pub fn total_spent(&self) -> BigUint {
        self.users
            .values()
            .fold(BigUint::zero(), |acc, user| acc + user.total_spent())
    }
}

/// Why a message did not take effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum ExclusionReason {
    /// The vote targets a recipient beyond the registry range.
    RecipientOutOfBounds {
        /// Offending recipient index.
        recipient_index: usize,
    },
    /// The message was not signed by the key active at that point.
    StaleKey,
    /// Verified replay requires a signer on every message.
    MissingSigner,
    /// The nonce is not the next one expected.
    UnexpectedNonce {
        /// Nonce that would have been accepted.
        expected: u64,
    },
    /// Applying the vote would exceed the sign-up balance.
    InsufficientCredits,
}

/// A message that was dropped during replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedMessage {
    /// Contributor the message belonged to.
    pub state_index: u64,
    /// Nonce carried by the message.
    pub nonce: u64,
    /// Why it was dropped.
    #[serde(flatten)]
    pub reason: ExclusionReason,
}

/// Diagnostics gathered while replaying.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    /// Messages that did not take effect, ordered by state index then replay order.
    pub excluded: Vec<ExcludedMessage>,
    /// Contributors whose final allocation exceeds their balance.
    pub over_budget: Vec<u64>,
}

impl ReplayReport {
    /// Returns `true` when nothing was excluded or flagged.
    pub fn is_clean(&self) -> bool {
        self.excluded.is_empty() && self.over_budget.is_empty()
    }
}

/// Resolves a message log into effective per-contributor votes.
#[derive(Debug, Clone, Copy)]
pub struct Replayer {
    recipient_count: usize,
    mode: ReplayMode,
}

struct UserOutcome {
    votes: UserVotes,
    excluded: Vec<ExcludedMessage>,
    over_budget: bool,
}

impl Replayer {
    /// Creates a replayer for a registry with `recipient_count` vote options.
    pub fn new(recipient_count: usize, mode: ReplayMode) -> Self {
        Self {
            recipient_count,
            mode,
        }
    }

    /// Replay ordering in use.
    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    /// Replays `log`, returning the effective votes and the replay report.
    ///
    /// Every signed-up contributor appears in the result, including those
    /// who never sent a message.
    pub fn replay(&self, log: &MessageLog) -> Result<(ResolvedVotes, ReplayReport)> {
        log.validate_sign_ups()?;
        let streams = self.split_streams(log)?;
        let jobs: Vec<(&SignUp, Vec<&Message>)> = log
            .sign_ups
            .iter()
            .map(|sign_up| {
                let chunks = streams.get(&sign_up.state_index);
                (sign_up, self.order(chunks.map(Vec::as_slice).unwrap_or(&[])))
            })
            .collect();

        #[cfg(not(target_arch = "wasm32"))]
        let outcomes: Vec<UserOutcome> = jobs
            .par_iter()
            .map(|(sign_up, ordered)| self.replay_user(sign_up, ordered))
            .collect();
        #[cfg(target_arch = "wasm32")]
        let outcomes: Vec<UserOutcome> = jobs
            .iter()
            .map(|(sign_up, ordered)| self.replay_user(sign_up, ordered))
            .collect();

        let mut resolved = ResolvedVotes::default();
        let mut report = ReplayReport::default();
        let mut outcomes = outcomes;
        outcomes.sort_by_key(|outcome| outcome.votes.state_index);
        for outcome in outcomes {
            if outcome.over_budget {
                tracing::warn!(
                    state_index = outcome.votes.state_index,
                    spent = %outcome.votes.total_spent(),
                    balance = %outcome.votes.balance,
                    "final allocation exceeds voice credit balance"
                );
                report.over_budget.push(outcome.votes.state_index);
            }
            report.excluded.extend(outcome.excluded);
            resolved
                .users
                .insert(outcome.votes.state_index, outcome.votes);
        }
        tracing::debug!(
            users = resolved.users.len(),
            messages = log.message_count(),
            excluded = report.excluded.len(),
            mode = %self.mode,
            "message log replayed"
        );
        Ok((resolved, report))
    }

    /// Groups messages by contributor, one chunk per batch the contributor
    /// appeared in, checking that each chunk is physically nonce-descending.
    fn split_streams<'a>(&self, log: &'a MessageLog) -> Result<BTreeMap<u64, Vec<Vec<&'a Message>>>> {
        let known: BTreeSet<u64> = log.sign_ups.iter().map(|s| s.state_index).collect();
        let mut streams: BTreeMap<u64, Vec<Vec<&Message>>> = BTreeMap::new();
        for (batch_idx, batch) in log.batches.iter().enumerate() {
            let mut chunks: BTreeMap<u64, Vec<&Message>> = BTreeMap::new();
            for msg in batch {
                if !known.contains(&msg.state_index) {
                    return Err(RoundError::invalid_input(format!(
                        "batch {batch_idx}: message for unknown state index {}",
                        msg.state_index
                    )));
                }
                chunks.entry(msg.state_index).or_default().push(msg);
            }
            for (state_index, chunk) in chunks {
                if let Some(pair) = chunk.windows(2).find(|pair| pair[0].nonce <= pair[1].nonce) {
                    return Err(RoundError::invalid_input(format!(
                        "batch {batch_idx}: state index {state_index} nonces must be submitted in descending order (found {} before {})",
                        pair[0].nonce, pair[1].nonce
                    )));
                }
                streams.entry(state_index).or_default().push(chunk);
            }
        }
        Ok(streams)
    }

    /// Flattens a contributor's physical chunks into replay order.
    fn order<'a>(&self, chunks: &[Vec<&'a Message>]) -> Vec<&'a Message> {
        let ascending = |chunk: &Vec<&'a Message>| chunk.iter().rev().copied().collect::<Vec<_>>();
        match self.mode {
            ReplayMode::Sequential => chunks.iter().flat_map(ascending).collect(),
            ReplayMode::Verified => chunks.iter().rev().flat_map(ascending).collect(),
        }
    }

    fn replay_user(&self, sign_up: &SignUp, ordered: &[&Message]) -> UserOutcome {
        let mut votes = UserVotes::new(sign_up);
        let mut excluded = Vec::new();
        let mut last_nonce = 0u64;
        for msg in ordered {
            let verdict = match self.mode {
                ReplayMode::Sequential => self.check_recipient(msg),
                ReplayMode::Verified => self.check_verified(msg, &votes, last_nonce),
            };
            if let Err(reason) = verdict {
                match &reason {
                    ExclusionReason::RecipientOutOfBounds { recipient_index } => tracing::warn!(
                        state_index = msg.state_index,
                        nonce = msg.nonce,
                        recipient_index,
                        recipient_count = self.recipient_count,
                        "vote for unknown recipient excluded from tally"
                    ),
                    other => tracing::debug!(
                        state_index = msg.state_index,
                        nonce = msg.nonce,
                        reason = ?other,
                        "message rejected"
                    ),
                }
                excluded.push(ExcludedMessage {
                    state_index: msg.state_index,
                    nonce: msg.nonce,
                    reason,
                });
                continue;
            }
            match &msg.command {
                Command::KeyChange { new_key } => votes.active_key = new_key.clone(),
                Command::Vote {
                    recipient_index,
                    voice_credits,
                } => {
                    votes.votes.insert(
                        *recipient_index,
                        VoteEntry {
                            voice_credits: voice_credits.clone(),
                            nonce: msg.nonce,
                        },
                    );
                }
            }
            last_nonce = msg.nonce;
        }
        let over_budget = votes.total_spent() > votes.balance;
        UserOutcome {
            votes,
            excluded,
            over_budget,
        }
    }

    fn check_recipient(&self, msg: &Message) -> std::result::Result<(), ExclusionReason> {
        match &msg.command {
            Command::Vote {
                recipient_index, ..
            } if *recipient_index >= self.recipient_count => {
                Err(ExclusionReason::RecipientOutOfBounds {
                    recipient_index: *recipient_index,
                })
            }
            _ => Ok(()),
        }
    }

    fn check_verified(
        &self,
        msg: &Message,
        state: &UserVotes,
        last_nonce: u64,
    ) -> std::result::Result<(), ExclusionReason> {
        match &msg.signer {
            None => return Err(ExclusionReason::MissingSigner),
            Some(signer) if *signer != state.active_key => return Err(ExclusionReason::StaleKey),
            Some(_) => {}
        }
        let expected = last_nonce.saturating_add(1);
        if msg.nonce != expected {
            return Err(ExclusionReason::UnexpectedNonce { expected });
        }
        self.check_recipient(msg)?;
        if let Command::Vote {
            recipient_index,
            voice_credits,
        } = &msg.command
        {
            let spent = state.total_spent() - state.credits_for(*recipient_index) + voice_credits;
            if spent > state.balance {
                return Err(ExclusionReason::InsufficientCredits);
            }
        }
        Ok(())
    }
}
