//! Contributor sign-ups, vote messages and the message log wire format.
//!
//! Messages address contributors by their sign-up state index, never by public
//! key, so a key change does not break addressing.  A message is either a key
//! change or a vote; the JSON form uses nullable fields and is validated on
//! decode, so a [`Message`] value is always well formed.

use crate::arith::{self, decimal};
use crate::error::{Result, RoundError};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

/// Opaque contributor public key.
///
/// Key material and signatures are handled by the external MACI library; the
/// replayer only compares keys for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PubKey(String);

impl PubKey {
    /// Wraps a serialised key, trimming surrounding whitespace.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_string())
    }

    /// Returns the serialised key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Contributor registration captured at sign-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUp {
    /// Stable handle assigned at sign-up; every message references it.
    pub state_index: u64,
    /// Key valid for the contributor's first message.
    pub public_key: PubKey,
    /// Voice credits granted at sign-up; never increases afterwards.
    #[serde(with = "decimal")]
    pub voice_credit_balance: BigUint,
}

/// Effect of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Rotate the contributor's active key.
    KeyChange {
        /// Key governing signatures of later messages.
        new_key: PubKey,
    },
    /// Set the voice credits allocated to one recipient; zero retracts.
    Vote {
        /// Target recipient (vote option) index.
        recipient_index: usize,
        /// Voice credits now allocated to the recipient.
        voice_credits: BigUint,
    },
}

/// A validated vote message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub struct Message {
    /// State index of the contributor the message belongs to.
    pub state_index: u64,
    /// Per-contributor ordering number.
    pub nonce: u64,
    /// Key that signed the message, when the caller supplies it.
    pub signer: Option<PubKey>,
    /// What the message does.
    pub command: Command,
}

impl Message {
    /// Builds a vote message.
    pub fn vote(state_index: u64, nonce: u64, recipient_index: usize, voice_credits: u64) -> Self {
        Self {
            state_index,
            nonce,
            signer: None,
            command: Command::Vote {
                recipient_index,
                voice_credits: BigUint::from(voice_credits),
            },
        }
    }

    /// Builds a key-change message.
    pub fn key_change(state_index: u64, nonce: u64, new_key: PubKey) -> Self {
        Self {
            state_index,
            nonce,
            signer: None,
            command: Command::KeyChange { new_key },
        }
    }

    /// Attaches the signing key.
    pub fn signed_by(mut self, signer: PubKey) -> Self {
        self.signer = Some(signer);
        self
    }
}

/// Wire form of a message; exactly one of the vote or key-change shapes is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    state_index: u64,
    nonce: u64,
    #[serde(default)]
    recipient_index: Option<i64>,
    #[serde(default)]
    voice_credits: Option<serde_json::Value>,
    #[serde(default)]
    new_public_key: Option<PubKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signer: Option<PubKey>,
}

impl TryFrom<RawMessage> for Message {
    type Error = RoundError;

    fn try_from(raw: RawMessage) -> Result<Self> {
        let context = format!("message (stateIndex {}, nonce {})", raw.state_index, raw.nonce);
        let command = match (raw.recipient_index, raw.voice_credits, raw.new_public_key) {
            (None, None, Some(new_key)) => Command::KeyChange { new_key },
            (Some(index), Some(credits), None) => {
                let recipient_index = usize::try_from(index).map_err(|_| {
                    RoundError::invalid_input(format!("{context}: negative recipient index {index}"))
                })?;
                let credits = arith::int_from_json(&credits)
                    .map_err(|err| RoundError::invalid_input(format!("{context}: {err}")))?;
                if arith::is_negative(&credits) {
                    return Err(RoundError::invalid_input(format!(
                        "{context}: negative voice credits {credits}"
                    )));
                }
                let voice_credits = credits.magnitude().clone();
                Command::Vote {
                    recipient_index,
                    voice_credits,
                }
            }
            (None, None, None) => {
                return Err(RoundError::invalid_input(format!(
                    "{context}: neither a vote nor a key change"
                )))
            }
            (Some(_), None, _) | (None, Some(_), _) => {
                return Err(RoundError::invalid_input(format!(
                    "{context}: recipientIndex and voiceCredits must be set together"
                )))
            }
            (Some(_), Some(_), Some(_)) => {
                return Err(RoundError::invalid_input(format!(
                    "{context}: a message cannot both vote and change keys"
                )))
            }
        };
        Ok(Self {
            state_index: raw.state_index,
            nonce: raw.nonce,
            signer: raw.signer,
            command,
        })
    }
}

impl From<Message> for RawMessage {
    fn from(msg: Message) -> Self {
        let (recipient_index, voice_credits, new_public_key) = match msg.command {
            Command::KeyChange { new_key } => (None, None, Some(new_key)),
            Command::Vote {
                recipient_index,
                voice_credits,
            } => (
                Some(recipient_index as i64),
                Some(serde_json::Value::String(voice_credits.to_str_radix(10))),
                None,
            ),
        };
        Self {
            state_index: msg.state_index,
            nonce: msg.nonce,
            recipient_index,
            voice_credits,
            new_public_key,
            signer: msg.signer,
        }
    }
}

/// Sign-ups plus the ordered sequence of submitted message batches.
///
/// Each batch is kept exactly as physically submitted: highest nonce first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageLog {
    /// Registered contributors.
    pub sign_ups: Vec<SignUp>,
    /// Submitted batches, oldest first.
    pub batches: Vec<Vec<Message>>,
}

impl MessageLog {
    /// Parses a log; any malformed message surfaces as [`RoundError::InvalidInput`].
    pub fn from_json_str(input: &str) -> Result<Self> {
        let log: Self = serde_json::from_str(input)
            .map_err(|err| RoundError::invalid_input(format!("invalid message log: {err}")))?;
        log.validate_sign_ups()?;
        Ok(log)
    }

    /// Reads and parses a log file.
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json_str(&crate::io::read_text(path)?)
    }

    /// Encodes the log as pretty JSON.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| RoundError::Decode(format!("failed to encode message log: {err}")))
    }

    /// Registers a contributor.
    pub fn sign_up(&mut self, state_index: u64, public_key: PubKey, voice_credits: u64) {
        self.sign_ups.push(SignUp {
            state_index,
            public_key,
            voice_credit_balance: BigUint::from(voice_credits),
        });
    }

    /// Appends a batch given in logical (ascending nonce) order, storing it
    /// reversed the way a contributor physically submits it.
    pub fn submit_batch(&mut self, mut logical: Vec<Message>) {
        logical.reverse();
        self.batches.push(logical);
    }

    /// Total number of messages across all batches.
    pub fn message_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub(crate) fn validate_sign_ups(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for sign_up in &self.sign_ups {
            if !seen.insert(sign_up.state_index) {
                return Err(RoundError::invalid_input(format!(
                    "duplicate sign-up for state index {}",
                    sign_up.state_index
                )));
            }
        }
        Ok(())
    }
}
