//! Round configuration and deployment registry.
//!
//! A round is described by a JSON file; a handful of operational knobs can be
//! overridden from the environment (`QF_REPLAY_MODE`, `QF_BATCH_SIZE`,
//! `QF_SALT_SEED`).  The recipient registry kind is stated explicitly in the
//! file and never inferred from a deployed contract.

use crate::arith::{decimal, decimal_opt};
use crate::error::{Result, RoundError};
use crate::replay::ReplayMode;
use crate::round::FundingRound;
use crate::tally::SaltSource;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default number of recipients per upload transaction.
pub const DEFAULT_BATCH_SIZE: usize = 20;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// Recipient registry flavour, with the parameters each one needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RecipientRegistryKind {
    /// Owner-curated list.
    #[serde(rename_all = "camelCase")]
    Simple {
        /// Registry capacity.
        max_recipients: usize,
    },
    /// Deposit-and-challenge registry.
    #[serde(rename_all = "camelCase")]
    Optimistic {
        /// Registry capacity.
        max_recipients: usize,
        /// Base deposit required to add a recipient.
        #[serde(with = "decimal")]
        deposit: BigUint,
        /// Challenge window in seconds.
        challenge_period_seconds: u64,
    },
    /// Adapter over a Kleros curated registry.
    #[serde(rename_all = "camelCase")]
    Kleros {
        /// Registry capacity.
        max_recipients: usize,
        /// Address of the underlying curated registry.
        tcr: String,
    },
}

impl RecipientRegistryKind {
    /// Registry capacity.
    pub fn max_recipients(&self) -> usize {
        match self {
            Self::Simple { max_recipients }
            | Self::Optimistic { max_recipients, .. }
            | Self::Kleros { max_recipients, .. } => *max_recipients,
        }
    }

    /// Vote-option slots; slot 0 is reserved, so one more than the capacity.
    pub fn recipient_count(&self) -> Result<usize> {
        self.max_recipients().checked_add(1).ok_or_else(|| {
            RoundError::params(format!(
                "maxRecipients {} leaves no room for the reserved slot",
                self.max_recipients()
            ))
        })
    }

    /// Registry type label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Simple { .. } => "simple",
            Self::Optimistic { .. } => "optimistic",
            Self::Kleros { .. } => "kleros",
        }
    }
}

/// Round configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundConfig {
    /// MACI instance address; may be resolved from a deployment registry.
    #[serde(default)]
    pub maci: String,
    /// Poll identifier.
    #[serde(with = "decimal")]
    pub poll_id: BigUint,
    /// Depth of the recipient Merkle tree.
    pub recipient_tree_depth: u8,
    /// Recipient registry flavour.
    pub recipient_registry: RecipientRegistryKind,
    /// Tokens donated to the matching pool.
    #[serde(with = "decimal")]
    pub matching_pool: BigUint,
    /// Token units per voice credit.
    #[serde(with = "decimal")]
    pub voice_credit_factor: BigUint,
    /// Fixed alpha; derived at finalization when absent.
    #[serde(default, with = "decimal_opt", skip_serializing_if = "Option::is_none")]
    pub alpha: Option<BigUint>,
    /// Message replay ordering.
    #[serde(default)]
    pub replay_mode: ReplayMode,
    /// Recipients per upload transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Hex seed for commitment salts; random when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt_seed: Option<String>,
}

impl RoundConfig {
    /// Reads a config file and applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = crate::io::read_json(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `QF_*` overrides supplied by `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(mode) = lookup("QF_REPLAY_MODE") {
            self.replay_mode = mode.parse()?;
        }
        if let Some(raw) = lookup("QF_BATCH_SIZE") {
            self.batch_size = raw
                .trim()
                .parse()
                .map_err(|err| RoundError::params(format!("invalid QF_BATCH_SIZE '{raw}': {err}")))?;
        }
        if let Some(seed) = lookup("QF_SALT_SEED") {
            self.salt_seed = Some(seed);
        }
        Ok(())
    }

    /// Range checks on the configured values.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(RoundError::params("batch size must be positive"));
        }
        crate::commitment::ensure_capacity(self.recipient_tree_depth, self.recipient_count()?)?;
        if let Some(seed) = &self.salt_seed {
            SaltSource::from_hex(seed)?;
        }
        Ok(())
    }

    /// Vote-option slots in the round.
    pub fn recipient_count(&self) -> Result<usize> {
        self.recipient_registry.recipient_count()
    }

    /// Configured salt source, or a fresh random one.
    pub fn salt_source(&self) -> Result<SaltSource> {
        match &self.salt_seed {
            Some(seed) => SaltSource::from_hex(seed),
            None => Ok(SaltSource::random()),
        }
    }

    /// Fills `maci` from `registry` when it is not set explicitly.
    pub fn resolve_maci(&mut self, registry: &DeploymentRegistry, network: &str) -> Result<()> {
        if self.maci.trim().is_empty() {
            self.maci = registry.address(network, "MACI")?.to_string();
        }
        Ok(())
    }

    /// Opens a round with these parameters.
    pub fn open_round(&self) -> Result<FundingRound> {
        FundingRound::new(
            self.matching_pool.clone(),
            self.voice_credit_factor.clone(),
            self.recipient_count()?,
            self.recipient_tree_depth,
        )
    }
}

/// Deployed contract addresses: network, then contract name, then address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentRegistry {
    networks: BTreeMap<String, BTreeMap<String, String>>,
}

impl DeploymentRegistry {
    /// Reads a registry file.
    pub fn load(path: &Path) -> Result<Self> {
        crate::io::read_json(path)
    }

    /// Writes the registry file.
    pub fn save(&self, path: &Path) -> Result<()> {
        crate::io::write_json(path, self)
    }

    /// Records an address, replacing any earlier entry.
    pub fn register(&mut self, network: &str, name: &str, address: &str) {
        self.networks
            .entry(network.to_string())
            .or_default()
            .insert(name.to_string(), address.to_string());
    }

    /// Address of `name` on `network`.
    pub fn address(&self, network: &str, name: &str) -> Result<&str> {
        self.networks
            .get(network)
            .and_then(|contracts| contracts.get(name))
            .map(String::as_str)
            .ok_or_else(|| {
                RoundError::invalid_input(format!("no {name} deployment recorded for {network}"))
            })
    }
}
