//! Payment Script Composer — deterministic construction and validation of
//! the on-chain locking artifacts for streaming, batched, and escrow
//! micropayment settlement.
//!
//! Addresses are real base58check P2PKH/P2SH (via [`bitcoin::Address`]);
//! locking scripts are built with [`bitcoin::blockdata::script::Builder`],
//! the same idiom the corpus uses for Lightning commitment outputs
//! (`OP_CHECKMULTISIG` escrow, `OP_CSV`/`OP_CLTV` timelocks).

mod escrow;
mod streaming;

pub use escrow::{EscrowParams, TimelockParams};
pub use streaming::StreamingLockParams;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use bitcoin::blockdata::script::ScriptBuf;
use bitcoin::{Address, Network};

use crate::error::ComposerError;

/// An opaque, serializable locking/unlocking description produced by the
/// Composer.
///
/// `unlock_template`, when present, is a callable that given a transaction
/// and an input index returns the unlocking (scriptSig/witness) bytes for
/// that input. It is not `Clone`/`Debug` in the general sense since it may
/// close over key material held elsewhere; the `Debug` impl below reports
/// only whether one is present.
#[derive(Clone)]
pub struct ScriptArtifact {
    pub locking_bytes: Vec<u8>,
    pub estimated_length: usize,
    pub estimated_fee: u64,
    pub unlock_template: Option<UnlockTemplate>,
}

pub type UnlockTemplate = Arc<dyn Fn(&bitcoin::Transaction, usize) -> Vec<u8> + Send + Sync>;

impl std::fmt::Debug for ScriptArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptArtifact")
            .field("locking_bytes_len", &self.locking_bytes.len())
            .field("estimated_length", &self.estimated_length)
            .field("estimated_fee", &self.estimated_fee)
            .field("has_unlock_template", &self.unlock_template.is_some())
            .finish()
    }
}

/// A single batched payment line item: an amount owed to a recipient
/// address. `compose_mixed_batch` groups these by address.
#[derive(Debug, Clone)]
pub struct PayableEvent {
    pub recipient_address: String,
    pub amount: u64,
}

const CONTENT_HASH_RE_LEN: usize = 40;
pub const MIN_SATOSHIS: u64 = 1;
pub const MAX_SATOSHIS: u64 = 21_000_000 * 100_000_000;

/// Stateless script builder parameterized only by the fee rate; every
/// `compose_*` call is a pure function of its arguments (see `Det-Compose`).
#[derive(Debug, Clone)]
pub struct ScriptComposer {
    fee_rate_sat_per_byte: f64,
    network: Network,
}

impl ScriptComposer {
    pub fn new(fee_rate_sat_per_byte: f64, network: Network) -> Self {
        Self {
            fee_rate_sat_per_byte,
            network,
        }
    }

    fn parse_address(&self, address: &str) -> Result<Address, ComposerError> {
        Address::from_str(address)
            .map_err(|_| ComposerError::InvalidAddress(address.to_string()))?
            .require_network(self.network)
            .map_err(|_| ComposerError::InvalidAddress(address.to_string()))
    }

    fn validate_amount(amount: u64) -> Result<(), ComposerError> {
        if amount < MIN_SATOSHIS || amount > MAX_SATOSHIS {
            return Err(ComposerError::InvalidAmount(format!(
                "amount {amount} out of range [{MIN_SATOSHIS}, {MAX_SATOSHIS}]"
            )));
        }
        Ok(())
    }

    fn artifact_for_script(&self, script: ScriptBuf, amount_outputs: usize) -> ScriptArtifact {
        let locking_bytes = script.to_bytes();
        // 8-byte value + varint output count (amount_outputs ≥ 1 keeps this
        // at 1 byte for any realistic batch) + script length varint + script.
        let varint_len = varint_byte_len(locking_bytes.len() as u64);
        let estimated_length = 8 + varint_len + locking_bytes.len() + varint_byte_len(amount_outputs as u64);
        let estimated_fee = (estimated_length as f64 * self.fee_rate_sat_per_byte).ceil() as u64;
        ScriptArtifact {
            locking_bytes,
            estimated_length,
            estimated_fee,
            unlock_template: None,
        }
    }

    /// Standard single-payee lock (spec §4.4).
    pub fn compose_p2pkh(&self, recipient_address: &str, amount: u64) -> Result<ScriptArtifact, ComposerError> {
        Self::validate_amount(amount)?;
        let address = self.parse_address(recipient_address)?;
        Ok(self.artifact_for_script(address.script_pubkey(), 1))
    }

    /// One output whose satoshis equal the sum of `amounts`; all entries
    /// share `recipient_address`.
    pub fn compose_batch(&self, recipient_address: &str, amounts: &[u64]) -> Result<ScriptArtifact, ComposerError> {
        if amounts.is_empty() {
            return Err(ComposerError::EmptyBatch);
        }
        let total: u64 = amounts.iter().sum();
        self.compose_p2pkh(recipient_address, total)
    }

    /// Groups payable events by recipient address and returns one artifact
    /// per group.
    pub fn compose_mixed_batch(
        &self,
        events: &[PayableEvent],
    ) -> Result<HashMap<String, ScriptArtifact>, ComposerError> {
        if events.is_empty() {
            return Err(ComposerError::EmptyBatch);
        }
        let mut by_recipient: HashMap<String, u64> = HashMap::new();
        for event in events {
            *by_recipient.entry(event.recipient_address.clone()).or_insert(0) += event.amount;
        }
        by_recipient
            .into_iter()
            .map(|(address, total)| {
                let artifact = self.compose_p2pkh(&address, total)?;
                Ok((address, artifact))
            })
            .collect()
    }

    /// Channel settlement artifact (spec §4.2 `settle`): one output per side
    /// with a nonzero balance, local and remote summed independently. Built
    /// from `compose_mixed_batch` so a same-address local/remote pair still
    /// collapses to a single merged output instead of double-paying it.
    pub fn compose_settlement(
        &self,
        local_address: &str,
        local_amount: u64,
        remote_address: &str,
        remote_amount: u64,
    ) -> Result<Vec<ScriptArtifact>, ComposerError> {
        let mut events = Vec::with_capacity(2);
        if local_amount > 0 {
            events.push(PayableEvent { recipient_address: local_address.to_string(), amount: local_amount });
        }
        if remote_amount > 0 {
            events.push(PayableEvent { recipient_address: remote_address.to_string(), amount: remote_amount });
        }
        if events.is_empty() {
            return Err(ComposerError::EmptyBatch);
        }
        let by_recipient = self.compose_mixed_batch(&events)?;
        Ok(by_recipient.into_values().collect())
    }

    /// Pure validation of a single payment event's shape: hash format,
    /// block-index/size, amount range.
    pub fn validate_event(
        &self,
        content_hash: &str,
        block_index: i64,
        block_size: i64,
        amount: u64,
    ) -> Result<(), ComposerError> {
        validate_content_hash(content_hash)?;
        if block_index < 0 {
            return Err(ComposerError::InvalidAmount(format!(
                "block-index {block_index} must be nonnegative"
            )));
        }
        if block_size <= 0 {
            return Err(ComposerError::InvalidAmount(format!(
                "block-size {block_size} must be positive"
            )));
        }
        Self::validate_amount(amount)
    }

    /// Pure validation of a batch total against its line items, and (unless
    /// `mixed`) that every entry shares a single recipient.
    pub fn validate_batch(&self, events: &[PayableEvent], declared_total: u64, mixed: bool) -> Result<(), ComposerError> {
        if events.is_empty() {
            return Err(ComposerError::EmptyBatch);
        }
        if !mixed {
            let first = &events[0].recipient_address;
            if events.iter().any(|e| &e.recipient_address != first) {
                return Err(ComposerError::MixedRecipients);
            }
        }
        let sum: u64 = events.iter().map(|e| e.amount).sum();
        if sum != declared_total {
            return Err(ComposerError::TotalMismatch {
                total: declared_total,
                sum,
            });
        }
        Ok(())
    }
}

fn validate_content_hash(hash: &str) -> Result<(), ComposerError> {
    if hash.len() != CONTENT_HASH_RE_LEN || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ComposerError::InvalidHash(hash.to_string()));
    }
    Ok(())
}

/// Bitcoin-style varint encoded length, in bytes, of `n`.
fn varint_byte_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}
