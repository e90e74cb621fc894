//! Time-locked and multi-party escrow lock construction, used for premium
//! transfers rather than ordinary per-block settlement.

use bitcoin::blockdata::opcodes::all::{
    OP_CHECKLOCKTIMEVERIFY, OP_CHECKMULTISIG, OP_CHECKSIG, OP_DROP, OP_ELSE, OP_ENDIF, OP_IF,
};
use bitcoin::blockdata::script::Builder;
use bitcoin::PublicKey;

use super::{ScriptArtifact, ScriptComposer};
use crate::error::ComposerError;

/// Spendable only after `deadline_unix`; before that, only `recipient_pubkey`
/// can spend by also paying `penalty_bps` (an early-withdraw path handled at
/// the transaction-construction layer, not encoded in the script itself —
/// the script only gates the two keys).
#[derive(Debug, Clone)]
pub struct TimelockParams {
    pub recipient_pubkey: PublicKey,
    pub early_withdraw_pubkey: PublicKey,
    pub deadline_unix: i64,
    pub penalty_bps: u16,
}

/// Three-party escrow: mutual completion (payer+payee), timeout refund
/// (payer+mediator), dispute resolution (m-of-n across all three).
#[derive(Debug, Clone)]
pub struct EscrowParams {
    pub payer_pubkey: PublicKey,
    pub payee_pubkey: PublicKey,
    pub mediator_pubkey: PublicKey,
    pub refund_locktime: i64,
    pub dispute_m: u8,
}

impl ScriptComposer {
    /// Spendable only after a wall-clock deadline; includes an early
    /// withdraw path gated by a separate key (the penalty itself — splitting
    /// the output value between the two claimants — is applied by the
    /// caller when it builds the spending transaction, not by this script).
    pub fn compose_timelocked_lock(&self, params: &TimelockParams) -> Result<ScriptArtifact, ComposerError> {
        if params.penalty_bps > 10_000 {
            return Err(ComposerError::InvalidAmount(format!(
                "penalty_bps {} exceeds 10000 (100%)",
                params.penalty_bps
            )));
        }
        let script = Builder::new()
            .push_opcode(OP_IF)
            .push_int(params.deadline_unix)
            .push_opcode(OP_CHECKLOCKTIMEVERIFY)
            .push_opcode(OP_DROP)
            .push_key(&params.recipient_pubkey)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_key(&params.early_withdraw_pubkey)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .into_script();
        Ok(self.artifact_for_script(script, 1))
    }

    /// Multi-party lock with three unlock paths — mutual completion
    /// (payer+payee), timeout refund (payer+mediator), dispute resolution
    /// (m-of-n across payer/payee/mediator).
    pub fn compose_escrow_lock(&self, params: &EscrowParams) -> Result<ScriptArtifact, ComposerError> {
        if params.dispute_m == 0 || params.dispute_m > 3 {
            return Err(ComposerError::InvalidAmount(format!(
                "dispute_m {} must be in 1..=3",
                params.dispute_m
            )));
        }
        let script = Builder::new()
            .push_opcode(OP_IF)
            // mutual completion: payer + payee, 2-of-2
            .push_int(2)
            .push_key(&params.payer_pubkey)
            .push_key(&params.payee_pubkey)
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ELSE)
            .push_opcode(OP_IF)
            // timeout refund: payer + mediator, after refund_locktime
            .push_int(params.refund_locktime)
            .push_opcode(OP_CHECKLOCKTIMEVERIFY)
            .push_opcode(OP_DROP)
            .push_int(2)
            .push_key(&params.payer_pubkey)
            .push_key(&params.mediator_pubkey)
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ELSE)
            // dispute resolution: m-of-3 across payer/payee/mediator
            .push_int(params.dispute_m as i64)
            .push_key(&params.payer_pubkey)
            .push_key(&params.payee_pubkey)
            .push_key(&params.mediator_pubkey)
            .push_int(3)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_ENDIF)
            .into_script();
        Ok(self.artifact_for_script(script, 1))
    }
}
