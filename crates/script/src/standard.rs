//! Standard output-script templates and the dust rule.

use kestrel_consensus::Amount;
use kestrel_primitives::TxOut;

use crate::opcodes::*;
use crate::script::{instructions, is_p2sh, Instruction};

/// Largest payload a data-carrier output may embed.
const MAX_DATA_CARRIER_BYTES: usize = 40;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptClass {
    PubKey,
    PubKeyHash,
    ScriptHash,
    Multisig,
    NullData,
    NonStandard,
}

fn is_pubkey_shaped(data: &[u8]) -> bool {
    matches!(
        (data.len(), data.first()),
        (33, Some(0x02 | 0x03)) | (65, Some(0x04))
    )
}

pub fn classify(script: &[u8]) -> ScriptClass {
    if is_p2sh(script) {
        return ScriptClass::ScriptHash;
    }

    let mut ops: Vec<Instruction<'_>> = Vec::new();
    let mut iter = instructions(script);
    for instruction in iter.by_ref() {
        ops.push(instruction);
        if ops.len() > 24 {
            return ScriptClass::NonStandard;
        }
    }
    if iter.malformed() {
        return ScriptClass::NonStandard;
    }

    match ops.as_slice() {
        [key, sig_op]
            if sig_op.opcode == OP_CHECKSIG
                && key.opcode <= OP_PUSHDATA4
                && is_pubkey_shaped(key.data) =>
        {
            ScriptClass::PubKey
        }
        [dup, hash, key_hash, eqv, sig_op]
            if dup.opcode == OP_DUP
                && hash.opcode == OP_HASH160
                && key_hash.opcode == 0x14
                && eqv.opcode == OP_EQUALVERIFY
                && sig_op.opcode == OP_CHECKSIG =>
        {
            ScriptClass::PubKeyHash
        }
        [ret] if ret.opcode == OP_RETURN => ScriptClass::NullData,
        [ret, data]
            if ret.opcode == OP_RETURN
                && data.opcode <= OP_PUSHDATA4
                && data.data.len() <= MAX_DATA_CARRIER_BYTES =>
        {
            ScriptClass::NullData
        }
        [m, keys @ .., n, sig_op] if sig_op.opcode == OP_CHECKMULTISIG && !keys.is_empty() => {
            let required = match decode_small_int(m.opcode) {
                Some(value) => value as usize,
                None => return ScriptClass::NonStandard,
            };
            let total = match decode_small_int(n.opcode) {
                Some(value) => value as usize,
                None => return ScriptClass::NonStandard,
            };
            if total != keys.len() || required == 0 || required > total || total > 3 {
                return ScriptClass::NonStandard;
            }
            if keys.iter().all(|key| is_pubkey_shaped(key.data)) {
                ScriptClass::Multisig
            } else {
                ScriptClass::NonStandard
            }
        }
        _ => ScriptClass::NonStandard,
    }
}

pub fn is_standard_script(script: &[u8]) -> bool {
    classify(script) != ScriptClass::NonStandard
}

/// An output is dust when spending it costs more than a third of its
/// value at the given relay rate.
pub fn is_dust(output: &TxOut, min_relay_fee: Amount) -> bool {
    if classify(&output.script_pubkey) == ScriptClass::NullData {
        return false;
    }
    let spend_size = output.serialized_size() as i64 + 148;
    output.value < 3 * min_relay_fee * spend_size / 1000
}
