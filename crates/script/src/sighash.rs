//! Legacy signature-hash computation.

use kestrel_consensus::Hash256;
use kestrel_primitives::encoding::Encoder;
use kestrel_primitives::{sha256d, Transaction};

pub const SIGHASH_ALL: u32 = 1;
pub const SIGHASH_NONE: u32 = 2;
pub const SIGHASH_SINGLE: u32 = 3;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// The value hashed when the input or output index is out of range; a
/// quirk of the original algorithm that signers must reproduce.
fn one_hash() -> Hash256 {
    let mut hash = [0u8; 32];
    hash[0] = 1;
    hash
}

pub fn signature_hash(
    script_code: &[u8],
    tx: &Transaction,
    input_index: usize,
    hash_type: u32,
) -> Hash256 {
    if input_index >= tx.vin.len() {
        return one_hash();
    }

    let mut tmp = tx.clone();
    for input in &mut tmp.vin {
        input.script_sig.clear();
    }
    tmp.vin[input_index].script_sig = script_code.to_vec();

    match hash_type & 0x1f {
        SIGHASH_NONE => {
            tmp.vout.clear();
            for (index, input) in tmp.vin.iter_mut().enumerate() {
                if index != input_index {
                    input.sequence = 0;
                }
            }
        }
        SIGHASH_SINGLE => {
            if input_index >= tmp.vout.len() {
                return one_hash();
            }
            tmp.vout.truncate(input_index + 1);
            for output in tmp.vout.iter_mut().take(input_index) {
                output.value = -1;
                output.script_pubkey.clear();
            }
            for (index, input) in tmp.vin.iter_mut().enumerate() {
                if index != input_index {
                    input.sequence = 0;
                }
            }
        }
        _ => {}
    }

    if hash_type & SIGHASH_ANYONECANPAY != 0 {
        let own = tmp.vin.swap_remove(input_index);
        tmp.vin = vec![own];
    }

    let mut encoder = Encoder::with_capacity(256);
    tmp.encode_into(&mut encoder);
    encoder.write_u32_le(hash_type);
    sha256d(&encoder.into_inner())
}
