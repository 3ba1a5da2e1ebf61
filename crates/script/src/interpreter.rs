//! The script-verification capability and its ECDSA template backend.

use kestrel_primitives::{hash160, Transaction};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, VerifyOnly};

use crate::opcodes::decode_small_int;
use crate::script::{instructions, is_p2sh, is_push_only, push_data, push_values, Instruction};
use crate::sighash::{signature_hash, SIGHASH_ALL, SIGHASH_ANYONECANPAY, SIGHASH_SINGLE};
use crate::standard::{classify, ScriptClass};

pub const VERIFY_NONE: u32 = 0;
/// Evaluate pay-to-script-hash redemptions.
pub const VERIFY_P2SH: u32 = 1 << 0;
/// Enforce strict public key and hash-type encodings.
pub const VERIFY_STRICTENC: u32 = 1 << 1;
/// Bypass any signature-verification cache.
pub const VERIFY_NOCACHE: u32 = 1 << 2;

/// Opaque capability the consensus engine verifies input scripts with.
pub trait ScriptVerifier: Send + Sync {
    fn verify(
        &self,
        script_sig: &[u8],
        script_pubkey: &[u8],
        tx: &Transaction,
        input_index: usize,
        flags: u32,
    ) -> bool;
}

/// Verifier for the standard templates, backed by libsecp256k1.
pub struct EcdsaVerifier {
    secp: Secp256k1<VerifyOnly>,
}

impl EcdsaVerifier {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::verification_only(),
        }
    }

    fn check_signature(
        &self,
        sig_bytes: &[u8],
        pubkey_bytes: &[u8],
        script_code: &[u8],
        tx: &Transaction,
        input_index: usize,
        strict: bool,
    ) -> bool {
        let Some((&hash_type_byte, der)) = sig_bytes.split_last() else {
            return false;
        };
        let hash_type = u32::from(hash_type_byte);
        if strict {
            let base = hash_type & !SIGHASH_ANYONECANPAY;
            if !(SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base) {
                return false;
            }
            let valid_pubkey = matches!(
                (pubkey_bytes.len(), pubkey_bytes.first()),
                (33, Some(0x02 | 0x03)) | (65, Some(0x04))
            );
            if !valid_pubkey {
                return false;
            }
        }
        let Ok(signature) = Signature::from_der(der) else {
            return false;
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes) else {
            return false;
        };
        let digest = signature_hash(script_code, tx, input_index, hash_type);
        let message = Message::from_digest(digest);
        self.secp.verify_ecdsa(&message, &signature, &pubkey).is_ok()
    }
}

impl Default for EcdsaVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptVerifier for EcdsaVerifier {
    fn verify(
        &self,
        script_sig: &[u8],
        script_pubkey: &[u8],
        tx: &Transaction,
        input_index: usize,
        flags: u32,
    ) -> bool {
        let strict = flags & VERIFY_STRICTENC != 0;

        if flags & VERIFY_P2SH != 0 && is_p2sh(script_pubkey) {
            if !is_push_only(script_sig) {
                return false;
            }
            let Some(mut values) = push_values(script_sig) else {
                return false;
            };
            let Some(redeem) = values.pop() else {
                return false;
            };
            if hash160(&redeem)[..] != script_pubkey[2..22] {
                return false;
            }
            let mut inner_sig = Vec::with_capacity(script_sig.len());
            for value in &values {
                push_data(&mut inner_sig, value);
            }
            return self.verify(&inner_sig, &redeem, tx, input_index, flags & !VERIFY_P2SH);
        }

        let Some(sig_values) = push_values(script_sig) else {
            return false;
        };

        match classify(script_pubkey) {
            ScriptClass::PubKey => {
                let Some(pubkey) = push_values(script_pubkey)
                    .and_then(|values| values.into_iter().next())
                else {
                    return false;
                };
                let [signature] = sig_values.as_slice() else {
                    return false;
                };
                self.check_signature(signature, &pubkey, script_pubkey, tx, input_index, strict)
            }
            ScriptClass::PubKeyHash => {
                let [signature, pubkey] = sig_values.as_slice() else {
                    return false;
                };
                if hash160(pubkey)[..] != script_pubkey[3..23] {
                    return false;
                }
                self.check_signature(signature, pubkey, script_pubkey, tx, input_index, strict)
            }
            ScriptClass::Multisig => {
                // Shape [OP_m, keys.., OP_n, OP_CHECKMULTISIG], already
                // validated by the classifier.
                let ops: Vec<Instruction<'_>> = instructions(script_pubkey).collect();
                let Some(required) = ops.first().and_then(|op| decode_small_int(op.opcode)) else {
                    return false;
                };
                let required = required as usize;
                let keys: Vec<&[u8]> = ops[1..ops.len() - 2].iter().map(|op| op.data).collect();
                // Leading dummy element consumed by CHECKMULTISIG.
                let signatures = match sig_values.split_first() {
                    Some((dummy, rest)) if dummy.is_empty() => rest,
                    _ => return false,
                };
                if signatures.len() != required || required > keys.len() {
                    return false;
                }
                let mut key_index = 0;
                for signature in signatures {
                    let mut matched = false;
                    while key_index < keys.len() {
                        let key = &keys[key_index];
                        key_index += 1;
                        if self.check_signature(
                            signature,
                            key,
                            script_pubkey,
                            tx,
                            input_index,
                            strict,
                        ) {
                            matched = true;
                            break;
                        }
                    }
                    if !matched {
                        return false;
                    }
                }
                true
            }
            ScriptClass::ScriptHash | ScriptClass::NullData | ScriptClass::NonStandard => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_primitives::{OutPoint, TxIn, TxOut};
    use secp256k1::SecretKey;

    fn keypair() -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x42; 32]).expect("secret key");
        let public = PublicKey::from_secret_key(&secp, &secret);
        (secret, public)
    }

    fn p2pkh_script(pubkey: &PublicKey) -> Vec<u8> {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&hash160(&pubkey.serialize()));
        script.push(0x88);
        script.push(0xac);
        script
    }

    fn spend_tx() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([0x33; 32], 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut::new(900, vec![0xac])],
            lock_time: 0,
        }
    }

    #[test]
    fn p2pkh_signature_verifies_and_tampering_fails() {
        let secp = Secp256k1::new();
        let (secret, public) = keypair();
        let script_pubkey = p2pkh_script(&public);
        let tx = spend_tx();

        let digest = signature_hash(&script_pubkey, &tx, 0, SIGHASH_ALL);
        let message = Message::from_digest(digest);
        let mut signature = secp
            .sign_ecdsa(&message, &secret)
            .serialize_der()
            .to_vec();
        signature.push(SIGHASH_ALL as u8);

        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &signature);
        push_data(&mut script_sig, &public.serialize());

        let verifier = EcdsaVerifier::new();
        assert!(verifier.verify(&script_sig, &script_pubkey, &tx, 0, VERIFY_STRICTENC));

        // A different output amount changes the digest.
        let mut altered = tx.clone();
        altered.vout[0].value = 901;
        assert!(!verifier.verify(&script_sig, &script_pubkey, &altered, 0, VERIFY_STRICTENC));

        // Wrong key hash in the output script.
        let mut wrong_spk = script_pubkey.clone();
        wrong_spk[5] ^= 0x01;
        assert!(!verifier.verify(&script_sig, &wrong_spk, &tx, 0, VERIFY_STRICTENC));
    }

    #[test]
    fn p2sh_wrapped_pubkey_redeems() {
        let secp = Secp256k1::new();
        let (secret, public) = keypair();

        let mut redeem = Vec::new();
        push_data(&mut redeem, &public.serialize());
        redeem.push(0xac);

        let mut script_pubkey = vec![0xa9, 0x14];
        script_pubkey.extend_from_slice(&hash160(&redeem));
        script_pubkey.push(0x87);

        let tx = spend_tx();
        let digest = signature_hash(&redeem, &tx, 0, SIGHASH_ALL);
        let mut signature = secp
            .sign_ecdsa(&Message::from_digest(digest), &secret)
            .serialize_der()
            .to_vec();
        signature.push(SIGHASH_ALL as u8);

        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &signature);
        push_data(&mut script_sig, &redeem);

        let verifier = EcdsaVerifier::new();
        assert!(verifier.verify(&script_sig, &script_pubkey, &tx, 0, VERIFY_P2SH));
        // Without the P2SH flag the template is just an opaque hash lock.
        assert!(!verifier.verify(&script_sig, &script_pubkey, &tx, 0, VERIFY_NONE));
    }

    #[test]
    fn strict_encoding_rejects_undefined_hash_types() {
        let secp = Secp256k1::new();
        let (secret, public) = keypair();
        let script_pubkey = p2pkh_script(&public);
        let tx = spend_tx();

        let digest = signature_hash(&script_pubkey, &tx, 0, 0x20);
        let mut signature = secp
            .sign_ecdsa(&Message::from_digest(digest), &secret)
            .serialize_der()
            .to_vec();
        signature.push(0x20);

        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &signature);
        push_data(&mut script_sig, &public.serialize());

        let verifier = EcdsaVerifier::new();
        assert!(!verifier.verify(&script_sig, &script_pubkey, &tx, 0, VERIFY_STRICTENC));
        // The permissive re-run accepts the signature.
        assert!(verifier.verify(&script_sig, &script_pubkey, &tx, 0, VERIFY_NONE));
    }

    #[test]
    fn one_of_two_multisig() {
        let secp = Secp256k1::new();
        let (secret, public) = keypair();
        let other = PublicKey::from_secret_key(
            &secp,
            &SecretKey::from_slice(&[0x21; 32]).expect("key"),
        );

        let mut script_pubkey = vec![0x51];
        push_data(&mut script_pubkey, &other.serialize());
        push_data(&mut script_pubkey, &public.serialize());
        script_pubkey.push(0x52);
        script_pubkey.push(0xae);

        let tx = spend_tx();
        let digest = signature_hash(&script_pubkey, &tx, 0, SIGHASH_ALL);
        let mut signature = secp
            .sign_ecdsa(&Message::from_digest(digest), &secret)
            .serialize_der()
            .to_vec();
        signature.push(SIGHASH_ALL as u8);

        let mut script_sig = vec![0x00];
        push_data(&mut script_sig, &signature);

        let verifier = EcdsaVerifier::new();
        assert!(verifier.verify(&script_sig, &script_pubkey, &tx, 0, VERIFY_NONE));
    }
}
