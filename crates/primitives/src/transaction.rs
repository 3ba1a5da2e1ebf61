//! Transaction types and consensus serialization.

use kestrel_consensus::{Amount, Hash256};

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

/// The highest transaction version the default relay policy accepts.
pub const CURRENT_TX_VERSION: i32 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn is_final(&self) -> bool {
        self.sequence == u32::MAX
    }

    fn encode_into(&self, encoder: &mut Encoder) {
        self.prevout.encode_into(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let prevout = OutPoint::decode_from(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }

    pub fn serialized_size(&self) -> usize {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        encoder.len()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// A coinbase has exactly one input, and that input names no real output.
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.encode_into(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.encode_into(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(256);
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let input_count = decoder.read_varint()?;
        if input_count > decoder.remaining() as u64 {
            return Err(DecodeError::Oversized);
        }
        let mut vin = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            vin.push(TxIn::decode_from(decoder)?);
        }
        let output_count = decoder.read_varint()?;
        if output_count > decoder.remaining() as u64 {
            return Err(DecodeError::Oversized);
        }
        let mut vout = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            vout.push(TxOut::decode_from(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(tx)
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn serialized_size(&self) -> usize {
        self.consensus_encode().len()
    }

    /// Sum of output values, None on overflow.
    pub fn value_out(&self) -> Option<Amount> {
        let mut total: Amount = 0;
        for output in &self.vout {
            total = total.checked_add(output.value)?;
        }
        Some(total)
    }

    /// Replacement ordering used by the sequence-based update rule: true
    /// when this transaction spends the same prevouts as `old` with a
    /// strictly later sequence on the lowest differing input.
    pub fn is_newer_than(&self, old: &Transaction) -> bool {
        if self.vin.len() != old.vin.len() {
            return false;
        }
        for (a, b) in self.vin.iter().zip(&old.vin) {
            if a.prevout != b.prevout {
                return false;
            }
        }
        let mut newer = false;
        let mut lowest = u32::MAX;
        for (a, b) in self.vin.iter().zip(&old.vin) {
            if a.sequence != b.sequence {
                if a.sequence <= lowest {
                    newer = false;
                    lowest = a.sequence;
                }
                if b.sequence < lowest {
                    newer = true;
                    lowest = b.sequence;
                }
            }
        }
        newer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend(hash_byte: u8, sequence: u32) -> TxIn {
        TxIn {
            prevout: OutPoint::new([hash_byte; 32], 0),
            script_sig: vec![0x51],
            sequence,
        }
    }

    fn one_in_one_out(sequence: u32) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![spend(0x11, sequence)],
            vout: vec![TxOut::new(1_000, vec![0x51])],
            lock_time: 0,
        }
    }

    #[test]
    fn coinbase_shape() {
        let mut tx = one_in_one_out(u32::MAX);
        assert!(!tx.is_coinbase());
        tx.vin[0].prevout = OutPoint::null();
        assert!(tx.is_coinbase());
        tx.vin.push(spend(0x22, 0));
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn encode_decode_identity() {
        let tx = Transaction {
            version: 1,
            vin: vec![spend(0x11, 0xfffe_0000), spend(0x22, u32::MAX)],
            vout: vec![
                TxOut::new(0, Vec::new()),
                TxOut::new(5_000_000_000, vec![0xac; 25]),
            ],
            lock_time: 499_999_999,
        };
        let bytes = tx.consensus_encode();
        let decoded = Transaction::consensus_decode(&bytes).expect("decode");
        assert_eq!(decoded, tx);
        assert_eq!(decoded.consensus_encode(), bytes);
        assert_eq!(tx.serialized_size(), bytes.len());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = one_in_one_out(0).consensus_encode();
        bytes.push(0x00);
        assert_eq!(
            Transaction::consensus_decode(&bytes),
            Err(DecodeError::TrailingBytes)
        );
    }

    #[test]
    fn newer_than_requires_higher_sequence_on_same_prevouts() {
        let old = one_in_one_out(5);
        let replacement = one_in_one_out(6);
        assert!(replacement.is_newer_than(&old));
        assert!(!old.is_newer_than(&replacement));
        assert!(!old.is_newer_than(&old));

        let mut other_prevout = one_in_one_out(9);
        other_prevout.vin[0].prevout.index = 1;
        assert!(!other_prevout.is_newer_than(&old));
    }
}
