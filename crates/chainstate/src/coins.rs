//! Per-transaction unspent-output records.

use kestrel_primitives::encoding::{DecodeError, Decoder, Encoder};
use kestrel_primitives::{Transaction, TxOut};

/// The unspent outputs of one transaction. Spent positions are holes;
/// a record whose outputs are all spent is pruned from its container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coins {
    pub coinbase: bool,
    pub height: i32,
    pub version: i32,
    pub outputs: Vec<Option<TxOut>>,
}

impl Coins {
    pub fn from_tx(tx: &Transaction, height: i32) -> Self {
        Self {
            coinbase: tx.is_coinbase(),
            height,
            version: tx.version,
            outputs: tx.vout.iter().cloned().map(Some).collect(),
        }
    }

    /// An empty record, the canonical "pruned" value.
    pub fn pruned() -> Self {
        Self {
            coinbase: false,
            height: 0,
            version: 0,
            outputs: Vec::new(),
        }
    }

    pub fn is_pruned(&self) -> bool {
        self.outputs.iter().all(|output| output.is_none())
    }

    pub fn is_available(&self, index: u32) -> bool {
        self.output(index).is_some()
    }

    pub fn output(&self, index: u32) -> Option<&TxOut> {
        self.outputs
            .get(index as usize)
            .and_then(|output| output.as_ref())
    }

    /// Takes an output, leaving a hole, and trims trailing holes.
    pub fn spend(&mut self, index: u32) -> Option<TxOut> {
        let slot = self.outputs.get_mut(index as usize)?;
        let taken = slot.take();
        if taken.is_some() {
            self.cleanup();
        }
        taken
    }

    fn cleanup(&mut self) {
        while matches!(self.outputs.last(), Some(None)) {
            self.outputs.pop();
        }
    }

    pub fn unspent_count(&self) -> usize {
        self.outputs
            .iter()
            .filter(|output| output.is_some())
            .count()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(u8::from(self.coinbase));
        encoder.write_i32_le(self.height);
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            match output {
                Some(output) => {
                    encoder.write_u8(1);
                    output.encode_into(&mut encoder);
                }
                None => encoder.write_u8(0),
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let coinbase = decoder.read_u8()? != 0;
        let height = decoder.read_i32_le()?;
        let version = decoder.read_i32_le()?;
        let count = decoder.read_varint()?;
        if count > decoder.remaining() as u64 {
            return Err(DecodeError::Oversized);
        }
        let mut outputs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if decoder.read_u8()? != 0 {
                outputs.push(Some(TxOut::decode_from(&mut decoder)?));
            } else {
                outputs.push(None);
            }
        }
        decoder.finish()?;
        Ok(Self {
            coinbase,
            height,
            version,
            outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_primitives::{OutPoint, TxIn};

    fn three_output_tx() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([0x01; 32], 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: (0..3)
                .map(|i| TxOut::new(1_000 * (i + 1), vec![0x51, i as u8]))
                .collect(),
            lock_time: 0,
        }
    }

    #[test]
    fn spend_leaves_holes_and_prunes_when_empty() {
        let mut coins = Coins::from_tx(&three_output_tx(), 7);
        assert!(coins.is_available(1));
        let spent = coins.spend(1).expect("output present");
        assert_eq!(spent.value, 2_000);
        assert!(!coins.is_available(1));
        assert!(coins.spend(1).is_none());
        assert_eq!(coins.unspent_count(), 2);

        // Spending the tail trims trailing holes.
        coins.spend(2).expect("output present");
        assert_eq!(coins.outputs.len(), 1);

        coins.spend(0).expect("output present");
        assert!(coins.is_pruned());
        assert!(coins.outputs.is_empty());
    }

    #[test]
    fn equality_tracks_unspent_positions_and_contents() {
        let tx = three_output_tx();
        let mut a = Coins::from_tx(&tx, 7);
        let b = Coins::from_tx(&tx, 7);
        assert_eq!(a, b);
        a.spend(0);
        assert_ne!(a, b);
    }

    #[test]
    fn encode_decode_preserves_holes() {
        let mut coins = Coins::from_tx(&three_output_tx(), 100_000);
        coins.coinbase = true;
        coins.spend(1);
        let bytes = coins.encode();
        let decoded = Coins::decode(&bytes).expect("decode");
        assert_eq!(decoded, coins);

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert_eq!(Coins::decode(&trailing), Err(DecodeError::TrailingBytes));
    }
}
