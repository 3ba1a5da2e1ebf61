//! Data required to reverse a connected block.

use std::fmt;

use kestrel_consensus::Hash256;
use kestrel_primitives::encoding::{DecodeError, Decoder, Encoder};
use kestrel_primitives::{sha256d, TxOut};

/// The pre-spend state of one consumed output.
///
/// `height` is non-zero only when the spend erased the final output of
/// the prior record; the record's metadata rides along so disconnect
/// can resurrect the whole transaction entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxInUndo {
    pub txout: TxOut,
    pub coinbase: bool,
    pub height: i32,
    pub version: i32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub spent: Vec<TxInUndo>,
}

/// Undo data for every non-coinbase transaction of one block, in block
/// order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

#[derive(Debug)]
pub enum UndoError {
    Decode(DecodeError),
    ChecksumMismatch,
}

impl fmt::Display for UndoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndoError::Decode(err) => write!(f, "corrupt undo data: {err}"),
            UndoError::ChecksumMismatch => write!(f, "undo data checksum mismatch"),
        }
    }
}

impl std::error::Error for UndoError {}

impl From<DecodeError> for UndoError {
    fn from(err: DecodeError) -> Self {
        UndoError::Decode(err)
    }
}

impl TxInUndo {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.height);
        if self.height != 0 {
            encoder.write_u8(u8::from(self.coinbase));
            encoder.write_i32_le(self.version);
        }
        self.txout.encode_into(encoder);
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let height = decoder.read_i32_le()?;
        let (coinbase, version) = if height != 0 {
            (decoder.read_u8()? != 0, decoder.read_i32_le()?)
        } else {
            (false, 0)
        };
        let txout = TxOut::decode_from(decoder)?;
        Ok(Self {
            txout,
            coinbase,
            height,
            version,
        })
    }
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(self.txs.len() as u64);
        for tx in &self.txs {
            encoder.write_varint(tx.spent.len() as u64);
            for spent in &tx.spent {
                spent.encode_into(&mut encoder);
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let undo = Self::decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(undo)
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let tx_count = decoder.read_varint()?;
        if tx_count > decoder.remaining() as u64 {
            return Err(DecodeError::Oversized);
        }
        let mut txs = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            let spent_count = decoder.read_varint()?;
            if spent_count > decoder.remaining() as u64 {
                return Err(DecodeError::Oversized);
            }
            let mut spent = Vec::with_capacity(spent_count as usize);
            for _ in 0..spent_count {
                spent.push(TxInUndo::decode_from(decoder)?);
            }
            txs.push(TxUndo { spent });
        }
        Ok(Self { txs })
    }

    /// Serializes as `payload || checksum` where the checksum binds the
    /// parent block hash.
    pub fn encode_with_checksum(&self, prev_block: &Hash256) -> Vec<u8> {
        let mut bytes = self.encode();
        let checksum = undo_checksum(prev_block, &bytes);
        bytes.extend_from_slice(&checksum);
        bytes
    }

    pub fn decode_with_checksum(
        prev_block: &Hash256,
        bytes: &[u8],
    ) -> Result<Self, UndoError> {
        if bytes.len() < 32 {
            return Err(UndoError::Decode(DecodeError::UnexpectedEnd));
        }
        let (payload, stored) = bytes.split_at(bytes.len() - 32);
        if undo_checksum(prev_block, payload)[..] != *stored {
            return Err(UndoError::ChecksumMismatch);
        }
        Ok(Self::decode(payload)?)
    }
}

pub fn undo_checksum(prev_block: &Hash256, payload: &[u8]) -> Hash256 {
    let mut bound = Vec::with_capacity(32 + payload.len());
    bound.extend_from_slice(prev_block);
    bound.extend_from_slice(payload);
    sha256d(&bound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_undo() -> BlockUndo {
        BlockUndo {
            txs: vec![
                TxUndo {
                    spent: vec![
                        TxInUndo {
                            txout: TxOut::new(1_000, vec![0xac]),
                            coinbase: false,
                            height: 0,
                            version: 0,
                        },
                        TxInUndo {
                            txout: TxOut::new(5_000_000_000, vec![0x51; 25]),
                            coinbase: true,
                            height: 12,
                            version: 1,
                        },
                    ],
                },
                TxUndo { spent: Vec::new() },
            ],
        }
    }

    #[test]
    fn round_trips_with_whole_record_metadata() {
        let undo = sample_undo();
        let decoded = BlockUndo::decode(&undo.encode()).expect("decode");
        assert_eq!(decoded, undo);
        assert!(decoded.txs[0].spent[1].coinbase);
        assert_eq!(decoded.txs[0].spent[1].height, 12);
        assert_eq!(decoded.txs[0].spent[0].height, 0);
    }

    #[test]
    fn checksum_binds_parent_and_payload() {
        let undo = sample_undo();
        let prev = [0x77u8; 32];
        let bytes = undo.encode_with_checksum(&prev);
        assert_eq!(
            BlockUndo::decode_with_checksum(&prev, &bytes).expect("verify"),
            undo
        );

        let mut flipped = bytes.clone();
        flipped[0] ^= 0x01;
        assert!(matches!(
            BlockUndo::decode_with_checksum(&prev, &flipped),
            Err(UndoError::ChecksumMismatch)
        ));

        // Same payload under a different parent hash fails.
        assert!(matches!(
            BlockUndo::decode_with_checksum(&[0x78u8; 32], &bytes),
            Err(UndoError::ChecksumMismatch)
        ));
    }
}
