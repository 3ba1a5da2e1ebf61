//! Optional transaction index: txid to on-disk location.

use kestrel_consensus::Hash256;
use kestrel_primitives::encoding::{DecodeError, Decoder, Encoder};
use kestrel_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::flatfiles::FileLocation;

/// Where a confirmed transaction lives: its block record plus the byte
/// offset of the transaction within the serialized block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxLocation {
    pub block: FileLocation,
    pub tx_offset: u32,
}

impl TxLocation {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(16);
        self.block.encode_into(&mut encoder);
        encoder.write_u32_le(self.tx_offset);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let block = FileLocation::decode_from(&mut decoder)?;
        let tx_offset = decoder.read_u32_le()?;
        decoder.finish()?;
        Ok(Self { block, tx_offset })
    }
}

pub struct TxIndex<S> {
    store: S,
}

impl<S: KeyValueStore> TxIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn get(&self, txid: &Hash256) -> Result<Option<TxLocation>, StoreError> {
        match self.store.get(Column::TxIndex, txid)? {
            Some(bytes) => TxLocation::decode(&bytes)
                .map(Some)
                .map_err(|err| StoreError::Backend(err.to_string())),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, txid: &Hash256, location: TxLocation) {
        batch.put(Column::TxIndex, *txid, location.encode());
    }
}
