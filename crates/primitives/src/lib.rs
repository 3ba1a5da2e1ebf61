//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod transaction;

pub use block::{Block, BlockHeader, CURRENT_BLOCK_VERSION};
pub use hash::{hash160, hash256_to_hex, hex_to_bytes, sha256, sha256d};
pub use merkle::merkle_root;
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut, CURRENT_TX_VERSION};
