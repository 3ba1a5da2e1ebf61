//! Consensus constants and per-network chain parameters.

pub mod constants;
pub mod money;
pub mod params;
pub mod subsidy;

/// A 256-bit hash in little-endian byte order (raw double-SHA-256 output).
pub type Hash256 = [u8; 32];

pub use money::{money_range, Amount, CENT, COIN, MAX_MONEY};
pub use params::{chain_params, hash256_from_hex, ChainParams, Checkpoint, ConsensusParams, Network};
pub use subsidy::{block_subsidy, block_value};
