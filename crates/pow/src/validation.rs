//! Proof-of-work validation.

use kestrel_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    TargetEncoding(CompactError),
    TargetOutOfRange,
    HighHash,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::TargetEncoding(err) => write!(f, "{err}"),
            PowError::TargetOutOfRange => write!(f, "target outside admissible range"),
            PowError::HighHash => write!(f, "hash does not meet target"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::TargetEncoding(err)
    }
}

pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    let limit = U256::from_little_endian(&params.pow_limit);
    if target.is_zero() || target > limit {
        return Err(PowError::TargetOutOfRange);
    }
    if U256::from_little_endian(hash) > target {
        return Err(PowError::HighHash);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_consensus::{chain_params, hash256_from_hex, Network};

    #[test]
    fn genesis_hash_meets_its_target() {
        let params = chain_params(Network::Mainnet).consensus;
        let genesis = params.hash_genesis_block;
        assert_eq!(check_proof_of_work(&genesis, params.genesis_bits, &params), Ok(()));
    }

    #[test]
    fn high_hash_rejected() {
        let params = chain_params(Network::Mainnet).consensus;
        let high =
            hash256_from_hex("00000001000000000000000000000000000000000000000000000000000000ff")
                .expect("hash");
        assert_eq!(
            check_proof_of_work(&high, 0x1d00_ffff, &params),
            Err(PowError::HighHash)
        );
    }

    #[test]
    fn target_above_limit_rejected() {
        let params = chain_params(Network::Mainnet).consensus;
        // Regtest-grade target on mainnet.
        assert_eq!(
            check_proof_of_work(&[0u8; 32], 0x207f_ffff, &params),
            Err(PowError::TargetOutOfRange)
        );
        assert_eq!(
            check_proof_of_work(&[0u8; 32], 0, &params),
            Err(PowError::TargetOutOfRange)
        );
    }
}
