//! Difficulty and compact target utilities.

use kestrel_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    NonContiguous,
    InsufficientHistory,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::NonContiguous => {
                write!(f, "header list must be contiguous by height")
            }
            DifficultyError::InsufficientHistory => {
                write!(f, "not enough headers to retarget")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The slice of header fields the retarget function consumes.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative && word != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        U256::from(word) << (8 * (size - 3))
    };

    if word != 0 {
        let overflow =
            size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        compact = (value >> (8 * (size - 3))).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(compact_to_u256(bits)?.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

/// Expected work for a block at this target: `2^256 / (target + 1)`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// Computes the `bits` a block extending `chain` must carry.
///
/// `chain` is a contiguous run of headers ending at the prospective
/// parent; at an adjustment boundary it must span a full interval.
pub fn get_next_work_required(
    chain: &[HeaderInfo],
    next_block_time: Option<i64>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    if chain.is_empty() {
        return Ok(pow_limit_bits);
    }

    ensure_contiguous(chain)?;
    let last = chain.last().expect("checked not empty");

    if params.pow_no_retarget {
        return Ok(last.bits);
    }

    let interval = params.difficulty_adjustment_interval();
    if (last.height + 1) % interval != 0 {
        if params.pow_allow_min_difficulty {
            // A block arriving after twice the target spacing may carry
            // the minimum difficulty.
            if let Some(next_time) = next_block_time {
                if next_time > last.time + params.pow_target_spacing * 2 {
                    return Ok(pow_limit_bits);
                }
            }
            // Otherwise inherit from the last non-minimum block since
            // the previous adjustment.
            let mut idx = chain.len() - 1;
            while idx > 0 && chain[idx].height % interval != 0 && chain[idx].bits == pow_limit_bits
            {
                idx -= 1;
            }
            return Ok(chain[idx].bits);
        }
        return Ok(last.bits);
    }

    let interval = interval as usize;
    if chain.len() < interval {
        return Err(DifficultyError::InsufficientHistory);
    }
    let first = &chain[chain.len() - interval];

    let span = params.pow_target_timespan;
    let actual = (last.time - first.time).clamp(span / 4, span * 4);

    let mut new_target = compact_to_u256(last.bits)?;
    new_target = new_target * U256::from(actual as u64) / U256::from(span as u64);

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if new_target > pow_limit {
        new_target = pow_limit;
    }

    Ok(u256_to_compact(new_target))
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}
