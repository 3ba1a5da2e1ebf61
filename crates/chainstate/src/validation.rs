//! The validation verdict type and context-free block/transaction rules.

use std::collections::HashSet;
use std::fmt;

use kestrel_consensus::constants::{
    LOCKTIME_THRESHOLD, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_COINBASE_SCRIPT_LEN,
    MAX_FUTURE_BLOCK_TIME, MIN_COINBASE_SCRIPT_LEN,
};
use kestrel_consensus::{money_range, ConsensusParams, MAX_MONEY};
use kestrel_primitives::{Block, Transaction};
use kestrel_script::count_sigops;
use kestrel_storage::StoreError;

use crate::coinview::CoinViewError;
use crate::flatfiles::FlatFileError;
use crate::undo::UndoError;

/// Outcome of validating an object, or of an operation that can fail
/// locally. `Ok(())` is the Valid verdict.
#[derive(Clone, Debug)]
pub enum ValidationError {
    /// Consensus-invalid; the peer that sent it earns `dos_score`.
    Invalid {
        reason: &'static str,
        dos_score: u32,
    },
    /// Acceptable but depends on parents we have not seen.
    Orphan,
    /// Local failure; not attributable to a peer.
    Error(String),
    /// Fatal local failure; the node must shut down.
    Abort(String),
}

impl ValidationError {
    pub fn invalid(reason: &'static str, dos_score: u32) -> Self {
        ValidationError::Invalid { reason, dos_score }
    }

    pub fn dos100(reason: &'static str) -> Self {
        Self::invalid(reason, 100)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, ValidationError::Invalid { .. })
    }

    pub fn dos_score(&self) -> u32 {
        match self {
            ValidationError::Invalid { dos_score, .. } => *dos_score,
            _ => 0,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Invalid { reason, dos_score } => {
                write!(f, "{reason} (dos {dos_score})")
            }
            ValidationError::Orphan => write!(f, "orphan"),
            ValidationError::Error(message) => write!(f, "{message}"),
            ValidationError::Abort(message) => write!(f, "fatal: {message}"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<StoreError> for ValidationError {
    fn from(err: StoreError) -> Self {
        ValidationError::Error(err.to_string())
    }
}

impl From<CoinViewError> for ValidationError {
    fn from(err: CoinViewError) -> Self {
        ValidationError::Error(err.to_string())
    }
}

impl From<FlatFileError> for ValidationError {
    fn from(err: FlatFileError) -> Self {
        ValidationError::Error(err.to_string())
    }
}

impl From<UndoError> for ValidationError {
    fn from(err: UndoError) -> Self {
        ValidationError::Error(err.to_string())
    }
}

/// Context-free transaction checks.
pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::invalid("bad-txns-vin-empty", 10));
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::invalid("bad-txns-vout-empty", 10));
    }
    if tx.serialized_size() > MAX_BLOCK_SIZE {
        return Err(ValidationError::dos100("bad-txns-oversize"));
    }

    let mut total: i64 = 0;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(ValidationError::dos100("bad-txns-vout-negative"));
        }
        if output.value > MAX_MONEY {
            return Err(ValidationError::dos100("bad-txns-vout-toolarge"));
        }
        total = total
            .checked_add(output.value)
            .ok_or_else(|| ValidationError::dos100("bad-txns-txouttotal-toolarge"))?;
        if !money_range(total) {
            return Err(ValidationError::dos100("bad-txns-txouttotal-toolarge"));
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(ValidationError::dos100("bad-txns-inputs-duplicate"));
        }
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&len) {
            return Err(ValidationError::dos100("bad-cb-length"));
        }
    } else {
        for input in &tx.vin {
            if input.prevout.is_null() {
                return Err(ValidationError::invalid("bad-txns-prevout-null", 10));
            }
        }
    }

    Ok(())
}

/// Finality of a transaction at a given chain position.
pub fn is_final_tx(tx: &Transaction, height: i32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let threshold = if tx.lock_time < LOCKTIME_THRESHOLD {
        i64::from(height)
    } else {
        block_time
    };
    if i64::from(tx.lock_time) < threshold {
        return true;
    }
    tx.vin.iter().all(|input| input.is_final())
}

/// Context-free block checks: everything provable without the index.
pub fn check_block(
    block: &Block,
    adjusted_time: i64,
    params: &ConsensusParams,
    check_pow: bool,
) -> Result<(), ValidationError> {
    if block.transactions.is_empty()
        || block.transactions.len() > MAX_BLOCK_SIZE
        || block.serialized_size() > MAX_BLOCK_SIZE
    {
        return Err(ValidationError::dos100("bad-blk-length"));
    }

    if check_pow {
        kestrel_pow::check_proof_of_work(&block.hash(), block.header.bits, params)
            .map_err(|_| ValidationError::invalid("high-hash", 50))?;
    }

    if i64::from(block.header.time) > adjusted_time + MAX_FUTURE_BLOCK_TIME {
        return Err(ValidationError::invalid("time-too-new", 0));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::dos100("bad-cb-missing"));
    }
    for tx in &block.transactions[1..] {
        if tx.is_coinbase() {
            return Err(ValidationError::dos100("bad-cb-multiple"));
        }
    }

    for tx in &block.transactions {
        check_transaction(tx)?;
    }

    let mut txids = HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        if !txids.insert(tx.txid()) {
            return Err(ValidationError::dos100("bad-txns-duplicate"));
        }
    }

    let sigops: usize = block
        .transactions
        .iter()
        .map(|tx| legacy_sigop_count(tx))
        .sum();
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(ValidationError::dos100("bad-blk-sigops"));
    }

    if block.merkle_root() != block.header.merkle_root {
        return Err(ValidationError::dos100("bad-txnmrklroot"));
    }

    Ok(())
}

/// Legacy sigop count over all of a transaction's scripts.
pub fn legacy_sigop_count(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .vin
        .iter()
        .map(|input| count_sigops(&input.script_sig, false))
        .sum();
    let outputs: usize = tx
        .vout
        .iter()
        .map(|output| count_sigops(&output.script_pubkey, false))
        .sum();
    inputs + outputs
}
