//! The transaction memory pool.
//!
//! Indexed by txid and by spent outpoint, with child-pays-for-parent
//! summaries maintained on every mutation. The pool holds only
//! transactions that fully validated against the current tip plus the
//! pool itself.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use kestrel_chainstate::coins::Coins;
use kestrel_chainstate::coinview::{CoinView, CoinViewError, CoinsDelta};
use kestrel_chainstate::state::ChainState;
use kestrel_chainstate::validation::{check_transaction, is_final_tx};
use kestrel_consensus::constants::{
    COINBASE_MATURITY, DEFAULT_BLOCK_PRIORITY_SIZE, DEFAULT_FREE_RELAY_LIMIT, MAX_ORPHAN_TX_SIZE,
    MAX_ORPHAN_TRANSACTIONS, MAX_STANDARD_TX_SIZE, MEMPOOL_HEIGHT, MIN_RELAY_TX_FEE,
};
use kestrel_consensus::{money_range, Hash256, CENT, MAX_MONEY};
use kestrel_primitives::encoding::{Decoder, Encoder};
use kestrel_primitives::transaction::CURRENT_TX_VERSION;
use kestrel_primitives::{hash256_to_hex, OutPoint, Transaction};
use kestrel_script::{
    classify, is_dust, is_push_only, is_standard_script, ScriptClass, VERIFY_P2SH,
    VERIFY_STRICTENC,
};
use kestrel_storage::KeyValueStore;
use rand::Rng;

const MEMPOOL_FILE_VERSION: u32 = 1;
/// Largest standard input script: a 3-of-3 pay-to-script-hash spend.
const MAX_STANDARD_SCRIPT_SIG: usize = 500;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    AlreadyInPool,
    Conflict,
    MissingInputs,
    NonStandard,
    InsufficientFee,
    RateLimited,
    Invalid,
    InvalidScript,
    Internal,
}

#[derive(Clone, Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub message: String,
    pub dos_score: u32,
    /// For MissingInputs: the parent txids we could not resolve.
    pub missing: Vec<Hash256>,
}

impl MempoolError {
    fn new(kind: MempoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            dos_score: 0,
            missing: Vec::new(),
        }
    }

    fn with_dos(kind: MempoolErrorKind, message: impl Into<String>, dos_score: u32) -> Self {
        Self {
            dos_score,
            ..Self::new(kind, message)
        }
    }
}

impl fmt::Display for MempoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MempoolError {}

pub struct MempoolTx {
    pub txid: Hash256,
    pub tx: Transaction,
    pub fee: i64,
    pub size: usize,
    pub time: u64,
    /// Pessimistic size of this transaction plus its in-pool ancestry.
    pub sum_tx_size: u64,
    /// Fee of this transaction plus the single largest parent chain.
    pub sum_tx_fees: i64,
    pub depth: u32,
}

#[derive(Clone, Debug)]
pub struct AcceptedTx {
    pub txid: Hash256,
    pub replaced: Option<Hash256>,
}

/// Exponentially decaying byte counter for free transactions, with a
/// ten-minute time constant.
pub struct RateLimiter {
    free_count: f64,
    last_time: i64,
    limit: i64,
}

impl RateLimiter {
    pub fn new(limit_kb_per_minute: i64) -> Self {
        Self {
            free_count: 0.0,
            last_time: 0,
            limit: limit_kb_per_minute,
        }
    }

    /// Admits `bytes` of free relay at `now`, or refuses.
    pub fn allow(&mut self, bytes: usize, now: i64) -> bool {
        let elapsed = (now - self.last_time).max(0).min(i64::from(i32::MAX));
        self.free_count *= (1.0_f64 - 1.0 / 600.0).powi(elapsed as i32);
        self.last_time = now;
        if self.free_count >= (self.limit * 10 * 1000) as f64 {
            return false;
        }
        self.free_count += bytes as f64;
        true
    }
}

pub struct Mempool {
    map_tx: HashMap<Hash256, MempoolTx>,
    next_tx: BTreeMap<OutPoint, Hash256>,
    deltas: HashMap<Hash256, (f64, i64)>,
    orphans: OrphanTxPool,
    rate: RateLimiter,
    min_relay_fee: i64,
    updates: u64,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(MIN_RELAY_TX_FEE, DEFAULT_FREE_RELAY_LIMIT)
    }
}

impl Mempool {
    pub fn new(min_relay_fee: i64, free_relay_limit: i64) -> Self {
        Self {
            map_tx: HashMap::new(),
            next_tx: BTreeMap::new(),
            deltas: HashMap::new(),
            orphans: OrphanTxPool::new(MAX_ORPHAN_TRANSACTIONS, MAX_ORPHAN_TX_SIZE),
            rate: RateLimiter::new(free_relay_limit),
            min_relay_fee,
            updates: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map_tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map_tx.is_empty()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.map_tx.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolTx> {
        self.map_tx.get(txid)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolTx> {
        self.map_tx.values()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        let mut out: Vec<_> = self.map_tx.keys().copied().collect();
        out.sort();
        out
    }

    /// The pool transaction spending `outpoint`, if any.
    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.next_tx.get(outpoint).copied()
    }

    /// Bumped on every pool mutation; cheap change detection.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn min_relay_fee(&self) -> i64 {
        self.min_relay_fee
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Manual operator priority adjustments; additive.
    pub fn prioritise(&mut self, txid: Hash256, priority_delta: f64, fee_delta: i64) {
        let entry = self.deltas.entry(txid).or_insert((0.0, 0));
        entry.0 += priority_delta;
        entry.1 += fee_delta;
        println!(
            "PrioritiseTransaction: {} priority += {priority_delta}, fee += {fee_delta}",
            hash256_to_hex(&txid)
        );
    }

    pub fn apply_deltas(&self, txid: &Hash256) -> (f64, i64) {
        self.deltas.get(txid).copied().unwrap_or((0.0, 0))
    }

    /// Relay fee floor for a transaction of `size` bytes.
    pub fn min_fee(&self, tx: &Transaction, size: usize, allow_free: bool) -> i64 {
        let (priority_delta, fee_delta) = self.apply_deltas(&tx.txid());
        if priority_delta > 0.0 || fee_delta > 0 {
            return 0;
        }
        let base = self.min_relay_fee;
        let mut min_fee = (1 + size as i64 / 1000) * base;
        if allow_free && size < DEFAULT_BLOCK_PRIORITY_SIZE - 1000 {
            min_fee = 0;
        }
        // Dust outputs always pay the base fee.
        if min_fee < base && tx.vout.iter().any(|output| output.value < CENT) {
            min_fee = base;
        }
        if !money_range(min_fee) {
            min_fee = MAX_MONEY;
        }
        min_fee
    }

    fn priority_sums(&self, prevouts: &[OutPoint], fee: i64, size: usize) -> (u64, i64, u32) {
        let mut sum_size = size as u64;
        let mut depth = 1u32;
        let mut max_parent_fees = 0i64;
        for prevout in prevouts {
            if let Some(parent) = self.map_tx.get(&prevout.hash) {
                // Fees take the single largest parent chain so a fee can
                // never be claimed twice through sibling outputs. Size
                // double-counts on purpose: a pessimistic bound is safe.
                max_parent_fees = max_parent_fees.max(parent.sum_tx_fees);
                sum_size = sum_size.saturating_add(parent.sum_tx_size);
                depth = depth.max(parent.depth + 1);
            }
        }
        (sum_size, fee.saturating_add(max_parent_fees), depth)
    }

    /// Inserts without validation. Callers go through `accept`.
    pub fn add_unchecked(
        &mut self,
        tx: Transaction,
        fee: i64,
        now: u64,
    ) -> Result<(), MempoolError> {
        let txid = tx.txid();
        if self.map_tx.contains_key(&txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInPool,
                "transaction already in pool",
            ));
        }
        for input in &tx.vin {
            if self.next_tx.contains_key(&input.prevout) {
                return Err(MempoolError::new(
                    MempoolErrorKind::Internal,
                    "unchecked insert would double spend",
                ));
            }
        }
        let prevouts: Vec<OutPoint> = tx.vin.iter().map(|input| input.prevout).collect();
        let size = tx.serialized_size();
        let (sum_tx_size, sum_tx_fees, depth) = self.priority_sums(&prevouts, fee, size);
        for prevout in &prevouts {
            self.next_tx.insert(*prevout, txid);
        }
        self.map_tx.insert(
            txid,
            MempoolTx {
                txid,
                tx,
                fee,
                size,
                time: now,
                sum_tx_size,
                sum_tx_fees,
                depth,
            },
        );
        self.updates += 1;
        Ok(())
    }

    /// Removes a transaction, optionally with every descendant first.
    pub fn remove(&mut self, txid: &Hash256, recursive: bool) -> Vec<Hash256> {
        let mut removed = Vec::new();
        self.remove_into(txid, recursive, &mut removed);
        removed
    }

    fn remove_into(&mut self, txid: &Hash256, recursive: bool, removed: &mut Vec<Hash256>) {
        if recursive {
            if let Some(entry) = self.map_tx.get(txid) {
                let outputs = entry.tx.vout.len() as u32;
                let spenders: Vec<Hash256> = (0..outputs)
                    .filter_map(|index| self.next_tx.get(&OutPoint::new(*txid, index)).copied())
                    .collect();
                for spender in spenders {
                    self.remove_into(&spender, true, removed);
                }
            }
        }
        if let Some(entry) = self.map_tx.remove(txid) {
            for input in &entry.tx.vin {
                if self.next_tx.get(&input.prevout) == Some(txid) {
                    self.next_tx.remove(&input.prevout);
                }
            }
            self.updates += 1;
            removed.push(*txid);
        }
    }

    /// Removes every pool transaction that spends an input of `tx`,
    /// recursively. Used after a block confirms a competing spend.
    pub fn remove_conflicts(&mut self, tx: &Transaction) -> Vec<Hash256> {
        let own = tx.txid();
        let mut removed = Vec::new();
        for input in &tx.vin {
            if let Some(conflicting) = self.next_tx.get(&input.prevout).copied() {
                if conflicting != own {
                    self.remove_into(&conflicting, true, &mut removed);
                }
            }
        }
        removed
    }

    /// Recomputes the priority summaries of everything that transitively
    /// depends on a changed transaction. The frontier only ever moves
    /// away from `changed`, bounding the work at one pass per entry.
    pub fn update_priorities(&mut self, changed: &HashSet<Hash256>) {
        let mut dirty: Vec<Hash256> = Vec::new();
        for hash in changed {
            match self.map_tx.get(hash) {
                None => dirty.push(*hash),
                Some(entry) => {
                    let waits_on_changed = entry
                        .tx
                        .vin
                        .iter()
                        .any(|input| changed.contains(&input.prevout.hash));
                    if !waits_on_changed {
                        dirty.push(*hash);
                    }
                }
            }
        }

        let mut recomputed = 0usize;
        while !dirty.is_empty() {
            let mut next_dirty: HashSet<Hash256> = HashSet::new();
            for parent in &dirty {
                let spenders: Vec<Hash256> = self
                    .next_tx
                    .range(OutPoint::new(*parent, 0)..=OutPoint::new(*parent, u32::MAX))
                    .map(|(_, spender)| *spender)
                    .collect();
                for spender in spenders {
                    let Some((prevouts, fee, size)) = self.map_tx.get(&spender).map(|entry| {
                        (
                            entry
                                .tx
                                .vin
                                .iter()
                                .map(|input| input.prevout)
                                .collect::<Vec<_>>(),
                            entry.fee,
                            entry.size,
                        )
                    }) else {
                        continue;
                    };
                    let (sum_size, sum_fees, depth) = self.priority_sums(&prevouts, fee, size);
                    if let Some(entry) = self.map_tx.get_mut(&spender) {
                        entry.sum_tx_size = sum_size;
                        entry.sum_tx_fees = sum_fees;
                        entry.depth = depth;
                    }
                    next_dirty.insert(spender);
                    recomputed += 1;
                }
            }
            dirty = next_dirty.into_iter().collect();
        }
        if recomputed > 0 {
            self.updates += 1;
        }
    }

    pub fn clear(&mut self) {
        self.map_tx.clear();
        self.next_tx.clear();
        self.updates += 1;
    }

    /// Full admission path: validation, policy, input resolution over
    /// the chain view with the pool overlaid, fees, and scripts.
    pub fn accept<S: KeyValueStore>(
        &mut self,
        chain: &mut ChainState<S>,
        tx: Transaction,
        limit_free: bool,
        now: i64,
    ) -> Result<AcceptedTx, MempoolError> {
        if tx.is_coinbase() {
            return Err(MempoolError::with_dos(
                MempoolErrorKind::Invalid,
                "coinbase as individual transaction",
                100,
            ));
        }
        check_transaction(&tx).map_err(|err| {
            MempoolError::with_dos(MempoolErrorKind::Invalid, err.to_string(), err.dos_score())
        })?;

        let txid = tx.txid();
        let next_height = chain.height() + 1;
        let require_standard = chain.params().require_standard;
        let allow_replacement = chain.params().allow_replacement;

        if require_standard {
            if let Err(reason) = is_standard_tx(&tx, next_height, now, self.min_relay_fee) {
                return Err(MempoolError::new(MempoolErrorKind::NonStandard, reason));
            }
        }

        if self.map_tx.contains_key(&txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInPool,
                "transaction already in pool",
            ));
        }

        // Conflicts against the pool; at most a sequence-based update of
        // one non-final transaction may go through.
        let mut replace: Option<Hash256> = None;
        for (index, input) in tx.vin.iter().enumerate() {
            let Some(old_txid) = self.next_tx.get(&input.prevout).copied() else {
                continue;
            };
            if !allow_replacement || index != 0 {
                return Err(MempoolError::new(
                    MempoolErrorKind::Conflict,
                    "input already spent in pool",
                ));
            }
            let Some(old) = self.map_tx.get(&old_txid) else {
                return Err(MempoolError::new(
                    MempoolErrorKind::Internal,
                    "spent index out of sync",
                ));
            };
            if is_final_tx(&old.tx, next_height, now) {
                return Err(MempoolError::new(
                    MempoolErrorKind::Conflict,
                    "conflicting transaction is final",
                ));
            }
            if !tx.is_newer_than(&old.tx) {
                return Err(MempoolError::new(
                    MempoolErrorKind::Conflict,
                    "replacement is not newer",
                ));
            }
            for other in &tx.vin {
                match self.next_tx.get(&other.prevout) {
                    None => {}
                    Some(spender) if *spender == old_txid => {}
                    Some(_) => {
                        return Err(MempoolError::new(
                            MempoolErrorKind::Conflict,
                            "replacement conflicts with multiple transactions",
                        ))
                    }
                }
            }
            replace = Some(old_txid);
            break;
        }

        // Resolve every input through the pool overlay.
        let mut input_values = Vec::with_capacity(tx.vin.len());
        let mut input_scripts = Vec::with_capacity(tx.vin.len());
        {
            let mut overlay = MempoolCoins {
                base: chain.coin_view(),
                pool: &*self,
            };
            if overlay.have_coins(&txid).map_err(internal)? {
                return Err(MempoolError::new(
                    MempoolErrorKind::AlreadyInPool,
                    "outputs already known",
                ));
            }
            let mut missing = Vec::new();
            for input in &tx.vin {
                if overlay
                    .coins(&input.prevout.hash)
                    .map_err(internal)?
                    .is_none()
                {
                    missing.push(input.prevout.hash);
                }
            }
            if !missing.is_empty() {
                let mut err = MempoolError::new(MempoolErrorKind::MissingInputs, "missing inputs");
                err.missing = missing;
                return Err(err);
            }
            for input in &tx.vin {
                let coins = overlay
                    .coins(&input.prevout.hash)
                    .map_err(internal)?
                    .ok_or_else(|| {
                        MempoolError::new(MempoolErrorKind::MissingInputs, "missing inputs")
                    })?;
                let Some(output) = coins.output(input.prevout.index) else {
                    return Err(MempoolError::new(
                        MempoolErrorKind::Invalid,
                        "inputs already spent",
                    ));
                };
                if coins.coinbase && next_height - coins.height < COINBASE_MATURITY {
                    return Err(MempoolError::new(
                        MempoolErrorKind::Invalid,
                        "premature spend of coinbase",
                    ));
                }
                input_values.push(output.value);
                input_scripts.push(output.script_pubkey.clone());
            }
        }

        let mut value_in = 0i64;
        for value in &input_values {
            value_in = value_in
                .checked_add(*value)
                .filter(|total| money_range(*total))
                .ok_or_else(|| {
                    MempoolError::new(MempoolErrorKind::Invalid, "input values out of range")
                })?;
        }
        let value_out = tx
            .value_out()
            .filter(|total| money_range(*total))
            .ok_or_else(|| {
                MempoolError::new(MempoolErrorKind::Invalid, "output values out of range")
            })?;
        if value_in < value_out {
            return Err(MempoolError::new(
                MempoolErrorKind::Invalid,
                "value in below value out",
            ));
        }
        let fee = value_in - value_out;
        let size = tx.serialized_size();

        let min_fee = self.min_fee(&tx, size, true);
        if limit_free && fee < min_fee {
            return Err(MempoolError::new(
                MempoolErrorKind::InsufficientFee,
                format!("fee {fee} below minimum {min_fee}"),
            ));
        }
        // Penny-flooding guard for free transactions.
        if limit_free && fee < self.min_relay_fee && !self.rate.allow(size, now) {
            return Err(MempoolError::new(
                MempoolErrorKind::RateLimited,
                "free transaction rejected by rate limiter",
            ));
        }

        // Scripts last, against CPU exhaustion.
        let verifier = chain.verifier();
        for (index, input) in tx.vin.iter().enumerate() {
            if !verifier.verify(
                &input.script_sig,
                &input_scripts[index],
                &tx,
                index,
                VERIFY_P2SH | VERIFY_STRICTENC,
            ) {
                return Err(MempoolError::new(
                    MempoolErrorKind::InvalidScript,
                    format!("script verification failed on input {index}"),
                ));
            }
        }

        if let Some(old_txid) = replace {
            println!(
                "mempool: replacing {} with newer version",
                hash256_to_hex(&old_txid)
            );
            self.remove(&old_txid, false);
        }
        self.add_unchecked(tx, fee, now.max(0) as u64)?;
        Ok(AcceptedTx {
            txid,
            replaced: replace,
        })
    }

    pub fn add_orphan(&mut self, tx: Transaction) -> bool {
        self.orphans.insert(tx)
    }

    pub fn orphan_contains(&self, txid: &Hash256) -> bool {
        self.orphans.contains(txid)
    }

    /// Orphans that listed `parent` among their inputs.
    pub fn take_orphan_dependents(&mut self, parent: &Hash256) -> Vec<Transaction> {
        self.orphans.take_dependents(parent)
    }

    /// Versioned dump of the pool for persistence across restarts.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(MEMPOOL_FILE_VERSION);
        encoder.write_varint(self.map_tx.len() as u64);
        for txid in self.txids() {
            let entry = &self.map_tx[&txid];
            encoder.write_var_bytes(&entry.tx.consensus_encode());
            encoder.write_u64_le(entry.time);
        }
        encoder.into_inner()
    }

    /// Decodes a dump; entries go back through `accept` on load.
    pub fn entries_from_bytes(bytes: &[u8]) -> Result<Vec<(Transaction, u64)>, String> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder
            .read_u32_le()
            .map_err(|err| format!("invalid mempool file: {err}"))?;
        if version != MEMPOOL_FILE_VERSION {
            return Err(format!("unsupported mempool file version {version}"));
        }
        let count = decoder
            .read_varint()
            .map_err(|err| format!("invalid mempool file: {err}"))?;
        let mut entries = Vec::with_capacity(count.min(100_000) as usize);
        for _ in 0..count {
            let raw = decoder
                .read_var_bytes()
                .map_err(|err| format!("invalid mempool file: {err}"))?;
            let time = decoder
                .read_u64_le()
                .map_err(|err| format!("invalid mempool file: {err}"))?;
            let tx = Transaction::consensus_decode(&raw)
                .map_err(|err| format!("invalid mempool entry: {err}"))?;
            entries.push((tx, time));
        }
        if !decoder.is_empty() {
            return Err("invalid mempool file: trailing bytes".to_string());
        }
        Ok(entries)
    }
}

fn internal(err: CoinViewError) -> MempoolError {
    MempoolError::new(MempoolErrorKind::Internal, err.to_string())
}

/// Standard-shape policy for relayed transactions.
pub fn is_standard_tx(
    tx: &Transaction,
    next_height: i32,
    now: i64,
    min_relay_fee: i64,
) -> Result<(), &'static str> {
    if tx.version > CURRENT_TX_VERSION {
        return Err("version");
    }
    // One extra block of slack so a transaction can propagate just
    // before it becomes minable.
    if !is_final_tx(tx, next_height + 1, now) {
        return Err("non-final");
    }
    if tx.serialized_size() >= MAX_STANDARD_TX_SIZE {
        return Err("tx-size");
    }
    for input in &tx.vin {
        if input.script_sig.len() > MAX_STANDARD_SCRIPT_SIG {
            return Err("scriptsig-size");
        }
        if !is_push_only(&input.script_sig) {
            return Err("scriptsig-not-pushonly");
        }
    }
    let mut data_outputs = 0;
    for output in &tx.vout {
        if !is_standard_script(&output.script_pubkey) {
            return Err("scriptpubkey");
        }
        if classify(&output.script_pubkey) == ScriptClass::NullData {
            data_outputs += 1;
        } else if is_dust(output, min_relay_fee) {
            return Err("dust");
        }
    }
    if data_outputs > 1 {
        return Err("multiple-data-outputs");
    }
    Ok(())
}

/// Read-only view overlaying the pool on a backing chain view: misses
/// synthesize coin records at the pool pseudo-height.
pub struct MempoolCoins<'a, V> {
    pub base: &'a mut V,
    pub pool: &'a Mempool,
}

impl<V: CoinView> CoinView for MempoolCoins<'_, V> {
    fn coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, CoinViewError> {
        if let Some(coins) = self.base.coins(txid)? {
            return Ok(Some(coins));
        }
        Ok(self
            .pool
            .get(txid)
            .map(|entry| Coins::from_tx(&entry.tx, MEMPOOL_HEIGHT)))
    }

    fn best_block(&mut self) -> Result<Option<Hash256>, CoinViewError> {
        self.base.best_block()
    }

    fn apply(&mut self, _delta: &CoinsDelta) -> Result<(), CoinViewError> {
        Err(CoinViewError::ReadOnly)
    }
}

/// Transactions whose parents have not been seen; bounded, randomly
/// evicted, indexed by every referenced parent.
pub struct OrphanTxPool {
    by_hash: HashMap<Hash256, Transaction>,
    by_prev: HashMap<Hash256, HashSet<Hash256>>,
    max_entries: usize,
    max_tx_size: usize,
}

impl OrphanTxPool {
    pub fn new(max_entries: usize, max_tx_size: usize) -> Self {
        Self {
            by_hash: HashMap::new(),
            by_prev: HashMap::new(),
            max_entries: max_entries.max(1),
            max_tx_size,
        }
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.by_hash.contains_key(txid)
    }

    pub fn insert(&mut self, tx: Transaction) -> bool {
        let txid = tx.txid();
        if self.by_hash.contains_key(&txid) {
            return false;
        }
        // Large orphans are a cheap memory-exhaustion vector; a peer
        // with a real dependency will rebroadcast later.
        if tx.serialized_size() > self.max_tx_size {
            eprintln!("ignoring large orphan tx {}", hash256_to_hex(&txid));
            return false;
        }
        for input in &tx.vin {
            self.by_prev
                .entry(input.prevout.hash)
                .or_default()
                .insert(txid);
        }
        self.by_hash.insert(txid, tx);

        while self.by_hash.len() > self.max_entries {
            let victim_index = rand::thread_rng().gen_range(0..self.by_hash.len());
            let victim = *self
                .by_hash
                .keys()
                .nth(victim_index)
                .expect("index within len");
            self.remove(&victim);
        }
        true
    }

    fn remove(&mut self, txid: &Hash256) -> Option<Transaction> {
        let tx = self.by_hash.remove(txid)?;
        for input in &tx.vin {
            if let Some(children) = self.by_prev.get_mut(&input.prevout.hash) {
                children.remove(txid);
                if children.is_empty() {
                    self.by_prev.remove(&input.prevout.hash);
                }
            }
        }
        Some(tx)
    }

    pub fn take_dependents(&mut self, parent: &Hash256) -> Vec<Transaction> {
        let children: Vec<Hash256> = self
            .by_prev
            .get(parent)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        children
            .iter()
            .filter_map(|child| self.remove(child))
            .collect()
    }
}
