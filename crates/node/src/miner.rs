//! Block template assembly and the mining loop.
//!
//! Selection runs in two phases, priority first and fee-rate second,
//! over a dependency graph of pool transactions. A candidate and its
//! unconfirmed ancestors are applied to a second-level scratch view;
//! only a fully valid package reaches the template.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use kestrel_chainstate::coins::Coins;
use kestrel_chainstate::coinview::{CoinCache, CoinView};
use kestrel_chainstate::state::{connect_block, ChainState};
use kestrel_chainstate::validation::{is_final_tx, legacy_sigop_count, ValidationError};
use kestrel_consensus::constants::{
    DEFAULT_BLOCK_MAX_SIZE, DEFAULT_BLOCK_MIN_SIZE, DEFAULT_BLOCK_PRIORITY_SIZE, FREE_TX_PRIORITY,
    MAX_BLOCK_SIGOPS, MIN_RELAY_TX_FEE,
};
use kestrel_consensus::{block_value, Hash256};
use kestrel_pow::check_proof_of_work;
use kestrel_primitives::{
    hash256_to_hex, Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut, CURRENT_BLOCK_VERSION,
};
use kestrel_script::{
    height_script, is_p2sh, p2sh_sigop_count, push_data, script::script_num, ScriptVerifier,
    VERIFY_P2SH,
};
use kestrel_storage::KeyValueStore;

use crate::handlers::{NodeHandle, NoopSink};
use crate::mempool::Mempool;

pub struct BlockTemplate {
    pub block: Block,
    /// Per-transaction fees; the coinbase slot carries minus the total.
    pub fees: Vec<i64>,
    pub sigops: Vec<usize>,
    pub height: i32,
    pub total_fees: i64,
}

/// Per-candidate record: a pool transaction plus its links into the
/// rest of the candidate set.
struct TxInfo {
    depends_on: HashSet<Hash256>,
    dependents: HashSet<Hash256>,
    priority_base: f64,
    priority_delta: f64,
    fee: i64,
    /// Package fees (child-pays-for-parent summary plus fee delta).
    sum_fees: i64,
    size: usize,
    legacy_sigops: usize,
    invalid: bool,
}

/// Serialized size of a candidate including its not-yet-included
/// ancestry; None when anything in the package is unusable.
fn effective_size(
    infos: &HashMap<Hash256, TxInfo>,
    memo: &mut HashMap<Hash256, u64>,
    txid: &Hash256,
) -> Option<u64> {
    if let Some(cached) = memo.get(txid) {
        return Some(*cached);
    }
    let info = infos.get(txid)?;
    if info.invalid {
        return None;
    }
    let mut total = info.size as u64;
    for dep in &info.depends_on {
        total += effective_size(infos, memo, dep)?;
    }
    memo.insert(*txid, total);
    Some(total)
}

fn effective_sigops(infos: &HashMap<Hash256, TxInfo>, txid: &Hash256) -> usize {
    let Some(info) = infos.get(txid) else { return 0 };
    let mut total = info.legacy_sigops;
    for dep in &info.depends_on {
        total += effective_sigops(infos, dep);
    }
    total
}

/// Sorts ascending so the best candidate pops off the back.
fn sort_queue(queue: &mut Vec<Hash256>, infos: &HashMap<Hash256, TxInfo>, by_fee: bool) {
    let mut scored: Vec<(f64, f64, Hash256)> = queue
        .iter()
        .map(|txid| {
            let mut memo = HashMap::new();
            match effective_size(infos, &mut memo, txid) {
                Some(size) if size > 0 => {
                    let info = &infos[txid];
                    let priority = (info.priority_base + info.priority_delta) / size as f64;
                    let fee_rate = info.sum_fees as f64 / (size as f64 / 1000.0);
                    if by_fee {
                        (fee_rate, priority, *txid)
                    } else {
                        (priority, fee_rate, *txid)
                    }
                }
                _ => (f64::MIN, f64::MIN, *txid),
            }
        })
        .collect();
    scored.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.2.cmp(&b.2))
    });
    *queue = scored.into_iter().map(|(_, _, txid)| txid).collect();
}

fn apply_tx<P: CoinView>(
    view: &mut CoinCache<P>,
    tx: &Transaction,
    height: i32,
) -> Result<(), ValidationError> {
    for input in &tx.vin {
        let mut coins = view
            .coins(&input.prevout.hash)?
            .ok_or_else(|| ValidationError::Error("template input vanished".to_string()))?;
        coins.spend(input.prevout.index);
        view.set_coins(input.prevout.hash, coins);
    }
    view.set_coins(tx.txid(), Coins::from_tx(tx, height));
    Ok(())
}

/// Includes `txid` and, recursively, its unconfirmed ancestry into the
/// scratch view; validates inputs and scripts along the way.
#[allow(clippy::too_many_arguments)]
fn do_inputs<P: CoinView>(
    infos: &HashMap<Hash256, TxInfo>,
    pool: &Mempool,
    view: &mut CoinCache<P>,
    txid: &Hash256,
    added: &mut Vec<Hash256>,
    sigop_counter: &mut usize,
    verifier: &dyn ScriptVerifier,
    height: i32,
) -> Result<bool, ValidationError> {
    if view.have_coins(txid)? {
        // Already part of the template.
        return Ok(true);
    }
    let Some(info) = infos.get(txid) else {
        return Ok(false);
    };
    let Some(entry) = pool.get(txid) else {
        return Ok(false);
    };

    for dep in info.depends_on.clone() {
        if !do_inputs(infos, pool, view, &dep, added, sigop_counter, verifier, height)? {
            return Ok(false);
        }
    }

    if !view.have_inputs(&entry.tx)? {
        return Ok(false);
    }
    for (index, input) in entry.tx.vin.iter().enumerate() {
        let Some(prev_out) = view.get_output(&input.prevout)? else {
            return Ok(false);
        };
        if is_p2sh(&prev_out.script_pubkey) {
            *sigop_counter += p2sh_sigop_count(&prev_out.script_pubkey, &input.script_sig);
        }
        if !verifier.verify(
            &input.script_sig,
            &prev_out.script_pubkey,
            &entry.tx,
            index,
            VERIFY_P2SH,
        ) {
            return Ok(false);
        }
    }

    apply_tx(view, &entry.tx, height)?;
    added.push(*txid);
    Ok(true)
}

/// Assembles a fee-maximizing block template on the current tip.
pub fn create_new_block<S: KeyValueStore>(
    chain: &mut ChainState<S>,
    pool: &Mempool,
    payout_script: Vec<u8>,
    adjusted_time: i64,
) -> Result<BlockTemplate, ValidationError> {
    let prev = chain
        .tip()
        .ok_or_else(|| ValidationError::Error("no chain tip".to_string()))?;
    let prev_hash = chain.index().node(prev).hash;
    let tip_height = chain.index().node(prev).height;
    let height = tip_height + 1;
    let block_time = chain
        .median_time_past(prev)
        .saturating_add(1)
        .max(adjusted_time) as u32;
    let bits = chain.expected_bits(prev, Some(i64::from(block_time)))?;
    let params = chain.params().clone();
    let verifier = chain.verifier();

    let mut coinbase_sig = height_script(height);
    coinbase_sig.push(0x00);
    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: coinbase_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut::new(0, payout_script)],
        lock_time: 0,
    };

    // Build the candidate graph. Priority is the classic value-times-age
    // sum over confirmed inputs; unconfirmed inputs become dependency
    // edges instead.
    let mut infos: HashMap<Hash256, TxInfo> = HashMap::new();
    let mut edges: Vec<(Hash256, Hash256)> = Vec::new();
    for entry in pool.entries() {
        let txid = entry.txid;
        let (priority_delta, fee_delta) = pool.apply_deltas(&txid);
        let mut info = TxInfo {
            depends_on: HashSet::new(),
            dependents: HashSet::new(),
            priority_base: 0.0,
            priority_delta,
            fee: entry.fee,
            sum_fees: entry.sum_tx_fees.saturating_add(fee_delta),
            size: entry.size,
            legacy_sigops: legacy_sigop_count(&entry.tx),
            invalid: false,
        };
        // Finality is judged for the block being built, not the tip.
        if entry.tx.is_coinbase()
            || !is_final_tx(&entry.tx, height, i64::from(block_time))
        {
            info.invalid = true;
            infos.insert(txid, info);
            continue;
        }
        for input in &entry.tx.vin {
            let confirmed = chain
                .coin_view()
                .coins(&input.prevout.hash)
                .map_err(ValidationError::from)?
                .and_then(|coins| {
                    coins
                        .output(input.prevout.index)
                        .map(|out| (out.value, coins.height))
                });
            if let Some((value, coin_height)) = confirmed {
                let confirmations = (tip_height - coin_height + 1).max(0);
                info.priority_base += value as f64 * confirmations as f64;
            } else if pool.contains(&input.prevout.hash) {
                info.depends_on.insert(input.prevout.hash);
                edges.push((txid, input.prevout.hash));
            } else {
                info.invalid = true;
                break;
            }
        }
        infos.insert(txid, info);
    }
    for (child, parent) in edges {
        if let Some(parent_info) = infos.get_mut(&parent) {
            parent_info.dependents.insert(child);
        }
    }

    let mut queue: Vec<Hash256> = infos
        .iter()
        .filter(|(_, info)| !info.invalid)
        .map(|(txid, _)| *txid)
        .collect();
    let mut by_fee = DEFAULT_BLOCK_PRIORITY_SIZE == 0;
    sort_queue(&mut queue, &infos, by_fee);

    // The template view: committed packages only.
    let mut view = CoinCache::new(chain.coin_view());
    let mut selected: Vec<(Transaction, i64, usize)> = Vec::new();
    let mut total_fees = 0i64;
    let mut block_size = 1000usize;
    let mut block_sigops = 100usize;

    while let Some(txid) = queue.pop() {
        let Some(info) = infos.get(&txid) else { continue };
        if info.invalid {
            continue;
        }

        let mut memo = HashMap::new();
        let Some(package_size) = effective_size(&infos, &mut memo, &txid) else {
            continue;
        };
        if block_size + package_size as usize >= DEFAULT_BLOCK_MAX_SIZE {
            continue;
        }
        let package_sigops = effective_sigops(&infos, &txid);
        if block_sigops + package_sigops >= MAX_BLOCK_SIGOPS {
            continue;
        }

        let priority = (info.priority_base + info.priority_delta) / package_size as f64;
        let fee_rate = info.sum_fees as f64 / (package_size as f64 / 1000.0);

        // Free transactions stop once the priority area is spent.
        if by_fee
            && info.priority_delta <= 0.0
            && fee_rate < MIN_RELAY_TX_FEE as f64
            && block_size + package_size as usize >= DEFAULT_BLOCK_MIN_SIZE
        {
            continue;
        }
        if !by_fee
            && (block_size + package_size as usize >= DEFAULT_BLOCK_PRIORITY_SIZE
                || priority < FREE_TX_PRIORITY)
        {
            by_fee = true;
            sort_queue(&mut queue, &infos, by_fee);
        }

        // Second-level scratch: the candidate package connects fully or
        // not at all.
        let mut added = Vec::new();
        let mut package_p2sh_sigops = 0usize;
        let mut scratch = CoinCache::new(&mut view);
        let ok = do_inputs(
            &infos,
            pool,
            &mut scratch,
            &txid,
            &mut added,
            &mut package_p2sh_sigops,
            verifier.as_ref(),
            height,
        )?;
        if !ok {
            continue;
        }
        if block_sigops + package_sigops + package_p2sh_sigops >= MAX_BLOCK_SIGOPS {
            continue;
        }
        scratch
            .flush()
            .map_err(|err| ValidationError::Error(err.to_string()))?;
        drop(scratch);

        block_size += package_size as usize;
        block_sigops += package_sigops + package_p2sh_sigops;

        let mut resort = false;
        for included in &added {
            let entry = pool.get(included).ok_or_else(|| {
                ValidationError::Error("selected transaction left the pool".to_string())
            })?;
            let included_info = infos.get_mut(included).expect("candidate record");
            included_info.invalid = true;
            total_fees = total_fees.saturating_add(included_info.fee);
            selected.push((
                entry.tx.clone(),
                included_info.fee,
                included_info.legacy_sigops,
            ));
            let dependents: Vec<Hash256> =
                infos[included].dependents.iter().copied().collect();
            for dependent in dependents {
                if let Some(dependent_info) = infos.get_mut(&dependent) {
                    dependent_info.depends_on.remove(included);
                    resort = true;
                }
            }
        }
        if resort {
            // Newly unblocked children may rank far better now.
            sort_queue(&mut queue, &infos, by_fee);
        }
    }
    drop(view);

    let mut transactions = vec![coinbase];
    let mut fees = vec![-total_fees];
    let mut sigops = vec![legacy_sigop_count(&transactions[0])];
    for (tx, fee, tx_sigops) in selected {
        transactions.push(tx);
        fees.push(fee);
        sigops.push(tx_sigops);
    }
    transactions[0].vout[0].value = block_value(height, total_fees, &params.consensus);

    let mut block = Block {
        header: BlockHeader {
            version: CURRENT_BLOCK_VERSION,
            prev_block: prev_hash,
            merkle_root: [0u8; 32],
            time: block_time,
            bits,
            nonce: 0,
        },
        transactions,
    };
    block.header.merkle_root = block.merkle_root();

    // A template that fails to connect is a local bug, not peer input.
    let hash = block.hash();
    let mut check_view = CoinCache::new(chain.coin_view());
    connect_block(
        &params,
        verifier.as_ref(),
        &mut check_view,
        &block,
        height,
        &hash,
        true,
        true,
    )
    .map_err(|err| ValidationError::Error(format!("created an invalid block template: {err}")))?;

    println!(
        "CreateNewBlock: {} transactions, {} bytes, {} fees",
        block.transactions.len(),
        block_size,
        total_fees
    );
    Ok(BlockTemplate {
        block,
        fees,
        sigops,
        height,
        total_fees,
    })
}

/// Rewrites the coinbase script with the height and a fresh extra
/// nonce, and recommits the merkle root.
pub fn increment_extra_nonce(block: &mut Block, height: i32, extra_nonce: &mut u32) {
    *extra_nonce = extra_nonce.wrapping_add(1);
    let mut script_sig = height_script(height);
    push_data(&mut script_sig, &script_num(i64::from(*extra_nonce)));
    block.transactions[0].vin[0].script_sig = script_sig;
    block.header.merkle_root = block.merkle_root();
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

/// The mining worker: build a template, scan nonces, submit on success.
/// Checks the interruption flag and tip staleness every 4096 hashes.
pub fn mine_loop<S: KeyValueStore>(
    handle: &NodeHandle<S>,
    payout_script: Vec<u8>,
    interrupt: &AtomicBool,
) {
    let mut extra_nonce = 0u32;
    while !interrupt.load(Ordering::Relaxed) {
        let (template, consensus) = {
            let Ok(mut chain) = handle.chain.lock() else { break };
            let Ok(pool) = handle.mempool.lock() else { break };
            let template = create_new_block(&mut chain, &pool, payout_script.clone(), now_secs());
            (template, chain.params().consensus.clone())
        };
        let mut template = match template {
            Ok(template) => template,
            Err(err) => {
                eprintln!("miner: {err}");
                std::thread::sleep(std::time::Duration::from_secs(1));
                continue;
            }
        };
        increment_extra_nonce(&mut template.block, template.height, &mut extra_nonce);
        let stale_check = template.block.header.prev_block;

        let mut found = false;
        for nonce in 0..=u32::MAX {
            template.block.header.nonce = nonce;
            if check_proof_of_work(&template.block.hash(), template.block.header.bits, &consensus)
                .is_ok()
            {
                found = true;
                break;
            }
            if nonce % 4096 == 0 {
                if interrupt.load(Ordering::Relaxed) {
                    break;
                }
                let tip = handle.chain.lock().ok().and_then(|chain| chain.tip_hash());
                if tip != Some(stale_check) {
                    break;
                }
            }
        }

        if found && !interrupt.load(Ordering::Relaxed) {
            println!(
                "miner: found block {}",
                hash256_to_hex(&template.block.hash())
            );
            if let Err(err) = handle.submit_block(&template.block, 0, &NoopSink, now_secs()) {
                eprintln!("miner: submit failed: {err}");
            }
        }
    }
}
