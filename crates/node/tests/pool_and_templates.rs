//! Pool admission and block template behavior against a mined regtest
//! chain.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use kestrel_chainstate::blockindex::NodeId;
use kestrel_chainstate::flatfiles::FlatFileStore;
use kestrel_chainstate::notify::Listeners;
use kestrel_chainstate::state::{ChainOptions, ChainState};
use kestrel_consensus::{chain_params, Network, COIN};
use kestrel_node::handlers::{
    InvItem, InvKind, InvResponse, NodeHandle, NoopSink, TxSubmission,
};
use kestrel_node::mempool::{Mempool, MempoolErrorKind};
use kestrel_node::miner::create_new_block;
use kestrel_pow::check_proof_of_work;
use kestrel_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use kestrel_script::{height_script, ScriptVerifier};
use kestrel_storage::memory::MemoryStore;

const NOW: i64 = 2_000_000_000;

struct AcceptAll;

impl ScriptVerifier for AcceptAll {
    fn verify(
        &self,
        _script_sig: &[u8],
        _script_pubkey: &[u8],
        _tx: &Transaction,
        _input_index: usize,
        _flags: u32,
    ) -> bool {
        true
    }
}

fn temp_dir(tag: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!("kestrel-pool-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn open_state(tag: &str) -> ChainState<MemoryStore> {
    let dir = temp_dir(tag);
    let blocks = FlatFileStore::open(dir.join("blocks"), "blk", [0xfa, 0xce, 0xb0, 0x0c], 1 << 21)
        .expect("open block files");
    let undo = FlatFileStore::open(dir.join("blocks"), "rev", [0xfa, 0xce, 0xb0, 0x0c], 1 << 21)
        .expect("open undo files");
    ChainState::open(
        Arc::new(MemoryStore::new()),
        chain_params(Network::Regtest),
        Arc::new(AcceptAll),
        blocks,
        undo,
        ChainOptions::default(),
    )
    .expect("open chain state")
}

fn coinbase_tx(height: i32, tag: u8) -> Transaction {
    let mut script_sig = height_script(height);
    script_sig.push(tag);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut::new(50 * COIN, vec![0x51, tag])],
        lock_time: 0,
    }
}

fn mine_block(state: &ChainState<MemoryStore>, prev: NodeId, tag: u8) -> Block {
    let prev_node = state.index().node(prev);
    let height = prev_node.height + 1;
    let time =
        (state.median_time_past(prev) + 1).max(i64::from(prev_node.header.time) + 1) as u32;
    let bits = state
        .expected_bits(prev, Some(i64::from(time)))
        .expect("expected bits");

    let transactions = vec![coinbase_tx(height, tag)];
    let mut header = BlockHeader {
        version: 2,
        prev_block: prev_node.hash,
        merkle_root: [0u8; 32],
        time,
        bits,
        nonce: 0,
    };
    let stub = Block {
        header,
        transactions,
    };
    header.merkle_root = stub.merkle_root();
    let mut block = Block {
        header,
        transactions: stub.transactions,
    };
    let params = &state.params().consensus;
    while check_proof_of_work(&block.hash(), block.header.bits, params).is_err() {
        block.header.nonce += 1;
    }
    block
}

/// Mines `count` blocks and returns the coinbase of the first mined
/// block, matured and spendable by the end.
fn funded_chain(state: &mut ChainState<MemoryStore>, count: u32) -> Transaction {
    let mut funding = None;
    for i in 0..count {
        let tip = state.tip().expect("tip");
        let block = mine_block(state, tip, (i % 250) as u8);
        if funding.is_none() {
            funding = Some(block.transactions[0].clone());
        }
        state.process_block(&block, NOW).expect("block connects");
    }
    funding.expect("at least one block")
}

fn spend(prevout: OutPoint, value: i64, sequence: u32, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: vec![0x51],
            sequence,
        }],
        vout: vec![TxOut::new(value, vec![0x51, tag])],
        lock_time: 0,
    }
}

#[test]
fn double_spend_of_a_pooled_input_is_rejected() {
    let mut state = open_state("double-spend");
    let funding = funded_chain(&mut state, 101);
    let prevout = OutPoint::new(funding.txid(), 0);
    let mut pool = Mempool::default();

    let t1 = spend(prevout, 49 * COIN, u32::MAX, 1);
    pool.accept(&mut state, t1.clone(), true, NOW).expect("t1");
    assert_eq!(pool.len(), 1);

    // The competing spend loses: the pooled transaction is final, so
    // even the permissive replacement path refuses it.
    let t2 = spend(prevout, 48 * COIN, u32::MAX, 2);
    let err = pool.accept(&mut state, t2, true, NOW).expect_err("conflict");
    assert_eq!(err.kind, MempoolErrorKind::Conflict);
    assert_eq!(pool.len(), 1);
    assert!(pool.contains(&t1.txid()));
}

#[test]
fn sequence_replacement_updates_a_non_final_transaction() {
    let mut state = open_state("replacement");
    let funding = funded_chain(&mut state, 101);
    let prevout = OutPoint::new(funding.txid(), 0);
    let mut pool = Mempool::default();

    let mut old = spend(prevout, 49 * COIN, 5, 1);
    old.lock_time = 5_000; // far future height: non-final
    let old_txid = old.txid();
    pool.accept(&mut state, old.clone(), true, NOW).expect("old");

    let mut replacement = spend(prevout, 49 * COIN, 6, 2);
    replacement.lock_time = 5_000;
    let accepted = pool
        .accept(&mut state, replacement.clone(), true, NOW)
        .expect("replacement");
    assert_eq!(accepted.replaced, Some(old_txid));
    assert_eq!(pool.len(), 1);
    assert!(pool.contains(&replacement.txid()));
    assert!(!pool.contains(&old_txid));

    // A lower sequence does not replace.
    let worse = spend(prevout, 49 * COIN, 4, 3);
    let err = pool.accept(&mut state, worse, true, NOW).expect_err("worse");
    assert_eq!(err.kind, MempoolErrorKind::Conflict);
}

#[test]
fn accepting_twice_is_rejected_without_state_change() {
    let mut state = open_state("idempotent");
    let funding = funded_chain(&mut state, 101);
    let tx = spend(OutPoint::new(funding.txid(), 0), 49 * COIN, u32::MAX, 1);
    let mut pool = Mempool::default();

    pool.accept(&mut state, tx.clone(), true, NOW).expect("first");
    let updates = pool.updates();
    let err = pool.accept(&mut state, tx, true, NOW).expect_err("second");
    assert_eq!(err.kind, MempoolErrorKind::AlreadyInPool);
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.updates(), updates);
}

#[test]
fn template_treats_low_fee_parent_and_high_fee_child_as_a_package() {
    let mut state = open_state("cpfp-template");
    let funding = funded_chain(&mut state, 101);
    let mut pool = Mempool::default();

    // Parent pays almost nothing; its child pays generously.
    let parent = spend(OutPoint::new(funding.txid(), 0), 50 * COIN - 100, u32::MAX, 1);
    let parent_txid = parent.txid();
    let child = spend(OutPoint::new(parent_txid, 0), 50 * COIN - 10_100, u32::MAX, 2);
    let child_txid = child.txid();
    pool.accept(&mut state, parent, true, NOW).expect("parent");
    pool.accept(&mut state, child, true, NOW).expect("child");
    assert_eq!(pool.get(&child_txid).expect("entry").sum_tx_fees, 10_100);

    let template =
        create_new_block(&mut state, &pool, vec![0x51], NOW).expect("template builds");
    let order: Vec<_> = template
        .block
        .transactions
        .iter()
        .map(|tx| tx.txid())
        .collect();
    let parent_at = order
        .iter()
        .position(|txid| *txid == parent_txid)
        .expect("parent included");
    let child_at = order
        .iter()
        .position(|txid| *txid == child_txid)
        .expect("child included");
    assert!(parent_at < child_at);
    assert!(parent_at >= 1, "coinbase stays first");

    // The coinbase claims subsidy plus both fees.
    assert_eq!(template.total_fees, 10_100);
    assert_eq!(
        template.block.transactions[0].value_out().expect("value"),
        50 * COIN + 10_100
    );
    assert_eq!(template.fees[0], -10_100);
}

#[test]
fn submitted_template_block_connects_and_clears_the_pool() {
    let mut state = open_state("template-connect");
    let funding = funded_chain(&mut state, 101);
    let mut pool = Mempool::default();
    let tx = spend(OutPoint::new(funding.txid(), 0), 49 * COIN, u32::MAX, 1);
    let txid = tx.txid();
    pool.accept(&mut state, tx, true, NOW).expect("accept");

    let mut template =
        create_new_block(&mut state, &pool, vec![0x51], NOW).expect("template builds");
    let params = state.params().consensus.clone();
    while check_proof_of_work(&template.block.hash(), template.block.header.bits, &params)
        .is_err()
    {
        template.block.header.nonce += 1;
    }

    let chain = Arc::new(Mutex::new(state));
    let pool = Arc::new(Mutex::new(pool));
    let handle = NodeHandle::new(Arc::clone(&chain), Arc::clone(&pool), Listeners::new());
    handle
        .submit_block(&template.block, 0, &NoopSink, NOW)
        .expect("submit");

    assert!(!pool.lock().unwrap().contains(&txid));
    assert_eq!(
        chain.lock().unwrap().tip_hash(),
        Some(template.block.hash())
    );
}

#[test]
fn orphan_transactions_drain_when_their_parent_arrives() {
    let mut state = open_state("orphan-tx");
    let funding = funded_chain(&mut state, 101);
    let parent = spend(OutPoint::new(funding.txid(), 0), 49 * COIN, u32::MAX, 1);
    let parent_txid = parent.txid();
    let child = spend(OutPoint::new(parent_txid, 0), 48 * COIN, u32::MAX, 2);
    let child_txid = child.txid();

    let chain = Arc::new(Mutex::new(state));
    let pool = Arc::new(Mutex::new(Mempool::default()));
    let handle = NodeHandle::new(Arc::clone(&chain), Arc::clone(&pool), Listeners::new());

    // Child first: parked as an orphan.
    let outcome = handle.submit_tx(child, 7, &NoopSink, NOW).expect("submit");
    assert!(matches!(outcome, TxSubmission::Orphaned));
    assert_eq!(pool.lock().unwrap().len(), 0);
    assert_eq!(pool.lock().unwrap().orphan_count(), 1);

    // Parent arrives: both land in the pool.
    let outcome = handle.submit_tx(parent, 7, &NoopSink, NOW).expect("submit");
    match outcome {
        TxSubmission::Accepted(txids) => {
            assert_eq!(txids, vec![parent_txid, child_txid]);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let pool = pool.lock().unwrap();
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.orphan_count(), 0);
    assert_eq!(pool.get(&child_txid).expect("child").depth, 2);
}

#[test]
fn inventory_handlers_serve_the_active_chain() {
    let mut state = open_state("inventory");
    funded_chain(&mut state, 3);
    let genesis_hash = state.params().consensus.hash_genesis_block;
    let tip_hash = state.tip_hash().expect("tip");
    let heights: Vec<_> = (1..=3)
        .map(|height| {
            let id = state.chain().at(height).expect("on chain");
            state.index().node(id).hash
        })
        .collect();

    let chain = Arc::new(Mutex::new(state));
    let pool = Arc::new(Mutex::new(Mempool::default()));
    let handle = NodeHandle::new(Arc::clone(&chain), Arc::clone(&pool), Listeners::new());

    // getblocks from genesis returns everything above it.
    let inventory = handle.get_blocks(&[genesis_hash], None).expect("inv");
    assert_eq!(inventory, heights);

    let headers = handle.get_headers(&[genesis_hash], None).expect("headers");
    assert_eq!(headers.len(), 3);
    assert_eq!(headers[2].hash(), tip_hash);

    let responses = handle
        .get_data(&[
            InvItem {
                kind: InvKind::Block,
                hash: heights[0],
            },
            InvItem {
                kind: InvKind::Block,
                hash: [0xee; 32],
            },
        ])
        .expect("getdata");
    assert!(matches!(&responses[0], InvResponse::Block(block) if block.hash() == heights[0]));
    assert!(matches!(responses[1], InvResponse::NotFound(_)));
}
