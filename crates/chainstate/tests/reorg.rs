//! End-to-end chain behavior over a memory store: tip advance, reorgs,
//! invalid branches, orphan resolution, and undo integrity.

use std::path::PathBuf;
use std::sync::Arc;

use kestrel_chainstate::blockindex::{NodeId, STATUS_FAILED_VALID};
use kestrel_chainstate::coinview::CoinView;
use kestrel_chainstate::flatfiles::FlatFileStore;
use kestrel_chainstate::state::{ChainOptions, ChainState};
use kestrel_chainstate::validation::ValidationError;
use kestrel_consensus::{chain_params, Network, COIN};
use kestrel_pow::check_proof_of_work;
use kestrel_primitives::{
    Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut,
};
use kestrel_script::{height_script, ScriptVerifier};
use kestrel_storage::memory::MemoryStore;

/// Far enough in the future that no test block trips the drift check.
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
    dir.push(format!("kestrel-reorg-{tag}-{}", std::process::id()));
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

fn payout_script(tag: u8) -> Vec<u8> {
    // Anyone-can-spend marker scripts keep test transactions small.
    vec![0x51, tag]
}

fn coinbase_tx(height: i32, tag: u8, value: i64) -> Transaction {
    let mut script_sig = height_script(height);
    script_sig.push(tag);
    if script_sig.len() < 2 {
        script_sig.push(0x00);
    }
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut::new(value, payout_script(tag))],
        lock_time: 0,
    }
}

/// Builds and solves a block on `prev` carrying `txs` after the coinbase.
fn mine_block(
    state: &ChainState<MemoryStore>,
    prev: NodeId,
    tag: u8,
    txs: Vec<Transaction>,
    claim_extra: i64,
) -> Block {
    let prev_node = state.index().node(prev);
    let height = prev_node.height + 1;
    let subsidy = 50 * COIN;

    let mut transactions = vec![coinbase_tx(height, tag, subsidy + claim_extra)];
    transactions.extend(txs);

    let time = (state.median_time_past(prev) + 1).max(i64::from(prev_node.header.time) + 1) as u32;
    let bits = state
        .expected_bits(prev, Some(i64::from(time)))
        .expect("expected bits");

    let mut header = BlockHeader {
        version: 2,
        prev_block: prev_node.hash,
        merkle_root: [0u8; 32],
        time,
        bits,
        nonce: 0,
    };
    let block_stub = Block {
        header,
        transactions,
    };
    header.merkle_root = block_stub.merkle_root();

    let params = &state.params().consensus;
    let mut block = Block {
        header,
        transactions: block_stub.transactions,
    };
    while check_proof_of_work(&block.hash(), block.header.bits, params).is_err() {
        block.header.nonce += 1;
    }
    block
}

fn connect_on_tip(state: &mut ChainState<MemoryStore>, tag: u8, txs: Vec<Transaction>) -> Block {
    let tip = state.tip().expect("tip");
    let block = mine_block(state, tip, tag, txs, 0);
    state.process_block(&block, NOW).expect("block connects");
    block
}

/// Grows the active chain by `count` empty blocks.
fn grow_chain(state: &mut ChainState<MemoryStore>, count: u32, tag_base: u8) {
    for i in 0..count {
        connect_on_tip(state, tag_base.wrapping_add((i % 200) as u8), Vec::new());
    }
}

fn spend_of(block: &Block, value: i64, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new(block.transactions[0].txid(), 0),
            script_sig: vec![0x51],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut::new(value, payout_script(tag))],
        lock_time: 0,
    }
}

#[test]
fn simple_tip_advance() {
    let mut state = open_state("advance");
    let genesis = state.tip().expect("genesis");
    let block = mine_block(&state, genesis, 1, Vec::new(), 0);
    let hash = block.hash();

    let outcome = state.process_block(&block, NOW).expect("connects");
    assert!(outcome.request_parent.is_none());
    assert_eq!(outcome.update.connected.len(), 1);
    assert_eq!(outcome.update.connected[0].0, hash);
    assert!(outcome.update.disconnected.is_empty());

    assert_eq!(state.height(), 1);
    assert_eq!(state.tip_hash(), Some(hash));
    assert_eq!(state.coin_view().best_block().expect("best"), Some(hash));
    // The new coinbase is in the coin set.
    assert!(state
        .coin_view()
        .have_coins(&block.transactions[0].txid())
        .expect("coins"));
}

#[test]
fn reaccepting_a_known_block_is_rejected_without_side_effects() {
    let mut state = open_state("duplicate");
    let block = connect_on_tip(&mut state, 1, Vec::new());
    let height = state.height();

    let err = state.process_block(&block, NOW).expect_err("duplicate");
    match err {
        ValidationError::Invalid { reason, dos_score } => {
            assert_eq!(reason, "duplicate");
            assert_eq!(dos_score, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(state.height(), height);
}

#[test]
fn reorg_to_heavier_branch_resurrects_transactions() {
    let mut state = open_state("reorg");
    // Mature a coinbase so a real spend can ride the losing branch.
    grow_chain(&mut state, 101, 10);
    let funding = state.read_block(state.chain().at(1).expect("block 1")).expect("read");
    let fork_base = state.tip().expect("tip");

    let spend = spend_of(&funding, 49 * COIN, 77);
    let spend_txid = spend.txid();

    // Losing branch: one block containing the spend.
    let a1 = mine_block(&state, fork_base, 101, vec![spend.clone()], 0);
    state.process_block(&a1, NOW).expect("a1 connects");
    assert_eq!(state.tip_hash(), Some(a1.hash()));
    assert!(!state
        .coin_view()
        .have_coins(&funding.transactions[0].txid())
        .expect("spent on a-branch"));

    // Heavier branch: two empty blocks from the fork base.
    let b1 = mine_block(&state, fork_base, 102, Vec::new(), 0);
    state.process_block(&b1, NOW).expect("b1 indexed");
    // Equal work, later arrival: no reorg yet.
    assert_eq!(state.tip_hash(), Some(a1.hash()));

    let b1_id = state.index().lookup(&b1.hash()).expect("indexed");
    let b2 = mine_block(&state, b1_id, 103, Vec::new(), 0);
    let outcome = state.process_block(&b2, NOW).expect("reorg");

    // Notification order: disconnect(a1), connect(b1), connect(b2).
    assert_eq!(outcome.update.disconnected.len(), 1);
    assert_eq!(outcome.update.disconnected[0].0, a1.hash());
    let connected: Vec<_> = outcome.update.connected.iter().map(|(h, _)| *h).collect();
    assert_eq!(connected, vec![b1.hash(), b2.hash()]);

    // The non-coinbase transaction of the losing branch is re-offered.
    let resurrected: Vec<_> = outcome.update.resurrect.iter().map(|tx| tx.txid()).collect();
    assert_eq!(resurrected, vec![spend_txid]);

    // Its input is unspent again after the reorg.
    assert!(state
        .coin_view()
        .have_coins(&funding.transactions[0].txid())
        .expect("restored"));
    assert!(!state.coin_view().have_coins(&spend_txid).expect("gone"));
    assert_eq!(state.tip_hash(), Some(b2.hash()));
}

#[test]
fn overclaiming_coinbase_marks_branch_invalid_and_alternate_connects() {
    let mut state = open_state("invalid");
    let tip = state.tip().expect("tip");

    let bad = mine_block(&state, tip, 1, Vec::new(), 1);
    let err = state.process_block(&bad, NOW).expect_err("over-claim");
    assert_eq!(err.dos_score(), 100);

    // The block is indexed, marked failed, and the tip did not move.
    let bad_id = state.index().lookup(&bad.hash()).expect("indexed");
    assert!(state.index().node(bad_id).has_status(STATUS_FAILED_VALID));
    assert_eq!(state.tip(), Some(tip));

    // A valid alternate at the same height connects.
    let good = mine_block(&state, tip, 2, Vec::new(), 0);
    state.process_block(&good, NOW).expect("alternate connects");
    assert_eq!(state.tip_hash(), Some(good.hash()));
}

#[test]
fn orphan_block_waits_for_its_parent() {
    let mut state = open_state("orphan");
    let genesis = state.tip().expect("genesis");

    let b1 = mine_block(&state, genesis, 1, Vec::new(), 0);
    // Mine b2 on b1 without telling the chain state about b1 yet: build
    // against a clone of the state that has b1.
    let mut staging = open_state("orphan-staging");
    staging.process_block(&b1, NOW).expect("staging b1");
    let b1_id = staging.index().lookup(&b1.hash()).expect("staged");
    let b2 = mine_block(&staging, b1_id, 2, Vec::new(), 0);

    // Child first: stored as orphan, parent requested.
    let outcome = state.process_block(&b2, NOW).expect("orphaned");
    assert!(outcome.update.is_empty());
    assert_eq!(outcome.request_parent, Some(b1.hash()));
    assert_eq!(state.orphan_count(), 1);
    assert_eq!(state.height(), 0);

    // Parent arrives: both connect, tip lands on the child.
    let outcome = state.process_block(&b1, NOW).expect("parent connects");
    let connected: Vec<_> = outcome.update.connected.iter().map(|(h, _)| *h).collect();
    assert_eq!(connected, vec![b1.hash(), b2.hash()]);
    assert_eq!(state.tip_hash(), Some(b2.hash()));
    assert_eq!(state.orphan_count(), 0);
}

#[test]
fn connect_then_disconnect_restores_coin_state() {
    let mut state = open_state("undo-roundtrip");
    grow_chain(&mut state, 101, 30);
    let funding = state.read_block(state.chain().at(1).expect("block 1")).expect("read");
    let spend = spend_of(&funding, 48 * COIN, 99);
    connect_on_tip(&mut state, 120, vec![spend]);

    // Levels 1-4: re-check, read undo, disconnect on a scratch view,
    // and reconnect; any divergence from the undo data fails.
    state.verify_chain(4, 50).expect("verify chain");
}
