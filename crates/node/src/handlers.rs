//! Entry points for decoded wire messages.
//!
//! The p2p layer hands decoded blocks, transactions, and inventory
//! requests to these handlers and receives misbehavior scores back
//! through the sink. Everything here runs under the chain mutex; the
//! pool mutex nests inside it on write paths.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use kestrel_chainstate::notify::Listeners;
use kestrel_chainstate::state::ChainState;
use kestrel_chainstate::validation::ValidationError;
use kestrel_consensus::Hash256;
use kestrel_primitives::{hash256_to_hex, Block, BlockHeader, Transaction};
use kestrel_storage::KeyValueStore;

use crate::mempool::{Mempool, MempoolErrorKind};

pub type PeerId = u64;

/// Maximum inventory entries a getblocks answer carries.
const MAX_GETBLOCKS_RESULTS: usize = 500;
/// Maximum headers a getheaders answer carries.
const MAX_GETHEADERS_RESULTS: usize = 2000;

/// Where misbehavior scores for peer-attributable failures go.
pub trait MisbehaviorSink: Send + Sync {
    fn misbehave(&self, peer: PeerId, score: u32);
}

/// Sink for contexts without a peer, like the local miner.
pub struct NoopSink;

impl MisbehaviorSink for NoopSink {
    fn misbehave(&self, _peer: PeerId, _score: u32) {}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InvKind {
    Tx,
    Block,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub enum InvResponse {
    Block(Box<Block>),
    Tx(Transaction),
    NotFound(InvItem),
}

#[derive(Debug)]
pub enum BlockSubmission {
    Accepted,
    /// Stored as an orphan; request the missing ancestry with this
    /// hash and our locator.
    Orphaned {
        request: Hash256,
        locator: Vec<Hash256>,
    },
    Rejected(String),
}

#[derive(Debug)]
pub enum TxSubmission {
    /// Accepted, along with any orphans that became valid with it.
    Accepted(Vec<Hash256>),
    Orphaned,
    Rejected(String),
}

/// The shared node services the message loop operates on.
pub struct NodeHandle<S> {
    pub chain: Arc<Mutex<ChainState<S>>>,
    pub mempool: Arc<Mutex<Mempool>>,
    pub listeners: Listeners,
}

impl<S: KeyValueStore> NodeHandle<S> {
    pub fn new(
        chain: Arc<Mutex<ChainState<S>>>,
        mempool: Arc<Mutex<Mempool>>,
        listeners: Listeners,
    ) -> Self {
        Self {
            chain,
            mempool,
            listeners,
        }
    }

    /// A decoded block from the network (or the miner).
    pub fn submit_block(
        &self,
        block: &Block,
        peer: PeerId,
        sink: &dyn MisbehaviorSink,
        adjusted_time: i64,
    ) -> Result<BlockSubmission, String> {
        let mut chain = self.chain.lock().map_err(|_| "chain lock poisoned")?;
        let outcome = match chain.process_block(block, adjusted_time) {
            Ok(outcome) => outcome,
            Err(err) => {
                let score = err.dos_score();
                if score > 0 {
                    sink.misbehave(peer, score);
                }
                let message = err.to_string();
                return match err {
                    ValidationError::Invalid { .. } | ValidationError::Orphan => {
                        Ok(BlockSubmission::Rejected(message))
                    }
                    _ => Err(message),
                };
            }
        };

        if let Some(request) = outcome.request_parent {
            return Ok(BlockSubmission::Orphaned {
                request,
                locator: chain.locator(),
            });
        }
        let update = outcome.update;
        if update.is_empty() {
            return Ok(BlockSubmission::Accepted);
        }

        // Pool maintenance: resurrect the losing branch, drop whatever
        // the winning branch confirmed or conflicted with, then repair
        // the priority summaries in one pass.
        {
            let mut pool = self.mempool.lock().map_err(|_| "mempool lock poisoned")?;
            let mut changed: HashSet<Hash256> = HashSet::new();
            for tx in &update.resurrect {
                let txid = tx.txid();
                changed.insert(txid);
                // Validation errors are expected here and ignored.
                let _ = pool.accept(&mut chain, tx.clone(), false, adjusted_time);
            }
            for (_, connected_block) in &update.connected {
                for tx in &connected_block.transactions {
                    let txid = tx.txid();
                    changed.insert(txid);
                    pool.remove(&txid, false);
                    for conflicted in pool.remove_conflicts(tx) {
                        changed.insert(conflicted);
                        self.listeners.double_spend_detected(&conflicted, &txid);
                    }
                }
            }
            pool.update_priorities(&changed);
        }

        // Listeners observe disconnects tip-first, then connects in
        // ascending height, then the final tip.
        for (hash, disconnected_block) in &update.disconnected {
            self.listeners.block_disconnected(hash, disconnected_block);
        }
        for (hash, connected_block) in &update.connected {
            self.listeners.block_connected(hash, connected_block);
        }
        if let Some((hash, block_height)) = update.tip {
            self.listeners.tip_changed(&hash, block_height);
        }
        Ok(BlockSubmission::Accepted)
    }

    /// A decoded transaction from the network.
    pub fn submit_tx(
        &self,
        tx: Transaction,
        peer: PeerId,
        sink: &dyn MisbehaviorSink,
        now: i64,
    ) -> Result<TxSubmission, String> {
        let mut chain = self.chain.lock().map_err(|_| "chain lock poisoned")?;
        let mut pool = self.mempool.lock().map_err(|_| "mempool lock poisoned")?;

        let accepted = match pool.accept(&mut chain, tx.clone(), true, now) {
            Ok(accepted) => accepted,
            Err(err) if err.kind == MempoolErrorKind::MissingInputs => {
                pool.add_orphan(tx);
                return Ok(TxSubmission::Orphaned);
            }
            Err(err) => {
                if err.dos_score > 0 {
                    sink.misbehave(peer, err.dos_score);
                }
                return Ok(TxSubmission::Rejected(err.message));
            }
        };
        self.listeners.transaction_accepted(&accepted.txid, &tx);
        println!(
            "mempool: accepted {} (poolsz {})",
            hash256_to_hex(&accepted.txid),
            pool.len()
        );

        // Drain orphans that were waiting on this transaction, and on
        // anything they in turn unblock.
        let mut newly_accepted = vec![accepted.txid];
        let mut frontier = vec![accepted.txid];
        while let Some(parent) = frontier.pop() {
            for orphan in pool.take_orphan_dependents(&parent) {
                let orphan_txid = orphan.txid();
                match pool.accept(&mut chain, orphan.clone(), true, now) {
                    Ok(_) => {
                        self.listeners.transaction_accepted(&orphan_txid, &orphan);
                        newly_accepted.push(orphan_txid);
                        frontier.push(orphan_txid);
                    }
                    Err(err) if err.kind == MempoolErrorKind::MissingInputs => {
                        // Still waiting on another parent.
                        pool.add_orphan(orphan);
                    }
                    Err(_) => {}
                }
            }
        }
        Ok(TxSubmission::Accepted(newly_accepted))
    }

    /// Inventory of up to 500 block hashes after the locator fork.
    pub fn get_blocks(
        &self,
        locator: &[Hash256],
        stop: Option<Hash256>,
    ) -> Result<Vec<Hash256>, String> {
        let chain = self.chain.lock().map_err(|_| "chain lock poisoned")?;
        let mut out = Vec::new();
        let mut cursor = chain
            .chain()
            .find_fork(chain.index(), locator)
            .and_then(|fork| chain.chain().next(chain.index(), fork));
        while let Some(id) = cursor {
            let hash = chain.index().node(id).hash;
            out.push(hash);
            if Some(hash) == stop || out.len() >= MAX_GETBLOCKS_RESULTS {
                break;
            }
            cursor = chain.chain().next(chain.index(), id);
        }
        Ok(out)
    }

    /// Same walk with full headers, up to 2000.
    pub fn get_headers(
        &self,
        locator: &[Hash256],
        stop: Option<Hash256>,
    ) -> Result<Vec<BlockHeader>, String> {
        let chain = self.chain.lock().map_err(|_| "chain lock poisoned")?;
        // An empty locator asks for one specific header.
        if locator.is_empty() {
            if let Some(hash) = stop {
                if let Some(id) = chain.index().lookup(&hash) {
                    return Ok(vec![chain.index().node(id).header]);
                }
            }
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut cursor = chain
            .chain()
            .find_fork(chain.index(), locator)
            .and_then(|fork| chain.chain().next(chain.index(), fork));
        while let Some(id) = cursor {
            let node = chain.index().node(id);
            out.push(node.header);
            if Some(node.hash) == stop || out.len() >= MAX_GETHEADERS_RESULTS {
                break;
            }
            cursor = chain.chain().next(chain.index(), id);
        }
        Ok(out)
    }

    /// Serves a getdata inventory from disk, the pool, and the optional
    /// transaction index.
    pub fn get_data(&self, items: &[InvItem]) -> Result<Vec<InvResponse>, String> {
        let chain = self.chain.lock().map_err(|_| "chain lock poisoned")?;
        let pool = self.mempool.lock().map_err(|_| "mempool lock poisoned")?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let response = match item.kind {
                InvKind::Block => match chain.block_by_hash(&item.hash) {
                    Ok(Some(block)) => InvResponse::Block(Box::new(block)),
                    Ok(None) => InvResponse::NotFound(*item),
                    Err(err) => return Err(err.to_string()),
                },
                InvKind::Tx => {
                    if let Some(entry) = pool.get(&item.hash) {
                        InvResponse::Tx(entry.tx.clone())
                    } else {
                        match chain.indexed_transaction(&item.hash) {
                            Ok(Some(tx)) => InvResponse::Tx(tx),
                            Ok(None) => InvResponse::NotFound(*item),
                            Err(err) => return Err(err.to_string()),
                        }
                    }
                }
            };
            out.push(response);
        }
        Ok(out)
    }
}
