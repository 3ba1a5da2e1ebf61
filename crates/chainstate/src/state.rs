//! The chain state: block index, active chain, and coin view, with the
//! accept/connect/disconnect/reorganize machinery that keeps them
//! consistent with each other and with disk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kestrel_consensus::constants::{
    COINBASE_MATURITY, DEFAULT_COIN_CACHE_SIZE, MAX_BLOCK_SIGOPS, P2SH_SWITCH_TIME,
};
use kestrel_consensus::{block_value, money_range, ChainParams, Hash256};
use kestrel_pow::difficulty::{block_proof, get_next_work_required};
use kestrel_primitives::encoding::{Decoder, Encoder};
use kestrel_primitives::{hash256_to_hex, Block, Transaction};
use kestrel_script::{height_script, is_p2sh, p2sh_sigop_count, ScriptVerifier, VERIFY_NOCACHE, VERIFY_P2SH};
use kestrel_storage::{Column, KeyValueStore, WriteBatch};

use crate::blockindex::{
    BlockIndex, BlockIndexNode, NodeId, STATUS_HAVE_DATA, STATUS_HAVE_UNDO,
    STATUS_VALID_SCRIPTS, STATUS_VALID_TRANSACTIONS,
};
use crate::chain::ActiveChain;
use crate::checkqueue::{CheckQueue, ScriptCheck};
use crate::coins::Coins;
use crate::coinview::{CoinCache, CoinView, StoreCoins};
use crate::flatfiles::{FileLocation, FlatFileStore};
use crate::genesis::build_genesis_block;
use crate::orphans::OrphanBlocks;
use crate::txindex::{TxIndex, TxLocation};
use crate::undo::{BlockUndo, TxInUndo, TxUndo};
use crate::validation::{check_block, is_final_tx, legacy_sigop_count, ValidationError};
use crate::warnings::Warnings;

const META_REINDEX_KEY: &[u8] = b"reindex";
const META_TXINDEX_KEY: &[u8] = b"tx_index";
const FILE_KIND_BLOCKS: u8 = b'b';
const FILE_KIND_UNDO: u8 = b'u';

/// The tip coin cache stacked on the persistent store.
pub type TipCoins<S> = CoinCache<StoreCoins<Arc<S>>>;

#[derive(Clone, Debug)]
pub struct ChainOptions {
    /// Master switch for script verification during connect.
    pub check_scripts: bool,
    /// Maintain the optional transaction index.
    pub txindex: bool,
    /// Flush the coin cache once it holds this many records.
    pub coin_cache_target: usize,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            check_scripts: true,
            txindex: false,
            coin_cache_target: DEFAULT_COIN_CACHE_SIZE,
        }
    }
}

/// What a tip change did, in notification order.
#[derive(Debug, Default)]
pub struct ChainUpdate {
    /// Disconnected blocks, tip first.
    pub disconnected: Vec<(Hash256, Block)>,
    /// Connected blocks, ascending height.
    pub connected: Vec<(Hash256, Block)>,
    /// Transactions to re-offer to the pool, from disconnected blocks.
    pub resurrect: Vec<Transaction>,
    pub tip: Option<(Hash256, i32)>,
}

impl ChainUpdate {
    pub fn is_empty(&self) -> bool {
        self.disconnected.is_empty() && self.connected.is_empty()
    }

    pub fn merge(&mut self, other: ChainUpdate) {
        self.disconnected.extend(other.disconnected);
        self.connected.extend(other.connected);
        self.resurrect.extend(other.resurrect);
        if other.tip.is_some() {
            self.tip = other.tip;
        }
    }
}

#[derive(Debug, Default)]
pub struct ProcessOutcome {
    pub update: ChainUpdate,
    /// Set when the block went into the orphan pool: the ancestor hash
    /// worth requesting from the sending peer.
    pub request_parent: Option<Hash256>,
}

pub struct ChainState<S> {
    store: Arc<S>,
    params: ChainParams,
    verifier: Arc<dyn ScriptVerifier>,
    options: ChainOptions,
    index: BlockIndex,
    chain: ActiveChain,
    coins: TipCoins<S>,
    blocks: FlatFileStore,
    undo: FlatFileStore,
    orphans: OrphanBlocks,
    warnings: Warnings,
    interrupt: Arc<AtomicBool>,
}

impl<S: KeyValueStore> ChainState<S> {
    /// Opens (or initializes) the chain state over a store and the two
    /// flat-file stores. Writes genesis on first start.
    pub fn open(
        store: Arc<S>,
        params: ChainParams,
        verifier: Arc<dyn ScriptVerifier>,
        blocks: FlatFileStore,
        undo: FlatFileStore,
        options: ChainOptions,
    ) -> Result<Self, ValidationError> {
        let mut records = Vec::new();
        for (_, bytes) in store.scan_prefix(Column::BlockIndex, &[])? {
            let record = BlockIndexNode::decode(&bytes)
                .map_err(|err| ValidationError::Error(format!("corrupt block index: {err}")))?;
            records.push(record);
        }
        let index = BlockIndex::from_records(records);
        let coins = CoinCache::new(StoreCoins::new(Arc::clone(&store)));

        let mut state = Self {
            store,
            params,
            verifier,
            options,
            index,
            chain: ActiveChain::new(),
            coins,
            blocks,
            undo,
            orphans: OrphanBlocks::new(),
            warnings: Warnings::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
        };

        if state.index.is_empty() {
            state.init_genesis()?;
        }

        match state.coins.best_block()? {
            Some(best) => {
                let tip = state
                    .index
                    .lookup(&best)
                    .ok_or_else(|| ValidationError::Error("best block not indexed".to_string()))?;
                state.chain.set_tip(&state.index, tip);
            }
            None => {
                return Err(ValidationError::Error(
                    "coin database has no best block".to_string(),
                ))
            }
        }

        if state.options.txindex {
            state
                .store
                .put(Column::Meta, META_TXINDEX_KEY, &[1])
                .map_err(ValidationError::from)?;
        }

        Ok(state)
    }

    fn init_genesis(&mut self) -> Result<(), ValidationError> {
        let genesis = build_genesis_block(&self.params)?;
        let hash = genesis.hash();
        let pos = self.write_block_file(&genesis)?;

        let work = block_proof(genesis.header.bits)
            .map_err(|err| ValidationError::Error(err.to_string()))?;
        let id = self.index.insert(genesis.header, work);
        {
            let node = self.index.node_mut(id);
            node.data_pos = Some(pos);
            node.tx_count = 1;
            node.chain_tx_count = 1;
            node.status |=
                STATUS_VALID_TRANSACTIONS | STATUS_VALID_SCRIPTS | STATUS_HAVE_DATA;
        }
        self.index.add_candidate(id);
        self.persist_nodes(&[id])?;

        // The genesis coinbase never enters the coin set; only the best
        // block marker moves.
        self.coins.set_best_block(hash);
        self.coins
            .flush()
            .map_err(|err| ValidationError::Abort(err.to_string()))?;
        self.chain.set_tip(&self.index, id);
        println!("Initialized {} chain at genesis", self.params.network.as_str());
        Ok(())
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn chain(&self) -> &ActiveChain {
        &self.chain
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.chain.tip()
    }

    pub fn tip_hash(&self) -> Option<Hash256> {
        self.tip().map(|id| self.index.node(id).hash)
    }

    pub fn height(&self) -> i32 {
        self.chain.height()
    }

    pub fn verifier(&self) -> Arc<dyn ScriptVerifier> {
        Arc::clone(&self.verifier)
    }

    pub fn warnings(&self) -> &Warnings {
        &self.warnings
    }

    pub fn warnings_mut(&mut self) -> &mut Warnings {
        &mut self.warnings
    }

    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn coin_view(&mut self) -> &mut TipCoins<S> {
        &mut self.coins
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Bits the next block extending `prev` must carry.
    pub fn expected_bits(
        &self,
        prev: NodeId,
        next_block_time: Option<i64>,
    ) -> Result<u32, ValidationError> {
        let window_len = self.params.consensus.difficulty_adjustment_interval() as usize;
        let window = self.index.header_window(prev, window_len);
        get_next_work_required(&window, next_block_time, &self.params.consensus)
            .map_err(|err| ValidationError::Error(format!("retarget failed: {err}")))
    }

    pub fn median_time_past(&self, id: NodeId) -> i64 {
        self.index.median_time_past(id)
    }

    pub fn read_block(&self, id: NodeId) -> Result<Block, ValidationError> {
        let node = self.index.node(id);
        let pos = node
            .data_pos
            .ok_or_else(|| ValidationError::Error("block data not on disk".to_string()))?;
        let payload = self.blocks.read(pos)?;
        Block::consensus_decode(&payload)
            .map_err(|err| ValidationError::Error(format!("corrupt block data: {err}")))
    }

    pub fn block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, ValidationError> {
        match self.index.lookup(hash) {
            Some(id) if self.index.node(id).has_status(STATUS_HAVE_DATA) => {
                Ok(Some(self.read_block(id)?))
            }
            _ => Ok(None),
        }
    }

    /// Confirmed transaction lookup through the optional tx index.
    pub fn indexed_transaction(
        &self,
        txid: &Hash256,
    ) -> Result<Option<Transaction>, ValidationError> {
        if !self.options.txindex {
            return Ok(None);
        }
        let txindex = TxIndex::new(Arc::clone(&self.store));
        let Some(location) = txindex.get(txid)? else {
            return Ok(None);
        };
        let payload = self.blocks.read(location.block)?;
        let offset = location.tx_offset as usize;
        if offset >= payload.len() {
            return Err(ValidationError::Error("tx index out of bounds".to_string()));
        }
        let mut decoder = Decoder::new(&payload[offset..]);
        let tx = Transaction::decode_from(&mut decoder)
            .map_err(|err| ValidationError::Error(format!("corrupt indexed tx: {err}")))?;
        Ok(Some(tx))
    }

    pub fn locator(&self) -> Vec<Hash256> {
        self.chain.locator(&self.index, None)
    }

    /// Entry point for a block from the network or the miner.
    pub fn process_block(
        &mut self,
        block: &Block,
        adjusted_time: i64,
    ) -> Result<ProcessOutcome, ValidationError> {
        let hash = block.hash();
        if let Some(id) = self.index.lookup(&hash) {
            if self.index.node(id).has_status(STATUS_HAVE_DATA) {
                return Err(ValidationError::invalid("duplicate", 0));
            }
        }
        if self.orphans.contains(&hash) {
            return Err(ValidationError::invalid("duplicate", 0));
        }

        check_block(block, adjusted_time, &self.params.consensus, true)?;

        if self.index.lookup(&block.header.prev_block).is_none()
            && hash != self.params.consensus.hash_genesis_block
        {
            self.orphans.insert(block.clone());
            return Ok(ProcessOutcome {
                update: ChainUpdate::default(),
                request_parent: Some(self.orphans.orphan_root(&hash)),
            });
        }

        let accepted = self.accept_block(block)?;
        let mut update = self.activate_best_chain()?;
        if self.index.node(accepted).failed() {
            return Err(ValidationError::dos100("bad-chain"));
        }

        // Blocks orphaned on this one (or its descendants) can now come in.
        let mut parents = vec![hash];
        while let Some(parent) = parents.pop() {
            for orphan in self.orphans.take_children(&parent) {
                let orphan_hash = orphan.hash();
                if check_block(&orphan, adjusted_time, &self.params.consensus, true).is_err() {
                    continue;
                }
                match self.accept_block(&orphan) {
                    Ok(_) => {}
                    Err(err) if err.is_invalid() => continue,
                    Err(err) => return Err(err),
                }
                match self.activate_best_chain() {
                    Ok(next) => update.merge(next),
                    Err(err) if err.is_invalid() => continue,
                    Err(err) => return Err(err),
                }
                parents.push(orphan_hash);
            }
        }

        Ok(ProcessOutcome {
            update,
            request_parent: None,
        })
    }

    /// Contextual acceptance: index the block and store it to disk.
    pub fn accept_block(&mut self, block: &Block) -> Result<NodeId, ValidationError> {
        let hash = block.hash();
        let Some(prev_id) = self.index.lookup(&block.header.prev_block) else {
            return Err(ValidationError::Orphan);
        };
        let prev = self.index.node(prev_id);
        if prev.failed() {
            return Err(ValidationError::invalid("bad-prevblk", 10));
        }
        let height = prev.height + 1;
        let prev_chain_tx = prev.chain_tx_count;

        let expected = self.expected_bits(prev_id, Some(i64::from(block.header.time)))?;
        if block.header.bits != expected {
            return Err(ValidationError::dos100("bad-diffbits"));
        }

        if i64::from(block.header.time) <= self.index.median_time_past(prev_id) {
            return Err(ValidationError::invalid("time-too-old", 0));
        }

        for tx in &block.transactions {
            if !is_final_tx(tx, height, i64::from(block.header.time)) {
                return Err(ValidationError::invalid("bad-txns-nonfinal", 10));
            }
        }

        if let Some(checkpoint) = self.params.checkpoint_at(height) {
            if checkpoint.hash != hash {
                return Err(ValidationError::dos100("checkpoint-mismatch"));
            }
        }
        // Reject forks below the last checkpoint we have on the chain.
        let last_checkpointed = self
            .params
            .checkpoints
            .iter()
            .filter(|checkpoint| self.index.lookup(&checkpoint.hash).is_some())
            .map(|checkpoint| checkpoint.height)
            .max()
            .unwrap_or(0);
        if height < last_checkpointed {
            return Err(ValidationError::dos100("forked-below-checkpoint"));
        }

        let consensus = &self.params.consensus;
        if block.header.version < 2
            && self.index.is_supermajority(
                2,
                Some(prev_id),
                consensus.majority_reject_outdated,
                consensus.majority_window,
            )
        {
            return Err(ValidationError::invalid("bad-version", 100));
        }
        if block.header.version >= 2
            && self.index.is_supermajority(
                2,
                Some(prev_id),
                consensus.majority_enforce_upgrade,
                consensus.majority_window,
            )
        {
            let expect = height_script(height);
            let script_sig = &block.transactions[0].vin[0].script_sig;
            if script_sig.len() < expect.len() || script_sig[..expect.len()] != expect[..] {
                return Err(ValidationError::dos100("bad-cb-height"));
            }
        }

        let pos = self.write_block_file(block)?;
        let work = block_proof(block.header.bits)
            .map_err(|_| ValidationError::dos100("bad-diffbits"))?;
        let id = self.index.insert(block.header, work);
        {
            let node = self.index.node_mut(id);
            node.data_pos = Some(pos);
            node.tx_count = block.transactions.len() as u32;
            node.chain_tx_count = prev_chain_tx + block.transactions.len() as u64;
            node.status |= STATUS_VALID_TRANSACTIONS | STATUS_HAVE_DATA;
        }
        self.index.add_candidate(id);
        self.persist_nodes(&[id])?;
        Ok(id)
    }

    /// Re-points the active chain at the best candidate, retrying after
    /// connect failures until the tip is stable.
    pub fn activate_best_chain(&mut self) -> Result<ChainUpdate, ValidationError> {
        let mut update = ChainUpdate::default();
        loop {
            if self.interrupt.load(Ordering::Relaxed) {
                return Err(ValidationError::Error("shutdown requested".to_string()));
            }
            let Some(best) = self.index.best_candidate() else {
                break;
            };
            if Some(best) == self.chain.tip() {
                break;
            }
            match self.set_best_chain(best) {
                Ok(step) => update.merge(step),
                // The failing branch was demoted; pick the next best.
                Err(err) if err.is_invalid() => continue,
                Err(ValidationError::Abort(message)) => {
                    return Err(self.abort_node(message));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(update)
    }

    /// Fatal local failure: record a warning, signal shutdown, and hand
    /// the error back up through every layer.
    fn abort_node(&mut self, message: String) -> ValidationError {
        eprintln!("*** {message}");
        self.warnings.set_misc(format!("Error: {message}"));
        self.interrupt.store(true, Ordering::Relaxed);
        ValidationError::Abort(message)
    }

    /// One reorganization attempt onto `new_tip`.
    fn set_best_chain(&mut self, new_tip: NodeId) -> Result<ChainUpdate, ValidationError> {
        let fork = self
            .chain
            .tip()
            .map(|tip| self.fork_point(tip, new_tip));

        // Plan the walk: current tip down to the fork, fork up to new tip.
        let mut to_disconnect = Vec::new();
        if let (Some(tip), Some(fork)) = (self.chain.tip(), fork) {
            let mut cursor = tip;
            while cursor != fork {
                to_disconnect.push(cursor);
                cursor = self
                    .index
                    .node(cursor)
                    .prev
                    .ok_or_else(|| ValidationError::Error("fork walk fell off".to_string()))?;
            }
        }
        let mut to_connect = Vec::new();
        let mut cursor = Some(new_tip);
        while let Some(id) = cursor {
            if Some(id) == fork {
                break;
            }
            to_connect.push(id);
            cursor = self.index.node(id).prev;
        }
        to_connect.reverse();

        if !to_disconnect.is_empty() {
            println!(
                "REORGANIZE: disconnect {} blocks, connect {} blocks to {}",
                to_disconnect.len(),
                to_connect.len(),
                hash256_to_hex(&self.index.node(new_tip).hash)
            );
        }

        // Pull everything off disk before touching any state.
        let mut disconnect_data = Vec::with_capacity(to_disconnect.len());
        for &id in &to_disconnect {
            let block = self.read_block(id)?;
            let undo = self.read_undo(id)?;
            disconnect_data.push((id, block, undo));
        }
        let mut connect_data = Vec::with_capacity(to_connect.len());
        for &id in &to_connect {
            connect_data.push((id, self.read_block(id)?));
        }

        let last_checkpoint = self.params.last_checkpoint_height();
        let verifier = Arc::clone(&self.verifier);
        let mut resurrect = Vec::new();
        let mut connected_undo: Vec<(NodeId, BlockUndo)> = Vec::new();

        // Everything tentative happens on a scratch layer over the tip
        // cache; dropping it without a flush is the rollback.
        let mut scratch = CoinCache::new(&mut self.coins);
        for (id, block, undo) in &disconnect_data {
            let node = self.index.node(*id);
            let clean = disconnect_block(&mut scratch, block, undo, node.height)?;
            if !clean {
                eprintln!(
                    "warning: unclean disconnect of {}",
                    hash256_to_hex(&node.hash)
                );
            }
            if node.height > last_checkpoint {
                resurrect.extend(block.transactions[1..].iter().cloned());
            }
        }
        for (id, block) in &connect_data {
            if self.interrupt.load(Ordering::Relaxed) {
                return Err(ValidationError::Error("shutdown requested".to_string()));
            }
            let node = self.index.node(*id);
            let check_scripts = self.options.check_scripts && node.height >= last_checkpoint;
            match connect_block(
                &self.params,
                verifier.as_ref(),
                &mut scratch,
                block,
                node.height,
                &node.hash,
                check_scripts,
                false,
            ) {
                Ok(undo) => connected_undo.push((*id, undo)),
                Err(err) if err.is_invalid() => {
                    eprintln!(
                        "InvalidChainFound: invalid block {} at height {} ({err})",
                        hash256_to_hex(&node.hash),
                        node.height
                    );
                    drop(scratch);
                    let affected = self.index.mark_failed(*id);
                    self.persist_nodes(&affected)?;
                    self.warnings.set_invalid_chain_found(true);
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
        scratch.set_best_block(self.index.node(new_tip).hash);
        scratch
            .flush()
            .map_err(|err| ValidationError::Error(err.to_string()))?;
        drop(scratch);

        // Durability order: undo payloads, data files synced, then the
        // index metadata, then (possibly) the coin flush.
        let mut touched = to_disconnect.clone();
        for (id, undo) in &connected_undo {
            if self.index.node(*id).undo_pos.is_none() {
                let prev_hash = self.index.node(*id).header.prev_block;
                let payload = undo.encode_with_checksum(&prev_hash);
                let pos = self
                    .undo
                    .append(&payload)
                    .map_err(|err| ValidationError::Abort(err.to_string()))?;
                self.note_file_write(FILE_KIND_UNDO, pos.file, payload.len() as u64)?;
                let node = self.index.node_mut(*id);
                node.undo_pos = Some(pos);
                node.status |= STATUS_HAVE_UNDO;
            }
            self.index.set_status(*id, STATUS_VALID_SCRIPTS);
            touched.push(*id);
        }
        self.blocks
            .flush()
            .map_err(|err| ValidationError::Abort(err.to_string()))?;
        self.undo
            .flush()
            .map_err(|err| ValidationError::Abort(err.to_string()))?;

        if self.options.txindex {
            self.write_tx_index(&connect_data)?;
        }
        self.persist_nodes(&touched)?;

        self.chain.set_tip(&self.index, new_tip);
        if self.coins.cache_size() > self.options.coin_cache_target {
            self.flush()?;
        }

        let tip_node = self.index.node(new_tip);
        Ok(ChainUpdate {
            disconnected: disconnect_data
                .into_iter()
                .map(|(id, block, _)| (self.index.node(id).hash, block))
                .collect(),
            connected: connect_data
                .into_iter()
                .map(|(id, block)| (self.index.node(id).hash, block))
                .collect(),
            resurrect,
            tip: Some((tip_node.hash, tip_node.height)),
        })
    }

    /// Deepest common ancestor of two indexed nodes.
    fn fork_point(&self, mut a: NodeId, mut b: NodeId) -> NodeId {
        while self.index.node(a).height > self.index.node(b).height {
            match self.index.node(a).prev {
                Some(prev) => a = prev,
                None => return a,
            }
        }
        while self.index.node(b).height > self.index.node(a).height {
            match self.index.node(b).prev {
                Some(prev) => b = prev,
                None => return b,
            }
        }
        while a != b {
            match (self.index.node(a).prev, self.index.node(b).prev) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                _ => break,
            }
        }
        a
    }

    fn read_undo(&self, id: NodeId) -> Result<BlockUndo, ValidationError> {
        let node = self.index.node(id);
        let pos = node
            .undo_pos
            .ok_or_else(|| ValidationError::Error("undo data not on disk".to_string()))?;
        let payload = self.undo.read(pos)?;
        Ok(BlockUndo::decode_with_checksum(
            &node.header.prev_block,
            &payload,
        )?)
    }

    fn write_block_file(&mut self, block: &Block) -> Result<FileLocation, ValidationError> {
        let payload = block.consensus_encode();
        let pos = self
            .blocks
            .append(&payload)
            .map_err(|err| ValidationError::Abort(err.to_string()))?;
        self.note_file_write(FILE_KIND_BLOCKS, pos.file, payload.len() as u64)?;
        Ok(pos)
    }

    fn note_file_write(&self, kind: u8, file: u32, bytes: u64) -> Result<(), ValidationError> {
        let mut key = vec![kind];
        key.extend_from_slice(&file.to_le_bytes());
        let (mut records, mut total) = match self.store.get(Column::FileInfo, &key)? {
            Some(bytes) => {
                let mut decoder = Decoder::new(&bytes);
                let records = decoder.read_u32_le().unwrap_or(0);
                let total = decoder.read_u64_le().unwrap_or(0);
                (records, total)
            }
            None => (0, 0),
        };
        records += 1;
        total += bytes;
        let mut encoder = Encoder::with_capacity(12);
        encoder.write_u32_le(records);
        encoder.write_u64_le(total);
        self.store
            .put(Column::FileInfo, &key, &encoder.into_inner())?;

        let last_key: &[u8] = if kind == FILE_KIND_BLOCKS {
            b"last_block_file"
        } else {
            b"last_undo_file"
        };
        self.store
            .put(Column::Meta, last_key, &file.to_le_bytes())?;
        Ok(())
    }

    fn write_tx_index(&self, connected: &[(NodeId, Block)]) -> Result<(), ValidationError> {
        let txindex = TxIndex::new(Arc::clone(&self.store));
        let mut batch = WriteBatch::new();
        for (id, block) in connected {
            let Some(block_pos) = self.index.node(*id).data_pos else {
                continue;
            };
            // Offset of the first tx: header plus the count prefix.
            let mut encoder = Encoder::new();
            encoder.write_varint(block.transactions.len() as u64);
            let mut offset = 80 + encoder.len();
            for tx in &block.transactions {
                txindex.put(
                    &mut batch,
                    &tx.txid(),
                    TxLocation {
                        block: block_pos,
                        tx_offset: offset as u32,
                    },
                );
                offset += tx.serialized_size();
            }
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    fn persist_nodes(&self, ids: &[NodeId]) -> Result<(), ValidationError> {
        let mut batch = WriteBatch::new();
        for &id in ids {
            let node = self.index.node(id);
            batch.put(Column::BlockIndex, node.hash, node.encode());
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Pushes file buffers and the coin cache to durable storage.
    pub fn flush(&mut self) -> Result<(), ValidationError> {
        self.blocks
            .flush()
            .map_err(|err| ValidationError::Abort(err.to_string()))?;
        self.undo
            .flush()
            .map_err(|err| ValidationError::Abort(err.to_string()))?;
        self.coins
            .flush()
            .map_err(|err| ValidationError::Abort(err.to_string()))?;
        Ok(())
    }

    /// Walks the recent chain against its undo data on a scratch view.
    ///
    /// Levels: 1 re-checks blocks, 2 reads undo data, 3 disconnects on
    /// the scratch, 4 reconnects forward again.
    pub fn verify_chain(&mut self, level: u32, depth: i32) -> Result<(), ValidationError> {
        let level = level.min(4);
        let Some(tip) = self.chain.tip() else {
            return Ok(());
        };
        let tip_height = self.index.node(tip).height;
        let stop_height = (tip_height - depth.max(0)).max(1);

        let mut to_check = Vec::new();
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            let node = self.index.node(id);
            if node.height < stop_height {
                break;
            }
            to_check.push(id);
            cursor = node.prev;
        }

        let mut checked = Vec::new();
        let verifier = Arc::clone(&self.verifier);
        let mut scratch = CoinCache::new(&mut self.coins);
        for &id in &to_check {
            if self.interrupt.load(Ordering::Relaxed) {
                return Ok(());
            }
            let node = self.index.node(id);
            let pos = node
                .data_pos
                .ok_or_else(|| ValidationError::Error("block data not on disk".to_string()))?;
            let block = Block::consensus_decode(&self.blocks.read(pos)?)
                .map_err(|err| ValidationError::Error(format!("corrupt block data: {err}")))?;

            if level >= 1 {
                check_block(
                    &block,
                    i64::from(block.header.time),
                    &self.params.consensus,
                    true,
                )?;
            }
            if level >= 2 && node.height > 0 {
                let undo_pos = node
                    .undo_pos
                    .ok_or_else(|| ValidationError::Error("undo data not on disk".to_string()))?;
                let payload = self.undo.read(undo_pos)?;
                let undo = BlockUndo::decode_with_checksum(&node.header.prev_block, &payload)?;
                if level >= 3 {
                    let clean = disconnect_block(&mut scratch, &block, &undo, node.height)?;
                    if !clean {
                        return Err(ValidationError::Error(format!(
                            "chainstate inconsistency at {}",
                            hash256_to_hex(&node.hash)
                        )));
                    }
                    checked.push((id, block));
                }
            }
        }

        if level >= 4 {
            for (id, block) in checked.iter().rev() {
                let node = self.index.node(*id);
                connect_block(
                    &self.params,
                    verifier.as_ref(),
                    &mut scratch,
                    block,
                    node.height,
                    &node.hash,
                    false,
                    true,
                )?;
                // Reconnect in check-only mode leaves the best marker
                // behind; advance it by hand for the next block.
                scratch.set_best_block(node.hash);
            }
        }
        // The scratch is discarded: verification never mutates state.
        Ok(())
    }
}

/// Marks an in-progress reindex so a crashed wipe restarts cleanly.
pub fn set_reindex_flag<S: KeyValueStore>(store: &S, value: bool) -> Result<(), ValidationError> {
    if value {
        store.put(Column::Meta, META_REINDEX_KEY, &[1])?;
    } else {
        store.delete(Column::Meta, META_REINDEX_KEY)?;
    }
    Ok(())
}

pub fn reindex_flag<S: KeyValueStore>(store: &S) -> Result<bool, ValidationError> {
    Ok(store.get(Column::Meta, META_REINDEX_KEY)?.is_some())
}

/// Applies one block to `view`. On success returns the undo data; the
/// caller owns persisting it and flushing the view.
#[allow(clippy::too_many_arguments)]
pub fn connect_block<P: CoinView>(
    params: &ChainParams,
    verifier: &dyn ScriptVerifier,
    view: &mut CoinCache<P>,
    block: &Block,
    height: i32,
    hash: &Hash256,
    check_scripts: bool,
    just_check: bool,
) -> Result<BlockUndo, ValidationError> {
    // Genesis only moves the best-block marker; its coinbase is not
    // spendable.
    if *hash == params.consensus.hash_genesis_block {
        if !just_check {
            view.set_best_block(*hash);
        }
        return Ok(BlockUndo::default());
    }

    if view.best_block()? != Some(block.header.prev_block) {
        return Err(ValidationError::Error(
            "coin view out of sync with connect".to_string(),
        ));
    }

    // No overwriting an unspent transaction, apart from the two
    // grandfathered historical blocks.
    let exempt = params
        .consensus
        .overwrite_exceptions
        .iter()
        .any(|exception| exception.height == height && exception.hash == *hash);
    if !exempt {
        for tx in &block.transactions {
            if view.have_coins(&tx.txid())? {
                return Err(ValidationError::dos100("bad-txns-BIP30"));
            }
        }
    }

    let p2sh_active = block.header.time >= P2SH_SWITCH_TIME;
    let flags = VERIFY_NOCACHE | if p2sh_active { VERIFY_P2SH } else { 0 };

    let mut queue = CheckQueue::new();
    let mut sigops = 0usize;
    let mut fees = 0i64;
    let mut undo = BlockUndo::default();

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        let txid = tx.txid();
        let is_coinbase = tx_index == 0;

        sigops += legacy_sigop_count(tx);
        if sigops > MAX_BLOCK_SIGOPS {
            return Err(ValidationError::dos100("bad-blk-sigops"));
        }

        if !is_coinbase {
            let tx_arc = Arc::new(tx.clone());
            let mut tx_undo = TxUndo::default();
            let mut value_in = 0i64;

            for input in &tx.vin {
                let Some(mut coins) = view.coins(&input.prevout.hash)? else {
                    return Err(ValidationError::dos100("bad-txns-inputs-missingorspent"));
                };
                let Some(prev_out) = coins.output(input.prevout.index).cloned() else {
                    return Err(ValidationError::dos100("bad-txns-inputs-missingorspent"));
                };

                if coins.coinbase && height - coins.height < COINBASE_MATURITY {
                    return Err(ValidationError::dos100(
                        "bad-txns-premature-spend-of-coinbase",
                    ));
                }
                if !money_range(prev_out.value) {
                    return Err(ValidationError::dos100("bad-txns-inputvalues-outofrange"));
                }
                value_in = value_in
                    .checked_add(prev_out.value)
                    .filter(|total| money_range(*total))
                    .ok_or_else(|| {
                        ValidationError::dos100("bad-txns-inputvalues-outofrange")
                    })?;

                if p2sh_active && is_p2sh(&prev_out.script_pubkey) {
                    sigops += p2sh_sigop_count(&prev_out.script_pubkey, &input.script_sig);
                    if sigops > MAX_BLOCK_SIGOPS {
                        return Err(ValidationError::dos100("bad-blk-sigops"));
                    }
                }

                if check_scripts {
                    queue.push(ScriptCheck {
                        tx: Arc::clone(&tx_arc),
                        input_index: tx_undo.spent.len(),
                        script_pubkey: prev_out.script_pubkey.clone(),
                        flags,
                    });
                }

                // Spend, capturing the pre-spend state.
                let spent = coins
                    .spend(input.prevout.index)
                    .expect("output checked above");
                let whole_record = coins.is_pruned();
                tx_undo.spent.push(TxInUndo {
                    txout: spent,
                    coinbase: coins.coinbase,
                    height: if whole_record { coins.height } else { 0 },
                    version: if whole_record { coins.version } else { 0 },
                });
                view.set_coins(input.prevout.hash, coins);
            }

            let value_out = tx
                .value_out()
                .filter(|total| money_range(*total))
                .ok_or_else(|| ValidationError::dos100("bad-txns-txouttotal-toolarge"))?;
            if value_in < value_out {
                return Err(ValidationError::dos100("bad-txns-in-belowout"));
            }
            fees = fees
                .checked_add(value_in - value_out)
                .filter(|total| money_range(*total))
                .ok_or_else(|| ValidationError::dos100("bad-txns-fee-outofrange"))?;

            undo.txs.push(tx_undo);
        }

        view.set_coins(txid, Coins::from_tx(tx, height));
    }

    let claimed = block.transactions[0]
        .value_out()
        .ok_or_else(|| ValidationError::dos100("bad-cb-amount"))?;
    if claimed > block_value(height, fees, &params.consensus) {
        return Err(ValidationError::dos100("bad-cb-amount"));
    }

    if check_scripts {
        queue.wait(verifier)?;
    }

    if !just_check {
        view.set_best_block(*hash);
    }
    Ok(undo)
}

/// Reverses one block on `view`. Returns false when the coin state did
/// not match the undo data; callers treat that as corruption but keep
/// going.
pub fn disconnect_block<P: CoinView>(
    view: &mut CoinCache<P>,
    block: &Block,
    undo: &BlockUndo,
    height: i32,
) -> Result<bool, ValidationError> {
    if view.best_block()? != Some(block.hash()) {
        return Err(ValidationError::Error(
            "coin view out of sync with disconnect".to_string(),
        ));
    }
    if undo.txs.len() + 1 != block.transactions.len() {
        return Err(ValidationError::Error(
            "block and undo data inconsistent".to_string(),
        ));
    }

    let mut clean = true;
    for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();

        // The outputs this block created must still be there, intact.
        let expected = Coins::from_tx(tx, height);
        match view.coins(&txid)? {
            Some(existing) if existing == expected => {}
            _ => clean = false,
        }
        view.set_coins(txid, Coins::pruned());

        if tx_index == 0 {
            continue;
        }
        let tx_undo = &undo.txs[tx_index - 1];
        if tx_undo.spent.len() != tx.vin.len() {
            return Err(ValidationError::Error(
                "transaction and undo data inconsistent".to_string(),
            ));
        }

        for (input, spent) in tx.vin.iter().zip(&tx_undo.spent).rev() {
            let prevout = input.prevout;
            let mut coins = view.coins(&prevout.hash)?.unwrap_or_else(Coins::pruned);
            if spent.height != 0 {
                // The spend erased the whole record; resurrect it.
                if !coins.is_pruned() {
                    clean = false;
                }
                coins = Coins {
                    coinbase: spent.coinbase,
                    height: spent.height,
                    version: spent.version,
                    outputs: Vec::new(),
                };
            } else if coins.is_pruned() {
                clean = false;
            }
            if coins.is_available(prevout.index) {
                clean = false;
            }
            if coins.outputs.len() <= prevout.index as usize {
                coins.outputs.resize(prevout.index as usize + 1, None);
            }
            coins.outputs[prevout.index as usize] = Some(spent.txout.clone());
            view.set_coins(prevout.hash, coins);
        }
    }

    view.set_best_block(block.header.prev_block);
    Ok(clean)
}
