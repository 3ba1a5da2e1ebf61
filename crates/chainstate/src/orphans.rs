//! Blocks whose parent has not arrived yet.

use std::collections::HashMap;

use kestrel_consensus::constants::MAX_ORPHAN_BLOCKS;
use kestrel_consensus::Hash256;
use kestrel_primitives::Block;
use rand::Rng;

pub struct OrphanBlocks {
    by_hash: HashMap<Hash256, Block>,
    by_prev: HashMap<Hash256, Vec<Hash256>>,
    max_entries: usize,
}

impl Default for OrphanBlocks {
    fn default() -> Self {
        Self::with_capacity(MAX_ORPHAN_BLOCKS)
    }
}

impl OrphanBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            by_hash: HashMap::new(),
            by_prev: HashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Stores an orphan, evicting random entries once over capacity.
    /// Returns how many entries eviction removed.
    pub fn insert(&mut self, block: Block) -> usize {
        let hash = block.hash();
        if self.by_hash.contains_key(&hash) {
            return 0;
        }
        self.by_prev
            .entry(block.header.prev_block)
            .or_default()
            .push(hash);
        self.by_hash.insert(hash, block);

        let mut evicted = 0;
        while self.by_hash.len() > self.max_entries {
            let victim_index = rand::thread_rng().gen_range(0..self.by_hash.len());
            let victim = *self
                .by_hash
                .keys()
                .nth(victim_index)
                .expect("index within len");
            self.remove(&victim);
            evicted += 1;
        }
        evicted
    }

    fn remove(&mut self, hash: &Hash256) -> Option<Block> {
        let block = self.by_hash.remove(hash)?;
        let prev = block.header.prev_block;
        if let Some(children) = self.by_prev.get_mut(&prev) {
            children.retain(|child| child != hash);
            if children.is_empty() {
                self.by_prev.remove(&prev);
            }
        }
        Some(block)
    }

    /// Removes and returns every stored orphan whose parent is `parent`.
    pub fn take_children(&mut self, parent: &Hash256) -> Vec<Block> {
        let hashes = self.by_prev.remove(parent).unwrap_or_default();
        hashes
            .iter()
            .filter_map(|hash| self.by_hash.remove(hash))
            .collect()
    }

    /// Walks back through stored orphans to the oldest missing ancestor,
    /// the hash worth requesting from a peer.
    pub fn orphan_root(&self, hash: &Hash256) -> Hash256 {
        let mut cursor = *hash;
        while let Some(block) = self.by_hash.get(&cursor) {
            cursor = block.header.prev_block;
        }
        cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_primitives::{BlockHeader, OutPoint, Transaction, TxIn, TxOut};

    fn block(prev: Hash256, nonce: u32) -> Block {
        Block {
            header: BlockHeader {
                version: 2,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time: nonce,
                bits: 0x207f_ffff,
                nonce,
            },
            transactions: vec![Transaction {
                version: 1,
                vin: vec![TxIn {
                    prevout: OutPoint::null(),
                    script_sig: vec![0x00, 0x00],
                    sequence: u32::MAX,
                }],
                vout: vec![TxOut::new(0, Vec::new())],
                lock_time: 0,
            }],
        }
    }

    #[test]
    fn children_index_and_root_walk() {
        let mut orphans = OrphanBlocks::new();
        let b2 = block([0x11; 32], 2);
        let b2_hash = b2.hash();
        let b3 = block(b2_hash, 3);
        orphans.insert(b2.clone());
        orphans.insert(b3);
        assert_eq!(orphans.len(), 2);

        // The request target is the missing ancestor of the chain.
        assert_eq!(orphans.orphan_root(&b2_hash), [0x11; 32]);

        let children = orphans.take_children(&[0x11; 32]);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].hash(), b2_hash);
        assert_eq!(orphans.len(), 1);

        let grandchildren = orphans.take_children(&b2_hash);
        assert_eq!(grandchildren.len(), 1);
        assert!(orphans.is_empty());
    }

    #[test]
    fn eviction_keeps_the_pool_bounded() {
        let mut orphans = OrphanBlocks::with_capacity(8);
        let mut evicted = 0;
        for nonce in 0..32 {
            evicted += orphans.insert(block([nonce as u8; 32], nonce));
        }
        assert_eq!(orphans.len(), 8);
        assert_eq!(evicted, 24);
    }
}
