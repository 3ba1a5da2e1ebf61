//! The active chain and block locators.

use kestrel_consensus::Hash256;

use crate::blockindex::{BlockIndex, NodeId};

/// The path from genesis to the current tip, indexed by height.
#[derive(Clone, Debug, Default)]
pub struct ActiveChain {
    ids: Vec<NodeId>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.ids.last().copied()
    }

    pub fn height(&self) -> i32 {
        self.ids.len() as i32 - 1
    }

    pub fn at(&self, height: i32) -> Option<NodeId> {
        if height < 0 {
            return None;
        }
        self.ids.get(height as usize).copied()
    }

    pub fn contains(&self, index: &BlockIndex, id: NodeId) -> bool {
        self.at(index.node(id).height) == Some(id)
    }

    /// Successor of `id` on the active chain.
    pub fn next(&self, index: &BlockIndex, id: NodeId) -> Option<NodeId> {
        if !self.contains(index, id) {
            return None;
        }
        self.at(index.node(id).height + 1)
    }

    /// Re-points the chain at `tip`, rewriting only the diverging suffix.
    pub fn set_tip(&mut self, index: &BlockIndex, tip: NodeId) {
        let height = index.node(tip).height;
        self.ids.resize((height + 1) as usize, tip);
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            let node = index.node(id);
            let slot = node.height as usize;
            if self.ids[slot] == id && slot != height as usize {
                break;
            }
            self.ids[slot] = id;
            cursor = node.prev;
        }
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Exponentially spaced hashes walking back from `from` (the tip by
    /// default), always ending with genesis.
    pub fn locator(&self, index: &BlockIndex, from: Option<NodeId>) -> Vec<Hash256> {
        let mut locator = Vec::new();
        let Some(start) = from.or_else(|| self.tip()) else {
            return locator;
        };
        let mut height = index.node(start).height;
        let mut step = 1i32;
        loop {
            // Ancestor links keep the walk correct off the active chain.
            let Some(id) = index.ancestor(start, height) else {
                break;
            };
            locator.push(index.node(id).hash);
            if height == 0 {
                break;
            }
            if locator.len() > 10 {
                step = step.saturating_mul(2);
            }
            height = (height - step).max(0);
        }
        locator
    }

    /// Deepest locator entry on the active chain; the fork point for a
    /// peer advertising this locator.
    pub fn find_fork(&self, index: &BlockIndex, locator: &[Hash256]) -> Option<NodeId> {
        for hash in locator {
            if let Some(id) = index.lookup(hash) {
                if self.contains(index, id) {
                    return Some(id);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockindex::{STATUS_HAVE_DATA, STATUS_VALID_TRANSACTIONS};
    use kestrel_primitives::BlockHeader;
    use kestrel_pow::block_proof;

    fn grow(index: &mut BlockIndex, prev: Hash256, nonce: u32) -> NodeId {
        let header = BlockHeader {
            version: 2,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 1_000_000 + nonce,
            bits: 0x207f_ffff,
            nonce,
        };
        let id = index.insert(header, block_proof(0x207f_ffff).expect("work"));
        index.set_status(id, STATUS_VALID_TRANSACTIONS | STATUS_HAVE_DATA);
        id
    }

    fn build_chain(index: &mut BlockIndex, length: u32) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut prev = [0u8; 32];
        for nonce in 0..length {
            let id = grow(index, prev, nonce);
            prev = index.node(id).hash;
            ids.push(id);
        }
        ids
    }

    #[test]
    fn set_tip_switches_branches() {
        let mut index = BlockIndex::new();
        let main = build_chain(&mut index, 4);
        let mut chain = ActiveChain::new();
        chain.set_tip(&index, main[3]);
        assert_eq!(chain.height(), 3);
        assert_eq!(chain.tip(), Some(main[3]));
        assert!(chain.contains(&index, main[1]));
        assert_eq!(chain.next(&index, main[1]), Some(main[2]));

        // A fork off main[1] takes over.
        let main1_hash = index.node(main[1]).hash;
        let fork_a = grow(&mut index, main1_hash, 100);
        let fork_a_hash = index.node(fork_a).hash;
        let fork_b = grow(&mut index, fork_a_hash, 101);
        chain.set_tip(&index, fork_b);
        assert_eq!(chain.height(), 3);
        assert!(chain.contains(&index, fork_a));
        assert!(!chain.contains(&index, main[2]));
        assert!(chain.contains(&index, main[1]));

        // Shrinking reorg.
        chain.set_tip(&index, main[1]);
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.tip(), Some(main[1]));
    }

    #[test]
    fn locator_is_exponential_and_ends_at_genesis() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, 64);
        let mut chain = ActiveChain::new();
        chain.set_tip(&index, ids[63]);

        let locator = chain.locator(&index, None);
        assert_eq!(locator.first(), Some(&index.node(ids[63]).hash));
        assert_eq!(locator.last(), Some(&index.node(ids[0]).hash));
        // Dense near the tip, then doubling steps: far fewer than 64.
        assert!(locator.len() < 24);

        let fork = chain.find_fork(&index, &locator);
        assert_eq!(fork, Some(ids[63]));

        // A locator of unknown hashes finds no fork.
        assert_eq!(chain.find_fork(&index, &[[0xee; 32]]), None);
    }
}
