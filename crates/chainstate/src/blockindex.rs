//! The in-memory forest of known block headers.
//!
//! Nodes live in an arena indexed by `NodeId`; parent links are ids, so
//! no cycles exist by construction. Each node also persists as a record
//! in the block-index column and is relinked at startup.

use std::collections::{BTreeSet, HashMap};

use kestrel_consensus::Hash256;
use kestrel_pow::difficulty::HeaderInfo;
use kestrel_primitives::encoding::{DecodeError, Decoder, Encoder};
use kestrel_primitives::BlockHeader;
use primitive_types::U256;

use crate::flatfiles::FileLocation;

pub const STATUS_HAVE_DATA: u32 = 1 << 0;
pub const STATUS_HAVE_UNDO: u32 = 1 << 1;
pub const STATUS_VALID_HEADER: u32 = 1 << 2;
pub const STATUS_VALID_TRANSACTIONS: u32 = 1 << 3;
pub const STATUS_VALID_SCRIPTS: u32 = 1 << 4;
pub const STATUS_FAILED_VALID: u32 = 1 << 5;
pub const STATUS_FAILED_CHILD: u32 = 1 << 6;

pub type NodeId = u32;

#[derive(Clone, Debug)]
pub struct BlockIndexNode {
    pub hash: Hash256,
    pub prev: Option<NodeId>,
    pub height: i32,
    pub chain_work: U256,
    pub header: BlockHeader,
    pub tx_count: u32,
    pub chain_tx_count: u64,
    pub data_pos: Option<FileLocation>,
    pub undo_pos: Option<FileLocation>,
    pub status: u32,
    /// Arrival order, the deterministic tie-break for equal work.
    pub sequence: u64,
}

impl BlockIndexNode {
    pub fn has_status(&self, bits: u32) -> bool {
        self.status & bits == bits
    }

    pub fn failed(&self) -> bool {
        self.status & (STATUS_FAILED_VALID | STATUS_FAILED_CHILD) != 0
    }

    /// Eligible for best-tip selection.
    pub fn is_candidate(&self) -> bool {
        !self.failed()
            && self.has_status(STATUS_VALID_TRANSACTIONS)
            && self.has_status(STATUS_HAVE_DATA)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(160);
        self.header.encode_into(&mut encoder);
        encoder.write_i32_le(self.height);
        encoder.write_bytes(&self.chain_work.to_little_endian());
        encoder.write_u32_le(self.tx_count);
        encoder.write_u64_le(self.chain_tx_count);
        encoder.write_u32_le(self.status);
        encoder.write_u64_le(self.sequence);
        match self.data_pos {
            Some(pos) => {
                encoder.write_u8(1);
                pos.encode_into(&mut encoder);
            }
            None => encoder.write_u8(0),
        }
        match self.undo_pos {
            Some(pos) => {
                encoder.write_u8(1);
                pos.encode_into(&mut encoder);
            }
            None => encoder.write_u8(0),
        }
        encoder.into_inner()
    }

    /// Decodes a persisted record; `prev` is relinked by the caller.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::decode_from(&mut decoder)?;
        let height = decoder.read_i32_le()?;
        let chain_work = U256::from_little_endian(decoder.read_bytes(32)?);
        let tx_count = decoder.read_u32_le()?;
        let chain_tx_count = decoder.read_u64_le()?;
        let status = decoder.read_u32_le()?;
        let sequence = decoder.read_u64_le()?;
        let data_pos = if decoder.read_u8()? != 0 {
            Some(FileLocation::decode_from(&mut decoder)?)
        } else {
            None
        };
        let undo_pos = if decoder.read_u8()? != 0 {
            Some(FileLocation::decode_from(&mut decoder)?)
        } else {
            None
        };
        decoder.finish()?;
        Ok(Self {
            hash: header.hash(),
            prev: None,
            height,
            chain_work,
            header,
            tx_count,
            chain_tx_count,
            data_pos,
            undo_pos,
            status,
            sequence,
        })
    }
}

/// Total order for best-tip selection: highest work wins, then the
/// earliest arrival (larger inverted sequence).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct CandidateKey {
    work: U256,
    inverted_sequence: u64,
    id: NodeId,
}

impl CandidateKey {
    fn for_node(node: &BlockIndexNode, id: NodeId) -> Self {
        Self {
            work: node.chain_work,
            inverted_sequence: u64::MAX - node.sequence,
            id,
        }
    }
}

#[derive(Default)]
pub struct BlockIndex {
    nodes: Vec<BlockIndexNode>,
    by_hash: HashMap<Hash256, NodeId>,
    candidates: BTreeSet<CandidateKey>,
    next_sequence: u64,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &BlockIndexNode {
        &self.nodes[id as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BlockIndexNode {
        &mut self.nodes[id as usize]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len() as NodeId
    }

    /// Inserts a header whose parent (if any) is already indexed.
    /// Duplicate inserts return the existing id.
    pub fn insert(&mut self, header: BlockHeader, work: U256) -> NodeId {
        let hash = header.hash();
        if let Some(existing) = self.by_hash.get(&hash) {
            return *existing;
        }
        let prev = self.by_hash.get(&header.prev_block).copied();
        let (height, prev_work) = match prev {
            Some(prev_id) => {
                let parent = self.node(prev_id);
                (parent.height + 1, parent.chain_work)
            }
            None => (0, U256::zero()),
        };
        let id = self.nodes.len() as NodeId;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.nodes.push(BlockIndexNode {
            hash,
            prev,
            height,
            chain_work: prev_work + work,
            header,
            tx_count: 0,
            chain_tx_count: 0,
            data_pos: None,
            undo_pos: None,
            status: STATUS_VALID_HEADER,
            sequence,
        });
        self.by_hash.insert(hash, id);
        id
    }

    /// Rebuilds the arena from persisted records. Records are linked by
    /// header parent hash; orphaned records are dropped.
    pub fn from_records(mut records: Vec<BlockIndexNode>) -> Self {
        records.sort_by_key(|record| (record.height, record.sequence));
        let mut index = Self::new();
        for mut record in records {
            if index.by_hash.contains_key(&record.hash) {
                continue;
            }
            let prev = index.by_hash.get(&record.header.prev_block).copied();
            if prev.is_none() && record.height != 0 {
                continue;
            }
            record.prev = prev;
            let id = index.nodes.len() as NodeId;
            index.next_sequence = index.next_sequence.max(record.sequence + 1);
            index.by_hash.insert(record.hash, id);
            if record.is_candidate() {
                index
                    .candidates
                    .insert(CandidateKey::for_node(&record, id));
            }
            index.nodes.push(record);
        }
        index
    }

    pub fn add_candidate(&mut self, id: NodeId) {
        let node = self.node(id);
        if node.is_candidate() {
            let key = CandidateKey::for_node(node, id);
            self.candidates.insert(key);
        }
    }

    pub fn remove_candidate(&mut self, id: NodeId) {
        let key = CandidateKey::for_node(self.node(id), id);
        self.candidates.remove(&key);
    }

    /// The maximum of the candidate set under the work/arrival order.
    pub fn best_candidate(&self) -> Option<NodeId> {
        self.candidates.iter().next_back().map(|key| key.id)
    }

    pub fn set_status(&mut self, id: NodeId, bits: u32) {
        self.node_mut(id).status |= bits;
    }

    /// Marks a node invalid and demotes every known descendant.
    /// Returns all affected ids so the caller can persist them.
    pub fn mark_failed(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut affected = vec![id];
        self.remove_candidate(id);
        self.node_mut(id).status |= STATUS_FAILED_VALID;

        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for child in self.iter_ids() {
            if let Some(prev) = self.node(child).prev {
                children.entry(prev).or_default().push(child);
            }
        }
        let mut frontier = vec![id];
        while let Some(parent) = frontier.pop() {
            for &child in children.get(&parent).map(Vec::as_slice).unwrap_or(&[]) {
                if self.node(child).has_status(STATUS_FAILED_CHILD) {
                    continue;
                }
                self.remove_candidate(child);
                self.node_mut(child).status |= STATUS_FAILED_CHILD;
                affected.push(child);
                frontier.push(child);
            }
        }
        affected
    }

    /// Walks back to the ancestor at `height`.
    pub fn ancestor(&self, mut id: NodeId, height: i32) -> Option<NodeId> {
        loop {
            let node = self.node(id);
            if node.height == height {
                return Some(id);
            }
            if node.height < height {
                return None;
            }
            id = node.prev?;
        }
    }

    /// Median of the timestamps of the last eleven blocks ending at `id`.
    pub fn median_time_past(&self, id: NodeId) -> i64 {
        let mut times = Vec::with_capacity(kestrel_consensus::constants::MEDIAN_TIME_SPAN);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if times.len() == kestrel_consensus::constants::MEDIAN_TIME_SPAN {
                break;
            }
            let node = self.node(current);
            times.push(i64::from(node.header.time));
            cursor = node.prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// True when at least `required` of the `window` blocks ending at
    /// `start` advertise `min_version` or newer.
    pub fn is_supermajority(
        &self,
        min_version: i32,
        start: Option<NodeId>,
        required: usize,
        window: usize,
    ) -> bool {
        let mut found = 0;
        let mut cursor = start;
        for _ in 0..window {
            let Some(current) = cursor else { break };
            if found >= required {
                break;
            }
            let node = self.node(current);
            if node.header.version >= min_version {
                found += 1;
            }
            cursor = node.prev;
        }
        found >= required
    }

    /// Contiguous ascending window of up to `len` headers ending at `tip`,
    /// in the shape the retarget function consumes.
    pub fn header_window(&self, tip: NodeId, len: usize) -> Vec<HeaderInfo> {
        let mut window = Vec::with_capacity(len);
        let mut cursor = Some(tip);
        while let Some(current) = cursor {
            if window.len() == len {
                break;
            }
            let node = self.node(current);
            window.push(HeaderInfo {
                height: i64::from(node.height),
                time: i64::from(node.header.time),
                bits: node.header.bits,
            });
            cursor = node.prev;
        }
        window.reverse();
        window
    }
}
