//! Update payloads
//!
//! An update carries, per peer, a run of blocks with contiguous clocks plus a
//! delete set. Decoded blocks are standalone: their neighbours are resolved
//! from their origins only when they are integrated.

use super::{Decode, Decoder, Encode, Encoder};
use crate::block::Block;
use crate::delete_set::DeleteSet;
use crate::error::{Result, SyncError};
use crate::id::{ClientID, ID};
use crate::state_vector::StateVector;
use crate::store::BlockStore;
use std::collections::{BTreeMap, VecDeque};

/// Decoded blocks and deletions, ready to be applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub(crate) blocks: BTreeMap<ClientID, VecDeque<Block>>,
    pub(crate) delete_set: DeleteSet,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.values().all(VecDeque::is_empty) && self.delete_set.is_empty()
    }

    pub fn delete_set(&self) -> &DeleteSet {
        &self.delete_set
    }

    /// Number of blocks carried
    pub fn block_count(&self) -> usize {
        self.blocks.values().map(VecDeque::len).sum()
    }

    /// State covered by the blocks of this update
    ///
    /// Only meaningful for the upper bound: the blocks may start anywhere.
    pub fn state_vector(&self) -> StateVector {
        self.blocks
            .iter()
            .filter_map(|(client, blocks)| blocks.back().map(|b| (*client, b.end_clock())))
            .collect()
    }

    /// Lowest clock each peer's blocks start from
    pub fn start_clocks(&self) -> StateVector {
        self.blocks
            .iter()
            .filter_map(|(client, blocks)| blocks.front().map(|b| (*client, b.id().clock)))
            .collect()
    }

    /// Fold `other` into this update, keeping each peer's blocks sorted
    pub fn merge(&mut self, other: Update) {
        for (client, blocks) in other.blocks {
            let queue = self.blocks.entry(client).or_default();
            queue.extend(blocks);
            queue.make_contiguous().sort_by_key(|block| block.id().clock);
        }
        self.delete_set.merge(other.delete_set);
    }
}

impl Encode for Update {
    fn encode(&self, encoder: &mut Encoder) {
        let clients: Vec<_> = self
            .blocks
            .iter()
            .rev()
            .filter(|(_, blocks)| !blocks.is_empty())
            .collect();
        encoder.write_var_u64(clients.len() as u64);
        for (client, blocks) in clients {
            encoder.write_var_u64(blocks.len() as u64);
            encoder.write_var_u64(*client);
            encoder.write_var_u32(blocks.front().map(|b| b.id().clock).unwrap_or(0));
            for block in blocks {
                block.encode_from(0, encoder);
            }
        }
        self.delete_set.encode(encoder);
    }
}

impl Decode for Update {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        let mut blocks = BTreeMap::new();
        let clients = decoder.read_len()?;
        for _ in 0..clients {
            let count = decoder.read_len()?;
            let client = decoder.read_var_u64()?;
            let mut clock = decoder.read_var_u32()?;
            let mut queue = VecDeque::with_capacity(count);
            for _ in 0..count {
                let block = Block::decode(ID::new(client, clock), decoder)?;
                clock = clock
                    .checked_add(block.len())
                    .ok_or_else(|| SyncError::Decode(format!("clock overflow for {client}")))?;
                queue.push_back(block);
            }
            blocks.insert(client, queue);
        }
        let delete_set = DeleteSet::decode(decoder)?;
        Ok(Update { blocks, delete_set })
    }
}

/// Write every block of `store` that `remote` has not seen yet
///
/// Peers are written in descending id order. A block only partly known to
/// the remote is written from its first unknown element.
pub(crate) fn write_blocks_since(store: &BlockStore, remote: &StateVector, encoder: &mut Encoder) {
    let mut clients: Vec<(ClientID, u32)> = store
        .clients()
        .filter_map(|client| {
            let remote_clock = remote.get(&client);
            (store.get_state(client) > remote_clock).then_some((client, remote_clock))
        })
        .collect();
    clients.sort_unstable_by(|a, b| b.0.cmp(&a.0));

    encoder.write_var_u64(clients.len() as u64);
    for (client, clock) in clients {
        let blocks = store.blocks(client);
        let start = store.find_pivot(client, clock).unwrap_or(0);
        let blocks = &blocks[start..];
        encoder.write_var_u64(blocks.len() as u64);
        encoder.write_var_u64(client);
        encoder.write_var_u32(clock);
        for (i, block) in blocks.iter().enumerate() {
            let offset = if i == 0 { clock - block.id().clock } else { 0 };
            block.encode_from(offset, encoder);
        }
    }
}
