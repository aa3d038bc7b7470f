//! Block store
//!
//! [`BlockStore`] is the arena holding every block of a document, grouped per
//! peer and sorted by clock. Blocks of one peer cover a contiguous clock range
//! starting at 0; lookups by [`ID`] binary-search the peer's list.
//!
//! [`Store`] bundles the arena with the branch registry and the buffers of
//! remote data still waiting for missing causal predecessors.

use crate::block::{Block, Item, GC};
use crate::config::Options;
use crate::delete_set::DeleteSet;
use crate::encoding::update::Update;
use crate::error::{Result, SyncError};
use crate::id::{ClientID, ID};
use crate::state_vector::StateVector;
use crate::types::{Branch, BranchId};
use std::collections::HashMap;

/// Per-peer block lists
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BlockStore {
    clients: HashMap<ClientID, Vec<Block>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next clock expected from `client`
    pub fn get_state(&self, client: ClientID) -> u32 {
        self.clients
            .get(&client)
            .and_then(|blocks| blocks.last())
            .map(Block::end_clock)
            .unwrap_or(0)
    }

    pub fn get_state_vector(&self) -> StateVector {
        let mut sv = StateVector::default();
        for &client in self.clients.keys() {
            sv.set_max(client, self.get_state(client));
        }
        sv
    }

    pub fn clients(&self) -> impl Iterator<Item = ClientID> + '_ {
        self.clients.keys().copied()
    }

    pub fn blocks(&self, client: ClientID) -> &[Block] {
        self.clients.get(&client).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Index of the block of `client` containing `clock`
    pub fn find_pivot(&self, client: ClientID, clock: u32) -> Option<usize> {
        let blocks = self.clients.get(&client)?;
        let index = blocks.partition_point(|block| block.end_clock() <= clock);
        match blocks.get(index) {
            Some(block) if block.id().clock <= clock => Some(index),
            _ => None,
        }
    }

    /// Block containing `id`
    pub fn get_block(&self, id: &ID) -> Option<&Block> {
        let index = self.find_pivot(id.client, id.clock)?;
        self.clients.get(&id.client)?.get(index)
    }

    pub fn get_block_mut(&mut self, id: &ID) -> Option<&mut Block> {
        let index = self.find_pivot(id.client, id.clock)?;
        self.clients.get_mut(&id.client)?.get_mut(index)
    }

    /// Item containing `id`, if it was not reclaimed
    pub fn get_item(&self, id: &ID) -> Option<&Item> {
        self.get_block(id).and_then(Block::as_item)
    }

    pub fn get_item_mut(&mut self, id: &ID) -> Option<&mut Item> {
        self.get_block_mut(id).and_then(Block::as_item_mut)
    }

    /// Item containing `id`
    ///
    /// Fails with `NotFound` when the id is unknown or its block was
    /// garbage collected.
    pub fn find(&self, id: &ID) -> Result<&Item> {
        self.get_item(id).ok_or(SyncError::NotFound(*id))
    }

    /// Whether `id` is covered by a known block
    pub fn contains(&self, id: &ID) -> bool {
        id.clock < self.get_state(id.client)
    }

    /// Append a block at the end of its peer's list
    ///
    /// The block must start exactly at the peer's current state.
    pub fn push_block(&mut self, block: Block) {
        let id = block.id();
        debug_assert_eq!(id.clock, self.get_state(id.client));
        self.clients.entry(id.client).or_default().push(block);
    }

    /// Split the block containing `id` so that a block starts at `id`
    ///
    /// Returns the id of that block. Neighbour links are kept consistent.
    pub fn split(&mut self, id: &ID) -> Option<ID> {
        let index = self.find_pivot(id.client, id.clock)?;
        let blocks = self.clients.get_mut(&id.client)?;
        let block = &mut blocks[index];
        let offset = id.clock - block.id().clock;
        if offset == 0 {
            return Some(*id);
        }

        let right = match block {
            Block::Item(item) => Block::Item(item.split(offset)),
            Block::GC(gc) => Block::GC(gc.split(offset)),
        };
        let right_of_right = right.as_item().and_then(|item| item.right);
        blocks.insert(index + 1, right);

        if let Some(next) = right_of_right {
            if let Some(next) = self.get_item_mut(&next) {
                next.left = Some(*id);
            }
        }
        Some(*id)
    }

    /// Make sure a block starts at `id` and return it
    pub fn get_item_clean_start(&mut self, id: &ID) -> Option<ID> {
        self.split(id)
    }

    /// Make sure a block ends at `id` and return the id of its first element
    pub fn get_item_clean_end(&mut self, id: &ID) -> Option<ID> {
        let block = self.get_block(id)?;
        let start = block.id();
        if id.clock + 1 < block.end_clock() {
            self.split(&ID::new(id.client, id.clock + 1))?;
        }
        Some(start)
    }

    /// Merge the block at `index` of `client` into its left neighbour
    ///
    /// Returns `true` if the blocks were merged.
    pub fn squash_left(&mut self, client: ClientID, index: usize) -> bool {
        if index == 0 {
            return false;
        }
        let Some(blocks) = self.clients.get_mut(&client) else {
            return false;
        };
        if index >= blocks.len() {
            return false;
        }

        let (head, tail) = blocks.split_at_mut(index);
        let (left, right) = (&mut head[index - 1], &tail[0]);
        let relink = match (left, right) {
            (Block::GC(left), Block::GC(right)) => {
                left.len += right.len;
                None
            }
            (Block::Item(left), Block::Item(right)) => {
                if !left.can_squash(right) || !left.content.try_squash(&right.content) {
                    return false;
                }
                left.len += right.len;
                left.right = right.right;
                right.right.map(|next| (next, left.id))
            }
            _ => return false,
        };
        blocks.remove(index);

        if let Some((next, left_id)) = relink {
            if let Some(next) = self.get_item_mut(&next) {
                next.left = Some(left_id);
            }
        }
        true
    }

    /// Replace the item starting at `id` with a reclaimed range
    pub fn replace_with_gc(&mut self, id: &ID) {
        if let Some(block) = self.get_block_mut(id) {
            if let Block::Item(item) = block {
                *block = Block::GC(GC::new(item.id, item.len));
            }
        }
    }
}

/// Document state behind a transaction
#[derive(Debug)]
pub struct Store {
    pub options: Options,
    pub client_id: ClientID,
    pub blocks: BlockStore,
    pub types: HashMap<BranchId, Branch>,

    /// Remote blocks waiting for causal predecessors
    pub pending: Option<Update>,

    /// Remote deletions targeting blocks not received yet
    pub pending_ds: Option<DeleteSet>,
}

impl Store {
    pub fn new(client_id: ClientID, options: Options) -> Self {
        Self {
            options,
            client_id,
            blocks: BlockStore::new(),
            types: HashMap::new(),
            pending: None,
            pending_ds: None,
        }
    }

    /// Clock of the next local block
    pub fn next_clock(&self) -> u32 {
        self.blocks.get_state(self.client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ItemContent;

    fn text(id: ID, origin: Option<ID>, s: &str) -> Item {
        Item::new(
            id,
            origin,
            None,
            Some(BranchId::Root("t".into())),
            None,
            ItemContent::String(s.to_string()),
        )
    }

    fn store_with_chain() -> BlockStore {
        // "abc" (1:0..3) followed by "de" (1:3..5), linked
        let mut store = BlockStore::new();
        let mut first = text(ID::new(1, 0), None, "abc");
        let mut second = text(ID::new(1, 3), Some(ID::new(1, 2)), "de");
        first.right = Some(second.id);
        second.left = Some(first.id);
        store.push_block(Block::Item(first));
        store.push_block(Block::Item(second));
        store
    }

    #[test]
    fn test_state_and_pivot() {
        let store = store_with_chain();
        assert_eq!(store.get_state(1), 5);
        assert_eq!(store.get_state(2), 0);
        assert_eq!(store.find_pivot(1, 0), Some(0));
        assert_eq!(store.find_pivot(1, 2), Some(0));
        assert_eq!(store.find_pivot(1, 3), Some(1));
        assert_eq!(store.find_pivot(1, 5), None);
    }

    #[test]
    fn test_find_missing() {
        let store = store_with_chain();
        assert_eq!(store.find(&ID::new(1, 4)).unwrap().id, ID::new(1, 3));
        assert_eq!(
            store.find(&ID::new(7, 0)).unwrap_err(),
            SyncError::NotFound(ID::new(7, 0))
        );
    }

    #[test]
    fn test_split_relinks_neighbours() {
        let mut store = store_with_chain();
        assert_eq!(store.split(&ID::new(1, 1)), Some(ID::new(1, 1)));

        assert_eq!(store.blocks(1).len(), 3);
        let mid = store.find(&ID::new(1, 1)).unwrap();
        assert_eq!(mid.id, ID::new(1, 1));
        assert_eq!(mid.left, Some(ID::new(1, 0)));
        assert_eq!(mid.right, Some(ID::new(1, 3)));
        assert_eq!(store.find(&ID::new(1, 3)).unwrap().left, Some(ID::new(1, 1)));
        // total coverage is unchanged
        assert_eq!(store.get_state(1), 5);
    }

    #[test]
    fn test_clean_end() {
        let mut store = store_with_chain();
        assert_eq!(store.get_item_clean_end(&ID::new(1, 0)), Some(ID::new(1, 0)));
        assert_eq!(store.find(&ID::new(1, 0)).unwrap().len, 1);
        // already clean
        assert_eq!(store.get_item_clean_end(&ID::new(1, 4)), Some(ID::new(1, 3)));
        assert_eq!(store.blocks(1).len(), 3);
    }

    #[test]
    fn test_squash_after_split() {
        let mut store = store_with_chain();
        store.split(&ID::new(1, 1));
        assert!(store.squash_left(1, 1));
        assert!(store.squash_left(1, 1));

        assert_eq!(store.blocks(1).len(), 1);
        let item = store.find(&ID::new(1, 0)).unwrap();
        assert_eq!(item.content, ItemContent::String("abcde".into()));
        assert_eq!(item.right, None);
    }

    #[test]
    fn test_gc_ranges_squash() {
        let mut store = store_with_chain();
        store.replace_with_gc(&ID::new(1, 0));
        store.replace_with_gc(&ID::new(1, 3));
        assert!(store.squash_left(1, 1));
        assert_eq!(store.blocks(1), &[Block::GC(GC::new(ID::new(1, 0), 5))]);
        assert!(store.find(&ID::new(1, 2)).is_err());
    }
}
