//! Transactions
//!
//! A [`Transaction`] is the only way to read or mutate a document. At most
//! one transaction can be open per [`Doc`] at a time; it holds exclusive
//! access to the document store until it is committed or dropped.
//!
//! # Integration
//!
//! Local edits and remote blocks follow the same path: a new item is linked
//! into its parent's sequence (or into the chain of its key) between its
//! left and right neighbours. When other items were concurrently inserted at
//! the same place, their origins decide the final order, so every replica
//! ends up with the same sequence regardless of delivery order:
//!
//! - items that share the new item's origin are ordered by peer id
//! - items whose origin lies inside the scanned conflict range stay next to
//!   their origin
//! - scanning stops at the first item that was inserted outside the range
//!
//! Keyed entries skip the scan: every key keeps its writes in a chain sorted
//! by `(clock, peer)`, and the rightmost write is the value. Removing a key
//! appends a tombstone write, so a removal competes like any other write.
//! Local writes first advance the peer's clock past the write they replace.
//!
//! # Commit
//!
//! On commit the delete set is squashed, deleted content is reclaimed
//! (unless disabled in [`Options`](crate::Options)), adjacent blocks are
//! merged back, and update observers receive the incremental update.

use crate::block::{Block, Item, ItemContent, GC};
use crate::delete_set::DeleteSet;
use crate::doc::Doc;
use crate::encoding::update::{write_blocks_since, Update};
use crate::encoding::{Decode, Encode, Encoder, FORMAT_VERSION};
use crate::error::{Result, SyncError};
use crate::id::{ClientID, ID};
use crate::state_vector::StateVector;
use crate::store::Store;
use crate::types::{Branch, BranchId, Input, TypeRef};
use std::cell::RefMut;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Exclusive read/write access to a document
pub struct Transaction<'doc> {
    doc: &'doc Doc,
    store: RefMut<'doc, Store>,

    /// State vector captured when the transaction started
    before_state: StateVector,

    /// Everything deleted by this transaction
    delete_set: DeleteSet,

    /// Right halves of blocks split by this transaction
    merge_blocks: Vec<ID>,

    committed: bool,
}

impl<'doc> Transaction<'doc> {
    pub(crate) fn new(doc: &'doc Doc, store: RefMut<'doc, Store>) -> Self {
        let before_state = store.blocks.get_state_vector();
        tracing::trace!(client = store.client_id, "transaction started");
        Self {
            doc,
            store,
            before_state,
            delete_set: DeleteSet::new(),
            merge_blocks: Vec::new(),
            committed: false,
        }
    }

    pub fn doc_guid(&self) -> Uuid {
        self.doc.guid()
    }

    pub fn client_id(&self) -> ClientID {
        self.store.client_id
    }

    pub fn before_state(&self) -> &StateVector {
        &self.before_state
    }

    pub fn delete_set(&self) -> &DeleteSet {
        &self.delete_set
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    /// Commit and release the document
    ///
    /// Dropping a transaction commits it as well.
    pub fn commit(mut self) {
        self.commit_inner();
    }

    fn commit_inner(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;

        self.delete_set.squash();
        let after_state = self.store.blocks.get_state_vector();
        if !self.store.options.skip_gc {
            self.collect_garbage();
        }
        self.squash_blocks(&after_state);

        let changed = after_state != self.before_state || !self.delete_set.is_empty();
        tracing::trace!(client = self.store.client_id, changed, "transaction committed");
        if !changed {
            return;
        }

        let observers = self.doc.update_observers();
        if observers.is_empty() {
            return;
        }
        let update = self.encode_update();
        for observer in observers {
            observer(&update);
        }
    }

    /// Incremental update: blocks created since `before_state` plus the
    /// deletions of this transaction
    fn encode_update(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(FORMAT_VERSION);
        write_blocks_since(&self.store.blocks, &self.before_state, &mut encoder);
        self.delete_set.encode(&mut encoder);
        encoder.into_bytes()
    }

    fn collect_garbage(&mut self) {
        let delete_set = self.delete_set.clone();
        for (&client, ranges) in delete_set.iter() {
            for range in ranges {
                let mut clock = range.start;
                while clock < range.end {
                    let Some(block) = self.store.blocks.get_block(&ID::new(client, clock)) else {
                        break;
                    };
                    let next = block.end_clock();
                    if let Block::Item(item) = block {
                        if item.deleted {
                            let id = item.id;
                            self.gc_item(&id, false);
                        }
                    }
                    clock = next;
                }
            }
        }
    }

    /// Drop the content of a deleted item. Children of a deleted type lose
    /// their item entirely since nothing can reference them anymore.
    fn gc_item(&mut self, id: &ID, parent_gc: bool) {
        let Some(item) = self.store.blocks.get_item(id) else {
            return;
        };
        if let ItemContent::Type(_) = item.content {
            let children = self.children(&BranchId::Nested(item.id), true);
            for child in children {
                self.gc_item(&child, true);
            }
            self.store.types.remove(&BranchId::Nested(*id));
        }

        if parent_gc {
            tracing::trace!(%id, "reclaimed item");
            self.store.blocks.replace_with_gc(id);
        } else if let Some(item) = self.store.blocks.get_item_mut(id) {
            item.content = ItemContent::Deleted(item.len);
        }
    }

    /// Start ids of a branch's sequence blocks and keyed entries
    ///
    /// With `history`, superseded entries of every key are included.
    fn children(&self, branch: &BranchId, history: bool) -> Vec<ID> {
        let Some(branch) = self.store.types.get(branch) else {
            return Vec::new();
        };
        let blocks = &self.store.blocks;
        let mut children = Vec::new();
        let mut next = branch.start;
        while let Some(id) = next {
            children.push(id);
            next = blocks.get_item(&id).and_then(|item| item.right);
        }
        for &id in branch.map.values() {
            let mut next = Some(id);
            while let Some(id) = next {
                children.push(id);
                if !history {
                    break;
                }
                next = blocks.get_item(&id).and_then(|item| item.left);
            }
        }
        children
    }

    fn squash_blocks(&mut self, after_state: &StateVector) {
        let blocks = &mut self.store.blocks;

        for (&client, ranges) in self.delete_set.iter() {
            for range in ranges.iter().rev() {
                let Some(pivot) = blocks.find_pivot(client, range.end - 1) else {
                    continue;
                };
                let last = blocks.blocks(client).len() - 1;
                let mut i = (pivot + 1).min(last);
                while i > 0 && blocks.blocks(client)[i].id().clock >= range.start {
                    blocks.squash_left(client, i);
                    i -= 1;
                }
            }
        }

        for (&client, &clock) in after_state.iter() {
            let before = self.before_state.get(&client);
            if before == clock {
                continue;
            }
            let first = blocks.find_pivot(client, before).unwrap_or(1).max(1);
            let mut i = blocks.blocks(client).len() - 1;
            while i >= first {
                blocks.squash_left(client, i);
                i -= 1;
            }
        }

        for id in self.merge_blocks.drain(..) {
            if let Some(pivot) = blocks.find_pivot(id.client, id.clock) {
                if pivot + 1 < blocks.blocks(id.client).len() {
                    blocks.squash_left(id.client, pivot + 1);
                }
                blocks.squash_left(id.client, pivot);
            }
        }
    }

    /// Split so that a block starts at `id`, remembering the split for commit
    fn split_at(&mut self, id: &ID) -> Option<ID> {
        let block = self.store.blocks.get_block(id)?;
        if block.id() != *id {
            self.merge_blocks.push(*id);
        }
        self.store.blocks.split(id)
    }

    /// Split so that a block ends at `id`, returning that block's start
    fn split_after(&mut self, id: &ID) -> Option<ID> {
        let block = self.store.blocks.get_block(id)?;
        let start = block.id();
        if id.clock + 1 < block.end_clock() {
            self.split_at(&ID::new(id.client, id.clock + 1))?;
        }
        Some(start)
    }

    /// Branch `id`, creating roots on demand
    ///
    /// Nested branches that were reclaimed fail with `NotFound`.
    fn ensure_branch(&mut self, id: &BranchId) -> Result<&Branch> {
        match id {
            BranchId::Root(_) => {
                let branch = self
                    .store
                    .types
                    .entry(id.clone())
                    .or_insert_with(|| Branch::new(id.clone(), TypeRef::Undefined));
                Ok(&*branch)
            }
            BranchId::Nested(item) => self.store.types.get(id).ok_or(SyncError::NotFound(*item)),
        }
    }

    /// Neighbours of the gap before the visible element at `index`
    fn find_position(&mut self, branch: &BranchId, index: u32) -> Result<(Option<ID>, Option<ID>)> {
        let current = self.ensure_branch(branch)?;
        let (len, start) = (current.block_len, current.start);
        if index > len {
            return Err(SyncError::IndexOutOfBounds { index, len });
        }

        let mut left = None;
        let mut next = start;
        let mut remaining = index;
        while remaining > 0 {
            let Some(id) = next else {
                break;
            };
            let Some(item) = self.store.blocks.get_item(&id) else {
                break;
            };
            let (visible, len, right) = (item.is_visible(), item.len, item.right);
            if visible {
                if remaining < len {
                    let split = ID::new(id.client, id.clock + remaining);
                    self.split_at(&split);
                    return Ok((Some(id), Some(split)));
                }
                remaining -= len;
            }
            left = Some(id);
            next = right;
        }
        Ok((left, next))
    }

    /// Create a local item between `left` and `right` and integrate it
    fn create_item(
        &mut self,
        parent: &BranchId,
        left: Option<ID>,
        right: Option<ID>,
        parent_sub: Option<Arc<str>>,
        content: ItemContent,
    ) -> ID {
        let id = ID::new(self.store.client_id, self.store.next_clock());
        let origin = left
            .and_then(|left| self.store.blocks.get_item(&left))
            .map(Item::last_id);
        let mut item = Item::new(id, origin, right, Some(parent.clone()), parent_sub, content);
        item.left = left;
        item.right = right;
        self.integrate(item);
        id
    }

    /// Insert a single content run at `index` of a sequence
    pub(crate) fn insert_content(&mut self, branch: &BranchId, index: u32, content: ItemContent) -> Result<ID> {
        let (left, right) = self.find_position(branch, index)?;
        Ok(self.create_item(branch, left, right, None, content))
    }

    /// Insert values at `index` of a sequence
    ///
    /// Consecutive primitive values share one item; binary values and nested
    /// types get an item each.
    pub(crate) fn insert_inputs(&mut self, branch: &BranchId, index: u32, values: Vec<Input>) -> Result<()> {
        let (mut left, right) = self.find_position(branch, index)?;
        let mut primitives = Vec::new();
        for value in values {
            match value {
                Input::Any(any) => primitives.push(any),
                nested => {
                    if !primitives.is_empty() {
                        let content = ItemContent::Any(std::mem::take(&mut primitives));
                        left = Some(self.create_item(branch, left, right, None, content));
                    }
                    let id = self.create_item(branch, left, right, None, nested.to_content());
                    self.fill_nested(id, nested)?;
                    left = Some(id);
                }
            }
        }
        if !primitives.is_empty() {
            self.create_item(branch, left, right, None, ItemContent::Any(primitives));
        }
        Ok(())
    }

    /// Populate a freshly integrated nested type from its input
    fn fill_nested(&mut self, id: ID, input: Input) -> Result<()> {
        let branch = BranchId::Nested(id);
        match input {
            Input::Text(s) | Input::XmlText(s) if !s.is_empty() => {
                self.insert_content(&branch, 0, ItemContent::String(s))?;
            }
            Input::Array(values) if !values.is_empty() => {
                self.insert_inputs(&branch, 0, values)?;
            }
            Input::Map(entries) => {
                let mut entries: Vec<_> = entries.into_iter().collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                for (key, value) in entries {
                    self.set_entry(&branch, &key, value)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Write `value` under `key`, superseding the current entry
    pub(crate) fn set_entry(&mut self, branch: &BranchId, key: &str, value: Input) -> Result<ID> {
        let content = value.to_content();
        let id = self.write_entry(branch, key, content)?;
        self.fill_nested(id, value)?;
        Ok(id)
    }

    /// Hide the live entry under `key` behind a dated tombstone
    ///
    /// Returns the id of the entry that was hidden.
    pub(crate) fn remove_entry(&mut self, branch: &BranchId, key: &str) -> Result<Option<ID>> {
        let Some(&latest) = self.ensure_branch(branch)?.map.get(key) else {
            return Ok(None);
        };
        if self.store.blocks.get_item(&latest).map_or(true, |item| item.deleted) {
            return Ok(None);
        }
        self.write_entry(branch, key, ItemContent::Deleted(1))?;
        Ok(Some(latest))
    }

    /// Append a keyed write that outranks every write seen for `key`
    fn write_entry(&mut self, branch: &BranchId, key: &str, content: ItemContent) -> Result<ID> {
        let latest = self.ensure_branch(branch)?.map.get(key).copied();
        if let Some(latest) = latest {
            self.advance_clock_past(latest);
        }
        Ok(self.create_item(branch, latest, None, Some(Arc::from(key)), content))
    }

    /// Fill the local clock up to `id` so the next local id sorts after it
    fn advance_clock_past(&mut self, id: ID) {
        let client = self.store.client_id;
        let next = self.store.next_clock();
        if ID::new(client, next) > id {
            return;
        }
        let gap = GC::new(ID::new(client, next), id.clock + 1 - next);
        tracing::trace!(client, skipped = gap.len, "clock advanced past keyed write");
        self.store.blocks.push_block(Block::GC(gap));
    }

    /// Delete `len` visible elements starting at `index`
    pub(crate) fn remove_range(&mut self, branch: &BranchId, index: u32, len: u32) -> Result<()> {
        let total = self.ensure_branch(branch)?.block_len;
        match index.checked_add(len) {
            Some(end) if end <= total => {}
            _ => return Err(SyncError::IndexOutOfBounds { index, len: total }),
        }
        if len == 0 {
            return Ok(());
        }

        let (_, mut next) = self.find_position(branch, index)?;
        let mut remaining = len;
        while remaining > 0 {
            let Some(id) = next else {
                break;
            };
            let Some(item) = self.store.blocks.get_item(&id) else {
                break;
            };
            if item.is_visible() {
                if remaining < item.len {
                    self.split_at(&ID::new(id.client, id.clock + remaining));
                }
                let deleted = self.store.blocks.find(&id)?.len;
                self.delete(&id);
                remaining -= deleted;
            }
            next = self.store.blocks.get_item(&id).and_then(|item| item.right);
        }
        Ok(())
    }

    /// Tombstone the item starting at `id`, and everything nested inside it
    ///
    /// Returns `false` if the item was already deleted or is unknown.
    pub(crate) fn delete(&mut self, id: &ID) -> bool {
        let store = &mut *self.store;
        let Some(item) = store.blocks.get_item_mut(id) else {
            return false;
        };
        if item.deleted {
            return false;
        }
        let counted = item.is_visible() && item.parent_sub.is_none();
        item.deleted = true;
        let (item_id, len, parent) = (item.id, item.len, item.parent.clone());
        let is_type = matches!(item.content, ItemContent::Type(_));

        if let (true, Some(parent)) = (counted, parent) {
            if let Some(branch) = store.types.get_mut(&parent) {
                branch.block_len -= len;
            }
        }
        self.delete_set.insert(item_id, len);

        if is_type {
            for child in self.children(&BranchId::Nested(item_id), false) {
                self.delete(&child);
            }
        }
        true
    }

    /// Link `item` into its parent and append it to the block store
    fn integrate(&mut self, mut item: Item) {
        let Some(parent) = item.parent.clone() else {
            self.store.blocks.push_block(Block::GC(GC::new(item.id, item.len)));
            return;
        };
        let parent_deleted = match &parent {
            BranchId::Nested(id) => self.store.blocks.get_item(id).map_or(true, |p| p.deleted),
            BranchId::Root(_) => false,
        };

        let (superseded, loses) = match item.parent_sub.clone() {
            Some(key) => self.link_entry(&mut item, &parent, key),
            None => {
                self.link_sequence(&mut item, &parent);
                (None, false)
            }
        };

        let store = &mut *self.store;
        match &item.content {
            ItemContent::Deleted(len) => {
                item.deleted = true;
                self.delete_set.insert(item.id, *len);
            }
            ItemContent::Type(type_ref) => {
                let id = BranchId::Nested(item.id);
                store
                    .types
                    .insert(id.clone(), Branch::new(id, type_ref.clone()));
            }
            _ => {}
        }

        if item.parent_sub.is_none() && item.is_visible() {
            if let Some(branch) = store.types.get_mut(&parent) {
                branch.block_len += item.len;
            }
        }

        let id = item.id;
        store.blocks.push_block(Block::Item(item));

        if let Some(previous) = superseded {
            self.delete(&previous);
        }
        if parent_deleted || loses {
            self.delete(&id);
        }
    }

    /// Link a sequence item next to its resolved left neighbour
    fn link_sequence(&mut self, item: &mut Item, parent: &BranchId) {
        let blocks = &self.store.blocks;
        let needs_scan = match item.left {
            None => match item.right {
                None => true,
                Some(right) => blocks.get_item(&right).is_some_and(|r| r.left.is_some()),
            },
            Some(left) => blocks.get_item(&left).map(|l| l.right) != Some(item.right),
        };
        if needs_scan {
            item.left = self.resolve_conflicts(item, parent);
        }

        let store = &mut *self.store;
        let left = match item.left {
            Some(left) => store.blocks.get_item_mut(&left),
            None => None,
        };
        if let Some(left) = left {
            item.right = left.right;
            left.right = Some(item.id);
        } else {
            item.left = None;
            item.right = store.types.get(parent).and_then(|b| b.start);
            if let Some(branch) = store.types.get_mut(parent) {
                branch.start = Some(item.id);
            }
        }

        let right = match item.right {
            Some(right) => store.blocks.get_item_mut(&right),
            None => None,
        };
        if let Some(right) = right {
            right.left = Some(item.id);
        }
    }

    /// Place a keyed write in its key chain, which stays sorted by id
    ///
    /// Returns the previous winner when `item` becomes the rightmost write,
    /// or `true` when an existing write outranks it.
    fn link_entry(&mut self, item: &mut Item, parent: &BranchId, key: Arc<str>) -> (Option<ID>, bool) {
        let store = &mut *self.store;
        let mut left = store.types.get(parent).and_then(|b| b.map.get(&key).copied());
        let mut right = None;
        while let Some(id) = left {
            let Some(current) = store.blocks.get_item(&id) else {
                break;
            };
            if current.id < item.id {
                break;
            }
            right = Some(id);
            left = current.left;
        }
        item.left = left;
        item.right = right;

        let left_item = match left {
            Some(left) => store.blocks.get_item_mut(&left),
            None => None,
        };
        if let Some(left_item) = left_item {
            left_item.right = Some(item.id);
        }
        let right_item = match right {
            Some(right) => store.blocks.get_item_mut(&right),
            None => None,
        };
        match right_item {
            Some(right_item) => {
                right_item.left = Some(item.id);
                (None, true)
            }
            None => {
                if let Some(branch) = store.types.get_mut(parent) {
                    branch.map.insert(key, item.id);
                }
                (left, false)
            }
        }
    }

    /// Final left neighbour of `item` among concurrently inserted siblings
    fn resolve_conflicts(&self, item: &Item, parent: &BranchId) -> Option<ID> {
        let blocks = &self.store.blocks;
        let branch = self.store.types.get(parent)?;

        let mut left = item.left;
        let mut next = match left {
            Some(left) => blocks.get_item(&left).and_then(|l| l.right),
            None => branch.start,
        };

        let mut conflicting = HashSet::new();
        let mut before_origin = HashSet::new();
        while let Some(id) = next {
            if Some(id) == item.right {
                break;
            }
            let Some(other) = blocks.get_item(&id) else {
                break;
            };
            before_origin.insert(id);
            conflicting.insert(id);

            if other.origin == item.origin {
                if other.id.client < item.id.client {
                    left = Some(id);
                    conflicting.clear();
                } else if other.right_origin == item.right_origin {
                    break;
                }
            } else if let Some(origin) = other.origin {
                match blocks.get_block(&origin).map(Block::id) {
                    Some(origin) if before_origin.contains(&origin) => {
                        if !conflicting.contains(&origin) {
                            left = Some(id);
                            conflicting.clear();
                        }
                    }
                    _ => break,
                }
            } else {
                break;
            }
            next = other.right;
        }
        left
    }

    /// Resolve neighbours and parent of a remote item
    ///
    /// Returns `false` when the item can no longer be placed because its
    /// surroundings were reclaimed; such an item is kept as a GC range.
    fn repair(&mut self, item: &mut Item) -> bool {
        if let Some(origin) = item.origin {
            item.left = self.split_after(&origin);
        }
        if let Some(right_origin) = item.right_origin {
            item.right = self.split_at(&right_origin);
        }

        let blocks = &self.store.blocks;
        let left = item.left.map(|id| blocks.get_item(&id));
        let right = item.right.map(|id| blocks.get_item(&id));
        if matches!(left, Some(None)) || matches!(right, Some(None)) {
            return false;
        }

        if item.parent.is_none() {
            match left.flatten().or(right.flatten()) {
                Some(neighbour) => {
                    item.parent = neighbour.parent.clone();
                    item.parent_sub = neighbour.parent_sub.clone();
                }
                None => return false,
            }
        }

        match &item.parent {
            Some(parent) => self.ensure_branch(parent).is_ok(),
            None => false,
        }
    }

    /// Integrate a remote block whose dependencies are all present
    fn integrate_remote(&mut self, block: Block) {
        match block {
            Block::GC(gc) => self.store.blocks.push_block(Block::GC(gc)),
            Block::Item(mut item) => {
                if self.repair(&mut item) {
                    self.integrate(item);
                } else {
                    let gc = GC::new(item.id, item.len);
                    self.store.blocks.push_block(Block::GC(gc));
                }
            }
        }
    }

    /// First dependency of `block` that is not known locally
    ///
    /// `offset` is the number of leading elements already integrated.
    fn missing_dependency(&self, block: &Block, offset: u32) -> Option<ID> {
        let Block::Item(item) = block else {
            return None;
        };
        let origin = if offset == 0 { item.origin } else { None };
        let parent = match &item.parent {
            Some(BranchId::Nested(id)) => Some(*id),
            _ => None,
        };
        [origin, item.right_origin, parent]
            .into_iter()
            .flatten()
            .find(|id| !self.store.blocks.contains(id))
    }

    /// Integrate a single remote block
    ///
    /// Fails with `CausalGap` if the block does not directly follow its
    /// peer's known blocks or references an unknown id. Already known
    /// elements are skipped.
    pub fn integrate_block(&mut self, mut block: Block) -> Result<()> {
        let id = block.id();
        let state = self.store.blocks.get_state(id.client);
        if block.end_clock() <= state {
            return Ok(());
        }
        if id.clock > state {
            return Err(SyncError::CausalGap(ID::new(id.client, state)));
        }
        let offset = state - id.clock;
        if let Some(missing) = self.missing_dependency(&block, offset) {
            return Err(SyncError::CausalGap(missing));
        }
        block.trim_front(offset);
        self.integrate_remote(block);
        Ok(())
    }

    /// Decode and apply a binary update
    ///
    /// Nothing is applied if the payload is malformed. Blocks with missing
    /// causal predecessors are buffered and retried on later updates.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<()> {
        let update = Update::decode_v1(bytes).inspect_err(|error| {
            tracing::warn!(%error, len = bytes.len(), "failed to decode update");
        })?;
        self.apply(update);
        Ok(())
    }

    /// Apply a decoded update
    pub fn apply(&mut self, mut update: Update) {
        if let Some(pending) = self.store.pending.take() {
            tracing::debug!(blocks = pending.block_count(), "retrying pending blocks");
            update.merge(pending);
        }
        let Update { mut blocks, delete_set } = update;

        let mut integrated = 0usize;
        let mut progress = true;
        while progress {
            progress = false;
            for (&client, queue) in blocks.iter_mut() {
                while let Some(block) = queue.front() {
                    let state = self.store.blocks.get_state(client);
                    let start = block.id().clock;
                    if block.end_clock() <= state {
                        queue.pop_front();
                        continue;
                    }
                    if start > state {
                        break;
                    }
                    let offset = state - start;
                    if self.missing_dependency(block, offset).is_some() {
                        break;
                    }
                    let Some(mut block) = queue.pop_front() else {
                        break;
                    };
                    block.trim_front(offset);
                    self.integrate_remote(block);
                    integrated += 1;
                    progress = true;
                }
            }
        }

        blocks.retain(|_, queue| !queue.is_empty());
        let pending = Update {
            blocks,
            delete_set: DeleteSet::new(),
        };
        let buffered = pending.block_count();
        self.store.pending = (!pending.is_empty()).then_some(pending);

        let mut delete_set = delete_set;
        if let Some(pending_ds) = self.store.pending_ds.take() {
            delete_set.merge(pending_ds);
        }
        let unapplied = self.apply_delete_set(&delete_set);
        self.store.pending_ds = (!unapplied.is_empty()).then_some(unapplied);

        tracing::debug!(integrated, buffered, "applied update");
    }

    /// Tombstone every known item covered by `delete_set`
    ///
    /// Returns the ranges that target blocks not received yet.
    fn apply_delete_set(&mut self, delete_set: &DeleteSet) -> DeleteSet {
        let mut unapplied = DeleteSet::new();
        for (&client, ranges) in delete_set.iter() {
            let state = self.store.blocks.get_state(client);
            for range in ranges {
                if range.end > state {
                    let from = range.start.max(state);
                    unapplied.insert(ID::new(client, from), range.end - from);
                }
                let end = range.end.min(state);
                let mut clock = range.start;
                while clock < end {
                    let id = ID::new(client, clock);
                    let Some(block) = self.store.blocks.get_block(&id) else {
                        break;
                    };
                    if block.is_deleted() {
                        clock = block.end_clock();
                        continue;
                    }
                    let block_end = block.end_clock();
                    self.split_at(&id);
                    if block_end > end {
                        self.split_at(&ID::new(client, end));
                    }
                    self.delete(&id);
                    clock = block_end.min(end);
                }
            }
        }
        unapplied.squash();
        unapplied
    }

    pub fn state_vector(&self) -> StateVector {
        self.store.blocks.get_state_vector()
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Update with everything `remote` has not seen yet, plus all deletions
    pub fn diff(&self, remote: &StateVector) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(FORMAT_VERSION);
        write_blocks_since(&self.store.blocks, remote, &mut encoder);
        DeleteSet::from(&self.store.blocks).encode(&mut encoder);
        encoder.into_bytes()
    }

    /// Like [`diff`](Self::diff) for an encoded state vector
    ///
    /// An empty slice asks for a full snapshot.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let remote = if remote_state_vector.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(remote_state_vector)?
        };
        Ok(self.diff(&remote))
    }

    /// Whether remote data is waiting for missing predecessors
    pub fn has_pending(&self) -> bool {
        self.store.pending.is_some() || self.store.pending_ds.is_some()
    }

    /// Buffered remote data, encoded as an update
    pub fn pending_update(&self) -> Option<Vec<u8>> {
        let mut update = self.store.pending.clone().unwrap_or_default();
        if let Some(ds) = &self.store.pending_ds {
            update.delete_set.merge(ds.clone());
        }
        (!update.is_empty()).then(|| update.encode_v1())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.commit_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Options;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn sync(from: &Doc, to: &Doc) {
        let sv = to.transact().unwrap().encode_state_vector();
        let update = from.transact().unwrap().encode_diff(&sv).unwrap();
        to.transact().unwrap().apply_update(&update).unwrap();
    }

    #[test]
    fn test_local_insert_and_remove() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let text = txn.get_text("t").unwrap();
        text.insert(&mut txn, 0, "hello").unwrap();
        text.insert(&mut txn, 5, " world").unwrap();
        text.insert(&mut txn, 5, ",").unwrap();
        assert_eq!(text.get_string(&txn), "hello, world");

        text.remove_range(&mut txn, 0, 7).unwrap();
        assert_eq!(text.get_string(&txn), "world");
        assert_eq!(text.len(&txn), 5);
    }

    #[test]
    fn test_out_of_bounds() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let text = txn.get_text("t").unwrap();
        text.insert(&mut txn, 0, "abc").unwrap();

        assert_eq!(
            text.insert(&mut txn, 4, "x").unwrap_err(),
            SyncError::IndexOutOfBounds { index: 4, len: 3 }
        );
        assert!(text.remove_range(&mut txn, 2, 2).is_err());
        assert_eq!(text.get_string(&txn), "abc");
    }

    #[test]
    fn test_commit_squashes_blocks() {
        let doc = Doc::with_client_id(1);
        {
            let mut txn = doc.transact().unwrap();
            let text = txn.get_text("t").unwrap();
            for (i, c) in "abcdef".chars().enumerate() {
                text.insert(&mut txn, i as u32, &c.to_string()).unwrap();
            }
            assert_eq!(txn.store().blocks.blocks(1).len(), 6);
        }
        let txn = doc.transact().unwrap();
        assert_eq!(txn.store().blocks.blocks(1).len(), 1);
    }

    #[test]
    fn test_split_and_rejoin() {
        let doc = Doc::with_client_id(1);
        {
            let mut txn = doc.transact().unwrap();
            let text = txn.get_text("t").unwrap();
            text.insert(&mut txn, 0, "abcdef").unwrap();
        }
        {
            let mut txn = doc.transact().unwrap();
            let text = txn.get_text("t").unwrap();
            text.remove_range(&mut txn, 2, 2).unwrap();
            assert_eq!(text.get_string(&txn), "abef");
        }
        let txn = doc.transact().unwrap();
        // "ab", tombstone "cd", "ef"
        let blocks = txn.store().blocks.blocks(1);
        assert_eq!(blocks.len(), 3);
        assert!(blocks[1].is_deleted());
        assert_eq!(
            blocks[1].as_item().map(|i| &i.content),
            Some(&ItemContent::Deleted(2))
        );
    }

    #[test]
    fn test_concurrent_transaction() {
        let doc = Doc::with_client_id(1);
        let _txn = doc.transact().unwrap();
        assert_eq!(doc.transact().err(), Some(SyncError::ConcurrentTransaction));
    }

    #[test]
    fn test_handle_of_other_document() {
        let a = Doc::with_client_id(1);
        let b = Doc::with_client_id(2);
        let text = a.transact().unwrap().get_text("t").unwrap();

        let mut txn = b.transact().unwrap();
        assert_eq!(
            text.insert(&mut txn, 0, "x").unwrap_err(),
            SyncError::NoActiveTransaction
        );
    }

    #[test]
    fn test_integrate_block_causal_gap() {
        let a = Doc::with_client_id(1);
        {
            let mut txn = a.transact().unwrap();
            let text = txn.get_text("t").unwrap();
            text.insert(&mut txn, 0, "ab").unwrap();
        }
        {
            let mut txn = a.transact().unwrap();
            let text = txn.get_text("t").unwrap();
            text.insert(&mut txn, 0, "c").unwrap();
        }
        let second = a
            .transact()
            .unwrap()
            .store()
            .blocks
            .blocks(1)
            .last()
            .cloned()
            .unwrap();

        let b = Doc::with_client_id(2);
        let mut txn = b.transact().unwrap();
        let err = txn.integrate_block(second).unwrap_err();
        assert_eq!(err, SyncError::CausalGap(ID::new(1, 0)));
    }

    #[test]
    fn test_pending_until_predecessor_arrives() {
        let a = Doc::with_client_id(1);
        let b = Doc::with_client_id(2);

        let first = {
            let mut txn = a.transact().unwrap();
            let text = txn.get_text("t").unwrap();
            text.insert(&mut txn, 0, "ab").unwrap();
            txn.diff(&StateVector::default())
        };
        let sv = a.transact().unwrap().state_vector();
        {
            let mut txn = a.transact().unwrap();
            let text = txn.get_text("t").unwrap();
            text.insert(&mut txn, 2, "cd").unwrap();
        }
        let second = a.transact().unwrap().diff(&sv);

        let mut txn = b.transact().unwrap();
        txn.apply_update(&second).unwrap();
        assert!(txn.has_pending());
        assert!(txn.pending_update().is_some());
        let text = txn.get_text("t").unwrap();
        assert_eq!(text.get_string(&txn), "");

        txn.apply_update(&first).unwrap();
        assert!(!txn.has_pending());
        assert_eq!(text.get_string(&txn), "abcd");
    }

    #[test]
    fn test_delete_before_insert_is_buffered() {
        let a = Doc::with_client_id(1);
        let b = Doc::with_client_id(2);
        let insert = {
            let mut txn = a.transact().unwrap();
            let text = txn.get_text("t").unwrap();
            text.insert(&mut txn, 0, "abc").unwrap();
            txn.diff(&StateVector::default())
        };
        let sv = a.transact().unwrap().state_vector();
        {
            let mut txn = a.transact().unwrap();
            let text = txn.get_text("t").unwrap();
            text.remove_range(&mut txn, 1, 1).unwrap();
        }
        let delete = a.transact().unwrap().diff(&sv);

        let mut txn = b.transact().unwrap();
        txn.apply_update(&delete).unwrap();
        assert!(txn.has_pending());
        txn.apply_update(&insert).unwrap();
        let text = txn.get_text("t").unwrap();
        assert_eq!(text.get_string(&txn), "ac");
        assert!(!txn.has_pending());
    }

    #[test]
    fn test_update_observer_receives_delta() {
        let a = Doc::with_client_id(1);
        let b = Doc::with_client_id(2);
        let updates = Rc::new(RefCell::new(Vec::new()));
        let sink = updates.clone();
        let sub = a.observe_update(move |update| sink.borrow_mut().push(update.to_vec()));

        {
            let mut txn = a.transact().unwrap();
            let text = txn.get_text("t").unwrap();
            text.insert(&mut txn, 0, "hi").unwrap();
        }
        // read-only transaction emits nothing
        drop(a.transact().unwrap());
        assert_eq!(updates.borrow().len(), 1);

        {
            let mut txn = b.transact().unwrap();
            txn.apply_update(&updates.borrow()[0]).unwrap();
            let text = txn.get_text("t").unwrap();
            assert_eq!(text.get_string(&txn), "hi");
        }

        assert!(a.unobserve_update(sub));
        {
            let mut txn = a.transact().unwrap();
            let text = txn.get_text("t").unwrap();
            text.insert(&mut txn, 2, "!").unwrap();
        }
        assert_eq!(updates.borrow().len(), 1);
    }

    #[test]
    fn test_nested_type_gc() {
        let a = Doc::with_client_id(1);
        {
            let mut txn = a.transact().unwrap();
            let array = txn.get_array("a").unwrap();
            array
                .insert_range(&mut txn, 0, vec![Input::Text("nested".into())])
                .unwrap();
        }
        {
            let mut txn = a.transact().unwrap();
            let array = txn.get_array("a").unwrap();
            array.remove_range(&mut txn, 0, 1).unwrap();
        }
        let txn = a.transact().unwrap();
        // the text item itself keeps a tombstone, its content is reclaimed
        assert!(txn.store().types.get(&BranchId::Nested(ID::new(1, 0))).is_none());
        assert!(txn.store().blocks.find(&ID::new(1, 1)).is_err());
        assert_eq!(txn.store().blocks.get_state(1), 7);
    }

    #[test]
    fn test_skip_gc_keeps_content() {
        let mut options = Options::with_client_id(1);
        options.skip_gc = true;
        let doc = Doc::with_options(options);
        {
            let mut txn = doc.transact().unwrap();
            let text = txn.get_text("t").unwrap();
            text.insert(&mut txn, 0, "abc").unwrap();
            text.remove_range(&mut txn, 0, 3).unwrap();
        }
        let txn = doc.transact().unwrap();
        let item = txn.store().blocks.find(&ID::new(1, 0)).unwrap();
        assert!(item.deleted);
        assert_eq!(item.content, ItemContent::String("abc".into()));
    }

    #[test]
    fn test_apply_twice_is_noop() {
        let a = Doc::with_client_id(1);
        let b = Doc::with_client_id(2);
        {
            let mut txn = a.transact().unwrap();
            let text = txn.get_text("t").unwrap();
            text.insert(&mut txn, 0, "abc").unwrap();
            text.remove_range(&mut txn, 1, 1).unwrap();
        }
        sync(&a, &b);
        let before = b.transact().unwrap().diff(&StateVector::default());
        sync(&a, &b);
        let after = b.transact().unwrap().diff(&StateVector::default());
        assert_eq!(before, after);
    }

    #[test]
    fn test_remove_entry_writes_tombstone() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let map = txn.get_map("m").unwrap();
        map.insert(&mut txn, "k", "v").unwrap();
        map.remove(&mut txn, "k").unwrap();

        let branch = txn.store().types.get(&BranchId::Root("m".into())).unwrap();
        assert_eq!(branch.map.get("k"), Some(&ID::new(1, 1)));
        let tombstone = txn.store().blocks.get_item(&ID::new(1, 1)).unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.origin, Some(ID::new(1, 0)));
        assert!(txn.delete_set().is_deleted(&ID::new(1, 0)));
        assert!(txn.delete_set().is_deleted(&ID::new(1, 1)));
    }

    #[test]
    fn test_keyed_write_advances_clock_past_latest() {
        let a = Doc::with_client_id(2);
        let b = Doc::with_client_id(1);
        {
            let mut txn = a.transact().unwrap();
            let map = txn.get_map("m").unwrap();
            for key in ["v", "w", "x", "y", "z", "k"] {
                map.insert(&mut txn, key, key).unwrap();
            }
        }
        sync(&a, &b);
        {
            let mut txn = b.transact().unwrap();
            let map = txn.get_map("m").unwrap();
            map.insert(&mut txn, "k", "mine").unwrap();
        }

        let txn = b.transact().unwrap();
        assert_eq!(txn.store().blocks.get_state(1), 7);
        assert!(matches!(txn.store().blocks.blocks(1)[0], Block::GC(_)));
        let branch = txn.store().types.get(&BranchId::Root("m".into())).unwrap();
        assert_eq!(branch.map.get("k"), Some(&ID::new(1, 6)));
        assert!(txn.store().blocks.get_item(&ID::new(2, 5)).unwrap().deleted);
    }

    #[test]
    fn test_write_without_local_gap_keeps_clock() {
        let a = Doc::with_client_id(1);
        let b = Doc::with_client_id(2);
        {
            let mut txn = a.transact().unwrap();
            let map = txn.get_map("m").unwrap();
            map.insert(&mut txn, "k", 1i64).unwrap();
        }
        sync(&a, &b);
        {
            let mut txn = b.transact().unwrap();
            let map = txn.get_map("m").unwrap();
            map.insert(&mut txn, "k", 2i64).unwrap();
        }
        // (0, 2) already sorts after (0, 1)
        let txn = b.transact().unwrap();
        assert_eq!(txn.store().blocks.get_state(2), 1);
    }
}
