//! Delete sets
//!
//! A compact record of tombstoned clock ranges, per peer. Deletions carry no
//! ids of their own, so updates ship the delete set of the sending replica
//! next to its blocks.

use crate::block::Block;
use crate::encoding::{Decode, Decoder, Encode, Encoder};
use crate::error::{Result, SyncError};
use crate::id::{ClientID, ID};
use crate::store::BlockStore;
use std::collections::BTreeMap;
use std::ops::Range;

/// Peer → deleted clock ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSet(BTreeMap<ClientID, Vec<Range<u32>>>);

impl DeleteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Record `len` deleted elements starting at `id`
    pub fn insert(&mut self, id: ID, len: u32) {
        if len == 0 {
            return;
        }
        self.0
            .entry(id.client)
            .or_default()
            .push(id.clock..id.clock + len);
    }

    /// Sort ranges and merge overlapping or adjacent ones
    pub fn squash(&mut self) {
        for ranges in self.0.values_mut() {
            ranges.sort_by_key(|range| range.start);
            let mut merged: Vec<Range<u32>> = Vec::with_capacity(ranges.len());
            for range in ranges.drain(..) {
                match merged.last_mut() {
                    Some(last) if range.start <= last.end => {
                        last.end = last.end.max(range.end);
                    }
                    _ => merged.push(range),
                }
            }
            *ranges = merged;
        }
        self.0.retain(|_, ranges| !ranges.is_empty());
    }

    /// Whether `id` falls into a deleted range. Expects a squashed set.
    pub fn is_deleted(&self, id: &ID) -> bool {
        let Some(ranges) = self.0.get(&id.client) else {
            return false;
        };
        let index = ranges.partition_point(|range| range.end <= id.clock);
        ranges
            .get(index)
            .is_some_and(|range| range.start <= id.clock)
    }

    pub fn merge(&mut self, other: DeleteSet) {
        for (client, ranges) in other.0 {
            self.0.entry(client).or_default().extend(ranges);
        }
        self.squash();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientID, &Vec<Range<u32>>)> {
        self.0.iter()
    }
}

impl From<&BlockStore> for DeleteSet {
    /// Collect tombstones and reclaimed ranges of a whole store
    fn from(store: &BlockStore) -> Self {
        let mut ds = DeleteSet::new();
        for client in store.clients() {
            for block in store.blocks(client) {
                let deleted = match block {
                    Block::Item(item) => item.deleted,
                    Block::GC(_) => true,
                };
                if deleted {
                    ds.insert(block.id(), block.len());
                }
            }
        }
        ds.squash();
        ds
    }
}

impl Encode for DeleteSet {
    fn encode(&self, encoder: &mut Encoder) {
        let clients: Vec<_> = self.0.iter().filter(|(_, r)| !r.is_empty()).collect();
        encoder.write_var_u64(clients.len() as u64);
        for (client, ranges) in clients {
            encoder.write_var_u64(*client);
            encoder.write_var_u64(ranges.len() as u64);
            for range in ranges {
                encoder.write_var_u32(range.start);
                encoder.write_var_u32(range.end - range.start);
            }
        }
    }
}

impl Decode for DeleteSet {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        let mut ds = DeleteSet::new();
        let clients = decoder.read_len()?;
        for _ in 0..clients {
            let client = decoder.read_var_u64()?;
            let ranges = decoder.read_len()?;
            for _ in 0..ranges {
                let clock = decoder.read_var_u32()?;
                let len = decoder.read_var_u32()?;
                if clock.checked_add(len).is_none() {
                    return Err(SyncError::Decode(format!(
                        "delete range {clock}+{len} overflows"
                    )));
                }
                ds.insert(ID::new(client, clock), len);
            }
        }
        ds.squash();
        Ok(ds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_squash_merges_adjacent() {
        let mut ds = DeleteSet::new();
        ds.insert(ID::new(1, 5), 2);
        ds.insert(ID::new(1, 0), 3);
        ds.insert(ID::new(1, 3), 2);
        ds.insert(ID::new(1, 10), 1);
        ds.squash();

        let ranges: Vec<_> = ds.iter().flat_map(|(_, r)| r.clone()).collect();
        assert_eq!(ranges, vec![0..7, 10..11]);
    }

    #[test]
    fn test_is_deleted() {
        let mut ds = DeleteSet::new();
        ds.insert(ID::new(1, 2), 3);
        ds.insert(ID::new(1, 8), 1);
        ds.squash();

        assert!(!ds.is_deleted(&ID::new(1, 1)));
        assert!(ds.is_deleted(&ID::new(1, 2)));
        assert!(ds.is_deleted(&ID::new(1, 4)));
        assert!(!ds.is_deleted(&ID::new(1, 5)));
        assert!(ds.is_deleted(&ID::new(1, 8)));
        assert!(!ds.is_deleted(&ID::new(2, 2)));
    }

    #[test]
    fn test_merge() {
        let mut a = DeleteSet::new();
        a.insert(ID::new(1, 0), 2);
        let mut b = DeleteSet::new();
        b.insert(ID::new(1, 1), 4);
        b.insert(ID::new(2, 0), 1);
        a.merge(b);

        assert!(a.is_deleted(&ID::new(1, 4)));
        assert!(a.is_deleted(&ID::new(2, 0)));
    }

    #[test]
    fn test_codec() {
        let mut ds = DeleteSet::new();
        ds.insert(ID::new(9, 100), 20);
        ds.insert(ID::new(3, 0), 1);
        ds.squash();

        let bytes = ds.encode_v1();
        assert_eq!(DeleteSet::decode_v1(&bytes).unwrap(), ds);
    }

    #[test]
    fn test_empty_insert_ignored() {
        let mut ds = DeleteSet::new();
        ds.insert(ID::new(1, 0), 0);
        assert!(ds.is_empty());
    }
}
