//! Collaborative map
//!
//! Every key holds a chain of writes sorted by `(clock, peer)`; the greatest
//! write is the value. Removing a key writes a tombstone that competes like
//! any other write, so a removal dated after a concurrent write hides it.

use super::{BranchId, BranchRef, Input, Output};
use crate::error::Result;
use crate::id::ID;
use crate::store::BlockStore;
use crate::transaction::Transaction;
use std::collections::hash_map;
use std::sync::Arc;
use uuid::Uuid;

/// Handle to a shared map
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapRef(BranchRef);

impl From<BranchRef> for MapRef {
    fn from(branch: BranchRef) -> Self {
        MapRef(branch)
    }
}

impl MapRef {
    pub fn branch_id(&self) -> &BranchId {
        self.0.id()
    }

    /// Number of live entries
    pub fn len(&self, txn: &Transaction<'_>) -> u32 {
        self.iter(txn).count() as u32
    }

    pub fn is_empty(&self, txn: &Transaction<'_>) -> bool {
        self.iter(txn).next().is_none()
    }

    pub fn get(&self, txn: &Transaction<'_>, key: &str) -> Option<Output> {
        let item = self.0.entry(txn, key)?;
        Output::from_item(self.0.doc, item, item.len - 1)
    }

    pub fn contains_key(&self, txn: &Transaction<'_>, key: &str) -> bool {
        self.0.entry(txn, key).is_some()
    }

    /// Set `key` to `value`, superseding the previous value
    ///
    /// # Example
    ///
    /// ```rust
    /// use weave_core::{Any, Doc, Output};
    ///
    /// let doc = Doc::with_client_id(1);
    /// let mut txn = doc.transact().unwrap();
    /// let map = txn.get_map("m").unwrap();
    /// map.insert(&mut txn, "title", "draft").unwrap();
    /// map.insert(&mut txn, "title", "final").unwrap();
    /// assert_eq!(map.get(&txn, "title"), Some(Output::Any(Any::from("final"))));
    /// ```
    pub fn insert(&self, txn: &mut Transaction<'_>, key: &str, value: impl Into<Input>) -> Result<()> {
        self.0.check(txn)?;
        txn.set_entry(&self.0.id, key, value.into())?;
        Ok(())
    }

    /// Remove `key`, returning the value it held
    pub fn remove(&self, txn: &mut Transaction<'_>, key: &str) -> Result<Option<Output>> {
        self.0.check(txn)?;
        let previous = self.get(txn, key);
        txn.remove_entry(&self.0.id, key)?;
        Ok(previous)
    }

    /// Remove every entry
    pub fn remove_all(&self, txn: &mut Transaction<'_>) -> Result<()> {
        self.0.check(txn)?;
        let keys: Vec<String> = self.iter(txn).map(|(key, _)| key.to_string()).collect();
        for key in keys {
            txn.remove_entry(&self.0.id, &key)?;
        }
        Ok(())
    }

    /// Live entries, in no particular order
    pub fn iter<'a>(&self, txn: &'a Transaction<'_>) -> MapIter<'a> {
        MapIter::new(&self.0, txn)
    }

    pub fn to_json(&self, txn: &Transaction<'_>) -> serde_json::Value {
        let object = self
            .iter(txn)
            .map(|(key, value)| (key.to_string(), value.to_json(txn)))
            .collect();
        serde_json::Value::Object(object)
    }
}

/// Iterator over the live entries of a map or of XML attributes
pub struct MapIter<'a> {
    doc: Uuid,
    blocks: &'a BlockStore,
    entries: Option<hash_map::Iter<'a, Arc<str>, ID>>,
}

impl<'a> MapIter<'a> {
    pub(crate) fn new(branch: &BranchRef, txn: &'a Transaction<'_>) -> Self {
        MapIter {
            doc: branch.doc,
            blocks: &txn.store().blocks,
            entries: branch.branch(txn).map(|branch| branch.map.iter()),
        }
    }
}

impl<'a> Iterator for MapIter<'a> {
    type Item = (&'a str, Output);

    fn next(&mut self) -> Option<Self::Item> {
        let entries = self.entries.as_mut()?;
        for (key, id) in entries {
            let Some(item) = self.blocks.get_item(id) else {
                continue;
            };
            if item.deleted {
                continue;
            }
            if let Some(value) = Output::from_item(self.doc, item, item.len - 1) {
                return Some((&**key, value));
            }
        }
        None
    }
}
