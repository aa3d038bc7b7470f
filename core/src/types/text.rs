//! Collaborative text
//!
//! Indexes and lengths count Unicode scalar values.

use super::{BranchId, BranchRef};
use crate::block::ItemContent;
use crate::error::{Result, SyncError};
use crate::transaction::Transaction;

/// Handle to a shared text
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextRef(BranchRef);

impl From<BranchRef> for TextRef {
    fn from(branch: BranchRef) -> Self {
        TextRef(branch)
    }
}

impl TextRef {
    pub fn branch_id(&self) -> &BranchId {
        self.0.id()
    }

    pub fn len(&self, txn: &Transaction<'_>) -> u32 {
        self.0.len(txn)
    }

    pub fn is_empty(&self, txn: &Transaction<'_>) -> bool {
        self.len(txn) == 0
    }

    pub fn get_string(&self, txn: &Transaction<'_>) -> String {
        text_content(&self.0, txn)
    }

    /// Insert `chunk` before the character at `index`
    ///
    /// # Example
    ///
    /// ```rust
    /// use weave_core::Doc;
    ///
    /// let doc = Doc::with_client_id(1);
    /// let mut txn = doc.transact().unwrap();
    /// let text = txn.get_text("t").unwrap();
    /// text.insert(&mut txn, 0, "wrld").unwrap();
    /// text.insert(&mut txn, 1, "o").unwrap();
    /// assert_eq!(text.get_string(&txn), "world");
    /// ```
    pub fn insert(&self, txn: &mut Transaction<'_>, index: u32, chunk: &str) -> Result<()> {
        insert_text(&self.0, txn, index, chunk)
    }

    /// Append `chunk` at the end
    pub fn push(&self, txn: &mut Transaction<'_>, chunk: &str) -> Result<()> {
        let len = self.len(txn);
        self.insert(txn, len, chunk)
    }

    /// Remove `len` characters starting at `index`
    pub fn remove_range(&self, txn: &mut Transaction<'_>, index: u32, len: u32) -> Result<()> {
        self.0.check(txn)?;
        txn.remove_range(&self.0.id, index, len)
    }
}

pub(crate) fn text_content(branch: &BranchRef, txn: &Transaction<'_>) -> String {
    let mut out = String::new();
    for item in branch.items(txn) {
        if let ItemContent::String(s) = &item.content {
            out.push_str(s);
        }
    }
    out
}

pub(crate) fn insert_text(
    branch: &BranchRef,
    txn: &mut Transaction<'_>,
    index: u32,
    chunk: &str,
) -> Result<()> {
    branch.check(txn)?;
    let len = branch.len(txn);
    if index > len {
        return Err(SyncError::IndexOutOfBounds { index, len });
    }
    if chunk.is_empty() {
        return Ok(());
    }
    txn.insert_content(&branch.id, index, ItemContent::String(chunk.to_string()))?;
    Ok(())
}
