//! Collaborative array

use super::{BranchId, BranchRef, Input, Output};
use crate::block::Item;
use crate::error::{Result, SyncError};
use crate::transaction::Transaction;
use uuid::Uuid;

/// Handle to a shared array
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayRef(BranchRef);

impl From<BranchRef> for ArrayRef {
    fn from(branch: BranchRef) -> Self {
        ArrayRef(branch)
    }
}

impl ArrayRef {
    pub fn branch_id(&self) -> &BranchId {
        self.0.id()
    }

    pub fn len(&self, txn: &Transaction<'_>) -> u32 {
        self.0.len(txn)
    }

    pub fn is_empty(&self, txn: &Transaction<'_>) -> bool {
        self.len(txn) == 0
    }

    /// Value at `index`
    pub fn get(&self, txn: &Transaction<'_>, index: u32) -> Option<Output> {
        let mut remaining = index;
        for item in self.0.items(txn) {
            if remaining < item.len {
                return Output::from_item(self.0.doc, item, remaining);
            }
            remaining -= item.len;
        }
        None
    }

    /// Insert `values` before the element at `index`
    ///
    /// # Example
    ///
    /// ```rust
    /// use weave_core::{Doc, Input};
    ///
    /// let doc = Doc::with_client_id(1);
    /// let mut txn = doc.transact().unwrap();
    /// let array = txn.get_array("a").unwrap();
    /// array
    ///     .insert_range(&mut txn, 0, vec![Input::from(1i64), Input::from("two")])
    ///     .unwrap();
    /// assert_eq!(array.to_json(&txn), serde_json::json!([1, "two"]));
    /// ```
    pub fn insert_range(&self, txn: &mut Transaction<'_>, index: u32, values: Vec<Input>) -> Result<()> {
        self.0.check(txn)?;
        let len = self.len(txn);
        if index > len {
            return Err(SyncError::IndexOutOfBounds { index, len });
        }
        if values.is_empty() {
            return Ok(());
        }
        txn.insert_inputs(&self.0.id, index, values)
    }

    pub fn insert(&self, txn: &mut Transaction<'_>, index: u32, value: impl Into<Input>) -> Result<()> {
        self.insert_range(txn, index, vec![value.into()])
    }

    pub fn push_back(&self, txn: &mut Transaction<'_>, value: impl Into<Input>) -> Result<()> {
        let len = self.len(txn);
        self.insert(txn, len, value)
    }

    pub fn remove_range(&self, txn: &mut Transaction<'_>, index: u32, len: u32) -> Result<()> {
        self.0.check(txn)?;
        txn.remove_range(&self.0.id, index, len)
    }

    /// Values in order
    pub fn iter<'a>(&self, txn: &'a Transaction<'_>) -> ArrayIter<'a> {
        ArrayIter {
            doc: self.0.doc,
            items: self.0.items(txn).into_iter(),
            current: None,
            offset: 0,
        }
    }

    pub fn to_json(&self, txn: &Transaction<'_>) -> serde_json::Value {
        serde_json::Value::Array(self.iter(txn).map(|value| value.to_json(txn)).collect())
    }
}

/// Iterator over the live values of an array
pub struct ArrayIter<'a> {
    doc: Uuid,
    items: std::vec::IntoIter<&'a Item>,
    current: Option<&'a Item>,
    offset: u32,
}

impl Iterator for ArrayIter<'_> {
    type Item = Output;

    fn next(&mut self) -> Option<Output> {
        loop {
            match self.current {
                Some(item) if self.offset < item.len => {
                    let value = Output::from_item(self.doc, item, self.offset);
                    self.offset += 1;
                    if value.is_some() {
                        return value;
                    }
                }
                _ => {
                    self.current = Some(self.items.next()?);
                    self.offset = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::any::Any;
    use crate::types::{Input, Output};
    use crate::{Doc, SyncError};
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_insert_get_remove() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let array = txn.get_array("a").unwrap();
        array
            .insert_range(&mut txn, 0, vec![1i64.into(), 2i64.into(), 4i64.into()])
            .unwrap();
        array.insert(&mut txn, 2, 3i64).unwrap();
        array.push_back(&mut txn, true).unwrap();

        assert_eq!(array.len(&txn), 5);
        assert_eq!(array.get(&txn, 2), Some(Output::Any(Any::BigInt(3))));
        assert_eq!(array.get(&txn, 5), None);
        assert_eq!(array.to_json(&txn), json!([1, 2, 3, 4, true]));

        array.remove_range(&mut txn, 1, 3).unwrap();
        assert_eq!(array.to_json(&txn), json!([1, true]));
    }

    #[test]
    fn test_nested_values() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let array = txn.get_array("a").unwrap();
        let map = HashMap::from([("k".to_string(), Input::from("v"))]);
        array
            .insert_range(
                &mut txn,
                0,
                vec![
                    Input::Text("txt".into()),
                    Input::Map(map),
                    Input::Array(vec![Input::from(1.5)]),
                    Input::Binary(vec![1, 2]),
                ],
            )
            .unwrap();

        assert_eq!(array.len(&txn), 4);
        assert_eq!(
            array.to_json(&txn),
            json!(["txt", {"k": "v"}, [1.5], "AQI="])
        );

        let Some(Output::Text(text)) = array.get(&txn, 0) else {
            panic!("expected nested text");
        };
        text.insert(&mut txn, 3, "!").unwrap();
        assert_eq!(text.get_string(&txn), "txt!");
    }

    #[test]
    fn test_iter_skips_deleted() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let array = txn.get_array("a").unwrap();
        array
            .insert_range(&mut txn, 0, vec!["a".into(), "b".into(), "c".into()])
            .unwrap();
        array.remove_range(&mut txn, 1, 1).unwrap();

        let values: Vec<_> = array.iter(&txn).collect();
        assert_eq!(
            values,
            vec![
                Output::Any(Any::String("a".into())),
                Output::Any(Any::String("c".into())),
            ]
        );
    }

    #[test]
    fn test_out_of_bounds_insert() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let array = txn.get_array("a").unwrap();
        assert!(array.insert(&mut txn, 1, 1i64).is_err());
        assert!(array.is_empty(&txn));
    }

    #[test]
    fn test_empty_range_still_checks_index() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let array = txn.get_array("a").unwrap();
        array.push_back(&mut txn, 1i64).unwrap();
        assert_eq!(
            array.insert_range(&mut txn, 5, Vec::new()),
            Err(SyncError::IndexOutOfBounds { index: 5, len: 1 })
        );
        assert!(array.insert_range(&mut txn, 1, Vec::new()).is_ok());
        assert_eq!(array.len(&txn), 1);
    }
}
