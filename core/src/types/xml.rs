//! XML tree
//!
//! Elements and text nodes are items of their parent element's sequence.
//! Attributes of both kinds of node are keyed entries resolved like map
//! values. Deleted nodes are skipped by every traversal, but keep their
//! place in the sequence so concurrent inserts next to them still land
//! where they were aimed.

use super::map::MapIter;
use super::text::{insert_text, text_content};
use super::{BranchId, BranchRef, Input, TypeRef, ROOT_XML_TAG};
use crate::any::Any;
use crate::block::{Item, ItemContent};
use crate::error::Result;
use crate::id::ID;
use crate::store::Store;
use crate::transaction::Transaction;
use std::fmt::Write;
use uuid::Uuid;

/// A node of an XML tree
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum XmlNode {
    Element(XmlElementRef),
    Text(XmlTextRef),
}

impl XmlNode {
    fn from_item(doc: Uuid, item: &Item) -> Option<XmlNode> {
        if item.deleted {
            return None;
        }
        let branch = BranchRef::new(doc, BranchId::Nested(item.id));
        match &item.content {
            ItemContent::Type(TypeRef::XmlElement(_)) => Some(XmlNode::Element(XmlElementRef(branch))),
            ItemContent::Type(TypeRef::XmlText) => Some(XmlNode::Text(XmlTextRef(branch))),
            _ => None,
        }
    }

    fn branch(&self) -> &BranchRef {
        match self {
            XmlNode::Element(elem) => &elem.0,
            XmlNode::Text(text) => &text.0,
        }
    }

    pub fn branch_id(&self) -> &BranchId {
        self.branch().id()
    }

    pub fn get_string(&self, txn: &Transaction<'_>) -> String {
        match self {
            XmlNode::Element(elem) => elem.get_string(txn),
            XmlNode::Text(text) => text.get_string(txn),
        }
    }

    pub fn as_element(&self) -> Option<&XmlElementRef> {
        match self {
            XmlNode::Element(elem) => Some(elem),
            XmlNode::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&XmlTextRef> {
        match self {
            XmlNode::Text(text) => Some(text),
            XmlNode::Element(_) => None,
        }
    }
}

/// Handle to an XML element
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XmlElementRef(BranchRef);

impl From<BranchRef> for XmlElementRef {
    fn from(branch: BranchRef) -> Self {
        XmlElementRef(branch)
    }
}

impl XmlElementRef {
    pub fn branch_id(&self) -> &BranchId {
        self.0.id()
    }

    pub fn tag(&self, txn: &Transaction<'_>) -> String {
        match self.0.branch(txn).map(|branch| &branch.type_ref) {
            Some(TypeRef::XmlElement(tag)) => tag.to_string(),
            _ => ROOT_XML_TAG.to_string(),
        }
    }

    /// Number of child nodes
    pub fn child_len(&self, txn: &Transaction<'_>) -> u32 {
        self.0.len(txn)
    }

    pub fn first_child(&self, txn: &Transaction<'_>) -> Option<XmlNode> {
        self.get(txn, 0)
    }

    pub fn get(&self, txn: &Transaction<'_>, index: u32) -> Option<XmlNode> {
        let item = *self.0.items(txn).get(index as usize)?;
        XmlNode::from_item(self.0.doc, item)
    }

    pub fn children(&self, txn: &Transaction<'_>) -> Vec<XmlNode> {
        self.0
            .items(txn)
            .into_iter()
            .filter_map(|item| XmlNode::from_item(self.0.doc, item))
            .collect()
    }

    /// Insert a new element with `tag` at `index`
    pub fn insert_elem(&self, txn: &mut Transaction<'_>, index: u32, tag: &str) -> Result<XmlElementRef> {
        self.0.check(txn)?;
        let content = ItemContent::Type(TypeRef::XmlElement(tag.into()));
        let id = txn.insert_content(&self.0.id, index, content)?;
        Ok(XmlElementRef(BranchRef::new(self.0.doc, BranchId::Nested(id))))
    }

    /// Insert a new, empty text node at `index`
    pub fn insert_text(&self, txn: &mut Transaction<'_>, index: u32) -> Result<XmlTextRef> {
        self.0.check(txn)?;
        let id = txn.insert_content(&self.0.id, index, ItemContent::Type(TypeRef::XmlText))?;
        Ok(XmlTextRef(BranchRef::new(self.0.doc, BranchId::Nested(id))))
    }

    pub fn push_elem_back(&self, txn: &mut Transaction<'_>, tag: &str) -> Result<XmlElementRef> {
        let len = self.child_len(txn);
        self.insert_elem(txn, len, tag)
    }

    pub fn push_text_back(&self, txn: &mut Transaction<'_>) -> Result<XmlTextRef> {
        let len = self.child_len(txn);
        self.insert_text(txn, len)
    }

    /// Remove `len` child nodes starting at `index`
    pub fn remove_range(&self, txn: &mut Transaction<'_>, index: u32, len: u32) -> Result<()> {
        self.0.check(txn)?;
        txn.remove_range(&self.0.id, index, len)
    }

    pub fn get_attribute(&self, txn: &Transaction<'_>, name: &str) -> Option<String> {
        get_attribute(&self.0, txn, name)
    }

    pub fn insert_attribute(&self, txn: &mut Transaction<'_>, name: &str, value: &str) -> Result<()> {
        insert_attribute(&self.0, txn, name, value)
    }

    pub fn remove_attribute(&self, txn: &mut Transaction<'_>, name: &str) -> Result<()> {
        self.0.check(txn)?;
        txn.remove_entry(&self.0.id, name)?;
        Ok(())
    }

    /// Attributes, in no particular order
    pub fn attributes<'a>(&self, txn: &'a Transaction<'_>) -> Attributes<'a> {
        Attributes(MapIter::new(&self.0, txn))
    }

    pub fn next_sibling(&self, txn: &Transaction<'_>) -> Option<XmlNode> {
        sibling(&self.0, txn, Direction::Next)
    }

    pub fn prev_sibling(&self, txn: &Transaction<'_>) -> Option<XmlNode> {
        sibling(&self.0, txn, Direction::Prev)
    }

    pub fn parent(&self, txn: &Transaction<'_>) -> Option<XmlElementRef> {
        parent(&self.0, txn)
    }

    /// Flat XML serialization, attributes sorted by name
    ///
    /// # Example
    ///
    /// ```rust
    /// use weave_core::Doc;
    ///
    /// let doc = Doc::with_client_id(1);
    /// let mut txn = doc.transact().unwrap();
    /// let root = txn.get_xml_element("doc").unwrap();
    /// let p = root.insert_elem(&mut txn, 0, "p").unwrap();
    /// p.insert_attribute(&mut txn, "class", "lead").unwrap();
    /// let text = p.insert_text(&mut txn, 0).unwrap();
    /// text.insert(&mut txn, 0, "hi").unwrap();
    ///
    /// assert_eq!(
    ///     root.get_string(&txn),
    ///     r#"<UNDEFINED><p class="lead">hi</p></UNDEFINED>"#
    /// );
    /// ```
    pub fn get_string(&self, txn: &Transaction<'_>) -> String {
        let tag = self.tag(txn);
        let mut attributes: Vec<_> = self.attributes(txn).collect();
        attributes.sort();

        let mut out = format!("<{tag}");
        for (name, value) in attributes {
            let _ = write!(out, " {name}=\"{value}\"");
        }
        out.push('>');
        for child in self.children(txn) {
            out.push_str(&child.get_string(txn));
        }
        let _ = write!(out, "</{tag}>");
        out
    }

    /// Depth-first walk over all live descendants
    pub fn tree_walker<'a>(&self, txn: &'a Transaction<'_>) -> TreeWalker<'a> {
        let store = txn.store();
        let next = if txn.doc_guid() == self.0.doc {
            first_child(store, &self.0.id)
        } else {
            None
        };
        TreeWalker {
            store,
            doc: self.0.doc,
            root: self.0.id.clone(),
            next,
        }
    }
}

/// Handle to an XML text node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XmlTextRef(BranchRef);

impl From<BranchRef> for XmlTextRef {
    fn from(branch: BranchRef) -> Self {
        XmlTextRef(branch)
    }
}

impl XmlTextRef {
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

    pub fn insert(&self, txn: &mut Transaction<'_>, index: u32, chunk: &str) -> Result<()> {
        insert_text(&self.0, txn, index, chunk)
    }

    pub fn push(&self, txn: &mut Transaction<'_>, chunk: &str) -> Result<()> {
        let len = self.len(txn);
        self.insert(txn, len, chunk)
    }

    pub fn remove_range(&self, txn: &mut Transaction<'_>, index: u32, len: u32) -> Result<()> {
        self.0.check(txn)?;
        txn.remove_range(&self.0.id, index, len)
    }

    pub fn get_attribute(&self, txn: &Transaction<'_>, name: &str) -> Option<String> {
        get_attribute(&self.0, txn, name)
    }

    pub fn insert_attribute(&self, txn: &mut Transaction<'_>, name: &str, value: &str) -> Result<()> {
        insert_attribute(&self.0, txn, name, value)
    }

    pub fn remove_attribute(&self, txn: &mut Transaction<'_>, name: &str) -> Result<()> {
        self.0.check(txn)?;
        txn.remove_entry(&self.0.id, name)?;
        Ok(())
    }

    pub fn attributes<'a>(&self, txn: &'a Transaction<'_>) -> Attributes<'a> {
        Attributes(MapIter::new(&self.0, txn))
    }

    pub fn next_sibling(&self, txn: &Transaction<'_>) -> Option<XmlNode> {
        sibling(&self.0, txn, Direction::Next)
    }

    pub fn prev_sibling(&self, txn: &Transaction<'_>) -> Option<XmlNode> {
        sibling(&self.0, txn, Direction::Prev)
    }

    pub fn parent(&self, txn: &Transaction<'_>) -> Option<XmlElementRef> {
        parent(&self.0, txn)
    }
}

/// Attribute names and values of an XML node
pub struct Attributes<'a>(MapIter<'a>);

impl<'a> Iterator for Attributes<'a> {
    type Item = (&'a str, String);

    fn next(&mut self) -> Option<Self::Item> {
        let (name, value) = self.0.next()?;
        Some((name, attribute_string(value.as_any())))
    }
}

fn attribute_string(value: Option<&Any>) -> String {
    match value {
        Some(Any::String(s)) => s.to_string(),
        Some(other) => other.to_json().to_string(),
        None => String::new(),
    }
}

fn get_attribute(branch: &BranchRef, txn: &Transaction<'_>, name: &str) -> Option<String> {
    let item = branch.entry(txn, name)?;
    match &item.content {
        ItemContent::Any(values) => Some(attribute_string(values.last())),
        _ => None,
    }
}

fn insert_attribute(branch: &BranchRef, txn: &mut Transaction<'_>, name: &str, value: &str) -> Result<()> {
    branch.check(txn)?;
    txn.set_entry(&branch.id, name, Input::from(value))?;
    Ok(())
}

enum Direction {
    Next,
    Prev,
}

/// Whether `item` is a live XML node
fn is_node(item: &Item) -> bool {
    !item.deleted
        && matches!(
            item.content,
            ItemContent::Type(TypeRef::XmlElement(_)) | ItemContent::Type(TypeRef::XmlText)
        )
}

fn sibling(branch: &BranchRef, txn: &Transaction<'_>, direction: Direction) -> Option<XmlNode> {
    let BranchId::Nested(id) = &branch.id else {
        return None;
    };
    branch.branch(txn)?;
    let store = txn.store();
    let found = match direction {
        Direction::Next => next_sibling(store, *id),
        Direction::Prev => prev_sibling(store, *id),
    }?;
    XmlNode::from_item(branch.doc, store.blocks.get_item(&found)?)
}

fn parent(branch: &BranchRef, txn: &Transaction<'_>) -> Option<XmlElementRef> {
    let BranchId::Nested(id) = &branch.id else {
        return None;
    };
    branch.branch(txn)?;
    let store = txn.store();
    let parent = store.blocks.get_item(id)?.parent.clone()?;
    match store.types.get(&parent)?.type_ref {
        TypeRef::XmlElement(_) => Some(XmlElementRef(BranchRef::new(branch.doc, parent))),
        _ => None,
    }
}

fn first_child(store: &Store, branch: &BranchId) -> Option<ID> {
    let mut next = store.types.get(branch)?.start;
    while let Some(id) = next {
        let item = store.blocks.get_item(&id)?;
        if is_node(item) {
            return Some(id);
        }
        next = item.right;
    }
    None
}

fn next_sibling(store: &Store, id: ID) -> Option<ID> {
    let mut next = store.blocks.get_item(&id)?.right;
    while let Some(id) = next {
        let item = store.blocks.get_item(&id)?;
        if is_node(item) {
            return Some(id);
        }
        next = item.right;
    }
    None
}

fn prev_sibling(store: &Store, id: ID) -> Option<ID> {
    let mut prev = store.blocks.get_item(&id)?.left;
    while let Some(id) = prev {
        let item = store.blocks.get_item(&id)?;
        if is_node(item) {
            return Some(id);
        }
        prev = item.left;
    }
    None
}

/// Depth-first, pre-order iterator over the live descendants of an element
pub struct TreeWalker<'a> {
    store: &'a Store,
    doc: Uuid,
    root: BranchId,
    next: Option<ID>,
}

impl TreeWalker<'_> {
    fn following(&self, current: ID) -> Option<ID> {
        let item = self.store.blocks.get_item(&current)?;
        if let ItemContent::Type(TypeRef::XmlElement(_)) = item.content {
            if let Some(child) = first_child(self.store, &BranchId::Nested(current)) {
                return Some(child);
            }
        }

        let mut node = current;
        loop {
            if let Some(sibling) = next_sibling(self.store, node) {
                return Some(sibling);
            }
            match self.store.blocks.get_item(&node)?.parent.as_ref()? {
                parent if *parent == self.root => return None,
                BranchId::Nested(parent) => node = *parent,
                BranchId::Root(_) => return None,
            }
        }
    }
}

impl Iterator for TreeWalker<'_> {
    type Item = XmlNode;

    fn next(&mut self) -> Option<XmlNode> {
        let current = self.next?;
        self.next = self.following(current);
        XmlNode::from_item(self.doc, self.store.blocks.get_item(&current)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Doc;

    fn build(txn: &mut Transaction<'_>) -> XmlElementRef {
        // <UNDEFINED><div><p>a</p><p>b</p></div><span/></UNDEFINED>
        let root = txn.get_xml_element("x").unwrap();
        let div = root.insert_elem(txn, 0, "div").unwrap();
        let span = root.insert_elem(txn, 1, "span").unwrap();
        span.insert_attribute(txn, "id", "s").unwrap();
        for (i, s) in ["a", "b"].into_iter().enumerate() {
            let p = div.insert_elem(txn, i as u32, "p").unwrap();
            let text = p.insert_text(txn, 0).unwrap();
            text.insert(txn, 0, s).unwrap();
        }
        root
    }

    #[test]
    fn test_get_string() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let root = build(&mut txn);
        assert_eq!(
            root.get_string(&txn),
            r#"<UNDEFINED><div><p>a</p><p>b</p></div><span id="s"></span></UNDEFINED>"#
        );
    }

    #[test]
    fn test_tree_walker_depth_first() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let root = build(&mut txn);

        let visited: Vec<String> = root
            .tree_walker(&txn)
            .map(|node| match node {
                XmlNode::Element(elem) => elem.tag(&txn),
                XmlNode::Text(text) => format!("'{}'", text.get_string(&txn)),
            })
            .collect();
        assert_eq!(visited, vec!["div", "p", "'a'", "p", "'b'", "span"]);
    }

    #[test]
    fn test_tree_walker_skips_deleted() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let root = build(&mut txn);
        let Some(XmlNode::Element(div)) = root.first_child(&txn) else {
            panic!("expected div");
        };
        div.remove_range(&mut txn, 0, 1).unwrap();

        let count = root.tree_walker(&txn).count();
        // div, p, 'b', span
        assert_eq!(count, 4);
    }

    #[test]
    fn test_siblings_and_parent() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let root = build(&mut txn);

        let div = root.get(&txn, 0).unwrap();
        let span = root.get(&txn, 1).unwrap();
        assert_eq!(div.as_element().unwrap().next_sibling(&txn), Some(span.clone()));
        assert_eq!(span.as_element().unwrap().prev_sibling(&txn), Some(div.clone()));
        assert_eq!(span.as_element().unwrap().next_sibling(&txn), None);
        assert_eq!(span.as_element().unwrap().parent(&txn), Some(root.clone()));
        assert_eq!(root.parent(&txn), None);
        assert_eq!(root.next_sibling(&txn), None);

        let p = div.as_element().unwrap().first_child(&txn).unwrap();
        let text = p.as_element().unwrap().first_child(&txn).unwrap();
        let text = text.as_text().unwrap();
        assert_eq!(text.parent(&txn), p.as_element().cloned());
    }

    #[test]
    fn test_attributes() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let root = txn.get_xml_element("x").unwrap();
        root.insert_attribute(&mut txn, "a", "1").unwrap();
        root.insert_attribute(&mut txn, "b", "2").unwrap();
        root.insert_attribute(&mut txn, "a", "3").unwrap();
        root.remove_attribute(&mut txn, "b").unwrap();

        assert_eq!(root.get_attribute(&txn, "a").as_deref(), Some("3"));
        assert_eq!(root.get_attribute(&txn, "b"), None);
        let attributes: Vec<_> = root.attributes(&txn).collect();
        assert_eq!(attributes, vec![("a", "3".to_string())]);
    }

    #[test]
    fn test_xml_text_attributes_and_content() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let text = txn.get_xml_text("t").unwrap();
        text.push(&mut txn, "hello").unwrap();
        text.insert_attribute(&mut txn, "lang", "en").unwrap();
        text.remove_range(&mut txn, 0, 1).unwrap();

        assert_eq!(text.get_string(&txn), "ello");
        assert_eq!(text.len(&txn), 4);
        assert_eq!(text.get_attribute(&txn, "lang").as_deref(), Some("en"));
        assert_eq!(text.parent(&txn), None);
    }
}
