//! Shared types
//!
//! A shared type is a [`Branch`]: the head of one item sequence (for Text,
//! Array and XML children) plus one item chain per key (for Map entries and
//! XML attributes). Branches are either named roots of a document or nested
//! inside an item carrying [`ItemContent::Type`].
//!
//! The typed handles ([`TextRef`], [`ArrayRef`], [`MapRef`],
//! [`XmlElementRef`], [`XmlTextRef`]) only hold the branch id and the guid of
//! the owning document. Every read and write goes through a [`Transaction`].

pub mod array;
pub mod map;
pub mod text;
pub mod xml;

pub use array::{ArrayIter, ArrayRef};
pub use map::{MapIter, MapRef};
pub use text::TextRef;
pub use xml::{Attributes, TreeWalker, XmlElementRef, XmlNode, XmlTextRef};

use crate::any::Any;
use crate::block::{Item, ItemContent};
use crate::encoding::{Decode, Decoder, Encode, Encoder};
use crate::error::{Result, SyncError};
use crate::id::ID;
use crate::transaction::Transaction;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

const TYPE_REF_ARRAY: u8 = 0;
const TYPE_REF_MAP: u8 = 1;
const TYPE_REF_TEXT: u8 = 2;
const TYPE_REF_XML_ELEMENT: u8 = 3;
const TYPE_REF_XML_TEXT: u8 = 6;
const TYPE_REF_UNDEFINED: u8 = 15;

/// Tag given to a root XML element, which has no tag of its own
pub const ROOT_XML_TAG: &str = "UNDEFINED";

/// Kind of a shared type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    /// Root that was referenced by a remote update before any local access
    Undefined,
    Array,
    Map,
    Text,
    XmlElement(Arc<str>),
    XmlText,
}

impl TypeRef {
    pub fn kind(&self) -> &'static str {
        match self {
            TypeRef::Undefined => "undefined",
            TypeRef::Array => "array",
            TypeRef::Map => "map",
            TypeRef::Text => "text",
            TypeRef::XmlElement(_) => "xml element",
            TypeRef::XmlText => "xml text",
        }
    }

    /// Same kind of type, ignoring XML tags
    fn same_kind(&self, other: &TypeRef) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Encode for TypeRef {
    fn encode(&self, encoder: &mut Encoder) {
        match self {
            TypeRef::Undefined => encoder.write_u8(TYPE_REF_UNDEFINED),
            TypeRef::Array => encoder.write_u8(TYPE_REF_ARRAY),
            TypeRef::Map => encoder.write_u8(TYPE_REF_MAP),
            TypeRef::Text => encoder.write_u8(TYPE_REF_TEXT),
            TypeRef::XmlElement(tag) => {
                encoder.write_u8(TYPE_REF_XML_ELEMENT);
                encoder.write_string(tag);
            }
            TypeRef::XmlText => encoder.write_u8(TYPE_REF_XML_TEXT),
        }
    }
}

impl Decode for TypeRef {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        match decoder.read_u8()? {
            TYPE_REF_UNDEFINED => Ok(TypeRef::Undefined),
            TYPE_REF_ARRAY => Ok(TypeRef::Array),
            TYPE_REF_MAP => Ok(TypeRef::Map),
            TYPE_REF_TEXT => Ok(TypeRef::Text),
            TYPE_REF_XML_ELEMENT => Ok(TypeRef::XmlElement(decoder.read_string()?.into())),
            TYPE_REF_XML_TEXT => Ok(TypeRef::XmlText),
            other => Err(SyncError::Decode(format!("unknown type ref {other}"))),
        }
    }
}

/// Identity of a branch: a root name or the id of the item that carries it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BranchId {
    Root(Arc<str>),
    Nested(ID),
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchId::Root(name) => write!(f, "root '{}'", name),
            BranchId::Nested(id) => write!(f, "nested {}", id),
        }
    }
}

/// Head of a shared type's sequence and keyed entries
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub id: BranchId,
    pub type_ref: TypeRef,

    /// First block of the sequence
    pub start: Option<ID>,

    /// Key to the rightmost (current) item of that key's chain
    pub map: HashMap<Arc<str>, ID>,

    /// Number of visible sequence elements
    pub block_len: u32,
}

impl Branch {
    pub fn new(id: BranchId, type_ref: TypeRef) -> Self {
        Self {
            id,
            type_ref,
            start: None,
            map: HashMap::new(),
            block_len: 0,
        }
    }
}

/// Document-scoped reference to a branch, shared by all typed handles
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchRef {
    pub(crate) doc: Uuid,
    pub(crate) id: BranchId,
}

impl BranchRef {
    pub(crate) fn new(doc: Uuid, id: BranchId) -> Self {
        Self { doc, id }
    }

    pub fn id(&self) -> &BranchId {
        &self.id
    }

    /// Fails with `NoActiveTransaction` when `txn` belongs to another document
    pub(crate) fn check(&self, txn: &Transaction<'_>) -> Result<()> {
        if txn.doc_guid() == self.doc {
            Ok(())
        } else {
            Err(SyncError::NoActiveTransaction)
        }
    }

    pub(crate) fn branch<'a>(&self, txn: &'a Transaction<'_>) -> Option<&'a Branch> {
        if txn.doc_guid() != self.doc {
            return None;
        }
        txn.store().types.get(&self.id)
    }

    /// Number of visible sequence elements
    pub(crate) fn len(&self, txn: &Transaction<'_>) -> u32 {
        self.branch(txn).map(|b| b.block_len).unwrap_or(0)
    }

    /// Visible items of the sequence, in order
    pub(crate) fn items<'a>(&self, txn: &'a Transaction<'_>) -> Vec<&'a Item> {
        let mut items = Vec::new();
        let Some(branch) = self.branch(txn) else {
            return items;
        };
        let blocks = &txn.store().blocks;
        let mut next = branch.start;
        while let Some(id) = next {
            let Some(item) = blocks.get_item(&id) else {
                break;
            };
            if item.is_visible() {
                items.push(item);
            }
            next = item.right;
        }
        items
    }

    /// Current live item stored under `key`
    pub(crate) fn entry<'a>(&self, txn: &'a Transaction<'_>, key: &str) -> Option<&'a Item> {
        let id = self.branch(txn)?.map.get(key)?;
        txn.store()
            .blocks
            .get_item(id)
            .filter(|item| !item.deleted)
    }
}

/// Write cell: a value to insert into a shared type
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Any(Any),
    Binary(Vec<u8>),
    /// Nested text, pre-filled with the given content
    Text(String),
    Array(Vec<Input>),
    Map(HashMap<String, Input>),
    /// Nested XML element with the given tag
    XmlElement(String),
    /// Nested XML text, pre-filled with the given content
    XmlText(String),
}

impl Input {
    /// Content of the item created for this input
    pub(crate) fn to_content(&self) -> ItemContent {
        match self {
            Input::Any(value) => ItemContent::Any(vec![value.clone()]),
            Input::Binary(bytes) => ItemContent::Binary(bytes.clone()),
            Input::Text(_) => ItemContent::Type(TypeRef::Text),
            Input::Array(_) => ItemContent::Type(TypeRef::Array),
            Input::Map(_) => ItemContent::Type(TypeRef::Map),
            Input::XmlElement(tag) => ItemContent::Type(TypeRef::XmlElement(tag.as_str().into())),
            Input::XmlText(_) => ItemContent::Type(TypeRef::XmlText),
        }
    }
}

impl From<Any> for Input {
    fn from(value: Any) -> Self {
        Input::Any(value)
    }
}

macro_rules! impl_input_from_any {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Input {
                fn from(value: $t) -> Self {
                    Input::Any(Any::from(value))
                }
            }
        )*
    };
}

impl_input_from_any!(bool, f64, i64, &str, String);

/// Read cell: a value stored in a shared type
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Any(Any),
    Text(TextRef),
    Array(ArrayRef),
    Map(MapRef),
    XmlElement(XmlElementRef),
    XmlText(XmlTextRef),
}

impl Output {
    /// Value at `offset` inside `item`
    pub(crate) fn from_item(doc: Uuid, item: &Item, offset: u32) -> Option<Output> {
        match &item.content {
            ItemContent::Any(values) => values.get(offset as usize).cloned().map(Output::Any),
            ItemContent::Binary(bytes) => Some(Output::Any(Any::Buffer(bytes.as_slice().into()))),
            ItemContent::String(s) => s
                .chars()
                .nth(offset as usize)
                .map(|c| Output::Any(Any::String(c.to_string().into()))),
            ItemContent::Deleted(_) => None,
            ItemContent::Type(type_ref) => {
                let branch = BranchRef::new(doc, BranchId::Nested(item.id));
                Some(match type_ref {
                    TypeRef::Text => Output::Text(TextRef::from(branch)),
                    TypeRef::Array | TypeRef::Undefined => Output::Array(ArrayRef::from(branch)),
                    TypeRef::Map => Output::Map(MapRef::from(branch)),
                    TypeRef::XmlElement(_) => Output::XmlElement(XmlElementRef::from(branch)),
                    TypeRef::XmlText => Output::XmlText(XmlTextRef::from(branch)),
                })
            }
        }
    }

    /// Every value of `item`, in order
    pub(crate) fn all_from_item(doc: Uuid, item: &Item) -> Vec<Output> {
        (0..item.len)
            .filter_map(|offset| Output::from_item(doc, item, offset))
            .collect()
    }

    pub fn to_json(&self, txn: &Transaction<'_>) -> serde_json::Value {
        match self {
            Output::Any(value) => value.to_json(),
            Output::Text(text) => serde_json::Value::String(text.get_string(txn)),
            Output::Array(array) => array.to_json(txn),
            Output::Map(map) => map.to_json(txn),
            Output::XmlElement(elem) => serde_json::Value::String(elem.get_string(txn)),
            Output::XmlText(text) => serde_json::Value::String(text.get_string(txn)),
        }
    }

    pub fn as_any(&self) -> Option<&Any> {
        match self {
            Output::Any(value) => Some(value),
            _ => None,
        }
    }
}

impl Transaction<'_> {
    /// Root branch `name`, created on first use and typed on first typed access
    pub(crate) fn get_or_create_root(&mut self, name: &str, type_ref: TypeRef) -> Result<BranchRef> {
        let id = BranchId::Root(name.into());
        let doc = self.doc_guid();
        let branch = self
            .store_mut()
            .types
            .entry(id.clone())
            .or_insert_with(|| Branch::new(id.clone(), TypeRef::Undefined));

        if branch.type_ref == TypeRef::Undefined {
            branch.type_ref = type_ref;
        } else if !branch.type_ref.same_kind(&type_ref) {
            return Err(SyncError::TypeMismatch {
                name: name.to_string(),
                expected: type_ref.kind(),
                actual: branch.type_ref.kind(),
            });
        }
        Ok(BranchRef::new(doc, id))
    }

    /// Root text `name`
    pub fn get_text(&mut self, name: &str) -> Result<TextRef> {
        self.get_or_create_root(name, TypeRef::Text).map(TextRef::from)
    }

    /// Root array `name`
    pub fn get_array(&mut self, name: &str) -> Result<ArrayRef> {
        self.get_or_create_root(name, TypeRef::Array).map(ArrayRef::from)
    }

    /// Root map `name`
    pub fn get_map(&mut self, name: &str) -> Result<MapRef> {
        self.get_or_create_root(name, TypeRef::Map).map(MapRef::from)
    }

    /// Root XML element `name`, tagged [`ROOT_XML_TAG`]
    pub fn get_xml_element(&mut self, name: &str) -> Result<XmlElementRef> {
        self.get_or_create_root(name, TypeRef::XmlElement(ROOT_XML_TAG.into()))
            .map(XmlElementRef::from)
    }

    /// Root XML text `name`
    pub fn get_xml_text(&mut self, name: &str) -> Result<XmlTextRef> {
        self.get_or_create_root(name, TypeRef::XmlText).map(XmlTextRef::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Doc;

    #[test]
    fn test_type_ref_codec() {
        for type_ref in [
            TypeRef::Array,
            TypeRef::Map,
            TypeRef::Text,
            TypeRef::XmlElement("p".into()),
            TypeRef::XmlText,
        ] {
            let mut enc = Encoder::new();
            type_ref.encode(&mut enc);
            let bytes = enc.into_bytes();
            assert_eq!(TypeRef::decode(&mut Decoder::new(&bytes)).unwrap(), type_ref);
        }
    }

    #[test]
    fn test_unknown_type_ref() {
        let err = TypeRef::decode(&mut Decoder::new(&[42])).unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[test]
    fn test_root_type_mismatch() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        txn.get_text("t").unwrap();

        let err = txn.get_map("t").unwrap_err();
        assert_eq!(
            err,
            SyncError::TypeMismatch {
                name: "t".into(),
                expected: "map",
                actual: "text",
            }
        );
        // same kind is fine
        assert!(txn.get_text("t").is_ok());
    }

    #[test]
    fn test_root_xml_tag() {
        let doc = Doc::with_client_id(1);
        let mut txn = doc.transact().unwrap();
        let root = txn.get_xml_element("x").unwrap();
        assert_eq!(root.tag(&txn), ROOT_XML_TAG);
    }

    #[test]
    fn test_input_from_primitives() {
        assert_eq!(Input::from(true), Input::Any(Any::Bool(true)));
        assert_eq!(Input::from("a"), Input::Any(Any::String("a".into())));
    }
}
