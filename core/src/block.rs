//! Blocks: the unit of replicated content
//!
//! A block is either an [`Item`] (a run of content inserted by one peer in
//! one operation) or a [`GC`] range (reclaimed content that only keeps its
//! clock coverage). Items form per-type doubly-linked sequences; neighbours
//! and origins are stored as [`ID`]s resolved through the block store, never
//! as owning pointers.
//!
//! # Origins
//!
//! - `origin`: last element directly to the left at insertion time
//! - `right_origin`: first element directly to the right at insertion time
//!
//! Origins are captured once and never change, except that the right half of
//! a split item gets the last element of the left half as its origin.

use crate::any::Any;
use crate::encoding::{Decode, Decoder, Encode, Encoder};
use crate::error::{Result, SyncError};
use crate::id::ID;
use crate::types::{BranchId, TypeRef};
use std::sync::Arc;

pub const BLOCK_GC_REF: u8 = 0;
pub const CONTENT_DELETED_REF: u8 = 1;
pub const CONTENT_BINARY_REF: u8 = 3;
pub const CONTENT_STRING_REF: u8 = 4;
pub const CONTENT_TYPE_REF: u8 = 7;
pub const CONTENT_ANY_REF: u8 = 8;

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;
const CONTENT_REF_MASK: u8 = 0b0001_1111;

const PARENT_NESTED: u32 = 0;
const PARENT_ROOT: u32 = 1;

/// Content carried by an item
#[derive(Debug, Clone, PartialEq)]
pub enum ItemContent {
    /// One element per value
    Any(Vec<Any>),
    /// A single binary blob
    Binary(Vec<u8>),
    /// Reclaimed content of the given length
    Deleted(u32),
    /// A run of characters, one element per Unicode scalar value
    String(String),
    /// A nested shared type
    Type(TypeRef),
}

impl ItemContent {
    /// Number of elements represented by this content
    pub fn len(&self) -> u32 {
        match self {
            ItemContent::Any(values) => values.len() as u32,
            ItemContent::Binary(_) | ItemContent::Type(_) => 1,
            ItemContent::Deleted(len) => *len,
            ItemContent::String(s) => s.chars().count() as u32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the content contributes to a sequence's length
    pub fn is_countable(&self) -> bool {
        !matches!(self, ItemContent::Deleted(_))
    }

    pub fn ref_number(&self) -> u8 {
        match self {
            ItemContent::Any(_) => CONTENT_ANY_REF,
            ItemContent::Binary(_) => CONTENT_BINARY_REF,
            ItemContent::Deleted(_) => CONTENT_DELETED_REF,
            ItemContent::String(_) => CONTENT_STRING_REF,
            ItemContent::Type(_) => CONTENT_TYPE_REF,
        }
    }

    /// Cut this content at `offset`, keeping the left part and returning the
    /// right one. Single-element contents are never split.
    pub fn splice(&mut self, offset: u32) -> ItemContent {
        match self {
            ItemContent::Any(values) => ItemContent::Any(values.split_off(offset as usize)),
            ItemContent::String(s) => {
                let at = s
                    .char_indices()
                    .nth(offset as usize)
                    .map(|(i, _)| i)
                    .unwrap_or(s.len());
                ItemContent::String(s.split_off(at))
            }
            ItemContent::Deleted(len) => {
                let right = *len - offset;
                *len = offset;
                ItemContent::Deleted(right)
            }
            ItemContent::Binary(_) | ItemContent::Type(_) => {
                unreachable!("single-element content cannot be split")
            }
        }
    }

    /// Append `other` to this content if both are of a mergeable kind
    pub fn try_squash(&mut self, other: &ItemContent) -> bool {
        match (self, other) {
            (ItemContent::Any(left), ItemContent::Any(right)) => {
                left.extend(right.iter().cloned());
                true
            }
            (ItemContent::String(left), ItemContent::String(right)) => {
                left.push_str(right);
                true
            }
            (ItemContent::Deleted(left), ItemContent::Deleted(right)) => {
                *left += *right;
                true
            }
            _ => false,
        }
    }

    fn encode(&self, encoder: &mut Encoder) {
        match self {
            ItemContent::Any(values) => {
                encoder.write_var_u64(values.len() as u64);
                for value in values {
                    value.encode(encoder);
                }
            }
            ItemContent::Binary(bytes) => encoder.write_buf(bytes),
            ItemContent::Deleted(len) => encoder.write_var_u32(*len),
            ItemContent::String(s) => encoder.write_string(s),
            ItemContent::Type(type_ref) => type_ref.encode(encoder),
        }
    }

    fn decode(ref_number: u8, decoder: &mut Decoder<'_>) -> Result<Self> {
        let content = match ref_number {
            CONTENT_ANY_REF => {
                let len = decoder.read_len()?;
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    values.push(Any::decode(decoder)?);
                }
                ItemContent::Any(values)
            }
            CONTENT_BINARY_REF => ItemContent::Binary(decoder.read_buf()?.to_vec()),
            CONTENT_DELETED_REF => ItemContent::Deleted(decoder.read_var_u32()?),
            CONTENT_STRING_REF => ItemContent::String(decoder.read_string()?.to_string()),
            CONTENT_TYPE_REF => ItemContent::Type(TypeRef::decode(decoder)?),
            other => {
                return Err(SyncError::Decode(format!("unknown content ref {other}")));
            }
        };
        if content.is_empty() {
            return Err(SyncError::Decode("empty item content".into()));
        }
        Ok(content)
    }
}

/// A run of content inserted by a single peer
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Id of the first element
    pub id: ID,

    /// Number of elements, equal to `content.len()`
    pub len: u32,

    /// Start id of the block currently on the left
    pub left: Option<ID>,

    /// Start id of the block currently on the right
    pub right: Option<ID>,

    /// Element on the left at insertion time
    pub origin: Option<ID>,

    /// Element on the right at insertion time
    pub right_origin: Option<ID>,

    pub content: ItemContent,

    /// Owning shared type. `None` only for decoded remote items whose parent
    /// is inherited from their origins at integration time.
    pub parent: Option<BranchId>,

    /// Key for map entries and attributes
    pub parent_sub: Option<Arc<str>>,

    /// Tombstone flag
    pub deleted: bool,
}

impl Item {
    pub fn new(
        id: ID,
        origin: Option<ID>,
        right_origin: Option<ID>,
        parent: Option<BranchId>,
        parent_sub: Option<Arc<str>>,
        content: ItemContent,
    ) -> Self {
        Self {
            id,
            len: content.len(),
            left: None,
            right: None,
            origin,
            right_origin,
            content,
            parent,
            parent_sub,
            deleted: false,
        }
    }

    /// Id of the last element covered by this item
    pub fn last_id(&self) -> ID {
        ID::new(self.id.client, self.id.clock + self.len - 1)
    }

    /// Whether the item counts towards its parent's visible length
    pub fn is_visible(&self) -> bool {
        !self.deleted && self.content.is_countable()
    }

    /// Split at `offset` (0 < offset < len); `self` keeps the left half
    ///
    /// The right half is linked after the left half. Callers are responsible
    /// for relinking the right half's right neighbour.
    pub fn split(&mut self, offset: u32) -> Item {
        let right_id = ID::new(self.id.client, self.id.clock + offset);
        let content = self.content.splice(offset);
        let right = Item {
            id: right_id,
            len: self.len - offset,
            left: Some(self.id),
            right: self.right,
            origin: Some(ID::new(self.id.client, self.id.clock + offset - 1)),
            right_origin: self.right_origin,
            content,
            parent: self.parent.clone(),
            parent_sub: self.parent_sub.clone(),
            deleted: self.deleted,
        };
        self.len = offset;
        self.right = Some(right_id);
        right
    }

    /// Drop the first `offset` elements of a not yet integrated item
    pub fn trim_front(&mut self, offset: u32) {
        self.origin = Some(ID::new(self.id.client, self.id.clock + offset - 1));
        self.content = self.content.splice(offset);
        self.id.clock += offset;
        self.len -= offset;
    }

    /// Whether `right` can be merged into this item
    ///
    /// Both must be directly adjacent in the same sequence, have contiguous
    /// clocks, share the same insertion context and tombstone state.
    pub fn can_squash(&self, right: &Item) -> bool {
        self.id.client == right.id.client
            && self.id.clock + self.len == right.id.clock
            && self.right == Some(right.id)
            && right.left == Some(self.id)
            && right.origin == Some(self.last_id())
            && self.right_origin == right.right_origin
            && self.deleted == right.deleted
            && self.parent == right.parent
            && self.parent_sub.is_none()
            && right.parent_sub.is_none()
            && matches!(
                (&self.content, &right.content),
                (ItemContent::Any(_), ItemContent::Any(_))
                    | (ItemContent::String(_), ItemContent::String(_))
                    | (ItemContent::Deleted(_), ItemContent::Deleted(_))
            )
    }

    /// Encode this item, skipping its first `offset` elements
    fn encode_from(&self, offset: u32, encoder: &mut Encoder) {
        let origin = if offset > 0 {
            Some(ID::new(self.id.client, self.id.clock + offset - 1))
        } else {
            self.origin
        };

        let mut info = self.content.ref_number();
        if origin.is_some() {
            info |= HAS_ORIGIN;
        }
        if self.right_origin.is_some() {
            info |= HAS_RIGHT_ORIGIN;
        }
        if self.parent_sub.is_some() {
            info |= HAS_PARENT_SUB;
        }
        encoder.write_u8(info);

        if let Some(origin) = &origin {
            encoder.write_id(origin);
        }
        if let Some(right_origin) = &self.right_origin {
            encoder.write_id(right_origin);
        }
        if origin.is_none() && self.right_origin.is_none() {
            // parent cannot be inherited from origins, write it explicitly
            match &self.parent {
                Some(BranchId::Root(name)) => {
                    encoder.write_var_u32(PARENT_ROOT);
                    encoder.write_string(name);
                }
                Some(BranchId::Nested(id)) => {
                    encoder.write_var_u32(PARENT_NESTED);
                    encoder.write_id(id);
                }
                None => {
                    // never integrated without a parent; keep payload well formed
                    encoder.write_var_u32(PARENT_ROOT);
                    encoder.write_string("");
                }
            }
            if let Some(parent_sub) = &self.parent_sub {
                encoder.write_string(parent_sub);
            }
        }

        if offset == 0 {
            self.content.encode(encoder);
        } else {
            let mut content = self.content.clone();
            content.splice(offset).encode(encoder);
        }
    }
}

/// A reclaimed range of clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GC {
    pub id: ID,
    pub len: u32,
}

impl GC {
    pub fn new(id: ID, len: u32) -> Self {
        Self { id, len }
    }

    pub fn split(&mut self, offset: u32) -> GC {
        let right = GC::new(ID::new(self.id.client, self.id.clock + offset), self.len - offset);
        self.len = offset;
        right
    }
}

/// Entry of a peer's block list
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Item(Item),
    GC(GC),
}

impl Block {
    pub fn id(&self) -> ID {
        match self {
            Block::Item(item) => item.id,
            Block::GC(gc) => gc.id,
        }
    }

    pub fn len(&self) -> u32 {
        match self {
            Block::Item(item) => item.len,
            Block::GC(gc) => gc.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the last clock covered by this block
    pub fn end_clock(&self) -> u32 {
        self.id().clock + self.len()
    }

    pub fn contains(&self, id: &ID) -> bool {
        let start = self.id();
        start.client == id.client && id.clock >= start.clock && id.clock < self.end_clock()
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            Block::Item(item) => item.deleted,
            Block::GC(_) => true,
        }
    }

    pub fn as_item(&self) -> Option<&Item> {
        match self {
            Block::Item(item) => Some(item),
            Block::GC(_) => None,
        }
    }

    pub fn as_item_mut(&mut self) -> Option<&mut Item> {
        match self {
            Block::Item(item) => Some(item),
            Block::GC(_) => None,
        }
    }

    /// Drop the first `offset` elements of a block that was not integrated yet
    pub fn trim_front(&mut self, offset: u32) {
        if offset == 0 {
            return;
        }
        match self {
            Block::Item(item) => item.trim_front(offset),
            Block::GC(gc) => {
                gc.id.clock += offset;
                gc.len -= offset;
            }
        }
    }

    /// Encode this block, skipping its first `offset` elements
    pub fn encode_from(&self, offset: u32, encoder: &mut Encoder) {
        match self {
            Block::Item(item) => item.encode_from(offset, encoder),
            Block::GC(gc) => {
                encoder.write_u8(BLOCK_GC_REF);
                encoder.write_var_u32(gc.len - offset);
            }
        }
    }

    /// Decode a block whose first element is `id`
    pub fn decode(id: ID, decoder: &mut Decoder<'_>) -> Result<Self> {
        let info = decoder.read_u8()?;
        let ref_number = info & CONTENT_REF_MASK;
        if ref_number == BLOCK_GC_REF {
            let len = decoder.read_var_u32()?;
            if len == 0 {
                return Err(SyncError::Decode("empty gc range".into()));
            }
            return Ok(Block::GC(GC::new(id, len)));
        }

        let origin = if info & HAS_ORIGIN != 0 {
            Some(decoder.read_id()?)
        } else {
            None
        };
        let right_origin = if info & HAS_RIGHT_ORIGIN != 0 {
            Some(decoder.read_id()?)
        } else {
            None
        };

        let mut parent = None;
        let mut parent_sub = None;
        if origin.is_none() && right_origin.is_none() {
            parent = Some(match decoder.read_var_u32()? {
                PARENT_ROOT => BranchId::Root(decoder.read_string()?.into()),
                PARENT_NESTED => BranchId::Nested(decoder.read_id()?),
                other => {
                    return Err(SyncError::Decode(format!("unknown parent kind {other}")));
                }
            });
            if info & HAS_PARENT_SUB != 0 {
                parent_sub = Some(Arc::from(decoder.read_string()?));
            }
        }

        let content = ItemContent::decode(ref_number, decoder)?;
        Ok(Block::Item(Item::new(
            id,
            origin,
            right_origin,
            parent,
            parent_sub,
            content,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_item(id: ID, text: &str) -> Item {
        Item::new(
            id,
            None,
            None,
            Some(BranchId::Root("t".into())),
            None,
            ItemContent::String(text.to_string()),
        )
    }

    #[test]
    fn test_string_len_counts_scalars() {
        let content = ItemContent::String("héllo 👋".to_string());
        assert_eq!(content.len(), 7);
    }

    #[test]
    fn test_split_item() {
        let mut item = text_item(ID::new(1, 10), "hello");
        let right = item.split(2);

        assert_eq!(item.len, 2);
        assert_eq!(item.content, ItemContent::String("he".into()));
        assert_eq!(item.right, Some(ID::new(1, 12)));

        assert_eq!(right.id, ID::new(1, 12));
        assert_eq!(right.len, 3);
        assert_eq!(right.content, ItemContent::String("llo".into()));
        assert_eq!(right.left, Some(ID::new(1, 10)));
        // the right half now originates from the left half's last element
        assert_eq!(right.origin, Some(ID::new(1, 11)));
    }

    #[test]
    fn test_split_multibyte() {
        let mut item = text_item(ID::new(1, 0), "aé👋b");
        let right = item.split(2);
        assert_eq!(item.content, ItemContent::String("aé".into()));
        assert_eq!(right.content, ItemContent::String("👋b".into()));
    }

    #[test]
    fn test_split_then_squash_restores() {
        let original = text_item(ID::new(1, 0), "abcdef");
        let mut left = original.clone();
        let right = left.split(3);

        assert!(left.can_squash(&right));
        assert!(left.content.try_squash(&right.content));
        left.len += right.len;
        left.right = right.right;
        assert_eq!(left, original);
    }

    #[test]
    fn test_cannot_squash_different_state() {
        let mut left = text_item(ID::new(1, 0), "abcdef");
        let mut right = left.split(3);
        right.deleted = true;
        assert!(!left.can_squash(&right));
    }

    #[test]
    fn test_trim_front() {
        let mut item = text_item(ID::new(5, 3), "abcd");
        item.trim_front(1);
        assert_eq!(item.id, ID::new(5, 4));
        assert_eq!(item.len, 3);
        assert_eq!(item.origin, Some(ID::new(5, 3)));
        assert_eq!(item.content, ItemContent::String("bcd".into()));
    }

    #[test]
    fn test_deleted_content_splice() {
        let mut content = ItemContent::Deleted(5);
        let right = content.splice(2);
        assert_eq!(content, ItemContent::Deleted(2));
        assert_eq!(right, ItemContent::Deleted(3));
        assert!(!content.is_countable());
    }

    #[test]
    fn test_block_codec_with_offset() {
        let mut item = text_item(ID::new(9, 0), "hello");
        item.origin = Some(ID::new(3, 7));
        let block = Block::Item(item);

        let mut enc = Encoder::new();
        block.encode_from(2, &mut enc);
        let bytes = enc.into_bytes();

        let decoded = Block::decode(ID::new(9, 2), &mut Decoder::new(&bytes)).unwrap();
        let decoded = decoded.as_item().unwrap();
        assert_eq!(decoded.origin, Some(ID::new(9, 1)));
        assert_eq!(decoded.content, ItemContent::String("llo".into()));
        // parent is inherited from the origin, so it is not on the wire
        assert_eq!(decoded.parent, None);
    }

    #[test]
    fn test_root_parent_on_wire() {
        let mut item = text_item(ID::new(9, 0), "x");
        item.parent_sub = Some("key".into());
        let mut enc = Encoder::new();
        Block::Item(item.clone()).encode_from(0, &mut enc);
        let bytes = enc.into_bytes();

        let decoded = Block::decode(ID::new(9, 0), &mut Decoder::new(&bytes)).unwrap();
        assert_eq!(decoded, Block::Item(item));
    }

    #[test]
    fn test_gc_block_codec() {
        let block = Block::GC(GC::new(ID::new(2, 4), 6));
        let mut enc = Encoder::new();
        block.encode_from(1, &mut enc);
        let bytes = enc.into_bytes();

        let decoded = Block::decode(ID::new(2, 5), &mut Decoder::new(&bytes)).unwrap();
        assert_eq!(decoded, Block::GC(GC::new(ID::new(2, 5), 5)));
    }
}
