//! Weave Core - Replicated document engine
//!
//! Peers edit their own copy of a document and exchange compact binary
//! updates; every replica that has seen the same set of updates reads the
//! same content, whatever order they arrived in.
//! It implements:
//! - A block store of uniquely identified content runs (split / squash)
//! - Interleaving-resistant merge for sequences, last-writer-wins for keys
//! - Shared types: Text, Array, Map, XmlElement, XmlText
//! - State vectors, diffs and causal buffering of out-of-order updates
//!
//! # Examples
//!
//! ```rust
//! use weave_core::Doc;
//!
//! let alice = Doc::with_client_id(1);
//! let bob = Doc::with_client_id(2);
//!
//! for (doc, word) in [(&alice, "hello"), (&bob, "world")] {
//!     let mut txn = doc.transact().unwrap();
//!     let text = txn.get_text("t").unwrap();
//!     text.insert(&mut txn, 0, word).unwrap();
//! }
//!
//! let to_bob = alice.transact().unwrap().encode_diff(&[]).unwrap();
//! let to_alice = bob.transact().unwrap().encode_diff(&[]).unwrap();
//! alice.transact().unwrap().apply_update(&to_alice).unwrap();
//! bob.transact().unwrap().apply_update(&to_bob).unwrap();
//!
//! let read = |doc: &Doc| {
//!     let mut txn = doc.transact().unwrap();
//!     let text = txn.get_text("t").unwrap();
//!     text.get_string(&txn)
//! };
//! assert_eq!(read(&alice), read(&bob));
//! assert_eq!(read(&alice), "helloworld");
//! ```

pub mod any;
pub mod block;
pub mod config;
pub mod delete_set;
pub mod doc;
pub mod encoding;
pub mod error;
pub mod id;
pub mod state_vector;
pub mod store;
pub mod transaction;
pub mod types;

// Re-exports for convenience
pub use any::Any;
pub use config::Options;
pub use delete_set::DeleteSet;
pub use doc::{Doc, SubscriptionId};
pub use encoding::{Decode, Encode, Update};
pub use error::{Result, SyncError};
pub use id::{ClientID, ID};
pub use state_vector::StateVector;
pub use transaction::Transaction;
pub use types::{
    ArrayRef, Input, MapRef, Output, TextRef, TreeWalker, XmlElementRef, XmlNode, XmlTextRef,
};
