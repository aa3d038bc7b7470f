//! Documents
//!
//! A [`Doc`] is one replica of a shared document. It owns the block store
//! and hands out [`Transaction`]s, one at a time.
//!
//! # Example
//!
//! ```rust
//! use weave_core::Doc;
//!
//! let a = Doc::with_client_id(1);
//! let b = Doc::with_client_id(2);
//!
//! {
//!     let mut txn = a.transact().unwrap();
//!     let text = txn.get_text("article").unwrap();
//!     text.insert(&mut txn, 0, "hello").unwrap();
//! }
//!
//! // ship a's changes to b
//! let sv = b.transact().unwrap().encode_state_vector();
//! let update = a.transact().unwrap().encode_diff(&sv).unwrap();
//!
//! let mut txn = b.transact().unwrap();
//! txn.apply_update(&update).unwrap();
//! let text = txn.get_text("article").unwrap();
//! assert_eq!(text.get_string(&txn), "hello");
//! ```

use crate::config::Options;
use crate::error::{Result, SyncError};
use crate::id::ClientID;
use crate::store::Store;
use crate::transaction::Transaction;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use uuid::Uuid;

/// Handle returned by [`Doc::observe_update`]
pub type SubscriptionId = u32;

type UpdateObserver = Rc<dyn Fn(&[u8])>;

#[derive(Default)]
struct Observers {
    next_id: SubscriptionId,
    update: Vec<(SubscriptionId, UpdateObserver)>,
}

/// A replica of a shared document
pub struct Doc {
    client_id: ClientID,
    guid: Uuid,
    store: RefCell<Store>,
    observers: RefCell<Observers>,
}

impl Doc {
    /// Document with a random peer id
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_client_id(client_id: ClientID) -> Self {
        Self::with_options(Options::with_client_id(client_id))
    }

    pub fn with_options(options: Options) -> Self {
        let client_id = options.resolve_client_id();
        let guid = Uuid::new_v4();
        tracing::debug!(client = client_id, %guid, "document created");
        Self {
            client_id,
            guid,
            store: RefCell::new(Store::new(client_id, options)),
            observers: RefCell::default(),
        }
    }

    pub fn client_id(&self) -> ClientID {
        self.client_id
    }

    /// Unique id of this document instance
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// Open a transaction
    ///
    /// Fails with `ConcurrentTransaction` while another transaction on this
    /// document is alive.
    pub fn transact(&self) -> Result<Transaction<'_>> {
        let store = self
            .store
            .try_borrow_mut()
            .map_err(|_| SyncError::ConcurrentTransaction)?;
        Ok(Transaction::new(self, store))
    }

    /// Call `f` with the encoded update of every committed transaction that
    /// changed the document
    ///
    /// Observers run while the committing transaction still holds the
    /// document, so they cannot open a transaction on it.
    pub fn observe_update<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&[u8]) + 'static,
    {
        let mut observers = self.observers.borrow_mut();
        let id = observers.next_id;
        observers.next_id += 1;
        observers.update.push((id, Rc::new(f)));
        id
    }

    /// Remove an observer, returning whether it was registered
    pub fn unobserve_update(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.borrow_mut();
        let before = observers.update.len();
        observers.update.retain(|(sub, _)| *sub != id);
        observers.update.len() != before
    }

    pub(crate) fn update_observers(&self) -> Vec<UpdateObserver> {
        self.observers
            .borrow()
            .update
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect()
    }

    /// Remote data waiting for missing predecessors, encoded as an update
    pub fn pending_state(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.transact()?.pending_update())
    }
}

impl Default for Doc {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Doc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Doc")
            .field("client_id", &self.client_id)
            .field("guid", &self.guid)
            .finish_non_exhaustive()
    }
}
