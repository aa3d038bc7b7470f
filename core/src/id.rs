//! Block identity
//!
//! Every element ever inserted into a document is named by the peer that
//! created it and that peer's clock at the time.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Peer identifier
pub type ClientID = u64;

/// Unique identifier of a single element in the block store
///
/// A block covering `len` elements owns the ids `clock..clock + len` of its
/// client. Ids sort by `(clock, client)`; competing keyed writes are settled
/// with this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ID {
    pub client: ClientID,
    pub clock: u32,
}

impl ID {
    pub fn new(client: ClientID, clock: u32) -> Self {
        Self { client, clock }
    }

    fn sort_key(&self) -> (u32, ClientID) {
        (self.clock, self.client)
    }
}

impl Ord for ID {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for ID {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.clock)
    }
}
