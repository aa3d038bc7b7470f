//! Document configuration

use crate::id::ClientID;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Peer ids are kept within 53 bits so they survive a round trip through
/// hosts that only have IEEE-754 numbers.
const CLIENT_ID_MASK: u64 = (1 << 53) - 1;

/// Options used to create a [`Doc`](crate::Doc)
///
/// Can be loaded from any serde format, e.g. JSON:
///
/// ```rust
/// use weave_core::Options;
///
/// let opts: Options = serde_json::from_str(r#"{ "client_id": 42 }"#).unwrap();
/// assert_eq!(opts.client_id, Some(42));
/// assert!(!opts.skip_gc);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Globally unique peer id. Generated randomly when absent.
    ///
    /// Reusing a peer id on two replicas that both write leads to diverging
    /// documents; this cannot be detected locally.
    pub client_id: Option<ClientID>,

    /// Keep deleted content instead of reclaiming it at commit
    pub skip_gc: bool,
}

impl Options {
    /// Options with a fixed peer id
    pub fn with_client_id(client_id: ClientID) -> Self {
        Self {
            client_id: Some(client_id),
            ..Self::default()
        }
    }

    /// Resolve the configured peer id, generating one if needed
    pub(crate) fn resolve_client_id(&self) -> ClientID {
        match self.client_id {
            Some(id) => id,
            None => random_client_id(),
        }
    }
}

fn random_client_id() -> ClientID {
    let (high, _) = Uuid::new_v4().as_u64_pair();
    high & CLIENT_ID_MASK
}
