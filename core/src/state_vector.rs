//! State vectors
//!
//! A state vector maps every known peer to the next clock expected from it,
//! summarising everything a replica has integrated. It is sent to a remote
//! peer to ask for a diff.

use crate::encoding::{Decode, Decoder, Encode, Encoder};
use crate::error::Result;
use crate::id::{ClientID, ID};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Peer → next expected clock
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(HashMap<ClientID, u32>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Next clock expected from `client` (0 when unknown)
    pub fn get(&self, client: &ClientID) -> u32 {
        self.0.get(client).copied().unwrap_or(0)
    }

    /// Raise the recorded clock of `client` to at least `clock`
    pub fn set_max(&mut self, client: ClientID, clock: u32) {
        let entry = self.0.entry(client).or_insert(0);
        *entry = (*entry).max(clock);
    }

    /// Whether the element `id` is covered by this state
    pub fn contains(&self, id: &ID) -> bool {
        id.clock < self.get(&id.client)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientID, &u32)> {
        self.0.iter()
    }
}

impl FromIterator<(ClientID, u32)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ClientID, u32)>>(iter: T) -> Self {
        let mut sv = StateVector::new();
        for (client, clock) in iter {
            sv.set_max(client, clock);
        }
        sv
    }
}

impl Encode for StateVector {
    fn encode(&self, encoder: &mut Encoder) {
        // sorted so equal vectors encode to equal bytes
        let mut entries: Vec<_> = self.0.iter().collect();
        entries.sort_unstable_by(|a, b| b.0.cmp(a.0));
        encoder.write_var_u64(entries.len() as u64);
        for (client, clock) in entries {
            encoder.write_var_u64(*client);
            encoder.write_var_u32(*clock);
        }
    }
}

impl Decode for StateVector {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        let len = decoder.read_len()?;
        let mut map = HashMap::with_capacity(len);
        for _ in 0..len {
            let client = decoder.read_var_u64()?;
            let clock = decoder.read_var_u32()?;
            map.insert(client, clock);
        }
        Ok(StateVector(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_max() {
        let mut sv = StateVector::new();
        sv.set_max(1, 5);
        sv.set_max(1, 3);
        assert_eq!(sv.get(&1), 5);
        assert_eq!(sv.get(&2), 0);
        assert!(sv.contains(&ID::new(1, 4)));
        assert!(!sv.contains(&ID::new(1, 5)));
    }

    #[test]
    fn test_round_trip() {
        let sv: StateVector = [(1, 10), (2, 3), (u64::from(u32::MAX) + 7, 1)]
            .into_iter()
            .collect();
        let bytes = sv.encode_v1();
        assert_eq!(StateVector::decode_v1(&bytes).unwrap(), sv);
    }

    #[test]
    fn test_deterministic_bytes() {
        let a: StateVector = [(1, 1), (2, 2), (3, 3)].into_iter().collect();
        let b: StateVector = [(3, 3), (1, 1), (2, 2)].into_iter().collect();
        assert_eq!(a.encode_v1(), b.encode_v1());
    }

    #[test]
    fn test_empty() {
        let sv = StateVector::new();
        assert_eq!(sv.encode_v1(), vec![1, 0]);
        assert!(StateVector::decode_v1(&[1, 0]).unwrap().is_empty());
    }

    #[test]
    fn test_truncated() {
        let sv: StateVector = [(300, 300)].into_iter().collect();
        let bytes = sv.encode_v1();
        assert!(StateVector::decode_v1(&bytes[..bytes.len() - 1]).is_err());
    }
}
