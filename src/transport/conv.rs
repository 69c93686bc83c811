//! Conversation id allocation.
//!
//! KCP sessions are scoped by (remote endpoint, conv), so each peer gets its
//! own independent conv space. Occupancy is kept as a sparse ordered set;
//! the first free id is re-derived from it on every allocation.

use std::collections::{BTreeSet, HashMap};

use crate::core::PeerKey;

/// Per-peer conv occupancy.
#[derive(Debug, Default)]
pub struct ConvTable {
    spaces: HashMap<PeerKey, BTreeSet<u32>>,
}

impl ConvTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the smallest conv not occupied for `peer`.
    pub fn allocate(&mut self, peer: PeerKey) -> u32 {
        let space = self.spaces.entry(peer).or_default();
        let mut conv = 0u32;
        for &used in space.iter() {
            if used != conv {
                break;
            }
            conv += 1;
        }
        space.insert(conv);
        conv
    }

    /// Mark `conv` occupied for `peer` without going through allocation.
    pub fn mark(&mut self, peer: PeerKey, conv: u32) {
        self.spaces.entry(peer).or_default().insert(conv);
    }

    /// Free `conv` for `peer`. Freeing an unoccupied conv is a no-op.
    pub fn release(&mut self, peer: PeerKey, conv: u32) {
        if let Some(space) = self.spaces.get_mut(&peer) {
            space.remove(&conv);
            if space.is_empty() {
                self.spaces.remove(&peer);
            }
        }
    }

    /// Check whether `conv` is occupied for `peer`.
    pub fn is_occupied(&self, peer: PeerKey, conv: u32) -> bool {
        self.spaces
            .get(&peer)
            .is_some_and(|space| space.contains(&conv))
    }

    /// Number of occupied convs for `peer`.
    pub fn occupied(&self, peer: PeerKey) -> usize {
        self.spaces.get(&peer).map_or(0, BTreeSet::len)
    }

    /// Number of peers with at least one occupied conv.
    pub fn peer_count(&self) -> usize {
        self.spaces.len()
    }
}
