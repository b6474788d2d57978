//! Per-peer activity recency.
//!
//! Session state only: nothing here is persisted. Entries are created on
//! first reference and never removed. Every timestamp only moves forward,
//! so late or reordered updates cannot make a peer look staler than it is.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::identity::PeerId;

/// Unix-millisecond timestamps of the last observed events for one peer.
/// Zero means "never".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityEntry {
    /// Last time a verified envelope by this peer was ingested
    pub last_seen: u64,
    /// Last time the user showed interest in this peer
    pub last_interest: u64,
    /// Last time the scheduler asked the network about this peer
    pub last_requested: u64,
}

#[derive(Debug, Default)]
pub struct ActivityTracker {
    entries: Mutex<HashMap<PeerId, ActivityEntry>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// We received an envelope authored by `peer`.
    pub fn note_seen(&self, peer: &PeerId, at: u64) {
        self.update(peer, |e| e.last_seen = e.last_seen.max(at));
    }

    /// The user looked at `peer`.
    pub fn note_interest(&self, peer: &PeerId, at: u64) {
        self.update(peer, |e| e.last_interest = e.last_interest.max(at));
    }

    /// A sync request for `peer` was scheduled.
    pub fn note_requested(&self, peer: &PeerId, at: u64) {
        self.update(peer, |e| e.last_requested = e.last_requested.max(at));
    }

    /// Current entry for a peer, creating an empty one if unknown.
    pub fn get(&self, peer: &PeerId) -> ActivityEntry {
        *self.entries.lock().entry(*peer).or_default()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.lock().contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn update(&self, peer: &PeerId, f: impl FnOnce(&mut ActivityEntry)) {
        f(self.entries.lock().entry(*peer).or_default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn peer(n: u8) -> PeerId {
        Keypair::from_seed(&[n; 32]).peer_id()
    }

    #[test]
    fn test_unknown_peer_is_created_lazily() {
        let tracker = ActivityTracker::new();
        let p = peer(1);
        assert!(!tracker.contains(&p));
        assert_eq!(tracker.get(&p), ActivityEntry::default());
        assert!(tracker.contains(&p));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_fields_are_independent() {
        let tracker = ActivityTracker::new();
        let p = peer(2);
        tracker.note_seen(&p, 10);
        tracker.note_interest(&p, 20);
        tracker.note_requested(&p, 30);
        assert_eq!(
            tracker.get(&p),
            ActivityEntry {
                last_seen: 10,
                last_interest: 20,
                last_requested: 30
            }
        );
    }

    #[test]
    fn test_older_updates_are_ignored() {
        let tracker = ActivityTracker::new();
        let p = peer(3);
        tracker.note_seen(&p, 100);
        tracker.note_seen(&p, 50);
        tracker.note_requested(&p, 200);
        tracker.note_requested(&p, 199);
        let entry = tracker.get(&p);
        assert_eq!(entry.last_seen, 100);
        assert_eq!(entry.last_requested, 200);
    }
}
