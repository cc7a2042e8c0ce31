//! Causal context tracking via Horizons
//!
//! A Horizon is a vector clock: for every actor it records the highest
//! change sequence number seen from that actor. Every change carries the
//! horizon its author had when it was made, which is what lets a loaded
//! snapshot be checked for causal completeness.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a replica (one engine instance)
pub type ActorId = String;

/// Sequence number within an actor's change stream, starting at 1
pub type SeqNum = u64;

/// Highest sequence number seen per actor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horizon {
    seen: BTreeMap<ActorId, SeqNum>,
}

impl Horizon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number seen from `actor` (0 if never seen)
    pub fn get(&self, actor: &str) -> SeqNum {
        self.seen.get(actor).copied().unwrap_or(0)
    }

    /// Record having seen change `seq` from `actor`. Never goes backwards.
    pub fn observe(&mut self, actor: &str, seq: SeqNum) {
        match self.seen.get_mut(actor) {
            Some(current) if *current >= seq => {}
            Some(current) => *current = seq,
            None => {
                self.seen.insert(actor.to_string(), seq);
            }
        }
    }

    pub fn has_seen(&self, actor: &str, seq: SeqNum) -> bool {
        self.get(actor) >= seq
    }

    /// True if this horizon has seen everything `other` has seen
    pub fn dominates(&self, other: &Horizon) -> bool {
        other.seen.iter().all(|(a, s)| self.get(a) >= *s)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, SeqNum)> {
        self.seen.iter().map(|(a, s)| (a, *s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_never_goes_backwards() {
        let mut h = Horizon::new();
        assert_eq!(h.get("A"), 0);

        h.observe("A", 4);
        h.observe("A", 2);
        assert_eq!(h.get("A"), 4);
        assert!(h.has_seen("A", 3));
        assert!(!h.has_seen("A", 5));
    }

    #[test]
    fn test_dominates() {
        let mut h1 = Horizon::new();
        h1.observe("A", 2);

        let mut h2 = Horizon::new();
        h2.observe("B", 1);

        assert!(!h1.dominates(&h2));
        assert!(!h2.dominates(&h1));

        h2.observe("A", 2);
        assert!(h2.dominates(&h1));
        assert!(!h1.dominates(&h2));
        assert!(h1.dominates(&Horizon::new()));
    }
}
