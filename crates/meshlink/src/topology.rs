//! Connection topologies
//!
//! A topology decides, from the set of known peers, which peers the local
//! peer wants a connection with. It is pure; the swarm re-runs it whenever
//! membership changes.

use std::collections::BTreeSet;
use std::fmt;

use crate::keys::PeerId;

pub trait Topology: Send + Sync + fmt::Debug {
    /// Peers `self_id` should be connected to, given everything it knows
    fn compute_targets(&self, known: &BTreeSet<PeerId>, self_id: &PeerId) -> BTreeSet<PeerId>;
}

/// Every peer connects to every other peer
#[derive(Debug, Clone, Copy, Default)]
pub struct FullyConnected;

impl Topology for FullyConnected {
    fn compute_targets(&self, known: &BTreeSet<PeerId>, self_id: &PeerId) -> BTreeSet<PeerId> {
        known.iter().filter(|p| *p != self_id).copied().collect()
    }
}

/// One designated center; everyone else connects only to it
#[derive(Debug, Clone, Copy)]
pub struct Star {
    center: PeerId,
}

impl Star {
    pub fn new(center: PeerId) -> Self {
        Self { center }
    }

    pub fn center(&self) -> &PeerId {
        &self.center
    }
}

impl Topology for Star {
    fn compute_targets(&self, known: &BTreeSet<PeerId>, self_id: &PeerId) -> BTreeSet<PeerId> {
        if *self_id == self.center {
            known.iter().filter(|p| *p != self_id).copied().collect()
        } else if known.contains(&self.center) {
            BTreeSet::from([self.center])
        } else {
            BTreeSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: usize) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = (0..n).map(|_| PeerId::random()).collect();
        peers.sort();
        peers
    }

    #[test]
    fn test_fully_connected_excludes_self() {
        let p = peers(4);
        let known: BTreeSet<PeerId> = p.iter().copied().collect();
        let targets = FullyConnected.compute_targets(&known, &p[0]);
        assert_eq!(targets.len(), 3);
        assert!(!targets.contains(&p[0]));
    }

    #[test]
    fn test_fully_connected_is_symmetric() {
        let p = peers(5);
        let known: BTreeSet<PeerId> = p.iter().copied().collect();
        for a in &p {
            for b in FullyConnected.compute_targets(&known, a) {
                assert!(FullyConnected.compute_targets(&known, &b).contains(a));
            }
        }
    }

    #[test]
    fn test_star_center_connects_to_all() {
        let p = peers(4);
        let known: BTreeSet<PeerId> = p.iter().copied().collect();
        let star = Star::new(p[2]);
        assert_eq!(star.compute_targets(&known, &p[2]).len(), 3);
    }

    #[test]
    fn test_star_leaf_connects_to_center_only() {
        let p = peers(4);
        let known: BTreeSet<PeerId> = p.iter().copied().collect();
        let star = Star::new(p[2]);
        assert_eq!(star.compute_targets(&known, &p[0]), BTreeSet::from([p[2]]));
    }

    #[test]
    fn test_star_leaf_without_center() {
        let p = peers(3);
        let known: BTreeSet<PeerId> = p[..2].iter().copied().collect();
        let star = Star::new(p[2]);
        assert!(star.compute_targets(&known, &p[0]).is_empty());
    }

    #[test]
    fn test_empty_known_set() {
        let me = PeerId::random();
        assert!(FullyConnected.compute_targets(&BTreeSet::new(), &me).is_empty());
        assert!(Star::new(me).compute_targets(&BTreeSet::new(), &me).is_empty());
    }
}
