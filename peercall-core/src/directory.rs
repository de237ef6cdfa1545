//! Peer directory
//!
//! The directory service pushes the full set of online peers as one
//! comma-separated payload on every membership change. Each payload replaces
//! the previous roster wholesale; nothing is merged or diffed.
//!
//! Roster membership is advisory. A listed peer may already be gone or busy,
//! and a peer dropping out of the roster does not end a call in progress.

use crate::identity::PeerId;
use serde::{Deserialize, Serialize};

/// Ordered set of online peers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster(Vec<PeerId>);

impl Roster {
    /// Empty roster
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a broadcast payload
    ///
    /// Order is kept; empty entries and repeated ids are dropped.
    pub fn parse(payload: &str) -> Self {
        let mut peers: Vec<PeerId> = Vec::new();
        for entry in payload.split(',').map(str::trim) {
            if entry.is_empty() || peers.iter().any(|p| p.as_str() == entry) {
                continue;
            }
            peers.push(PeerId::new(entry));
        }
        Self(peers)
    }

    /// Encode as a broadcast payload
    pub fn to_payload(&self) -> String {
        self.0
            .iter()
            .map(PeerId::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Add a peer at the end; returns `false` if already present
    pub fn insert(&mut self, peer: PeerId) -> bool {
        if self.contains(&peer) {
            return false;
        }
        self.0.push(peer);
        true
    }

    /// Remove a peer; returns `false` if absent
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        let before = self.0.len();
        self.0.retain(|p| p != peer);
        self.0.len() != before
    }

    /// Membership test
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.0.contains(peer)
    }

    /// Number of peers
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no peer is online
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Peers in broadcast order
    pub fn iter(&self) -> impl Iterator<Item = &PeerId> {
        self.0.iter()
    }

    /// Peers in broadcast order, minus `excluded`
    pub fn without(&self, excluded: &PeerId) -> Vec<PeerId> {
        self.0.iter().filter(|p| *p != excluded).cloned().collect()
    }
}

/// Locally known roster
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    roster: Roster,
    updates: u64,
}

impl PeerDirectory {
    /// Directory with no broadcast applied yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a directory broadcast
    ///
    /// Returns `true` if the roster changed.
    pub fn on_roster_update(&mut self, payload: &str) -> bool {
        let roster = Roster::parse(payload);
        self.updates += 1;
        let changed = roster != self.roster;
        tracing::debug!(peers = roster.len(), changed, "Roster update applied");
        self.roster = roster;
        changed
    }

    /// Roster for display, excluding the local peer
    pub fn current_roster(&self, excluding: &PeerId) -> Vec<PeerId> {
        self.roster.without(excluding)
    }

    /// The full roster as last broadcast
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Whether `peer` was in the last broadcast
    pub fn is_online(&self, peer: &PeerId) -> bool {
        self.roster.contains(peer)
    }

    /// How many broadcasts have been applied
    pub fn update_count(&self) -> u64 {
        self.updates
    }
}
