//! Presence hub
//!
//! Server side of the directory: tracks which peers are connected and
//! publishes the whole roster to every subscriber whenever someone joins or
//! leaves. Subscribers only ever need the latest payload.

use crate::directory::Roster;
use crate::identity::PeerId;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

/// Presence errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    /// The id cannot be carried in a roster payload
    #[error("Invalid peer id: {0:?}")]
    InvalidId(String),
}

/// Default number of payloads buffered per subscriber
const DEFAULT_CAPACITY: usize = 64;

/// Connected-peer registry with roster broadcast
#[derive(Debug)]
pub struct PresenceHub {
    roster: Mutex<Roster>,
    sender: broadcast::Sender<String>,
}

impl PresenceHub {
    /// Create a hub
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a hub buffering `capacity` payloads per subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            roster: Mutex::new(Roster::new()),
            sender,
        }
    }

    /// Receive every roster payload published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Register a connected peer and publish the roster
    ///
    /// Joining twice publishes the unchanged roster again.
    ///
    /// # Errors
    ///
    /// Returns error if the id cannot be carried in a roster payload
    pub fn join(&self, peer: PeerId) -> Result<String, PresenceError> {
        if !peer.is_roster_safe() {
            return Err(PresenceError::InvalidId(peer.to_string()));
        }
        let mut roster = self.roster.lock();
        roster.insert(peer.clone());
        let payload = roster.to_payload();
        tracing::info!(peer = %peer, "Peer joined");
        // Published under the lock: payload order is roster order
        self.publish(&payload);
        Ok(payload)
    }

    /// Unregister a peer and publish the roster
    ///
    /// Returns `None` if the peer was not registered.
    pub fn leave(&self, peer: &PeerId) -> Option<String> {
        let mut roster = self.roster.lock();
        if !roster.remove(peer) {
            return None;
        }
        let payload = roster.to_payload();
        tracing::info!(peer = %peer, "Peer left");
        self.publish(&payload);
        Some(payload)
    }

    /// Current roster
    pub fn snapshot(&self) -> Roster {
        self.roster.lock().clone()
    }

    fn publish(&self, payload: &str) {
        // No subscribers is not an error
        let receivers = self.sender.send(payload.to_string()).unwrap_or(0);
        tracing::debug!(receivers, payload = %payload, "Roster published");
    }
}

impl Default for PresenceHub {
    fn default() -> Self {
        Self::new()
    }
}
