//! Peer Bookkeeping
//!
//! Connection state and round-trip estimate for each remote endpoint.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::game::controls::KartId;

/// Opaque handle for a remote endpoint, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport connected, lobby handshake not done.
    Connecting,
    /// Fully joined.
    Connected,
    /// Disconnect requested, not yet confirmed.
    Disconnecting,
    /// Gone.
    Disconnected,
}

/// Smoothed round-trip time, in ticks.
#[derive(Debug, Clone, Copy, Default)]
pub struct RttEstimate {
    smoothed: Option<f32>,
    last: u32,
}

impl RttEstimate {
    /// Weight of a new sample.
    const ALPHA: f32 = 0.125;

    /// Add a sample.
    pub fn record(&mut self, sample_ticks: u32) {
        self.last = sample_ticks;
        let sample = sample_ticks as f32;
        self.smoothed = Some(match self.smoothed {
            None => sample,
            Some(prev) => prev + (sample - prev) * Self::ALPHA,
        });
    }

    /// Smoothed value, if any sample arrived.
    pub fn smoothed(&self) -> Option<f32> {
        self.smoothed
    }

    /// Most recent raw sample.
    pub fn last(&self) -> u32 {
        self.last
    }
}

/// Everything the session tracks about one remote endpoint.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Transport handle.
    pub id: PeerId,
    /// Lifecycle.
    pub state: ConnectionState,
    /// Round-trip estimate.
    pub rtt: RttEstimate,
    /// Kart driven by this peer, assigned by the server.
    pub kart: Option<KartId>,
    /// Peer reported that its world finished loading.
    pub world_loaded: bool,
}

impl Peer {
    /// New connecting peer.
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
            rtt: RttEstimate::default(),
            kart: None,
            world_loaded: false,
        }
    }

    /// True unless disconnecting or gone.
    pub fn is_active(&self) -> bool {
        matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_smoothing() {
        let mut rtt = RttEstimate::default();
        assert_eq!(rtt.smoothed(), None);
        rtt.record(16);
        assert_eq!(rtt.smoothed(), Some(16.0));
        rtt.record(24);
        assert_eq!(rtt.smoothed(), Some(17.0));
        assert_eq!(rtt.last(), 24);
    }

    #[test]
    fn test_peer_lifecycle() {
        let mut peer = Peer::new(PeerId(3));
        assert!(peer.is_active());
        assert_eq!(peer.id.to_string(), "peer#3");
        peer.state = ConnectionState::Disconnecting;
        assert!(!peer.is_active());
    }
}
