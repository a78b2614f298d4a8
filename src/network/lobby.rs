//! Lobby Handshake
//!
//! Gets every participant into the race at the same world tick.
//!
//! ```text
//!   client                         server
//!     │ ◄──── KartAssigned{kart} ─── │  on connect
//!     │ ───── WorldLoaded ─────────► │
//!     │                              │  all karts loaded?
//!     │ ◄──── StartRace{freq} ────── │  broadcast, then server_ready()
//!   server_ready()                   │
//! ```
//!
//! Ping/pong runs on top for RTT estimates. The ping nonce is the sender's
//! session tick, so no per-ping bookkeeping is needed.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::game::controls::KartId;
use crate::network::peer::{ConnectionState, Peer, PeerId};
use crate::network::protocol::{Delivery, LobbyMessage};
use crate::network::transport::Transport;

/// What the session has to do after a lobby message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyOutcome {
    /// Nothing.
    None,
    /// Race starts now with the given state frequency.
    StartRace {
        /// Ticks between authoritative states.
        state_frequency: u32,
    },
    /// A client left; its kart (if any) must be eliminated.
    PeerLeft {
        /// Who left.
        peer: PeerId,
        /// Their kart.
        kart: Option<KartId>,
    },
    /// The server left.
    ServerLeft,
}

fn send_lobby<T: Transport + ?Sized>(transport: &mut T, peer: PeerId, msg: &LobbyMessage) {
    match msg.to_packet() {
        Ok(packet) => {
            if let Err(e) = transport.send(peer, Delivery::Reliable, packet) {
                debug!(peer = %peer, error = %e, "Lobby message not sent");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode lobby message"),
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// Server half: assigns karts and decides when the race starts.
#[derive(Debug)]
pub struct ServerLobby {
    peers: BTreeMap<PeerId, Peer>,
    num_karts: u8,
    state_frequency: u32,
    started: bool,
}

impl ServerLobby {
    /// Lobby for a race with `num_karts` karts, one per client.
    pub fn new(num_karts: u8, state_frequency: u32) -> Self {
        Self {
            peers: BTreeMap::new(),
            num_karts,
            state_frequency,
            started: false,
        }
    }

    /// True once `StartRace` was broadcast.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Known peers.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// One peer.
    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Kart driven by `peer`.
    pub fn kart_of(&self, peer: PeerId) -> Option<KartId> {
        self.peers.get(&peer).and_then(|p| p.kart)
    }

    fn free_kart(&self) -> Option<KartId> {
        (0..self.num_karts).find(|k| !self.peers.values().any(|p| p.kart == Some(*k)))
    }

    /// A transport-level connection arrived. Returns the assigned kart;
    /// when the race is full or already running the peer is turned away.
    pub fn peer_connected<T: Transport + ?Sized>(&mut self, transport: &mut T, id: PeerId) -> Option<KartId> {
        let kart = if self.started { None } else { self.free_kart() };
        let Some(kart) = kart else {
            warn!(peer = %id, started = self.started, "No kart for peer; disconnecting");
            send_lobby(transport, id, &LobbyMessage::Disconnect);
            transport.disconnect(id);
            return None;
        };
        let mut peer = Peer::new(id);
        peer.state = ConnectionState::Connected;
        peer.kart = Some(kart);
        self.peers.insert(id, peer);
        info!(peer = %id, kart, "Peer joined");
        send_lobby(transport, id, &LobbyMessage::KartAssigned { kart });
        Some(kart)
    }

    /// The transport lost a peer.
    pub fn peer_disconnected(&mut self, id: PeerId) -> Option<KartId> {
        let peer = self.peers.remove(&id)?;
        info!(peer = %id, kart = ?peer.kart, "Peer left");
        peer.kart
    }

    /// Handle a lobby message from a client.
    pub fn handle<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        from: PeerId,
        msg: LobbyMessage,
        now: u64,
    ) -> LobbyOutcome {
        if !self.peers.contains_key(&from) {
            debug!(peer = %from, ?msg, "Lobby message from unknown peer");
            return LobbyOutcome::None;
        }
        match msg {
            LobbyMessage::WorldLoaded => {
                if let Some(peer) = self.peers.get_mut(&from) {
                    peer.world_loaded = true;
                }
                self.try_start(transport)
            }
            LobbyMessage::Ping { nonce } => {
                send_lobby(transport, from, &LobbyMessage::Pong { nonce });
                LobbyOutcome::None
            }
            LobbyMessage::Pong { nonce } => {
                if let Some(peer) = self.peers.get_mut(&from) {
                    let sample = now.saturating_sub(nonce).min(u64::from(u32::MAX)) as u32;
                    peer.rtt.record(sample);
                }
                LobbyOutcome::None
            }
            LobbyMessage::Disconnect => {
                if let Some(peer) = self.peers.get_mut(&from) {
                    peer.state = ConnectionState::Disconnecting;
                }
                transport.disconnect(from);
                let kart = self.peer_disconnected(from);
                LobbyOutcome::PeerLeft { peer: from, kart }
            }
            other => {
                warn!(peer = %from, msg = ?other, "Unexpected lobby message from client");
                LobbyOutcome::None
            }
        }
    }

    fn try_start<T: Transport + ?Sized>(&mut self, transport: &mut T) -> LobbyOutcome {
        if self.started {
            return LobbyOutcome::None;
        }
        let loaded = self.peers.values().filter(|p| p.world_loaded).count();
        if loaded < self.num_karts as usize {
            debug!(loaded, needed = self.num_karts, "Waiting for peers");
            return LobbyOutcome::None;
        }
        self.started = true;
        let msg = LobbyMessage::StartRace {
            state_frequency: self.state_frequency,
        };
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            send_lobby(transport, id, &msg);
        }
        info!(peers = self.peers.len(), state_frequency = self.state_frequency, "Race starting");
        LobbyOutcome::StartRace {
            state_frequency: self.state_frequency,
        }
    }

    /// Send a ping to every peer.
    pub fn ping<T: Transport + ?Sized>(&self, transport: &mut T, now: u64) {
        for id in self.peers.keys() {
            send_lobby(transport, *id, &LobbyMessage::Ping { nonce: now });
        }
    }
}

// =============================================================================
// CLIENT
// =============================================================================

/// Client half: reports readiness and waits for the start signal.
#[derive(Debug, Default)]
pub struct ClientLobby {
    server: Option<Peer>,
    kart: Option<KartId>,
    state_frequency: Option<u32>,
    server_lost: bool,
}

impl ClientLobby {
    /// Fresh lobby, not connected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Server peer id.
    pub fn server(&self) -> Option<PeerId> {
        self.server.as_ref().map(|p| p.id)
    }

    /// Server peer record (RTT lives here).
    pub fn server_peer(&self) -> Option<&Peer> {
        self.server.as_ref()
    }

    /// Kart assigned by the server.
    pub fn kart(&self) -> Option<KartId> {
        self.kart
    }

    /// Negotiated state frequency, once started.
    pub fn state_frequency(&self) -> Option<u32> {
        self.state_frequency
    }

    /// True once the server went away.
    pub fn server_lost(&self) -> bool {
        self.server_lost
    }

    /// Connected to the server; the world is loaded immediately.
    pub fn server_connected<T: Transport + ?Sized>(&mut self, transport: &mut T, id: PeerId) {
        if self.server.is_some() {
            warn!(peer = %id, "Second connection ignored");
            return;
        }
        let mut peer = Peer::new(id);
        peer.state = ConnectionState::Connected;
        self.server = Some(peer);
        send_lobby(transport, id, &LobbyMessage::WorldLoaded);
        debug!(server = %id, "World loaded sent");
    }

    /// The transport lost a peer. True if it was the server.
    pub fn peer_disconnected(&mut self, id: PeerId) -> bool {
        match &mut self.server {
            Some(peer) if peer.id == id => {
                peer.state = ConnectionState::Disconnected;
                self.server_lost = true;
                warn!(server = %id, "Server connection lost");
                true
            }
            _ => false,
        }
    }

    /// Handle a lobby message. Messages from anyone but the server are
    /// ignored.
    pub fn handle<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        from: PeerId,
        msg: LobbyMessage,
        now: u64,
    ) -> LobbyOutcome {
        if self.server() != Some(from) {
            warn!(peer = %from, "Lobby message from non-server peer ignored");
            return LobbyOutcome::None;
        }
        match msg {
            LobbyMessage::KartAssigned { kart } => {
                info!(kart, "Kart assigned");
                self.kart = Some(kart);
                LobbyOutcome::None
            }
            LobbyMessage::StartRace { state_frequency } => {
                if self.state_frequency.is_some() {
                    return LobbyOutcome::None;
                }
                self.state_frequency = Some(state_frequency);
                LobbyOutcome::StartRace { state_frequency }
            }
            LobbyMessage::Ping { nonce } => {
                send_lobby(transport, from, &LobbyMessage::Pong { nonce });
                LobbyOutcome::None
            }
            LobbyMessage::Pong { nonce } => {
                if let Some(peer) = &mut self.server {
                    peer.rtt.record(now.saturating_sub(nonce).min(u64::from(u32::MAX)) as u32);
                }
                LobbyOutcome::None
            }
            LobbyMessage::Disconnect => {
                self.peer_disconnected(from);
                LobbyOutcome::ServerLeft
            }
            LobbyMessage::WorldLoaded => {
                warn!("WorldLoaded from server ignored");
                LobbyOutcome::None
            }
        }
    }

    /// Ping the server.
    pub fn ping<T: Transport + ?Sized>(&self, transport: &mut T, now: u64) {
        if let Some(id) = self.server() {
            send_lobby(transport, id, &LobbyMessage::Ping { nonce: now });
        }
    }

    /// Tell the server we are leaving.
    pub fn leave<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        if let Some(id) = self.server() {
            send_lobby(transport, id, &LobbyMessage::Disconnect);
        }
    }
}
