//! Race Session
//!
//! Top-level context for one participant. Owns the world, the rewind
//! manager, the event relay, the lobby and the transport, and advances all
//! of them with `update(ticks)`.
//!
//! ```text
//!  per tick (server)                     per tick (client)
//!  ─────────────────                     ─────────────────
//!  drain inputs                          drain inputs
//!   ├ lobby / kart assignment             ├ lobby / start signal
//!   ├ controller events → timeline        ├ controller events → timeline
//!   └ disconnect → game event → timeline  ├ state sync → pending state
//!  save record, send StateSync           └ game events → timeline
//!  play events, step world               rewind + replay if due
//!  finish-line check → game events       send own input, save record
//!  ping peers                            play events, step world
//! ```
//!
//! The server never rolls back. Late client input is applied at the
//! current server tick and forwarded with that tick; the sender gets the
//! retimed copy as well so its own timeline converges. Finish and
//! disconnect events are stamped with the server tick and go through the
//! same timeline on both sides.

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::{NetworkMode, RaceConfig};
use crate::error::NetError;
use crate::game::clock::Phase;
use crate::game::controls::{KartControlEvent, KartControls, KartId};
use crate::game::rewinder::RewindWorld;
use crate::game::world::RaceWorld;
use crate::network::events::{GameEventMessage, GameEventsProtocol, RelayError};
use crate::network::lobby::{ClientLobby, LobbyOutcome, ServerLobby};
use crate::network::peer::PeerId;
use crate::network::protocol::{
    decode_packet, ControllerEventMessage, Delivery, LobbyMessage, ProtocolError, ProtocolType,
    StateSyncMessage,
};
use crate::network::rewind::{RewindManager, RewindStats};
use crate::network::transport::{MessageQueue, NetworkInput, Transport};

/// Which side of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Authoritative; never rolls back.
    Server,
    /// Predicts locally, reconciles with the server.
    Client,
}

/// Session-level counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Packets taken from the queue.
    pub packets_received: u64,
    /// Packets dropped as malformed or unexpected.
    pub packets_dropped: u64,
    /// State sync messages sent (server).
    pub states_sent: u64,
    /// Controller events sent or forwarded.
    pub inputs_sent: u64,
    /// Rollbacks performed (client).
    pub rewinds: u64,
}

#[derive(Debug)]
enum Lobby {
    Server(ServerLobby),
    Client(ClientLobby),
}

/// One participant in a networked race.
#[derive(Debug)]
pub struct RaceSession<T: Transport> {
    role: Role,
    config: RaceConfig,
    world: RaceWorld,
    rewind: RewindManager,
    events: GameEventsProtocol,
    lobby: Lobby,
    transport: T,
    queue: MessageQueue,
    local_controls: Option<KartControls>,
    sent_controls: KartControls,
    session_ticks: u64,
    stats: SessionStats,
}

impl<T: Transport> RaceSession<T> {
    /// Authoritative session for a race with `num_karts` client karts.
    pub fn server(config: RaceConfig, num_karts: u8, transport: T, queue: MessageQueue) -> Self {
        let lobby = Lobby::Server(ServerLobby::new(num_karts, config.state_frequency));
        Self::new(Role::Server, config, num_karts, lobby, transport, queue)
    }

    /// Predicting session.
    pub fn client(config: RaceConfig, num_karts: u8, transport: T, queue: MessageQueue) -> Self {
        Self::new(Role::Client, config, num_karts, Lobby::Client(ClientLobby::new()), transport, queue)
    }

    fn new(role: Role, mut config: RaceConfig, num_karts: u8, lobby: Lobby, transport: T, queue: MessageQueue) -> Self {
        if !config.network_mode.is_networking() {
            debug!(?role, "Offline config used for a networked session; switching to LAN");
            config.network_mode = NetworkMode::Lan;
        }
        let world = RaceWorld::new(&config, num_karts);
        let rewind = RewindManager::new(config.rewind_config());
        info!(?role, peer = %transport.local_id(), num_karts, "Race session created");
        Self {
            role,
            world,
            rewind,
            events: GameEventsProtocol::new(role == Role::Server),
            lobby,
            transport,
            queue,
            local_controls: None,
            sent_controls: KartControls::new(),
            session_ticks: 0,
            stats: SessionStats::default(),
            config,
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Configuration in effect.
    pub fn config(&self) -> &RaceConfig {
        &self.config
    }

    /// Simulated world.
    pub fn world(&self) -> &RaceWorld {
        &self.world
    }

    /// Mutable world (tests, offline tools).
    pub fn world_mut(&mut self) -> &mut RaceWorld {
        &mut self.world
    }

    /// Rewind manager.
    pub fn rewind(&self) -> &RewindManager {
        &self.rewind
    }

    /// Rewind counters.
    pub fn rewind_stats(&self) -> &RewindStats {
        self.rewind.stats()
    }

    /// Game event relay.
    pub fn game_events(&self) -> &GameEventsProtocol {
        &self.events
    }

    /// Session counters.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Kart this client drives.
    pub fn local_kart(&self) -> Option<KartId> {
        match &self.lobby {
            Lobby::Client(lobby) => lobby.kart(),
            Lobby::Server(_) => None,
        }
    }

    /// Kart driven by `peer` (server).
    pub fn kart_of(&self, peer: PeerId) -> Option<KartId> {
        match &self.lobby {
            Lobby::Server(lobby) => lobby.kart_of(peer),
            Lobby::Client(_) => None,
        }
    }

    /// Smoothed RTT to the server in ticks (client).
    pub fn server_rtt(&self) -> Option<f32> {
        match &self.lobby {
            Lobby::Client(lobby) => lobby.server_peer().and_then(|p| p.rtt.smoothed()),
            Lobby::Server(_) => None,
        }
    }

    /// True once the server connection was lost (client).
    pub fn server_lost(&self) -> bool {
        matches!(&self.lobby, Lobby::Client(lobby) if lobby.server_lost())
    }

    /// True once the race phase machine reached its end phases.
    pub fn is_race_over(&self) -> bool {
        self.world.is_race_over()
    }

    /// Controls to use from the next tick on (client).
    pub fn set_local_controls(&mut self, controls: KartControls) {
        self.local_controls = Some(controls);
    }

    // =========================================================================
    // UPDATE
    // =========================================================================

    /// Advance `ticks` fixed steps.
    #[instrument(level = "debug", skip(self), fields(role = ?self.role, tick = self.world.tick()))]
    pub fn update(&mut self, ticks: u32) {
        for _ in 0..ticks {
            match self.role {
                Role::Server => self.server_tick(),
                Role::Client => self.client_tick(),
            }
            self.session_ticks += 1;
        }
    }

    /// Leave the race (client) or drop every peer (server).
    pub fn disconnect(&mut self) {
        match &mut self.lobby {
            Lobby::Client(lobby) => lobby.leave(&mut self.transport),
            Lobby::Server(_) => {
                if let Ok(packet) = LobbyMessage::Disconnect.to_packet() {
                    self.transport.broadcast(Delivery::Reliable, &packet);
                }
            }
        }
        for peer in self.transport.peers() {
            self.transport.disconnect(peer);
        }
    }

    fn drain_inputs(&mut self) {
        for input in self.queue.drain() {
            let result = match input {
                NetworkInput::Packet { from, bytes } => {
                    self.stats.packets_received += 1;
                    match self.role {
                        Role::Server => self.server_packet(from, &bytes),
                        Role::Client => self.client_packet(from, &bytes),
                    }
                    .map_err(|e| (from, e))
                }
                NetworkInput::Connected(peer) => {
                    self.peer_connected(peer);
                    Ok(())
                }
                NetworkInput::Disconnected(peer) => {
                    self.peer_disconnected(peer);
                    Ok(())
                }
            };
            if let Err((from, e)) = result {
                self.stats.packets_dropped += 1;
                warn!(peer = %from, kind = %e.kind(), error = %e, "Dropped packet");
            }
        }
    }

    fn peer_connected(&mut self, peer: PeerId) {
        match &mut self.lobby {
            Lobby::Server(lobby) => {
                lobby.peer_connected(&mut self.transport, peer);
            }
            Lobby::Client(lobby) => lobby.server_connected(&mut self.transport, peer),
        }
    }

    fn peer_disconnected(&mut self, peer: PeerId) {
        let outcome = match &mut self.lobby {
            Lobby::Server(lobby) => LobbyOutcome::PeerLeft {
                peer,
                kart: lobby.peer_disconnected(peer),
            },
            Lobby::Client(lobby) => {
                if lobby.peer_disconnected(peer) {
                    LobbyOutcome::ServerLeft
                } else {
                    LobbyOutcome::None
                }
            }
        };
        self.apply_outcome(outcome);
    }

    fn handle_lobby(&mut self, from: PeerId, payload: &[u8]) -> Result<(), NetError> {
        let msg = LobbyMessage::from_bytes(payload).map_err(ProtocolError::from)?;
        let now = self.session_ticks;
        let outcome = match &mut self.lobby {
            Lobby::Server(lobby) => lobby.handle(&mut self.transport, from, msg, now),
            Lobby::Client(lobby) => lobby.handle(&mut self.transport, from, msg, now),
        };
        self.apply_outcome(outcome);
        Ok(())
    }

    fn apply_outcome(&mut self, outcome: LobbyOutcome) {
        match outcome {
            LobbyOutcome::None => {}
            LobbyOutcome::StartRace { state_frequency } => {
                self.rewind.set_state_frequency(state_frequency);
                self.world.clock_mut().server_ready();
                info!(role = ?self.role, state_frequency, "Server ready");
            }
            LobbyOutcome::PeerLeft { kart: Some(kart), .. } => self.eliminate_kart(kart),
            LobbyOutcome::PeerLeft { kart: None, .. } => {}
            LobbyOutcome::ServerLeft => self.rewind.forget_peer_states(),
        }
    }

    // =========================================================================
    // SERVER
    // =========================================================================

    fn server_tick(&mut self) {
        self.drain_inputs();

        let now = self.world.tick();
        if self.world.clock().has_started() && self.rewind.should_save_state(now) {
            self.rewind.save_local_state(&self.world);
            if self.world.clock().karts_can_move() {
                self.send_state(now);
            }
        }
        self.rewind.play_events_till(&mut self.world, now);
        self.world.step();
        self.check_finish_line();

        let interval = u64::from(self.config.ping_interval_ticks);
        if interval > 0 && self.session_ticks % interval == 0 {
            if let Lobby::Server(lobby) = &self.lobby {
                lobby.ping(&mut self.transport, self.session_ticks);
            }
        }
    }

    fn server_packet(&mut self, from: PeerId, bytes: &[u8]) -> Result<(), NetError> {
        let (protocol, payload) = decode_packet(bytes)?;
        match protocol {
            ProtocolType::LobbyControl => self.handle_lobby(from, payload),
            ProtocolType::ControllerEvents => {
                let msg = ControllerEventMessage::decode(payload)?;
                self.server_controller_event(from, msg)
            }
            ProtocolType::GameEvents => {
                self.events.receive(&self.world, payload)?;
                Ok(())
            }
            ProtocolType::StateSync => Err(ProtocolError::Unexpected(protocol).into()),
        }
    }

    fn server_controller_event(&mut self, from: PeerId, msg: ControllerEventMessage) -> Result<(), NetError> {
        let kart = msg.event.kart;
        if self.kart_of(from) != Some(kart) {
            return Err(ProtocolError::NotOwner { kart }.into());
        }
        let now = self.world.tick();
        let tick = msg.tick.max(now);
        if tick != msg.tick {
            debug!(kart, sent = msg.tick, applied = tick, "Late input retimed");
        }
        self.rewind.add_network_event(tick, msg.event);

        let forward = ControllerEventMessage { tick, event: msg.event }.to_packet();
        if tick != msg.tick {
            if let Err(e) = self.transport.send(from, Delivery::Reliable, forward.clone()) {
                debug!(peer = %from, error = %e, "Retimed input not echoed");
            }
        }
        self.transport.broadcast_except(from, Delivery::Reliable, &forward);
        self.stats.inputs_sent += 1;
        Ok(())
    }

    fn send_state(&mut self, tick: u32) {
        let msg = StateSyncMessage {
            tick,
            states: self.world.save_entities(),
        };
        self.transport.broadcast(Delivery::Unreliable, &msg.to_packet());
        self.stats.states_sent += 1;
    }

    fn check_finish_line(&mut self) {
        if self.world.phase() != Phase::Race {
            return;
        }
        let crossed: Vec<KartId> = self
            .world
            .karts()
            .iter()
            .filter(|k| !k.is_finished() && !k.is_eliminated())
            .filter(|k| k.transform().origin.z >= self.config.finish_line)
            .map(|k| k.id())
            .collect();
        for kart in crossed {
            let result = self.events.kart_finished_race(&self.world, kart);
            self.publish_game_event(kart, result);
        }
    }

    fn eliminate_kart(&mut self, kart: KartId) {
        let result = self.events.eliminate_player(&self.world, kart);
        self.publish_game_event(kart, result);
    }

    /// Queue a server-decided event on the local timeline and send it out.
    fn publish_game_event(&mut self, kart: KartId, result: Result<Option<GameEventMessage>, RelayError>) {
        match result {
            Ok(Some(msg)) => {
                self.rewind.add_local_event(msg.tick, msg.event);
                self.transport.broadcast(Delivery::Reliable, &msg.to_packet());
            }
            Ok(None) => {}
            Err(e) => warn!(kart, error = %e, "Game event not relayed"),
        }
    }

    // =========================================================================
    // CLIENT
    // =========================================================================

    fn client_tick(&mut self) {
        self.drain_inputs();

        let now = self.world.tick();
        if self.rewind.needs_rewind(now) {
            match self.rewind.rewind_and_replay(&mut self.world) {
                Ok(Some(summary)) => {
                    self.stats.rewinds += 1;
                    for e in &summary.errors {
                        warn!(error = %e, "Rewind error");
                    }
                    debug!(
                        from = summary.from_tick,
                        to = summary.to_tick,
                        replayed = summary.replayed_ticks,
                        "Rolled back"
                    );
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Rewind skipped"),
            }
        }

        if self.world.clock().has_started() {
            self.send_local_controls(now);
            if self.rewind.should_save_state(now) {
                self.rewind.save_local_state(&self.world);
            }
        }
        self.rewind.play_events_till(&mut self.world, now);
        self.world.step();
        self.world.update_graphics();

        let interval = u64::from(self.config.ping_interval_ticks);
        if interval > 0 && self.session_ticks % interval == 0 {
            if let Lobby::Client(lobby) = &self.lobby {
                lobby.ping(&mut self.transport, self.session_ticks);
            }
        }
    }

    fn client_packet(&mut self, from: PeerId, bytes: &[u8]) -> Result<(), NetError> {
        let server = match &self.lobby {
            Lobby::Client(lobby) => lobby.server(),
            Lobby::Server(_) => None,
        };
        if server != Some(from) {
            return Err(ProtocolError::Unexpected(decode_packet(bytes)?.0).into());
        }
        let (protocol, payload) = decode_packet(bytes)?;
        match protocol {
            ProtocolType::LobbyControl => self.handle_lobby(from, payload),
            ProtocolType::ControllerEvents => {
                let msg = ControllerEventMessage::decode(payload)?;
                self.rewind.add_network_event(msg.tick, msg.event);
                Ok(())
            }
            ProtocolType::StateSync => {
                let msg = StateSyncMessage::decode(payload)?;
                if let Err(e) = self.rewind.receive_authoritative_state(msg.tick, msg.states) {
                    debug!(error = %e, "State sync ignored");
                }
                Ok(())
            }
            ProtocolType::GameEvents => {
                if let Some(msg) = self.events.receive(&self.world, payload)? {
                    if !self.rewind.add_network_event(msg.tick, msg.event) {
                        debug!(tick = msg.tick, "Game event below history; applied now");
                        self.world.apply_game_event(&msg.event);
                    }
                }
                Ok(())
            }
        }
    }

    fn send_local_controls(&mut self, now: u32) {
        let (kart, server) = match &self.lobby {
            Lobby::Client(lobby) => (lobby.kart(), lobby.server()),
            Lobby::Server(_) => return,
        };
        let (Some(kart), Some(server)) = (kart, server) else {
            return;
        };
        let Some(controls) = self.local_controls.take() else {
            return;
        };
        if controls == self.sent_controls {
            return;
        }
        self.sent_controls = controls;
        let event = KartControlEvent { kart, controls };
        self.rewind.add_local_event(now, event);
        let packet = ControllerEventMessage { tick: now, event }.to_packet();
        match self.transport.send(server, Delivery::Reliable, packet) {
            Ok(()) => self.stats.inputs_sent += 1,
            Err(e) => debug!(error = %e, "Input not sent"),
        }
    }
}
