//! Network Layer
//!
//! Everything between the simulation and the wire: message framing, the
//! transport contract, rollback, the game event relay and the session that
//! drives them. The simulation in `game/` never sees a socket.

pub mod events;
pub mod lobby;
pub mod peer;
pub mod protocol;
pub mod rewind;
pub mod session;
pub mod transport;

pub use events::{GameEventMessage, GameEventsProtocol, RelayError};
pub use lobby::{ClientLobby, LobbyOutcome, ServerLobby};
pub use peer::{ConnectionState, Peer, PeerId, RttEstimate};
pub use protocol::{
    ControllerEventMessage, Delivery, LobbyMessage, ProtocolError, ProtocolType, StateSyncMessage,
};
pub use rewind::{RewindConfig, RewindError, RewindManager, RewindStats, RewindSummary};
pub use session::{RaceSession, Role, SessionStats};
pub use transport::{
    LoopbackHub, LoopbackTransport, MessageQueue, NetworkInput, QueueSender, Transport, TransportError,
};
