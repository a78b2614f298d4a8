//! Transport Contract
//!
//! The simulation never touches sockets. A transport sends framed packets to
//! peers; everything inbound lands in a [`MessageQueue`] that the session
//! drains once per tick.
//!
//! ```text
//!  ┌────────────┐  send/broadcast   ┌─────────────┐
//!  │ RaceSession│ ────────────────► │  Transport  │ ──► wire / loopback
//!  │            │                   └─────────────┘
//!  │   drain()  │ ◄── MessageQueue ◄── QueueSender ◄── receive task
//!  └────────────┘     (tokio mpsc)
//! ```
//!
//! [`LoopbackHub`] is an in-process star network (one server, many clients)
//! with tick-based latency and optional loss or reordering of unreliable
//! packets.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::network::peer::PeerId;
use crate::network::protocol::Delivery;

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Target peer is not (or no longer) connected.
    #[error("{0} is disconnected")]
    PeerDisconnected(PeerId),

    /// The receiving queue was dropped.
    #[error("message queue closed")]
    QueueClosed,
}

/// Something that arrived from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkInput {
    /// A framed packet.
    Packet {
        /// Sender.
        from: PeerId,
        /// `[protocol u8][payload]`.
        bytes: Vec<u8>,
    },
    /// A peer connected.
    Connected(PeerId),
    /// A peer went away.
    Disconnected(PeerId),
}

/// Outbound half of a transport.
pub trait Transport {
    /// Our own handle.
    fn local_id(&self) -> PeerId;

    /// Send a packet to one peer.
    fn send(&mut self, peer: PeerId, delivery: Delivery, packet: Vec<u8>) -> Result<(), TransportError>;

    /// Connected peers.
    fn peers(&self) -> Vec<PeerId>;

    /// Close the link to a peer.
    fn disconnect(&mut self, peer: PeerId);

    /// Send to every connected peer, skipping ones that vanished meanwhile.
    fn broadcast(&mut self, delivery: Delivery, packet: &[u8]) {
        for peer in self.peers() {
            if let Err(e) = self.send(peer, delivery, packet.to_vec()) {
                debug!(peer = %peer, error = %e, "Broadcast skipped peer");
            }
        }
    }

    /// Send to every connected peer except `skip`.
    fn broadcast_except(&mut self, skip: PeerId, delivery: Delivery, packet: &[u8]) {
        for peer in self.peers().into_iter().filter(|p| *p != skip) {
            if let Err(e) = self.send(peer, delivery, packet.to_vec()) {
                debug!(peer = %peer, error = %e, "Broadcast skipped peer");
            }
        }
    }
}

// =============================================================================
// MESSAGE QUEUE
// =============================================================================

/// Producer side of a [`MessageQueue`]; cheap to clone, `Send`.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<NetworkInput>,
}

impl QueueSender {
    /// Push one input.
    pub fn push(&self, input: NetworkInput) -> Result<(), TransportError> {
        self.tx.send(input).map_err(|_| TransportError::QueueClosed)
    }
}

/// Consumer side, owned by the session.
#[derive(Debug)]
pub struct MessageQueue {
    rx: mpsc::UnboundedReceiver<NetworkInput>,
}

impl MessageQueue {
    /// Create a connected sender/queue pair.
    pub fn channel() -> (QueueSender, MessageQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (QueueSender { tx }, MessageQueue { rx })
    }

    /// Everything queued so far, in arrival order. Never blocks.
    pub fn drain(&mut self) -> Vec<NetworkInput> {
        let mut out = Vec::new();
        while let Ok(input) = self.rx.try_recv() {
            out.push(input);
        }
        out
    }

    /// Wait for the next input (async receive tasks, tests).
    pub async fn recv(&mut self) -> Option<NetworkInput> {
        self.rx.recv().await
    }
}

// =============================================================================
// LOOPBACK NETWORK
// =============================================================================

#[derive(Debug)]
struct Endpoint {
    queue: QueueSender,
    links: Vec<PeerId>,
}

#[derive(Debug)]
struct InFlight {
    deliver_at: u64,
    from: PeerId,
    to: PeerId,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct HubInner {
    endpoints: BTreeMap<PeerId, Endpoint>,
    in_flight: Vec<InFlight>,
    now: u64,
    latency_ticks: u64,
    drop_every: Option<u32>,
    reorder: Option<(u32, u64)>,
    unreliable_sent: u32,
    dropped: u32,
    reordered: u32,
    next_id: u32,
    server: Option<PeerId>,
}

impl HubInner {
    fn linked(&self, a: PeerId, b: PeerId) -> bool {
        self.endpoints.get(&a).map_or(false, |e| e.links.contains(&b))
    }

    fn notify(&self, to: PeerId, input: NetworkInput) {
        if let Some(endpoint) = self.endpoints.get(&to) {
            if endpoint.queue.push(input).is_err() {
                trace!(peer = %to, "Queue closed; notification dropped");
            }
        }
    }

    fn unlink(&mut self, a: PeerId, b: PeerId) {
        let mut was_linked = false;
        if let Some(e) = self.endpoints.get_mut(&a) {
            let before = e.links.len();
            e.links.retain(|p| *p != b);
            was_linked |= e.links.len() != before;
        }
        if let Some(e) = self.endpoints.get_mut(&b) {
            e.links.retain(|p| *p != a);
        }
        if was_linked {
            self.in_flight
                .retain(|m| !((m.from == a && m.to == b) || (m.from == b && m.to == a)));
            self.notify(a, NetworkInput::Disconnected(b));
            self.notify(b, NetworkInput::Disconnected(a));
        }
    }
}

/// In-process star network with deterministic latency.
#[derive(Debug, Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    /// New hub; packets arrive `latency_ticks` hub ticks after sending
    /// (at least one).
    pub fn new(latency_ticks: u32) -> Self {
        let hub = Self::default();
        hub.lock().latency_ticks = u64::from(latency_ticks.max(1));
        hub
    }

    /// Drop every `n`-th unreliable packet (`0` disables loss).
    pub fn set_drop_every(&self, n: u32) {
        self.lock().drop_every = (n > 0).then_some(n);
    }

    /// Hold every `n`-th unreliable packet back `extra_ticks` so later
    /// packets overtake it (`0` disables reordering).
    pub fn set_reorder_every(&self, n: u32, extra_ticks: u32) {
        self.lock().reorder = (n > 0 && extra_ticks > 0).then_some((n, u64::from(extra_ticks)));
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> (PeerId, MessageQueue) {
        let (queue_tx, queue) = MessageQueue::channel();
        let mut inner = self.lock();
        let id = PeerId(inner.next_id);
        inner.next_id += 1;
        inner.endpoints.insert(
            id,
            Endpoint {
                queue: queue_tx,
                links: Vec::new(),
            },
        );
        (id, queue)
    }

    /// Attach the (single) server endpoint.
    pub fn join_server(&self) -> (LoopbackTransport, MessageQueue) {
        let (id, queue) = self.register();
        self.lock().server = Some(id);
        debug!(peer = %id, "Loopback server joined");
        (self.transport(id), queue)
    }

    /// Attach a client and connect it to the server. Both sides get a
    /// `Connected` notification.
    pub fn join_client(&self) -> (LoopbackTransport, MessageQueue) {
        let (id, queue) = self.register();
        {
            let mut inner = self.lock();
            if let Some(server) = inner.server {
                if let Some(e) = inner.endpoints.get_mut(&server) {
                    e.links.push(id);
                }
                if let Some(e) = inner.endpoints.get_mut(&id) {
                    e.links.push(server);
                }
                inner.notify(server, NetworkInput::Connected(id));
                inner.notify(id, NetworkInput::Connected(server));
            }
        }
        debug!(peer = %id, "Loopback client joined");
        (self.transport(id), queue)
    }

    fn transport(&self, id: PeerId) -> LoopbackTransport {
        LoopbackTransport {
            id,
            hub: self.clone(),
        }
    }

    /// Drop an endpoint as if it crashed; its peers see `Disconnected`.
    pub fn drop_peer(&self, id: PeerId) {
        let mut inner = self.lock();
        let links = inner.endpoints.get(&id).map(|e| e.links.clone()).unwrap_or_default();
        for other in links {
            inner.unlink(id, other);
        }
        inner.endpoints.remove(&id);
    }

    /// Advance the hub clock one tick and deliver every packet now due,
    /// in send order.
    pub fn advance(&self) {
        let mut inner = self.lock();
        inner.now += 1;
        let now = inner.now;
        let (due, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut inner.in_flight).into_iter().partition(|m| m.deliver_at <= now);
        inner.in_flight = pending;
        for m in due {
            inner.notify(
                m.to,
                NetworkInput::Packet {
                    from: m.from,
                    bytes: m.bytes,
                },
            );
        }
    }

    /// Packets still travelling.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Unreliable packets dropped so far.
    pub fn dropped(&self) -> u32 {
        self.lock().dropped
    }

    /// Unreliable packets held back so far.
    pub fn reordered(&self) -> u32 {
        self.lock().reordered
    }
}

/// One endpoint's view of a [`LoopbackHub`].
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    id: PeerId,
    hub: LoopbackHub,
}

impl Transport for LoopbackTransport {
    fn local_id(&self) -> PeerId {
        self.id
    }

    fn send(&mut self, peer: PeerId, delivery: Delivery, packet: Vec<u8>) -> Result<(), TransportError> {
        let mut inner = self.hub.lock();
        if !inner.linked(self.id, peer) {
            return Err(TransportError::PeerDisconnected(peer));
        }
        let mut deliver_at = inner.now + inner.latency_ticks;
        if delivery == Delivery::Unreliable {
            inner.unreliable_sent += 1;
            if let Some(n) = inner.drop_every {
                if inner.unreliable_sent % n == 0 {
                    inner.dropped += 1;
                    trace!(from = %self.id, to = %peer, "Unreliable packet dropped");
                    return Ok(());
                }
            }
            if let Some((n, extra)) = inner.reorder {
                if inner.unreliable_sent % n == 0 {
                    inner.reordered += 1;
                    deliver_at += extra;
                    trace!(from = %self.id, to = %peer, "Unreliable packet held back");
                }
            }
        }
        inner.in_flight.push(InFlight {
            deliver_at,
            from: self.id,
            to: peer,
            bytes: packet,
        });
        Ok(())
    }

    fn peers(&self) -> Vec<PeerId> {
        let inner = self.hub.lock();
        inner.endpoints.get(&self.id).map(|e| e.links.clone()).unwrap_or_default()
    }

    fn disconnect(&mut self, peer: PeerId) {
        self.hub.lock().unlink(self.id, peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packets(inputs: Vec<NetworkInput>) -> Vec<(PeerId, Vec<u8>)> {
        inputs
            .into_iter()
            .filter_map(|i| match i {
                NetworkInput::Packet { from, bytes } => Some((from, bytes)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_join_notifies_both_sides() {
        let hub = LoopbackHub::new(1);
        let (server, mut server_q) = hub.join_server();
        let (client, mut client_q) = hub.join_client();
        assert_eq!(server_q.drain(), vec![NetworkInput::Connected(client.local_id())]);
        assert_eq!(client_q.drain(), vec![NetworkInput::Connected(server.local_id())]);
        assert_eq!(server.peers(), vec![client.local_id()]);
    }

    #[test]
    fn test_latency_and_order() {
        let hub = LoopbackHub::new(3);
        let (server, mut server_q) = hub.join_server();
        let (mut client, _client_q) = hub.join_client();
        server_q.drain();

        for i in 0..3u8 {
            client.send(server.local_id(), Delivery::Reliable, vec![i]).unwrap();
        }
        hub.advance();
        hub.advance();
        assert!(server_q.drain().is_empty());
        hub.advance();
        let got = packets(server_q.drain());
        assert_eq!(got.iter().map(|(_, b)| b[0]).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(got.iter().all(|(from, _)| *from == client.local_id()));
    }

    #[test]
    fn test_clients_not_linked_to_each_other() {
        let hub = LoopbackHub::new(1);
        let _server = hub.join_server();
        let (mut a, _qa) = hub.join_client();
        let (b, _qb) = hub.join_client();
        let err = a.send(b.local_id(), Delivery::Reliable, vec![1]).unwrap_err();
        assert_eq!(err, TransportError::PeerDisconnected(b.local_id()));
    }

    #[test]
    fn test_broadcast_reaches_every_client() {
        let hub = LoopbackHub::new(1);
        let (mut server, _sq) = hub.join_server();
        let (_a, mut qa) = hub.join_client();
        let (_b, mut qb) = hub.join_client();
        qa.drain();
        qb.drain();
        server.broadcast(Delivery::Reliable, &[9]);
        hub.advance();
        assert_eq!(packets(qa.drain()).len(), 1);
        assert_eq!(packets(qb.drain()).len(), 1);
    }

    #[test]
    fn test_unreliable_loss() {
        let hub = LoopbackHub::new(1);
        hub.set_drop_every(2);
        let (server, mut sq) = hub.join_server();
        let (mut client, _cq) = hub.join_client();
        sq.drain();
        for i in 0..4u8 {
            client.send(server.local_id(), Delivery::Unreliable, vec![i]).unwrap();
        }
        client.send(server.local_id(), Delivery::Reliable, vec![99]).unwrap();
        hub.advance();
        let got: Vec<u8> = packets(sq.drain()).into_iter().map(|(_, b)| b[0]).collect();
        assert_eq!(got, vec![0, 2, 99]);
        assert_eq!(hub.dropped(), 2);
    }

    #[test]
    fn test_unreliable_reorder() {
        let hub = LoopbackHub::new(1);
        hub.set_reorder_every(2, 2);
        let (server, mut sq) = hub.join_server();
        let (mut client, _cq) = hub.join_client();
        sq.drain();
        for i in 0..4u8 {
            client.send(server.local_id(), Delivery::Unreliable, vec![i]).unwrap();
        }
        client.send(server.local_id(), Delivery::Reliable, vec![99]).unwrap();
        hub.advance();
        let first: Vec<u8> = packets(sq.drain()).into_iter().map(|(_, b)| b[0]).collect();
        assert_eq!(first, vec![0, 2, 99]);
        hub.advance();
        assert!(sq.drain().is_empty());
        hub.advance();
        let late: Vec<u8> = packets(sq.drain()).into_iter().map(|(_, b)| b[0]).collect();
        assert_eq!(late, vec![1, 3]);
        assert_eq!(hub.reordered(), 2);
        assert_eq!(hub.dropped(), 0);
    }

    #[test]
    fn test_drop_peer_discards_in_flight() {
        let hub = LoopbackHub::new(5);
        let (mut server, mut sq) = hub.join_server();
        let (client, _cq) = hub.join_client();
        sq.drain();
        server.send(client.local_id(), Delivery::Reliable, vec![1]).unwrap();
        assert_eq!(hub.in_flight(), 1);

        hub.drop_peer(client.local_id());
        assert_eq!(hub.in_flight(), 0);
        assert_eq!(sq.drain(), vec![NetworkInput::Disconnected(client.local_id())]);
        assert!(server.peers().is_empty());
        assert!(server.send(client.local_id(), Delivery::Reliable, vec![2]).is_err());
    }

    #[tokio::test]
    async fn test_queue_handoff_from_task() {
        let (tx, mut queue) = MessageQueue::channel();
        let handle = tokio::spawn(async move {
            for i in 0..5u8 {
                tx.push(NetworkInput::Packet {
                    from: PeerId(1),
                    bytes: vec![i],
                })
                .unwrap();
            }
        });
        handle.await.unwrap();
        let drained = queue.drain();
        assert_eq!(drained.len(), 5);
        assert!(queue.drain().is_empty());
    }

    #[tokio::test]
    async fn test_queue_closed_after_drop() {
        let (tx, queue) = MessageQueue::channel();
        drop(queue);
        assert_eq!(tx.push(NetworkInput::Connected(PeerId(0))), Err(TransportError::QueueClosed));
    }
}
