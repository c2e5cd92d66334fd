use super::{Envelope, KvStore, Log, Message, Node, Options, ReplicaID, BROADCAST, TICK_INTERVAL};
use crate::error::Result;

use log::{debug, info, warn};
use std::collections::HashSet;
use std::net::UdpSocket;
use std::time::Instant;

/// The maximum size of an inbound datagram.
const MAX_DATAGRAM: usize = 65535;

/// A replica server: a single-threaded event loop that owns the UDP socket
/// and drives the consensus node. On each iteration it blocks on the socket
/// until the next tick deadline, steps inbound datagrams into the node, and
/// transmits whatever the node emitted. All sends are fire-and-forget; lost
/// datagrams are recovered by timer-driven retransmission, never by waiting
/// on a peer.
pub struct Server {
    id: ReplicaID,
    node: Node,
    node_rx: crossbeam::channel::Receiver<Envelope>,
    socket: UdpSocket,
    target: std::net::SocketAddr,
}

impl Server {
    /// Creates a new server. All traffic is exchanged with the simulator at
    /// the given localhost port, which routes datagrams by their `dst`
    /// field.
    pub fn new(id: ReplicaID, peers: Vec<ReplicaID>, port: u16) -> Result<Self> {
        let peers: HashSet<ReplicaID> = peers.into_iter().collect();
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let node = Node::new(
            id.clone(),
            peers,
            Log::new(),
            KvStore::new(),
            node_tx,
            Options::default(),
        )?;
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        let target = std::net::SocketAddr::from(([127, 0, 0, 1], port));
        Ok(Self { id, node, node_rx, socket, target })
    }

    /// Announces the replica and serves requests. Never returns under
    /// normal operation.
    pub fn serve(self) -> Result<()> {
        let Server { id, mut node, node_rx, socket, target } = self;
        info!("Replica {id} serving via simulator port {}", target.port());

        // The one-shot boot announcement.
        let hello = Envelope {
            src: id.clone(),
            dst: BROADCAST.into(),
            leader: BROADCAST.into(),
            message: Message::Hello,
        };
        socket.send_to(&serde_json::to_vec(&hello)?, target)?;

        let mut buf = [0u8; MAX_DATAGRAM];
        let mut next_tick = Instant::now() + TICK_INTERVAL;
        loop {
            // Advance the logical clock if its deadline has passed,
            // otherwise wait on the socket until it does.
            let now = Instant::now();
            if now >= next_tick {
                node = node.tick()?;
                next_tick += TICK_INTERVAL;
                Self::transmit(&socket, target, &node_rx)?;
                continue;
            }
            socket.set_read_timeout(Some(next_tick - now))?;
            match socket.recv_from(&mut buf) {
                Ok((len, _)) => {
                    match serde_json::from_slice::<Envelope>(&buf[..len]) {
                        Ok(msg) => node = node.step(msg)?,
                        // Don't answer garbage; a reply would just amplify it.
                        Err(err) => warn!("Discarding malformed datagram: {err}"),
                    }
                    Self::transmit(&socket, target, &node_rx)?;
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {} // tick deadline reached
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Transmits all envelopes emitted by the node. Send failures are
    /// logged and dropped; the protocol treats them like any other lost
    /// datagram.
    fn transmit(
        socket: &UdpSocket,
        target: std::net::SocketAddr,
        node_rx: &crossbeam::channel::Receiver<Envelope>,
    ) -> Result<()> {
        while let Ok(msg) = node_rx.try_recv() {
            debug!("Transmitting {msg:?}");
            let buf = serde_json::to_vec(&msg)?;
            if let Err(err) = socket.send_to(&buf, target) {
                warn!("Dropping outbound datagram to {}: {err}", msg.dst);
            }
        }
        Ok(())
    }
}
