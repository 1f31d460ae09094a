use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::codec::frame::{FramedReader, FramedWriter, RawFrame};
use crate::codec::identity::{exchange_identity, exchange_protocol_id, Identity};
use crate::codec::payload::{
    decode_broadcast, decode_distance, decode_peer_entry, decode_peer_id, decode_peers_list,
    decode_unicast, encode_broadcast, encode_distance, encode_peer_entry, encode_peer_id,
    encode_peers_list, encode_unicast, PeerEntry,
};
use crate::error::MeshError;
use crate::manager::{ControlMsg, PeerManager, Shared};
use crate::transport::{Acceptor, BoxedStream, Transport};
use crate::types::command::Command;
use crate::types::peer::{Peer, DISTANCE_DIRECT, DISTANCE_UNREACHABLE};
use crate::types::peer_id::PeerId;

/// A dialed stream that passed the protocol check and identity exchange
pub(crate) struct OutboundConn {
    pub(crate) stream: BoxedStream,
    pub(crate) identity: Identity,
    pub(crate) remote_ip: IpAddr,
}

/// Dial a remote endpoint and run the admission handshake on it
pub(crate) async fn establish_outbound(
    transport: &dyn Transport,
    addr: SocketAddr,
    local_id: PeerId,
    local_port: u16,
    connect_timeout: Duration,
    handshake_timeout: Duration,
) -> Result<OutboundConn, MeshError> {
    let mut stream = transport
        .dial(addr, connect_timeout)
        .await
        .map_err(|e| MeshError::ConnectFailure(format!("dial {} failed: {}", addr, e)))?;

    let identity = tokio::time::timeout(handshake_timeout, async {
        exchange_protocol_id(&mut stream).await?;
        exchange_identity(&mut stream, &local_id, local_port).await
    })
    .await
    .map_err(|_| MeshError::ConnectFailure(format!("handshake with {} timed out", addr)))??;

    Ok(OutboundConn {
        stream,
        identity,
        remote_ip: addr.ip(),
    })
}

/// Why a dial was attempted, deciding what the failure notice looks like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialKind {
    /// Entry taken from a roster reply; failure asks the sender to
    /// introduce us through the mesh
    Roster,

    /// Dial requested by an introduction; failure reports `CantConnect`
    /// back so the introducer can elect itself bridge
    Introduction,
}

/// Everything the reactor can wake up on besides the acceptor
pub(crate) enum PeerEvent {
    InboundReady {
        stream: BoxedStream,
        identity: Identity,
        remote_ip: IpAddr,
    },
    OutboundReady {
        conn: OutboundConn,
        attempted: PeerId,
    },
    DialFailed {
        entry: PeerEntry,
        via: PeerId,
        kind: DialKind,
    },
    Frame {
        from: PeerId,
        frame: RawFrame,
    },
    Closed {
        id: PeerId,
    },
}

/// Transport state owned per direct peer
struct Connection {
    tx: mpsc::UnboundedSender<(Command, Vec<u8>)>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

/// The single background reactor of a [`PeerManager`]
///
/// All command handlers, listener callbacks, and forwarding decisions run
/// here; nothing in this module blocks between suspension points.
pub(crate) struct Worker {
    shared: Arc<Shared>,
    manager: PeerManager,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    connections: HashMap<PeerId, Connection>,
    /// target id -> requester id: "requester asked me to relay toward target"
    forwarding: HashMap<PeerId, PeerId>,
    dialing: HashSet<PeerId>,
}

enum Tick {
    Accepted(std::io::Result<(BoxedStream, SocketAddr)>),
    Event(Option<PeerEvent>),
    Control(Option<ControlMsg>),
}

impl Worker {
    pub(crate) fn new(shared: Arc<Shared>) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = PeerManager::from_shared(Arc::clone(&shared));
        (
            Self {
                shared,
                manager,
                events_tx,
                connections: HashMap::new(),
                forwarding: HashMap::new(),
                dialing: HashSet::new(),
            },
            events_rx,
        )
    }

    pub(crate) async fn run(
        mut self,
        mut acceptor: Box<dyn Acceptor>,
        mut events_rx: mpsc::UnboundedReceiver<PeerEvent>,
        mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
        initial: Option<OutboundConn>,
    ) {
        // The seed connection was established before the worker started;
        // admit it first so its connection event precedes everything else
        if let Some(conn) = initial {
            self.admit(conn.stream, conn.identity, conn.remote_ip, true);
        }

        loop {
            let tick = tokio::select! {
                res = acceptor.accept() => Tick::Accepted(res),
                ev = events_rx.recv() => Tick::Event(ev),
                msg = control_rx.recv() => Tick::Control(msg),
            };

            match tick {
                Tick::Accepted(Ok((stream, addr))) => {
                    info!("Accepted connection from {}", addr);
                    self.spawn_inbound_handshake(stream, addr);
                }
                Tick::Accepted(Err(e)) => {
                    error!("Error accepting connection: {}", e);
                }
                Tick::Event(Some(event)) => self.handle_event(event),
                Tick::Event(None) => break,
                Tick::Control(Some(ControlMsg::Unicast { target, data })) => {
                    self.local_unicast(target, &data);
                }
                Tick::Control(Some(ControlMsg::Broadcast { data })) => {
                    self.local_broadcast(&data);
                }
                Tick::Control(Some(ControlMsg::Shutdown)) | Tick::Control(None) => break,
            }
        }

        self.shutdown();
    }

    fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::InboundReady {
                stream,
                identity,
                remote_ip,
            } => self.admit(stream, identity, remote_ip, false),
            PeerEvent::OutboundReady { conn, attempted } => {
                self.dialing.remove(&attempted);
                self.admit(conn.stream, conn.identity, conn.remote_ip, false);
            }
            PeerEvent::DialFailed { entry, via, kind } => {
                self.dialing.remove(&entry.id);
                self.dial_failed(entry, via, kind);
            }
            PeerEvent::Frame { from, frame } => self.dispatch_command(from, frame),
            PeerEvent::Closed { id } => self.handle_closed(id),
        }
    }

    // ---- admission -------------------------------------------------------

    fn spawn_inbound_handshake(&self, mut stream: BoxedStream, addr: SocketAddr) {
        let events_tx = self.events_tx.clone();
        let local_id = self.shared.local_id;
        let (local_port, handshake_timeout) = {
            let config = self.shared.config.read().unwrap();
            (config.port, config.handshake_timeout())
        };

        tokio::spawn(async move {
            let result = tokio::time::timeout(handshake_timeout, async {
                exchange_protocol_id(&mut stream).await?;
                exchange_identity(&mut stream, &local_id, local_port).await
            })
            .await;

            match result {
                Ok(Ok(identity)) => {
                    let _ = events_tx.send(PeerEvent::InboundReady {
                        stream,
                        identity,
                        remote_ip: addr.ip(),
                    });
                }
                Ok(Err(e)) => warn!("Rejected connection from {}: {}", addr, e),
                Err(_) => warn!("Handshake with {} timed out", addr),
            }
        });
    }

    /// Take ownership of a handshaken stream and enter the peer in the table
    fn admit(&mut self, stream: BoxedStream, identity: Identity, remote_ip: IpAddr, request_roster: bool) {
        let id = identity.id;

        if id == self.shared.local_id {
            warn!("Dropping connection carrying our own identity");
            return;
        }

        match self.shared.table.get(&id) {
            Some(existing) if existing.is_direct() => {
                // Second admission from a known peer; the existing record
                // and its socket stay untouched
                warn!("Rejecting duplicate connection from {}", id);
                return;
            }
            Some(existing) => {
                // Known through a bridge or unreachable; a direct edge
                // always wins
                info!("Peer {} is now directly connected", id);
                let peer = Peer::direct(id, remote_ip, identity.port);
                self.shared.table.put(peer.clone());
                self.install_connection(id, stream);

                if let Some(old_bridge) = existing.bridge {
                    self.send_command(&old_bridge, Command::StopForwarding, encode_peer_id(&id));
                }
                if !existing.is_reachable() {
                    self.dispatch_connection(&peer);
                }
                self.flood_distance(&id, DISTANCE_DIRECT, Some(&id));
            }
            None => {
                info!("Peer {} connected from {}", id, remote_ip);
                let peer = Peer::direct(id, remote_ip, identity.port);
                self.shared.table.insert(peer.clone());
                self.install_connection(id, stream);
                self.dispatch_connection(&peer);
            }
        }

        // As the joiner, ask the seed for its view of the membership
        if request_roster {
            self.send_command(&id, Command::RetrievePeers, Vec::new());
        }

        // A fresh direct edge may give unreachable peers a route again
        let lost: Vec<PeerId> = self
            .shared
            .table
            .snapshot()
            .values()
            .filter(|p| !p.is_reachable())
            .map(|p| p.id)
            .collect();
        for lost_id in lost {
            self.send_command(&id, Command::RetrieveDistance, encode_peer_id(&lost_id));
        }
    }

    fn install_connection(&mut self, id: PeerId, stream: BoxedStream) {
        let (keep_alive, idle) = {
            let config = self.shared.config.read().unwrap();
            (config.keep_alive_interval(), config.idle_timeout())
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            id,
            FramedReader::new(read_half),
            self.events_tx.clone(),
            idle,
        ));
        let writer = tokio::spawn(write_loop(FramedWriter::new(write_half), rx, keep_alive));

        if let Some(old) = self.connections.insert(id, Connection { tx, reader, writer }) {
            old.reader.abort();
            old.writer.abort();
        }
    }

    fn spawn_dial(&mut self, entry: PeerEntry, via: PeerId, kind: DialKind) {
        if entry.id == self.shared.local_id || self.dialing.contains(&entry.id) {
            return;
        }
        self.dialing.insert(entry.id);

        let transport = Arc::clone(&self.shared.transport);
        let events_tx = self.events_tx.clone();
        let local_id = self.shared.local_id;
        let (local_port, connect_timeout, handshake_timeout) = {
            let config = self.shared.config.read().unwrap();
            (
                config.port,
                config.connect_timeout(),
                config.handshake_timeout(),
            )
        };

        tokio::spawn(async move {
            let addr = SocketAddr::new(entry.addr, entry.port);
            match establish_outbound(
                transport.as_ref(),
                addr,
                local_id,
                local_port,
                connect_timeout,
                handshake_timeout,
            )
            .await
            {
                Ok(conn) => {
                    let _ = events_tx.send(PeerEvent::OutboundReady {
                        conn,
                        attempted: entry.id,
                    });
                }
                Err(e) => {
                    debug!("Could not reach {} at {}: {}", entry.id, addr, e);
                    let _ = events_tx.send(PeerEvent::DialFailed { entry, via, kind });
                }
            }
        });
    }

    fn dial_failed(&mut self, entry: PeerEntry, via: PeerId, kind: DialKind) {
        // Keep the endpoint around; a bridge may make the peer reachable
        if !self.shared.table.contains(&entry.id) {
            self.shared
                .table
                .insert(Peer::unreachable(entry.id, entry.addr, entry.port));
        }

        match kind {
            DialKind::Roster => {
                // Ask the seed to introduce us through the mesh
                self.send_command(&via, Command::ConnectTo, encode_peer_entry(&entry));
            }
            DialKind::Introduction => {
                self.send_command(&via, Command::CantConnect, encode_peer_id(&entry.id));
            }
        }
    }

    // ---- command dispatch ------------------------------------------------

    fn dispatch_command(&mut self, from: PeerId, frame: RawFrame) {
        let Some(peer) = self.shared.table.get(&from) else {
            debug!("Dropping frame from departed peer {}", from);
            return;
        };

        let Some(command) = Command::from_u8(frame.tag) else {
            warn!(
                "Dropping frame with unknown tag {:#04x} from {}",
                frame.tag, from
            );
            return;
        };

        let result = match command {
            Command::SendTo => self.send_to_handler(&peer, &frame.payload),
            Command::SendToAll => self.send_to_all_handler(&peer, &frame.payload),
            Command::ForwardTo => self.forward_to_handler(&peer, &frame.payload),
            Command::StopForwarding => self.stop_forwarding_handler(&peer, &frame.payload),
            Command::ForwardingTo => self.forwarding_to_handler(&peer, &frame.payload),
            Command::ConnectTo => self.connect_to_handler(&peer, &frame.payload),
            Command::CantConnect => self.cant_connect_handler(&peer, &frame.payload),
            Command::UpdateDistance => self.update_distance_handler(&peer, &frame.payload),
            Command::RetrieveDistance => self.retrieve_distance_handler(&peer, &frame.payload),
            Command::RetrievePeers => self.retrieve_peers_handler(&peer),
            Command::PeersList => self.peers_list_handler(&peer, &frame.payload),
            Command::PeerDisconnection => self.peer_disconnection_handler(&peer, &frame.payload),
            Command::KeepAlive => {
                trace!("Received keep_alive from {}", from);
                Ok(())
            }
            Command::NullCommand => Ok(()),
        };

        // A malformed payload costs the frame, never the connection
        if let Err(e) = result {
            warn!("Dropping {:?} frame from {}: {}", command, from, e);
        }
    }

    fn send_to_handler(&mut self, from: &Peer, payload: &[u8]) -> Result<(), MeshError> {
        let unicast = decode_unicast(payload)?;

        if unicast.target == self.shared.local_id {
            let source = self
                .shared
                .table
                .get(&unicast.source)
                .unwrap_or_else(|| from.clone());
            self.dispatch_data(&source, unicast.data, false);
            return Ok(());
        }

        // Relay on behalf of a bridged pair we agreed to serve
        let agreed = self.forwarding.get(&unicast.target) == Some(&unicast.source);
        let target_direct = self
            .shared
            .table
            .get(&unicast.target)
            .map_or(false, |p| p.is_direct());

        if agreed && target_direct {
            self.send_command(&unicast.target, Command::SendTo, payload.to_vec());
        } else {
            self.send_command(
                &from.id,
                Command::CantConnect,
                encode_peer_id(&unicast.target),
            );
        }
        Ok(())
    }

    fn send_to_all_handler(&mut self, from: &Peer, payload: &[u8]) -> Result<(), MeshError> {
        let broadcast = decode_broadcast(payload)?;

        let source = self
            .shared
            .table
            .get(&broadcast.source)
            .unwrap_or_else(|| from.clone());
        self.dispatch_data(&source, broadcast.data, true);

        // Relay once to every peer that depends on us for this source;
        // direct peers all hear the origin themselves
        let dependents: Vec<PeerId> = self
            .forwarding
            .iter()
            .filter(|(_, requester)| **requester == broadcast.source)
            .map(|(target, _)| *target)
            .collect();
        for target in dependents {
            let direct = self
                .shared
                .table
                .get(&target)
                .map_or(false, |p| p.is_direct());
            if direct {
                self.send_command(&target, Command::SendToAll, payload.to_vec());
            }
        }
        Ok(())
    }

    fn forward_to_handler(&mut self, from: &Peer, payload: &[u8]) -> Result<(), MeshError> {
        let target = decode_peer_id(payload)?;

        let target_direct = target != self.shared.local_id
            && self
                .shared
                .table
                .get(&target)
                .map_or(false, |p| p.is_direct());

        if target_direct {
            debug!("Relaying traffic from {} toward {}", from.id, target);
            self.forwarding.insert(target, from.id);
            self.send_command(&from.id, Command::ForwardingTo, encode_peer_id(&target));
        } else {
            self.send_command(&from.id, Command::CantConnect, encode_peer_id(&target));
        }
        Ok(())
    }

    fn stop_forwarding_handler(&mut self, from: &Peer, payload: &[u8]) -> Result<(), MeshError> {
        let target = decode_peer_id(payload)?;
        if self.forwarding.get(&target) == Some(&from.id) {
            debug!("No longer relaying from {} toward {}", from.id, target);
            self.forwarding.remove(&target);
        }
        Ok(())
    }

    fn forwarding_to_handler(&mut self, from: &Peer, payload: &[u8]) -> Result<(), MeshError> {
        let target = decode_peer_id(payload)?;
        if target == self.shared.local_id {
            return Ok(());
        }

        let Some(existing) = self.shared.table.get(&target) else {
            // A relay offer for a peer we never heard of carries no
            // endpoint; membership gossip will fill it in first
            debug!("Ignoring relay offer for unknown peer {}", target);
            return Ok(());
        };

        if existing.is_direct() {
            // A direct edge beats any relay
            self.send_command(&from.id, Command::StopForwarding, encode_peer_id(&target));
            return Ok(());
        }

        match existing.bridge {
            Some(current) if current == from.id => {
                if existing.distance != 2 {
                    self.shared.table.update(&target, |p| p.distance = 2);
                    self.flood_distance(&target, 2, Some(&from.id));
                }
            }
            Some(current) => {
                // Two candidate bridges; the smaller id wins
                if from.id < current {
                    self.shared
                        .table
                        .put(Peer::bridged(target, existing.addr, existing.port, from.id, 2));
                    self.send_command(&current, Command::StopForwarding, encode_peer_id(&target));
                    self.flood_distance(&target, 2, Some(&from.id));
                } else {
                    self.send_command(&from.id, Command::StopForwarding, encode_peer_id(&target));
                }
            }
            None => {
                info!("Peer {} reachable through bridge {}", target, from.id);
                self.shared
                    .table
                    .put(Peer::bridged(target, existing.addr, existing.port, from.id, 2));
                self.flood_distance(&target, 2, Some(&from.id));
                if !existing.is_reachable() {
                    let peer = self.shared.table.get(&target).unwrap_or_else(|| {
                        Peer::bridged(target, existing.addr, existing.port, from.id, 2)
                    });
                    self.dispatch_connection(&peer);
                }
            }
        }
        Ok(())
    }

    fn connect_to_handler(&mut self, from: &Peer, payload: &[u8]) -> Result<(), MeshError> {
        let entry = decode_peer_entry(payload)?;
        if entry.id == self.shared.local_id {
            return Ok(());
        }

        match self.shared.table.get(&entry.id) {
            Some(p) if p.is_direct() => {
                // We already reach the target; pass the introduction along
                // so it can dial the requester back
                self.send_command(
                    &entry.id,
                    Command::ConnectTo,
                    encode_peer_entry(&PeerEntry::of(from)),
                );
            }
            _ => self.spawn_dial(entry, from.id, DialKind::Introduction),
        }
        Ok(())
    }

    fn cant_connect_handler(&mut self, from: &Peer, payload: &[u8]) -> Result<(), MeshError> {
        let target = decode_peer_id(payload)?;
        if target == self.shared.local_id {
            return Ok(());
        }

        let target_direct = self
            .shared
            .table
            .get(&target)
            .map_or(false, |p| p.is_direct());

        if target_direct {
            // We reach both ends of a pair that cannot reach each other;
            // become their relay
            info!("Bridging between {} and {}", from.id, target);
            self.forwarding.insert(target, from.id);
            self.forwarding.insert(from.id, target);
            self.send_command(&from.id, Command::ForwardingTo, encode_peer_id(&target));
            self.send_command(&target, Command::ForwardingTo, encode_peer_id(&from.id));
        } else {
            debug!("Cannot bridge {} for {}", target, from.id);
        }
        Ok(())
    }

    fn update_distance_handler(&mut self, from: &Peer, payload: &[u8]) -> Result<(), MeshError> {
        let (id, reported) = decode_distance(payload)?;
        if id == self.shared.local_id {
            return Ok(());
        }
        let Some(peer) = self.shared.table.get(&id) else {
            return Ok(());
        };
        if peer.is_direct() {
            // Our own socket is the authority on direct peers
            return Ok(());
        }

        let new_distance = if reported >= DISTANCE_UNREACHABLE - 1 {
            DISTANCE_UNREACHABLE
        } else {
            (reported + 1).max(2)
        };

        if peer.bridge == Some(from.id) {
            // We route through the sender; adopt its report, better or worse
            if new_distance != peer.distance {
                if new_distance == DISTANCE_UNREACHABLE {
                    self.shared
                        .table
                        .put(Peer::unreachable(id, peer.addr, peer.port));
                } else {
                    self.shared
                        .table
                        .put(Peer::bridged(id, peer.addr, peer.port, from.id, new_distance));
                }
                self.flood_distance(&id, new_distance, Some(&from.id));
            }
        } else if !peer.is_reachable() && reported == DISTANCE_DIRECT {
            // The sender is adjacent to a peer we lost; ask it to relay
            self.send_command(&from.id, Command::ForwardTo, encode_peer_id(&id));
        }
        Ok(())
    }

    fn retrieve_distance_handler(&mut self, from: &Peer, payload: &[u8]) -> Result<(), MeshError> {
        let id = decode_peer_id(payload)?;
        let distance = if id == self.shared.local_id {
            0
        } else {
            self.shared
                .table
                .get(&id)
                .map(|p| p.distance)
                .unwrap_or(DISTANCE_UNREACHABLE)
        };
        self.send_command(&from.id, Command::UpdateDistance, encode_distance(&id, distance));
        Ok(())
    }

    fn retrieve_peers_handler(&mut self, from: &Peer) -> Result<(), MeshError> {
        let entries: Vec<PeerEntry> = self
            .shared
            .table
            .snapshot()
            .values()
            .filter(|p| p.id != from.id)
            .map(PeerEntry::of)
            .collect();
        debug!("Sending a roster of {} peers to {}", entries.len(), from.id);
        self.send_command(&from.id, Command::PeersList, encode_peers_list(&entries));
        Ok(())
    }

    fn peers_list_handler(&mut self, from: &Peer, payload: &[u8]) -> Result<(), MeshError> {
        let entries = decode_peers_list(payload)?;
        debug!("Received a roster of {} peers from {}", entries.len(), from.id);

        for entry in entries {
            if entry.id == self.shared.local_id || self.shared.table.contains(&entry.id) {
                continue;
            }
            self.spawn_dial(entry, from.id, DialKind::Roster);
        }
        Ok(())
    }

    fn peer_disconnection_handler(&mut self, from: &Peer, payload: &[u8]) -> Result<(), MeshError> {
        let id = decode_peer_id(payload)?;
        if id == self.shared.local_id {
            return Ok(());
        }
        let Some(peer) = self.shared.table.get(&id) else {
            // Already gone; the flood terminates here
            return Ok(());
        };
        if peer.is_direct() {
            // We hold a live socket; only its closure removes the peer
            return Ok(());
        }

        info!("Peer {} left the network", id);
        self.drop_peer_record(&id, Some(&from.id));
        Ok(())
    }

    // ---- membership upkeep ----------------------------------------------

    fn handle_closed(&mut self, id: PeerId) {
        if let Some(conn) = self.connections.remove(&id) {
            conn.reader.abort();
            conn.writer.abort();
        }

        let was_direct = self
            .shared
            .table
            .get(&id)
            .map_or(false, |p| p.is_direct());
        if was_direct {
            info!("Connection with peer {} closed", id);
            self.drop_peer_record(&id, None);
        }
    }

    /// Remove a peer, repair routing state, notify listeners, gossip onward
    fn drop_peer_record(&mut self, id: &PeerId, gossip_except: Option<&PeerId>) {
        let Some(peer) = self.shared.table.remove(id) else {
            return;
        };

        self.forwarding.remove(id);
        self.forwarding.retain(|_, requester| requester != id);

        // Peers routed through the departed one lose their route until a
        // new bridge elects itself
        for dependent in self.shared.table.bridged_through(id) {
            self.shared
                .table
                .put(Peer::unreachable(dependent.id, dependent.addr, dependent.port));
            self.flood_distance(&dependent.id, DISTANCE_UNREACHABLE, None);
        }

        self.dispatch_disconnection(&peer);

        for direct in self.shared.table.direct_peers() {
            if gossip_except == Some(&direct.id) {
                continue;
            }
            self.send_command(&direct.id, Command::PeerDisconnection, encode_peer_id(id));
        }
    }

    // ---- forwarding engine ----------------------------------------------

    fn local_unicast(&mut self, target: PeerId, data: &[u8]) {
        match self.shared.table.get(&target) {
            Some(peer) if peer.is_direct() => {
                let payload = encode_unicast(&self.shared.local_id, &target, data);
                self.send_command(&target, Command::SendTo, payload);
            }
            Some(peer) if peer.is_reachable() => {
                if let Some(bridge) = peer.bridge {
                    let payload = encode_unicast(&self.shared.local_id, &target, data);
                    self.send_command(&bridge, Command::SendTo, payload);
                }
            }
            Some(_) => debug!("Peer {} is unreachable, dropping message", target),
            None => debug!("{}", MeshError::PeerGone(target)),
        }
    }

    fn local_broadcast(&mut self, data: &[u8]) {
        // The sender's own listeners observe the broadcast before any
        // remote peer can
        let me = self.manager.local_peer();
        self.dispatch_data(&me, data, true);

        let payload = encode_broadcast(&self.shared.local_id, data);
        for peer in self.shared.table.direct_peers() {
            self.send_command(&peer.id, Command::SendToAll, payload.clone());
        }
    }

    /// Flood a distance report to every direct peer except `except`
    fn flood_distance(&mut self, id: &PeerId, distance: u8, except: Option<&PeerId>) {
        for peer in self.shared.table.direct_peers() {
            if peer.id == *id || except == Some(&peer.id) {
                continue;
            }
            self.send_command(&peer.id, Command::UpdateDistance, encode_distance(id, distance));
        }
    }

    fn send_command(&mut self, id: &PeerId, command: Command, payload: Vec<u8>) {
        match self.connections.get(id) {
            Some(conn) => {
                if conn.tx.send((command, payload)).is_err() {
                    debug!("Writer for {} is gone", id);
                }
            }
            None => debug!("No connection to {} for {:?}", id, command),
        }
    }

    // ---- listener dispatch ----------------------------------------------

    fn dispatch_connection(&self, peer: &Peer) {
        for (_, listener) in self.shared.connection_listeners.snapshot() {
            listener(&self.manager, peer);
        }
    }

    fn dispatch_disconnection(&self, peer: &Peer) {
        for (_, listener) in self.shared.disconnection_listeners.snapshot() {
            listener(&self.manager, peer);
        }
    }

    fn dispatch_data(&self, source: &Peer, data: &[u8], sent_to_all: bool) {
        for (_, listener) in self.shared.data_listeners.snapshot() {
            listener(&self.manager, source, data, sent_to_all);
        }
    }

    // ---- teardown --------------------------------------------------------

    fn shutdown(&mut self) {
        info!("Leaving the network");

        // Disconnection events fire in lexicographic id order
        for id in self.shared.table.ids_sorted() {
            if let Some(conn) = self.connections.remove(&id) {
                conn.reader.abort();
                conn.writer.abort();
            }
            if let Some(peer) = self.shared.table.remove(&id) {
                self.dispatch_disconnection(&peer);
            }
        }

        self.forwarding.clear();
        self.dialing.clear();
    }
}

/// Pump frames from one peer into the reactor, bounded by the idle timeout
async fn read_loop(
    id: PeerId,
    mut reader: FramedReader<ReadHalf<BoxedStream>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    idle_timeout: Duration,
) {
    loop {
        match tokio::time::timeout(idle_timeout, reader.read_frame()).await {
            Err(_) => {
                warn!("Connection with peer {} timed out", id);
                break;
            }
            Ok(Ok(Some(frame))) => {
                if events_tx.send(PeerEvent::Frame { from: id, frame }).is_err() {
                    break;
                }
            }
            Ok(Ok(None)) => {
                debug!("Peer {} closed the connection", id);
                break;
            }
            Ok(Err(e)) => {
                warn!("Error reading from peer {}: {}", id, e);
                break;
            }
        }
    }

    let _ = events_tx.send(PeerEvent::Closed { id });
}

/// Drain outgoing frames onto the socket, interleaving keep-alives
async fn write_loop(
    mut writer: FramedWriter<WriteHalf<BoxedStream>>,
    mut rx: mpsc::UnboundedReceiver<(Command, Vec<u8>)>,
    keep_alive: Duration,
) {
    let mut ticker = tokio::time::interval(keep_alive);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some((command, payload)) => {
                    if let Err(e) = writer.write_frame(command, &payload).await {
                        debug!("Write failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if writer.write_frame(Command::KeepAlive, &[]).await.is_err() {
                    break;
                }
            }
        }
    }
}
