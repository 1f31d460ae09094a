//! The peer manager: the state machine at the center of the overlay.
//!
//! A [`PeerManager`] owns the set of known peers, runs the admission
//! handshake, executes the overlay control protocol (membership
//! dissemination, distance and bridge negotiation, disconnection
//! propagation), dispatches payloads to listeners, and relays traffic on
//! behalf of bridged pairs. All protocol work runs on one background worker
//! thread; the public surface below may be called from any thread.

pub(crate) mod worker;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use log::{debug, info};
use tokio::sync::mpsc;

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::peer::listeners::{ListenerId, ListenerRegistry};
use crate::peer::table::PeerTable;
use crate::transport::{TcpTransport, Transport};
use crate::types::peer::Peer;
use crate::types::peer_id::PeerId;

use self::worker::{establish_outbound, Worker};

/// Callback fired when a peer becomes reachable
pub type ConnectionListener = dyn Fn(&PeerManager, &Peer) + Send + Sync;

/// Callback fired when data arrives; the flag is true for broadcasts
pub type DataListener = dyn Fn(&PeerManager, &Peer, &[u8], bool) + Send + Sync;

/// Callback fired when a peer leaves the overlay
pub type DisconnectionListener = dyn Fn(&PeerManager, &Peer) + Send + Sync;

/// Requests submitted from user threads to the worker
pub(crate) enum ControlMsg {
    Unicast { target: PeerId, data: Vec<u8> },
    Broadcast { data: Vec<u8> },
    Shutdown,
}

/// State shared between the public handle and the worker
pub(crate) struct Shared {
    pub(crate) local_id: PeerId,
    pub(crate) config: RwLock<MeshConfig>,
    pub(crate) table: PeerTable,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) connection_listeners: ListenerRegistry<ConnectionListener>,
    pub(crate) data_listeners: ListenerRegistry<DataListener>,
    pub(crate) disconnection_listeners: ListenerRegistry<DisconnectionListener>,
    listener_seq: AtomicU64,
    running: AtomicBool,
    control: Mutex<Option<mpsc::UnboundedSender<ControlMsg>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a mesh node
///
/// Cheap to clone; all clones drive the same node. Stop a node with
/// [`PeerManager::disconnect`] followed by [`PeerManager::join`].
pub struct PeerManager {
    shared: Arc<Shared>,
}

impl Clone for PeerManager {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerManager {
    /// Create a stopped manager with default configuration
    pub fn new() -> Self {
        Self::with_config(MeshConfig::default())
    }

    /// Create a stopped manager with the given configuration
    pub fn with_config(config: MeshConfig) -> Self {
        Self::with_transport(config, Arc::new(TcpTransport::new()))
    }

    /// Create a stopped manager over a custom transport
    pub fn with_transport(config: MeshConfig, transport: Arc<dyn Transport>) -> Self {
        let local_id = PeerId::random();
        info!("Local peer id is {}", local_id);

        Self {
            shared: Arc::new(Shared {
                local_id,
                config: RwLock::new(config),
                table: PeerTable::new(),
                transport,
                connection_listeners: ListenerRegistry::new(),
                data_listeners: ListenerRegistry::new(),
                disconnection_listeners: ListenerRegistry::new(),
                listener_seq: AtomicU64::new(0),
                running: AtomicBool::new(false),
                control: Mutex::new(None),
                thread: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// The local 128-bit identity
    pub fn id(&self) -> PeerId {
        self.shared.local_id
    }

    /// The local node presented as a peer record with `distance = 0`
    pub fn local_peer(&self) -> Peer {
        let config = self.shared.config.read().unwrap();
        Peer::local(self.shared.local_id, config.listen_addr, config.port)
    }

    /// Snapshot of the currently known peers (self excluded)
    ///
    /// The view is read-only and may be stale by the next worker tick.
    pub fn peers(&self) -> HashMap<PeerId, Peer> {
        self.shared.table.snapshot()
    }

    /// Whether the background worker is live
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The port this node listens on (effective port once running)
    pub fn port(&self) -> u16 {
        self.shared.config.read().unwrap().port
    }

    /// Change the listening port; fails while running
    pub fn set_port(&self, port: u16) -> Result<(), MeshError> {
        if self.is_running() {
            return Err(MeshError::InvalidState("cannot change port while running"));
        }
        self.shared.config.write().unwrap().port = port;
        Ok(())
    }

    /// Current configuration
    pub fn config(&self) -> MeshConfig {
        self.shared.config.read().unwrap().clone()
    }

    /// Replace the configuration; fails while running
    pub fn set_config(&self, config: MeshConfig) -> Result<(), MeshError> {
        if self.is_running() {
            return Err(MeshError::InvalidState(
                "cannot change configuration while running",
            ));
        }
        *self.shared.config.write().unwrap() = config;
        Ok(())
    }

    fn next_listener_id(&self) -> ListenerId {
        self.shared.listener_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a callback for peers becoming reachable
    pub fn add_connection_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PeerManager, &Peer) + Send + Sync + 'static,
    {
        let id = self.next_listener_id();
        self.shared.connection_listeners.add(id, Arc::new(listener));
        id
    }

    /// Remove a connection listener; `true` at most once per id
    pub fn remove_connection_listener(&self, id: ListenerId) -> bool {
        self.shared.connection_listeners.remove(id)
    }

    /// Drop all connection listeners
    pub fn clear_connection_listeners(&self) {
        self.shared.connection_listeners.clear();
    }

    /// Register a callback for arriving payloads
    pub fn add_data_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PeerManager, &Peer, &[u8], bool) + Send + Sync + 'static,
    {
        let id = self.next_listener_id();
        self.shared.data_listeners.add(id, Arc::new(listener));
        id
    }

    /// Remove a data listener; `true` at most once per id
    pub fn remove_data_listener(&self, id: ListenerId) -> bool {
        self.shared.data_listeners.remove(id)
    }

    /// Drop all data listeners
    pub fn clear_data_listeners(&self) {
        self.shared.data_listeners.clear();
    }

    /// Register a callback for peers leaving the overlay
    pub fn add_disconnection_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PeerManager, &Peer) + Send + Sync + 'static,
    {
        let id = self.next_listener_id();
        self.shared
            .disconnection_listeners
            .add(id, Arc::new(listener));
        id
    }

    /// Remove a disconnection listener; `true` at most once per id
    pub fn remove_disconnection_listener(&self, id: ListenerId) -> bool {
        self.shared.disconnection_listeners.remove(id)
    }

    /// Drop all disconnection listeners
    pub fn clear_disconnection_listeners(&self) {
        self.shared.disconnection_listeners.clear();
    }

    /// Drop every listener of every kind
    pub fn clear_all_listeners(&self) {
        self.clear_connection_listeners();
        self.clear_data_listeners();
        self.clear_disconnection_listeners();
    }

    /// Send bytes to one peer
    ///
    /// Unreachable and unknown targets are dropped silently; membership is
    /// eventually consistent and the caller's view may be stale.
    pub fn send_to(&self, target: PeerId, data: impl Into<Vec<u8>>) {
        let control = self.shared.control.lock().unwrap();
        match control.as_ref() {
            Some(tx) => {
                let _ = tx.send(ControlMsg::Unicast {
                    target,
                    data: data.into(),
                });
            }
            None => debug!("send_to({}) while stopped, dropping", target),
        }
    }

    /// Send bytes to every member of the overlay
    ///
    /// The local data listeners observe the payload before any remote peer
    /// does.
    pub fn send_to_all(&self, data: impl Into<Vec<u8>>) {
        let control = self.shared.control.lock().unwrap();
        match control.as_ref() {
            Some(tx) => {
                let _ = tx.send(ControlMsg::Broadcast { data: data.into() });
            }
            None => debug!("send_to_all while stopped, dropping"),
        }
    }

    /// Start a new overlay in the background; this node is the first member
    pub fn run(&self) -> Result<(), MeshError> {
        self.start(None)
    }

    /// Same as [`PeerManager::run`], blocking until the worker exits
    pub fn sync_run(&self) -> Result<(), MeshError> {
        self.run()?;
        self.join();
        Ok(())
    }

    /// Join an existing overlay through one of its members
    ///
    /// Dials the seed and completes admission before the worker starts. On
    /// failure no worker is started and the manager stays stopped.
    pub fn connect(&self, addr: IpAddr, port: u16) -> Result<(), MeshError> {
        self.start(Some(SocketAddr::new(addr, port)))
    }

    /// Same as [`PeerManager::connect`], blocking until the worker exits
    pub fn sync_connect(&self, addr: IpAddr, port: u16) -> Result<(), MeshError> {
        self.connect(addr, port)?;
        self.join();
        Ok(())
    }

    /// Leave the overlay: close all sockets, emit disconnection events in
    /// lexicographic id order, and stop the worker. Idempotent.
    pub fn disconnect(&self) {
        let tx = self.shared.control.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(ControlMsg::Shutdown);
        }
    }

    /// Wait until the worker has terminated; no-op when stopped
    pub fn join(&self) {
        let handle = self.shared.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn start(&self, seed: Option<SocketAddr>) -> Result<(), MeshError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(MeshError::InvalidState("already running"));
        }

        // Reap the previous worker if the caller skipped join()
        self.join();

        let result = self.start_inner(seed);
        if result.is_err() {
            self.shared.running.store(false, Ordering::SeqCst);
        }
        result
    }

    fn start_inner(&self, seed: Option<SocketAddr>) -> Result<(), MeshError> {
        let config = self.config();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let bind_addr = SocketAddr::new(config.listen_addr, config.port);
        let acceptor = runtime.block_on(self.shared.transport.bind(bind_addr))?;

        // Port 0 picks an ephemeral port; record the effective one so the
        // identity packet advertises something dialable
        if let Ok(local_addr) = acceptor.local_addr() {
            self.shared.config.write().unwrap().port = local_addr.port();
        }
        let local_port = self.port();
        info!("Listening for peers on port {}", local_port);

        let initial = match seed {
            Some(seed_addr) => Some(runtime.block_on(establish_outbound(
                self.shared.transport.as_ref(),
                seed_addr,
                self.shared.local_id,
                local_port,
                config.connect_timeout(),
                config.handshake_timeout(),
            ))?),
            None => None,
        };

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        *self.shared.control.lock().unwrap() = Some(control_tx);

        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name("meshnet-worker".to_string())
            .spawn(move || {
                let (worker, events_rx) = Worker::new(Arc::clone(&shared));
                runtime.block_on(worker.run(acceptor, events_rx, control_rx, initial));
                shared.running.store(false, Ordering::SeqCst);
            })
            .map_err(MeshError::Io)?;
        *self.shared.thread.lock().unwrap() = Some(thread);

        Ok(())
    }
}
