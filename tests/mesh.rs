use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use meshnet::{
    Acceptor, BoxedStream, MeshConfig, PeerId, PeerManager, TcpTransport, Transport,
    DISTANCE_UNREACHABLE,
};

fn local_config() -> MeshConfig {
    MeshConfig {
        listen_addr: "127.0.0.1".parse().unwrap(),
        port: 0,
        ..MeshConfig::default()
    }
}

fn node() -> PeerManager {
    PeerManager::with_config(local_config())
}

fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    condition()
}

type DataLog = Arc<Mutex<Vec<(PeerId, Vec<u8>, bool)>>>;

fn record_data(manager: &PeerManager) -> DataLog {
    let log: DataLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    manager.add_data_listener(move |_, source, data, sent_to_all| {
        sink.lock()
            .unwrap()
            .push((source.id, data.to_vec(), sent_to_all));
    });
    log
}

type PeerLog = Arc<Mutex<Vec<PeerId>>>;

fn record_connections(manager: &PeerManager) -> PeerLog {
    let log: PeerLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    manager.add_connection_listener(move |_, peer| {
        sink.lock().unwrap().push(peer.id);
    });
    log
}

fn record_disconnections(manager: &PeerManager) -> PeerLog {
    let log: PeerLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    manager.add_disconnection_listener(move |_, peer| {
        sink.lock().unwrap().push(peer.id);
    });
    log
}

fn stop_all(nodes: &[&PeerManager]) {
    for manager in nodes {
        manager.disconnect();
    }
    for manager in nodes {
        manager.join();
    }
}

/// Transport whose dials are vetoed by a predicate, shaping the topology
/// the way firewalls and NATs would; inbound connections are untouched.
struct FilteredTransport {
    inner: TcpTransport,
    allow: Box<dyn Fn(SocketAddr) -> bool + Send + Sync>,
}

impl FilteredTransport {
    fn new(allow: impl Fn(SocketAddr) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner: TcpTransport::new(),
            allow: Box::new(allow),
        }
    }
}

#[async_trait]
impl Transport for FilteredTransport {
    async fn bind(&self, addr: SocketAddr) -> std::io::Result<Box<dyn Acceptor>> {
        self.inner.bind(addr).await
    }

    async fn dial(
        &self,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> std::io::Result<BoxedStream> {
        if !(self.allow)(addr) {
            return Err(std::io::Error::new(
                ErrorKind::ConnectionRefused,
                "dial filtered",
            ));
        }
        self.inner.dial(addr, connect_timeout).await
    }
}

/// Build the bridged topology: `a`--`b` and `b`--`c` direct, while `a` and
/// `c` cannot dial each other, so `b` ends up relaying for the pair.
fn bridged_trio() -> (PeerManager, PeerManager, PeerManager) {
    // `a` never dials anyone successfully
    let a = PeerManager::with_transport(
        local_config(),
        Arc::new(FilteredTransport::new(|_| false)),
    );
    a.run().unwrap();
    let a_port = a.port();

    let b = node();
    b.connect("127.0.0.1".parse().unwrap(), a_port).unwrap();

    // `c` can dial anyone but `a`
    let c = PeerManager::with_transport(
        local_config(),
        Arc::new(FilteredTransport::new(move |addr| addr.port() != a_port)),
    );
    c.connect("127.0.0.1".parse().unwrap(), b.port()).unwrap();

    let reached = wait_until(Duration::from_secs(10), || {
        let a_sees_c = a
            .peers()
            .get(&c.id())
            .map_or(false, |p| p.distance == 2 && p.bridge == Some(b.id()));
        let c_sees_a = c
            .peers()
            .get(&a.id())
            .map_or(false, |p| p.distance == 2 && p.bridge == Some(b.id()));
        a_sees_c && c_sees_a
    });
    assert!(reached, "bridge election did not converge");

    (a, b, c)
}

#[test]
fn two_node_unicast() {
    let a = node();
    let b = node();
    let a_data = record_data(&a);

    a.run().unwrap();
    b.connect("127.0.0.1".parse().unwrap(), a.port()).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        a.peers().contains_key(&b.id()) && b.peers().contains_key(&a.id())
    }));

    // Both ends see a single direct peer
    assert_eq!(a.peers().len(), 1);
    assert_eq!(b.peers().len(), 1);
    assert_eq!(b.peers()[&a.id()].distance, 1);

    b.send_to(a.id(), [0x01, 0x02, 0x03]);

    assert!(wait_until(Duration::from_secs(5), || {
        !a_data.lock().unwrap().is_empty()
    }));
    let seen = a_data.lock().unwrap().clone();
    assert_eq!(seen, vec![(b.id(), vec![0x01, 0x02, 0x03], false)]);

    stop_all(&[&a, &b]);
}

#[test]
fn three_node_broadcast() {
    let a = node();
    let b = node();
    let c = node();
    let a_data = record_data(&a);
    let b_data = record_data(&b);
    let c_data = record_data(&c);

    a.run().unwrap();
    let seed: std::net::IpAddr = "127.0.0.1".parse().unwrap();
    b.connect(seed, a.port()).unwrap();
    c.connect(seed, a.port()).unwrap();

    // The roster from the seed lets b and c find each other directly
    assert!(wait_until(Duration::from_secs(10), || {
        [&a, &b, &c].iter().all(|m| m.peers().len() == 2)
    }));

    b.send_to_all([0xaa]);

    assert!(wait_until(Duration::from_secs(5), || {
        !a_data.lock().unwrap().is_empty() && !c_data.lock().unwrap().is_empty()
    }));
    // Give any duplicate time to show up
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(a_data.lock().unwrap().clone(), vec![(b.id(), vec![0xaa], true)]);
    assert_eq!(c_data.lock().unwrap().clone(), vec![(b.id(), vec![0xaa], true)]);

    // The sender observes its own broadcast once, locally; nothing echoes
    // back over the network
    assert_eq!(b_data.lock().unwrap().clone(), vec![(b.id(), vec![0xaa], true)]);

    stop_all(&[&a, &b, &c]);
}

#[test]
fn bridged_unicast() {
    let (a, b, c) = bridged_trio();
    let b_data = record_data(&b);
    let c_data = record_data(&c);

    a.send_to(c.id(), [0xff]);

    assert!(wait_until(Duration::from_secs(5), || {
        !c_data.lock().unwrap().is_empty()
    }));
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(c_data.lock().unwrap().clone(), vec![(a.id(), vec![0xff], false)]);
    // The bridge relays without observing the payload itself
    assert!(b_data.lock().unwrap().is_empty());

    stop_all(&[&a, &b, &c]);
}

#[test]
fn broadcast_crosses_the_bridge_exactly_once() {
    let (a, b, c) = bridged_trio();
    let b_data = record_data(&b);
    let c_data = record_data(&c);

    a.send_to_all([0xbb]);

    assert!(wait_until(Duration::from_secs(5), || {
        !b_data.lock().unwrap().is_empty() && !c_data.lock().unwrap().is_empty()
    }));
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(b_data.lock().unwrap().clone(), vec![(a.id(), vec![0xbb], true)]);
    assert_eq!(c_data.lock().unwrap().clone(), vec![(a.id(), vec![0xbb], true)]);

    stop_all(&[&a, &b, &c]);
}

#[test]
fn bridged_peer_fires_connection_listener() {
    // The reachability event for a bridged peer arrives like any other
    let a = PeerManager::with_transport(
        local_config(),
        Arc::new(FilteredTransport::new(|_| false)),
    );
    let a_connections = record_connections(&a);
    a.run().unwrap();
    let a_port = a.port();

    let b = node();
    b.connect("127.0.0.1".parse().unwrap(), a_port).unwrap();

    let c = PeerManager::with_transport(
        local_config(),
        Arc::new(FilteredTransport::new(move |addr| addr.port() != a_port)),
    );
    c.connect("127.0.0.1".parse().unwrap(), b.port()).unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        a_connections.lock().unwrap().contains(&c.id())
    }));

    stop_all(&[&a, &b, &c]);
}

#[test]
fn graceful_disconnect_propagates() {
    let (a, b, c) = bridged_trio();
    let a_gone = record_disconnections(&a);
    let b_gone = record_disconnections(&b);

    c.disconnect();
    c.join();

    assert!(wait_until(Duration::from_secs(5), || {
        !a.peers().contains_key(&c.id()) && !b.peers().contains_key(&c.id())
    }));
    std::thread::sleep(Duration::from_millis(300));

    // Each survivor hears about the departure exactly once
    assert_eq!(a_gone.lock().unwrap().clone(), vec![c.id()]);
    assert_eq!(b_gone.lock().unwrap().clone(), vec![c.id()]);
    assert!(a.peers().contains_key(&b.id()));

    stop_all(&[&a, &b]);
}

#[test]
fn bridge_failure_makes_peer_unreachable() {
    let (a, b, c) = bridged_trio();
    let c_data = record_data(&c);

    b.disconnect();
    b.join();

    assert!(wait_until(Duration::from_secs(5), || {
        a.peers()
            .get(&c.id())
            .map_or(false, |p| p.distance == DISTANCE_UNREACHABLE && p.bridge.is_none())
    }));
    assert!(!a.peers().contains_key(&b.id()));

    // Sends toward the lost peer are dropped silently
    a.send_to(c.id(), [0x01]);
    std::thread::sleep(Duration::from_millis(500));
    assert!(c_data.lock().unwrap().is_empty());

    stop_all(&[&a, &c]);
}

#[test]
fn disconnect_empties_the_peer_table() {
    let (a, b, c) = bridged_trio();

    for manager in [&a, &b, &c] {
        manager.disconnect();
        manager.join();
        assert!(manager.peers().is_empty());
        assert!(!manager.is_running());
    }
}

#[test]
fn duplicate_admission_is_rejected() {
    use meshnet::codec::identity::{exchange_identity, exchange_protocol_id};
    use tokio::net::TcpStream;

    let a = node();
    let b = node();
    a.run().unwrap();
    b.connect("127.0.0.1".parse().unwrap(), a.port()).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        a.peers().contains_key(&b.id())
    }));
    let original = a.peers()[&b.id()].clone();

    // A rogue connection re-using b's identity must not disturb the
    // existing record
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let mut stream = TcpStream::connect(("127.0.0.1", a.port())).await.unwrap();
        exchange_protocol_id(&mut stream).await.unwrap();
        exchange_identity(&mut stream, &b.id(), 9).await.unwrap();
    });

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(a.peers().len(), 1);
    assert_eq!(a.peers()[&b.id()], original);

    stop_all(&[&a, &b]);
}

#[test]
fn protocol_mismatch_is_rejected() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let a = node();
    a.run().unwrap();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let mut stream = TcpStream::connect(("127.0.0.1", a.port())).await.unwrap();
        stream.write_u32_le(0xdead_beef).await.unwrap();
        stream.write_u32_le(0xdead_beef).await.unwrap();

        // The node answers with its own identifier, then hangs up
        let _ = stream.read_u32_le().await.unwrap();
        let _ = stream.read_u32_le().await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });

    std::thread::sleep(Duration::from_millis(300));
    assert!(a.peers().is_empty());

    stop_all(&[&a]);
}
