//! UDP broadcast discovery fabric.
//!
//! All discovery traffic is JSON over a single well-known UDP port. The
//! controller broadcasts `discovery` requests and listens for replies and
//! heartbeats; each worker runs a responder (unicast reply) and a periodic
//! heartbeat broadcaster. Messages are self-contained and unordered;
//! malformed datagrams are dropped without killing any loop.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::sync_ext::MutexExt;
use crate::timefmt::human_now;

/// Wire shape of every discovery datagram, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    /// Request-for-presence, broadcast by a controller.
    Discovery,
    /// Unicast reply to a `discovery` request.
    DiscoveryResponse {
        hostname: String,
        ip: String,
        #[serde(default)]
        status: Value,
    },
    /// Periodic broadcast from a worker; equivalent to a response for
    /// node-record purposes.
    Heartbeat {
        hostname: String,
        ip: String,
        #[serde(default)]
        status: Value,
    },
    /// Informational broadcast after a task finishes. Observed, not load
    /// bearing.
    TaskComplete {
        hostname: String,
        #[serde(default)]
        task_id: String,
    },
}

/// One discovered worker, keyed by `hostname@ip`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub hostname: String,
    pub ip: String,
    /// Opaque status blob as reported by the worker (its execution-slot
    /// snapshot). Displayed and logged, never interpreted structurally.
    pub status: Value,
    /// Human-readable wall-clock form of the last message time.
    pub last_seen: String,
    #[serde(skip)]
    seen_at: Instant,
}

pub type NodeCallback = Arc<dyn Fn(&NodeRecord) + Send + Sync + 'static>;

/// Node bookkeeping shared between the listener thread and API callers.
///
/// Kept separate from the socket loop so the upsert/expiry rules can be
/// exercised without any network.
struct NodeTable {
    nodes: HashMap<String, NodeRecord>,
    /// Records older than this are dropped and reported as lost. Derived
    /// from 3x the heartbeat interval.
    ttl: Duration,
}

impl NodeTable {
    fn new(ttl: Duration) -> Self {
        Self {
            nodes: HashMap::new(),
            ttl,
        }
    }

    /// Apply one inbound message. Returns the fresh record when this is the
    /// first sighting of the node key.
    fn observe(&mut self, message: DiscoveryMessage, sender_ip: IpAddr) -> Option<NodeRecord> {
        let (hostname, status) = match message {
            DiscoveryMessage::DiscoveryResponse {
                hostname, status, ..
            }
            | DiscoveryMessage::Heartbeat {
                hostname, status, ..
            } => (hostname, status),
            DiscoveryMessage::TaskComplete { hostname, task_id } => {
                info!(%hostname, %sender_ip, task_id, "worker reported task completion");
                return None;
            }
            // Requests are handled by worker-side responders, not here.
            DiscoveryMessage::Discovery => return None,
        };

        let key = format!("{hostname}@{sender_ip}");
        let record = NodeRecord {
            hostname,
            ip: sender_ip.to_string(),
            status,
            last_seen: human_now(),
            seen_at: Instant::now(),
        };
        let first_sighting = !self.nodes.contains_key(&key);
        let snapshot = first_sighting.then(|| record.clone());
        self.nodes.insert(key, record);
        snapshot
    }

    /// Drop records not refreshed within the TTL, returning them.
    fn reap(&mut self, now: Instant) -> Vec<NodeRecord> {
        let expired: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, record)| now.duration_since(record.seen_at) > self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.nodes.remove(&key))
            .collect()
    }
}

/// Controller-side listener + on-demand broadcaster.
pub struct DiscoveryService {
    discovery_port: u16,
    nodes: Arc<Mutex<NodeTable>>,
    on_node_discovered: Option<NodeCallback>,
    on_node_lost: Option<NodeCallback>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl DiscoveryService {
    pub fn new(discovery_port: u16, heartbeat_interval: Duration) -> Self {
        Self {
            discovery_port,
            nodes: Arc::new(Mutex::new(NodeTable::new(heartbeat_interval * 3))),
            on_node_discovered: None,
            on_node_lost: None,
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        }
    }

    pub fn on_node_discovered<F>(mut self, callback: F) -> Self
    where
        F: Fn(&NodeRecord) + Send + Sync + 'static,
    {
        self.on_node_discovered = Some(Arc::new(callback));
        self
    }

    pub fn on_node_lost<F>(mut self, callback: F) -> Self
    where
        F: Fn(&NodeRecord) + Send + Sync + 'static,
    {
        self.on_node_lost = Some(Arc::new(callback));
        self
    }

    /// Start the listener thread, and optionally a periodic `discovery`
    /// broadcaster with the given cadence.
    pub fn start(&mut self, rebroadcast_every: Option<Duration>) -> io::Result<()> {
        let socket = bind_reusable_udp(self.discovery_port)?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;

        let nodes = self.nodes.clone();
        let discovered = self.on_node_discovered.clone();
        let lost = self.on_node_lost.clone();
        let stop = self.stop.clone();
        let listener = thread::Builder::new()
            .name("tc-discovery-listener".into())
            .spawn(move || listen_loop(&socket, &nodes, discovered.as_ref(), lost.as_ref(), &stop))?;
        self.threads.push(listener);
        info!(port = self.discovery_port, "discovery listener started");

        if let Some(every) = rebroadcast_every {
            let port = self.discovery_port;
            let stop = self.stop.clone();
            let broadcaster = thread::Builder::new()
                .name("tc-discovery-broadcast".into())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        if let Err(err) = broadcast_message(port, &DiscoveryMessage::Discovery) {
                            warn!(%err, "periodic discovery broadcast failed");
                        }
                        sleep_interruptible(every, &stop);
                    }
                })?;
            self.threads.push(broadcaster);
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!("discovery service stopped");
    }

    /// One-shot request-for-presence broadcast.
    pub fn broadcast_discovery(&self) {
        if let Err(err) = broadcast_message(self.discovery_port, &DiscoveryMessage::Discovery) {
            warn!(%err, "discovery broadcast failed");
        }
    }

    /// Snapshot of all live node records.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.nodes.lock_unpoisoned().nodes.values().cloned().collect()
    }

    /// Deduplicated IPs of all live nodes.
    pub fn worker_ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = self
            .nodes
            .lock_unpoisoned()
            .nodes
            .values()
            .map(|record| record.ip.clone())
            .collect();
        ips.sort();
        ips.dedup();
        ips
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen_loop(
    socket: &UdpSocket,
    nodes: &Mutex<NodeTable>,
    on_discovered: Option<&NodeCallback>,
    on_lost: Option<&NodeCallback>,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; 4096];
    while !stop.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, addr)) => {
                let Ok(message) = serde_json::from_slice::<DiscoveryMessage>(&buf[..len]) else {
                    debug!(%addr, len, "ignoring malformed discovery datagram");
                    continue;
                };
                let fresh = nodes.lock_unpoisoned().observe(message, addr.ip());
                if let Some(record) = fresh {
                    info!(hostname = %record.hostname, ip = %record.ip, "discovered node");
                    if let Some(callback) = on_discovered {
                        callback(&record);
                    }
                }
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => {
                if !stop.load(Ordering::Relaxed) {
                    warn!(%err, "discovery receive error");
                }
            }
        }

        let expired = nodes.lock_unpoisoned().reap(Instant::now());
        for record in expired {
            info!(hostname = %record.hostname, ip = %record.ip, "node lost (heartbeat timeout)");
            if let Some(callback) = on_lost {
                callback(&record);
            }
        }
    }
}

/// Worker-side unicast responder for `discovery` requests.
pub struct DiscoveryResponder {
    discovery_port: u16,
    get_status: Arc<dyn Fn() -> Value + Send + Sync>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DiscoveryResponder {
    pub fn new<F>(discovery_port: u16, get_status: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self {
            discovery_port,
            get_status: Arc::new(get_status),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn start(&mut self, advertise_ip: String) -> io::Result<()> {
        let socket = bind_reusable_udp(self.discovery_port)?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        let get_status = self.get_status.clone();
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name("tc-discovery-responder".into())
            .spawn(move || {
                let hostname = local_hostname();
                let mut buf = [0u8; 4096];
                while !stop.load(Ordering::Relaxed) {
                    match socket.recv_from(&mut buf) {
                        Ok((len, addr)) => {
                            let Ok(message) =
                                serde_json::from_slice::<DiscoveryMessage>(&buf[..len])
                            else {
                                continue;
                            };
                            if message != DiscoveryMessage::Discovery {
                                continue;
                            }
                            let response = DiscoveryMessage::DiscoveryResponse {
                                hostname: hostname.clone(),
                                ip: advertise_ip.clone(),
                                status: get_status(),
                            };
                            match serde_json::to_vec(&response) {
                                Ok(payload) => {
                                    if let Err(err) = socket.send_to(&payload, addr) {
                                        warn!(%err, %addr, "discovery response failed");
                                    } else {
                                        debug!(%addr, "answered discovery request");
                                    }
                                }
                                Err(err) => warn!(%err, "discovery response encode failed"),
                            }
                        }
                        Err(err)
                            if err.kind() == io::ErrorKind::WouldBlock
                                || err.kind() == io::ErrorKind::TimedOut => {}
                        Err(err) => {
                            if !stop.load(Ordering::Relaxed) {
                                warn!(%err, "discovery responder receive error");
                            }
                        }
                    }
                }
            })?;
        self.handle = Some(handle);
        info!(port = self.discovery_port, "discovery responder started");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DiscoveryResponder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker-side periodic heartbeat broadcaster.
pub struct HeartbeatBroadcaster {
    discovery_port: u16,
    interval: Duration,
    get_status: Arc<dyn Fn() -> Value + Send + Sync>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatBroadcaster {
    pub fn new<F>(discovery_port: u16, interval: Duration, get_status: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self {
            discovery_port,
            interval,
            get_status: Arc::new(get_status),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn start(&mut self, advertise_ip: String) -> io::Result<()> {
        let port = self.discovery_port;
        let interval = self.interval;
        let get_status = self.get_status.clone();
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name("tc-heartbeat".into())
            .spawn(move || {
                let hostname = local_hostname();
                while !stop.load(Ordering::Relaxed) {
                    let message = DiscoveryMessage::Heartbeat {
                        hostname: hostname.clone(),
                        ip: advertise_ip.clone(),
                        status: get_status(),
                    };
                    // Send failures are transient (interface down, no route);
                    // the loop must outlive them.
                    if let Err(err) = broadcast_message(port, &message) {
                        warn!(%err, "heartbeat broadcast failed");
                    }
                    sleep_interruptible(interval, &stop);
                }
            })?;
        self.handle = Some(handle);
        info!(port = self.discovery_port, interval = ?self.interval, "heartbeat broadcaster started");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HeartbeatBroadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Broadcast a `task_complete` notification. Best-effort.
pub fn broadcast_task_complete(discovery_port: u16, task_id: &str) {
    let message = DiscoveryMessage::TaskComplete {
        hostname: local_hostname(),
        task_id: task_id.to_string(),
    };
    if let Err(err) = broadcast_message(discovery_port, &message) {
        debug!(%err, "task_complete broadcast failed");
    }
}

fn broadcast_message(port: u16, message: &DiscoveryMessage) -> io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_broadcast(true)?;
    let payload = serde_json::to_vec(message)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    socket.send_to(&payload, (Ipv4Addr::BROADCAST, port))?;
    Ok(())
}

/// Bind a UDP socket with address reuse so several cluster services on one
/// host can share the discovery port. `SO_REUSEPORT` is best-effort, as not
/// every platform has it.
fn bind_reusable_udp(port: u16) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    let _ = socket.set_reuse_port(true);
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

fn sleep_interruptible(total: Duration, stop: &AtomicBool) {
    let mut remaining = total;
    let tick = Duration::from_secs(1);
    while !remaining.is_zero() && !stop.load(Ordering::Relaxed) {
        let step = remaining.min(tick);
        thread::sleep(step);
        remaining -= step;
    }
}

pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Resolve the LAN address this host should advertise.
///
/// Primary: UDP-connect to a well-known external address (no packet is sent
/// for a DGRAM connect) and read the chosen source address. Results in
/// 127.0.0.0/8 or 198.18.0.0/15 (a range VPN clients commonly squat on) are
/// rejected. Fallback: enumerate interfaces and prefer RFC1918 ranges in the
/// order 192.168/16, 10/8, 172.16/12.
pub fn resolve_local_ip() -> Option<Ipv4Addr> {
    if let Some(ip) = route_probe_ip("8.8.8.8:80").filter(|ip| is_usable_lan_ip(*ip)) {
        return Some(ip);
    }

    let interfaces = local_ip_address::list_afinet_netifas().ok()?;
    let candidates: Vec<Ipv4Addr> = interfaces
        .into_iter()
        .filter_map(|(_name, addr)| match addr {
            IpAddr::V4(ip) if is_usable_lan_ip(ip) => Some(ip),
            _ => None,
        })
        .collect();

    let preferences: [&dyn Fn(&Ipv4Addr) -> bool; 3] = [
        &|ip| ip.octets()[0] == 192 && ip.octets()[1] == 168,
        &|ip| ip.octets()[0] == 10,
        &|ip| ip.octets()[0] == 172 && (16..=31).contains(&ip.octets()[1]),
    ];
    for prefers in preferences {
        if let Some(ip) = candidates.iter().copied().find(|ip| prefers(ip)) {
            return Some(ip);
        }
    }
    candidates.first().copied()
}

fn route_probe_ip(target: &str) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(target).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

fn is_usable_lan_ip(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    let benchmark_range = octets[0] == 198 && (octets[1] & 0xfe) == 18;
    !ip.is_loopback() && !ip.is_unspecified() && !benchmark_range
}

/// `a.b.c.` prefix for the subnet-scan fallback.
pub fn subnet_prefix(ip: Ipv4Addr) -> String {
    let octets = ip.octets();
    format!("{}.{}.{}.", octets[0], octets[1], octets[2])
}
