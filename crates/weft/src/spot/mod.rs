// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Spot: publish/subscribe overlay on the discovery substrate.
//!
//! A [`SpotNode`] owns one PUB socket (bound to application endpoints), one
//! SUB socket (connected to peer nodes' PUBs), and a dealer to the registry
//! for registration and heartbeats. Many [`Spot`] handles multiplex over the
//! node: each holds its own topic/pattern subscriptions and receive queue.
//!
//! Topics are 1–255 byte strings; patterns add a single trailing `*`
//! wildcard. A topic is either `QUEUE` (per-subscriber FIFO) or `RINGBUFFER`
//! (node-held bounded deque with per-subscriber cursors: slow consumers lag
//! but never block publishers, and overflow drops the oldest entries).
//!
//! Publishing dispatches locally and broadcasts `[topic, parts…]` on PUB;
//! the worker dispatches remote envelopes from SUB through the same routine,
//! refreshes the peer set from discovery every 500 ms (skipping the node's
//! own advertisement), and heartbeats the registry.

mod handle;

pub use handle::Spot;

use crate::codec::msg_id;
use crate::discovery::Discovery;
use crate::routing_id::RoutingId;
use crate::socket::{Context, Msg, Socket, SocketType};
use crate::{util, Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Default ringbuffer capacity per topic.
pub const DEFAULT_RING_HWM: usize = 1024;
/// Per-spot queue capacity (drops beyond it).
const SPOT_QUEUE_HWM: usize = 100_000;
/// Registration ack wait.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Peer refresh cadence when discovery is attached.
const DISCOVERY_REFRESH_MS: u64 = 500;
const DEFAULT_HEARTBEAT_MS: u64 = 5_000;
/// Worker idle sleep.
const IDLE_SLEEP: Duration = Duration::from_millis(1);
/// Fallback service name for node registration.
const DEFAULT_NODE_SERVICE: &str = "spot-node";

/// Delivery mode of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicMode {
    /// Every matching subscriber gets its own FIFO queue.
    Queue,
    /// The node retains a bounded window; subscribers cursor through it.
    Ringbuffer,
}

/// A published message shared between subscriber queues. Immutable once
/// created; the last dequeue releases it.
pub(crate) struct SharedMessage {
    pub(crate) topic: String,
    pub(crate) parts: Vec<Msg>,
}

pub(crate) struct RingBuffer {
    pub(crate) start_seq: u64,
    pub(crate) hwm: usize,
    pub(crate) entries: VecDeque<Arc<Vec<Msg>>>,
}

impl RingBuffer {
    fn new() -> Self {
        RingBuffer {
            start_seq: 1,
            hwm: DEFAULT_RING_HWM,
            entries: VecDeque::new(),
        }
    }
}

pub(crate) struct TopicState {
    pub(crate) mode: TopicMode,
    pub(crate) ring: RingBuffer,
}

/// Per-handle state, guarded by the node lock.
pub(crate) struct SpotSlot {
    pub(crate) topics: BTreeSet<String>,
    /// Pattern prefixes (the pattern minus its trailing `*`).
    pub(crate) patterns: BTreeSet<String>,
    pub(crate) ring_cursors: HashMap<String, u64>,
    pub(crate) queue: VecDeque<Arc<SharedMessage>>,
}

impl SpotSlot {
    fn new() -> Self {
        SpotSlot {
            topics: BTreeSet::new(),
            patterns: BTreeSet::new(),
            ring_cursors: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn matches(&self, topic: &str) -> bool {
        if self.topics.contains(topic) {
            return true;
        }
        self.patterns.iter().any(|p| topic.starts_with(p.as_str()))
    }
}

pub(crate) struct NodeState {
    pub_socket: Option<Socket>,
    sub_socket: Option<Socket>,
    dealer: Option<Socket>,
    bind_endpoints: Vec<String>,
    peer_endpoints: BTreeSet<String>,
    registry_endpoints: BTreeSet<String>,
    pending_subscribe: Vec<String>,
    pending_unsubscribe: Vec<String>,
    pending_peer_connect: Vec<String>,
    pending_peer_disconnect: Vec<String>,
    pending_registry_connect: Vec<String>,
    registered: bool,
    service_name: String,
    advertise_endpoint: String,
    heartbeat_interval_ms: u64,
    last_heartbeat_ms: u64,
    discovery: Option<Arc<Discovery>>,
    discovery_service: String,
    next_discovery_refresh_ms: u64,
    filter_refcount: HashMap<String, usize>,
    pub(crate) topics: HashMap<String, TopicState>,
    pub(crate) spots: HashMap<u64, SpotSlot>,
    next_spot_id: u64,
    tls_cert: String,
    tls_key: String,
    tls_ca: String,
    tls_hostname: String,
    tls_trust_system: bool,
}

impl NodeState {
    fn new() -> Self {
        NodeState {
            pub_socket: None,
            sub_socket: None,
            dealer: None,
            bind_endpoints: Vec::new(),
            peer_endpoints: BTreeSet::new(),
            registry_endpoints: BTreeSet::new(),
            pending_subscribe: Vec::new(),
            pending_unsubscribe: Vec::new(),
            pending_peer_connect: Vec::new(),
            pending_peer_disconnect: Vec::new(),
            pending_registry_connect: Vec::new(),
            registered: false,
            service_name: String::new(),
            advertise_endpoint: String::new(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_MS,
            last_heartbeat_ms: 0,
            discovery: None,
            discovery_service: String::new(),
            next_discovery_refresh_ms: 0,
            filter_refcount: HashMap::new(),
            topics: HashMap::new(),
            spots: HashMap::new(),
            next_spot_id: 1,
            tls_cert: String::new(),
            tls_key: String::new(),
            tls_ca: String::new(),
            tls_hostname: String::new(),
            tls_trust_system: false,
        }
    }

    fn add_filter(&mut self, filter: &str) {
        if filter.is_empty() {
            return;
        }
        let count = self.filter_refcount.entry(filter.to_string()).or_insert(0);
        if *count == 0 {
            self.pending_subscribe.push(filter.to_string());
        }
        *count += 1;
    }

    fn remove_filter(&mut self, filter: &str) {
        match self.filter_refcount.get_mut(filter) {
            None => {}
            Some(count) if *count <= 1 => {
                self.pending_unsubscribe.push(filter.to_string());
                self.filter_refcount.remove(filter);
            }
            Some(count) => *count -= 1,
        }
    }

    /// Route one published message to local subscribers (ring or queues).
    /// Returns true when any subscriber may have become readable.
    fn dispatch_local(&mut self, topic: &str, parts: &[Msg]) -> bool {
        let mut wake = false;
        let mut is_ring = false;
        if let Some(state) = self.topics.get_mut(topic) {
            if state.mode == TopicMode::Ringbuffer {
                is_ring = true;
                state.ring.entries.push_back(Arc::new(parts.to_vec()));
                if state.ring.entries.len() > state.ring.hwm {
                    state.ring.entries.pop_front();
                    state.ring.start_seq += 1;
                }
                let start_seq = state.ring.start_seq;
                for slot in self.spots.values_mut() {
                    if let Some(cursor) = slot.ring_cursors.get_mut(topic) {
                        if *cursor < start_seq {
                            *cursor = start_seq;
                        }
                    }
                }
                wake = true;
            }
        }

        let shared = Arc::new(SharedMessage {
            topic: topic.to_string(),
            parts: parts.to_vec(),
        });
        for slot in self.spots.values_mut() {
            if !slot.matches(topic) {
                continue;
            }
            // Ring consumers read through their cursor, not the queue.
            if is_ring && slot.ring_cursors.contains_key(topic) {
                continue;
            }
            if slot.queue.len() >= SPOT_QUEUE_HWM {
                log::debug!("[SPOT] queue full, dropping message on {}", topic);
                continue;
            }
            slot.queue.push_back(Arc::clone(&shared));
            wake = true;
        }
        wake
    }
}

pub(crate) struct NodeInner {
    ctx: Context,
    pub(crate) state: Mutex<NodeState>,
    pub(crate) cv: Condvar,
    pub(crate) stop: AtomicBool,
    destroyed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Serializes register/unregister exchanges on the shared dealer.
    reg_lock: Mutex<()>,
    routing_id: RoutingId,
}

impl NodeInner {
    fn check_live(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(Error::StaleHandle)
        } else {
            Ok(())
        }
    }

    fn topic_create(&self, topic: &str, mode: TopicMode) -> Result<()> {
        self.check_live()?;
        validate_topic(topic)?;
        let mut st = self.state.lock();
        if st.topics.contains_key(topic) {
            return Err(Error::AlreadyExists);
        }
        st.topics.insert(
            topic.to_string(),
            TopicState {
                mode,
                ring: RingBuffer::new(),
            },
        );
        Ok(())
    }

    fn topic_set_hwm(&self, topic: &str, hwm: usize) -> Result<()> {
        self.check_live()?;
        validate_topic(topic)?;
        if hwm == 0 {
            return Err(Error::InvalidArgument("zero ring hwm"));
        }
        let mut st = self.state.lock();
        let state = st.topics.get_mut(topic).ok_or(Error::NotFound)?;
        state.ring.hwm = hwm;
        while state.ring.entries.len() > hwm {
            state.ring.entries.pop_front();
            state.ring.start_seq += 1;
        }
        Ok(())
    }

    fn topic_destroy(&self, topic: &str) -> Result<()> {
        self.check_live()?;
        validate_topic(topic)?;
        let mut st = self.state.lock();
        if st.topics.remove(topic).is_none() {
            return Err(Error::NotFound);
        }
        for slot in st.spots.values_mut() {
            slot.ring_cursors.remove(topic);
        }
        Ok(())
    }

    pub(crate) fn publish(&self, topic: &str, parts: Vec<Msg>) -> Result<()> {
        self.check_live()?;
        validate_topic(topic)?;
        if parts.is_empty() {
            return Err(Error::InvalidArgument("empty message"));
        }

        let (wake, pub_socket) = {
            let mut st = self.state.lock();
            let wake = st.dispatch_local(topic, &parts);
            (wake, st.pub_socket.clone())
        };
        if wake {
            self.cv.notify_all();
        }

        if let Some(pub_socket) = pub_socket {
            let mut frames = Vec::with_capacity(parts.len() + 1);
            frames.push(Msg::from(topic));
            frames.extend(parts);
            pub_socket.send_parts(frames)?;
        }
        Ok(())
    }

    pub(crate) fn subscribe(&self, spot_id: u64, topic: &str) -> Result<()> {
        self.check_live()?;
        validate_topic(topic)?;
        let mut st = self.state.lock();
        let ring_start = st
            .topics
            .get(topic)
            .filter(|t| t.mode == TopicMode::Ringbuffer)
            .map(|t| t.ring.start_seq);
        let Some(slot) = st.spots.get_mut(&spot_id) else {
            return Err(Error::StaleHandle);
        };
        if !slot.topics.insert(topic.to_string()) {
            return Ok(());
        }
        if let Some(start) = ring_start {
            // Fresh subscribers replay the retained window.
            slot.ring_cursors.insert(topic.to_string(), start);
        }
        st.add_filter(topic);
        drop(st);
        self.cv.notify_all();
        Ok(())
    }

    pub(crate) fn subscribe_pattern(&self, spot_id: u64, pattern: &str) -> Result<()> {
        self.check_live()?;
        let prefix = validate_pattern(pattern)
            .ok_or(Error::InvalidArgument("bad pattern"))?
            .to_string();
        let mut st = self.state.lock();
        let Some(slot) = st.spots.get_mut(&spot_id) else {
            return Err(Error::StaleHandle);
        };
        if !slot.patterns.insert(prefix.clone()) {
            return Ok(());
        }
        st.add_filter(&prefix);
        Ok(())
    }

    pub(crate) fn unsubscribe(&self, spot_id: u64, topic_or_pattern: &str) -> Result<()> {
        self.check_live()?;
        if let Some(prefix) = validate_pattern(topic_or_pattern) {
            let prefix = prefix.to_string();
            let mut st = self.state.lock();
            let Some(slot) = st.spots.get_mut(&spot_id) else {
                return Err(Error::StaleHandle);
            };
            if !slot.patterns.remove(&prefix) {
                return Err(Error::InvalidArgument("pattern not subscribed"));
            }
            st.remove_filter(&prefix);
            return Ok(());
        }

        validate_topic(topic_or_pattern)?;
        let mut st = self.state.lock();
        let Some(slot) = st.spots.get_mut(&spot_id) else {
            return Err(Error::StaleHandle);
        };
        if !slot.topics.remove(topic_or_pattern) {
            return Err(Error::InvalidArgument("topic not subscribed"));
        }
        slot.ring_cursors.remove(topic_or_pattern);
        st.remove_filter(topic_or_pattern);
        Ok(())
    }

    pub(crate) fn remove_spot(&self, spot_id: u64) {
        let mut st = self.state.lock();
        let Some(slot) = st.spots.remove(&spot_id) else {
            return;
        };
        for topic in &slot.topics {
            st.remove_filter(topic);
        }
        for prefix in &slot.patterns {
            st.remove_filter(prefix);
        }
    }
}

/// Pub/sub overlay node. See the module docs.
///
/// # Example
///
/// ```rust,no_run
/// use weft::{Context, SpotNode, TopicMode, Msg};
///
/// let ctx = Context::new();
/// let node = SpotNode::new(&ctx);
/// node.bind("tcp://127.0.0.1:*")?;
///
/// let spot = node.create_spot();
/// spot.subscribe_pattern("log.*")?;
/// spot.publish("log.info", vec![Msg::from("hello")])?;
/// let (topic, parts) = spot.recv()?;
/// assert_eq!(topic, "log.info");
/// # let _ = parts;
/// # Ok::<(), weft::Error>(())
/// ```
pub struct SpotNode {
    inner: Arc<NodeInner>,
}

pub(crate) fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.len() > 255 {
        return Err(Error::InvalidArgument("topic length out of range"));
    }
    Ok(())
}

/// A valid pattern has exactly one `*`, at the end. Returns its prefix.
pub(crate) fn validate_pattern(pattern: &str) -> Option<&str> {
    if pattern.is_empty() || pattern.len() > 255 {
        return None;
    }
    let star = pattern.find('*')?;
    if star != pattern.len() - 1 {
        return None;
    }
    Some(&pattern[..star])
}

fn validate_service_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    name.bytes()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'.' || c == b'-')
}

fn rewrite_wildcard_host(endpoint: String) -> String {
    if let Some(rest) = endpoint.strip_prefix("tcp://") {
        if let Some((host, port)) = rest.rsplit_once(':') {
            if host == "*" || host == "0.0.0.0" {
                return format!("tcp://127.0.0.1:{}", port);
            }
        }
    }
    endpoint
}

impl SpotNode {
    /// Create a node and start its worker. The node's routing id is its
    /// random nonzero 32-bit id, little-endian.
    pub fn new(ctx: &Context) -> SpotNode {
        let mut node_id = fastrand::u32(..);
        if node_id == 0 {
            node_id = 1;
        }
        let routing_id = RoutingId::from(&node_id.to_le_bytes()[..]);

        let inner = Arc::new(NodeInner {
            ctx: ctx.clone(),
            state: Mutex::new(NodeState::new()),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            worker: Mutex::new(None),
            reg_lock: Mutex::new(()),
            routing_id,
        });

        let worker_inner = Arc::clone(&inner);
        #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
        let handle = std::thread::Builder::new()
            .name("weft-spot".to_string())
            .spawn(move || run_worker(worker_inner))
            .expect("Failed to spawn spot node worker thread");
        *inner.worker.lock() = Some(handle);

        SpotNode { inner }
    }

    fn check_live(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            Err(Error::StaleHandle)
        } else {
            Ok(())
        }
    }

    /// The node's routing id (used for gossip self-suppression).
    pub fn routing_id(&self) -> RoutingId {
        self.inner.routing_id
    }

    /// Bind the PUB socket to an application endpoint.
    pub fn bind(&self, endpoint: &str) -> Result<()> {
        self.check_live()?;
        if endpoint.is_empty() {
            return Err(Error::InvalidArgument("empty bind endpoint"));
        }
        let mut st = self.inner.state.lock();
        let pub_socket = match &st.pub_socket {
            Some(pub_socket) => pub_socket.clone(),
            None => {
                let pub_socket = self.inner.ctx.socket(SocketType::Pub);
                if !st.tls_cert.is_empty() {
                    pub_socket.set_tls_server(&st.tls_cert, &st.tls_key);
                }
                st.pub_socket = Some(pub_socket.clone());
                pub_socket
            }
        };
        drop(st);
        pub_socket.bind(endpoint)?;
        self.inner
            .state
            .lock()
            .bind_endpoints
            .push(endpoint.to_string());
        Ok(())
    }

    /// Add a registry (router endpoint) for registration and heartbeats.
    pub fn connect_registry(&self, registry_router_endpoint: &str) -> Result<()> {
        self.check_live()?;
        if registry_router_endpoint.is_empty() {
            return Err(Error::InvalidArgument("empty registry endpoint"));
        }
        let mut st = self.inner.state.lock();
        if st
            .registry_endpoints
            .insert(registry_router_endpoint.to_string())
        {
            st.pending_registry_connect
                .push(registry_router_endpoint.to_string());
        }
        Ok(())
    }

    /// Manually connect the SUB socket to a peer node's publisher.
    pub fn connect_peer_pub(&self, peer_pub_endpoint: &str) -> Result<()> {
        self.check_live()?;
        if peer_pub_endpoint.is_empty() {
            return Err(Error::InvalidArgument("empty peer endpoint"));
        }
        let mut st = self.inner.state.lock();
        if st.peer_endpoints.insert(peer_pub_endpoint.to_string()) {
            st.pending_peer_connect.push(peer_pub_endpoint.to_string());
        }
        Ok(())
    }

    /// Manually disconnect a peer publisher.
    pub fn disconnect_peer_pub(&self, peer_pub_endpoint: &str) -> Result<()> {
        self.check_live()?;
        if peer_pub_endpoint.is_empty() {
            return Err(Error::InvalidArgument("empty peer endpoint"));
        }
        let mut st = self.inner.state.lock();
        st.peer_endpoints.remove(peer_pub_endpoint);
        st.pending_peer_disconnect
            .push(peer_pub_endpoint.to_string());
        Ok(())
    }

    /// Register this node with the configured registries so peers can find
    /// its publisher. Blocks for the registration ack.
    pub fn register_node(&self, service_name: &str, advertise_endpoint: &str) -> Result<()> {
        self.check_live()?;
        let service = if service_name.is_empty() {
            DEFAULT_NODE_SERVICE.to_string()
        } else {
            service_name.to_string()
        };
        if !validate_service_name(&service) {
            return Err(Error::InvalidArgument("bad service name"));
        }

        let advertise = {
            let st = self.inner.state.lock();
            if st.registry_endpoints.is_empty() {
                return Err(Error::Unsupported);
            }
            if !advertise_endpoint.is_empty() {
                advertise_endpoint.to_string()
            } else {
                if st.bind_endpoints.len() != 1 {
                    return Err(Error::InvalidArgument(
                        "advertise endpoint required with multiple binds",
                    ));
                }
                let resolved = st
                    .pub_socket
                    .as_ref()
                    .and_then(|s| s.last_endpoint())
                    .unwrap_or_else(|| st.bind_endpoints[0].clone());
                rewrite_wildcard_host(resolved)
            }
        };
        if advertise.is_empty() {
            return Err(Error::InvalidArgument("no advertise endpoint"));
        }

        // Registration goes through the worker's persistent dealer so the
        // registry sees one connection per node id.
        ensure_worker_sockets(&self.inner);
        flush_pending(&self.inner);
        let dealer = self
            .inner
            .state
            .lock()
            .dealer
            .clone()
            .ok_or(Error::Unsupported)?;

        let _reg = self.inner.reg_lock.lock();
        dealer.send_parts(vec![
            Msg::from(msg_id::REGISTER.to_le_bytes().to_vec()),
            Msg::from(service.as_str()),
            Msg::from(advertise.as_str()),
            Msg::from(1u32.to_le_bytes().to_vec()),
        ])?;
        let frames = dealer.recv()?;

        let status = if frames.len() >= 2
            && crate::codec::read_u16(&frames[0]) == Some(msg_id::REGISTER_ACK)
        {
            crate::codec::read_u8(&frames[1]).unwrap_or(0xFF)
        } else {
            0xFF
        };
        if status != 0 {
            return Err(Error::InvalidArgument("node registration rejected"));
        }

        let mut st = self.inner.state.lock();
        st.registered = true;
        st.service_name = service;
        st.advertise_endpoint = advertise;
        st.last_heartbeat_ms = 0;
        Ok(())
    }

    /// Withdraw this node's registration (fire-and-forget).
    pub fn unregister_node(&self, service_name: &str) -> Result<()> {
        self.check_live()?;
        let service = if service_name.is_empty() {
            DEFAULT_NODE_SERVICE.to_string()
        } else {
            service_name.to_string()
        };
        if !validate_service_name(&service) {
            return Err(Error::InvalidArgument("bad service name"));
        }

        let advertise = {
            let mut st = self.inner.state.lock();
            st.registered = false;
            if st.registry_endpoints.is_empty() {
                return Err(Error::Unsupported);
            }
            st.advertise_endpoint.clone()
        };

        ensure_worker_sockets(&self.inner);
        flush_pending(&self.inner);
        let dealer = self
            .inner
            .state
            .lock()
            .dealer
            .clone()
            .ok_or(Error::Unsupported)?;
        let _reg = self.inner.reg_lock.lock();
        dealer.send_parts(vec![
            Msg::from(msg_id::UNREGISTER.to_le_bytes().to_vec()),
            Msg::from(service.as_str()),
            Msg::from(advertise.as_str()),
        ])
    }

    /// Heartbeat period towards the registry (ms, nonzero).
    pub fn set_heartbeat_interval(&self, interval_ms: u64) -> Result<()> {
        self.check_live()?;
        if interval_ms == 0 {
            return Err(Error::InvalidArgument("zero heartbeat interval"));
        }
        self.inner.state.lock().heartbeat_interval_ms = interval_ms;
        Ok(())
    }

    /// Attach a discovery client; the worker follows the named service's
    /// providers as the peer set (refreshed every 500 ms).
    pub fn set_discovery(&self, discovery: &Arc<Discovery>, service_name: &str) -> Result<()> {
        self.check_live()?;
        let service = if service_name.is_empty() {
            DEFAULT_NODE_SERVICE.to_string()
        } else {
            service_name.to_string()
        };
        if !validate_service_name(&service) {
            return Err(Error::InvalidArgument("bad service name"));
        }
        let mut st = self.inner.state.lock();
        st.discovery = Some(Arc::clone(discovery));
        st.discovery_service = service;
        st.next_discovery_refresh_ms = 0;
        Ok(())
    }

    /// TLS material for the PUB socket; empty strings clear.
    pub fn set_tls_server(&self, cert_pem: &str, key_pem: &str) -> Result<()> {
        self.check_live()?;
        let mut st = self.inner.state.lock();
        st.tls_cert = cert_pem.to_string();
        st.tls_key = key_pem.to_string();
        if let Some(pub_socket) = &st.pub_socket {
            pub_socket.set_tls_server(cert_pem, key_pem);
        }
        Ok(())
    }

    /// TLS material for the SUB socket and registry dealers; empty `ca_pem`
    /// clears.
    pub fn set_tls_client(
        &self,
        ca_pem: &str,
        hostname: &str,
        trust_system: bool,
    ) -> Result<()> {
        self.check_live()?;
        let mut st = self.inner.state.lock();
        st.tls_ca = ca_pem.to_string();
        st.tls_hostname = hostname.to_string();
        st.tls_trust_system = trust_system;
        if let Some(sub) = &st.sub_socket {
            sub.set_tls_client(ca_pem, hostname, trust_system);
        }
        if let Some(dealer) = &st.dealer {
            dealer.set_tls_client(ca_pem, hostname, trust_system);
        }
        Ok(())
    }

    /// Create a new handle multiplexed over this node.
    pub fn create_spot(&self) -> Spot {
        let mut st = self.inner.state.lock();
        let id = st.next_spot_id;
        st.next_spot_id += 1;
        st.spots.insert(id, SpotSlot::new());
        Spot::new(Arc::clone(&self.inner), id)
    }

    /// Create a topic with an explicit mode.
    pub fn topic_create(&self, topic: &str, mode: TopicMode) -> Result<()> {
        self.inner.topic_create(topic, mode)
    }

    /// Resize a ringbuffer topic's retention window.
    pub fn topic_set_hwm(&self, topic: &str, hwm: usize) -> Result<()> {
        self.inner.topic_set_hwm(topic, hwm)
    }

    /// Destroy a topic, dropping retained entries and every cursor on it.
    pub fn topic_destroy(&self, topic: &str) -> Result<()> {
        self.inner.topic_destroy(topic)
    }

    /// Stop the worker and close all sockets. Blocked receivers wake with
    /// `Terminated`.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.inner.worker.lock().take() {
            let _ = handle.join();
        }
        let (pub_socket, sub_socket, dealer) = {
            let mut st = self.inner.state.lock();
            st.spots.clear();
            st.topics.clear();
            st.filter_refcount.clear();
            (st.pub_socket.take(), st.sub_socket.take(), st.dealer.take())
        };
        if let Some(s) = dealer {
            s.close();
        }
        if let Some(s) = sub_socket {
            s.close();
        }
        if let Some(s) = pub_socket {
            s.close();
        }
        self.inner.cv.notify_all();
    }
}

impl Drop for SpotNode {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ============================================================================
// Worker
// ============================================================================

fn ensure_worker_sockets(inner: &Arc<NodeInner>) {
    let mut st = inner.state.lock();
    if st.sub_socket.is_none() {
        let sub = inner.ctx.socket(SocketType::Sub);
        if !st.tls_ca.is_empty() || st.tls_trust_system {
            sub.set_tls_client(&st.tls_ca, &st.tls_hostname, st.tls_trust_system);
        }
        // Rebuild the pending sets from authoritative state: active filters
        // and the full peer set all need applying to the fresh socket.
        st.pending_subscribe.clear();
        st.pending_unsubscribe.clear();
        st.pending_peer_connect.clear();
        st.pending_peer_disconnect.clear();
        let filters: Vec<String> = st
            .filter_refcount
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(f, _)| f.clone())
            .collect();
        st.pending_subscribe.extend(filters);
        let peers: Vec<String> = st.peer_endpoints.iter().cloned().collect();
        st.pending_peer_connect.extend(peers);
        st.sub_socket = Some(sub);
    }
    if st.dealer.is_none() {
        let dealer = inner.ctx.socket(SocketType::Dealer);
        if !st.tls_ca.is_empty() || st.tls_trust_system {
            dealer.set_tls_client(&st.tls_ca, &st.tls_hostname, st.tls_trust_system);
        }
        let _ = dealer.set_routing_id(&inner.routing_id);
        dealer.set_rcvtimeo(Some(ACK_TIMEOUT));
        st.pending_registry_connect.clear();
        let registries: Vec<String> = st.registry_endpoints.iter().cloned().collect();
        st.pending_registry_connect.extend(registries);
        st.dealer = Some(dealer);
    }
}

fn flush_pending(inner: &Arc<NodeInner>) -> bool {
    let (sub, dealer, subscribe, unsubscribe, peer_connect, peer_disconnect, registry_connect) = {
        let mut st = inner.state.lock();
        (
            st.sub_socket.clone(),
            st.dealer.clone(),
            std::mem::take(&mut st.pending_subscribe),
            std::mem::take(&mut st.pending_unsubscribe),
            std::mem::take(&mut st.pending_peer_connect),
            std::mem::take(&mut st.pending_peer_disconnect),
            std::mem::take(&mut st.pending_registry_connect),
        )
    };
    let mut busy = false;
    if let Some(sub) = sub {
        for filter in &subscribe {
            let _ = sub.subscribe(filter.as_bytes());
            busy = true;
        }
        for filter in &unsubscribe {
            let _ = sub.unsubscribe(filter.as_bytes());
            busy = true;
        }
        for endpoint in &peer_connect {
            if let Err(e) = sub.connect(endpoint) {
                log::debug!("[SPOT] peer connect {} failed: {}", endpoint, e);
            }
            busy = true;
        }
        for endpoint in &peer_disconnect {
            let _ = sub.disconnect(endpoint);
            busy = true;
        }
    }
    if let Some(dealer) = dealer {
        for endpoint in &registry_connect {
            if let Err(e) = dealer.connect(endpoint) {
                log::debug!("[SPOT] registry connect {} failed: {}", endpoint, e);
            }
            busy = true;
        }
    }
    busy
}

/// Drain the SUB socket, dispatching `[topic, payload…]` envelopes locally.
fn process_sub(inner: &Arc<NodeInner>) -> bool {
    let sub = inner.state.lock().sub_socket.clone();
    let Some(sub) = sub else {
        return false;
    };
    let mut busy = false;
    while let Ok(frames) = sub.try_recv() {
        busy = true;
        if frames.len() < 2 {
            continue;
        }
        let topic = String::from_utf8_lossy(frames[0].data()).into_owned();
        if topic.is_empty() {
            continue;
        }
        let payload = &frames[1..];
        let wake = inner.state.lock().dispatch_local(&topic, payload);
        if wake {
            inner.cv.notify_all();
        }
    }
    busy
}

fn send_heartbeat(inner: &Arc<NodeInner>, now_ms: u64) {
    let (dealer, service, endpoint) = {
        let mut st = inner.state.lock();
        if !st.registered || st.dealer.is_none() {
            return;
        }
        st.last_heartbeat_ms = now_ms;
        (
            st.dealer.clone(),
            st.service_name.clone(),
            st.advertise_endpoint.clone(),
        )
    };
    if let Some(dealer) = dealer {
        let frames = vec![
            Msg::from(msg_id::HEARTBEAT.to_le_bytes().to_vec()),
            Msg::from(service.as_str()),
            Msg::from(endpoint.as_str()),
        ];
        if let Err(e) = dealer.send_parts(frames) {
            log::debug!("[SPOT] heartbeat send failed: {}", e);
        }
    }
}

/// Reconcile the SUB peer set with the discovered providers, skipping our
/// own advertisement by routing id.
fn refresh_peers(inner: &Arc<NodeInner>) {
    let (discovery, service, sub) = {
        let st = inner.state.lock();
        (
            st.discovery.clone(),
            st.discovery_service.clone(),
            st.sub_socket.clone(),
        )
    };
    let (Some(discovery), Some(sub)) = (discovery, sub) else {
        return;
    };

    let providers = discovery.snapshot_providers(&service);
    let mut next: BTreeSet<String> = BTreeSet::new();
    for provider in providers {
        if provider.endpoint.is_empty() {
            continue;
        }
        if provider.routing_id == inner.routing_id {
            continue;
        }
        next.insert(provider.endpoint);
    }

    let (to_connect, to_disconnect) = {
        let mut st = inner.state.lock();
        let to_connect: Vec<String> =
            next.difference(&st.peer_endpoints).cloned().collect();
        let to_disconnect: Vec<String> =
            st.peer_endpoints.difference(&next).cloned().collect();
        st.peer_endpoints = next;
        (to_connect, to_disconnect)
    };
    for endpoint in &to_connect {
        if let Err(e) = sub.connect(endpoint) {
            log::debug!("[SPOT] peer connect {} failed: {}", endpoint, e);
        } else if util::debug_enabled() {
            log::debug!("[SPOT] connected peer {}", endpoint);
        }
    }
    for endpoint in &to_disconnect {
        let _ = sub.disconnect(endpoint);
        if util::debug_enabled() {
            log::debug!("[SPOT] disconnected peer {}", endpoint);
        }
    }
}

fn run_worker(inner: Arc<NodeInner>) {
    while !inner.stop.load(Ordering::Acquire) {
        ensure_worker_sockets(&inner);
        let mut busy = flush_pending(&inner);
        busy |= process_sub(&inner);

        let now = util::now_ms();
        let (do_heartbeat, do_refresh) = {
            let mut st = inner.state.lock();
            let do_heartbeat = st.registered
                && now.saturating_sub(st.last_heartbeat_ms) >= st.heartbeat_interval_ms;
            let do_refresh = st.discovery.is_some() && now >= st.next_discovery_refresh_ms;
            if do_refresh {
                st.next_discovery_refresh_ms = now + DISCOVERY_REFRESH_MS;
            }
            (do_heartbeat, do_refresh)
        };
        if do_heartbeat {
            send_heartbeat(&inner, now);
            busy = true;
        }
        if do_refresh {
            refresh_peers(&inner);
            busy = true;
        }

        if !busy {
            std::thread::sleep(IDLE_SLEEP);
        }
    }
    log::debug!("[SPOT] worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic_bounds() {
        assert!(validate_topic("t").is_ok());
        assert!(validate_topic(&"x".repeat(255)).is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_validate_pattern_shapes() {
        assert_eq!(validate_pattern("log.*"), Some("log."));
        assert_eq!(validate_pattern("*"), Some(""));
        assert_eq!(validate_pattern("log.*x"), None);
        assert_eq!(validate_pattern("a*b*"), None);
        assert_eq!(validate_pattern("plain"), None);
        assert_eq!(validate_pattern(""), None);
        assert_eq!(validate_pattern(&format!("{}*", "x".repeat(255))), None);
    }

    #[test]
    fn test_validate_service_name() {
        assert!(validate_service_name("spot-node"));
        assert!(validate_service_name("a.b-c9"));
        assert!(!validate_service_name(""));
        assert!(!validate_service_name("UPPER"));
        assert!(!validate_service_name("spa ce"));
        assert!(!validate_service_name(&"x".repeat(65)));
    }

    #[test]
    fn test_rewrite_wildcard_host() {
        assert_eq!(
            rewrite_wildcard_host("tcp://*:7000".into()),
            "tcp://127.0.0.1:7000"
        );
        assert_eq!(
            rewrite_wildcard_host("tcp://0.0.0.0:7000".into()),
            "tcp://127.0.0.1:7000"
        );
        assert_eq!(
            rewrite_wildcard_host("tcp://10.1.2.3:7000".into()),
            "tcp://10.1.2.3:7000"
        );
        assert_eq!(rewrite_wildcard_host("inproc://x".into()), "inproc://x");
    }

    #[test]
    fn test_ring_eviction_advances_start_seq() {
        let mut st = NodeState::new();
        st.topics.insert(
            "t".into(),
            TopicState {
                mode: TopicMode::Ringbuffer,
                ring: RingBuffer {
                    start_seq: 1,
                    hwm: 3,
                    entries: VecDeque::new(),
                },
            },
        );
        for i in 0..5u8 {
            st.dispatch_local("t", &[Msg::from(vec![i])]);
        }
        let ring = &st.topics["t"].ring;
        assert_eq!(ring.entries.len(), 3);
        assert_eq!(ring.start_seq, 3);
        // Retained entries are the last three payloads.
        let retained: Vec<u8> = ring.entries.iter().map(|e| e[0].data()[0]).collect();
        assert_eq!(retained, vec![2, 3, 4]);
    }

    #[test]
    fn test_ring_eviction_clamps_cursors() {
        let mut st = NodeState::new();
        st.topics.insert(
            "t".into(),
            TopicState {
                mode: TopicMode::Ringbuffer,
                ring: RingBuffer {
                    start_seq: 1,
                    hwm: 2,
                    entries: VecDeque::new(),
                },
            },
        );
        let mut slot = SpotSlot::new();
        slot.topics.insert("t".into());
        slot.ring_cursors.insert("t".into(), 1);
        st.spots.insert(1, slot);

        for i in 0..4u8 {
            st.dispatch_local("t", &[Msg::from(vec![i])]);
        }
        // start_seq is now 3; the lagging cursor was clamped forward.
        assert_eq!(st.spots[&1].ring_cursors["t"], 3);
        // Ring consumers never get queue copies.
        assert!(st.spots[&1].queue.is_empty());
    }

    #[test]
    fn test_dispatch_queue_topic_fans_out() {
        let mut st = NodeState::new();
        let mut a = SpotSlot::new();
        a.topics.insert("news".into());
        st.spots.insert(1, a);
        let mut b = SpotSlot::new();
        b.patterns.insert("ne".into());
        st.spots.insert(2, b);
        let mut c = SpotSlot::new();
        c.topics.insert("other".into());
        st.spots.insert(3, c);

        assert!(st.dispatch_local("news", &[Msg::from("x")]));
        assert_eq!(st.spots[&1].queue.len(), 1);
        assert_eq!(st.spots[&2].queue.len(), 1);
        assert_eq!(st.spots[&3].queue.len(), 0);
        // Both queues share the same envelope.
        assert!(Arc::ptr_eq(&st.spots[&1].queue[0], &st.spots[&2].queue[0]));
    }

    #[test]
    fn test_filter_refcounting() {
        let mut st = NodeState::new();
        st.add_filter("log.");
        st.add_filter("log.");
        assert_eq!(st.pending_subscribe, vec!["log.".to_string()]);

        st.remove_filter("log.");
        assert!(st.pending_unsubscribe.is_empty());
        st.remove_filter("log.");
        assert_eq!(st.pending_unsubscribe, vec!["log.".to_string()]);
        assert!(st.filter_refcount.is_empty());
    }

    #[test]
    fn test_topic_create_destroy_errors() {
        let ctx = Context::new();
        let node = SpotNode::new(&ctx);
        node.topic_create("t", TopicMode::Ringbuffer).unwrap();
        assert!(matches!(
            node.topic_create("t", TopicMode::Queue),
            Err(Error::AlreadyExists)
        ));
        node.topic_destroy("t").unwrap();
        assert!(matches!(node.topic_destroy("t"), Err(Error::NotFound)));
        assert!(matches!(
            node.topic_set_hwm("t", 8),
            Err(Error::NotFound)
        ));
        node.destroy();
    }
}
