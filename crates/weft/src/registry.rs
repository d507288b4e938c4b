// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service registry.
//!
//! The registry owns the authoritative local slice of the `(service →
//! providers)` directory. Providers talk to it over a router socket
//! (`REGISTER` / `UNREGISTER` / `UPDATE_WEIGHT` / `HEARTBEAT`); clients learn
//! the directory from full `SERVICE_LIST` broadcasts on an XPUB socket; peer
//! registries gossip the same payload and the slices merge under
//! last-writer-wins per `(peer, sequence)`.
//!
//! One worker thread runs the whole thing: poll the router, the publisher
//! (subscription upcalls trigger an immediate broadcast so new clients
//! converge fast), and the peer subscriber on a 100 ms tick; expire silent
//! providers and silent peers; broadcast whenever `list_seq` advanced, and
//! unconditionally every broadcast interval.

use crate::codec::{self, msg_id, ProviderRow, ServiceListMsg};
use crate::routing_id::RoutingId;
use crate::socket::{events, poll, Context, Msg, PollItem, Socket, SocketType};
use crate::{util, Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 30_000;
/// Poll tick of the worker loop.
const TICK_MS: i64 = 100;

/// Registration ack status codes.
pub mod ack_status {
    /// Accepted.
    pub const OK: u8 = 0x00;
    /// Known service/provider but the request could not be applied.
    pub const REJECTED: u8 = 0x01;
    /// Malformed registration (missing service or endpoint).
    pub const INVALID: u8 = 0x02;
    /// Short or undecodable frame batch.
    pub const MALFORMED: u8 = 0xFF;
}

/// Which worker socket a staged option applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrySocket {
    /// The XPUB broadcast socket.
    Pub,
    /// The router providers talk to.
    Router,
    /// The subscriber connected to peer registries.
    PeerSub,
}

/// Options that can be staged before `start` for a worker socket.
#[derive(Debug, Clone)]
pub enum SocketOption {
    /// Socket routing id.
    RoutingId(RoutingId),
    /// Outbound high-water mark.
    SndHwm(usize),
    /// Inbound high-water mark.
    RcvHwm(usize),
    /// Server-side TLS material (PEM).
    TlsServer { cert_pem: String, key_pem: String },
    /// Client-side TLS material (PEM CA, expected hostname, system trust).
    TlsClient {
        ca_pem: String,
        hostname: String,
        trust_system: bool,
    },
}

#[derive(Clone)]
pub(crate) struct ProviderEntry {
    pub endpoint: String,
    pub routing_id: RoutingId,
    pub weight: u32,
    pub registered_at: u64,
    pub last_heartbeat: u64,
    pub source_registry: u32,
}

#[derive(Default)]
struct ServiceEntry {
    providers: BTreeMap<String, ProviderEntry>,
}

struct RegistryState {
    pub_endpoint: String,
    router_endpoint: String,
    peer_pubs: Vec<String>,
    registry_id: u32,
    registry_id_set: bool,
    list_seq: u64,
    heartbeat_interval_ms: u64,
    heartbeat_timeout_ms: u64,
    broadcast_interval_ms: u64,
    services: BTreeMap<String, ServiceEntry>,
    peer_seq: HashMap<u32, u64>,
    peer_last_seen: HashMap<u32, u64>,
    pub_opts: Vec<SocketOption>,
    router_opts: Vec<SocketOption>,
    peer_sub_opts: Vec<SocketOption>,
}

impl RegistryState {
    fn new() -> Self {
        RegistryState {
            pub_endpoint: String::new(),
            router_endpoint: String::new(),
            peer_pubs: Vec::new(),
            registry_id: 0,
            registry_id_set: false,
            list_seq: 0,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            broadcast_interval_ms: DEFAULT_BROADCAST_INTERVAL_MS,
            services: BTreeMap::new(),
            peer_seq: HashMap::new(),
            peer_last_seen: HashMap::new(),
            pub_opts: Vec::new(),
            router_opts: Vec::new(),
            peer_sub_opts: Vec::new(),
        }
    }

    fn local_id(&self) -> u32 {
        if self.registry_id == 0 {
            1
        } else {
            self.registry_id
        }
    }

    /// Build the broadcast payload for the current directory.
    fn service_list(&self) -> ServiceListMsg {
        let services = self
            .services
            .iter()
            .filter(|(_, entry)| !entry.providers.is_empty())
            .map(|(name, entry)| {
                let rows = entry
                    .providers
                    .values()
                    .map(|p| ProviderRow {
                        endpoint: p.endpoint.clone(),
                        routing_id: p.routing_id,
                        weight: p.weight,
                    })
                    .collect();
                (name.clone(), rows)
            })
            .collect();
        ServiceListMsg {
            msg_id: msg_id::SERVICE_LIST,
            registry_id: self.local_id(),
            list_seq: self.list_seq,
            services,
        }
    }

    /// Drop timed-out local providers and silent peers; bumps `list_seq`
    /// when anything changed.
    fn remove_expired(&mut self, now_ms: u64) {
        let local_id = self.registry_id;
        let timeout = self.heartbeat_timeout_ms;
        let mut changed = false;

        self.services.retain(|_, entry| {
            entry.providers.retain(|_, p| {
                if p.source_registry != local_id {
                    return true;
                }
                let expired =
                    now_ms > p.last_heartbeat && now_ms - p.last_heartbeat > timeout;
                if expired {
                    changed = true;
                }
                !expired
            });
            !entry.providers.is_empty()
        });

        let mut peer_timeout = self.broadcast_interval_ms;
        if peer_timeout == 0 {
            peer_timeout = DEFAULT_BROADCAST_INTERVAL_MS;
        }
        peer_timeout *= 3;

        let silent: Vec<u32> = self
            .peer_last_seen
            .iter()
            .filter(|(_, seen)| now_ms > **seen && now_ms - **seen > peer_timeout)
            .map(|(id, _)| *id)
            .collect();
        for peer_id in silent {
            log::debug!("[REGISTRY] peer {} silent, dropping its entries", peer_id);
            self.services.retain(|_, entry| {
                entry.providers.retain(|_, p| {
                    if p.source_registry == peer_id {
                        changed = true;
                        false
                    } else {
                        true
                    }
                });
                !entry.providers.is_empty()
            });
            self.peer_seq.remove(&peer_id);
            self.peer_last_seen.remove(&peer_id);
        }

        if changed {
            self.list_seq += 1;
        }
    }

    /// Merge a gossip snapshot from a peer registry. Entries sourced from
    /// other registries (including our own) are never overwritten. Returns
    /// false when the message was stale or from ourselves.
    fn apply_gossip(&mut self, list: &ServiceListMsg, now_ms: u64) -> bool {
        let peer_id = list.registry_id;
        if peer_id == self.local_id() {
            return false;
        }
        self.peer_last_seen.insert(peer_id, now_ms);
        if let Some(stored) = self.peer_seq.get(&peer_id) {
            if list.list_seq <= *stored {
                return false;
            }
        }

        // Incoming view of that peer's slice.
        let mut incoming: BTreeMap<String, BTreeMap<String, ProviderEntry>> = BTreeMap::new();
        for (service, rows) in &list.services {
            let providers = incoming.entry(service.clone()).or_default();
            for row in rows {
                if row.endpoint.is_empty() {
                    continue;
                }
                providers.insert(
                    row.endpoint.clone(),
                    ProviderEntry {
                        endpoint: row.endpoint.clone(),
                        routing_id: row.routing_id,
                        weight: row.weight.max(1),
                        registered_at: now_ms,
                        last_heartbeat: now_ms,
                        source_registry: peer_id,
                    },
                );
            }
        }

        // Anything actually new or different?
        let mut changed = false;
        'detect: for (service, providers) in &incoming {
            for (endpoint, entry) in providers {
                let existing = self
                    .services
                    .get(service)
                    .and_then(|s| s.providers.get(endpoint));
                let matches = match existing {
                    Some(cur) if cur.source_registry == peer_id => {
                        cur.weight == entry.weight && cur.routing_id == entry.routing_id
                    }
                    // Held by another source: gossip does not touch it, so it
                    // is not a difference either.
                    Some(_) => true,
                    None => false,
                };
                if !matches {
                    changed = true;
                    break 'detect;
                }
            }
        }
        if !changed {
            // Any deletions?
            'deletions: for (service, entry) in &self.services {
                for (endpoint, p) in &entry.providers {
                    if p.source_registry != peer_id {
                        continue;
                    }
                    let still_carried = incoming
                        .get(service)
                        .map(|m| m.contains_key(endpoint))
                        .unwrap_or(false);
                    if !still_carried {
                        changed = true;
                        break 'deletions;
                    }
                }
            }
        }
        if !changed {
            self.peer_seq.insert(peer_id, list.list_seq);
            return false;
        }

        // Rebuild the slice sourced from this peer.
        self.services.retain(|_, entry| {
            entry
                .providers
                .retain(|_, p| p.source_registry != peer_id);
            !entry.providers.is_empty()
        });
        for (service, providers) in incoming {
            let entry = self.services.entry(service).or_default();
            for (endpoint, provider) in providers {
                match entry.providers.get(&endpoint) {
                    Some(existing) if existing.source_registry != peer_id => continue,
                    _ => {
                        entry.providers.insert(endpoint, provider);
                    }
                }
            }
        }

        self.peer_seq.insert(peer_id, list.list_seq);
        self.list_seq += 1;
        true
    }
}

struct RegistryInner {
    ctx: Context,
    state: Mutex<RegistryState>,
    stop: AtomicBool,
    destroyed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Replicated service directory. See the module docs for the protocol.
///
/// # Example
///
/// ```rust,no_run
/// use weft::{Context, Registry};
///
/// let ctx = Context::new();
/// let registry = Registry::new(&ctx);
/// registry.set_endpoints("tcp://*:7100", "tcp://*:7101")?;
/// registry.set_heartbeat(1_000, 3_000)?;
/// registry.start()?;
/// # Ok::<(), weft::Error>(())
/// ```
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Create an idle registry. Configure it, then call [`Registry::start`].
    pub fn new(ctx: &Context) -> Registry {
        Registry {
            inner: Arc::new(RegistryInner {
                ctx: ctx.clone(),
                state: Mutex::new(RegistryState::new()),
                stop: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }

    fn check_live(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            Err(Error::StaleHandle)
        } else {
            Ok(())
        }
    }

    /// Set the publisher and router endpoints. Both are required before
    /// `start`.
    pub fn set_endpoints(&self, pub_endpoint: &str, router_endpoint: &str) -> Result<()> {
        self.check_live()?;
        if pub_endpoint.is_empty() || router_endpoint.is_empty() {
            return Err(Error::InvalidArgument("empty registry endpoint"));
        }
        let mut st = self.inner.state.lock();
        st.pub_endpoint = pub_endpoint.to_string();
        st.router_endpoint = router_endpoint.to_string();
        Ok(())
    }

    /// Fix the registry id. When unset, a nonzero random id is generated at
    /// start.
    pub fn set_id(&self, registry_id: u32) -> Result<()> {
        self.check_live()?;
        let mut st = self.inner.state.lock();
        st.registry_id = registry_id;
        st.registry_id_set = true;
        Ok(())
    }

    /// Registry id, once known (fixed or generated by the worker).
    pub fn id(&self) -> Option<u32> {
        let st = self.inner.state.lock();
        if st.registry_id_set {
            Some(st.local_id())
        } else {
            None
        }
    }

    /// Subscribe to a peer registry's publisher for gossip.
    pub fn add_peer(&self, peer_pub_endpoint: &str) -> Result<()> {
        self.check_live()?;
        if peer_pub_endpoint.is_empty() {
            return Err(Error::InvalidArgument("empty peer endpoint"));
        }
        self.inner
            .state
            .lock()
            .peer_pubs
            .push(peer_pub_endpoint.to_string());
        Ok(())
    }

    /// Configure provider liveness: heartbeat interval and expiry timeout
    /// (both in ms, nonzero, timeout > interval).
    pub fn set_heartbeat(&self, interval_ms: u64, timeout_ms: u64) -> Result<()> {
        self.check_live()?;
        if interval_ms == 0 || timeout_ms == 0 {
            return Err(Error::InvalidArgument("zero heartbeat interval"));
        }
        if timeout_ms <= interval_ms {
            return Err(Error::InvalidArgument(
                "heartbeat timeout must exceed interval",
            ));
        }
        let mut st = self.inner.state.lock();
        st.heartbeat_interval_ms = interval_ms;
        st.heartbeat_timeout_ms = timeout_ms;
        Ok(())
    }

    /// Minimum period between full broadcasts even when idle (ms, nonzero).
    pub fn set_broadcast_interval(&self, interval_ms: u64) -> Result<()> {
        self.check_live()?;
        if interval_ms == 0 {
            return Err(Error::InvalidArgument("zero broadcast interval"));
        }
        self.inner.state.lock().broadcast_interval_ms = interval_ms;
        Ok(())
    }

    /// Stage an option for one of the worker sockets, applied when the
    /// worker creates them.
    pub fn set_socket_option(&self, role: RegistrySocket, option: SocketOption) -> Result<()> {
        self.check_live()?;
        let mut st = self.inner.state.lock();
        let opts = match role {
            RegistrySocket::Pub => &mut st.pub_opts,
            RegistrySocket::Router => &mut st.router_opts,
            RegistrySocket::PeerSub => &mut st.peer_sub_opts,
        };
        opts.push(option);
        Ok(())
    }

    /// Spawn the worker. Idempotent once running.
    pub fn start(&self) -> Result<()> {
        self.check_live()?;
        {
            let st = self.inner.state.lock();
            if st.pub_endpoint.is_empty() || st.router_endpoint.is_empty() {
                return Err(Error::InvalidArgument("registry endpoints unset"));
            }
        }
        let mut worker = self.inner.worker.lock();
        if worker.is_some() && !self.inner.stop.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }
        self.inner.stop.store(false, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("weft-registry".to_string())
            .spawn(move || run_worker(inner))
            .map_err(Error::Io)?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stop the worker and release its sockets. Subsequent calls on this
    /// handle fail with `StaleHandle`.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.inner.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ============================================================================
// Worker
// ============================================================================

fn apply_socket_options(sock: &Socket, opts: &[SocketOption]) {
    for opt in opts {
        match opt {
            SocketOption::RoutingId(rid) => {
                let _ = sock.set_routing_id(rid);
            }
            SocketOption::SndHwm(hwm) => sock.set_sndhwm(*hwm),
            SocketOption::RcvHwm(hwm) => sock.set_rcvhwm(*hwm),
            SocketOption::TlsServer { cert_pem, key_pem } => {
                sock.set_tls_server(cert_pem, key_pem)
            }
            SocketOption::TlsClient {
                ca_pem,
                hostname,
                trust_system,
            } => sock.set_tls_client(ca_pem, hostname, *trust_system),
        }
    }
}

fn run_worker(inner: Arc<RegistryInner>) {
    let (pub_endpoint, router_endpoint, pub_opts, router_opts, peer_sub_opts) = {
        let st = inner.state.lock();
        (
            st.pub_endpoint.clone(),
            st.router_endpoint.clone(),
            st.pub_opts.clone(),
            st.router_opts.clone(),
            st.peer_sub_opts.clone(),
        )
    };

    let xpub = inner.ctx.socket(SocketType::XPub);
    let router = inner.ctx.socket(SocketType::Router);
    apply_socket_options(&xpub, &pub_opts);
    apply_socket_options(&router, &router_opts);
    // Verbose upcalls: every new subscriber triggers a fresh broadcast.
    xpub.set_xpub_verbose(true);

    if let Err(e) = xpub.bind(&pub_endpoint) {
        log::debug!("[REGISTRY] pub bind {} failed: {}", pub_endpoint, e);
        xpub.close();
        router.close();
        return;
    }
    if let Err(e) = router.bind(&router_endpoint) {
        log::debug!("[REGISTRY] router bind {} failed: {}", router_endpoint, e);
        xpub.close();
        router.close();
        return;
    }

    let mut peer_sub: Option<Socket> = None;
    let mut peer_connected: Vec<String> = Vec::new();

    {
        let mut st = inner.state.lock();
        if !st.registry_id_set {
            let mut id = fastrand::u32(..);
            if id == 0 {
                id = 1;
            }
            st.registry_id = id;
            st.registry_id_set = true;
        }
        log::debug!("[REGISTRY] worker up, id={}", st.local_id());
    }

    let mut next_broadcast = util::now_ms()
        + inner.state.lock().broadcast_interval_ms;
    let mut last_sent_seq = inner.state.lock().list_seq;

    while !inner.stop.load(Ordering::Acquire) {
        // Pick up peers added after start.
        let peer_pubs = inner.state.lock().peer_pubs.clone();
        if !peer_pubs.is_empty() && peer_sub.is_none() {
            let sub = inner.ctx.socket(SocketType::Sub);
            apply_socket_options(&sub, &peer_sub_opts);
            let _ = sub.subscribe(b"");
            peer_sub = Some(sub);
        }
        if let Some(sub) = &peer_sub {
            for endpoint in &peer_pubs {
                if !peer_connected.contains(endpoint) {
                    if sub.connect(endpoint).is_ok() {
                        peer_connected.push(endpoint.clone());
                    }
                }
            }
        }

        {
            let mut items = Vec::with_capacity(3);
            items.push(PollItem::new(&router, events::POLLIN));
            items.push(PollItem::new(&xpub, events::POLLIN));
            if let Some(sub) = &peer_sub {
                items.push(PollItem::new(sub, events::POLLIN));
            }
            let _ = poll(&mut items, TICK_MS);
        }

        while let Ok(frames) = router.try_recv() {
            handle_router_message(&inner, &router, &frames);
        }
        let mut subscriber_joined = false;
        while let Ok(frames) = xpub.try_recv() {
            if let Some(first) = frames.first() {
                if first.data().first() == Some(&1) {
                    subscriber_joined = true;
                }
            }
        }
        if let Some(sub) = &peer_sub {
            while let Ok(frames) = sub.try_recv() {
                let now = util::now_ms();
                if let Some(list) = ServiceListMsg::decode(&frames) {
                    let mut st = inner.state.lock();
                    if st.apply_gossip(&list, now) {
                        log::debug!(
                            "[REGISTRY] merged gossip from {} seq={}",
                            list.registry_id,
                            list.list_seq
                        );
                    }
                } else if util::debug_enabled() {
                    log::debug!("[REGISTRY] undecodable gossip ({} frames)", frames.len());
                }
            }
        }

        let now = util::now_ms();
        {
            let mut st = inner.state.lock();
            st.remove_expired(now);
            let due = st.list_seq != last_sent_seq || subscriber_joined || now >= next_broadcast;
            if due {
                let frames = st.service_list().encode();
                last_sent_seq = st.list_seq;
                drop(st);
                // The whole snapshot goes out as one atomic multipart send.
                if let Err(e) = xpub.send_parts(frames) {
                    log::debug!("[REGISTRY] broadcast failed: {}", e);
                }
                next_broadcast = now + inner.state.lock().broadcast_interval_ms;
            }
        }
    }

    if let Some(sub) = peer_sub {
        sub.close();
    }
    router.close();
    xpub.close();
    log::debug!("[REGISTRY] worker stopped");
}

/// Dispatch one router message: `[sender_rid, msg_id, …]`.
fn handle_router_message(inner: &Arc<RegistryInner>, router: &Socket, frames: &[Msg]) {
    if frames.len() < 2 {
        return;
    }
    let sender = codec::read_routing_id(&frames[0]).unwrap_or_default();
    let payload = &frames[1..];
    let id = match codec::read_u16(&payload[0]) {
        Some(id) => id,
        None => return,
    };
    if util::debug_enabled() {
        log::debug!(
            "[REGISTRY] msg 0x{:04x} from 0x{} ({} frames)",
            id,
            util::hex(sender.as_bytes()),
            frames.len()
        );
    }
    match id {
        msg_id::REGISTER => handle_register(inner, router, payload, &sender),
        msg_id::UNREGISTER => handle_unregister(inner, payload),
        msg_id::HEARTBEAT => handle_heartbeat(inner, payload),
        msg_id::UPDATE_WEIGHT => handle_update_weight(inner, router, payload, &sender),
        // Unknown op ids are dropped silently.
        _ => {}
    }
}

fn handle_register(
    inner: &Arc<RegistryInner>,
    router: &Socket,
    payload: &[Msg],
    sender: &RoutingId,
) {
    if payload.len() < 3 {
        send_register_ack(router, sender, ack_status::MALFORMED, "", "invalid register");
        return;
    }
    let service = codec::read_string(&payload[1]);
    let endpoint = codec::read_string(&payload[2]);
    if service.is_empty() || endpoint.is_empty() {
        send_register_ack(router, sender, ack_status::INVALID, &endpoint, "invalid endpoint");
        return;
    }
    let mut weight = 1u32;
    if payload.len() >= 4 {
        if let Some(w) = codec::read_u32(&payload[3]) {
            weight = w;
        }
    }
    let weight = weight.max(1);

    let now = util::now_ms();
    {
        let mut st = inner.state.lock();
        let source = st.registry_id;
        let entry = st.services.entry(service.clone()).or_default();
        entry.providers.insert(
            endpoint.clone(),
            ProviderEntry {
                endpoint: endpoint.clone(),
                routing_id: *sender,
                weight,
                registered_at: now,
                last_heartbeat: now,
                source_registry: source,
            },
        );
        st.list_seq += 1;
    }
    log::debug!("[REGISTRY] registered {} at {}", service, endpoint);
    send_register_ack(router, sender, ack_status::OK, &endpoint, "");
}

fn handle_unregister(inner: &Arc<RegistryInner>, payload: &[Msg]) {
    if payload.len() < 3 {
        return;
    }
    let service = codec::read_string(&payload[1]);
    let endpoint = codec::read_string(&payload[2]);

    let mut st = inner.state.lock();
    let local_id = st.registry_id;
    let mut removed = false;
    let mut now_empty = false;
    if let Some(entry) = st.services.get_mut(&service) {
        let owned_here = entry
            .providers
            .get(&endpoint)
            .map(|p| p.source_registry == local_id)
            .unwrap_or(false);
        if owned_here {
            entry.providers.remove(&endpoint);
            removed = true;
            now_empty = entry.providers.is_empty();
        }
    }
    if !removed {
        return;
    }
    if now_empty {
        st.services.remove(&service);
    }
    st.list_seq += 1;
    log::debug!("[REGISTRY] unregistered {} at {}", service, endpoint);
}

fn handle_heartbeat(inner: &Arc<RegistryInner>, payload: &[Msg]) {
    if payload.len() < 3 {
        return;
    }
    let service = codec::read_string(&payload[1]);
    let endpoint = codec::read_string(&payload[2]);
    let mut st = inner.state.lock();
    if let Some(entry) = st.services.get_mut(&service) {
        if let Some(provider) = entry.providers.get_mut(&endpoint) {
            provider.last_heartbeat = util::now_ms();
        }
    }
}

fn handle_update_weight(
    inner: &Arc<RegistryInner>,
    router: &Socket,
    payload: &[Msg],
    sender: &RoutingId,
) {
    if payload.len() < 4 {
        send_register_ack(router, sender, ack_status::MALFORMED, "", "invalid update");
        return;
    }
    let service = codec::read_string(&payload[1]);
    let endpoint = codec::read_string(&payload[2]);
    let weight = codec::read_u32(&payload[3]).unwrap_or(1).max(1);

    let outcome = {
        let mut st = inner.state.lock();
        let local_id = st.registry_id;
        let result = match st.services.get_mut(&service) {
            None => Err("service not found"),
            Some(entry) => match entry.providers.get_mut(&endpoint) {
                None => Err("provider not found"),
                Some(p) if p.source_registry != local_id => Err("provider not local"),
                Some(p) => {
                    p.weight = weight;
                    Ok(())
                }
            },
        };
        if result.is_ok() {
            st.list_seq += 1;
        }
        result
    };
    match outcome {
        Ok(()) => send_register_ack(router, sender, ack_status::OK, &endpoint, ""),
        Err(reason) => {
            send_register_ack(router, sender, ack_status::REJECTED, &endpoint, reason)
        }
    }
}

fn send_register_ack(
    router: &Socket,
    sender: &RoutingId,
    status: u8,
    endpoint: &str,
    error: &str,
) {
    let frames = vec![
        Msg::from(sender.as_bytes()),
        Msg::from(msg_id::REGISTER_ACK.to_le_bytes().to_vec()),
        Msg::from(vec![status]),
        Msg::from(endpoint),
        Msg::from(error),
    ];
    if let Err(e) = router.send_parts(frames) {
        log::debug!("[REGISTRY] ack send failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(bytes: &[u8]) -> RoutingId {
        RoutingId::from_bytes(bytes).unwrap()
    }

    fn local_entry(endpoint: &str, hb: u64, source: u32) -> ProviderEntry {
        ProviderEntry {
            endpoint: endpoint.to_string(),
            routing_id: rid(b"R"),
            weight: 1,
            registered_at: hb,
            last_heartbeat: hb,
            source_registry: source,
        }
    }

    fn gossip(peer: u32, seq: u64, services: Vec<(&str, Vec<(&str, u32)>)>) -> ServiceListMsg {
        ServiceListMsg {
            msg_id: msg_id::REGISTRY_SYNC,
            registry_id: peer,
            list_seq: seq,
            services: services
                .into_iter()
                .map(|(name, providers)| {
                    (
                        name.to_string(),
                        providers
                            .into_iter()
                            .map(|(ep, w)| ProviderRow {
                                endpoint: ep.to_string(),
                                routing_id: rid(b"P"),
                                weight: w,
                            })
                            .collect(),
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_remove_expired_local_provider() {
        let mut st = RegistryState::new();
        st.registry_id = 10;
        st.heartbeat_timeout_ms = 100;
        st.services
            .entry("svc".into())
            .or_default()
            .providers
            .insert("ep".into(), local_entry("ep", 1_000, 10));

        let seq = st.list_seq;
        st.remove_expired(1_050);
        assert!(st.services.contains_key("svc"));
        assert_eq!(st.list_seq, seq);

        st.remove_expired(1_200);
        assert!(!st.services.contains_key("svc"));
        assert_eq!(st.list_seq, seq + 1);
    }

    #[test]
    fn test_remove_expired_ignores_peer_entries() {
        let mut st = RegistryState::new();
        st.registry_id = 10;
        st.heartbeat_timeout_ms = 100;
        st.peer_last_seen.insert(99, 1_000);
        st.services
            .entry("svc".into())
            .or_default()
            .providers
            .insert("ep".into(), local_entry("ep", 0, 99));

        // Way past the heartbeat timeout, but peer-sourced entries only
        // expire with their peer.
        st.remove_expired(1_000);
        assert!(st.services.contains_key("svc"));
    }

    #[test]
    fn test_remove_expired_silent_peer() {
        let mut st = RegistryState::new();
        st.registry_id = 10;
        st.broadcast_interval_ms = 100;
        st.peer_last_seen.insert(99, 1_000);
        st.peer_seq.insert(99, 5);
        st.services
            .entry("svc".into())
            .or_default()
            .providers
            .insert("ep".into(), local_entry("ep", u64::MAX, 99));

        st.remove_expired(1_200);
        assert!(st.services.contains_key("svc"));

        // 3 × broadcast interval elapsed.
        st.remove_expired(1_400);
        assert!(!st.services.contains_key("svc"));
        assert!(!st.peer_seq.contains_key(&99));
        assert!(!st.peer_last_seen.contains_key(&99));
    }

    #[test]
    fn test_gossip_ignores_self_and_stale() {
        let mut st = RegistryState::new();
        st.registry_id = 10;
        assert!(!st.apply_gossip(&gossip(10, 5, vec![("s", vec![("ep", 1)])]), 0));

        assert!(st.apply_gossip(&gossip(20, 5, vec![("s", vec![("ep", 1)])]), 0));
        // Same sequence again: stale.
        assert!(!st.apply_gossip(&gossip(20, 5, vec![("s", vec![("ep2", 1)])]), 0));
        // Lower: stale.
        assert!(!st.apply_gossip(&gossip(20, 4, vec![("s", vec![("ep2", 1)])]), 0));
    }

    #[test]
    fn test_gossip_rebuilds_peer_slice() {
        let mut st = RegistryState::new();
        st.registry_id = 10;
        assert!(st.apply_gossip(
            &gossip(20, 1, vec![("s", vec![("ep-a", 1), ("ep-b", 1)])]),
            0
        ));
        assert_eq!(st.services["s"].providers.len(), 2);

        // Next gossip no longer carries ep-b.
        assert!(st.apply_gossip(&gossip(20, 2, vec![("s", vec![("ep-a", 1)])]), 0));
        assert_eq!(st.services["s"].providers.len(), 1);
        assert!(st.services["s"].providers.contains_key("ep-a"));
    }

    #[test]
    fn test_gossip_identical_does_not_bump_seq() {
        let mut st = RegistryState::new();
        st.registry_id = 10;
        assert!(st.apply_gossip(&gossip(20, 1, vec![("s", vec![("ep", 2)])]), 0));
        let seq = st.list_seq;
        // Same content, higher peer seq: accepted as fresh but no change.
        assert!(!st.apply_gossip(&gossip(20, 2, vec![("s", vec![("ep", 2)])]), 0));
        assert_eq!(st.list_seq, seq);
        assert_eq!(st.peer_seq[&20], 2);
    }

    #[test]
    fn test_gossip_never_overwrites_other_sources() {
        let mut st = RegistryState::new();
        st.registry_id = 10;
        st.services
            .entry("s".into())
            .or_default()
            .providers
            .insert("ep".into(), local_entry("ep", 0, 10));

        assert!(st.apply_gossip(
            &gossip(20, 1, vec![("s", vec![("ep", 9), ("other", 1)])]),
            0
        ));
        let entry = &st.services["s"].providers["ep"];
        assert_eq!(entry.source_registry, 10);
        assert_eq!(entry.weight, 1);
        assert_eq!(st.services["s"].providers["other"].source_registry, 20);
    }

    #[test]
    fn test_service_list_skips_empty_services() {
        let mut st = RegistryState::new();
        st.registry_id = 3;
        st.services.entry("empty".into()).or_default();
        st.services
            .entry("svc".into())
            .or_default()
            .providers
            .insert("ep".into(), local_entry("ep", 0, 3));
        let list = st.service_list();
        assert_eq!(list.services.len(), 1);
        assert_eq!(list.services[0].0, "svc");
        assert_eq!(list.registry_id, 3);
    }

    #[test]
    fn test_config_validation() {
        let ctx = Context::new();
        let registry = Registry::new(&ctx);
        assert!(registry.set_endpoints("", "inproc://r").is_err());
        assert!(registry.set_heartbeat(0, 10).is_err());
        assert!(registry.set_heartbeat(10, 10).is_err());
        assert!(registry.set_heartbeat(10, 5).is_err());
        assert!(registry.set_broadcast_interval(0).is_err());
        // Start without endpoints refused.
        assert!(registry.start().is_err());
        registry.destroy();
    }

    #[test]
    fn test_destroy_makes_handle_stale() {
        let ctx = Context::new();
        let registry = Registry::new(&ctx);
        registry.destroy();
        assert!(matches!(
            registry.set_id(1),
            Err(Error::StaleHandle)
        ));
    }
}
