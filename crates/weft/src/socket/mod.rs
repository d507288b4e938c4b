// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ZeroMQ-style socket facade.
//!
//! A compact, self-contained rendition of the socket capability the fabric
//! components consume: typed sockets (`PAIR`, `PUB`, `SUB`, `XPUB`, `DEALER`,
//! `ROUTER`), multi-part messages, routing identities, subscriptions, and a
//! multi-socket `poll`. Two transports are provided: `inproc://` pipes inside
//! one [`Context`] and length-prefix framed `tcp://` streams (TLS-capable via
//! the `tls` feature).
//!
//! ## Model
//!
//! Every socket owns a peer table and an inbox of *complete* multi-part
//! messages. Transport threads (one per TCP connection) assemble frames and
//! deliver whole messages; `inproc` peers deliver directly. Receivers
//! therefore never observe a torn message, and the `MORE` bookkeeping of the
//! wire stays inside the facade.
//!
//! Multi-part sends are staged per socket and dispatched atomically when the
//! final frame (no `MORE`) is staged, which keeps one logical message's
//! frames contiguous on the wire.
//!
//! ## Routing identities
//!
//! Router peers are addressed by [`RoutingId`]. An id arrives with the TCP
//! handshake (or is taken from the peer socket's option for `inproc`), so
//! `PROBE_ROUTER` is satisfied without a probe frame. `CONNECT_ROUTING_ID`
//! stages the id under which the *next* `connect` is addressed locally,
//! making the peer routable the moment `connect` returns.

mod endpoint;
mod msg;
pub(crate) mod tcp;
#[cfg(feature = "tls")]
pub(crate) mod tls;

pub use msg::Msg;

use crate::routing_id::RoutingId;
use crate::{util, Error, Result};
use dashmap::DashMap;
use endpoint::Endpoint;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Default send/receive high-water mark (frames of complete messages).
pub const DEFAULT_HWM: usize = 100_000;

/// Socket personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// Exclusive 1:1 pipe.
    Pair,
    /// Fan-out to subscribed peers; never receives.
    Pub,
    /// Receives from publishers, filtered by subscription prefixes.
    Sub,
    /// Like `Pub`, but subscription upcalls are readable as messages.
    XPub,
    /// Round-robin send, fair-queued receive.
    Dealer,
    /// Identity-addressed send, identity-prefixed receive.
    Router,
}

impl SocketType {
    fn wire_code(self) -> u8 {
        match self {
            SocketType::Pair => 0,
            SocketType::Pub => 1,
            SocketType::Sub => 2,
            SocketType::XPub => 3,
            SocketType::Dealer => 4,
            SocketType::Router => 5,
        }
    }

    fn from_wire(code: u8) -> Option<SocketType> {
        match code {
            0 => Some(SocketType::Pair),
            1 => Some(SocketType::Pub),
            2 => Some(SocketType::Sub),
            3 => Some(SocketType::XPub),
            4 => Some(SocketType::Dealer),
            5 => Some(SocketType::Router),
            _ => None,
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Socket factory and `inproc` namespace.
///
/// Cheap to clone; all clones share the same in-process endpoint table.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
pub(crate) struct ContextInner {
    /// Bound inproc endpoints. Weak so a leaked binding cannot keep a closed
    /// socket alive.
    inproc: DashMap<String, Weak<SocketCore>>,
}

impl Context {
    /// New, empty context.
    pub fn new() -> Self {
        Context::default()
    }

    /// Create a socket of the given type.
    pub fn socket(&self, kind: SocketType) -> Socket {
        Socket {
            core: Arc::new(SocketCore {
                ctx: Arc::clone(&self.inner),
                kind,
                state: Mutex::new(State::new()),
                recv_cv: Condvar::new(),
                closed: AtomicBool::new(false),
                token_seq: AtomicU64::new(1),
            }),
        }
    }
}

// ============================================================================
// TLS material (stored regardless of feature; enforced at bind/connect)
// ============================================================================

/// PEM material and verification knobs staged on a socket.
#[derive(Default, Clone)]
pub(crate) struct TlsConfig {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
    pub hostname: String,
    pub trust_system: bool,
}

impl TlsConfig {
    pub(crate) fn server_configured(&self) -> bool {
        !self.cert_pem.is_empty() && !self.key_pem.is_empty()
    }

    pub(crate) fn client_configured(&self) -> bool {
        !self.ca_pem.is_empty() || self.trust_system
    }
}

// ============================================================================
// Socket internals
// ============================================================================

struct Options {
    routing_id: RoutingId,
    /// Staged id for the next `connect`; consumed on use.
    connect_rid: RoutingId,
    sndhwm: usize,
    rcvhwm: usize,
    sndtimeo: Option<Duration>,
    rcvtimeo: Option<Duration>,
    linger: Option<Duration>,
    router_mandatory: bool,
    router_handover: bool,
    probe_router: bool,
    xpub_verbose: bool,
    tls: TlsConfig,
}

impl Options {
    fn new() -> Self {
        Options {
            routing_id: RoutingId::empty(),
            connect_rid: RoutingId::empty(),
            sndhwm: DEFAULT_HWM,
            rcvhwm: DEFAULT_HWM,
            sndtimeo: None,
            rcvtimeo: None,
            linger: None,
            router_mandatory: false,
            router_handover: false,
            probe_router: false,
            xpub_verbose: false,
            tls: TlsConfig::default(),
        }
    }
}

/// Outbound traffic handed to a TCP connection thread.
pub(crate) enum WireOut {
    Message(Vec<Msg>),
    Command(Vec<u8>),
}

enum Link {
    Inproc {
        remote: Weak<SocketCore>,
        remote_token: u64,
    },
    Tcp {
        tx: crossbeam::channel::Sender<WireOut>,
        shutdown: Arc<AtomicBool>,
    },
}

struct Peer {
    rid: RoutingId,
    /// `Some` for peers created by `connect`; used by `disconnect`.
    endpoint: Option<String>,
    link: Link,
    /// Subscription prefixes this peer asked us for (PUB/XPUB side).
    subs: Vec<Vec<u8>>,
    /// A staged `CONNECT_ROUTING_ID` pins the local label; the handshake
    /// must not overwrite it.
    rid_pinned: bool,
}

struct Listener {
    endpoint: String,
    shutdown: Arc<AtomicBool>,
    inproc_name: Option<String>,
}

struct State {
    opts: Options,
    peers: HashMap<u64, Peer>,
    /// Insertion-ordered tokens for fair round-robin.
    peer_order: Vec<u64>,
    next_peer: usize,
    inbox: VecDeque<Vec<Msg>>,
    staged: Vec<Msg>,
    listeners: Vec<Listener>,
    last_endpoint: Option<String>,
    /// SUB-side subscription prefixes.
    subs: Vec<Vec<u8>>,
}

impl State {
    fn new() -> Self {
        State {
            opts: Options::new(),
            peers: HashMap::new(),
            peer_order: Vec::new(),
            next_peer: 0,
            inbox: VecDeque::new(),
            staged: Vec::new(),
            listeners: Vec::new(),
            last_endpoint: None,
            subs: Vec::new(),
        }
    }

    fn token_by_rid(&self, rid: &RoutingId) -> Option<u64> {
        if rid.is_empty() {
            return None;
        }
        self.peer_order
            .iter()
            .find(|t| self.peers.get(*t).map(|p| &p.rid == rid).unwrap_or(false))
            .copied()
    }

    fn remove_peer_entry(&mut self, token: u64) -> Option<Peer> {
        self.peer_order.retain(|t| *t != token);
        if self.next_peer >= self.peer_order.len() {
            self.next_peer = 0;
        }
        self.peers.remove(&token)
    }
}

pub(crate) struct SocketCore {
    ctx: Arc<ContextInner>,
    kind: SocketType,
    state: Mutex<State>,
    recv_cv: Condvar,
    closed: AtomicBool,
    token_seq: AtomicU64,
}

/// A socket handle. Clones share one underlying socket; `close` shuts all of
/// them down. Sockets are not closed implicitly — the owning component's
/// destroy path does it.
#[derive(Clone)]
pub struct Socket {
    core: Arc<SocketCore>,
}

// Deferred side effects collected under the lock and executed outside it,
// so a delivery never runs while the sender's lock is held.
enum Effect {
    DeliverInproc {
        remote: Weak<SocketCore>,
        token: u64,
        frames: Vec<Msg>,
    },
    CommandInproc {
        remote: Weak<SocketCore>,
        token: u64,
        bytes: Vec<u8>,
    },
    SendTcp {
        tx: crossbeam::channel::Sender<WireOut>,
        out: WireOut,
    },
    DropRemoteInproc {
        remote: Weak<SocketCore>,
        token: u64,
    },
}

fn run_effects(effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::DeliverInproc {
                remote,
                token,
                frames,
            } => {
                if let Some(remote) = remote.upgrade() {
                    remote.deliver(token, frames);
                }
            }
            Effect::CommandInproc {
                remote,
                token,
                bytes,
            } => {
                if let Some(remote) = remote.upgrade() {
                    remote.handle_command(token, &bytes);
                }
            }
            Effect::SendTcp { tx, out } => {
                let _ = tx.send(out);
            }
            Effect::DropRemoteInproc { remote, token } => {
                if let Some(remote) = remote.upgrade() {
                    remote.remove_peer(token);
                }
            }
        }
    }
}

impl Socket {
    pub(crate) fn core(&self) -> &Arc<SocketCore> {
        &self.core
    }

    /// Socket personality.
    pub fn kind(&self) -> SocketType {
        self.core.kind
    }

    // ------------------------------------------------------------------
    // Options
    // ------------------------------------------------------------------

    /// Set the socket's own routing id (≤ 255 bytes, non-empty).
    pub fn set_routing_id(&self, rid: &RoutingId) -> Result<()> {
        if rid.is_empty() {
            return Err(Error::InvalidArgument("empty routing id"));
        }
        self.core.state.lock().opts.routing_id = *rid;
        Ok(())
    }

    /// Current routing id (empty when unset).
    pub fn routing_id(&self) -> RoutingId {
        self.core.state.lock().opts.routing_id
    }

    /// Stage the routing id under which the next `connect` is addressed.
    pub fn set_connect_routing_id(&self, rid: &RoutingId) -> Result<()> {
        if rid.is_empty() {
            return Err(Error::InvalidArgument("empty routing id"));
        }
        self.core.state.lock().opts.connect_rid = *rid;
        Ok(())
    }

    /// Fail sends to unknown routing ids instead of dropping them.
    pub fn set_router_mandatory(&self, on: bool) {
        self.core.state.lock().opts.router_mandatory = on;
    }

    /// Let a reconnecting peer take over an existing routing id.
    pub fn set_router_handover(&self, on: bool) {
        self.core.state.lock().opts.router_handover = on;
    }

    /// Announce identity eagerly on connect. The transport handshake already
    /// does this; the option is accepted for contract parity.
    pub fn set_probe_router(&self, on: bool) {
        self.core.state.lock().opts.probe_router = on;
    }

    /// Deliver every subscription upcall, not only state changes.
    pub fn set_xpub_verbose(&self, on: bool) {
        self.core.state.lock().opts.xpub_verbose = on;
    }

    /// Send timeout (`None` blocks indefinitely).
    pub fn set_sndtimeo(&self, timeout: Option<Duration>) {
        self.core.state.lock().opts.sndtimeo = timeout;
    }

    /// Receive timeout used by [`Socket::recv`] (`None` blocks indefinitely).
    pub fn set_rcvtimeo(&self, timeout: Option<Duration>) {
        self.core.state.lock().opts.rcvtimeo = timeout;
    }

    /// Linger on close. Accepted for contract parity; queued messages are
    /// dropped on close.
    pub fn set_linger(&self, linger: Option<Duration>) {
        self.core.state.lock().opts.linger = linger;
    }

    /// Outbound high-water mark.
    pub fn set_sndhwm(&self, hwm: usize) {
        self.core.state.lock().opts.sndhwm = hwm.max(1);
    }

    /// Inbound high-water mark (messages beyond it are dropped).
    pub fn set_rcvhwm(&self, hwm: usize) {
        self.core.state.lock().opts.rcvhwm = hwm.max(1);
    }

    /// Server-side TLS material (PEM). Empty strings clear.
    pub fn set_tls_server(&self, cert_pem: &str, key_pem: &str) {
        let mut st = self.core.state.lock();
        st.opts.tls.cert_pem = cert_pem.to_string();
        st.opts.tls.key_pem = key_pem.to_string();
    }

    /// Client-side TLS material (PEM CA bundle), expected server name, and
    /// whether the system trust store is consulted. Empty `ca_pem` clears.
    pub fn set_tls_client(&self, ca_pem: &str, hostname: &str, trust_system: bool) {
        let mut st = self.core.state.lock();
        st.opts.tls.ca_pem = ca_pem.to_string();
        st.opts.tls.hostname = hostname.to_string();
        st.opts.tls.trust_system = trust_system;
    }

    /// Endpoint of the most recent successful bind, with wildcards resolved.
    pub fn last_endpoint(&self) -> Option<String> {
        self.core.state.lock().last_endpoint.clone()
    }

    // ------------------------------------------------------------------
    // Subscriptions (SUB)
    // ------------------------------------------------------------------

    /// Add a subscription prefix (empty prefix matches everything).
    pub fn subscribe(&self, prefix: &[u8]) -> Result<()> {
        if self.core.kind != SocketType::Sub {
            return Err(Error::Unsupported);
        }
        let mut effects = Vec::new();
        {
            let mut st = self.core.state.lock();
            if !st.subs.iter().any(|s| s == prefix) {
                st.subs.push(prefix.to_vec());
            }
            let mut bytes = Vec::with_capacity(prefix.len() + 1);
            bytes.push(1u8);
            bytes.extend_from_slice(prefix);
            for token in st.peer_order.clone() {
                if let Some(peer) = st.peers.get(&token) {
                    effects.push(command_effect(peer, bytes.clone()));
                }
            }
        }
        run_effects(effects.into_iter().flatten().collect());
        Ok(())
    }

    /// Remove a subscription prefix.
    pub fn unsubscribe(&self, prefix: &[u8]) -> Result<()> {
        if self.core.kind != SocketType::Sub {
            return Err(Error::Unsupported);
        }
        let mut effects = Vec::new();
        {
            let mut st = self.core.state.lock();
            st.subs.retain(|s| s != prefix);
            let mut bytes = Vec::with_capacity(prefix.len() + 1);
            bytes.push(0u8);
            bytes.extend_from_slice(prefix);
            for token in st.peer_order.clone() {
                if let Some(peer) = st.peers.get(&token) {
                    effects.push(command_effect(peer, bytes.clone()));
                }
            }
        }
        run_effects(effects.into_iter().flatten().collect());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bind / connect / disconnect / close
    // ------------------------------------------------------------------

    /// Bind the socket to an endpoint. Multiple binds are allowed.
    pub fn bind(&self, endpoint: &str) -> Result<()> {
        self.core.check_open()?;
        match Endpoint::parse(endpoint)? {
            Endpoint::Inproc(name) => {
                let live = self
                    .core
                    .ctx
                    .inproc
                    .get(&name)
                    .and_then(|w| w.upgrade())
                    .map(|c| !c.is_closed())
                    .unwrap_or(false);
                if live {
                    return Err(Error::InvalidArgument("inproc endpoint already bound"));
                }
                self.core
                    .ctx
                    .inproc
                    .insert(name.clone(), Arc::downgrade(&self.core));
                let mut st = self.core.state.lock();
                st.listeners.push(Listener {
                    endpoint: endpoint.to_string(),
                    shutdown: Arc::new(AtomicBool::new(false)),
                    inproc_name: Some(name),
                });
                st.last_endpoint = Some(endpoint.to_string());
                Ok(())
            }
            Endpoint::Tcp { host, port } => {
                let tls_server = {
                    let st = self.core.state.lock();
                    st.opts.tls.server_configured()
                };
                #[cfg(not(feature = "tls"))]
                if tls_server {
                    return Err(Error::Unsupported);
                }
                let _ = tls_server;
                let shutdown = Arc::new(AtomicBool::new(false));
                let bound =
                    tcp::start_listener(Arc::downgrade(&self.core), &host, &port, &shutdown)?;
                let resolved_host = if host == "*" { "0.0.0.0".to_string() } else { host };
                let resolved = format!("tcp://{}:{}", resolved_host, bound.port());
                let mut st = self.core.state.lock();
                st.listeners.push(Listener {
                    endpoint: resolved.clone(),
                    shutdown,
                    inproc_name: None,
                });
                st.last_endpoint = Some(resolved);
                Ok(())
            }
        }
    }

    /// Connect to an endpoint. TCP connects are asynchronous with retry;
    /// sends are queued until the link is up. Inproc requires the name to be
    /// bound already.
    pub fn connect(&self, endpoint: &str) -> Result<()> {
        self.core.check_open()?;
        match Endpoint::parse(endpoint)? {
            Endpoint::Inproc(name) => self.core.connect_inproc(&name, endpoint),
            Endpoint::Tcp { host, port } => {
                if port == "*" {
                    return Err(Error::InvalidArgument("cannot connect to wildcard port"));
                }
                let tls_client = {
                    let st = self.core.state.lock();
                    st.opts.tls.client_configured()
                };
                #[cfg(not(feature = "tls"))]
                if tls_client {
                    return Err(Error::Unsupported);
                }
                let _ = tls_client;
                self.core.connect_tcp(&host, &port, endpoint)
            }
        }
    }

    /// Drop the connection(s) this socket made to `endpoint`.
    pub fn disconnect(&self, endpoint: &str) -> Result<()> {
        self.core.check_open()?;
        let mut effects = Vec::new();
        let mut found = false;
        {
            let mut st = self.core.state.lock();
            let tokens: Vec<u64> = st
                .peer_order
                .iter()
                .filter(|t| {
                    st.peers
                        .get(*t)
                        .map(|p| p.endpoint.as_deref() == Some(endpoint))
                        .unwrap_or(false)
                })
                .copied()
                .collect();
            for token in tokens {
                found = true;
                if let Some(peer) = st.remove_peer_entry(token) {
                    effects.extend(drop_link_effect(peer));
                }
            }
        }
        run_effects(effects);
        if found {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    /// Shut the socket down: unbind, disconnect every peer, wake blocked
    /// receivers. Idempotent.
    pub fn close(&self) {
        self.core.close();
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Stage one frame; dispatch the staged message when `more` is false.
    ///
    /// The staged frames of one logical message are dispatched atomically;
    /// interleaving is prevented by the owning component's send section.
    pub fn send(&self, msg: Msg, more: bool) -> Result<()> {
        self.core.check_open()?;
        let parts = {
            let mut st = self.core.state.lock();
            st.staged.push(msg);
            if more {
                return Ok(());
            }
            std::mem::take(&mut st.staged)
        };
        self.send_parts(parts)
    }

    /// Send a complete multi-part message.
    ///
    /// Frames move into the socket; on failure they are dropped. For
    /// `ROUTER` sockets the first frame is the destination routing id.
    pub fn send_parts(&self, parts: Vec<Msg>) -> Result<()> {
        self.core.check_open()?;
        if parts.is_empty() {
            return Err(Error::InvalidArgument("empty message"));
        }
        self.core.dispatch(parts)
    }

    /// Receive one complete message, blocking up to the configured
    /// `rcvtimeo` (forever by default). `ROUTER` messages carry the peer's
    /// routing id as their first frame.
    pub fn recv(&self) -> Result<Vec<Msg>> {
        let timeout = self.core.state.lock().opts.rcvtimeo;
        self.core.recv_inner(timeout)
    }

    /// Receive without blocking; `WouldBlock` when the inbox is empty.
    pub fn try_recv(&self) -> Result<Vec<Msg>> {
        self.core.recv_inner(Some(Duration::ZERO))
    }

    /// Receive with an explicit bound; `TimedOut` on expiry.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Vec<Msg>> {
        self.core.recv_inner(Some(timeout))
    }

    /// True when a complete message is waiting.
    pub fn readable(&self) -> bool {
        !self.core.state.lock().inbox.is_empty()
    }

    /// Number of connected/known peers (diagnostics).
    pub fn peer_count(&self) -> usize {
        self.core.state.lock().peers.len()
    }
}

/// Build the effect that carries a command to one peer, if its link allows.
fn command_effect(peer: &Peer, bytes: Vec<u8>) -> Option<Effect> {
    match &peer.link {
        Link::Inproc {
            remote,
            remote_token,
        } => Some(Effect::CommandInproc {
            remote: remote.clone(),
            token: *remote_token,
            bytes,
        }),
        Link::Tcp { tx, .. } => Some(Effect::SendTcp {
            tx: tx.clone(),
            out: WireOut::Command(bytes),
        }),
    }
}

/// Effects that tear down a peer's link.
fn drop_link_effect(peer: Peer) -> Vec<Effect> {
    match peer.link {
        Link::Inproc {
            remote,
            remote_token,
        } => vec![Effect::DropRemoteInproc {
            remote,
            token: remote_token,
        }],
        Link::Tcp { shutdown, .. } => {
            shutdown.store(true, Ordering::Release);
            Vec::new()
        }
    }
}

impl SocketCore {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Terminated)
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn kind(&self) -> SocketType {
        self.kind
    }

    fn next_token(&self) -> u64 {
        self.token_seq.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Inproc linking
    // ------------------------------------------------------------------

    fn connect_inproc(self: &Arc<Self>, name: &str, endpoint: &str) -> Result<()> {
        let remote = self
            .ctx
            .inproc
            .get(name)
            .and_then(|w| w.upgrade())
            .ok_or(Error::ConnectionRefused)?;
        if remote.is_closed() {
            return Err(Error::ConnectionRefused);
        }

        let (own_rid, staged_rid, own_subs) = {
            let mut st = self.state.lock();
            let staged = st.opts.connect_rid;
            st.opts.connect_rid = RoutingId::empty();
            (st.opts.routing_id, staged, st.subs.clone())
        };
        let remote_rid_opt = remote.state.lock().opts.routing_id;

        let local_token = self.next_token();
        // Register our mirror on the remote first so the link is never
        // half-addressable from their side.
        let remote_token = remote.register_inproc_peer(
            own_rid,
            Arc::downgrade(self),
            local_token,
        );

        // Label the peer: staged connect id wins, then the remote's own id,
        // then an anonymous one.
        let (rid, pinned) = if !staged_rid.is_empty() {
            (staged_rid, true)
        } else if !remote_rid_opt.is_empty() {
            (remote_rid_opt, false)
        } else {
            (RoutingId::random(), false)
        };

        {
            let mut st = self.state.lock();
            st.peers.insert(
                local_token,
                Peer {
                    rid,
                    endpoint: Some(endpoint.to_string()),
                    link: Link::Inproc {
                        remote: Arc::downgrade(&remote),
                        remote_token,
                    },
                    subs: Vec::new(),
                    rid_pinned: pinned,
                },
            );
            st.peer_order.push(local_token);
        }

        // Replay our subscriptions over the new link.
        if self.kind == SocketType::Sub {
            for prefix in own_subs {
                let mut bytes = Vec::with_capacity(prefix.len() + 1);
                bytes.push(1u8);
                bytes.extend_from_slice(&prefix);
                remote.handle_command(remote_token, &bytes);
            }
        }
        Ok(())
    }

    /// Accept an inproc peer (called on the bound socket).
    fn register_inproc_peer(
        self: &Arc<Self>,
        remote_rid: RoutingId,
        remote: Weak<SocketCore>,
        remote_token: u64,
    ) -> u64 {
        let token = self.next_token();
        let rid = self.admit_rid(remote_rid);
        let mut st = self.state.lock();
        st.peers.insert(
            token,
            Peer {
                rid,
                endpoint: None,
                link: Link::Inproc {
                    remote,
                    remote_token,
                },
                subs: Vec::new(),
                rid_pinned: false,
            },
        );
        st.peer_order.push(token);
        token
    }

    /// Resolve routing-id collisions per `ROUTER_HANDOVER`: take over the id
    /// (dropping the old peer) when set, otherwise fall back to an anonymous
    /// id for the newcomer.
    fn admit_rid(self: &Arc<Self>, rid: RoutingId) -> RoutingId {
        if rid.is_empty() {
            return RoutingId::random();
        }
        let mut effects = Vec::new();
        let admitted = {
            let mut st = self.state.lock();
            match st.token_by_rid(&rid) {
                None => rid,
                Some(existing) => {
                    if st.opts.router_handover {
                        if let Some(old) = st.remove_peer_entry(existing) {
                            log::debug!(
                                "[SOCKET] routing id handover, dropping stale peer 0x{}",
                                util::hex(rid.as_bytes())
                            );
                            effects.extend(drop_link_effect(old));
                        }
                        rid
                    } else {
                        log::debug!(
                            "[SOCKET] duplicate routing id 0x{}, admitting anonymously",
                            util::hex(rid.as_bytes())
                        );
                        RoutingId::random()
                    }
                }
            }
        };
        run_effects(effects);
        admitted
    }

    // ------------------------------------------------------------------
    // TCP linking (entry points used by socket::tcp)
    // ------------------------------------------------------------------

    fn connect_tcp(self: &Arc<Self>, host: &str, port: &str, endpoint: &str) -> Result<()> {
        let staged_rid = {
            let mut st = self.state.lock();
            let staged = st.opts.connect_rid;
            st.opts.connect_rid = RoutingId::empty();
            staged
        };
        let (rid, pinned) = if !staged_rid.is_empty() {
            (staged_rid, true)
        } else {
            (RoutingId::random(), false)
        };

        let token = self.next_token();
        let (tx, rx) = crossbeam::channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        {
            let mut st = self.state.lock();
            st.peers.insert(
                token,
                Peer {
                    rid,
                    endpoint: Some(endpoint.to_string()),
                    link: Link::Tcp {
                        tx,
                        shutdown: Arc::clone(&shutdown),
                    },
                    subs: Vec::new(),
                    rid_pinned: pinned,
                },
            );
            st.peer_order.push(token);
        }
        tcp::start_connecter(
            Arc::downgrade(self),
            token,
            host.to_string(),
            port.to_string(),
            rx,
            shutdown,
        );
        Ok(())
    }

    /// Register a peer accepted on a TCP listener. `None` when the socket is
    /// closing and the connection should be dropped.
    pub(crate) fn register_tcp_inbound(
        self: &Arc<Self>,
        remote_rid: RoutingId,
        tx: crossbeam::channel::Sender<WireOut>,
        shutdown: Arc<AtomicBool>,
    ) -> Option<u64> {
        if self.is_closed() {
            return None;
        }
        let rid = self.admit_rid(remote_rid);
        let token = self.next_token();
        let mut st = self.state.lock();
        st.peers.insert(
            token,
            Peer {
                rid,
                endpoint: None,
                link: Link::Tcp { tx, shutdown },
                subs: Vec::new(),
                rid_pinned: false,
            },
        );
        st.peer_order.push(token);
        Some(token)
    }

    /// Adopt the routing id announced by the remote end of an outbound
    /// connection, unless a staged connect id pinned the label.
    pub(crate) fn confirm_tcp_peer(&self, token: u64, remote_rid: RoutingId) {
        if remote_rid.is_empty() {
            return;
        }
        let mut st = self.state.lock();
        if let Some(peer) = st.peers.get_mut(&token) {
            if !peer.rid_pinned {
                peer.rid = remote_rid;
            }
        }
    }

    /// Subscriptions to replay after a (re)connect.
    pub(crate) fn sub_snapshot(&self) -> Vec<Vec<u8>> {
        if self.kind != SocketType::Sub {
            return Vec::new();
        }
        self.state.lock().subs.clone()
    }

    pub(crate) fn peer_alive(&self, token: u64) -> bool {
        !self.is_closed() && self.state.lock().peers.contains_key(&token)
    }

    /// Handshake announcement parameters (own type and routing id).
    pub(crate) fn announce(&self) -> (SocketType, RoutingId) {
        (self.kind, self.state.lock().opts.routing_id)
    }

    pub(crate) fn tls_snapshot(&self) -> TlsConfig {
        self.state.lock().opts.tls.clone()
    }

    // ------------------------------------------------------------------
    // Delivery (called from transport threads and inproc peers)
    // ------------------------------------------------------------------

    /// Deliver a complete inbound message attributed to `token`.
    pub(crate) fn deliver(&self, token: u64, frames: Vec<Msg>) {
        if self.is_closed() || frames.is_empty() {
            return;
        }
        let mut st = self.state.lock();
        match self.kind {
            SocketType::Pub => return, // publishers do not receive
            SocketType::Sub => {
                let topic = &frames[0];
                if !st.subs.iter().any(|p| topic.starts_with(p.as_slice())) {
                    return;
                }
            }
            SocketType::Router => {
                let rid = match st.peers.get(&token) {
                    Some(peer) => peer.rid,
                    None => return,
                };
                if st.inbox.len() >= st.opts.rcvhwm {
                    log::debug!("[SOCKET] inbox full, dropping router message");
                    return;
                }
                let mut full = Vec::with_capacity(frames.len() + 1);
                full.push(Msg::from(rid.as_bytes()));
                full.extend(frames);
                st.inbox.push_back(full);
                drop(st);
                self.recv_cv.notify_all();
                return;
            }
            _ => {}
        }
        if st.inbox.len() >= st.opts.rcvhwm {
            log::debug!("[SOCKET] inbox full, dropping message");
            return;
        }
        st.inbox.push_back(frames);
        drop(st);
        self.recv_cv.notify_all();
    }

    /// Apply a subscription command from `token` (PUB/XPUB side).
    pub(crate) fn handle_command(&self, token: u64, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if !matches!(self.kind, SocketType::Pub | SocketType::XPub) {
            return;
        }
        let subscribe = bytes[0] == 1;
        let prefix = &bytes[1..];
        let mut st = self.state.lock();
        let changed = match st.peers.get_mut(&token) {
            Some(peer) => {
                if subscribe {
                    if peer.subs.iter().any(|s| s == prefix) {
                        false
                    } else {
                        peer.subs.push(prefix.to_vec());
                        true
                    }
                } else {
                    let before = peer.subs.len();
                    peer.subs.retain(|s| s != prefix);
                    before != peer.subs.len()
                }
            }
            None => return,
        };
        if self.kind == SocketType::XPub && (st.opts.xpub_verbose || changed) {
            if st.inbox.len() < st.opts.rcvhwm {
                st.inbox.push_back(vec![Msg::from(bytes)]);
            }
            drop(st);
            self.recv_cv.notify_all();
        }
    }

    /// Drop a peer (link loss, remote disconnect, remote close).
    pub(crate) fn remove_peer(&self, token: u64) {
        let mut st = self.state.lock();
        if let Some(peer) = st.remove_peer_entry(token) {
            // The initiating side already tore the link down; just make sure
            // a TCP thread parked on this peer wakes up.
            if let Link::Tcp { shutdown, .. } = &peer.link {
                shutdown.store(true, Ordering::Release);
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch (send side)
    // ------------------------------------------------------------------

    fn dispatch(&self, parts: Vec<Msg>) -> Result<()> {
        let mut effects: Vec<Effect> = Vec::new();
        let result = {
            let mut st = self.state.lock();
            match self.kind {
                SocketType::Pub | SocketType::XPub => {
                    let topic = &parts[0];
                    for token in st.peer_order.clone() {
                        if let Some(peer) = st.peers.get(&token) {
                            if peer.subs.iter().any(|p| topic.starts_with(p.as_slice())) {
                                effects.extend(message_effect(peer, parts.clone()));
                            }
                        }
                    }
                    Ok(())
                }
                SocketType::Sub => Err(Error::Unsupported),
                SocketType::Pair => match st.peer_order.first().copied() {
                    Some(token) => {
                        let peer = st.peers.get(&token).ok_or(Error::WouldBlock)?;
                        effects.extend(message_effect(peer, parts));
                        Ok(())
                    }
                    None => Err(Error::WouldBlock),
                },
                SocketType::Dealer => {
                    if st.peer_order.is_empty() {
                        return Err(Error::WouldBlock);
                    }
                    let index = st.next_peer % st.peer_order.len();
                    st.next_peer = st.next_peer.wrapping_add(1);
                    let token = st.peer_order[index];
                    let peer = st.peers.get(&token).ok_or(Error::WouldBlock)?;
                    effects.extend(message_effect(peer, parts));
                    Ok(())
                }
                SocketType::Router => {
                    let dest = RoutingId::from(parts[0].data());
                    let payload: Vec<Msg> = parts.into_iter().skip(1).collect();
                    if payload.is_empty() {
                        return Err(Error::InvalidArgument("router message has no payload"));
                    }
                    match st.token_by_rid(&dest) {
                        Some(token) => {
                            let peer = st.peers.get(&token).ok_or(Error::HostUnreachable)?;
                            effects.extend(message_effect(peer, payload));
                            Ok(())
                        }
                        None => {
                            if st.opts.router_mandatory {
                                Err(Error::HostUnreachable)
                            } else {
                                log::debug!(
                                    "[SOCKET] dropping message to unknown peer 0x{}",
                                    util::hex(dest.as_bytes())
                                );
                                Ok(())
                            }
                        }
                    }
                }
            }
        };
        run_effects(effects);
        result
    }

    // ------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------

    fn recv_inner(&self, timeout: Option<Duration>) -> Result<Vec<Msg>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.state.lock();
        loop {
            if let Some(message) = st.inbox.pop_front() {
                return Ok(message);
            }
            if self.is_closed() {
                return Err(Error::Terminated);
            }
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(if timeout == Some(Duration::ZERO) {
                            Error::WouldBlock
                        } else {
                            Error::TimedOut
                        });
                    }
                    self.recv_cv.wait_for(&mut st, d - now);
                }
                None => {
                    self.recv_cv.wait(&mut st);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut effects = Vec::new();
        {
            let mut st = self.state.lock();
            for listener in st.listeners.drain(..) {
                listener.shutdown.store(true, Ordering::Release);
                if let Some(name) = listener.inproc_name {
                    self.ctx.inproc.remove(&name);
                }
            }
            let tokens: Vec<u64> = st.peer_order.clone();
            for token in tokens {
                if let Some(peer) = st.remove_peer_entry(token) {
                    effects.extend(drop_link_effect(peer));
                }
            }
            st.inbox.clear();
            st.staged.clear();
        }
        run_effects(effects);
        self.recv_cv.notify_all();
    }
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        // Transport threads hold only weak references, so reaching Drop means
        // every handle is gone; flag closure so those threads exit promptly.
        self.closed.store(true, Ordering::Release);
    }
}

fn message_effect(peer: &Peer, frames: Vec<Msg>) -> Option<Effect> {
    match &peer.link {
        Link::Inproc {
            remote,
            remote_token,
        } => Some(Effect::DeliverInproc {
            remote: remote.clone(),
            token: *remote_token,
            frames,
        }),
        Link::Tcp { tx, .. } => Some(Effect::SendTcp {
            tx: tx.clone(),
            out: WireOut::Message(frames),
        }),
    }
}

// ============================================================================
// poll
// ============================================================================

/// Event bits for [`poll`].
pub mod events {
    /// Readable: a complete message is waiting.
    pub const POLLIN: u8 = 0x01;
    /// Writable. Sends are queue-backed, so writability tracks socket
    /// liveness.
    pub const POLLOUT: u8 = 0x02;
    /// Error condition (socket closed).
    pub const POLLERR: u8 = 0x04;
    /// Priority input. Reserved; never reported by this facade.
    pub const POLLPRI: u8 = 0x08;
}

/// One entry of a [`poll`] call.
pub struct PollItem<'a> {
    /// Socket to watch.
    pub socket: &'a Socket,
    /// Requested event bits.
    pub events: u8,
    /// Ready event bits, filled by [`poll`].
    pub revents: u8,
}

impl<'a> PollItem<'a> {
    /// Watch `socket` for the given events.
    pub fn new(socket: &'a Socket, events: u8) -> Self {
        PollItem {
            socket,
            events,
            revents: 0,
        }
    }

    /// True when the last poll saw input readiness.
    pub fn readable(&self) -> bool {
        self.revents & events::POLLIN != 0
    }
}

/// Wait for readiness on any of `items`.
///
/// `timeout_ms < 0` blocks until something is ready, `0` checks once, `> 0`
/// bounds the wait. Returns the number of items with non-zero `revents`.
pub fn poll(items: &mut [PollItem<'_>], timeout_ms: i64) -> Result<usize> {
    let deadline = if timeout_ms > 0 {
        Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
    } else {
        None
    };
    loop {
        let mut ready = 0usize;
        for item in items.iter_mut() {
            item.revents = 0;
            let core = item.socket.core();
            if core.is_closed() {
                item.revents |= events::POLLERR;
            } else {
                if item.events & events::POLLIN != 0 && item.socket.readable() {
                    item.revents |= events::POLLIN;
                }
                if item.events & events::POLLOUT != 0 {
                    item.revents |= events::POLLOUT;
                }
            }
            if item.revents != 0 {
                ready += 1;
            }
        }
        if ready > 0 || timeout_ms == 0 {
            return Ok(ready);
        }
        if let Some(d) = deadline {
            if Instant::now() >= d {
                return Ok(0);
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(bytes: &[u8]) -> RoutingId {
        RoutingId::from_bytes(bytes).unwrap()
    }

    #[test]
    fn test_pair_inproc_roundtrip() {
        let ctx = Context::new();
        let a = ctx.socket(SocketType::Pair);
        let b = ctx.socket(SocketType::Pair);
        a.bind("inproc://pair-rt").unwrap();
        b.connect("inproc://pair-rt").unwrap();

        b.send_parts(vec![Msg::from("hello"), Msg::from("world")])
            .unwrap();
        let got = a.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data(), b"hello");
        assert_eq!(got[1].data(), b"world");
        a.close();
        b.close();
    }

    #[test]
    fn test_pub_sub_filtering() {
        let ctx = Context::new();
        let publisher = ctx.socket(SocketType::Pub);
        let subscriber = ctx.socket(SocketType::Sub);
        publisher.bind("inproc://pubsub-filter").unwrap();
        subscriber.subscribe(b"log.").unwrap();
        subscriber.connect("inproc://pubsub-filter").unwrap();

        publisher
            .send_parts(vec![Msg::from("log.info"), Msg::from("m1")])
            .unwrap();
        publisher
            .send_parts(vec![Msg::from("metric.cpu"), Msg::from("m2")])
            .unwrap();

        let got = subscriber.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got[0].data(), b"log.info");
        assert!(matches!(subscriber.try_recv(), Err(Error::WouldBlock)));
        publisher.close();
        subscriber.close();
    }

    #[test]
    fn test_sub_without_subscription_receives_nothing() {
        let ctx = Context::new();
        let publisher = ctx.socket(SocketType::Pub);
        let subscriber = ctx.socket(SocketType::Sub);
        publisher.bind("inproc://pubsub-nosub").unwrap();
        subscriber.connect("inproc://pubsub-nosub").unwrap();

        publisher.send_parts(vec![Msg::from("x")]).unwrap();
        assert!(matches!(subscriber.try_recv(), Err(Error::WouldBlock)));
        publisher.close();
        subscriber.close();
    }

    #[test]
    fn test_xpub_subscription_upcall() {
        let ctx = Context::new();
        let xpub = ctx.socket(SocketType::XPub);
        xpub.set_xpub_verbose(true);
        let sub = ctx.socket(SocketType::Sub);
        xpub.bind("inproc://xpub-upcall").unwrap();
        sub.subscribe(b"").unwrap();
        sub.connect("inproc://xpub-upcall").unwrap();

        let upcall = xpub.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(upcall.len(), 1);
        assert_eq!(upcall[0].data()[0], 1);
        xpub.close();
        sub.close();
    }

    #[test]
    fn test_router_dealer_identity() {
        let ctx = Context::new();
        let router = ctx.socket(SocketType::Router);
        let dealer = ctx.socket(SocketType::Dealer);
        dealer.set_routing_id(&rid(b"D1")).unwrap();
        router.bind("inproc://rd-ident").unwrap();
        dealer.connect("inproc://rd-ident").unwrap();

        dealer.send_parts(vec![Msg::from("ping")]).unwrap();
        let got = router.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got[0].data(), b"D1");
        assert_eq!(got[1].data(), b"ping");

        router
            .send_parts(vec![Msg::from(&b"D1"[..]), Msg::from("pong")])
            .unwrap();
        let reply = dealer.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].data(), b"pong");
        router.close();
        dealer.close();
    }

    #[test]
    fn test_router_mandatory_unknown_rid() {
        let ctx = Context::new();
        let router = ctx.socket(SocketType::Router);
        router.set_router_mandatory(true);
        router.bind("inproc://router-mand").unwrap();
        let err = router
            .send_parts(vec![Msg::from(&b"nobody"[..]), Msg::from("x")])
            .unwrap_err();
        assert!(matches!(err, Error::HostUnreachable));
        router.close();
    }

    #[test]
    fn test_router_connect_routing_id() {
        let ctx = Context::new();
        let server = ctx.socket(SocketType::Router);
        server.set_routing_id(&rid(b"SRV")).unwrap();
        server.bind("inproc://router-crid").unwrap();

        let client = ctx.socket(SocketType::Router);
        client.set_router_mandatory(true);
        client.set_connect_routing_id(&rid(b"SRV")).unwrap();
        client.connect("inproc://router-crid").unwrap();

        client
            .send_parts(vec![Msg::from(&b"SRV"[..]), Msg::from("direct")])
            .unwrap();
        let got = server.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].data(), b"direct");
        server.close();
        client.close();
    }

    #[test]
    fn test_staged_multipart_send() {
        let ctx = Context::new();
        let a = ctx.socket(SocketType::Pair);
        let b = ctx.socket(SocketType::Pair);
        a.bind("inproc://staged-mp").unwrap();
        b.connect("inproc://staged-mp").unwrap();

        b.send(Msg::from("one"), true).unwrap();
        // Nothing dispatched until the final frame.
        assert!(matches!(a.try_recv(), Err(Error::WouldBlock)));
        b.send(Msg::from("two"), false).unwrap();
        let got = a.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got.len(), 2);
        a.close();
        b.close();
    }

    #[test]
    fn test_inproc_connect_unbound_refused() {
        let ctx = Context::new();
        let s = ctx.socket(SocketType::Pair);
        assert!(matches!(
            s.connect("inproc://nobody-home"),
            Err(Error::ConnectionRefused)
        ));
        s.close();
    }

    #[test]
    fn test_disconnect_stops_delivery() {
        let ctx = Context::new();
        let publisher = ctx.socket(SocketType::Pub);
        let subscriber = ctx.socket(SocketType::Sub);
        publisher.bind("inproc://disc-pub").unwrap();
        subscriber.subscribe(b"").unwrap();
        subscriber.connect("inproc://disc-pub").unwrap();

        publisher.send_parts(vec![Msg::from("a")]).unwrap();
        subscriber.recv_timeout(Duration::from_secs(1)).unwrap();

        subscriber.disconnect("inproc://disc-pub").unwrap();
        publisher.send_parts(vec![Msg::from("b")]).unwrap();
        assert!(matches!(subscriber.try_recv(), Err(Error::WouldBlock)));
        publisher.close();
        subscriber.close();
    }

    #[test]
    fn test_poll_reports_readiness() {
        let ctx = Context::new();
        let a = ctx.socket(SocketType::Pair);
        let b = ctx.socket(SocketType::Pair);
        a.bind("inproc://poll-ready").unwrap();
        b.connect("inproc://poll-ready").unwrap();

        {
            let mut items = [PollItem::new(&a, events::POLLIN)];
            assert_eq!(poll(&mut items, 0).unwrap(), 0);
        }
        b.send_parts(vec![Msg::from("x")]).unwrap();
        let mut items = [PollItem::new(&a, events::POLLIN)];
        assert_eq!(poll(&mut items, 1000).unwrap(), 1);
        assert!(items[0].readable());
        a.close();
        b.close();
    }

    #[test]
    fn test_close_wakes_receiver() {
        let ctx = Context::new();
        let a = ctx.socket(SocketType::Pair);
        a.bind("inproc://close-wake").unwrap();
        let a2 = a.clone();
        let waiter = std::thread::spawn(move || a2.recv_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(50));
        a.close();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Terminated)));
    }

    #[test]
    fn test_wire_code_roundtrip() {
        for kind in [
            SocketType::Pair,
            SocketType::Pub,
            SocketType::Sub,
            SocketType::XPub,
            SocketType::Dealer,
            SocketType::Router,
        ] {
            assert_eq!(SocketType::from_wire(kind.wire_code()), Some(kind));
        }
        assert_eq!(SocketType::from_wire(42), None);
    }
}
