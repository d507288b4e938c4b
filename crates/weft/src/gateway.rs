// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway: client-side load balancer.
//!
//! For each named service the gateway keeps one router socket connected to
//! every advertised provider endpoint (a *pool*). Discovery changes enqueue
//! the service into a refresh set, drained at the start of every send and
//! receive, where the pool is reconciled: newly advertised endpoints are
//! connected (with the provider's routing id staged first, so the peer is
//! addressable immediately), vanished endpoints are disconnected.
//!
//! Sends pick a provider (round-robin by default, weighted on request),
//! prepend its routing id, and dispatch with retry inside a ~2 s deadline:
//! `WouldBlock` retries after 1 ms, `HostUnreachable` after a refresh and
//! 5 ms, anything else fails fast.

use crate::discovery::{Discovery, DiscoveryEvent, DiscoveryObserver, ObserverId, ProviderInfo};
use crate::routing_id::RoutingId;
use crate::socket::{Context, Msg, Socket, SocketType};
use crate::{util, Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-send deadline.
const SEND_DEADLINE: Duration = Duration::from_secs(2);
/// Router send timeout staged on pool sockets.
const POOL_SNDTIMEO: Duration = Duration::from_secs(2);
/// Readiness gate: attempts × pause waiting for a first endpoint.
const READY_ATTEMPTS: u32 = 200;
const READY_PAUSE: Duration = Duration::from_millis(10);
/// Retry pauses inside the send deadline.
const RETRY_PAUSE_BLOCKED: Duration = Duration::from_millis(1);
const RETRY_PAUSE_UNREACHABLE: Duration = Duration::from_millis(5);
/// Receive scan pause.
const RECV_PAUSE: Duration = Duration::from_millis(1);

/// Provider selection strategy for one service pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LbStrategy {
    /// Visit providers in turn.
    #[default]
    RoundRobin,
    /// Draw proportionally to `max(1, weight)`.
    Weighted,
}

struct ServicePool {
    service_name: String,
    socket: Socket,
    endpoints: Vec<String>,
    providers: Vec<ProviderInfo>,
    rr_index: usize,
    strategy: LbStrategy,
}

impl ServicePool {
    fn select_provider(&mut self) -> Option<RoutingId> {
        if self.providers.is_empty() {
            return None;
        }
        if self.strategy == LbStrategy::Weighted {
            let total: u64 = self
                .providers
                .iter()
                .map(|p| u64::from(p.weight.max(1)))
                .sum();
            let pick = fastrand::u64(..total.max(1));
            let mut acc = 0u64;
            for provider in &self.providers {
                acc += u64::from(provider.weight.max(1));
                if pick < acc {
                    return Some(provider.routing_id);
                }
            }
        }
        let index = self.rr_index % self.providers.len();
        self.rr_index = self.rr_index.wrapping_add(1);
        Some(self.providers[index].routing_id)
    }
}

struct GatewayState {
    pools: HashMap<String, ServicePool>,
    tls_ca: String,
    tls_hostname: String,
    tls_trust_system: bool,
}

struct GatewayInner {
    ctx: Context,
    discovery: Arc<Discovery>,
    state: Mutex<GatewayState>,
    /// Services whose pools need reconciling (fed by discovery events).
    refresh: Mutex<BTreeSet<String>>,
    observer_id: Mutex<Option<ObserverId>>,
    destroyed: AtomicBool,
}

impl DiscoveryObserver for GatewayInner {
    fn on_discovery_event(&self, _event: DiscoveryEvent, service_name: &str) {
        if service_name.is_empty() {
            return;
        }
        self.refresh.lock().insert(service_name.to_string());
    }
}

/// Client-side load balancer over discovered providers.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use weft::{Context, Discovery, Gateway, Msg};
///
/// let ctx = Context::new();
/// let discovery = Arc::new(Discovery::new(&ctx));
/// discovery.connect_registry("tcp://127.0.0.1:7100")?;
/// let gateway = Gateway::new(&ctx, Arc::clone(&discovery));
/// gateway.send("billing", vec![Msg::from("charge")])?;
/// # Ok::<(), weft::Error>(())
/// ```
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    /// Create a gateway over a discovery client. The gateway registers as a
    /// discovery observer and invalidates pools on change.
    pub fn new(ctx: &Context, discovery: Arc<Discovery>) -> Gateway {
        let inner = Arc::new(GatewayInner {
            ctx: ctx.clone(),
            discovery,
            state: Mutex::new(GatewayState {
                pools: HashMap::new(),
                tls_ca: String::new(),
                tls_hostname: String::new(),
                tls_trust_system: false,
            }),
            refresh: Mutex::new(BTreeSet::new()),
            observer_id: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });
        let as_observer: Arc<dyn DiscoveryObserver> = inner.clone();
        let id = inner.discovery.add_observer(&as_observer);
        *inner.observer_id.lock() = Some(id);
        Gateway { inner }
    }

    fn check_live(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            Err(Error::StaleHandle)
        } else {
            Ok(())
        }
    }

    /// Reconcile every pool whose service saw a discovery change.
    fn drain_refresh(&self) {
        let pending: Vec<String> = {
            let mut refresh = self.inner.refresh.lock();
            if refresh.is_empty() {
                return;
            }
            std::mem::take(&mut *refresh).into_iter().collect()
        };
        let mut st = self.inner.state.lock();
        for service in pending {
            if st.pools.contains_key(&service) {
                self.refresh_pool(&mut st, &service);
            }
        }
    }

    fn get_or_create_pool<'a>(
        &self,
        st: &'a mut GatewayState,
        service_name: &str,
    ) -> &'a mut ServicePool {
        let tls = (
            st.tls_ca.clone(),
            st.tls_hostname.clone(),
            st.tls_trust_system,
        );
        let ctx = self.inner.ctx.clone();
        st.pools
            .entry(service_name.to_string())
            .or_insert_with(|| {
                let socket = ctx.socket(SocketType::Router);
                socket.set_router_mandatory(true);
                socket.set_sndtimeo(Some(POOL_SNDTIMEO));
                socket.set_probe_router(true);
                let _ = socket.set_routing_id(&RoutingId::random());
                if !tls.0.is_empty() || tls.2 {
                    socket.set_tls_client(&tls.0, &tls.1, tls.2);
                }
                ServicePool {
                    service_name: service_name.to_string(),
                    socket,
                    endpoints: Vec::new(),
                    providers: Vec::new(),
                    rr_index: 0,
                    strategy: LbStrategy::default(),
                }
            })
    }

    /// Bring a pool's connections in line with the discovery snapshot.
    fn refresh_pool(&self, st: &mut GatewayState, service_name: &str) {
        let providers = self.inner.discovery.snapshot_providers(service_name);
        let Some(pool) = st.pools.get_mut(service_name) else {
            return;
        };

        let next_endpoints: Vec<String> = providers
            .iter()
            .filter(|p| !p.endpoint.is_empty())
            .map(|p| p.endpoint.clone())
            .collect();

        for provider in &providers {
            if provider.endpoint.is_empty() || pool.endpoints.contains(&provider.endpoint) {
                continue;
            }
            // Stage the advertised routing id so the peer is addressable the
            // moment connect returns.
            if !provider.routing_id.is_empty() {
                let _ = pool.socket.set_connect_routing_id(&provider.routing_id);
            }
            if let Err(e) = pool.socket.connect(&provider.endpoint) {
                log::debug!(
                    "[GATEWAY] connect {} for {} failed: {}",
                    provider.endpoint,
                    service_name,
                    e
                );
            }
        }
        for endpoint in &pool.endpoints {
            if !next_endpoints.contains(endpoint) {
                let _ = pool.socket.disconnect(endpoint);
            }
        }

        pool.providers = providers;
        pool.endpoints = next_endpoints;
    }

    /// Send a multi-part message to one selected provider of `service_name`.
    ///
    /// Waits up to ~2 s for the service to have at least one advertised
    /// endpoint, then dispatches with retry inside the same deadline.
    pub fn send(&self, service_name: &str, parts: Vec<Msg>) -> Result<()> {
        self.send_inner(service_name, None, parts)
    }

    /// Send to a caller-specified provider routing id, bypassing selection.
    pub fn send_to(
        &self,
        service_name: &str,
        routing_id: &RoutingId,
        parts: Vec<Msg>,
    ) -> Result<()> {
        if routing_id.is_empty() {
            return Err(Error::HostUnreachable);
        }
        self.send_inner(service_name, Some(*routing_id), parts)
    }

    fn send_inner(
        &self,
        service_name: &str,
        fixed_rid: Option<RoutingId>,
        parts: Vec<Msg>,
    ) -> Result<()> {
        self.check_live()?;
        if service_name.is_empty() {
            return Err(Error::InvalidArgument("empty service name"));
        }
        if parts.is_empty() {
            return Err(Error::InvalidArgument("empty message"));
        }

        // Readiness gate: wait for the pool to see at least one endpoint.
        // Refreshing every attempt also keeps provider weights current.
        let mut ready = false;
        for _ in 0..READY_ATTEMPTS {
            self.drain_refresh();
            {
                let mut st = self.inner.state.lock();
                let _ = self.get_or_create_pool(&mut st, service_name);
                self.refresh_pool(&mut st, service_name);
                if let Some(pool) = st.pools.get(service_name) {
                    if !pool.endpoints.is_empty() {
                        ready = true;
                    }
                }
            }
            if ready {
                break;
            }
            std::thread::sleep(READY_PAUSE);
        }
        if !ready {
            return Err(Error::HostUnreachable);
        }

        let deadline = Instant::now() + SEND_DEADLINE;
        loop {
            let attempt = {
                let mut st = self.inner.state.lock();
                let pool = self.get_or_create_pool(&mut st, service_name);
                let rid = match fixed_rid {
                    Some(rid) => Some(rid),
                    None => pool.select_provider(),
                };
                match rid {
                    None => Err(Error::HostUnreachable),
                    Some(rid) if rid.is_empty() => Err(Error::HostUnreachable),
                    Some(rid) => {
                        if util::debug_enabled() {
                            log::debug!(
                                "[GATEWAY] send {} -> 0x{} ({} peers)",
                                service_name,
                                util::hex(rid.as_bytes()),
                                pool.socket.peer_count()
                            );
                        }
                        let mut frames = Vec::with_capacity(parts.len() + 1);
                        frames.push(Msg::from(rid.as_bytes()));
                        frames.extend(parts.iter().cloned());
                        pool.socket.send_parts(frames)
                    }
                }
            };

            match attempt {
                Ok(()) => return Ok(()),
                Err(Error::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(Error::TimedOut);
                    }
                    std::thread::sleep(RETRY_PAUSE_BLOCKED);
                }
                Err(Error::HostUnreachable) => {
                    if Instant::now() >= deadline {
                        return Err(Error::HostUnreachable);
                    }
                    {
                        let mut st = self.inner.state.lock();
                        self.refresh_pool(&mut st, service_name);
                    }
                    std::thread::sleep(RETRY_PAUSE_UNREACHABLE);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One non-blocking scan over all pools.
    fn scan_pools(&self) -> Option<(String, Vec<Msg>)> {
        let st = self.inner.state.lock();
        for pool in st.pools.values() {
            if let Ok(frames) = pool.socket.try_recv() {
                if frames.len() < 2 {
                    // Router messages carry the peer id plus payload; anything
                    // shorter is a stray.
                    continue;
                }
                let payload = frames.into_iter().skip(1).collect();
                return Some((pool.service_name.clone(), payload));
            }
        }
        None
    }

    fn recv_inner(&self, timeout: Option<Duration>) -> Result<(String, Vec<Msg>)> {
        self.check_live()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            self.drain_refresh();
            if let Some(result) = self.scan_pools() {
                return Ok(result);
            }
            match deadline {
                Some(d) if Instant::now() >= d => {
                    return Err(if timeout == Some(Duration::ZERO) {
                        Error::WouldBlock
                    } else {
                        Error::TimedOut
                    });
                }
                _ => std::thread::sleep(RECV_PAUSE),
            }
        }
    }

    /// Receive the next response from any pool, blocking indefinitely.
    /// Returns the pool's service name and the payload frames.
    pub fn recv(&self) -> Result<(String, Vec<Msg>)> {
        self.recv_inner(None)
    }

    /// Non-blocking receive; `WouldBlock` when no pool has a message.
    pub fn try_recv(&self) -> Result<(String, Vec<Msg>)> {
        self.recv_inner(Some(Duration::ZERO))
    }

    /// Bounded receive; `TimedOut` on expiry.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<(String, Vec<Msg>)> {
        self.recv_inner(Some(timeout))
    }

    /// Choose the selection strategy for a service (creating its pool).
    pub fn set_lb_strategy(&self, service_name: &str, strategy: LbStrategy) -> Result<()> {
        self.check_live()?;
        if service_name.is_empty() {
            return Err(Error::InvalidArgument("empty service name"));
        }
        let mut st = self.inner.state.lock();
        self.get_or_create_pool(&mut st, service_name).strategy = strategy;
        Ok(())
    }

    /// Number of endpoints currently connected for a service, after a
    /// refresh. Zero for services without a pool.
    pub fn connection_count(&self, service_name: &str) -> Result<usize> {
        self.check_live()?;
        if service_name.is_empty() {
            return Err(Error::InvalidArgument("empty service name"));
        }
        self.drain_refresh();
        let mut st = self.inner.state.lock();
        if !st.pools.contains_key(service_name) {
            return Ok(0);
        }
        self.refresh_pool(&mut st, service_name);
        Ok(st
            .pools
            .get(service_name)
            .map(|p| p.endpoints.len())
            .unwrap_or(0))
    }

    /// Apply client TLS material to all current and future pool sockets.
    /// Empty strings clear it.
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
        for pool in st.pools.values() {
            pool.socket.set_tls_client(ca_pem, hostname, trust_system);
        }
        Ok(())
    }

    /// The pool's router socket for a service (creating the pool), for
    /// callers that read responses directly.
    pub fn router(&self, service_name: &str) -> Result<Socket> {
        self.check_live()?;
        if service_name.is_empty() {
            return Err(Error::InvalidArgument("empty service name"));
        }
        let mut st = self.inner.state.lock();
        Ok(self.get_or_create_pool(&mut st, service_name).socket.clone())
    }

    /// Deregister from discovery, close every pool socket, clear state.
    /// Subsequent calls on this handle fail with `StaleHandle`.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = self.inner.observer_id.lock().take() {
            self.inner.discovery.remove_observer(id);
        }
        let mut st = self.inner.state.lock();
        for (_, pool) in st.pools.drain() {
            pool.socket.close();
        }
        self.inner.refresh.lock().clear();
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_weights(ctx: &Context, weights: &[u32]) -> ServicePool {
        ServicePool {
            service_name: "svc".into(),
            socket: ctx.socket(SocketType::Router),
            endpoints: weights
                .iter()
                .enumerate()
                .map(|(i, _)| format!("inproc://p{}", i))
                .collect(),
            providers: weights
                .iter()
                .enumerate()
                .map(|(i, w)| ProviderInfo {
                    service_name: "svc".into(),
                    endpoint: format!("inproc://p{}", i),
                    routing_id: RoutingId::from_bytes(&[b'P', i as u8]).unwrap(),
                    weight: *w,
                    registered_at: 0,
                })
                .collect(),
            rr_index: 0,
            strategy: LbStrategy::RoundRobin,
        }
    }

    #[test]
    fn test_round_robin_visits_each_once_per_cycle() {
        let ctx = Context::new();
        let mut pool = pool_with_weights(&ctx, &[1, 1, 1]);
        let mut counts = [0usize; 3];
        for _ in 0..30 {
            let rid = pool.select_provider().unwrap();
            let idx = rid.as_bytes()[1] as usize;
            counts[idx] += 1;
        }
        assert_eq!(counts, [10, 10, 10]);
        pool.socket.close();
    }

    #[test]
    fn test_weighted_respects_weights() {
        let ctx = Context::new();
        let mut pool = pool_with_weights(&ctx, &[1, 9]);
        pool.strategy = LbStrategy::Weighted;
        let mut counts = [0usize; 2];
        for _ in 0..2_000 {
            let rid = pool.select_provider().unwrap();
            counts[rid.as_bytes()[1] as usize] += 1;
        }
        // Expect roughly 10% / 90%; allow generous slack.
        assert!(counts[0] > 50, "low-weight starved: {:?}", counts);
        assert!(counts[1] > counts[0] * 4, "weights ignored: {:?}", counts);
        pool.socket.close();
    }

    #[test]
    fn test_weighted_coerces_zero_weight() {
        let ctx = Context::new();
        let mut pool = pool_with_weights(&ctx, &[0]);
        pool.strategy = LbStrategy::Weighted;
        // A zero weight must still be selectable (coerced to one).
        assert!(pool.select_provider().is_some());
        pool.socket.close();
    }

    #[test]
    fn test_select_on_empty_pool() {
        let ctx = Context::new();
        let mut pool = pool_with_weights(&ctx, &[]);
        assert!(pool.select_provider().is_none());
        pool.socket.close();
    }

    #[test]
    fn test_send_no_providers_unreachable() {
        let ctx = Context::new();
        let discovery = Arc::new(Discovery::new(&ctx));
        let gateway = Gateway::new(&ctx, Arc::clone(&discovery));
        // Shrink the gate by using send_to with an unknown-but-fixed rid
        // against a service nobody advertises: the readiness gate fails.
        let started = Instant::now();
        let err = gateway
            .send("ghost-service", vec![Msg::from("x")])
            .unwrap_err();
        assert!(matches!(err, Error::HostUnreachable));
        assert!(started.elapsed() >= Duration::from_millis(500));
        gateway.destroy();
        discovery.destroy();
    }

    #[test]
    fn test_send_to_empty_rid_rejected() {
        let ctx = Context::new();
        let discovery = Arc::new(Discovery::new(&ctx));
        let gateway = Gateway::new(&ctx, Arc::clone(&discovery));
        let err = gateway
            .send_to("svc", &RoutingId::empty(), vec![Msg::from("x")])
            .unwrap_err();
        assert!(matches!(err, Error::HostUnreachable));
        gateway.destroy();
        discovery.destroy();
    }

    #[test]
    fn test_invalid_arguments() {
        let ctx = Context::new();
        let discovery = Arc::new(Discovery::new(&ctx));
        let gateway = Gateway::new(&ctx, Arc::clone(&discovery));
        assert!(matches!(
            gateway.send("", vec![Msg::from("x")]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            gateway.send("svc", vec![]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            gateway.connection_count(""),
            Err(Error::InvalidArgument(_))
        ));
        gateway.destroy();
        discovery.destroy();
    }

    #[test]
    fn test_connection_count_absent_pool_is_zero() {
        let ctx = Context::new();
        let discovery = Arc::new(Discovery::new(&ctx));
        let gateway = Gateway::new(&ctx, Arc::clone(&discovery));
        assert_eq!(gateway.connection_count("nobody").unwrap(), 0);
        gateway.destroy();
        discovery.destroy();
    }

    #[test]
    fn test_try_recv_empty() {
        let ctx = Context::new();
        let discovery = Arc::new(Discovery::new(&ctx));
        let gateway = Gateway::new(&ctx, Arc::clone(&discovery));
        assert!(matches!(gateway.try_recv(), Err(Error::WouldBlock)));
        gateway.destroy();
        discovery.destroy();
    }

    #[test]
    fn test_destroy_removes_observer_and_stales_handle() {
        let ctx = Context::new();
        let discovery = Arc::new(Discovery::new(&ctx));
        let gateway = Gateway::new(&ctx, Arc::clone(&discovery));
        gateway.destroy();
        assert!(matches!(
            gateway.send("svc", vec![Msg::from("x")]),
            Err(Error::StaleHandle)
        ));
        discovery.destroy();
    }
}
