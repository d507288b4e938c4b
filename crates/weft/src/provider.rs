// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service provider.
//!
//! The server side of a service: binds a router socket for application
//! traffic, registers itself with a registry over a dealer, and keeps the
//! registration alive with periodic heartbeats from a background worker.
//! The application reads requests directly from the exposed router socket
//! (first frame: the sender's routing id).

use crate::codec::{self, msg_id};
use crate::routing_id::RoutingId;
use crate::socket::{Context, Msg, Socket, SocketType};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Default heartbeat period.
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
/// Registration ack wait.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Stop-flag check granularity inside the heartbeat sleep.
const SLEEP_CHUNK_MS: u64 = 100;

/// Cached outcome of the last registration attempt.
#[derive(Debug, Clone, Default)]
pub struct RegisterResult {
    /// Ack status (`0` accepted; `-1` when no ack was decoded).
    pub status: i32,
    /// Endpoint as resolved by the registry.
    pub resolved_endpoint: String,
    /// Registry-supplied error message, if any.
    pub error_message: String,
}

struct ProviderState {
    router: Option<Socket>,
    dealer: Option<Socket>,
    bind_endpoint: String,
    registry_endpoint: String,
    service_name: String,
    advertise_endpoint: String,
    weight: u32,
    heartbeat_interval_ms: u64,
    last_result: RegisterResult,
    tls_cert: String,
    tls_key: String,
}

struct ProviderInner {
    ctx: Context,
    state: Mutex<ProviderState>,
    stop: AtomicBool,
    destroyed: AtomicBool,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

/// Server side of a service.
///
/// # Example
///
/// ```rust,no_run
/// use weft::{Context, Provider};
///
/// let ctx = Context::new();
/// let provider = Provider::new(&ctx);
/// provider.bind("tcp://127.0.0.1:*")?;
/// provider.connect_registry("tcp://127.0.0.1:7101")?;
/// provider.register_service("billing", "", 1)?;
/// let router = provider.router().expect("bound router");
/// let frames = router.recv()?; // [sender rid, payload…]
/// # let _ = frames;
/// # Ok::<(), weft::Error>(())
/// ```
pub struct Provider {
    inner: Arc<ProviderInner>,
}

impl Provider {
    /// Create an idle provider.
    pub fn new(ctx: &Context) -> Provider {
        Provider {
            inner: Arc::new(ProviderInner {
                ctx: ctx.clone(),
                state: Mutex::new(ProviderState {
                    router: None,
                    dealer: None,
                    bind_endpoint: String::new(),
                    registry_endpoint: String::new(),
                    service_name: String::new(),
                    advertise_endpoint: String::new(),
                    weight: 1,
                    heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
                    last_result: RegisterResult {
                        status: -1,
                        ..RegisterResult::default()
                    },
                    tls_cert: String::new(),
                    tls_key: String::new(),
                }),
                stop: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                heartbeat: Mutex::new(None),
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

    /// Bind the application router. May be called before or after setting
    /// TLS material.
    pub fn bind(&self, endpoint: &str) -> Result<()> {
        self.check_live()?;
        if endpoint.is_empty() {
            return Err(Error::InvalidArgument("empty bind endpoint"));
        }
        let mut st = self.inner.state.lock();
        let router = match &st.router {
            Some(router) => router.clone(),
            None => {
                let router = self.inner.ctx.socket(SocketType::Router);
                if !st.tls_cert.is_empty() {
                    router.set_tls_server(&st.tls_cert, &st.tls_key);
                }
                st.router = Some(router.clone());
                router
            }
        };
        st.bind_endpoint = endpoint.to_string();
        drop(st);
        router.bind(endpoint)
    }

    /// Apply TLS server credentials to the router; empty strings clear them.
    pub fn set_tls_server(&self, cert_pem: &str, key_pem: &str) -> Result<()> {
        self.check_live()?;
        let mut st = self.inner.state.lock();
        st.tls_cert = cert_pem.to_string();
        st.tls_key = key_pem.to_string();
        if let Some(router) = &st.router {
            router.set_tls_server(cert_pem, key_pem);
        }
        Ok(())
    }

    /// Heartbeat period for the background worker (ms, nonzero).
    pub fn set_heartbeat_interval(&self, interval_ms: u64) -> Result<()> {
        self.check_live()?;
        if interval_ms == 0 {
            return Err(Error::InvalidArgument("zero heartbeat interval"));
        }
        self.inner.state.lock().heartbeat_interval_ms = interval_ms;
        Ok(())
    }

    /// Connect the control dealer to a registry router endpoint. Ensures the
    /// router carries a routing id (random `{0x00, rand32_le}` when unset)
    /// and mirrors it onto the dealer so the registry can address acks.
    pub fn connect_registry(&self, registry_router_endpoint: &str) -> Result<()> {
        self.check_live()?;
        if registry_router_endpoint.is_empty() {
            return Err(Error::InvalidArgument("empty registry endpoint"));
        }
        let mut st = self.inner.state.lock();
        let router = st
            .router
            .clone()
            .ok_or(Error::InvalidArgument("provider router not created; bind first"))?;

        let mut rid = router.routing_id();
        if rid.is_empty() {
            rid = RoutingId::random();
            router.set_routing_id(&rid)?;
        }

        let dealer = match &st.dealer {
            Some(dealer) => dealer.clone(),
            None => {
                let dealer = self.inner.ctx.socket(SocketType::Dealer);
                dealer.set_rcvtimeo(Some(ACK_TIMEOUT));
                st.dealer = Some(dealer.clone());
                dealer
            }
        };
        dealer.set_routing_id(&rid)?;
        st.registry_endpoint = registry_router_endpoint.to_string();
        drop(st);
        dealer.connect(registry_router_endpoint)
    }

    /// Rewrite a wildcard bind into an advertisable endpoint.
    fn resolve_advertise(st: &ProviderState, advertise: &str) -> String {
        if !advertise.is_empty() {
            return advertise.to_string();
        }
        let resolved = st
            .router
            .as_ref()
            .and_then(|r| r.last_endpoint())
            .unwrap_or_else(|| st.bind_endpoint.clone());
        if let Some(rest) = resolved.strip_prefix("tcp://") {
            if let Some((host, port)) = rest.rsplit_once(':') {
                if host == "*" || host == "0.0.0.0" {
                    return format!("tcp://127.0.0.1:{}", port);
                }
            }
        }
        resolved
    }

    /// Register this provider for `service_name`, blocking for the
    /// registry's ack. An empty `advertise_endpoint` derives one from the
    /// last bind. Starts the heartbeat worker on first success.
    pub fn register_service(
        &self,
        service_name: &str,
        advertise_endpoint: &str,
        weight: u32,
    ) -> Result<()> {
        self.check_live()?;
        if service_name.is_empty() {
            return Err(Error::InvalidArgument("empty service name"));
        }

        let ack = {
            let mut st = self.inner.state.lock();
            let dealer = st.dealer.clone().ok_or(Error::Unsupported)?;
            let advertise = Self::resolve_advertise(&st, advertise_endpoint);
            if advertise.is_empty() {
                return Err(Error::InvalidArgument("no advertise endpoint"));
            }
            st.service_name = service_name.to_string();
            st.advertise_endpoint = advertise.clone();
            st.weight = weight.max(1);

            dealer.send_parts(vec![
                Msg::from(msg_id::REGISTER.to_le_bytes().to_vec()),
                Msg::from(service_name),
                Msg::from(advertise.as_str()),
                Msg::from(st.weight.to_le_bytes().to_vec()),
            ])?;

            let ack = recv_register_ack(&dealer)?;
            st.last_result = ack.clone();
            ack
        };

        if ack.status != 0 {
            return Err(Error::InvalidArgument("registration rejected"));
        }

        let mut heartbeat = self.inner.heartbeat.lock();
        if heartbeat.is_none() {
            self.inner.stop.store(false, Ordering::Release);
            let inner = Arc::clone(&self.inner);
            let handle = std::thread::Builder::new()
                .name("weft-provbeat".to_string())
                .spawn(move || heartbeat_worker(inner))
                .map_err(Error::Io)?;
            *heartbeat = Some(handle);
        }
        Ok(())
    }

    /// Change this provider's advertised weight (zero coerces to one).
    pub fn update_weight(&self, service_name: &str, weight: u32) -> Result<()> {
        self.check_live()?;
        if service_name.is_empty() {
            return Err(Error::InvalidArgument("empty service name"));
        }
        let st = self.inner.state.lock();
        let dealer = st.dealer.clone().ok_or(Error::Unsupported)?;
        let value = weight.max(1);
        dealer.send_parts(vec![
            Msg::from(msg_id::UPDATE_WEIGHT.to_le_bytes().to_vec()),
            Msg::from(service_name),
            Msg::from(st.advertise_endpoint.as_str()),
            Msg::from(value.to_le_bytes().to_vec()),
        ])?;
        let ack = recv_register_ack(&dealer)?;
        drop(st);
        if ack.status != 0 {
            return Err(Error::InvalidArgument("weight update rejected"));
        }
        Ok(())
    }

    /// Withdraw this provider. Fire-and-forget: no ack is expected.
    pub fn unregister_service(&self, service_name: &str) -> Result<()> {
        self.check_live()?;
        if service_name.is_empty() {
            return Err(Error::InvalidArgument("empty service name"));
        }
        let st = self.inner.state.lock();
        let dealer = st.dealer.clone().ok_or(Error::Unsupported)?;
        dealer.send_parts(vec![
            Msg::from(msg_id::UNREGISTER.to_le_bytes().to_vec()),
            Msg::from(service_name),
            Msg::from(st.advertise_endpoint.as_str()),
        ])
    }

    /// Cached `(status, resolved_endpoint, error_message)` of the last
    /// registration attempt.
    pub fn register_result(&self) -> RegisterResult {
        self.inner.state.lock().last_result.clone()
    }

    /// The bound application router, if any.
    pub fn router(&self) -> Option<Socket> {
        self.inner.state.lock().router.clone()
    }

    /// Stop the heartbeat worker and close both sockets. Subsequent calls on
    /// this handle fail with `StaleHandle`.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.inner.heartbeat.lock().take() {
            let _ = handle.join();
        }
        let (router, dealer) = {
            let mut st = self.inner.state.lock();
            (st.router.take(), st.dealer.take())
        };
        if let Some(dealer) = dealer {
            dealer.close();
        }
        if let Some(router) = router {
            router.close();
        }
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Block for a `REGISTER_ACK` on the dealer, draining the whole reply.
fn recv_register_ack(dealer: &Socket) -> Result<RegisterResult> {
    let frames = dealer.recv()?;
    let mut result = RegisterResult {
        status: -1,
        ..RegisterResult::default()
    };
    if frames.len() >= 2
        && codec::read_u16(&frames[0]) == Some(msg_id::REGISTER_ACK)
    {
        if let Some(status) = codec::read_u8(&frames[1]) {
            result.status = i32::from(status);
        }
        if frames.len() >= 3 {
            result.resolved_endpoint = codec::read_string(&frames[2]);
        }
        if frames.len() >= 4 {
            result.error_message = codec::read_string(&frames[3]);
        }
    }
    Ok(result)
}

fn heartbeat_worker(inner: Arc<ProviderInner>) {
    while !inner.stop.load(Ordering::Acquire) {
        let interval = {
            let st = inner.state.lock();
            if let Some(dealer) = &st.dealer {
                if !st.service_name.is_empty() && !st.advertise_endpoint.is_empty() {
                    let frames = vec![
                        Msg::from(msg_id::HEARTBEAT.to_le_bytes().to_vec()),
                        Msg::from(st.service_name.as_str()),
                        Msg::from(st.advertise_endpoint.as_str()),
                    ];
                    if let Err(e) = dealer.send_parts(frames) {
                        log::debug!("[PROVIDER] heartbeat send failed: {}", e);
                    }
                }
            }
            st.heartbeat_interval_ms
        };

        // Chunked sleep so destroy is observed promptly.
        let mut remaining = interval;
        while remaining > 0 && !inner.stop.load(Ordering::Acquire) {
            let chunk = remaining.min(SLEEP_CHUNK_MS);
            std::thread::sleep(Duration::from_millis(chunk));
            remaining -= chunk;
        }
    }
}
