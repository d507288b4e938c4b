// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery client.
//!
//! Subscribes to one or more registry publishers and maintains a local,
//! monotonic view of the service directory: a `SERVICE_LIST` is applied only
//! when its `(registry_id, list_seq)` is strictly newer than the last one
//! accepted from that registry. Queries read a lock-free snapshot
//! (`arc-swap`), so the gateway's hot path never contends with the worker.
//!
//! Observers are held as weak references in id-indexed slots and notified
//! *after* the local view changed, outside any lock, in generation order.

use crate::codec::{msg_id, ServiceListMsg};
use crate::routing_id::RoutingId;
use crate::socket::{events, poll, Context, PollItem, SocketType};
use crate::{util, Error, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Poll tick of the worker loop.
const TICK_MS: i64 = 100;

/// Directory change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A new provider endpoint appeared for the service.
    ProviderAdded,
    /// A provider endpoint disappeared from the service.
    ProviderRemoved,
    /// The service went from zero providers to at least one.
    ServiceAvailable,
    /// The service lost its last provider.
    ServiceUnavailable,
}

/// Callback surface for directory changes.
///
/// Implementations must not call back into the discovery client from the
/// callback with operations that mutate observer registration.
pub trait DiscoveryObserver: Send + Sync {
    /// Called after the local view changed.
    fn on_discovery_event(&self, event: DiscoveryEvent, service_name: &str);
}

/// Slot handle returned by [`Discovery::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

/// One provider as seen by discovery.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub service_name: String,
    pub endpoint: String,
    pub routing_id: RoutingId,
    pub weight: u32,
    /// First time this client saw the endpoint (local monotonic ms).
    pub registered_at: u64,
}

#[derive(Clone)]
struct ServiceView {
    source_registry: u32,
    providers: Vec<ProviderInfo>,
}

struct DiscoveryState {
    registry_endpoints: BTreeSet<String>,
    subscriptions: BTreeSet<String>,
    registry_seq: HashMap<u32, u64>,
    observers: HashMap<u64, Weak<dyn DiscoveryObserver>>,
    next_observer_id: u64,
}

struct DiscoveryInner {
    ctx: Context,
    state: Mutex<DiscoveryState>,
    /// Current directory view; swapped wholesale by the worker.
    view: ArcSwap<HashMap<String, ServiceView>>,
    stop: AtomicBool,
    destroyed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Client-side view of the service directory.
///
/// # Example
///
/// ```rust,no_run
/// use weft::{Context, Discovery};
///
/// let ctx = Context::new();
/// let discovery = Discovery::new(&ctx);
/// discovery.connect_registry("tcp://127.0.0.1:7100")?;
/// discovery.subscribe("billing")?;
/// if discovery.service_available("billing")? {
///     for p in discovery.get_providers("billing")? {
///         println!("{} via {}", p.service_name, p.endpoint);
///     }
/// }
/// # Ok::<(), weft::Error>(())
/// ```
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

impl Discovery {
    /// Create an idle discovery client; the worker starts with the first
    /// [`Discovery::connect_registry`].
    pub fn new(ctx: &Context) -> Discovery {
        Discovery {
            inner: Arc::new(DiscoveryInner {
                ctx: ctx.clone(),
                state: Mutex::new(DiscoveryState {
                    registry_endpoints: BTreeSet::new(),
                    subscriptions: BTreeSet::new(),
                    registry_seq: HashMap::new(),
                    observers: HashMap::new(),
                    next_observer_id: 1,
                }),
                view: ArcSwap::from_pointee(HashMap::new()),
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

    /// Subscribe to a registry publisher. May be called repeatedly;
    /// endpoints are deduplicated and picked up by the worker on its next
    /// tick.
    pub fn connect_registry(&self, registry_pub_endpoint: &str) -> Result<()> {
        self.check_live()?;
        if registry_pub_endpoint.is_empty() {
            return Err(Error::InvalidArgument("empty registry endpoint"));
        }
        self.inner
            .state
            .lock()
            .registry_endpoints
            .insert(registry_pub_endpoint.to_string());

        let mut worker = self.inner.worker.lock();
        if worker.is_none() {
            self.inner.stop.store(false, Ordering::Release);
            let inner = Arc::clone(&self.inner);
            let handle = std::thread::Builder::new()
                .name("weft-discovery".to_string())
                .spawn(move || run_worker(inner))
                .map_err(Error::Io)?;
            *worker = Some(handle);
        }
        Ok(())
    }

    /// Track only this service (client-side filter). With no subscriptions,
    /// every service is tracked.
    pub fn subscribe(&self, service_name: &str) -> Result<()> {
        self.check_live()?;
        if service_name.is_empty() {
            return Err(Error::InvalidArgument("empty service name"));
        }
        self.inner
            .state
            .lock()
            .subscriptions
            .insert(service_name.to_string());
        Ok(())
    }

    /// Stop tracking a service.
    pub fn unsubscribe(&self, service_name: &str) -> Result<()> {
        self.check_live()?;
        if service_name.is_empty() {
            return Err(Error::InvalidArgument("empty service name"));
        }
        self.inner.state.lock().subscriptions.remove(service_name);
        Ok(())
    }

    fn tracked(&self, service_name: &str) -> bool {
        let st = self.inner.state.lock();
        st.subscriptions.is_empty() || st.subscriptions.contains(service_name)
    }

    /// Snapshot of the providers currently advertised for a service.
    pub fn snapshot_providers(&self, service_name: &str) -> Vec<ProviderInfo> {
        if !self.tracked(service_name) {
            return Vec::new();
        }
        self.inner
            .view
            .load()
            .get(service_name)
            .map(|v| v.providers.clone())
            .unwrap_or_default()
    }

    /// Providers currently advertised for a service.
    pub fn get_providers(&self, service_name: &str) -> Result<Vec<ProviderInfo>> {
        self.check_live()?;
        if service_name.is_empty() {
            return Err(Error::InvalidArgument("empty service name"));
        }
        Ok(self.snapshot_providers(service_name))
    }

    /// Number of providers currently advertised for a service.
    pub fn provider_count(&self, service_name: &str) -> Result<usize> {
        self.check_live()?;
        if service_name.is_empty() {
            return Err(Error::InvalidArgument("empty service name"));
        }
        if !self.tracked(service_name) {
            return Ok(0);
        }
        Ok(self
            .inner
            .view
            .load()
            .get(service_name)
            .map(|v| v.providers.len())
            .unwrap_or(0))
    }

    /// Whether at least one provider is advertised for a service.
    pub fn service_available(&self, service_name: &str) -> Result<bool> {
        Ok(self.provider_count(service_name)? > 0)
    }

    /// Names of the services currently in the view, honoring the
    /// subscription filter. Sorted for stable output.
    pub fn service_names(&self) -> Vec<String> {
        let view = self.inner.view.load();
        let st = self.inner.state.lock();
        let mut names: Vec<String> = view
            .keys()
            .filter(|name| st.subscriptions.is_empty() || st.subscriptions.contains(*name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Register an observer; it is held weakly and culled once dropped.
    pub fn add_observer(&self, observer: &Arc<dyn DiscoveryObserver>) -> ObserverId {
        let mut st = self.inner.state.lock();
        let id = st.next_observer_id;
        st.next_observer_id += 1;
        st.observers.insert(id, Arc::downgrade(observer));
        ObserverId(id)
    }

    /// Free an observer slot.
    pub fn remove_observer(&self, id: ObserverId) {
        self.inner.state.lock().observers.remove(&id.0);
    }

    /// Stop the worker. Subsequent calls on this handle fail with
    /// `StaleHandle`.
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

impl Drop for Discovery {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ============================================================================
// Worker
// ============================================================================

fn run_worker(inner: Arc<DiscoveryInner>) {
    let sub = inner.ctx.socket(SocketType::Sub);
    let _ = sub.subscribe(b"");
    let mut connected: BTreeSet<String> = BTreeSet::new();

    while !inner.stop.load(Ordering::Acquire) {
        let endpoints = inner.state.lock().registry_endpoints.clone();
        for endpoint in &endpoints {
            if !connected.contains(endpoint) {
                match sub.connect(endpoint) {
                    Ok(()) => {
                        connected.insert(endpoint.clone());
                    }
                    Err(e) => {
                        log::debug!("[DISCOVERY] connect {} failed: {}", endpoint, e);
                        // Inproc registries may simply not be up yet; retry
                        // on the next tick.
                    }
                }
            }
        }

        {
            let mut items = [PollItem::new(&sub, events::POLLIN)];
            let _ = poll(&mut items, TICK_MS);
        }

        while let Ok(frames) = sub.try_recv() {
            let Some(list) = ServiceListMsg::decode(&frames) else {
                if util::debug_enabled() {
                    log::debug!("[DISCOVERY] undecodable broadcast ({} frames)", frames.len());
                }
                continue;
            };
            if list.msg_id != msg_id::SERVICE_LIST {
                continue;
            }
            handle_service_list(&inner, &list);
        }
    }

    sub.close();
    log::debug!("[DISCOVERY] worker stopped");
}

fn handle_service_list(inner: &Arc<DiscoveryInner>, list: &ServiceListMsg) {
    let now = util::now_ms();
    let mut pending: Vec<(DiscoveryEvent, String)> = Vec::new();
    let mut observers: Vec<Weak<dyn DiscoveryObserver>> = Vec::new();

    {
        let mut st = inner.state.lock();
        if let Some(stored) = st.registry_seq.get(&list.registry_id) {
            if list.list_seq <= *stored {
                return;
            }
        }
        st.registry_seq.insert(list.registry_id, list.list_seq);

        let old = inner.view.load_full();
        let mut new_map: HashMap<String, ServiceView> = (*old).clone();

        let carried: BTreeSet<&str> = list.services.iter().map(|(n, _)| n.as_str()).collect();
        for (service, rows) in &list.services {
            let providers = rows
                .iter()
                .map(|row| {
                    let registered_at = old
                        .get(service)
                        .and_then(|v| {
                            v.providers
                                .iter()
                                .find(|p| p.endpoint == row.endpoint)
                                .map(|p| p.registered_at)
                        })
                        .unwrap_or(now);
                    ProviderInfo {
                        service_name: service.clone(),
                        endpoint: row.endpoint.clone(),
                        routing_id: row.routing_id,
                        weight: row.weight.max(1),
                        registered_at,
                    }
                })
                .collect();
            new_map.insert(
                service.clone(),
                ServiceView {
                    source_registry: list.registry_id,
                    providers,
                },
            );
        }
        // Services this registry used to carry but no longer does are gone;
        // services sourced from other registries are untouched.
        new_map.retain(|name, view| {
            view.source_registry != list.registry_id || carried.contains(name.as_str())
        });

        // Synthesize events from the set difference, per tracked service.
        let mut names: BTreeSet<&str> = old.keys().map(|s| s.as_str()).collect();
        names.extend(new_map.keys().map(|s| s.as_str()));
        for name in names {
            if !st.subscriptions.is_empty() && !st.subscriptions.contains(name) {
                continue;
            }
            let old_eps: BTreeSet<&str> = old
                .get(name)
                .map(|v| v.providers.iter().map(|p| p.endpoint.as_str()).collect())
                .unwrap_or_default();
            let new_eps: BTreeSet<&str> = new_map
                .get(name)
                .map(|v| v.providers.iter().map(|p| p.endpoint.as_str()).collect())
                .unwrap_or_default();

            if old_eps.is_empty() && !new_eps.is_empty() {
                pending.push((DiscoveryEvent::ServiceAvailable, name.to_string()));
            }
            if !old_eps.is_empty() && new_eps.is_empty() {
                pending.push((DiscoveryEvent::ServiceUnavailable, name.to_string()));
            }
            if new_eps.difference(&old_eps).next().is_some() {
                pending.push((DiscoveryEvent::ProviderAdded, name.to_string()));
            }
            if old_eps.difference(&new_eps).next().is_some() {
                pending.push((DiscoveryEvent::ProviderRemoved, name.to_string()));
            }
        }

        inner.view.store(Arc::new(new_map));

        if !pending.is_empty() {
            st.observers.retain(|_, weak| weak.strong_count() > 0);
            observers.extend(st.observers.values().cloned());
        }
    }

    // Callbacks run outside the lock, in generation order.
    for (event, service) in &pending {
        for weak in &observers {
            if let Some(observer) = weak.upgrade() {
                observer.on_discovery_event(*event, service);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ProviderRow;
    use parking_lot::Mutex as PlMutex;

    fn list(registry: u32, seq: u64, services: Vec<(&str, Vec<&str>)>) -> ServiceListMsg {
        ServiceListMsg {
            msg_id: msg_id::SERVICE_LIST,
            registry_id: registry,
            list_seq: seq,
            services: services
                .into_iter()
                .map(|(name, eps)| {
                    (
                        name.to_string(),
                        eps.into_iter()
                            .map(|ep| ProviderRow {
                                endpoint: ep.to_string(),
                                routing_id: RoutingId::from_bytes(b"P").unwrap(),
                                weight: 1,
                            })
                            .collect(),
                    )
                })
                .collect(),
        }
    }

    struct Recorder {
        events: PlMutex<Vec<(DiscoveryEvent, String)>>,
    }

    impl DiscoveryObserver for Recorder {
        fn on_discovery_event(&self, event: DiscoveryEvent, service_name: &str) {
            self.events.lock().push((event, service_name.to_string()));
        }
    }

    fn new_inner() -> (Discovery, Arc<DiscoveryInner>) {
        let ctx = Context::new();
        let d = Discovery::new(&ctx);
        let inner = Arc::clone(&d.inner);
        (d, inner)
    }

    #[test]
    fn test_seq_gate_strictly_increasing() {
        let (d, inner) = new_inner();
        handle_service_list(&inner, &list(1, 5, vec![("svc", vec!["ep-a"])]));
        assert_eq!(d.provider_count("svc").unwrap(), 1);

        // Same seq ignored.
        handle_service_list(&inner, &list(1, 5, vec![("svc", vec!["ep-a", "ep-b"])]));
        assert_eq!(d.provider_count("svc").unwrap(), 1);

        // Lower seq ignored.
        handle_service_list(&inner, &list(1, 4, vec![("svc", vec![])]));
        assert_eq!(d.provider_count("svc").unwrap(), 1);

        // Higher accepted.
        handle_service_list(&inner, &list(1, 6, vec![("svc", vec!["ep-a", "ep-b"])]));
        assert_eq!(d.provider_count("svc").unwrap(), 2);
        d.destroy();
    }

    #[test]
    fn test_uncarried_service_removed_for_same_source() {
        let (d, inner) = new_inner();
        handle_service_list(
            &inner,
            &list(1, 1, vec![("a", vec!["ep1"]), ("b", vec!["ep2"])]),
        );
        assert!(d.service_available("a").unwrap());
        assert!(d.service_available("b").unwrap());

        // Registry 1 stops carrying "b".
        handle_service_list(&inner, &list(1, 2, vec![("a", vec!["ep1"])]));
        assert!(d.service_available("a").unwrap());
        assert!(!d.service_available("b").unwrap());
        d.destroy();
    }

    #[test]
    fn test_other_registry_slice_untouched() {
        let (d, inner) = new_inner();
        handle_service_list(&inner, &list(1, 1, vec![("a", vec!["ep1"])]));
        handle_service_list(&inner, &list(2, 1, vec![("b", vec!["ep2"])]));
        assert!(d.service_available("a").unwrap());
        assert!(d.service_available("b").unwrap());

        // A later list from registry 2 must not disturb registry 1's "a".
        handle_service_list(&inner, &list(2, 2, vec![("b", vec!["ep2", "ep3"])]));
        assert!(d.service_available("a").unwrap());
        assert_eq!(d.provider_count("b").unwrap(), 2);
        d.destroy();
    }

    #[test]
    fn test_observer_events_on_change() {
        let (d, inner) = new_inner();
        let recorder = Arc::new(Recorder {
            events: PlMutex::new(Vec::new()),
        });
        let as_observer: Arc<dyn DiscoveryObserver> = recorder.clone();
        let id = d.add_observer(&as_observer);

        handle_service_list(&inner, &list(1, 1, vec![("svc", vec!["ep-a"])]));
        {
            let events = recorder.events.lock();
            assert_eq!(
                events.as_slice(),
                &[
                    (DiscoveryEvent::ServiceAvailable, "svc".to_string()),
                    (DiscoveryEvent::ProviderAdded, "svc".to_string()),
                ]
            );
        }

        recorder.events.lock().clear();
        handle_service_list(&inner, &list(1, 2, vec![("svc", vec!["ep-b"])]));
        {
            let events = recorder.events.lock();
            assert!(events.contains(&(DiscoveryEvent::ProviderAdded, "svc".to_string())));
            assert!(events.contains(&(DiscoveryEvent::ProviderRemoved, "svc".to_string())));
        }

        recorder.events.lock().clear();
        handle_service_list(&inner, &list(1, 3, vec![]));
        {
            let events = recorder.events.lock();
            assert!(events.contains(&(DiscoveryEvent::ServiceUnavailable, "svc".to_string())));
        }

        d.remove_observer(id);
        recorder.events.lock().clear();
        handle_service_list(&inner, &list(1, 4, vec![("svc", vec!["ep-a"])]));
        assert!(recorder.events.lock().is_empty());
        d.destroy();
    }

    #[test]
    fn test_subscription_filter() {
        let (d, inner) = new_inner();
        d.subscribe("watched").unwrap();
        handle_service_list(
            &inner,
            &list(1, 1, vec![("watched", vec!["ep1"]), ("other", vec!["ep2"])]),
        );
        assert_eq!(d.provider_count("watched").unwrap(), 1);
        // Untracked services read as absent.
        assert_eq!(d.provider_count("other").unwrap(), 0);
        assert!(d.snapshot_providers("other").is_empty());

        d.unsubscribe("watched").unwrap();
        // No subscriptions: everything is tracked again.
        assert_eq!(d.provider_count("other").unwrap(), 1);
        d.destroy();
    }

    #[test]
    fn test_dropped_observer_is_culled() {
        let (d, inner) = new_inner();
        let recorder = Arc::new(Recorder {
            events: PlMutex::new(Vec::new()),
        });
        let as_observer: Arc<dyn DiscoveryObserver> = recorder.clone();
        d.add_observer(&as_observer);
        drop(as_observer);
        drop(recorder);

        // Must not panic or leak; dead weak is culled on dispatch.
        handle_service_list(&inner, &list(1, 1, vec![("svc", vec!["ep"])]));
        assert_eq!(inner.state.lock().observers.len(), 0);
        d.destroy();
    }

    #[test]
    fn test_stale_handle_after_destroy() {
        let ctx = Context::new();
        let d = Discovery::new(&ctx);
        d.destroy();
        assert!(matches!(d.subscribe("svc"), Err(Error::StaleHandle)));
        assert!(matches!(d.get_providers("svc"), Err(Error::StaleHandle)));
    }
}
