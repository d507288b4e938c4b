// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registry + provider + discovery integration.
//!
//! Wires real components over inproc and TCP loopback and checks the
//! directory converges: registration appears at discovery clients,
//! unregistration and heartbeat expiry remove it, and observer events fire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft::{
    Context, Discovery, DiscoveryEvent, DiscoveryObserver, Provider, Registry, RoutingId,
};

/// Poll `cond` until it holds or `timeout` elapses.
fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Retry an operation that needs the registry worker to be up (inproc binds
/// happen on the worker thread).
fn retry<T>(timeout: Duration, mut op: impl FnMut() -> weft::Result<T>) -> weft::Result<T> {
    let deadline = Instant::now() + timeout;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(e);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

fn start_registry(ctx: &Context, pub_ep: &str, router_ep: &str) -> Registry {
    let registry = Registry::new(ctx);
    registry.set_endpoints(pub_ep, router_ep).unwrap();
    registry.set_heartbeat(100, 400).unwrap();
    registry.set_broadcast_interval(200).unwrap();
    registry.start().unwrap();
    registry
}

#[test]
fn test_register_appears_at_discovery_inproc() {
    let ctx = Context::new();
    let registry = start_registry(&ctx, "inproc://di-reg-pub", "inproc://di-reg-router");

    let provider = Provider::new(&ctx);
    provider.set_heartbeat_interval(100).unwrap();
    provider.bind("inproc://di-prov").unwrap();
    retry(Duration::from_secs(2), || {
        provider.connect_registry("inproc://di-reg-router")
    })
    .unwrap();
    provider.register_service("svc", "", 1).unwrap();

    let result = provider.register_result();
    assert_eq!(result.status, 0);
    assert_eq!(result.resolved_endpoint, "inproc://di-prov");

    let discovery = Discovery::new(&ctx);
    discovery.connect_registry("inproc://di-reg-pub").unwrap();
    discovery.subscribe("svc").unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        discovery.provider_count("svc").unwrap_or(0) == 1
    }));
    let providers = discovery.get_providers("svc").unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].endpoint, "inproc://di-prov");
    assert_eq!(providers[0].weight, 1);
    assert!(!providers[0].routing_id.is_empty());
    assert!(discovery.service_available("svc").unwrap());

    provider.destroy();
    discovery.destroy();
    registry.destroy();
}

#[test]
fn test_register_appears_at_discovery_tcp() {
    let ctx = Context::new();
    let registry = start_registry(&ctx, "tcp://127.0.0.1:17110", "tcp://127.0.0.1:17111");

    let provider = Provider::new(&ctx);
    provider.set_heartbeat_interval(100).unwrap();
    provider.bind("tcp://127.0.0.1:*").unwrap();
    provider
        .connect_registry("tcp://127.0.0.1:17111")
        .unwrap();
    retry(Duration::from_secs(5), || {
        provider.register_service("svc-tcp", "", 1)
    })
    .unwrap();

    let advertised = provider.register_result().resolved_endpoint;
    assert!(advertised.starts_with("tcp://127.0.0.1:"));

    let discovery = Discovery::new(&ctx);
    discovery.connect_registry("tcp://127.0.0.1:17110").unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        discovery.provider_count("svc-tcp").unwrap_or(0) == 1
    }));
    let providers = discovery.get_providers("svc-tcp").unwrap();
    assert_eq!(providers[0].endpoint, advertised);

    provider.destroy();
    discovery.destroy();
    registry.destroy();
}

#[test]
fn test_unregister_converges_to_zero() {
    let ctx = Context::new();
    let registry = start_registry(&ctx, "inproc://unreg-pub", "inproc://unreg-router");

    let provider = Provider::new(&ctx);
    provider.set_heartbeat_interval(100).unwrap();
    provider.bind("inproc://unreg-prov").unwrap();
    retry(Duration::from_secs(2), || {
        provider.connect_registry("inproc://unreg-router")
    })
    .unwrap();
    provider.register_service("ephemeral", "", 1).unwrap();

    let discovery = Discovery::new(&ctx);
    discovery.connect_registry("inproc://unreg-pub").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        discovery.provider_count("ephemeral").unwrap_or(0) == 1
    }));

    provider.unregister_service("ephemeral").unwrap();
    // One broadcast interval plus slack.
    assert!(wait_until(Duration::from_secs(2), || {
        discovery.provider_count("ephemeral").unwrap_or(1) == 0
    }));
    assert!(!discovery.service_available("ephemeral").unwrap());

    provider.destroy();
    discovery.destroy();
    registry.destroy();
}

#[test]
fn test_heartbeat_expiry_drops_provider() {
    let ctx = Context::new();
    let registry = start_registry(&ctx, "inproc://hb-pub", "inproc://hb-router");

    let provider = Provider::new(&ctx);
    provider.set_heartbeat_interval(100).unwrap();
    provider.bind("inproc://hb-prov").unwrap();
    retry(Duration::from_secs(2), || {
        provider.connect_registry("inproc://hb-router")
    })
    .unwrap();
    provider.register_service("mortal", "", 1).unwrap();

    let discovery = Discovery::new(&ctx);
    discovery.connect_registry("inproc://hb-pub").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        discovery.provider_count("mortal").unwrap_or(0) == 1
    }));

    // Killing the provider stops its heartbeats; the registry expires the
    // entry after its 400 ms timeout.
    provider.destroy();
    assert!(wait_until(Duration::from_secs(3), || {
        discovery.provider_count("mortal").unwrap_or(1) == 0
    }));

    discovery.destroy();
    registry.destroy();
}

struct CountingObserver {
    added: AtomicUsize,
    removed: AtomicUsize,
    available: AtomicUsize,
    unavailable: AtomicUsize,
}

impl DiscoveryObserver for CountingObserver {
    fn on_discovery_event(&self, event: DiscoveryEvent, _service: &str) {
        let counter = match event {
            DiscoveryEvent::ProviderAdded => &self.added,
            DiscoveryEvent::ProviderRemoved => &self.removed,
            DiscoveryEvent::ServiceAvailable => &self.available,
            DiscoveryEvent::ServiceUnavailable => &self.unavailable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn test_observer_sees_lifecycle() {
    let ctx = Context::new();
    let registry = start_registry(&ctx, "inproc://obs-pub", "inproc://obs-router");

    let discovery = Discovery::new(&ctx);
    discovery.connect_registry("inproc://obs-pub").unwrap();

    let observer = Arc::new(CountingObserver {
        added: AtomicUsize::new(0),
        removed: AtomicUsize::new(0),
        available: AtomicUsize::new(0),
        unavailable: AtomicUsize::new(0),
    });
    let as_observer: Arc<dyn DiscoveryObserver> = observer.clone();
    discovery.add_observer(&as_observer);

    let provider = Provider::new(&ctx);
    provider.set_heartbeat_interval(100).unwrap();
    provider.bind("inproc://obs-prov").unwrap();
    retry(Duration::from_secs(2), || {
        provider.connect_registry("inproc://obs-router")
    })
    .unwrap();
    provider.register_service("observed", "", 1).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        observer.available.load(Ordering::Relaxed) >= 1
            && observer.added.load(Ordering::Relaxed) >= 1
    }));

    provider.unregister_service("observed").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        observer.unavailable.load(Ordering::Relaxed) >= 1
            && observer.removed.load(Ordering::Relaxed) >= 1
    }));

    provider.destroy();
    discovery.destroy();
    registry.destroy();
}

#[test]
fn test_update_weight_propagates() {
    let ctx = Context::new();
    let registry = start_registry(&ctx, "inproc://wt-pub", "inproc://wt-router");

    let provider = Provider::new(&ctx);
    provider.set_heartbeat_interval(100).unwrap();
    provider.bind("inproc://wt-prov").unwrap();
    retry(Duration::from_secs(2), || {
        provider.connect_registry("inproc://wt-router")
    })
    .unwrap();
    provider.register_service("weighted", "", 1).unwrap();

    let discovery = Discovery::new(&ctx);
    discovery.connect_registry("inproc://wt-pub").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        discovery.provider_count("weighted").unwrap_or(0) == 1
    }));

    provider.update_weight("weighted", 7).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        discovery
            .get_providers("weighted")
            .map(|p| p.first().map(|p| p.weight) == Some(7))
            .unwrap_or(false)
    }));

    // Weight zero coerces to one end-to-end.
    provider.update_weight("weighted", 0).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        discovery
            .get_providers("weighted")
            .map(|p| p.first().map(|p| p.weight) == Some(1))
            .unwrap_or(false)
    }));

    provider.destroy();
    discovery.destroy();
    registry.destroy();
}

#[test]
fn test_provider_router_keeps_custom_routing_id() {
    let ctx = Context::new();
    let registry = start_registry(&ctx, "inproc://rid-pub", "inproc://rid-router");

    let provider = Provider::new(&ctx);
    provider.set_heartbeat_interval(100).unwrap();
    provider.bind("inproc://rid-prov").unwrap();
    let router = provider.router().unwrap();
    router
        .set_routing_id(&RoutingId::from_bytes(b"PROV1").unwrap())
        .unwrap();
    retry(Duration::from_secs(2), || {
        provider.connect_registry("inproc://rid-router")
    })
    .unwrap();
    provider.register_service("svc-rid", "", 1).unwrap();

    let discovery = Discovery::new(&ctx);
    discovery.connect_registry("inproc://rid-pub").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        discovery.provider_count("svc-rid").unwrap_or(0) == 1
    }));
    let providers = discovery.get_providers("svc-rid").unwrap();
    assert_eq!(providers[0].routing_id.as_bytes(), b"PROV1");

    provider.destroy();
    discovery.destroy();
    registry.destroy();
}
