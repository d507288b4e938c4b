// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gossip between peer registries: merge, deletion propagation, and silent
//! peer expiry.

use std::time::{Duration, Instant};
use weft::{Context, Discovery, Provider, Registry};

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

fn registry(ctx: &Context, id: u32, tag: &str, peer_pub: Option<&str>) -> Registry {
    let r = Registry::new(ctx);
    r.set_endpoints(
        &format!("inproc://{}-pub", tag),
        &format!("inproc://{}-router", tag),
    )
    .unwrap();
    r.set_id(id).unwrap();
    r.set_heartbeat(100, 400).unwrap();
    r.set_broadcast_interval(200).unwrap();
    if let Some(peer) = peer_pub {
        r.add_peer(peer).unwrap();
    }
    r.start().unwrap();
    r
}

#[test]
fn test_gossip_merges_remote_slice() {
    let ctx = Context::new();
    let registry_a = registry(&ctx, 1, "gsp-a", None);
    let registry_b = registry(&ctx, 2, "gsp-b", Some("inproc://gsp-a-pub"));

    // Provider registers only at A.
    let provider = Provider::new(&ctx);
    provider.set_heartbeat_interval(100).unwrap();
    provider.bind("inproc://gsp-prov").unwrap();
    retry(Duration::from_secs(2), || {
        provider.connect_registry("inproc://gsp-a-router")
    })
    .unwrap();
    provider.register_service("replicated", "", 3).unwrap();

    // A client watching only B must still learn about it.
    let discovery = Discovery::new(&ctx);
    discovery.connect_registry("inproc://gsp-b-pub").unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        discovery.provider_count("replicated").unwrap_or(0) == 1
    }));
    let providers = discovery.get_providers("replicated").unwrap();
    assert_eq!(providers[0].endpoint, "inproc://gsp-prov");
    assert_eq!(providers[0].weight, 3);

    // Deletion propagates the same way.
    provider.unregister_service("replicated").unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        discovery.provider_count("replicated").unwrap_or(1) == 0
    }));

    provider.destroy();
    discovery.destroy();
    registry_b.destroy();
    registry_a.destroy();
}

#[test]
fn test_silent_peer_slice_expires() {
    let ctx = Context::new();
    let registry_a = registry(&ctx, 11, "exp-a", None);
    let registry_b = registry(&ctx, 12, "exp-b", Some("inproc://exp-a-pub"));

    let provider = Provider::new(&ctx);
    provider.set_heartbeat_interval(100).unwrap();
    provider.bind("inproc://exp-prov").unwrap();
    retry(Duration::from_secs(2), || {
        provider.connect_registry("inproc://exp-a-router")
    })
    .unwrap();
    provider.register_service("fading", "", 1).unwrap();

    let discovery = Discovery::new(&ctx);
    discovery.connect_registry("inproc://exp-b-pub").unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        discovery.provider_count("fading").unwrap_or(0) == 1
    }));

    // Take registry A (and its provider) down without an unregister. B must
    // drop A's slice after 3 × broadcast interval of silence.
    provider.destroy();
    registry_a.destroy();
    assert!(wait_until(Duration::from_secs(4), || {
        discovery.provider_count("fading").unwrap_or(1) == 0
    }));

    discovery.destroy();
    registry_b.destroy();
}

#[test]
fn test_local_entries_survive_gossip() {
    let ctx = Context::new();
    let registry_a = registry(&ctx, 21, "mix-a", Some("inproc://mix-b-pub"));
    let registry_b = registry(&ctx, 22, "mix-b", Some("inproc://mix-a-pub"));

    // One provider per registry, same service name, different endpoints.
    let provider_a = Provider::new(&ctx);
    provider_a.set_heartbeat_interval(100).unwrap();
    provider_a.bind("inproc://mix-prov-a").unwrap();
    retry(Duration::from_secs(2), || {
        provider_a.connect_registry("inproc://mix-a-router")
    })
    .unwrap();
    provider_a.register_service("shared", "", 1).unwrap();

    let provider_b = Provider::new(&ctx);
    provider_b.set_heartbeat_interval(100).unwrap();
    provider_b.bind("inproc://mix-prov-b").unwrap();
    retry(Duration::from_secs(2), || {
        provider_b.connect_registry("inproc://mix-b-router")
    })
    .unwrap();
    provider_b.register_service("shared", "", 1).unwrap();

    // Either registry's broadcast must eventually carry both endpoints.
    let discovery = Discovery::new(&ctx);
    discovery.connect_registry("inproc://mix-a-pub").unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        discovery.provider_count("shared").unwrap_or(0) == 2
    }));
    let mut endpoints: Vec<String> = discovery
        .get_providers("shared")
        .unwrap()
        .into_iter()
        .map(|p| p.endpoint)
        .collect();
    endpoints.sort();
    assert_eq!(
        endpoints,
        vec![
            "inproc://mix-prov-a".to_string(),
            "inproc://mix-prov-b".to_string()
        ]
    );

    provider_a.destroy();
    provider_b.destroy();
    discovery.destroy();
    registry_b.destroy();
    registry_a.destroy();
}
