// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # weft — service-discovery and message-routing fabric
//!
//! weft layers a replicated service directory, client-side load balancing,
//! and a pub/sub overlay over a compact ZeroMQ-style socket core.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weft::{Context, Discovery, Gateway, Msg, Provider, Registry, Result};
//!
//! fn main() -> Result<()> {
//!     let ctx = Context::new();
//!
//!     // A registry: directory authority for this deployment.
//!     let registry = Registry::new(&ctx);
//!     registry.set_endpoints("tcp://*:7100", "tcp://*:7101")?;
//!     registry.start()?;
//!
//!     // A provider: binds a router, registers, heartbeats.
//!     let provider = Provider::new(&ctx);
//!     provider.bind("tcp://127.0.0.1:*")?;
//!     provider.connect_registry("tcp://127.0.0.1:7101")?;
//!     provider.register_service("billing", "", 1)?;
//!
//!     // A gateway: discovers providers and load-balances sends.
//!     let discovery = Arc::new(Discovery::new(&ctx));
//!     discovery.connect_registry("tcp://127.0.0.1:7100")?;
//!     let gateway = Gateway::new(&ctx, Arc::clone(&discovery));
//!     gateway.send("billing", vec![Msg::from("charge #42")])?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! |                      Application Layer                        |
//! |     Gateway (send/recv)  |  Provider (router)  |  Spot        |
//! +---------------------------------------------------------------+
//! |                      Directory Layer                          |
//! |   Registry (authoritative slice, gossip)  |  Discovery view   |
//! +---------------------------------------------------------------+
//! |                       Wire Layer                              |
//! |   Frame codec (LE ints, strings, routing ids) | SERVICE_LIST  |
//! +---------------------------------------------------------------+
//! |                      Socket Facade                            |
//! |   PAIR/PUB/SUB/XPUB/DEALER/ROUTER | inproc | framed TCP (TLS) |
//! +---------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Registry`] | Replicated `(service → providers)` directory worker |
//! | [`Discovery`] | Subscriber-side directory cache with observers |
//! | [`Gateway`] | Per-service router pools with retrying, balanced sends |
//! | [`Provider`] | Server side: bound router + registration + heartbeats |
//! | [`SpotNode`]/[`Spot`] | Pub/sub overlay with queue and ringbuffer topics |
//! | [`Context`]/[`Socket`] | The underlying socket capability |
//!
//! ## Consistency model
//!
//! Registries gossip full snapshots and merge them last-writer-wins per
//! `(peer, sequence)`; clients converge eventually. Delivery is at-most-once
//! per request with best-effort retry inside the gateway's send deadline.
//!
//! ## Environment
//!
//! Setting `WEFT_DEBUG` (any non-empty value) enables verbose frame and peer
//! traces through the `log` facade. It never alters functional behavior.

/// Discovery wire codec: frame helpers and the `SERVICE_LIST` payload.
pub mod codec;
mod discovery;
mod error;
mod gateway;
mod provider;
mod registry;
/// Routing identity value type.
pub mod routing_id;
/// ZeroMQ-style socket facade (types, options, poll, transports).
pub mod socket;
mod spot;
pub(crate) mod util;

pub use discovery::{
    Discovery, DiscoveryEvent, DiscoveryObserver, ObserverId, ProviderInfo,
};
pub use error::{Error, Result};
pub use gateway::{Gateway, LbStrategy};
pub use provider::{Provider, RegisterResult};
pub use registry::{ack_status, Registry, RegistrySocket, SocketOption};
pub use routing_id::RoutingId;
pub use socket::{events, poll, Context, Msg, PollItem, Socket, SocketType};
pub use spot::{Spot, SpotNode, TopicMode};

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
