// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! weft-registryd - standalone service registry daemon
//!
//! Runs one registry worker: providers register against the router
//! endpoint, clients subscribe to the publisher endpoint, and peer
//! registries gossip through their publishers.

use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft::{Context, Registry};

/// Standalone weft service registry
#[derive(Parser, Debug)]
#[command(name = "weft-registryd")]
#[command(version)]
#[command(about = "Service registry daemon for the weft fabric")]
struct Args {
    /// Publisher endpoint clients subscribe to (SERVICE_LIST broadcasts)
    #[arg(long, default_value = "tcp://*:7100")]
    pub_endpoint: String,

    /// Router endpoint providers register against
    #[arg(long, default_value = "tcp://*:7101")]
    router_endpoint: String,

    /// Fixed registry id (random nonzero when omitted)
    #[arg(long)]
    registry_id: Option<u32>,

    /// Peer registry publisher endpoint to gossip with (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Expected provider heartbeat interval in milliseconds
    #[arg(long, default_value = "5000")]
    heartbeat_interval_ms: u64,

    /// Provider expiry timeout in milliseconds (must exceed the interval)
    #[arg(long, default_value = "15000")]
    heartbeat_timeout_ms: u64,

    /// Minimum period between idle broadcasts in milliseconds
    #[arg(long, default_value = "30000")]
    broadcast_interval_ms: u64,
}

fn main() {
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .init();
    let args = Args::parse();

    let ctx = Context::new();
    let registry = Registry::new(&ctx);

    let configured = registry
        .set_endpoints(&args.pub_endpoint, &args.router_endpoint)
        .and_then(|()| registry.set_heartbeat(args.heartbeat_interval_ms, args.heartbeat_timeout_ms))
        .and_then(|()| registry.set_broadcast_interval(args.broadcast_interval_ms))
        .and_then(|()| match args.registry_id {
            Some(id) => registry.set_id(id),
            None => Ok(()),
        })
        .and_then(|()| {
            for peer in &args.peers {
                registry.add_peer(peer)?;
            }
            Ok(())
        });
    if let Err(e) = configured {
        eprintln!("weft-registryd: invalid configuration: {}", e);
        std::process::exit(2);
    }

    if let Err(e) = registry.start() {
        eprintln!("weft-registryd: failed to start: {}", e);
        std::process::exit(1);
    }

    log::info!(
        "[REGISTRYD] serving pub={} router={} peers={}",
        args.pub_endpoint,
        args.router_endpoint,
        args.peers.len()
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_flag.store(false, Ordering::Release);
    })
    .expect("failed to install signal handler");

    while running.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("[REGISTRYD] shutting down");
    registry.destroy();
}
