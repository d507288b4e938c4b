// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! weft-dump - Dump the live service directory
//!
//! Subscribes to a registry publisher and prints the advertised services and
//! providers, once or continuously.

use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft::{Context, Discovery};

/// Dump the live weft service directory
#[derive(Parser, Debug)]
#[command(name = "weft-dump")]
#[command(version)]
#[command(about = "Dump the service directory of a weft registry")]
struct Args {
    /// Registry publisher endpoint to subscribe to
    #[arg(default_value = "tcp://127.0.0.1:7100")]
    registry: String,

    /// Only show this service
    #[arg(short, long)]
    service: Option<String>,

    /// Seconds to wait for the first broadcast
    #[arg(long, default_value = "5")]
    timeout: u64,

    /// Continuous monitoring mode (refresh every N seconds)
    #[arg(short = 'w', long)]
    watch: Option<u64>,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn dump(discovery: &Discovery, service_filter: Option<&str>) {
    // With no subscriptions everything is tracked; enumerate via a probe of
    // the known services when filtered, otherwise print the whole view.
    let services = match service_filter {
        Some(name) => vec![name.to_string()],
        None => discovery.service_names(),
    };
    if services.is_empty() {
        println!("(no services advertised)");
        return;
    }
    for service in services {
        let providers = discovery.get_providers(&service).unwrap_or_default();
        println!("{}  ({} providers)", service, providers.len());
        for p in providers {
            println!(
                "  {}  rid=0x{}  weight={}",
                p.endpoint,
                hex(p.routing_id.as_bytes()),
                p.weight
            );
        }
    }
}

fn main() {
    env_logger::Builder::from_default_env().init();
    let args = Args::parse();

    let ctx = Context::new();
    let discovery = Discovery::new(&ctx);
    if let Err(e) = discovery.connect_registry(&args.registry) {
        eprintln!("weft-dump: cannot watch {}: {}", args.registry, e);
        std::process::exit(2);
    }

    // Wait for the first broadcast to land.
    let deadline = std::time::Instant::now() + Duration::from_secs(args.timeout.max(1));
    while std::time::Instant::now() < deadline {
        if !discovery.service_names().is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    match args.watch {
        None => dump(&discovery, args.service.as_deref()),
        Some(period) => {
            let running = Arc::new(AtomicBool::new(true));
            let flag = Arc::clone(&running);
            ctrlc::set_handler(move || flag.store(false, Ordering::Release))
                .expect("failed to install signal handler");
            while running.load(Ordering::Acquire) {
                print!("\x1b[2J\x1b[H");
                dump(&discovery, args.service.as_deref());
                std::thread::sleep(Duration::from_secs(period.max(1)));
            }
        }
    }

    discovery.destroy();
}
