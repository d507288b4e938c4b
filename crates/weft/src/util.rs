// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Small shared utilities: monotonic millisecond clock, debug trace toggle.

use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds since an arbitrary process-local origin.
///
/// Monotonic and cheap; suitable for interval arithmetic (heartbeats,
/// broadcast schedules, expiry) but not for wall-clock display.
pub fn now_ms() -> u64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_millis() as u64
}

/// Whether `WEFT_DEBUG` is set (checked once per process).
///
/// Gates the expensive frame/peer traces so the hot paths stay cheap when
/// tracing is off. Never changes functional behavior.
pub fn debug_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var("WEFT_DEBUG")
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    })
}

/// Render a byte slice as lowercase hex for trace output.
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
