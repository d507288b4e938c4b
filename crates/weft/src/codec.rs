// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery wire codec.
//!
//! Pure helpers over socket frames. All integers are little-endian and
//! fixed-width; strings are raw bytes whose length is the enclosing frame's
//! size (no terminator, empty frame for the empty string); routing ids are
//! their bytes verbatim with a 255-byte cap.
//!
//! A message is a sequence of frames with `MORE` on all but the last:
//!
//! ```text
//! msg_id:u16 | payload…
//! ```
//!
//! Message ids and per-op payloads are in [`msg_id`] and the registry
//! documentation; `SERVICE_LIST`/`REGISTRY_SYNC` share the layout
//!
//! ```text
//! registry_id:u32 | list_seq:u64 | n_services:u32 |
//!   { service | n_providers:u32 | { endpoint | routing_id | weight:u32 }* }*
//! ```

use crate::routing_id::RoutingId;
use crate::socket::{Msg, Socket};
use crate::Result;

/// Discovery protocol message ids.
pub mod msg_id {
    /// Provider → registry: announce a provider.
    pub const REGISTER: u16 = 0x0001;
    /// Registry → provider: registration outcome.
    pub const REGISTER_ACK: u16 = 0x0002;
    /// Provider → registry: withdraw a provider.
    pub const UNREGISTER: u16 = 0x0003;
    /// Provider → registry: liveness refresh.
    pub const HEARTBEAT: u16 = 0x0004;
    /// Registry → subscribers: full directory snapshot.
    pub const SERVICE_LIST: u16 = 0x0005;
    /// Registry → peer registries: gossip, same layout as `SERVICE_LIST`.
    pub const REGISTRY_SYNC: u16 = 0x0006;
    /// Provider → registry: change a provider's weight.
    pub const UPDATE_WEIGHT: u16 = 0x0007;
}

// ============================================================================
// Send helpers (stage one frame each; `more` maps to the MORE wire bit)
// ============================================================================

/// Send a fixed-width little-endian `u16` frame.
pub fn send_u16(sock: &Socket, value: u16, more: bool) -> Result<()> {
    sock.send(Msg::from(value.to_le_bytes().to_vec()), more)
}

/// Send a fixed-width little-endian `u32` frame.
pub fn send_u32(sock: &Socket, value: u32, more: bool) -> Result<()> {
    sock.send(Msg::from(value.to_le_bytes().to_vec()), more)
}

/// Send a fixed-width little-endian `u64` frame.
pub fn send_u64(sock: &Socket, value: u64, more: bool) -> Result<()> {
    sock.send(Msg::from(value.to_le_bytes().to_vec()), more)
}

/// Send a string frame: raw bytes, no terminator, empty payload for "".
pub fn send_string(sock: &Socket, value: &str, more: bool) -> Result<()> {
    sock.send(Msg::from(value.as_bytes()), more)
}

/// Send a status byte frame.
pub fn send_u8(sock: &Socket, value: u8, more: bool) -> Result<()> {
    sock.send(Msg::from(vec![value]), more)
}

/// Send a routing id frame: id bytes verbatim (empty frame when absent).
pub fn send_routing_id(sock: &Socket, rid: &RoutingId, more: bool) -> Result<()> {
    sock.send(Msg::from(rid.as_bytes()), more)
}

// ============================================================================
// Read helpers (frame-exact; absent on any size mismatch)
// ============================================================================

/// Read a `u16`; `None` unless the frame is exactly two bytes.
pub fn read_u16(msg: &Msg) -> Option<u16> {
    let bytes: [u8; 2] = msg.data().try_into().ok()?;
    Some(u16::from_le_bytes(bytes))
}

/// Read a `u32`; `None` unless the frame is exactly four bytes.
pub fn read_u32(msg: &Msg) -> Option<u32> {
    let bytes: [u8; 4] = msg.data().try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Read a `u64`; `None` unless the frame is exactly eight bytes.
pub fn read_u64(msg: &Msg) -> Option<u64> {
    let bytes: [u8; 8] = msg.data().try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Read a status byte; `None` unless the frame is exactly one byte.
pub fn read_u8(msg: &Msg) -> Option<u8> {
    let bytes: [u8; 1] = msg.data().try_into().ok()?;
    Some(bytes[0])
}

/// Read a string frame (raw bytes; invalid UTF-8 is replaced).
pub fn read_string(msg: &Msg) -> String {
    String::from_utf8_lossy(msg.data()).into_owned()
}

/// Read a routing id frame; `None` beyond the 255-byte cap.
pub fn read_routing_id(msg: &Msg) -> Option<RoutingId> {
    RoutingId::from_bytes(msg.data())
}

// ============================================================================
// SERVICE_LIST / REGISTRY_SYNC payload
// ============================================================================

/// One provider row of a directory snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRow {
    pub endpoint: String,
    pub routing_id: RoutingId,
    pub weight: u32,
}

/// A decoded `SERVICE_LIST`/`REGISTRY_SYNC` message.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceListMsg {
    pub msg_id: u16,
    pub registry_id: u32,
    pub list_seq: u64,
    pub services: Vec<(String, Vec<ProviderRow>)>,
}

impl ServiceListMsg {
    /// Encode into frames ready for one atomic multi-part send.
    pub fn encode(&self) -> Vec<Msg> {
        let mut frames = Vec::new();
        frames.push(Msg::from(self.msg_id.to_le_bytes().to_vec()));
        frames.push(Msg::from(self.registry_id.to_le_bytes().to_vec()));
        frames.push(Msg::from(self.list_seq.to_le_bytes().to_vec()));
        frames.push(Msg::from((self.services.len() as u32).to_le_bytes().to_vec()));
        for (service, providers) in &self.services {
            frames.push(Msg::from(service.as_str()));
            frames.push(Msg::from((providers.len() as u32).to_le_bytes().to_vec()));
            for row in providers {
                frames.push(Msg::from(row.endpoint.as_str()));
                frames.push(Msg::from(row.routing_id.as_bytes()));
                frames.push(Msg::from(row.weight.to_le_bytes().to_vec()));
            }
        }
        frames
    }

    /// Decode a frame sequence. `None` on any structural violation; trailing
    /// garbage after a well-formed payload is tolerated (and ignored) the way
    /// the wire's receivers tolerate over-long messages.
    pub fn decode(frames: &[Msg]) -> Option<ServiceListMsg> {
        if frames.len() < 4 {
            return None;
        }
        let id = read_u16(&frames[0])?;
        if id != msg_id::SERVICE_LIST && id != msg_id::REGISTRY_SYNC {
            return None;
        }
        let registry_id = read_u32(&frames[1])?;
        let list_seq = read_u64(&frames[2])?;
        let n_services = read_u32(&frames[3])?;

        let mut services = Vec::new();
        let mut index = 4usize;
        for _ in 0..n_services {
            if index + 1 >= frames.len() {
                break;
            }
            let service = read_string(&frames[index]);
            index += 1;
            let n_providers = read_u32(&frames[index])?;
            index += 1;
            let mut providers = Vec::new();
            for _ in 0..n_providers {
                if index + 3 > frames.len() {
                    break;
                }
                let endpoint = read_string(&frames[index]);
                let routing_id = read_routing_id(&frames[index + 1]).unwrap_or_default();
                let weight = read_u32(&frames[index + 2]).unwrap_or(1);
                index += 3;
                if endpoint.is_empty() {
                    continue;
                }
                providers.push(ProviderRow {
                    endpoint,
                    routing_id,
                    weight: weight.max(1),
                });
            }
            services.push((service, providers));
        }
        Some(ServiceListMsg {
            msg_id: id,
            registry_id,
            list_seq,
            services,
        })
    }
}
