// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framed TCP transport.
//!
//! TCP is a stream without message boundaries, so every frame goes on the
//! wire as `flags:u8 | len:u32 (LE) | payload`. `flags` carries the `MORE`
//! continuation bit and a `COMMAND` bit for link-control frames
//! (hello/subscribe/unsubscribe). The first command on every fresh stream is
//! a `HELLO` announcing the sender's socket type and routing id, which is how
//! routers learn peer identities without a probe frame.
//!
//! One thread per connection owns the stream and runs a non-blocking
//! read/write loop: it drains the peer's outbound queue, flushes, reads and
//! reassembles inbound frames, and delivers complete messages to the owning
//! socket. Outbound (connected) links reconnect with a 100 ms backoff until
//! their peer entry is dropped.

use super::endpoint::Endpoint;
use super::{Msg, SocketCore, WireOut};
use crate::routing_id::RoutingId;
use crate::{util, Error, Result};
use crossbeam::channel::{Receiver, TryRecvError};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Frame header size: flags byte + little-endian length.
const FRAME_HEADER_SIZE: usize = 5;

/// Anti-OOM cap on a single frame.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Continuation bit: more frames follow in this message.
const FLAG_MORE: u8 = 0x01;
/// Link-control frame (hello / subscription), not application data.
const FLAG_COMMAND: u8 = 0x02;

/// Command codes (first payload byte of a command frame).
const CMD_UNSUBSCRIBE: u8 = 0x00;
const CMD_SUBSCRIBE: u8 = 0x01;
const CMD_HELLO: u8 = 0x02;

const HELLO_VERSION: u8 = 1;
const RECONNECT_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const IDLE_SLEEP: Duration = Duration::from_millis(1);
const ACCEPT_SLEEP: Duration = Duration::from_millis(10);

// ============================================================================
// Byte stream (plain or TLS)
// ============================================================================

/// Non-blocking byte stream. `read_some`/`write_some` return `Ok(0)` when the
/// operation would block; EOF surfaces as `UnexpectedEof`.
pub(crate) enum Stream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<super::tls::TlsStream>),
}

impl Stream {
    fn write_some(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => match s.write(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(0),
                Err(e) => Err(e),
            },
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.write_some(buf),
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => match s.read(buf) {
                Ok(0) => Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed",
                )),
                Ok(n) => Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(0),
                Err(e) => Err(e),
            },
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.read_some(buf),
        }
    }
}

// ============================================================================
// Frame codec
// ============================================================================

/// Incremental frame decoder; tolerates arbitrary chunking of the stream.
pub(crate) struct FrameDecoder {
    buffer: Vec<u8>,
}

/// One decoded frame.
pub(crate) struct Frame {
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl FrameDecoder {
    pub(crate) fn new() -> Self {
        FrameDecoder { buffer: Vec::new() }
    }

    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if any. A frame beyond the size cap is a
    /// protocol error.
    pub(crate) fn next_frame(&mut self) -> std::io::Result<Option<Frame>> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let flags = self.buffer[0];
        let len = u32::from_le_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame exceeds size cap",
            ));
        }
        if self.buffer.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }
        let payload = self.buffer[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].to_vec();
        self.buffer.drain(..FRAME_HEADER_SIZE + len);
        Ok(Some(Frame { flags, payload }))
    }
}

pub(crate) fn encode_frame(out: &mut Vec<u8>, flags: u8, payload: &[u8]) {
    out.push(flags);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

fn encode_message(out: &mut Vec<u8>, frames: &[Msg]) {
    for (i, frame) in frames.iter().enumerate() {
        let flags = if i + 1 < frames.len() { FLAG_MORE } else { 0 };
        encode_frame(out, flags, frame.data());
    }
}

fn encode_hello(out: &mut Vec<u8>, kind_code: u8, rid: &RoutingId) {
    let mut payload = Vec::with_capacity(6 + rid.len());
    payload.push(CMD_HELLO);
    payload.push(b'W');
    payload.push(b'F');
    payload.push(HELLO_VERSION);
    payload.push(kind_code);
    payload.push(rid.len() as u8);
    payload.extend_from_slice(rid.as_bytes());
    encode_frame(out, FLAG_COMMAND, &payload);
}

/// Parse a HELLO payload; returns the announced routing id.
fn parse_hello(payload: &[u8]) -> Option<RoutingId> {
    if payload.len() < 6 || payload[0] != CMD_HELLO {
        return None;
    }
    if payload[1] != b'W' || payload[2] != b'F' || payload[3] != HELLO_VERSION {
        return None;
    }
    let rid_len = payload[5] as usize;
    if payload.len() != 6 + rid_len {
        return None;
    }
    RoutingId::from_bytes(&payload[6..])
}

fn resolve_addr(host: &str, port: &str) -> Result<SocketAddr> {
    let addr = Endpoint::tcp_bind_addr(host, port);
    addr.to_socket_addrs()
        .map_err(Error::Io)?
        .next()
        .ok_or(Error::InvalidArgument("unresolvable tcp endpoint"))
}

// ============================================================================
// Listener
// ============================================================================

/// Bind a listener and spawn its accept thread. Returns the bound address
/// (with any wildcard port resolved).
pub(crate) fn start_listener(
    core: Weak<SocketCore>,
    host: &str,
    port: &str,
    shutdown: &Arc<AtomicBool>,
) -> Result<SocketAddr> {
    let addr = resolve_addr(host, port)?;
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(Error::Io)?;
    socket.set_reuse_address(true).map_err(Error::Io)?;
    socket.bind(&addr.into()).map_err(Error::Io)?;
    socket.listen(128).map_err(Error::Io)?;
    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true).map_err(Error::Io)?;
    let bound = listener.local_addr().map_err(Error::Io)?;

    let shutdown = Arc::clone(shutdown);
    std::thread::Builder::new()
        .name("weft-listener".to_string())
        .spawn(move || accept_loop(core, listener, shutdown))
        .map_err(Error::Io)?;
    Ok(bound)
}

fn accept_loop(core: Weak<SocketCore>, listener: TcpListener, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let alive = match core.upgrade() {
            Some(c) if !c.is_closed() => true,
            _ => false,
        };
        if !alive {
            return;
        }
        match listener.accept() {
            Ok((stream, remote)) => {
                if util::debug_enabled() {
                    log::debug!("[TCP] accepted connection from {}", remote);
                }
                let core = core.clone();
                let spawn = std::thread::Builder::new()
                    .name("weft-conn".to_string())
                    .spawn(move || inbound_connection(core, stream));
                if let Err(e) = spawn {
                    log::debug!("[TCP] failed to spawn connection thread: {}", e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_SLEEP);
            }
            Err(e) => {
                log::debug!("[TCP] accept failed: {}", e);
                std::thread::sleep(ACCEPT_SLEEP);
            }
        }
    }
}

// ============================================================================
// Connection threads
// ============================================================================

fn prepare_stream(core: &Arc<SocketCore>, stream: TcpStream, server: bool) -> Option<Stream> {
    stream.set_nodelay(true).ok();
    if let Err(e) = stream.set_nonblocking(true) {
        log::debug!("[TCP] set_nonblocking failed: {}", e);
        return None;
    }
    let tls = core.tls_snapshot();
    if server && tls.server_configured() {
        #[cfg(feature = "tls")]
        {
            return match super::tls::server_stream(stream, &tls) {
                Ok(s) => Some(Stream::Tls(Box::new(s))),
                Err(e) => {
                    log::debug!("[TCP] TLS server setup failed: {}", e);
                    None
                }
            };
        }
        #[cfg(not(feature = "tls"))]
        {
            log::debug!("[TCP] TLS material configured but feature disabled");
            return None;
        }
    }
    if !server && tls.client_configured() {
        #[cfg(feature = "tls")]
        {
            return match super::tls::client_stream(stream, &tls) {
                Ok(s) => Some(Stream::Tls(Box::new(s))),
                Err(e) => {
                    log::debug!("[TCP] TLS client setup failed: {}", e);
                    None
                }
            };
        }
        #[cfg(not(feature = "tls"))]
        {
            log::debug!("[TCP] TLS material configured but feature disabled");
            return None;
        }
    }
    Some(Stream::Plain(stream))
}

/// Handle a stream accepted by a listener: wait for the peer's HELLO,
/// register it, then run the shared IO loop.
fn inbound_connection(core: Weak<SocketCore>, stream: TcpStream) {
    let strong = match core.upgrade() {
        Some(c) => c,
        None => return,
    };
    let mut stream = match prepare_stream(&strong, stream, true) {
        Some(s) => s,
        None => return,
    };

    let mut io = ConnIo::new();
    let (kind, rid) = strong.announce();
    encode_hello(&mut io.outbuf, kind.wire_code(), &rid);
    push_sub_replay(&strong, &mut io.outbuf);
    drop(strong);

    let (tx, rx) = crossbeam::channel::unbounded();
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut token: Option<u64> = None;

    'conn: loop {
        let strong = match core.upgrade() {
            Some(c) if !c.is_closed() => c,
            _ => break,
        };
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        if let Some(t) = token {
            if !strong.peer_alive(t) {
                break;
            }
        }

        let mut busy = false;
        if token.is_some() {
            busy |= io.drain_outbound(&rx);
        }
        match io.pump(&mut stream) {
            Ok(activity) => busy |= activity,
            Err(_) => break,
        }
        while let Some(frame) = match io.decoder.next_frame() {
            Ok(f) => f,
            Err(e) => {
                log::debug!("[TCP] protocol error: {}", e);
                break 'conn;
            }
        } {
            busy = true;
            if frame.flags & FLAG_COMMAND != 0 {
                if frame.payload.first() == Some(&CMD_HELLO) {
                    if token.is_none() {
                        let remote_rid =
                            parse_hello(&frame.payload).unwrap_or_else(RoutingId::empty);
                        token = strong.register_tcp_inbound(
                            remote_rid,
                            tx.clone(),
                            Arc::clone(&shutdown),
                        );
                        if token.is_none() {
                            break 'conn;
                        }
                    }
                } else if let Some(t) = token {
                    strong.handle_command(t, &frame.payload);
                }
            } else if let Some(t) = token {
                io.frames.push(Msg::from(frame.payload));
                if frame.flags & FLAG_MORE == 0 {
                    strong.deliver(t, std::mem::take(&mut io.frames));
                }
            }
        }
        drop(strong);
        if !busy {
            std::thread::sleep(IDLE_SLEEP);
        }
    }

    if let (Some(t), Some(strong)) = (token, core.upgrade()) {
        strong.remove_peer(t);
    }
}

/// Spawn the connecter thread for an outbound peer created by `connect`.
pub(crate) fn start_connecter(
    core: Weak<SocketCore>,
    token: u64,
    host: String,
    port: String,
    rx: Receiver<WireOut>,
    shutdown: Arc<AtomicBool>,
) {
    let spawn = std::thread::Builder::new()
        .name("weft-connecter".to_string())
        .spawn(move || outbound_connection(core, token, host, port, rx, shutdown));
    if let Err(e) = spawn {
        log::debug!("[TCP] failed to spawn connecter thread: {}", e);
    }
}

fn outbound_connection(
    core: Weak<SocketCore>,
    token: u64,
    host: String,
    port: String,
    rx: Receiver<WireOut>,
    shutdown: Arc<AtomicBool>,
) {
    'reconnect: loop {
        // Establish (or re-establish) the stream.
        let mut stream = loop {
            let strong = match core.upgrade() {
                Some(c) if !c.is_closed() => c,
                _ => return,
            };
            if shutdown.load(Ordering::Acquire) || !strong.peer_alive(token) {
                return;
            }
            let attempt = resolve_addr(&host, &port)
                .ok()
                .and_then(|addr| TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).ok())
                .and_then(|s| prepare_stream(&strong, s, false));
            drop(strong);
            match attempt {
                Some(s) => break s,
                None => std::thread::sleep(RECONNECT_INTERVAL),
            }
        };

        let mut io = ConnIo::new();
        {
            let strong = match core.upgrade() {
                Some(c) => c,
                None => return,
            };
            let (kind, rid) = strong.announce();
            encode_hello(&mut io.outbuf, kind.wire_code(), &rid);
            push_sub_replay(&strong, &mut io.outbuf);
        }

        loop {
            let strong = match core.upgrade() {
                Some(c) if !c.is_closed() => c,
                _ => return,
            };
            if shutdown.load(Ordering::Acquire) || !strong.peer_alive(token) {
                return;
            }

            let mut busy = io.drain_outbound(&rx);
            match io.pump(&mut stream) {
                Ok(activity) => busy |= activity,
                Err(_) => {
                    // Link lost: retry while the peer entry survives.
                    drop(strong);
                    std::thread::sleep(RECONNECT_INTERVAL);
                    continue 'reconnect;
                }
            }
            while let Some(frame) = match io.decoder.next_frame() {
                Ok(f) => f,
                Err(e) => {
                    log::debug!("[TCP] protocol error: {}", e);
                    drop(strong);
                    std::thread::sleep(RECONNECT_INTERVAL);
                    continue 'reconnect;
                }
            } {
                busy = true;
                if frame.flags & FLAG_COMMAND != 0 {
                    if frame.payload.first() == Some(&CMD_HELLO) {
                        if let Some(rid) = parse_hello(&frame.payload) {
                            strong.confirm_tcp_peer(token, rid);
                        }
                    } else {
                        strong.handle_command(token, &frame.payload);
                    }
                } else {
                    io.frames.push(Msg::from(frame.payload));
                    if frame.flags & FLAG_MORE == 0 {
                        strong.deliver(token, std::mem::take(&mut io.frames));
                    }
                }
            }
            drop(strong);
            if !busy {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
    }
}

/// Queue the socket's current subscriptions on a fresh link (SUB sockets).
fn push_sub_replay(core: &Arc<SocketCore>, outbuf: &mut Vec<u8>) {
    for prefix in core.sub_snapshot() {
        let mut payload = Vec::with_capacity(prefix.len() + 1);
        payload.push(CMD_SUBSCRIBE);
        payload.extend_from_slice(&prefix);
        encode_frame(outbuf, FLAG_COMMAND, &payload);
    }
    // CMD_UNSUBSCRIBE is only ever sent live, never replayed.
    let _ = CMD_UNSUBSCRIBE;
}

/// Per-connection IO state: pending outbound bytes, inbound decoder, and the
/// partially-assembled inbound message.
struct ConnIo {
    outbuf: Vec<u8>,
    out_pos: usize,
    decoder: FrameDecoder,
    frames: Vec<Msg>,
}

impl ConnIo {
    fn new() -> Self {
        ConnIo {
            outbuf: Vec::new(),
            out_pos: 0,
            decoder: FrameDecoder::new(),
            frames: Vec::new(),
        }
    }

    /// Encode everything queued by the application. Returns true if anything
    /// was taken.
    fn drain_outbound(&mut self, rx: &Receiver<WireOut>) -> bool {
        let mut any = false;
        loop {
            match rx.try_recv() {
                Ok(WireOut::Message(frames)) => {
                    encode_message(&mut self.outbuf, &frames);
                    any = true;
                }
                Ok(WireOut::Command(payload)) => {
                    encode_frame(&mut self.outbuf, FLAG_COMMAND, &payload);
                    any = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        any
    }

    /// Flush pending output and read available input. Returns whether any
    /// bytes moved; `Err` means the link is gone.
    fn pump(&mut self, stream: &mut Stream) -> std::io::Result<bool> {
        let mut moved = false;
        while self.out_pos < self.outbuf.len() {
            let n = stream.write_some(&self.outbuf[self.out_pos..])?;
            if n == 0 {
                break;
            }
            self.out_pos += n;
            moved = true;
        }
        if self.out_pos == self.outbuf.len() && !self.outbuf.is_empty() {
            self.outbuf.clear();
            self.out_pos = 0;
        }

        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = stream.read_some(&mut buf)?;
            if n == 0 {
                break;
            }
            self.decoder.feed(&buf[..n]);
            moved = true;
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_decoder_chunked() {
        let mut out = Vec::new();
        encode_frame(&mut out, FLAG_MORE, b"abc");
        encode_frame(&mut out, 0, b"");

        let mut dec = FrameDecoder::new();
        // Feed byte by byte; frames must come out whole.
        let mut frames = Vec::new();
        for b in &out {
            dec.feed(&[*b]);
            while let Some(f) = dec.next_frame().unwrap() {
                frames.push(f);
            }
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].flags, FLAG_MORE);
        assert_eq!(frames[0].payload, b"abc");
        assert_eq!(frames[1].payload, b"");
    }

    #[test]
    fn test_frame_decoder_size_cap() {
        let mut dec = FrameDecoder::new();
        let mut header = vec![0u8];
        header.extend_from_slice(&(u32::MAX).to_le_bytes());
        dec.feed(&header);
        assert!(dec.next_frame().is_err());
    }

    #[test]
    fn test_hello_roundtrip() {
        let rid = RoutingId::from_bytes(b"PROV1").unwrap();
        let mut out = Vec::new();
        encode_hello(&mut out, 5, &rid);

        let mut dec = FrameDecoder::new();
        dec.feed(&out);
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.flags & FLAG_COMMAND, FLAG_COMMAND);
        let parsed = parse_hello(&frame.payload).unwrap();
        assert_eq!(parsed.as_bytes(), b"PROV1");
    }

    #[test]
    fn test_hello_rejects_garbage() {
        assert!(parse_hello(b"").is_none());
        assert!(parse_hello(&[CMD_HELLO, b'X', b'F', 1, 0, 0]).is_none());
        assert!(parse_hello(&[CMD_HELLO, b'W', b'F', 9, 0, 0]).is_none());
        // Length mismatch between declared and actual rid.
        assert!(parse_hello(&[CMD_HELLO, b'W', b'F', 1, 0, 5, 1, 2]).is_none());
    }

    #[test]
    fn test_resolve_addr() {
        let addr = resolve_addr("127.0.0.1", "0").unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert!(resolve_addr("", "x").is_err());
    }
}
