// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS byte streams for the TCP transport (feature `tls`).
//!
//! Wraps a non-blocking `TcpStream` in a `rustls` connection and exposes the
//! same `read_some`/`write_some` contract the plain stream has: `Ok(0)` when
//! the operation would block, `UnexpectedEof` on link loss. The handshake is
//! driven implicitly by pumping `wants_read`/`wants_write` inside those
//! calls, so the connection loop needs no TLS-specific states.

use super::TlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::OnceLock;

/// Install the ring crypto provider once per process.
fn ensure_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}

fn parse_certs(pem: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = pem.as_bytes();
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid("bad certificate PEM"))?;
    if certs.is_empty() {
        return Err(invalid("no certificates in PEM"));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = pem.as_bytes();
    rustls_pemfile::private_key(&mut reader)
        .map_err(|_| invalid("bad private key PEM"))?
        .ok_or_else(|| invalid("no private key in PEM"))
}

fn server_config(tls: &TlsConfig) -> io::Result<Arc<ServerConfig>> {
    ensure_provider();
    let certs = parse_certs(&tls.cert_pem)?;
    let key = parse_key(&tls.key_pem)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| invalid(&format!("TLS server config: {}", e)))?;
    Ok(Arc::new(config))
}

fn client_config(tls: &TlsConfig) -> io::Result<Arc<ClientConfig>> {
    ensure_provider();
    let mut roots = RootCertStore::empty();
    if tls.trust_system {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    if !tls.ca_pem.is_empty() {
        for cert in parse_certs(&tls.ca_pem)? {
            roots
                .add(cert)
                .map_err(|e| invalid(&format!("TLS CA: {}", e)))?;
        }
    }
    if roots.is_empty() {
        return Err(invalid("no trust anchors configured"));
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Wrap an accepted stream as a TLS server side.
pub(crate) fn server_stream(sock: TcpStream, tls: &TlsConfig) -> io::Result<TlsStream> {
    let config = server_config(tls)?;
    let conn = ServerConnection::new(config)
        .map_err(|e| invalid(&format!("TLS server connection: {}", e)))?;
    Ok(TlsStream {
        sock,
        conn: Connection::Server(conn),
    })
}

/// Wrap a connected stream as a TLS client side, verifying `tls.hostname`.
pub(crate) fn client_stream(sock: TcpStream, tls: &TlsConfig) -> io::Result<TlsStream> {
    if tls.hostname.is_empty() {
        return Err(invalid("TLS hostname required"));
    }
    let config = client_config(tls)?;
    let name = ServerName::try_from(tls.hostname.clone())
        .map_err(|_| invalid("bad TLS hostname"))?;
    let conn = ClientConnection::new(config, name)
        .map_err(|e| invalid(&format!("TLS client connection: {}", e)))?;
    Ok(TlsStream {
        sock,
        conn: Connection::Client(conn),
    })
}

/// Non-blocking TLS stream.
pub(crate) struct TlsStream {
    sock: TcpStream,
    conn: Connection,
}

impl TlsStream {
    /// Move ciphertext toward the socket while rustls has any.
    fn pump_write(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub(crate) fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        self.pump_write()?;
        Ok(n)
    }

    pub(crate) fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Keep the handshake moving in both directions.
        self.pump_write()?;
        if self.conn.wants_read() {
            match self.conn.read_tls(&mut self.sock) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"))
                }
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    self.pump_write()?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        match self.conn.reader().read(buf) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed")),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}
