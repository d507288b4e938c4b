// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint string parsing.
//!
//! Two transports: `inproc://name` for in-process pipes and
//! `tcp://host:port` for framed TCP streams. TCP binds accept `*` or
//! `0.0.0.0` as the host and `*` or `0` as the port (ephemeral).

use crate::{Error, Result};

/// Parsed endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Endpoint {
    /// In-process pipe, keyed by name within one `Context`.
    Inproc(String),
    /// TCP host and port, both still textual (port may be `*`).
    Tcp { host: String, port: String },
}

impl Endpoint {
    pub(crate) fn parse(endpoint: &str) -> Result<Endpoint> {
        if let Some(name) = endpoint.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(Error::InvalidArgument("empty inproc name"));
            }
            return Ok(Endpoint::Inproc(name.to_string()));
        }
        if let Some(addr) = endpoint.strip_prefix("tcp://") {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or(Error::InvalidArgument("tcp endpoint missing port"))?;
            if host.is_empty() || port.is_empty() {
                return Err(Error::InvalidArgument("tcp endpoint missing host or port"));
            }
            if port != "*" && port.parse::<u16>().is_err() {
                return Err(Error::InvalidArgument("tcp endpoint port not numeric"));
            }
            return Ok(Endpoint::Tcp {
                host: host.to_string(),
                port: port.to_string(),
            });
        }
        Err(Error::InvalidArgument("unknown transport"))
    }

    /// Bind address for a TCP endpoint (`*` host maps to all interfaces,
    /// `*`/`0` port to an ephemeral one).
    pub(crate) fn tcp_bind_addr(host: &str, port: &str) -> String {
        let host = if host == "*" { "0.0.0.0" } else { host };
        let port = if port == "*" { "0" } else { port };
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inproc() {
        assert_eq!(
            Endpoint::parse("inproc://reg-pub").unwrap(),
            Endpoint::Inproc("reg-pub".into())
        );
        assert!(Endpoint::parse("inproc://").is_err());
    }

    #[test]
    fn test_parse_tcp() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:5555").unwrap(),
            Endpoint::Tcp {
                host: "127.0.0.1".into(),
                port: "5555".into()
            }
        );
        assert_eq!(
            Endpoint::parse("tcp://*:*").unwrap(),
            Endpoint::Tcp {
                host: "*".into(),
                port: "*".into()
            }
        );
    }

    #[test]
    fn test_parse_rejects() {
        assert!(Endpoint::parse("tcp://nohost").is_err());
        assert!(Endpoint::parse("tcp://:5555").is_err());
        assert!(Endpoint::parse("tcp://host:").is_err());
        assert!(Endpoint::parse("tcp://host:abc").is_err());
        assert!(Endpoint::parse("ipc:///tmp/x").is_err());
        assert!(Endpoint::parse("").is_err());
    }

    #[test]
    fn test_bind_addr_wildcards() {
        assert_eq!(Endpoint::tcp_bind_addr("*", "*"), "0.0.0.0:0");
        assert_eq!(Endpoint::tcp_bind_addr("127.0.0.1", "7000"), "127.0.0.1:7000");
    }
}
