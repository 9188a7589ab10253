// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Peer specification parsing.
//!
//! A peer is configured as one of:
//!
//! - `host`: tcp, default port
//! - `host:port`: tcp
//! - `scheme://host`: default port
//! - `scheme://host:port`
//!
//! The scheme is the network to dial. It may carry a discovery suffix
//! (`tcp+dnssrv`, `udp+dns`, ...) which is resolved by [`crate::discovery`]
//! before every dial.

use std::fmt;
use std::net::Ipv6Addr;

use crate::errors::ConfigError;

/// Port used when a peer spec does not name one.
pub const DEFAULT_PORT: u16 = 7651;

const DEFAULT_NETWORK: &str = "tcp";

/// A parsed peer: network (possibly discovery-tagged), host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub network: String,
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    /// Parses a peer spec, applying `default_port` when the spec has none.
    ///
    /// Parsing is case-insensitive: the whole spec is lowercased first.
    ///
    /// # Examples
    ///
    /// ```
    /// use logshipper::address::PeerAddr;
    ///
    /// let peer = PeerAddr::parse("udp://Collector", 7651).unwrap();
    /// assert_eq!(peer.network, "udp");
    /// assert_eq!(peer.host_port(), "collector:7651");
    ///
    /// assert!(PeerAddr::parse("tcp://collector/path", 7651).is_err());
    /// ```
    pub fn parse(spec: &str, default_port: u16) -> Result<Self, ConfigError> {
        let lowered = spec.trim().to_lowercase();

        let (network, authority) = match lowered.split_once("://") {
            Some((scheme, rest)) => {
                if !is_valid_scheme(scheme) {
                    return Err(ConfigError::UnsupportedFormat(spec.to_string()));
                }
                (scheme.to_string(), rest)
            }
            None => (DEFAULT_NETWORK.to_string(), lowered.as_str()),
        };

        // anything beyond host[:port] (path, query, userinfo) is not a peer
        if authority.contains(['/', '?', '#', '@']) || authority.contains(char::is_whitespace) {
            return Err(ConfigError::UnsupportedFormat(spec.to_string()));
        }

        let (host, port) = split_host_port(spec, authority, default_port)?;
        Ok(PeerAddr {
            network,
            host,
            port,
        })
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Network without any discovery suffix (`tcp` for `tcp+dnssrv`).
    pub fn base_network(&self) -> &str {
        match self.network.split_once('+') {
            Some((base, _)) => base,
            None => &self.network,
        }
    }

    /// Discovery suffix of the network, if any (`dnssrv` for `tcp+dnssrv`).
    pub fn discovery_suffix(&self) -> Option<&str> {
        self.network.split_once('+').map(|(_, suffix)| suffix)
    }

    /// Same port, new host, discovery suffix dropped.
    pub fn resolved_to(&self, host: impl Into<String>) -> PeerAddr {
        PeerAddr {
            network: self.base_network().to_string(),
            host: host.into(),
            port: self.port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.host_port())
    }
}

fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        _ => false,
    }
}

fn split_host_port(
    spec: &str,
    authority: &str,
    default_port: u16,
) -> Result<(String, u16), ConfigError> {
    let unsupported = || ConfigError::UnsupportedFormat(spec.to_string());

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']').ok_or_else(unsupported)?;
        if host.parse::<Ipv6Addr>().is_err() {
            return Err(unsupported());
        }
        let port = match after {
            "" => default_port,
            _ => parse_port(spec, after.strip_prefix(':').ok_or_else(unsupported)?)?,
        };
        (host, port)
    } else {
        match authority.matches(':').count() {
            0 => (authority, default_port),
            1 => {
                let (host, port) = authority.split_once(':').ok_or_else(unsupported)?;
                (host, parse_port(spec, port)?)
            }
            // bare IPv6 literal, no room for a port
            _ if authority.parse::<Ipv6Addr>().is_ok() => (authority, default_port),
            _ => return Err(unsupported()),
        }
    };

    if host.is_empty() {
        return Err(ConfigError::EmptyHost(spec.to_string()));
    }
    Ok((host.to_string(), port))
}

fn parse_port(spec: &str, port: &str) -> Result<u16, ConfigError> {
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(ConfigError::InvalidPort {
            spec: spec.to_string(),
            port: port.to_string(),
        }),
    }
}
