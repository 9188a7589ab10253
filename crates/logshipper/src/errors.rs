// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for peer configuration, discovery, dialing and delivery.

use std::time::Duration;

/// Fatal errors raised while building a shipper. Nothing is started when one is returned.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported peer format {0:?}: expected host, host:port or scheme://host[:port]")]
    UnsupportedFormat(String),

    #[error("peer {spec:?} has an invalid port {port:?}")]
    InvalidPort { spec: String, port: String },

    #[error("peer {0:?} has an empty host")]
    EmptyHost(String),

    #[error("at least one peer is required")]
    NoPeers,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// DNS lookup failure for a discovery-tagged peer. Transient.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("lookup of {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("lookup of {0} returned no records")]
    NoRecords(String),

    #[error("reverse lookup requires an IP address, got {0}")]
    NotAnAddress(String),

    #[error("lookup of {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },
}

/// Connection establishment failure. Transient.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("dial {network} {addr}: {source}")]
    Io {
        network: String,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported network {0:?}")]
    UnsupportedNetwork(String),

    #[error("dial {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
}

/// Failure while writing a record that has already left the buffer.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}
