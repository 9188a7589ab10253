// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! DNS discovery for peers whose network carries a discovery suffix.
//!
//! | suffix            | lookup              | resulting host        |
//! |-------------------|---------------------|-----------------------|
//! | `dns`, `dnsip`    | A/AAAA of the host  | one of the addresses  |
//! | `dnssrv`          | SRV of the host     | one of the targets    |
//! | `dnsaddr`         | PTR of the host IP  | one of the names      |
//!
//! SRV queries use the base network as the protocol label unless the host
//! already carries `_service._proto` labels. The choice among answers is
//! uniformly random and the configured port is always kept: SRV ports are
//! ignored. Any other suffix is dropped with an
//! info log and the peer is dialed as configured.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use tokio::sync::OnceCell;
use tracing::info;

use crate::address::PeerAddr;
use crate::errors::DiscoveryError;

/// DNS lookups used by discovery.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// A/AAAA lookup.
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, DiscoveryError>;

    /// SRV lookup, returning record targets.
    async fn lookup_srv(&self, name: &str) -> Result<Vec<String>, DiscoveryError>;

    /// Reverse lookup, returning PTR names.
    async fn lookup_addr(&self, ip: IpAddr) -> Result<Vec<String>, DiscoveryError>;
}

/// Resolver backed by the system resolver configuration.
///
/// The underlying resolver is built on first use so that constructing a
/// shipper never touches `/etc/resolv.conf`.
#[derive(Default)]
pub struct SystemResolver {
    inner: OnceCell<TokioAsyncResolver>,
}

impl SystemResolver {
    #[must_use]
    pub fn new() -> Self {
        SystemResolver::default()
    }

    async fn resolver(&self, host: &str) -> Result<&TokioAsyncResolver, DiscoveryError> {
        self.inner
            .get_or_try_init(|| async { TokioAsyncResolver::tokio_from_system_conf() })
            .await
            .map_err(|e| DiscoveryError::Lookup {
                host: host.to_string(),
                source: Box::new(e),
            })
    }
}

fn lookup_error(host: &str, e: hickory_resolver::error::ResolveError) -> DiscoveryError {
    DiscoveryError::Lookup {
        host: host.to_string(),
        source: Box::new(e),
    }
}

fn trim_root(name: String) -> String {
    match name.strip_suffix('.') {
        Some(trimmed) => trimmed.to_string(),
        None => name,
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, DiscoveryError> {
        let lookup = self
            .resolver(host)
            .await?
            .lookup_ip(host)
            .await
            .map_err(|e| lookup_error(host, e))?;
        Ok(lookup.iter().collect())
    }

    async fn lookup_srv(&self, name: &str) -> Result<Vec<String>, DiscoveryError> {
        let lookup = self
            .resolver(name)
            .await?
            .srv_lookup(name)
            .await
            .map_err(|e| lookup_error(name, e))?;
        Ok(lookup
            .iter()
            .map(|srv| trim_root(srv.target().to_string()))
            .collect())
    }

    async fn lookup_addr(&self, ip: IpAddr) -> Result<Vec<String>, DiscoveryError> {
        let host = ip.to_string();
        let lookup = self
            .resolver(&host)
            .await?
            .reverse_lookup(ip)
            .await
            .map_err(|e| lookup_error(&host, e))?;
        Ok(lookup
            .iter()
            .map(|name| trim_root(name.to_string()))
            .collect())
    }
}

fn pick<T: Clone>(answers: &[T], host: &str) -> Result<T, DiscoveryError> {
    if answers.is_empty() {
        return Err(DiscoveryError::NoRecords(host.to_string()));
    }
    Ok(answers[fastrand::usize(..answers.len())].clone())
}

/// SRV owner name for `host` over `network`.
///
/// Hosts already spelled with leading `_` labels (`_logs._tcp.example.com`)
/// are queried as written. Otherwise the name takes the empty-service form
/// `_._tcp.host`, with the address family dropped from the protocol.
fn srv_name(network: &str, host: &str) -> String {
    if host.starts_with('_') {
        return host.to_string();
    }
    let proto = network.trim_end_matches(['4', '6']);
    format!("_._{proto}.{host}")
}

/// Resolves the discovery suffix of `target`, if any, into a dialable peer.
///
/// Targets without a suffix are returned unchanged and no lookup happens.
pub async fn resolve(
    resolver: &dyn Resolver,
    target: &PeerAddr,
    timeout: Duration,
) -> Result<PeerAddr, DiscoveryError> {
    let Some(suffix) = target.discovery_suffix() else {
        return Ok(target.clone());
    };

    match tokio::time::timeout(timeout, lookup(resolver, target, suffix)).await {
        Ok(resolved) => resolved,
        Err(_) => Err(DiscoveryError::Timeout {
            host: target.host.clone(),
            timeout,
        }),
    }
}

async fn lookup(
    resolver: &dyn Resolver,
    target: &PeerAddr,
    suffix: &str,
) -> Result<PeerAddr, DiscoveryError> {
    let host = target.host.as_str();
    match suffix {
        "dns" | "dnsip" => {
            let ip = pick(&resolver.lookup_ip(host).await?, host)?;
            Ok(target.resolved_to(ip.to_string()))
        }
        "dnssrv" => {
            let query = srv_name(target.base_network(), host);
            let name = pick(&resolver.lookup_srv(&query).await?, &query)?;
            Ok(target.resolved_to(name))
        }
        "dnsaddr" => {
            let ip: IpAddr = host
                .parse()
                .map_err(|_| DiscoveryError::NotAnAddress(host.to_string()))?;
            let name = pick(&resolver.lookup_addr(ip).await?, host)?;
            Ok(target.resolved_to(name))
        }
        unsupported => {
            info!(suffix = unsupported, peer = %target, "unsupported discovery suffix, dialing as configured");
            Ok(target.resolved_to(host))
        }
    }
}
