// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-cycle connections to resolved peers.
//!
//! A connection lives for exactly one delivery cycle: it is dialed, used for
//! at most one record, and dropped.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

use crate::address::PeerAddr;
use crate::errors::DialError;

/// Opens connections to resolved peers.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &PeerAddr) -> Result<Connection, DialError>;
}

/// An open connection to one peer.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    /// Connected UDP socket; each record is one datagram.
    Udp(UdpSocket),
    /// In-memory connection that appends into a shared byte vector.
    Memory(MemoryConnection),
}

impl Connection {
    /// Writes `record` and returns how many bytes the peer accepted.
    ///
    /// A return value smaller than `record.len()` means the connection was
    /// closed part way through.
    pub async fn write_record(&mut self, record: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(stream) => {
                let mut written = 0;
                while written < record.len() {
                    match stream.write(&record[written..]).await? {
                        0 => break,
                        n => written += n,
                    }
                }
                stream.flush().await?;
                Ok(written)
            }
            Connection::Udp(socket) => socket.send(record).await,
            Connection::Memory(memory) => memory.write(record),
        }
    }
}

/// Dials real sockets. Supports `tcp`, `tcp4`, `tcp6`, `udp`, `udp4` and `udp6`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetDialer;

#[derive(Clone, Copy)]
enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

impl NetDialer {
    async fn addresses(
        network: &str,
        host_port: &str,
        family: Family,
    ) -> Result<Vec<SocketAddr>, DialError> {
        let io_error = |source| DialError::Io {
            network: network.to_string(),
            addr: host_port.to_string(),
            source,
        };
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(host_port)
            .await
            .map_err(io_error)?
            .filter(|addr| family.accepts(addr))
            .collect();
        if addrs.is_empty() {
            return Err(io_error(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no address of the requested family",
            )));
        }
        Ok(addrs)
    }

    async fn connect_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok(socket)
    }
}

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(&self, target: &PeerAddr) -> Result<Connection, DialError> {
        let network = target.network.as_str();
        let (udp, family) = match network {
            "tcp" => (false, Family::Any),
            "tcp4" => (false, Family::V4),
            "tcp6" => (false, Family::V6),
            "udp" => (true, Family::Any),
            "udp4" => (true, Family::V4),
            "udp6" => (true, Family::V6),
            _ => return Err(DialError::UnsupportedNetwork(target.network.clone())),
        };
        let host_port = target.host_port();

        let mut last_error = None;
        for addr in Self::addresses(network, &host_port, family).await? {
            let attempt = if udp {
                Self::connect_udp(addr).await.map(Connection::Udp)
            } else {
                TcpStream::connect(addr).await.map(Connection::Tcp)
            };
            match attempt {
                Ok(connection) => return Ok(connection),
                Err(e) => last_error = Some(e),
            }
        }

        Err(DialError::Io {
            network: network.to_string(),
            addr: host_port,
            source: last_error
                .unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)),
        })
    }
}

/// Connection half of [`MemoryDialer`].
#[derive(Debug)]
pub struct MemoryConnection {
    received: Arc<Mutex<Vec<u8>>>,
    remaining: Option<usize>,
}

impl MemoryConnection {
    fn write(&mut self, record: &[u8]) -> io::Result<usize> {
        let accepted = match self.remaining {
            Some(remaining) => remaining.min(record.len()),
            None => record.len(),
        };
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= accepted;
        }
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(&record[..accepted]);
        Ok(accepted)
    }
}

/// In-memory sink: every dial succeeds and every write lands in one shared
/// byte vector. Useful for tests and for running the shipper without a
/// network.
#[derive(Debug, Clone, Default)]
pub struct MemoryDialer {
    received: Arc<Mutex<Vec<u8>>>,
    dialed: Arc<Mutex<Vec<PeerAddr>>>,
    write_limit: Option<usize>,
    refuse: bool,
}

impl MemoryDialer {
    #[must_use]
    pub fn new() -> Self {
        MemoryDialer::default()
    }

    /// Each connection accepts at most `limit` bytes, simulating a peer that
    /// hangs up mid-record.
    #[must_use]
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    /// Every dial fails with `ConnectionRefused`.
    #[must_use]
    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    /// Everything written so far, across all connections.
    pub fn received(&self) -> Vec<u8> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every target dialed so far, in order.
    pub fn dialed(&self) -> Vec<PeerAddr> {
        self.dialed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, target: &PeerAddr) -> Result<Connection, DialError> {
        self.dialed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(target.clone());
        if self.refuse {
            return Err(DialError::Io {
                network: target.network.clone(),
                addr: target.host_port(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            });
        }
        Ok(Connection::Memory(MemoryConnection {
            received: Arc::clone(&self.received),
            remaining: self.write_limit,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::DEFAULT_PORT;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn peer(spec: &str) -> PeerAddr {
        PeerAddr::parse(spec, DEFAULT_PORT).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_dial_and_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let mut connection = NetDialer
            .dial(&peer(&format!("tcp4://127.0.0.1:{port}")))
            .await
            .unwrap();
        assert_eq!(connection.write_record(b"hello\n").await.unwrap(), 6);
        drop(connection);

        assert_eq!(accept.await.unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn test_udp_dial_and_write() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut connection = NetDialer
            .dial(&peer(&format!("udp://127.0.0.1:{port}")))
            .await
            .unwrap();
        assert_eq!(connection.write_record(b"datagram\n").await.unwrap(), 9);

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"datagram\n");
    }

    #[tokio::test]
    async fn test_refused_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = NetDialer
            .dial(&peer(&format!("127.0.0.1:{port}")))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Io { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_network() {
        let err = NetDialer.dial(&peer("sctp://host:1")).await.unwrap_err();
        assert!(matches!(err, DialError::UnsupportedNetwork(n) if n == "sctp"));
    }

    #[tokio::test]
    async fn test_family_mismatch() {
        let err = NetDialer.dial(&peer("tcp6://127.0.0.1:1")).await.unwrap_err();
        assert!(matches!(err, DialError::Io { .. }));
    }

    #[tokio::test]
    async fn test_memory_write_limit() {
        let dialer = MemoryDialer::new().with_write_limit(4);
        let mut connection = dialer.dial(&peer("a")).await.unwrap();
        assert_eq!(connection.write_record(b"hello\n").await.unwrap(), 4);
        assert_eq!(dialer.received(), b"hell");
        assert_eq!(dialer.dialed(), vec![peer("a")]);
    }
}
