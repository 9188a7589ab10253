// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The delivery loop: the single background task that drains the buffer.
//!
//! Every cycle runs the same steps against the current head of the peer ring:
//!
//! ```text
//!   select peer ──> resolve ──> dial ──> pop record ──> write
//!        ^             │          │          │            │
//!        │          backoff    backoff   idle sleep   backoff (recover)
//!        │             │          │          │            │
//!        └──── rotate ─┴──────────┴──────────┴────────────┘
//! ```
//!
//! The ring rotates after every cycle, whatever happened in it. Lookup and
//! dial failures cost no record: the buffer is only touched once a
//! connection is open. A record is popped before it is written, so a failed
//! write loses it; [`WriteFailurePolicy`] decides whether the loop carries on
//! or stops for good.
//!
//! Cancellation is observed before each cycle and by every await inside it:
//! lookup, dial, write and sleeps all give way to the cancel token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::address::PeerAddr;
use crate::backoff::Backoff;
use crate::buffer::LineBuffer;
use crate::config::{ShipperConfig, WriteFailurePolicy};
use crate::dialer::{Connection, Dialer, NetDialer};
use crate::discovery::{self, Resolver, SystemResolver};
use crate::errors::{ConfigError, DeliveryError, DialError};
use crate::peers::PeerRing;

/// Outcome of one delivery cycle.
#[derive(Debug)]
pub enum Cycle {
    /// A record was written in full to `peer`.
    Delivered { peer: PeerAddr, bytes: usize },
    /// The buffer was empty; the loop slept for the idle interval.
    Idle,
    DiscoveryFailed,
    DialFailed,
    /// The popped record was lost.
    WriteFailed(DeliveryError),
    Cancelled,
}

/// Why [`DeliveryLoop::spin`] returned.
#[derive(Debug)]
pub enum StopReason {
    Cancelled,
    /// A write failed under [`WriteFailurePolicy::Stop`].
    DeliveryFailed(DeliveryError),
}

/// Delivery loop state. Owns the peer ring and backoff; shares only the buffer.
pub struct DeliveryLoop {
    cancel_token: CancellationToken,
    buffer: LineBuffer,
    peers: PeerRing,
    backoff: Backoff,
    resolver: Arc<dyn Resolver>,
    dialer: Arc<dyn Dialer>,
    prefix: Vec<u8>,
    idle_interval: Duration,
    lookup_timeout: Duration,
    dial_timeout: Duration,
    write_timeout: Duration,
    reset_backoff_on_success: bool,
    write_failure: WriteFailurePolicy,
}

impl DeliveryLoop {
    /// Builds a loop using the system DNS resolver and real sockets.
    ///
    /// Fails if the configuration is invalid; nothing runs until [`spin`](Self::spin).
    pub fn new(
        config: &ShipperConfig,
        buffer: LineBuffer,
        cancel_token: CancellationToken,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(DeliveryLoop {
            cancel_token,
            buffer,
            peers: PeerRing::from_specs(&config.peers, config.default_port)?,
            backoff: Backoff::new(config.backoff_floor, config.backoff_ceiling),
            resolver: Arc::new(SystemResolver::new()),
            dialer: Arc::new(NetDialer),
            prefix: config
                .prefix
                .as_deref()
                .map(|prefix| prefix.as_bytes().to_vec())
                .unwrap_or_default(),
            idle_interval: config.idle_interval,
            lookup_timeout: config.lookup_timeout,
            dial_timeout: config.dial_timeout,
            write_timeout: config.write_timeout,
            reset_backoff_on_success: config.reset_backoff_on_success,
            write_failure: config.write_failure,
        })
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn peers(&self) -> &PeerRing {
        &self.peers
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Shuffles the peer ring once, then runs cycles until cancelled or, under
    /// [`WriteFailurePolicy::Stop`], until a write fails.
    pub async fn spin(mut self) -> StopReason {
        self.peers.shuffle();
        debug!(peers = self.peers.len(), "delivery loop started");

        loop {
            match self.step().await {
                Cycle::Cancelled => {
                    debug!("delivery loop cancelled");
                    return StopReason::Cancelled;
                }
                Cycle::WriteFailed(e) if self.write_failure == WriteFailurePolicy::Stop => {
                    info!(error = %e, "delivery loop stopped, no further records will be delivered");
                    return StopReason::DeliveryFailed(e);
                }
                _ => {}
            }
        }
    }

    /// Runs one cycle against the current peer, then rotates the ring.
    pub async fn step(&mut self) -> Cycle {
        if self.cancel_token.is_cancelled() {
            return Cycle::Cancelled;
        }

        let target = self.peers.current().clone();
        let cycle = self.attempt(&target).await;
        self.peers.advance();
        cycle
    }

    async fn attempt(&mut self, target: &PeerAddr) -> Cycle {
        let lookup = discovery::resolve(self.resolver.as_ref(), target, self.lookup_timeout);
        let Some(resolved) = self.unless_cancelled(lookup).await else {
            return Cycle::Cancelled;
        };
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                info!(host = %target.host, error = %e, "peer lookup failed");
                self.back_off().await;
                return Cycle::DiscoveryFailed;
            }
        };
        debug!(raw = %target, resolved = %resolved, "delivery target");

        let Some(dialed) = self.unless_cancelled(self.dial(&resolved)).await else {
            return Cycle::Cancelled;
        };
        let mut connection = match dialed {
            Ok(connection) => connection,
            Err(e) => {
                info!(peer = %resolved, error = %e, "dial failed");
                self.back_off().await;
                return Cycle::DialFailed;
            }
        };

        let Some(record) = self.buffer.pop_record() else {
            drop(connection);
            self.pause(self.idle_interval).await;
            return Cycle::Idle;
        };

        let payload = self.frame(&record);
        // the record is already out of the buffer, cancelling here loses it
        let Some(written) = self
            .unless_cancelled(self.write(&mut connection, &payload))
            .await
        else {
            return Cycle::Cancelled;
        };
        match written {
            Ok(bytes) => {
                if self.reset_backoff_on_success {
                    self.backoff.reset();
                }
                Cycle::Delivered {
                    peer: resolved,
                    bytes,
                }
            }
            Err(e) => {
                match &e {
                    DeliveryError::ShortWrite { written, expected } => {
                        info!(peer = %resolved, written, expected, "short write, record dropped");
                    }
                    other => {
                        info!(peer = %resolved, error = %other, "peer disconnected, record dropped");
                    }
                }
                drop(connection);
                if self.write_failure == WriteFailurePolicy::Recover {
                    self.back_off().await;
                }
                Cycle::WriteFailed(e)
            }
        }
    }

    async fn dial(&self, target: &PeerAddr) -> Result<Connection, DialError> {
        match timeout(self.dial_timeout, self.dialer.dial(target)).await {
            Ok(dialed) => dialed,
            Err(_) => Err(DialError::Timeout {
                addr: target.host_port(),
                timeout: self.dial_timeout,
            }),
        }
    }

    /// Prefix, record trimmed of surrounding whitespace, newline.
    fn frame(&self, record: &[u8]) -> Vec<u8> {
        let line = record.trim_ascii();
        let mut payload = Vec::with_capacity(self.prefix.len() + line.len() + 1);
        payload.extend_from_slice(&self.prefix);
        payload.extend_from_slice(line);
        payload.push(b'\n');
        payload
    }

    async fn write(
        &self,
        connection: &mut Connection,
        payload: &[u8],
    ) -> Result<usize, DeliveryError> {
        let written = match timeout(self.write_timeout, connection.write_record(payload)).await {
            Ok(written) => written?,
            Err(_) => return Err(DeliveryError::Timeout(self.write_timeout)),
        };
        if written < payload.len() {
            return Err(DeliveryError::ShortWrite {
                written,
                expected: payload.len(),
            });
        }
        Ok(written)
    }

    async fn back_off(&mut self) {
        let delay = self.backoff.next();
        self.pause(delay).await;
    }

    /// Runs `fut` to completion, or returns `None` as soon as the loop is cancelled.
    async fn unless_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            output = fut => Some(output),
            _ = self.cancel_token.cancelled() => None,
        }
    }

    /// Sleeps for `delay`, waking early on cancellation.
    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = sleep(delay) => {},
            _ = self.cancel_token.cancelled() => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::MemoryDialer;
    use crate::discovery::tests::StaticResolver;
    use std::time::Instant;
    use tokio::net::TcpListener;
    use tracing_test::traced_test;

    const MS_16: Duration = Duration::from_millis(16);

    fn test_config(peers: &[&str]) -> ShipperConfig {
        ShipperConfig {
            idle_interval: Duration::from_millis(20),
            ..ShipperConfig::with_peers(peers.iter().copied())
        }
    }

    fn memory_loop(
        config: &ShipperConfig,
        dialer: &MemoryDialer,
    ) -> (DeliveryLoop, LineBuffer, CancellationToken) {
        let buffer = LineBuffer::unbounded();
        let cancel_token = CancellationToken::new();
        let delivery = DeliveryLoop::new(config, buffer.clone(), cancel_token.clone())
            .unwrap()
            .with_resolver(Arc::new(StaticResolver::default()))
            .with_dialer(Arc::new(dialer.clone()));
        (delivery, buffer, cancel_token)
    }

    fn heads(delivery: &DeliveryLoop) -> Vec<String> {
        delivery.peers().iter().map(|p| p.host.clone()).collect()
    }

    #[tokio::test]
    async fn test_delivers_framed_record() {
        let config = ShipperConfig {
            prefix: Some("web-1 ".to_string()),
            ..test_config(&["a"])
        };
        let dialer = MemoryDialer::new();
        let (mut delivery, buffer, _) = memory_loop(&config, &dialer);

        buffer.append(b"  hello world \t\n");
        let cycle = delivery.step().await;

        assert!(matches!(cycle, Cycle::Delivered { bytes: 18, .. }));
        assert_eq!(dialer.received(), b"web-1 hello world\n");
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_rotation_advances_every_cycle() {
        let config = test_config(&["a", "tcp+dns://missing", "c"]);
        let dialer = MemoryDialer::new();
        let (mut delivery, buffer, _) = memory_loop(&config, &dialer);
        let start = heads(&delivery);

        buffer.append(b"one\n");
        // delivered to a, lookup failure for missing, idle on c
        assert!(matches!(delivery.step().await, Cycle::Delivered { .. }));
        assert_eq!(delivery.peers().current().host, "missing");
        assert!(matches!(delivery.step().await, Cycle::DiscoveryFailed));
        assert_eq!(delivery.peers().current().host, "c");
        assert!(matches!(delivery.step().await, Cycle::Idle));

        assert_eq!(heads(&delivery), start);
    }

    #[tokio::test]
    async fn test_consecutive_records_go_to_different_peers() {
        let config = test_config(&["a", "b"]);
        let dialer = MemoryDialer::new();
        let (mut delivery, buffer, _) = memory_loop(&config, &dialer);

        buffer.append(b"1\n2\n3\n");
        for _ in 0..3 {
            assert!(matches!(delivery.step().await, Cycle::Delivered { .. }));
        }
        let hosts: Vec<String> = dialer.dialed().into_iter().map(|p| p.host).collect();
        assert_eq!(hosts, vec!["a", "b", "a"]);
        assert_eq!(dialer.received(), b"1\n2\n3\n");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_idle_does_not_back_off() {
        let config = test_config(&["a"]);
        let dialer = MemoryDialer::new();
        let (mut delivery, _buffer, _) = memory_loop(&config, &dialer);

        let started = Instant::now();
        for _ in 0..3 {
            assert!(matches!(delivery.step().await, Cycle::Idle));
        }

        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(delivery.backoff().current(), Duration::ZERO);
        assert!(!logs_contain("INFO"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_discovery_failure_backs_off_without_dialing() {
        let config = test_config(&["tcp+dnssrv://missing"]);
        let dialer = MemoryDialer::new();
        let (mut delivery, buffer, _) = memory_loop(&config, &dialer);
        buffer.append(b"kept\n");

        assert!(matches!(delivery.step().await, Cycle::DiscoveryFailed));
        assert_eq!(delivery.backoff().current(), MS_16);
        assert!(dialer.dialed().is_empty());
        assert_eq!(buffer.len(), 1);
        assert!(logs_contain("peer lookup failed"));
        assert!(logs_contain("missing"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dial_failure_backs_off_and_keeps_record() {
        let config = test_config(&["a"]);
        let dialer = MemoryDialer::new().refusing();
        let (mut delivery, buffer, _) = memory_loop(&config, &dialer);
        buffer.append(b"kept\n");

        assert!(matches!(delivery.step().await, Cycle::DialFailed));
        assert_eq!(delivery.backoff().current(), MS_16);
        assert!(matches!(delivery.step().await, Cycle::DialFailed));
        assert_eq!(delivery.backoff().current(), Duration::from_millis(32));
        assert_eq!(buffer.len(), 1);
        assert!(logs_contain("dial failed"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unreachable_peer_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let peer = format!("127.0.0.1:{port}");
        let buffer = LineBuffer::unbounded();
        let mut delivery = DeliveryLoop::new(
            &test_config(&[peer.as_str()]),
            buffer.clone(),
            CancellationToken::new(),
        )
        .unwrap();

        buffer.append(b"hello\n");
        assert!(matches!(delivery.step().await, Cycle::DialFailed));
        assert_eq!(delivery.backoff().current(), MS_16);
        assert_eq!(buffer.len(), 1);
        assert!(logs_contain("dial failed"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_short_write_stops_loop_and_loses_record() {
        let config = ShipperConfig {
            write_failure: WriteFailurePolicy::Stop,
            ..test_config(&["a"])
        };
        let dialer = MemoryDialer::new().with_write_limit(3);
        let (delivery, buffer, _) = memory_loop(&config, &dialer);
        buffer.append(b"hello\nworld\n");

        let reason = timeout(Duration::from_secs(2), delivery.spin())
            .await
            .expect("loop should stop on its own");

        assert!(matches!(
            reason,
            StopReason::DeliveryFailed(DeliveryError::ShortWrite {
                written: 3,
                expected: 6
            })
        ));
        assert_eq!(dialer.received(), b"hel");
        // hello is gone, world was never attempted
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.pop_record().as_deref(), Some(&b"world\n"[..]));
        assert!(logs_contain("short write"));
    }

    #[tokio::test]
    async fn test_short_write_recovers_by_default() {
        let config = test_config(&["a", "b"]);
        let dialer = MemoryDialer::new().with_write_limit(3);
        let (mut delivery, buffer, _) = memory_loop(&config, &dialer);
        buffer.append(b"toolong\nok\n");

        assert!(matches!(
            delivery.step().await,
            Cycle::WriteFailed(DeliveryError::ShortWrite { .. })
        ));
        assert_eq!(delivery.backoff().current(), MS_16);

        assert!(matches!(delivery.step().await, Cycle::Delivered { .. }));
        assert_eq!(dialer.received(), b"toook\n");
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_backoff_kept_after_success_by_default() {
        let config = test_config(&["tcp+dns://missing", "good"]);
        let dialer = MemoryDialer::new();
        let (mut delivery, buffer, _) = memory_loop(&config, &dialer);
        buffer.append(b"x\n");

        assert!(matches!(delivery.step().await, Cycle::DiscoveryFailed));
        assert!(matches!(delivery.step().await, Cycle::Delivered { .. }));
        assert_eq!(delivery.backoff().current(), MS_16);
    }

    #[tokio::test]
    async fn test_backoff_reset_after_success_when_enabled() {
        let config = ShipperConfig {
            reset_backoff_on_success: true,
            ..test_config(&["tcp+dns://missing", "good"])
        };
        let dialer = MemoryDialer::new();
        let (mut delivery, buffer, _) = memory_loop(&config, &dialer);
        buffer.append(b"x\n");

        assert!(matches!(delivery.step().await, Cycle::DiscoveryFailed));
        assert!(matches!(delivery.step().await, Cycle::Delivered { .. }));
        assert_eq!(delivery.backoff().current(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cancelled_loop_stops() {
        let config = ShipperConfig {
            idle_interval: Duration::from_secs(30),
            ..test_config(&["a"])
        };
        let dialer = MemoryDialer::new();
        let (delivery, _buffer, cancel_token) = memory_loop(&config, &dialer);

        let task = tokio::spawn(delivery.spin());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_token.cancel();

        let reason = timeout(Duration::from_secs(2), task)
            .await
            .expect("cancellation should interrupt the idle sleep")
            .unwrap();
        assert!(matches!(reason, StopReason::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_slow_lookup() {
        let mut resolver = StaticResolver::default();
        resolver.delay = Some(Duration::from_secs(3));
        resolver
            .ips
            .insert("slow".to_string(), vec!["10.0.0.1".parse().unwrap()]);
        let config = ShipperConfig {
            lookup_timeout: Duration::from_secs(5),
            ..test_config(&["tcp+dns://slow"])
        };
        let dialer = MemoryDialer::new();
        let (delivery, buffer, cancel_token) = memory_loop(&config, &dialer);
        let delivery = delivery.with_resolver(Arc::new(resolver));
        buffer.append(b"kept\n");

        let task = tokio::spawn(delivery.spin());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let cancelled_at = Instant::now();
        cancel_token.cancel();

        let reason = timeout(Duration::from_secs(1), task)
            .await
            .expect("cancellation should interrupt the lookup")
            .unwrap();
        assert!(matches!(reason, StopReason::Cancelled));
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert!(dialer.dialed().is_empty());
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_step_after_cancel_does_nothing() {
        let config = test_config(&["a"]);
        let dialer = MemoryDialer::new();
        let (mut delivery, buffer, cancel_token) = memory_loop(&config, &dialer);
        buffer.append(b"x\n");
        cancel_token.cancel();

        assert!(matches!(delivery.step().await, Cycle::Cancelled));
        assert!(dialer.dialed().is_empty());
        assert_eq!(buffer.len(), 1);
    }
}
