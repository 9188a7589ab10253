// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires a buffer, a delivery loop and its background task together.

use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::buffer::LineBuffer;
use crate::config::ShipperConfig;
use crate::delivery::{DeliveryLoop, StopReason};
use crate::dialer::{Dialer, NetDialer};
use crate::discovery::{Resolver, SystemResolver};
use crate::errors::ConfigError;
use crate::writer::Writer;

/// A running shipper: the producer side plus the delivery task.
pub struct Shipper {
    writer: Writer,
    cancel_token: CancellationToken,
    task: JoinHandle<StopReason>,
}

impl Shipper {
    /// Validates `config` and spawns the delivery loop on the current tokio runtime.
    pub fn start(
        config: ShipperConfig,
        cancel_token: CancellationToken,
    ) -> Result<Self, ConfigError> {
        Self::start_with(
            config,
            cancel_token,
            Arc::new(SystemResolver::new()),
            Arc::new(NetDialer),
        )
    }

    /// Same as [`start`](Self::start) with explicit DNS and connection backends.
    pub fn start_with(
        config: ShipperConfig,
        cancel_token: CancellationToken,
        resolver: Arc<dyn Resolver>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, ConfigError> {
        let buffer = match config.buffer_capacity {
            Some(capacity) => LineBuffer::bounded(capacity, config.overflow),
            None => LineBuffer::unbounded(),
        };

        let delivery = DeliveryLoop::new(&config, buffer.clone(), cancel_token.clone())?
            .with_resolver(resolver)
            .with_dialer(dialer);

        debug!(peers = ?config.peers, "starting log shipper");
        let task = tokio::spawn(delivery.spin());

        Ok(Shipper {
            writer: Writer::from_buffer(buffer),
            cancel_token,
            task,
        })
    }

    /// A producer handle; clone it freely.
    pub fn writer(&self) -> Writer {
        self.writer.clone()
    }

    /// False once the delivery loop has returned.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Waits for the delivery loop to return on its own.
    pub async fn stopped(self) -> Result<StopReason, JoinError> {
        self.task.await
    }

    /// Cancels the delivery loop and waits for it to return.
    ///
    /// Records still buffered are discarded with the shipper.
    pub async fn shutdown(self) -> Result<StopReason, JoinError> {
        self.cancel_token.cancel();
        self.task.await
    }
}
