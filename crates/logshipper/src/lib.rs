// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fire-and-forget shipping of newline-delimited records.
//!
//! Producers write into a [`Writer`]; one background task drains the buffer
//! and delivers each record to the next peer of a rotating, optionally
//! DNS-discovered, peer list. Delivery is best effort: a record is attempted
//! at most once and never acknowledged.
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), logshipper::ConfigError> {
//! use logshipper::{Shipper, ShipperConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ShipperConfig::with_peers(["collector-1:7651", "tcp+dnssrv://_logs._tcp.example.com"]);
//! let shipper = Shipper::start(config, CancellationToken::new())?;
//! shipper.writer().write(b"service started\n");
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod address;
pub mod backoff;
pub mod buffer;
pub mod config;
pub mod delivery;
pub mod dialer;
pub mod discovery;
pub mod errors;
pub mod peers;
pub mod shipper;
pub mod writer;

pub use address::{PeerAddr, DEFAULT_PORT};
pub use buffer::OverflowPolicy;
pub use config::{ShipperConfig, WriteFailurePolicy};
pub use delivery::StopReason;
pub use errors::{ConfigError, DeliveryError, DialError, DiscoveryError};
pub use shipper::Shipper;
pub use writer::Writer;
