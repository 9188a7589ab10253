// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logshipper::{Shipper, ShipperConfig, StopReason, Writer};

#[tokio::main]
pub async fn main() {
    let config = ShipperConfig::from_env();
    let log_level = config
        .as_ref()
        .map(|config| config.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(format!("{log_level},logshipper={log_level}"))
                .expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();
    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Error reading log shipper configuration: {e}");
            return;
        }
    };

    let cancel_token = CancellationToken::new();
    let shipper = match Shipper::start(config, cancel_token.clone()) {
        Ok(shipper) => shipper,
        Err(e) => {
            error!("Error starting log shipper: {e}");
            return;
        }
    };
    info!("log shipper started, reading records from stdin");

    let stdin_task = tokio::spawn(forward_stdin(shipper.writer(), cancel_token.clone()));

    let stopped = shipper.stopped();
    tokio::pin!(stopped);
    let stopped_early = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Unable to listen for shutdown signal: {e}");
            }
            debug!("shutdown signal received");
            None
        }
        outcome = &mut stopped => Some(outcome),
    };

    cancel_token.cancel();
    stdin_task.abort();
    let outcome = match stopped_early {
        Some(outcome) => outcome,
        None => stopped.await,
    };
    let code = match outcome {
        Ok(StopReason::Cancelled) => {
            info!("log shipper shut down");
            0
        }
        Ok(StopReason::DeliveryFailed(e)) => {
            error!("log shipper stopped after a failed write: {e}");
            1
        }
        Err(e) => {
            error!("log shipper task failed: {e}");
            1
        }
    };
    // a pending stdin read holds a blocking thread the runtime would wait on
    std::process::exit(code);
}

/// Copies stdin into the shipper one line at a time until EOF or cancellation.
async fn forward_stdin(writer: Writer, cancel_token: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    writer.write(format!("{line}\n").as_bytes());
                }
                Ok(None) => {
                    debug!("stdin closed");
                    return;
                }
                Err(e) => {
                    error!("Error reading stdin: {e}");
                    return;
                }
            },
        }
    }
}
