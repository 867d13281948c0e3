// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;

use tokio::io::{stdin, AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use analytics_batcher::{Analytics, BatcherConfig, Event};

const DEFAULT_LOG_LEVEL: &str = "info";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("ANALYTICS_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or(DEFAULT_LOG_LEVEL.to_string());
    init_logging(&log_level);

    let config = match BatcherConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}. Shutting down analytics relay.");
            return;
        }
    };

    let analytics = match Analytics::start(config) {
        Ok(analytics) => analytics,
        Err(e) => {
            error!("Failed to start analytics batcher: {e}");
            return;
        }
    };

    let cancel_token = CancellationToken::new();
    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt, draining buffered events"),
            Err(e) => error!("Unable to listen for interrupt signal: {e}"),
        }
        signal_token.cancel();
    });

    let relayed = relay_lines(BufReader::new(stdin()), &analytics, &cancel_token).await;
    info!("Relayed {relayed} events, shutting down");

    if let Err(e) = analytics.shutdown().await {
        error!("Failed to shut down cleanly: {e}");
    }
}

fn init_logging(log_level: &str) {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");
    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| {
        EnvFilter::new(format!("h2=off,hyper=off,rustls=off,{DEFAULT_LOG_LEVEL}"))
    });

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {e}");
        return;
    }
    debug!("Logging subsystem enabled");
}

/// Enqueues one event per JSON line until end of input or cancellation.
///
/// Blank lines are ignored and malformed lines are logged and skipped.
/// Returns the number of events handed to the batcher.
async fn relay_lines<R>(reader: R, analytics: &Analytics, cancel_token: &CancellationToken) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut relayed = 0;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                debug!("Input relay cancelled");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Event::from_json(&line) {
                        Ok(event) => {
                            if let Err(e) = analytics.enqueue(event) {
                                error!("Batcher stopped accepting events: {e}");
                                break;
                            }
                            relayed += 1;
                        }
                        Err(e) => warn!("Skipping malformed event line: {e}"),
                    }
                }
                Ok(None) => {
                    debug!("Reached end of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {e}");
                    break;
                }
            }
        }
    }

    relayed
}
