// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction for the delivery client.

use core::time::Duration;

use tracing::error;

use crate::config::BatcherConfig;

/// Creates a reqwest client honoring the configured timeout and proxy.
///
/// An invalid proxy is logged and the client falls back to a direct
/// connection, so a misconfigured proxy never stops event delivery.
#[must_use]
pub fn get_client(config: &BatcherConfig) -> reqwest::Client {
    match build_client(config, config.https_proxy.as_deref()) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client(config, None) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(
    config: &BatcherConfig,
    https_proxy: Option<&str>,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.request_timeout())
        // Held open between ticks; the endpoint closes idle connections on its side too.
        .pool_idle_timeout(Duration::from_secs(270))
        .tcp_keepalive(Duration::from_secs(120));

    if let Some(proxy) = https_proxy {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }

    builder.build()
}
