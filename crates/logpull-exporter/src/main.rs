// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod collector;
mod config;
mod duration;
mod pump;
mod server;

use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::collector::{Collector, ErrorHandler};
use crate::config::Config;
use crate::pump::{run_pump_loop, LokiPump};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("reading configuration")?;

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level in configuration")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber")?;

    let api = Arc::new(logpull::Client::new(config.auth.clone()));

    // Names are resolved once at startup; a zone that cannot be resolved is a
    // configuration error, not a scrape-time condition.
    let mut zones = Vec::with_capacity(config.zone_names.len());
    for name in &config.zone_names {
        let id = api
            .zone_id_by_name(name)
            .await
            .with_context(|| format!("resolving zone {name}"))?;
        debug!("resolved zone {name} to id {id}");
        zones.push((id, name.clone()));
    }

    let zone_ids: Vec<String> = zones.iter().map(|(id, _)| id.clone()).collect();
    let error_handler: ErrorHandler = Arc::new(|err| error!("{err}"));
    let collector = Arc::new(Collector::new(
        Arc::clone(&api),
        zone_ids,
        config.log_period,
        error_handler,
    )?);

    if let Some(loki_url) = &config.loki_url {
        let loki = loki::Client::new(loki_url.clone());
        let pumps = zones
            .iter()
            .map(|(id, name)| {
                LokiPump::new(Arc::clone(&api), loki.clone(), id.clone(), name.clone())
            })
            .collect();
        info!("forwarding logs to loki at {loki_url}");
        tokio::spawn(run_pump_loop(pumps, config.log_period));
    }

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!("listening on {}", config.listen_addr);

    server::serve(listener, collector).await?;
    Ok(())
}
