// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Logpull scrape collector.
//!
//! Each collection cycle computes one time window, fetches that window's logs
//! for every configured zone concurrently, groups the decoded records by
//! their response field triple and renders the per-key counts as gauge
//! samples. Zone failures are isolated: a failing zone contributes no samples
//! and bumps the shared error counter, while every other zone's results are
//! emitted unaffected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus::core::{Collector as _, Desc};
use prometheus::{GaugeVec, IntCounter, Opts};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::duration::format_duration;

/// The Logpull API requires 'start' to be no more than seven days earlier
/// than now, and 'end' to be at least one minute earlier than now, so the log
/// period must stay below seven days less the one minute end offset.
/// https://developers.cloudflare.com/logs/logpull-api/requesting-logs#parameters
pub const LOG_PERIOD_RANGE: Duration = Duration::from_secs(7 * 24 * 60 * 60 - 60);

/// 'end' must be at least one minute earlier than now.
pub(crate) const END_OFFSET_SECS: i64 = 60;

const RESPONSES_NAME: &str = "cloudflare_logs_http_responses";
const RESPONSES_HELP: &str = "Cloudflare HTTP responses, obtained via Logpull API";
const ERRORS_NAME: &str = "cloudflare_logs_errors_total";
const ERRORS_HELP: &str = "The number of errors that have occurred while collecting metrics";

const FIELD_LABELS: [&str; 3] = [
    "client_request_host",
    "edge_response_status",
    "origin_response_status",
];
const FIELDS: [&str; 3] = [
    "ClientRequestHost",
    "EdgeResponseStatus",
    "OriginResponseStatus",
];

/// Callback invoked once per failing zone per scrape.
pub type ErrorHandler = Arc<dyn Fn(&CollectError) + Send + Sync>;

/// Constructor-time validation failures.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("invalid parameter: zone_ids must not be empty")]
    EmptyZones,

    #[error("invalid parameter: log_period out of acceptable range")]
    LogPeriodOutOfRange,

    #[error("building metric descriptors: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// A per-zone collection failure, reported through the [`ErrorHandler`].
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("pulling logs for zone {zone}: {source}")]
    Pull {
        zone: String,
        #[source]
        source: logpull::Error,
    },

    #[error("reading logs for zone {zone}: {source}")]
    Read {
        zone: String,
        #[source]
        source: logpull::Error,
    },

    #[error("decoding log record for zone {zone}: {source}")]
    Decode {
        zone: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Grouping key decoded from each Logpull record: the exact triple of
/// requested fields.
#[derive(Debug, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
struct ResponseKey {
    client_request_host: String,
    edge_response_status: i64,
    origin_response_status: i64,
}

struct Sample {
    key: ResponseKey,
    count: f64,
}

pub struct Collector {
    api: Arc<logpull::Client>,
    zone_ids: Vec<String>,
    log_period: chrono::Duration,
    response_opts: Opts,
    errors_total: IntCounter,
    error_handler: ErrorHandler,
    descs: Vec<Desc>,
}

impl Collector {
    /// Creates a new Logpull collector. Fails if the zone list is empty or
    /// the log period is not positive and strictly below
    /// [`LOG_PERIOD_RANGE`].
    pub fn new(
        api: Arc<logpull::Client>,
        zone_ids: Vec<String>,
        log_period: Duration,
        error_handler: ErrorHandler,
    ) -> Result<Self, CollectorError> {
        if zone_ids.is_empty() {
            return Err(CollectorError::EmptyZones);
        }
        if log_period.is_zero() || log_period >= LOG_PERIOD_RANGE {
            return Err(CollectorError::LogPeriodOutOfRange);
        }

        let response_opts = Opts::new(RESPONSES_NAME, RESPONSES_HELP)
            .const_label("period", format_duration(log_period));

        // Building both families up front surfaces descriptor conflicts at
        // construction instead of at scrape time.
        let responses = GaugeVec::new(response_opts.clone(), &FIELD_LABELS)?;
        let errors_total = IntCounter::new(ERRORS_NAME, ERRORS_HELP)?;

        let mut descs: Vec<Desc> = responses.desc().into_iter().cloned().collect();
        descs.extend(errors_total.desc().into_iter().cloned());

        let log_period = chrono::Duration::from_std(log_period)
            .map_err(|_| CollectorError::LogPeriodOutOfRange)?;

        Ok(Collector {
            api,
            zone_ids,
            log_period,
            response_opts,
            errors_total,
            error_handler,
            descs,
        })
    }

    /// Returns the fixed set of metric descriptors. Performs no I/O.
    pub fn describe(&self) -> &[Desc] {
        &self.descs
    }

    /// Runs one scrape: fetch, decode and count every configured zone's logs
    /// over the current window, then render the result as metric families.
    /// Returns only after every zone task has finished.
    pub async fn collect(&self) -> Vec<prometheus::proto::MetricFamily> {
        let end = Utc::now() - chrono::Duration::seconds(END_OFFSET_SECS);
        let start = end - self.log_period;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        for zone_id in &self.zone_ids {
            let api = Arc::clone(&self.api);
            let zone_id = zone_id.clone();
            let tx = tx.clone();
            let errors_total = self.errors_total.clone();
            let error_handler = Arc::clone(&self.error_handler);
            tasks.spawn(async move {
                if let Err(err) = collect_zone(&api, &zone_id, start, end, &tx).await {
                    error_handler(&err);
                    errors_total.inc();
                }
            });
        }
        drop(tx);

        // Join-before-return: no partial scrape output may escape while a
        // zone task is still running.
        while tasks.join_next().await.is_some() {}

        let responses = match GaugeVec::new(self.response_opts.clone(), &FIELD_LABELS) {
            Ok(responses) => responses,
            Err(err) => {
                // The same construction was validated in new().
                error!("building response metric family: {err}");
                return self.errors_total.collect();
            }
        };

        let mut got_samples = false;
        while let Some(Sample { key, count }) = rx.recv().await {
            got_samples = true;
            let edge_status = key.edge_response_status.to_string();
            let origin_status = key.origin_response_status.to_string();
            responses
                .with_label_values(&[
                    key.client_request_host.as_str(),
                    edge_status.as_str(),
                    origin_status.as_str(),
                ])
                .add(count);
        }

        // The text encoder rejects a family with no metrics, so a scrape
        // with no samples exposes only the error counter.
        let mut families = if got_samples {
            responses.collect()
        } else {
            Vec::new()
        };
        families.extend(self.errors_total.collect());
        families
    }
}

/// Fetches and counts one zone's logs. The key→count map is private to this
/// task; samples reach the shared channel only once decoding has completed,
/// so a failure here contributes nothing but the error itself.
async fn collect_zone(
    api: &logpull::Client,
    zone_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tx: &mpsc::UnboundedSender<Sample>,
) -> Result<(), CollectError> {
    let mut stream = api
        .zone_logs(zone_id, Some(&FIELDS), None, start, end)
        .await
        .map_err(|source| CollectError::Pull {
            zone: zone_id.to_string(),
            source,
        })?;

    let mut counts: HashMap<ResponseKey, f64> = HashMap::new();
    loop {
        let line = stream
            .next_line()
            .await
            .map_err(|source| CollectError::Read {
                zone: zone_id.to_string(),
                source,
            })?;
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let key: ResponseKey =
            serde_json::from_str(&line).map_err(|source| CollectError::Decode {
                zone: zone_id.to_string(),
                source,
            })?;
        *counts.entry(key).or_insert(0.0) += 1.0;
    }

    debug!("zone {zone_id}: {} distinct response keys", counts.len());

    for (key, count) in counts {
        if tx.send(Sample { key, count }).is_err() {
            break;
        }
    }

    Ok(())
}
