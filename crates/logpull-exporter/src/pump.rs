// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loki forwarding pump.
//!
//! Each pump cycle fetches one zone's raw log records over a bounded window,
//! wraps every line in its `EdgeEndTimestamp` and pushes the whole window as
//! a single labeled stream. A cycle is all-or-nothing: any fetch, decode or
//! push failure drops the entire window rather than forwarding a partial or
//! misordered batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::collector::END_OFFSET_SECS;

const JOB_LABEL: &str = "cloudflare-logpull-exporter";

#[derive(Debug, thiserror::Error)]
pub enum PumpError {
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

    #[error("decoding log metadata: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("pushing loki stream for zone {zone}: {source}")]
    Push {
        zone: String,
        #[source]
        source: loki::Error,
    },
}

/// The single field extracted from each record to timestamp its Loki entry;
/// the rest of the line is forwarded verbatim.
#[derive(Debug, Deserialize)]
struct LogMetadata {
    #[serde(rename = "EdgeEndTimestamp")]
    edge_end_timestamp: i64,
}

fn parse_line(line: String) -> Result<loki::Value, serde_json::Error> {
    let metadata: LogMetadata = serde_json::from_str(&line)?;
    Ok(loki::Value {
        time: DateTime::from_timestamp_nanos(metadata.edge_end_timestamp),
        line,
    })
}

/// Builds the labeled stream for one window of raw log lines. Entries are
/// stably sorted by timestamp since Loki rejects out-of-order pushes, while
/// equal-timestamp records keep their arrival order.
fn build_stream(zone_name: &str, lines: Vec<String>) -> Result<loki::Stream, serde_json::Error> {
    let mut values = lines
        .into_iter()
        .map(parse_line)
        .collect::<Result<Vec<_>, _>>()?;
    values.sort_by_key(|value| value.time);

    Ok(loki::Stream {
        labels: HashMap::from([
            ("job".to_string(), JOB_LABEL.to_string()),
            ("zone".to_string(), zone_name.to_string()),
        ]),
        values,
    })
}

/// Forwards one zone's Logpull records to a Loki endpoint.
pub struct LokiPump {
    logs: Arc<logpull::Client>,
    loki: loki::Client,
    zone_id: String,
    zone_name: String,
}

impl LokiPump {
    pub fn new(
        logs: Arc<logpull::Client>,
        loki: loki::Client,
        zone_id: impl Into<String>,
        zone_name: impl Into<String>,
    ) -> Self {
        LokiPump {
            logs,
            loki,
            zone_id: zone_id.into(),
            zone_name: zone_name.into(),
        }
    }

    /// Runs one pump cycle over `[start, end)`, returning the number of
    /// forwarded entries. Empty windows are not pushed.
    pub async fn pump(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize, PumpError> {
        let mut stream = self
            .logs
            .zone_logs(&self.zone_id, None, None, start, end)
            .await
            .map_err(|source| PumpError::Pull {
                zone: self.zone_name.clone(),
                source,
            })?;

        let mut lines = Vec::new();
        loop {
            let line = stream.next_line().await.map_err(|source| PumpError::Read {
                zone: self.zone_name.clone(),
                source,
            })?;
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            lines.push(line);
        }

        let stream = build_stream(&self.zone_name, lines)?;
        let count = stream.values.len();
        if count == 0 {
            return Ok(0);
        }

        self.loki
            .push(std::slice::from_ref(&stream))
            .await
            .map_err(|source| PumpError::Push {
                zone: self.zone_name.clone(),
                source,
            })?;

        Ok(count)
    }
}

/// Drives every pump on a fixed interval of one log period. Pump failures
/// are logged and the next cycle proceeds; a missed tick is skipped rather
/// than replayed so windows never pile up behind a slow upstream.
pub async fn run_pump_loop(pumps: Vec<LokiPump>, log_period: Duration) {
    let pumps: Vec<Arc<LokiPump>> = pumps.into_iter().map(Arc::new).collect();
    let log_period_chrono = chrono::Duration::from_std(log_period)
        .unwrap_or_else(|_| chrono::Duration::seconds(60));

    let mut interval = tokio::time::interval(log_period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        let end = Utc::now() - chrono::Duration::seconds(END_OFFSET_SECS);
        let start = end - log_period_chrono;

        let mut tasks = JoinSet::new();
        for pump in &pumps {
            let pump = Arc::clone(pump);
            tasks.spawn(async move {
                match pump.pump(start, end).await {
                    Ok(count) => {
                        debug!("pumped {count} log entries for zone {}", pump.zone_name);
                    }
                    Err(err) => error!("{err}"),
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logpull::Auth;
    use mockito::Matcher;
    use proptest::prelude::*;

    fn record(nanos: i64, tag: &str) -> String {
        format!("{{\"EdgeEndTimestamp\": {nanos}, \"tag\": \"{tag}\"}}")
    }

    fn pump_against(logs_server: &mockito::Server, loki_server: &mockito::Server) -> LokiPump {
        let logs = Arc::new(logpull::Client::with_base_url(
            Auth::Token(String::new()),
            logs_server.url(),
        ));
        LokiPump::new(
            logs,
            loki::Client::new(loki_server.url()),
            "zone-id",
            "example.org",
        )
    }

    fn fixed_range() -> (DateTime<Utc>, DateTime<Utc>) {
        use chrono::TimeZone;
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 11, 58, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 5, 1, 11, 59, 0).unwrap();
        (start, end)
    }

    #[test]
    fn build_stream_sorts_entries_by_timestamp() {
        let stream = build_stream(
            "example.org",
            vec![record(2_000, "late"), record(1_000, "early")],
        )
        .unwrap();

        assert_eq!(stream.values.len(), 2);
        assert!(stream.values[0].line.contains("early"));
        assert!(stream.values[1].line.contains("late"));
        assert!(stream.values[0].time < stream.values[1].time);
    }

    #[test]
    fn build_stream_keeps_arrival_order_for_equal_timestamps() {
        let stream = build_stream(
            "example.org",
            vec![
                record(1_000, "first"),
                record(1_000, "second"),
                record(1_000, "third"),
            ],
        )
        .unwrap();

        let tags: Vec<bool> = vec![
            stream.values[0].line.contains("first"),
            stream.values[1].line.contains("second"),
            stream.values[2].line.contains("third"),
        ];
        assert_eq!(tags, vec![true, true, true]);
    }

    #[test]
    fn build_stream_sets_job_and_zone_labels() {
        let stream = build_stream("example.org", vec![record(1_000, "only")]).unwrap();

        assert_eq!(
            stream.labels.get("job").map(String::as_str),
            Some("cloudflare-logpull-exporter")
        );
        assert_eq!(
            stream.labels.get("zone").map(String::as_str),
            Some("example.org")
        );
    }

    #[test]
    fn build_stream_fails_on_undecodable_metadata() {
        let err = build_stream(
            "example.org",
            vec![record(1_000, "fine"), "{not json".to_string()],
        )
        .unwrap_err();

        assert!(err.is_syntax());
    }

    proptest! {
        #[test]
        fn build_stream_orders_any_window(nanos in proptest::collection::vec(0i64..1_000_000, 0..50)) {
            let lines: Vec<String> = nanos
                .iter()
                .enumerate()
                .map(|(i, &n)| format!("{{\"EdgeEndTimestamp\": {n}, \"seq\": {i}}}"))
                .collect();

            let stream = build_stream("example.org", lines).unwrap();

            prop_assert_eq!(stream.values.len(), nanos.len());
            for pair in stream.values.windows(2) {
                prop_assert!(pair[0].time <= pair[1].time);
                if pair[0].time == pair[1].time {
                    // Stable sort: equal timestamps keep input order, which
                    // the embedded sequence number makes visible.
                    let seq = |value: &loki::Value| -> u64 {
                        serde_json::from_str::<serde_json::Value>(&value.line).unwrap()["seq"]
                            .as_u64()
                            .unwrap()
                    };
                    prop_assert!(seq(&pair[0]) < seq(&pair[1]));
                }
            }
        }
    }

    #[tokio::test]
    async fn pump_pushes_window_to_loki() {
        let mut logs_server = mockito::Server::new_async().await;
        logs_server
            .mock("GET", "/zones/zone-id/logs/received")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(format!("{}\n{}\n", record(2_000, "late"), record(1_000, "early")))
            .create_async()
            .await;

        let mut loki_server = mockito::Server::new_async().await;
        let push = loki_server
            .mock("POST", "/loki/api/v1/push")
            .match_header("Content-Encoding", "gzip")
            .with_status(204)
            .create_async()
            .await;

        let pump = pump_against(&logs_server, &loki_server);
        let (start, end) = fixed_range();
        let count = pump.pump(start, end).await.expect("pump failed");

        assert_eq!(count, 2);
        push.assert_async().await;
    }

    #[tokio::test]
    async fn pump_skips_push_for_empty_window() {
        let mut logs_server = mockito::Server::new_async().await;
        logs_server
            .mock("GET", "/zones/zone-id/logs/received")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("")
            .create_async()
            .await;

        let mut loki_server = mockito::Server::new_async().await;
        let push = loki_server
            .mock("POST", "/loki/api/v1/push")
            .expect(0)
            .create_async()
            .await;

        let pump = pump_against(&logs_server, &loki_server);
        let (start, end) = fixed_range();
        let count = pump.pump(start, end).await.expect("pump failed");

        assert_eq!(count, 0);
        push.assert_async().await;
    }

    #[tokio::test]
    async fn pump_fails_without_pushing_on_decode_error() {
        let mut logs_server = mockito::Server::new_async().await;
        logs_server
            .mock("GET", "/zones/zone-id/logs/received")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(format!("{}\n{{not json\n", record(1_000, "fine")))
            .create_async()
            .await;

        let mut loki_server = mockito::Server::new_async().await;
        let push = loki_server
            .mock("POST", "/loki/api/v1/push")
            .expect(0)
            .create_async()
            .await;

        let pump = pump_against(&logs_server, &loki_server);
        let (start, end) = fixed_range();
        let err = pump.pump(start, end).await.expect_err("expected an error");

        assert!(matches!(err, PumpError::Decode(_)));
        assert!(err.to_string().starts_with("decoding log metadata"));
        push.assert_async().await;
    }

    #[tokio::test]
    async fn pump_surfaces_pull_errors_with_zone_context() {
        let mut logs_server = mockito::Server::new_async().await;
        logs_server
            .mock("GET", "/zones/zone-id/logs/received")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("the server's on fire")
            .create_async()
            .await;

        let loki_server = mockito::Server::new_async().await;
        let pump = pump_against(&logs_server, &loki_server);
        let (start, end) = fixed_range();
        let err = pump.pump(start, end).await.expect_err("expected an error");

        assert!(matches!(err, PumpError::Pull { .. }));
        let message = err.to_string();
        assert!(message.contains("pulling logs for zone example.org"));
        assert!(message.contains("the server's on fire"));
    }

    #[tokio::test]
    async fn pump_surfaces_push_errors_with_zone_context() {
        let mut logs_server = mockito::Server::new_async().await;
        logs_server
            .mock("GET", "/zones/zone-id/logs/received")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(format!("{}\n", record(1_000, "only")))
            .create_async()
            .await;

        let mut loki_server = mockito::Server::new_async().await;
        loki_server
            .mock("POST", "/loki/api/v1/push")
            .with_status(500)
            .with_body("ingester unavailable")
            .create_async()
            .await;

        let pump = pump_against(&logs_server, &loki_server);
        let (start, end) = fixed_range();
        let err = pump.pump(start, end).await.expect_err("expected an error");

        assert!(matches!(err, PumpError::Push { .. }));
        let message = err.to_string();
        assert!(message.contains("pushing loki stream for zone example.org"));
        assert!(message.contains("ingester unavailable"));
    }
}
