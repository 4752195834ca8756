// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loki push API client.
//!
//! Serializes labeled, time-ordered log streams into the Loki push wire
//! format (`{"streams": [...]}` with `["<unix-nanos>", <line>]` value pairs),
//! gzip-compresses the body and submits it to the ingestion endpoint.

use std::collections::HashMap;
use std::io::Write;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::{header, StatusCode};
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("encoding push request body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("compressing push request body: {0}")]
    Compress(#[from] std::io::Error),

    #[error("performing api request: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-success response from the push endpoint, carrying the upstream
    /// status code and raw response body.
    #[error("unexpected api response: HTTP {}: {body}", .status.as_u16())]
    Http { status: StatusCode, body: String },
}

/// An individual timestamped log line, pushed as part of a [`Stream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub time: DateTime<Utc>,
    pub line: String,
}

impl Serialize for Value {
    // Loki expects each value as a two-element array of
    // [nanosecond-timestamp-as-decimal-string, raw-line-text].
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = self
            .time
            .timestamp_nanos_opt()
            .ok_or_else(|| serde::ser::Error::custom("timestamp out of nanosecond range"))?;
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&nanos.to_string())?;
        tuple.serialize_element(&self.line)?;
        tuple.end()
    }
}

/// A labeled log stream which may be pushed to a Loki endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Stream {
    #[serde(rename = "stream")]
    pub labels: HashMap<String, String>,
    pub values: Vec<Value>,
}

#[derive(Serialize)]
struct PushRequest<'a> {
    streams: &'a [Stream],
}

fn encode_body(streams: &[Stream]) -> Result<Vec<u8>, Error> {
    let json = serde_json::to_vec(&PushRequest { streams })?;

    // The encoder must be finished to flush its buffer and write the footer.
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Loki push API client.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Client {
    pub fn new(base_url: impl Into<String>) -> Self {
        Client {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Pushes a batch of streams to the Loki ingestion endpoint.
    pub async fn push(&self, streams: &[Stream]) -> Result<(), Error> {
        let body = encode_body(streams)?;

        let url = format!("{}/loki/api/v1/push", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header(header::CONTENT_ENCODING, "gzip")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Http { status, body });
        }

        Ok(())
    }
}
