// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP scrape endpoint.
//!
//! Serves `GET /metrics` in the Prometheus text exposition format. Every
//! request triggers a full collection cycle, so concurrent scrapes each get
//! an independently computed window.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{http, Method, Response, StatusCode};
use prometheus::{Encoder, TextEncoder};
use tracing::error;

use crate::collector::Collector;

const METRICS_ENDPOINT_PATH: &str = "/metrics";

async fn metrics_handler(collector: Arc<Collector>) -> http::Result<Response<Full<Bytes>>> {
    let families = collector.collect().await;

    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buf) {
        error!("encoding metric families: {err}");
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::new(Bytes::new()));
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, encoder.format_type())
        .body(Full::new(Bytes::from(buf)))
}

async fn endpoint_handler<B>(
    req: hyper::Request<B>,
    collector: Arc<Collector>,
) -> http::Result<Response<Full<Bytes>>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, METRICS_ENDPOINT_PATH) => metrics_handler(collector).await,
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new())),
    }
}

/// Accepts connections until the listener fails, serving each on its own
/// task. A panicking connection handler is logged and does not take the
/// server down.
pub async fn serve(
    listener: tokio::net::TcpListener,
    collector: Arc<Collector>,
) -> io::Result<()> {
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();

    loop {
        let conn = tokio::select! {
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Server error: {e}");
                    return Err(e);
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("Connection handler panicked: {:?}", e);
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
        };

        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let collector = Arc::clone(&collector);
        let service = service_fn(move |req| endpoint_handler(req, Arc::clone(&collector)));
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, service).await {
                error!("Connection error: {e}");
            }
        });
    }
}
