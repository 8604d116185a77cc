// Copyright Ferrite Project contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! HTTP surfaces: the probe endpoints and the metrics exposition. Both are
//! GET-only; axum's method routing answers 405 for anything else.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};

use crate::probe::{Prober, Readiness};
use crate::status::StatusSource;

/// `/healthz` and `/readyz`.
pub fn probe_router<S>(prober: Arc<Prober<S>>) -> Router
where
    S: StatusSource + 'static,
{
    Router::new()
        .route("/healthz", get(healthz::<S>))
        .route("/readyz", get(readyz::<S>))
        .with_state(prober)
}

async fn healthz<S: StatusSource>(State(prober): State<Arc<Prober<S>>>) -> Response {
    match prober.liveness().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("mysqld is not responding: {}", e),
        )
            .into_response(),
    }
}

async fn readyz<S: StatusSource>(State(prober): State<Arc<Prober<S>>>) -> Response {
    match prober.readiness().await {
        Ok(Readiness::Ready) => (StatusCode::OK, "ok").into_response(),
        Ok(Readiness::NotReady(reason)) => {
            (StatusCode::SERVICE_UNAVAILABLE, reason).into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("failed to inspect the instance: {}", e),
        )
            .into_response(),
    }
}

/// `/metrics` in Prometheus text format.
pub fn metrics_router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(registry)
}

async fn serve_metrics(State(registry): State<Registry>) -> Response {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buf) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {}", e),
        )
            .into_response();
    }
    ([("content-type", encoder.format_type().to_string())], buf).into_response()
}
