// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const BACKFILL_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10., 30., 60., 120., 300., 600.,
];

#[derive(Clone, Debug)]
pub struct MirrorMetrics {
    pub(crate) events_applied: IntCounterVec,
    pub(crate) malformed_events: IntCounterVec,
    pub(crate) reconnects: IntCounterVec,
    pub(crate) checkpoint: IntGaugeVec,
    pub(crate) backfill_latency: HistogramVec,
}

impl MirrorMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            events_applied: register_int_counter_vec_with_registry!(
                "vault_mirror_events_applied",
                "Events applied to the mirror, by event kind and outcome",
                &["kind", "outcome"],
                registry,
            )
            .unwrap(),
            malformed_events: register_int_counter_vec_with_registry!(
                "vault_mirror_malformed_events",
                "Undecodable events skipped, by event kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            reconnects: register_int_counter_vec_with_registry!(
                "vault_mirror_reconnects",
                "Transitions into RECONNECTING, by event kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            checkpoint: register_int_gauge_vec_with_registry!(
                "vault_mirror_checkpoint",
                "Last committed checkpoint block, by event kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            backfill_latency: register_histogram_vec_with_registry!(
                "vault_mirror_backfill_latency_seconds",
                "Duration of a backfill sweep, by event kind",
                &["kind"],
                BACKFILL_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

/// Serve `registry` as Prometheus text on `GET /metrics` until `cancel` fires.
pub async fn start_metrics_server(
    address: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("[Metrics] serving on {}", address);

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        {
            error!("[Metrics] server failed: {:?}", e);
        }
    }))
}

async fn metrics_handler(State(registry): State<Registry>) -> Result<String, (StatusCode, String)> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
