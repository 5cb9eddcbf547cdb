// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, HistogramVec, IntCounter,
    IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

pub const METRICS_PATH: &str = "/metrics";

const SUBMISSION_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 7.5, 10., 15., 20., 30., 60.,
];

#[derive(Clone, Debug)]
pub struct GatewayMetrics {
    pub(crate) events_received: IntCounterVec,
    pub(crate) events_undecodable: IntCounter,
    pub(crate) handler_failures: IntCounterVec,
    pub(crate) transport_errors: IntCounter,
    pub(crate) active_subscriptions: IntGauge,
    pub(crate) last_watched_block: IntGauge,

    pub(crate) tx_submitted: IntCounterVec,
    pub(crate) tx_submission_failures: IntCounterVec,
    pub(crate) tx_submission_latency: HistogramVec,
}

impl GatewayMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            events_received: register_int_counter_vec_with_registry!(
                "tbtc_gateway_events_received",
                "Total number of decoded deposit events, by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            events_undecodable: register_int_counter_with_registry!(
                "tbtc_gateway_events_undecodable",
                "Total number of logs dropped because they could not be decoded",
                registry,
            )
            .unwrap(),
            handler_failures: register_int_counter_vec_with_registry!(
                "tbtc_gateway_handler_failures",
                "Total number of event handler invocations that failed or panicked, by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            transport_errors: register_int_counter_with_registry!(
                "tbtc_gateway_transport_errors",
                "Total number of faults reported by the log feed",
                registry,
            )
            .unwrap(),
            active_subscriptions: register_int_gauge_with_registry!(
                "tbtc_gateway_active_subscriptions",
                "Number of live event subscriptions",
                registry,
            )
            .unwrap(),
            last_watched_block: register_int_gauge_with_registry!(
                "tbtc_gateway_last_watched_block",
                "Last block scanned by the log feed",
                registry,
            )
            .unwrap(),
            tx_submitted: register_int_counter_vec_with_registry!(
                "tbtc_gateway_tx_submitted",
                "Total number of transactions submitted, by operation",
                &["operation"],
                registry,
            )
            .unwrap(),
            tx_submission_failures: register_int_counter_vec_with_registry!(
                "tbtc_gateway_tx_submission_failures",
                "Total number of failed submissions, by operation",
                &["operation"],
                registry,
            )
            .unwrap(),
            tx_submission_latency: register_histogram_vec_with_registry!(
                "tbtc_gateway_tx_submission_latency",
                "Latency of submissions including the wait for the account lock, by operation",
                &["operation"],
                SUBMISSION_LATENCY_SEC_BUCKETS.to_vec(),
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

pub fn make_metrics_router(registry: Registry) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(METRICS_PATH, get(metrics_handler))
        .with_state(registry)
}

/// Serves the registry until the listener fails.
pub fn start_metrics_server(
    address: SocketAddr,
    registry: Registry,
) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(address).await?;
        info!("[Metrics] Serving {} on {}", METRICS_PATH, address);
        axum::serve(listener, make_metrics_router(registry).into_make_service()).await?;
        Ok(())
    })
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn metrics_handler(State(registry): State<Registry>) -> (StatusCode, String) {
    match TextEncoder::new().encode_to_string(&registry.gather()) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {e}"),
        ),
    }
}
