//! Prometheus metrics for the lifecycle controller
//!
//! # Exported metrics
//! The `/metrics` endpoint exports the following series:
//! - `lifecycle_terminating_instances_count` (gauge): events in the work queue.
//! - `lifecycle_draining_instances_count` (gauge): node drains in progress.
//! - `lifecycle_deregistering_instances_count` (gauge): deregistrations in progress.
//! - `lifecycle_active_tasks` (gauge): alive runtime tasks, sampled by the poller.
//! - `lifecycle_successful_events_total` / `lifecycle_failed_events_total` /
//!   `lifecycle_rejected_events_total` (counters): terminal event outcomes.
//! - `lifecycle_successful_node_drain_total` / `lifecycle_failed_node_drain_total`
//!   (counters): drain stage outcomes.
//! - `lifecycle_successful_lb_deregister_total` / `lifecycle_failed_lb_deregister_total`
//!   (counters): deregistration stage outcomes.
//! - `lifecycle_average_duration_seconds` (gauge): smoothed event latency.

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;

use axum::{routing::get, Router};
use once_cell::sync::Lazy;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::info;

use crate::error::Result;

/// Gauge tracking events currently in the work queue
pub static TERMINATING_INSTANCES: Lazy<Gauge> = Lazy::new(Gauge::default);

/// Gauge tracking node drains in progress
pub static DRAINING_INSTANCES: Lazy<Gauge> = Lazy::new(Gauge::default);

/// Gauge tracking load balancer deregistrations in progress
pub static DEREGISTERING_INSTANCES: Lazy<Gauge> = Lazy::new(Gauge::default);

/// Gauge tracking alive runtime tasks
pub static ACTIVE_TASKS: Lazy<Gauge> = Lazy::new(Gauge::default);

/// Counter tracking successfully completed events
pub static SUCCESSFUL_EVENTS_TOTAL: Lazy<Counter> = Lazy::new(Counter::default);

/// Counter tracking failed events
pub static FAILED_EVENTS_TOTAL: Lazy<Counter> = Lazy::new(Counter::default);

/// Counter tracking rejected messages
pub static REJECTED_EVENTS_TOTAL: Lazy<Counter> = Lazy::new(Counter::default);

/// Counter tracking successful node drains
pub static SUCCESSFUL_NODE_DRAIN_TOTAL: Lazy<Counter> = Lazy::new(Counter::default);

/// Counter tracking failed node drains
pub static FAILED_NODE_DRAIN_TOTAL: Lazy<Counter> = Lazy::new(Counter::default);

/// Counter tracking successful deregistration runs
pub static SUCCESSFUL_LB_DEREGISTER_TOTAL: Lazy<Counter> = Lazy::new(Counter::default);

/// Counter tracking failed deregistration runs
pub static FAILED_LB_DEREGISTER_TOTAL: Lazy<Counter> = Lazy::new(Counter::default);

/// Gauge tracking the smoothed event processing latency in seconds
pub static AVERAGE_DURATION_SECONDS: Lazy<Gauge<f64, AtomicU64>> = Lazy::new(Gauge::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "lifecycle_terminating_instances_count",
        "Events currently in the work queue",
        TERMINATING_INSTANCES.clone(),
    );
    registry.register(
        "lifecycle_draining_instances_count",
        "Node drains in progress",
        DRAINING_INSTANCES.clone(),
    );
    registry.register(
        "lifecycle_deregistering_instances_count",
        "Load balancer deregistrations in progress",
        DEREGISTERING_INSTANCES.clone(),
    );
    registry.register(
        "lifecycle_active_tasks",
        "Alive runtime tasks",
        ACTIVE_TASKS.clone(),
    );
    registry.register(
        "lifecycle_successful_events",
        "Successfully completed events",
        SUCCESSFUL_EVENTS_TOTAL.clone(),
    );
    registry.register(
        "lifecycle_failed_events",
        "Failed events",
        FAILED_EVENTS_TOTAL.clone(),
    );
    registry.register(
        "lifecycle_rejected_events",
        "Rejected messages",
        REJECTED_EVENTS_TOTAL.clone(),
    );
    registry.register(
        "lifecycle_successful_node_drain",
        "Successful node drains",
        SUCCESSFUL_NODE_DRAIN_TOTAL.clone(),
    );
    registry.register(
        "lifecycle_failed_node_drain",
        "Failed node drains",
        FAILED_NODE_DRAIN_TOTAL.clone(),
    );
    registry.register(
        "lifecycle_successful_lb_deregister",
        "Successful deregistration runs",
        SUCCESSFUL_LB_DEREGISTER_TOTAL.clone(),
    );
    registry.register(
        "lifecycle_failed_lb_deregister",
        "Failed deregistration runs",
        FAILED_LB_DEREGISTER_TOTAL.clone(),
    );
    registry.register(
        "lifecycle_average_duration_seconds",
        "Smoothed event processing latency in seconds",
        AVERAGE_DURATION_SECONDS.clone(),
    );
    registry
});

async fn metrics_handler() -> String {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    // encoding into a String cannot fail
    let _ = encode(&mut buffer, &REGISTRY);
    buffer
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Serve the metrics and health endpoints
pub async fn serve(port: u16) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting metrics server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
