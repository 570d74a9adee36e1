//! Prometheus metrics definitions and the ops HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "stash_operator_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "stash_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "stash_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Keys put back on the queue after a failure
    pub static ref QUEUE_RETRIES: CounterVec = register_counter_vec!(
        "stash_operator_queue_retries_total",
        "Total number of rate-limited requeues",
        &["kind"]
    ).unwrap();

    /// Keys dropped after exhausting their retries or failing terminally
    pub static ref QUEUE_DROPS: CounterVec = register_counter_vec!(
        "stash_operator_queue_drops_total",
        "Total number of keys dropped from the queue",
        &["kind"]
    ).unwrap();

    /// Notifications rejected before enqueue
    pub static ref ADMISSION_REJECTIONS: CounterVec = register_counter_vec!(
        "stash_operator_admission_rejections_total",
        "Total number of objects rejected by validation",
        &["kind"]
    ).unwrap();

    /// Update notifications without a spec change
    pub static ref SUPPRESSED_UPDATES: CounterVec = register_counter_vec!(
        "stash_operator_suppressed_updates_total",
        "Total number of update notifications suppressed",
        &["kind"]
    ).unwrap();

    /// Jobs created, by operation
    pub static ref JOBS_CREATED: CounterVec = register_counter_vec!(
        "stash_operator_jobs_created_total",
        "Total number of jobs created",
        &["operation"]
    ).unwrap();

    /// Workload writes, by kind and action (inject or remove)
    pub static ref WORKLOAD_MUTATIONS: CounterVec = register_counter_vec!(
        "stash_operator_workload_mutations_total",
        "Total number of workload mutations written",
        &["kind", "action"]
    ).unwrap();

    /// Restored paths by outcome
    pub static ref RECOVERY_PATHS: CounterVec = register_counter_vec!(
        "stash_operator_recovery_paths_total",
        "Total number of recovered paths by outcome",
        &["phase"]
    ).unwrap();

    /// Per-path restore duration
    pub static ref RECOVERY_PATH_DURATION: HistogramVec = register_histogram_vec!(
        "stash_operator_recovery_path_duration_seconds",
        "Duration of restoring a single path",
        &["phase"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "stash_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Serve `/metrics`, `/healthz` and `/readyz`
pub async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Ops server listening on {}", addr);

    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path()))
}

fn route(path: &str) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => metrics_response(),
        "/healthz" | "/readyz" => text(StatusCode::OK, "ok"),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(value) = encoder.format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
