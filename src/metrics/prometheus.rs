//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliation passes
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "kaspr_operator_reconciliations_total",
        "Total number of reconciliation passes by result",
        &["kind", "result"]
    ).unwrap();

    /// Total number of failed reconciliation passes
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "kaspr_operator_reconciliation_errors_total",
        "Total number of reconciliation errors by reason",
        &["kind", "reason"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "kaspr_operator_reconcile_duration_seconds",
        "Duration of reconciliation passes in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    /// Names waiting in the reconciliation queue
    pub static ref QUEUE_DEPTH: Gauge = register_gauge!(
        "kaspr_operator_queue_depth",
        "Number of resources waiting for a reconciliation pass"
    ).unwrap();

    /// Rebalance requests by trigger and result
    pub static ref REBALANCES_TOTAL: CounterVec = register_counter_vec!(
        "kaspr_operator_rebalances_total",
        "Total number of rebalance requests by trigger and result",
        &["namespace", "name", "trigger", "result"]
    ).unwrap();

    /// Rebalance request duration histogram
    pub static ref REBALANCE_DURATION: HistogramVec = register_histogram_vec!(
        "kaspr_operator_rebalance_duration_seconds",
        "Duration of rebalance requests in seconds",
        &["namespace", "name"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Member flag changes observed between reads
    pub static ref MEMBER_STATE_TRANSITIONS: CounterVec = register_counter_vec!(
        "kaspr_operator_member_state_transitions_total",
        "Member state transitions by changed field",
        &["namespace", "name", "field"]
    ).unwrap();

    /// Hung member detections (one per strike)
    pub static ref HUNG_MEMBERS_DETECTED: CounterVec = register_counter_vec!(
        "kaspr_operator_hung_members_detected_total",
        "Hung member detections",
        &["namespace", "name"]
    ).unwrap();

    /// Current strike count per member
    pub static ref HUNG_MEMBER_CONSECUTIVE_DETECTIONS: GaugeVec = register_gauge_vec!(
        "kaspr_operator_hung_member_consecutive_detections",
        "Consecutive hung detections of a member",
        &["namespace", "name", "member"]
    ).unwrap();

    /// Hung member pod terminations by result
    pub static ref MEMBER_TERMINATIONS: CounterVec = register_counter_vec!(
        "kaspr_operator_member_terminations_total",
        "Hung member pod terminations by result",
        &["namespace", "name", "result"]
    ).unwrap();

    /// Child resource syncs by kind and result
    pub static ref RESOURCE_SYNC_TOTAL: CounterVec = register_counter_vec!(
        "kaspr_operator_resource_sync_total",
        "Child resource syncs by kind and result",
        &["kind", "result"]
    ).unwrap();

    /// Child resource sync duration histogram
    pub static ref RESOURCE_SYNC_DURATION: HistogramVec = register_histogram_vec!(
        "kaspr_operator_resource_sync_duration_seconds",
        "Duration of child resource syncs in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();

    /// Child resources found out of date with the desired state
    pub static ref RESOURCE_DRIFT_DETECTED: CounterVec = register_counter_vec!(
        "kaspr_operator_resource_drift_detected_total",
        "Child resources whose content hash differed from the desired state",
        &["kind"]
    ).unwrap();

    /// Status subresource writes by result
    pub static ref STATUS_UPDATES: CounterVec = register_counter_vec!(
        "kaspr_operator_status_updates_total",
        "Status subresource writes by result",
        &["result"]
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: Gauge = register_gauge!(
        "kaspr_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

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
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => ready_response(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

fn ready_response() -> Response<Full<Bytes>> {
    if OPERATOR_HEALTH.get() >= 1.0 {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
