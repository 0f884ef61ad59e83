//! Prometheus metrics for a plexrpc node.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - The request observer fed by every completed call
//! - HTTP server to expose metrics at `/metrics`

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use plexrpc_core::{CompletedRequest, RequestObserver};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Request duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Prometheus metrics for a plexrpc node.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total socket connections accepted.
    pub connections_total: Counter,
    /// Currently open socket connections.
    pub connections_active: Gauge,
    /// Completed calls by transport kind.
    pub requests_total: CounterVec,
    /// Failed calls by error code.
    pub errors_total: CounterVec,
    /// Call duration by transport kind.
    pub request_duration: HistogramVec,
    /// Peers currently in the peer table.
    pub cluster_peers: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "plexrpc_connections_total",
            "Total number of socket connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "plexrpc_connections_active",
            "Number of currently open socket connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let requests_total = CounterVec::new(
            Opts::new("plexrpc_requests_total", "Completed calls by transport"),
            &["transport"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("plexrpc_errors_total", "Failed calls by error code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "plexrpc_request_duration_seconds",
                "Call duration in seconds by transport",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["transport"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let cluster_peers = Gauge::with_opts(Opts::new(
            "plexrpc_cluster_peers",
            "Peers with a known capability snapshot",
        ))?;
        registry.register(Box::new(cluster_peers.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            requests_total,
            errors_total,
            request_duration,
            cluster_peers,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl RequestObserver for Metrics {
    fn request_completed(&self, request: &CompletedRequest<'_>) {
        let transport = request.transport.as_str();
        self.requests_total.with_label_values(&[transport]).inc();
        self.request_duration
            .with_label_values(&[transport])
            .observe(request.elapsed.as_secs_f64());
        if let Some(code) = request.error {
            self.errors_total.with_label_values(&[code.as_str()]).inc();
        }
    }
}

/// Serves `/metrics` and `/health` until shutdown.
pub async fn run_metrics_server(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Metrics server listening on http://{}/metrics", addr);
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, &metrics) }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }
}

fn handle_request<B>(
    req: Request<B>,
    metrics: &Metrics,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => text(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                body,
            ),
            Err(e) => {
                tracing::error!("Failed to encode metrics: {}", e);
                text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    "encoding failed",
                )
            }
        },
        "/health" | "/healthz" => text(StatusCode::OK, "text/plain", "OK"),
        _ => text(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };
    Ok(response)
}

pub(crate) fn text(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
