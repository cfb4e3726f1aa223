//! Prometheus metrics HTTP endpoint
//!
//! Exposes engine metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with context label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    context: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{context=\"{context}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    context: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ =
            writeln!(output, "{name}_bucket{{context=\"{context}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{context=\"{context}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{context=\"{context}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{context=\"{context}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
///
/// Scrapes read the cumulative snapshot, so they never steal ticks from the
/// periodic log reporter.
fn format_prometheus_metrics(metrics: &Metrics, context: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_signal_metrics(&mut output, context, &summary);
    write_collection_metrics(&mut output, context, &summary);
    write_tick_metrics(&mut output, context, &summary);

    output
}

fn write_signal_metrics(output: &mut String, context: &str, s: &MetricsSummary) {
    write_metric(
        output,
        "crate_drop_samples_accepted_total",
        "Position samples accepted by the filter",
        MetricType::Counter,
        context,
        s.samples_accepted,
    );
    let _ = writeln!(output, "# HELP crate_drop_samples_rejected_total Position samples rejected by the filter");
    let _ = writeln!(output, "# TYPE crate_drop_samples_rejected_total counter");
    let _ = writeln!(
        output,
        "crate_drop_samples_rejected_total{{context=\"{context}\",reason=\"accuracy\"}} {}",
        s.samples_rejected_accuracy
    );
    let _ = writeln!(
        output,
        "crate_drop_samples_rejected_total{{context=\"{context}\",reason=\"jump\"}} {}",
        s.samples_rejected_jump
    );
    write_metric(
        output,
        "crate_drop_heading_updates_total",
        "Heading changes that passed the debounce",
        MetricType::Counter,
        context,
        s.heading_updates,
    );
}

fn write_collection_metrics(output: &mut String, context: &str, s: &MetricsSummary) {
    write_metric(
        output,
        "crate_drop_fetches_total",
        "Nearby-crate fetches issued",
        MetricType::Counter,
        context,
        s.fetches_total,
    );
    write_metric(
        output,
        "crate_drop_fetch_failures_total",
        "Nearby-crate fetches that failed",
        MetricType::Counter,
        context,
        s.fetch_failures,
    );
    write_metric(
        output,
        "crate_drop_visible_crates",
        "Crates currently in the proximity index",
        MetricType::Gauge,
        context,
        s.visible_crates,
    );
    write_metric(
        output,
        "crate_drop_collections_total",
        "Collections confirmed by the remote store",
        MetricType::Counter,
        context,
        s.collections_total,
    );
    write_metric(
        output,
        "crate_drop_duplicates_total",
        "Collection attempts answered as already collected",
        MetricType::Counter,
        context,
        s.duplicates_total,
    );
    write_metric(
        output,
        "crate_drop_collection_failures_total",
        "Collection attempts that failed and will be retried",
        MetricType::Counter,
        context,
        s.collection_failures,
    );
    write_metric(
        output,
        "crate_drop_events_dropped_total",
        "Collection events dropped because the channel was full",
        MetricType::Counter,
        context,
        s.events_dropped,
    );
}

fn write_tick_metrics(output: &mut String, context: &str, s: &MetricsSummary) {
    write_metric(
        output,
        "crate_drop_ticks_total",
        "Accepted position ticks processed",
        MetricType::Counter,
        context,
        s.ticks_total,
    );
    write_histogram(
        output,
        "crate_drop_tick_latency_us",
        "Position tick processing latency in microseconds",
        context,
        &s.tick_buckets,
        s.tick_latency_sum_us,
    );
    write_metric(
        output,
        "crate_drop_tick_latency_p99_us",
        "99th percentile tick latency",
        MetricType::Gauge,
        context,
        s.tick_p99_us,
    );
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    context: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &context),
        ),
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok".to_string()),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    context: &'static str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let context = Arc::new(context.to_string());

    info!(port = %port, context = %context, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let context = context.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let context = context.clone();
                                async move { handle_request(req, metrics, context).await }
                            });

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::metrics::RejectKind;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_sample_accepted();
        metrics.record_sample_rejected(RejectKind::Jump);
        metrics.record_collection();
        metrics.set_visible_crates(4);
        metrics.record_tick(150);

        let output = format_prometheus_metrics(&metrics, "foreground");

        assert!(output.contains("crate_drop_samples_accepted_total{context=\"foreground\"} 1"));
        assert!(output
            .contains("crate_drop_samples_rejected_total{context=\"foreground\",reason=\"jump\"} 1"));
        assert!(output.contains("crate_drop_collections_total{context=\"foreground\"} 1"));
        assert!(output.contains("crate_drop_visible_crates{context=\"foreground\"} 4"));
        assert!(output.contains("crate_drop_tick_latency_us_bucket{context=\"foreground\",le=\"+Inf\"} 1"));
    }

    #[test]
    fn test_scrape_leaves_periodic_report_intact() {
        let metrics = Metrics::new();
        metrics.record_tick(150);
        metrics.record_tick(250);

        let first = format_prometheus_metrics(&metrics, "foreground");
        let second = format_prometheus_metrics(&metrics, "foreground");
        for output in [&first, &second] {
            assert!(output.contains("crate_drop_tick_latency_us_count{context=\"foreground\"} 2"));
            assert!(output.contains("crate_drop_tick_latency_us_sum{context=\"foreground\"} 400"));
        }

        let periodic = metrics.report();
        assert_eq!(periodic.tick_buckets.iter().sum::<u64>(), 2);
        assert_eq!(periodic.avg_tick_latency_us, 200);

        // Counters stay cumulative after the log reporter runs
        let third = format_prometheus_metrics(&metrics, "foreground");
        assert!(third.contains("crate_drop_tick_latency_us_count{context=\"foreground\"} 2"));
    }
}
