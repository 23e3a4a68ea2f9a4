//! Server metrics in Prometheus text format (rate, errors, duration per operation).

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Operation labels, in render order.
pub const OPERATIONS: [&str; 9] = [
    "bind", "search", "add", "modify", "delete", "modify_dn", "compare", "extended", "other",
];

/// Upper bounds of the duration histogram buckets in seconds; +Inf is the count.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Buckets are stored non-cumulatively and summed at render time.
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct OperationMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    duration: DurationHistogram,
}

/// Lock-free counters shared by every connection task.
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    parse_errors: AtomicU64,
    operations: [OperationMetrics; 9],
    /// (operation, result code) -> responses sent.
    results: DashMap<(&'static str, u32), AtomicU64>,
}

fn operation_index(op: &str) -> usize {
    OPERATIONS.iter().position(|o| *o == op).unwrap_or(OPERATIONS.len() - 1)
}

fn label(op: &str) -> &'static str {
    OPERATIONS[operation_index(op)]
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    /// Unknown operation names count as "other".
    #[inline]
    pub fn inc_request(&self, op: &str) {
        self.operations[operation_index(op)].requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_error(&self, op: &str) {
        self.operations[operation_index(op)].errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn observe_duration(&self, op: &str, duration: Duration) {
        self.operations[operation_index(op)].duration.observe(duration);
    }

    /// Malformed PDUs that ended a connection.
    #[inline]
    pub fn inc_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Result code of a response sent for `op`.
    pub fn inc_result(&self, op: &str, code: u32) {
        self.results
            .entry((label(op), code))
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self, op: &str) -> u64 {
        self.operations[operation_index(op)].requests.load(Ordering::Relaxed)
    }

    pub fn errors(&self, op: &str) -> u64 {
        self.operations[operation_index(op)].errors.load(Ordering::Relaxed)
    }

    /// Prometheus exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# HELP ldap_engine_connections_total Total number of client connections accepted.\n");
        out.push_str("# TYPE ldap_engine_connections_total counter\n");
        out.push_str(&format!(
            "ldap_engine_connections_total {}\n",
            self.connections_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_engine_connections_active Client connections currently open.\n");
        out.push_str("# TYPE ldap_engine_connections_active gauge\n");
        out.push_str(&format!("ldap_engine_connections_active {}\n", self.active_connections()));

        out.push_str("# HELP ldap_engine_parse_errors_total Connections ended by an undecodable LDAP message.\n");
        out.push_str("# TYPE ldap_engine_parse_errors_total counter\n");
        out.push_str(&format!(
            "ldap_engine_parse_errors_total {}\n",
            self.parse_errors.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_engine_requests_total Requests completed by operation.\n");
        out.push_str("# TYPE ldap_engine_requests_total counter\n");
        for (op, m) in OPERATIONS.iter().zip(&self.operations) {
            out.push_str(&format!(
                "ldap_engine_requests_total{{op=\"{}\"}} {}\n",
                op,
                m.requests.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_engine_errors_total Requests answered with an error by operation.\n");
        out.push_str("# TYPE ldap_engine_errors_total counter\n");
        for (op, m) in OPERATIONS.iter().zip(&self.operations) {
            out.push_str(&format!(
                "ldap_engine_errors_total{{op=\"{}\"}} {}\n",
                op,
                m.errors.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_engine_results_total Responses sent by operation and LDAP result code.\n");
        out.push_str("# TYPE ldap_engine_results_total counter\n");
        let mut results: Vec<_> = self
            .results
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect();
        results.sort();
        for ((op, code), count) in results {
            out.push_str(&format!(
                "ldap_engine_results_total{{op=\"{}\",code=\"{}\",name=\"{}\"}} {}\n",
                op,
                code,
                crate::result_code::name(code),
                count
            ));
        }

        out.push_str("# HELP ldap_engine_request_duration_seconds Request duration in seconds by operation.\n");
        out.push_str("# TYPE ldap_engine_request_duration_seconds histogram\n");
        for (op, m) in OPERATIONS.iter().zip(&self.operations) {
            let hist = &m.duration;
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_engine_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_engine_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_engine_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "ldap_engine_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }

        out
    }
}

/// Body of GET /ready.
#[derive(Serialize)]
struct ReadyBody {
    ready: bool,
    active_connections: u64,
}

/// Path from an HTTP request line ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let line = first_line.trim();
    let mut parts = line.split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

/// HTTP endpoint for GET /metrics, GET /health (liveness) and GET /ready
/// (200 once `ready` reports the LDAP listener is accepting, 503 before).
pub async fn run_metrics_server(
    addr: &str,
    metrics: Arc<Metrics>,
    ready: Arc<dyn Fn() -> bool + Send + Sync>,
) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;

    info!("Metrics server listening on http://{} (GET /metrics, /health, /ready)", socket_addr);

    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        let ready = Arc::clone(&ready);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") || total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");

            let (status, body, content_type) = match path {
                "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
                "/ready" => {
                    let is_ready = ready();
                    let body = serde_json::to_string(&ReadyBody {
                        ready: is_ready,
                        active_connections: metrics.active_connections(),
                    })
                    .unwrap_or_else(|_| r#"{"ready":false,"error":"serialize"}"#.to_string());
                    let status = if is_ready { "200 OK" } else { "503 Service Unavailable" };
                    (status, body, "application/json")
                }
                "/metrics" => ("200 OK", metrics.render(), "text/plain; charset=utf-8"),
                _ => (
                    "404 Not Found",
                    "Not found. Supported: GET /metrics, GET /health, GET /ready.\n".to_string(),
                    "text/plain; charset=utf-8",
                ),
            };
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}
