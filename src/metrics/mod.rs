//! Prometheus metrics for the replication monitor
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Monitor metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    /// Probe results by outcome
    pub probes_total: IntCounterVec,
    /// Server state transitions by new state
    pub state_transitions_total: IntCounterVec,
    /// Current number of servers per state
    pub server_states: IntGaugeVec,
    /// Master semi-sync status (1 when at least one replica acks writes)
    pub master_semi_sync: IntGauge,
    /// Master replication status
    pub master_rpl_status: IntGauge,
    /// Alerts dispatched
    pub alerts_total: IntCounter,
    /// Completed failovers
    pub failovers_total: IntCounter,
    /// Rejoin attempts by outcome
    pub rejoins_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let probes_total = IntCounterVec::new(
            Opts::new("argus_probes_total", "Probe results by outcome"),
            &["result"], // success, failure
        )
        .unwrap();

        let state_transitions_total = IntCounterVec::new(
            Opts::new(
                "argus_state_transitions_total",
                "Server state transitions by new state",
            ),
            &["state"],
        )
        .unwrap();

        let server_states = IntGaugeVec::new(
            Opts::new("argus_server_states", "Current number of servers per state"),
            &["state"],
        )
        .unwrap();

        let master_semi_sync = IntGauge::new(
            "argus_master_semi_sync",
            "Whether the master reports semi-sync replication active",
        )
        .unwrap();

        let master_rpl_status = IntGauge::new(
            "argus_master_rpl_status",
            "Whether the master reports healthy replication status",
        )
        .unwrap();

        let alerts_total =
            IntCounter::new("argus_alerts_total", "Alerts dispatched").unwrap();

        let failovers_total =
            IntCounter::new("argus_failovers_total", "Completed failovers").unwrap();

        let rejoins_total = IntCounterVec::new(
            Opts::new("argus_rejoins_total", "Rejoin attempts by outcome"),
            &["result"], // success, failure
        )
        .unwrap();

        registry.register(Box::new(probes_total.clone())).unwrap();
        registry
            .register(Box::new(state_transitions_total.clone()))
            .unwrap();
        registry.register(Box::new(server_states.clone())).unwrap();
        registry
            .register(Box::new(master_semi_sync.clone()))
            .unwrap();
        registry
            .register(Box::new(master_rpl_status.clone()))
            .unwrap();
        registry.register(Box::new(alerts_total.clone())).unwrap();
        registry
            .register(Box::new(failovers_total.clone()))
            .unwrap();
        registry.register(Box::new(rejoins_total.clone())).unwrap();

        Self {
            registry,
            probes_total,
            state_transitions_total,
            server_states,
            master_semi_sync,
            master_rpl_status,
            alerts_total,
            failovers_total,
            rejoins_total,
        }
    }

    /// Record one probe result
    pub fn record_probe(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.probes_total.with_label_values(&[result]).inc();
    }

    /// Record a state transition
    pub fn record_transition(&self, state: &str) {
        self.state_transitions_total
            .with_label_values(&[state])
            .inc();
    }

    /// Publish the master's semi-sync and replication status booleans
    pub fn set_master_up_and_sync(&self, semi_sync: bool, rpl_status: bool) {
        self.master_semi_sync.set(semi_sync as i64);
        self.master_rpl_status.set(rpl_status as i64);
    }

    /// Update the per-state server counts
    pub fn set_server_state_count(&self, state: &str, count: i64) {
        self.server_states.with_label_values(&[state]).set(count);
    }

    pub fn record_alert(&self) {
        self.alerts_total.inc();
    }

    pub fn record_failover(&self) {
        self.failovers_total.inc();
    }

    pub fn record_rejoin(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.rejoins_total.with_label_values(&[result]).inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let (status, body) = match req.uri().path() {
            "/metrics" => (StatusCode::OK, metrics().gather()),
            "/health" => (StatusCode::OK, "OK".to_string()),
            _ => (StatusCode::NOT_FOUND, "Not Found".to_string()),
        };
        Ok(Response::builder()
            .status(status)
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(body)))
            .unwrap())
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
