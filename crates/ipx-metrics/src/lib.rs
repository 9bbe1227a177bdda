use anyhow::{Context, Result};
use axum::{Router, response::Html, routing::get};
use ipx_core::Tables;
use ipx_save::SaveCommand;
use prometheus::{Encoder, Gauge, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Metrics collector for iptables counters
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // Scrape metrics
    scrape_duration: Gauge,
    scrape_success: IntGauge,

    // Chain default policy metrics
    default_packets: IntCounterVec,
    default_bytes: IntCounterVec,

    // Rule metrics
    rule_packets: IntCounterVec,
    rule_bytes: IntCounterVec,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        // Scrape metrics
        let scrape_duration = Gauge::with_opts(Opts::new(
            "iptables_scrape_duration_seconds",
            "iptables_exporter: Duration of scraping iptables.",
        ))?;
        registry.register(Box::new(scrape_duration.clone()))?;

        let scrape_success = IntGauge::with_opts(Opts::new(
            "iptables_scrape_success",
            "iptables_exporter: Whether scraping iptables succeeded.",
        ))?;
        registry.register(Box::new(scrape_success.clone()))?;

        // Chain default policy metrics
        let default_bytes = IntCounterVec::new(
            Opts::new(
                "iptables_default_bytes_total",
                "iptables_exporter: Total bytes matching a chain's default policy.",
            ),
            &["table", "chain", "policy"],
        )?;
        registry.register(Box::new(default_bytes.clone()))?;

        let default_packets = IntCounterVec::new(
            Opts::new(
                "iptables_default_packets_total",
                "iptables_exporter: Total packets matching a chain's default policy.",
            ),
            &["table", "chain", "policy"],
        )?;
        registry.register(Box::new(default_packets.clone()))?;

        // Rule metrics
        let rule_bytes = IntCounterVec::new(
            Opts::new(
                "iptables_rule_bytes_total",
                "iptables_exporter: Total bytes matching a rule.",
            ),
            &["table", "chain", "rule"],
        )?;
        registry.register(Box::new(rule_bytes.clone()))?;

        let rule_packets = IntCounterVec::new(
            Opts::new(
                "iptables_rule_packets_total",
                "iptables_exporter: Total packets matching a rule.",
            ),
            &["table", "chain", "rule"],
        )?;
        registry.register(Box::new(rule_packets.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            scrape_duration,
            scrape_success,
            default_packets,
            default_bytes,
            rule_packets,
            rule_bytes,
        })
    }

    /// Replace the chain and rule series with the given tables.
    ///
    /// Series for chains or rules that are gone are dropped.
    pub fn update_tables(&self, tables: &Tables) {
        self.clear_tables();

        for (table_name, table) in tables {
            for (chain_name, chain) in table {
                let labels = [table_name.as_str(), chain_name.as_str(), chain.policy.as_str()];
                self.default_packets
                    .with_label_values(&labels)
                    .inc_by(chain.packets);
                self.default_bytes
                    .with_label_values(&labels)
                    .inc_by(chain.bytes);

                for rule in &chain.rules {
                    let labels = [table_name.as_str(), chain_name.as_str(), rule.text.as_str()];
                    self.rule_packets
                        .with_label_values(&labels)
                        .inc_by(rule.packets);
                    self.rule_bytes.with_label_values(&labels).inc_by(rule.bytes);
                }
            }
        }
    }

    /// Drop every chain and rule series
    pub fn clear_tables(&self) {
        self.default_packets.reset();
        self.default_bytes.reset();
        self.rule_packets.reset();
        self.rule_bytes.reset();
    }

    /// Record the outcome of one collection cycle
    pub fn record_scrape(&self, success: bool, duration: Duration) {
        self.scrape_duration.set(duration.as_secs_f64());
        self.scrape_success.set(if success { 1 } else { 0 });
    }

    /// Render metrics in Prometheus text format
    pub fn render_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Run one collection cycle and render the registry.
///
/// Collection failures are recorded in `iptables_scrape_success` and
/// logged, never returned.
pub async fn scrape(collector: &MetricsCollector, command: &SaveCommand) -> Result<String> {
    let start = Instant::now();
    let result = command.collect().await;
    let duration = start.elapsed();

    match result {
        Ok(tables) => {
            collector.record_scrape(true, duration);
            collector.update_tables(&tables);
            tracing::debug!(
                tables = tables.len(),
                duration_ms = duration.as_millis() as u64,
                "scrape succeeded"
            );
        }
        Err(err) => {
            collector.record_scrape(false, duration);
            collector.clear_tables();
            tracing::error!(reason = err.reason(), err = %err, "failed during metric collection");
        }
    }

    collector.render_metrics()
}

fn landing_page(metrics_path: &str) -> String {
    format!(
        r#"<html>
  <head><title>iptables exporter</title></head>
  <body>
    <h1>iptables exporter</h1>
    <p><a href="{}">Metrics</a></p>
  </body>
</html>
"#,
        metrics_path
    )
}

/// HTTP server for Prometheus metrics endpoint
pub struct MetricsServer {
    collector: Arc<RwLock<MetricsCollector>>,
    command: Arc<SaveCommand>,
    addr: SocketAddr,
    metrics_path: String,
}

impl MetricsServer {
    pub fn new(
        collector: MetricsCollector,
        command: SaveCommand,
        addr: SocketAddr,
        metrics_path: &str,
    ) -> Self {
        Self {
            collector: Arc::new(RwLock::new(collector)),
            command: Arc::new(command),
            addr,
            metrics_path: metrics_path.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        let collector = self.collector.clone();
        let command = self.command.clone();
        let page = landing_page(&self.metrics_path);

        Router::new()
            .route(
                &self.metrics_path,
                get(move || {
                    let collector = collector.clone();
                    let command = command.clone();
                    async move {
                        // one scrape at a time, the vectors are reset and refilled
                        let collector = collector.write().await;
                        match scrape(&collector, &command).await {
                            Ok(metrics) => metrics,
                            Err(e) => format!("# Error rendering metrics: {}", e),
                        }
                    }
                }),
            )
            .route(
                "/",
                get(move || {
                    let page = page.clone();
                    async move { Html(page) }
                }),
            )
    }

    /// Start the metrics HTTP server
    pub async fn serve(self) -> Result<()> {
        let app = self.router();

        tracing::info!(
            listen_address = %self.addr,
            metrics_path = %self.metrics_path,
            "Listening on"
        );

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.addr))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("metrics server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
