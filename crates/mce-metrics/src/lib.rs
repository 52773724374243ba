//! ---
//! mce_section: "03-observability"
//! mce_subsection: "module"
//! mce_type: "source"
//! mce_scope: "code"
//! mce_description: "Metrics collection and export utilities."
//! mce_version: "v0.1.0"
//! mce_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder, TEXT_FORMAT};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the daemon and the engine.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let local_addr = std_listener
        .local_addr()
        .with_context(|| "failed to resolve metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %local_addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Counters recorded by the collection pipeline.
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: SharedRegistry,
    batches_fetched: IntCounter,
    messages_collected: IntCounter,
    messages_processed: IntCounter,
    messages_stored: IntCounter,
    retries_enqueued: IntCounterVec,
    retries_exhausted: IntCounterVec,
    source_errors: IntCounterVec,
}

impl PipelineMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let batches_fetched = IntCounter::with_opts(Opts::new(
            "mce_source_batches_total",
            "Batches successfully fetched from the source API",
        ))?;
        registry.register(Box::new(batches_fetched.clone()))?;

        let messages_collected = IntCounter::with_opts(Opts::new(
            "mce_messages_collected_total",
            "Messages handed from the source stage to processing",
        ))?;
        registry.register(Box::new(messages_collected.clone()))?;

        let messages_processed = IntCounter::with_opts(Opts::new(
            "mce_messages_processed_total",
            "Messages successfully enriched by the processing API",
        ))?;
        registry.register(Box::new(messages_processed.clone()))?;

        let messages_stored = IntCounter::with_opts(Opts::new(
            "mce_messages_stored_total",
            "Enriched records accepted by the storage API",
        ))?;
        registry.register(Box::new(messages_stored.clone()))?;

        let retries_enqueued = IntCounterVec::new(
            Opts::new(
                "mce_retries_enqueued_total",
                "Retry tickets queued for the arbiter by originating service",
            ),
            &["service"],
        )?;
        registry.register(Box::new(retries_enqueued.clone()))?;

        let retries_exhausted = IntCounterVec::new(
            Opts::new(
                "mce_retries_exhausted_total",
                "Retry tickets dropped after the attempt budget ran out",
            ),
            &["service"],
        )?;
        registry.register(Box::new(retries_exhausted.clone()))?;

        let source_errors = IntCounterVec::new(
            Opts::new(
                "mce_source_errors_total",
                "Source fetch failures by classification",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(source_errors.clone()))?;

        Ok(Self {
            registry,
            batches_fetched,
            messages_collected,
            messages_processed,
            messages_stored,
            retries_enqueued,
            retries_exhausted,
            source_errors,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_batch(&self, messages: usize) {
        self.batches_fetched.inc();
        self.messages_collected.inc_by(messages as u64);
    }

    pub fn inc_processed(&self) {
        self.messages_processed.inc();
    }

    pub fn inc_stored(&self) {
        self.messages_stored.inc();
    }

    pub fn inc_retry_enqueued(&self, service: &str) {
        self.retries_enqueued.with_label_values(&[service]).inc();
    }

    pub fn inc_retry_exhausted(&self, service: &str) {
        self.retries_exhausted.with_label_values(&[service]).inc();
    }

    pub fn inc_source_error(&self, kind: &str) {
        self.source_errors.with_label_values(&[kind]).inc();
    }
}

pub use prometheus;
