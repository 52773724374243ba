//! ---
//! mce_section: "01-core-functionality"
//! mce_subsection: "module"
//! mce_type: "source"
//! mce_scope: "code"
//! mce_description: "Collection pipeline stages and lifecycle management."
//! mce_version: "v0.1.0"
//! mce_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mce_metrics::PipelineMetrics;
use reqwest::StatusCode;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::types::{ProcessedMessage, RetryTicket};

/// HTTP client for the storage API. Cloned into every worker and into the
/// retry arbiter.
#[derive(Debug, Clone)]
pub struct StorageClient {
    http: reqwest::Client,
    base_url: String,
}

impl StorageClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build storage http client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    /// Persist one enriched record. Success is exactly 201; anything else
    /// is a failure.
    pub async fn store(&self, record: &ProcessedMessage) -> std::result::Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/message", self.base_url))
            .json(record)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::CREATED {
            return Err(ClientError::Status { status, body });
        }

        Ok(())
    }
}

/// Worker pool persisting the processed stream.
pub struct StorageStage {
    client: StorageClient,
    workers: usize,
    processed: mpsc::Receiver<ProcessedMessage>,
    retries: mpsc::Sender<RetryTicket>,
    metrics: Option<PipelineMetrics>,
}

impl StorageStage {
    pub fn new(
        client: StorageClient,
        workers: usize,
        processed: mpsc::Receiver<ProcessedMessage>,
        retries: mpsc::Sender<RetryTicket>,
        metrics: Option<PipelineMetrics>,
    ) -> Self {
        Self {
            client,
            workers,
            processed,
            retries,
            metrics,
        }
    }

    /// Drain the processed channel through the worker pool until it closes
    /// and every in-flight call has finished.
    pub async fn run(self) {
        let StorageStage {
            client,
            workers,
            processed,
            retries,
            metrics,
        } = self;

        info!(workers, "storage stage started");
        let processed = Arc::new(Mutex::new(processed));

        let mut tasks = Vec::with_capacity(workers);
        for worker in 0..workers {
            let processed = processed.clone();
            let client = client.clone();
            let retries = retries.clone();
            let metrics = metrics.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let next = { processed.lock().await.recv().await };
                    let Some(record) = next else { break };
                    store_one(&client, record, &retries, metrics.as_ref()).await;
                }
                debug!(worker, "storage worker drained");
            }));
        }

        drop(retries);

        for task in tasks {
            let _ = task.await;
        }
        info!("storage stage stopped");
    }
}

/// One storage call. Success is logged and the record dropped; failure
/// becomes a retry ticket with no reply path.
async fn store_one(
    client: &StorageClient,
    record: ProcessedMessage,
    retries: &mpsc::Sender<RetryTicket>,
    metrics: Option<&PipelineMetrics>,
) {
    match client.store(&record).await {
        Ok(()) => {
            if let Some(metrics) = metrics {
                metrics.inc_stored();
            }
            info!(message_id = %record.id(), "storage successful");
        }
        Err(err) => {
            warn!(message_id = %record.id(), error = %err, "storage failed; queueing retry");
            if let Some(metrics) = metrics {
                metrics.inc_retry_enqueued("storage");
            }
            if retries.send(RetryTicket::storage(record)).await.is_err() {
                debug!("retry channel closed; dropping ticket");
            }
        }
    }
}
