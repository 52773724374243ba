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
use crate::types::{Message, ProcessedMessage, RetryTicket};

/// HTTP client for the enrichment API. Cloned into every worker and into
/// the retry arbiter.
#[derive(Debug, Clone)]
pub struct ProcessingClient {
    http: reqwest::Client,
    base_url: String,
}

impl ProcessingClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build processing http client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    /// Submit one message for enrichment. Success is a 200 carrying the
    /// enriched record.
    pub async fn submit(&self, message: &Message) -> std::result::Result<ProcessedMessage, ClientError> {
        let response = self
            .http
            .post(format!("{}/message", self.base_url))
            .json(message)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(ClientError::Status { status, body });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

/// Worker pool draining the batch channel into the enrichment API.
pub struct ProcessingStage {
    client: ProcessingClient,
    workers: usize,
    batches: mpsc::Receiver<Vec<Message>>,
    processed: mpsc::Sender<ProcessedMessage>,
    retries: mpsc::Sender<RetryTicket>,
    metrics: Option<PipelineMetrics>,
}

impl ProcessingStage {
    pub fn new(
        client: ProcessingClient,
        workers: usize,
        batches: mpsc::Receiver<Vec<Message>>,
        processed: mpsc::Sender<ProcessedMessage>,
        retries: mpsc::Sender<RetryTicket>,
        metrics: Option<PipelineMetrics>,
    ) -> Self {
        Self {
            client,
            workers,
            batches,
            processed,
            retries,
            metrics,
        }
    }

    /// Fan the batch stream out over the worker pool and block until the
    /// upstream channel closes and every in-flight call has finished. The
    /// processed channel closes once the last sender is gone: the workers'
    /// clones dropped here plus any clone still travelling inside a retry
    /// ticket.
    pub async fn run(self) {
        let ProcessingStage {
            client,
            workers,
            batches,
            processed,
            retries,
            metrics,
        } = self;

        info!(workers, "processing stage started");
        let batches = Arc::new(Mutex::new(batches));

        let mut tasks = Vec::with_capacity(workers);
        for worker in 0..workers {
            let batches = batches.clone();
            let client = client.clone();
            let processed = processed.clone();
            let retries = retries.clone();
            let metrics = metrics.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let next = { batches.lock().await.recv().await };
                    let Some(batch) = next else { break };
                    for message in batch {
                        enrich_one(&client, message, &processed, &retries, metrics.as_ref())
                            .await;
                    }
                }
                debug!(worker, "processing worker drained");
            }));
        }

        // The stage's own sender copies must not keep the downstream
        // channels open after the workers are done.
        drop(processed);
        drop(retries);

        for task in tasks {
            let _ = task.await;
        }
        info!("processing stage stopped");
    }
}

/// One enrichment call. Failures of any kind become a retry ticket that
/// carries a handle to the processed stream; the worker itself never
/// retries.
async fn enrich_one(
    client: &ProcessingClient,
    message: Message,
    processed: &mpsc::Sender<ProcessedMessage>,
    retries: &mpsc::Sender<RetryTicket>,
    metrics: Option<&PipelineMetrics>,
) {
    match client.submit(&message).await {
        Ok(record) => {
            if let Some(metrics) = metrics {
                metrics.inc_processed();
            }
            if processed.send(record).await.is_err() {
                debug!(message_id = %message.id, "processed channel closed; dropping enriched record");
            }
        }
        Err(err) => {
            warn!(message_id = %message.id, error = %err, "enrichment failed; queueing retry");
            if let Some(metrics) = metrics {
                metrics.inc_retry_enqueued("processing");
            }
            let ticket = RetryTicket::processing(message, processed.clone());
            if retries.send(ticket).await.is_err() {
                debug!("retry channel closed; dropping ticket");
            }
        }
    }
}
