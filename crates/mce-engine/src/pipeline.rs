//! ---
//! mce_section: "01-core-functionality"
//! mce_subsection: "module"
//! mce_type: "source"
//! mce_scope: "code"
//! mce_description: "Collection pipeline stages and lifecycle management."
//! mce_version: "v0.1.0"
//! mce_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use mce_metrics::PipelineMetrics;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::processing::{ProcessingClient, ProcessingStage};
use crate::retry::RetryStage;
use crate::source::{SourceSettings, SourceStage};
use crate::storage::{StorageClient, StorageStage};

/// Capacity of the three pipeline channels. The tokio minimum stands in for
/// the rendezvous hand-off the topology is built around: a sender parks
/// until the consumer side has room for exactly one item.
const CHANNEL_CAPACITY: usize = 1;

/// Everything the supervisor needs to construct the four stages.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source: SourceSettings,
    pub processing_base_url: String,
    pub processing_timeout: Duration,
    pub processing_workers: usize,
    pub storage_base_url: String,
    pub storage_timeout: Duration,
    pub storage_workers: usize,
}

/// Supervisor composing the source, processing, storage, and retry stages.
pub struct CollectionPipeline {
    config: PipelineConfig,
    metrics: Option<PipelineMetrics>,
}

impl CollectionPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    /// Attach pipeline counters backed by a shared registry.
    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Wire the channels, construct the stages, and launch each on its own
    /// task. The retry arbiter re-uses clones of the processing and storage
    /// clients rather than owning connections of its own.
    pub fn start(self) -> Result<PipelineHandle> {
        let (batches_tx, batches_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (processed_tx, processed_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (retries_tx, retries_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        let processing_workers = self.config.processing_workers;
        let storage_workers = self.config.storage_workers;

        let processing_client = ProcessingClient::new(
            self.config.processing_base_url.clone(),
            self.config.processing_timeout,
        )?;
        let storage_client = StorageClient::new(
            self.config.storage_base_url.clone(),
            self.config.storage_timeout,
        )?;

        let source = SourceStage::new(self.config.source, batches_tx, self.metrics.clone())?;
        let processing = ProcessingStage::new(
            processing_client.clone(),
            processing_workers,
            batches_rx,
            processed_tx,
            retries_tx.clone(),
            self.metrics.clone(),
        );
        let storage = StorageStage::new(
            storage_client.clone(),
            storage_workers,
            processed_rx,
            retries_tx,
            self.metrics.clone(),
        );
        let retry = RetryStage::new(
            processing_client,
            storage_client,
            retries_rx,
            self.metrics.clone(),
        );

        let tasks: Vec<(&'static str, JoinHandle<()>)> = vec![
            ("source", tokio::spawn(source.run(shutdown_tx.subscribe()))),
            ("processing", tokio::spawn(processing.run())),
            ("storage", tokio::spawn(storage.run())),
            ("retry", tokio::spawn(retry.run(shutdown_tx.subscribe()))),
        ];

        info!(
            processing_workers,
            storage_workers, "collection pipeline started"
        );
        Ok(PipelineHandle {
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

/// Handle returned from [`CollectionPipeline::start`] used to drain and
/// stop the stages.
pub struct PipelineHandle {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl PipelineHandle {
    /// Broadcast the cancellation once and await the stages in cascade
    /// order: the source closes the batch channel, processing drains it and
    /// lets the processed channel close, storage drains that, and the
    /// arbiter drops whatever tickets were still in flight.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        for (stage, task) in self.tasks {
            if let Err(err) = task.await {
                error!(stage, error = %err, "stage task join error");
            }
        }
        info!("collection pipeline shutdown complete");
        Ok(())
    }
}
