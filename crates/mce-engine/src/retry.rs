//! ---
//! mce_section: "01-core-functionality"
//! mce_subsection: "module"
//! mce_type: "source"
//! mce_scope: "code"
//! mce_description: "Collection pipeline stages and lifecycle management."
//! mce_version: "v0.1.0"
//! mce_owner: "tbd"
//! ---
use mce_metrics::PipelineMetrics;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::processing::ProcessingClient;
use crate::storage::StorageClient;
use crate::types::{RetryPayload, RetryTicket};

/// Single consumer of the retry channel. Serialises retry traffic for both
/// downstream services: one outstanding HTTP call at a time, strictly FIFO
/// over the tickets, no priority between services. The arbiter is a
/// congestion relief valve, not a second pipeline.
pub struct RetryStage {
    processing: ProcessingClient,
    storage: StorageClient,
    tickets: mpsc::Receiver<RetryTicket>,
    metrics: Option<PipelineMetrics>,
}

impl RetryStage {
    pub fn new(
        processing: ProcessingClient,
        storage: StorageClient,
        tickets: mpsc::Receiver<RetryTicket>,
        metrics: Option<PipelineMetrics>,
    ) -> Self {
        Self {
            processing,
            storage,
            tickets,
            metrics,
        }
    }

    /// Consume tickets until the shutdown broadcast fires or every producer
    /// is gone. Tickets still queued when the signal arrives are dropped.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("retry arbiter started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("retry arbiter received shutdown signal; stopping");
                    return;
                }
                ticket = self.tickets.recv() => {
                    match ticket {
                        Some(ticket) => self.drive(ticket).await,
                        None => {
                            info!("retry channel closed; arbiter stopping");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Drive one ticket to terminal success or a terminal failure log. The
    /// attempt counter moves before each call, so a ticket is never worked
    /// past its budget; the client timeout is the only pacing between
    /// attempts.
    async fn drive(&self, mut ticket: RetryTicket) {
        while ticket.attempts < ticket.max_attempts {
            ticket.attempts += 1;
            match &ticket.payload {
                RetryPayload::Processing(message) => match self.processing.submit(message).await {
                    Ok(record) => {
                        if let Some(reply) = &ticket.reply {
                            if reply.send(record).await.is_err() {
                                debug!(message_id = %ticket.message_id(), "reply channel closed; recovered record dropped");
                            }
                        }
                        return;
                    }
                    Err(err) => {
                        warn!(
                            message_id = %ticket.message_id(),
                            attempt = ticket.attempts,
                            error = %err,
                            "processing retry attempt failed"
                        );
                    }
                },
                RetryPayload::Storage(record) => match self.storage.store(record).await {
                    Ok(()) => {
                        info!(message_id = %ticket.message_id(), "storage successful on retry");
                        return;
                    }
                    Err(err) => {
                        warn!(
                            message_id = %ticket.message_id(),
                            attempt = ticket.attempts,
                            error = %err,
                            "storage retry attempt failed"
                        );
                    }
                },
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.inc_retry_exhausted(ticket.service());
        }
        error!(
            message_id = %ticket.message_id(),
            service = ticket.service(),
            "retry budget exhausted; dropping message"
        );
    }
}
