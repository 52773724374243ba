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

use anyhow::{Context, Result};
use mce_metrics::PipelineMetrics;
use reqwest::StatusCode;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::types::{Message, MessageBatch};

/// Pause applied after the source answers 429.
pub const THROTTLE_BACKOFF: Duration = Duration::from_secs(30);
/// Pause applied after any other fetch failure, keeping the loop from
/// hot-spinning against a broken or empty source.
pub const ERROR_WAIT: Duration = Duration::from_millis(500);

const AUTH_HEADER: &str = "X-Auth-Token";

/// Settings consumed by [`SourceStage`]. The pacing fields default to the
/// production constants; tests compress them.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub base_url: String,
    pub auth_token: String,
    pub timeout: Duration,
    /// Maximum requests per window. Zero disables the cap.
    pub rate_limit: u32,
    pub rate_limit_period: Duration,
    pub throttle_backoff: Duration,
    pub error_wait: Duration,
}

impl SourceSettings {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: auth_token.into(),
            timeout: Duration::from_secs(5),
            rate_limit: 0,
            rate_limit_period: Duration::from_secs(1),
            throttle_backoff: THROTTLE_BACKOFF,
            error_wait: ERROR_WAIT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, limit: u32, period: Duration) -> Self {
        self.rate_limit = limit;
        self.rate_limit_period = period;
        self
    }

    /// Override the error pacing. Intended for tests; the file configuration
    /// does not expose these.
    pub fn with_pacing(mut self, throttle_backoff: Duration, error_wait: Duration) -> Self {
        self.throttle_backoff = throttle_backoff;
        self.error_wait = error_wait;
        self
    }
}

/// HTTP client walking the cursor-paginated source feed under a fixed-window
/// request budget. The cursor is owned here and never read by another stage.
pub struct SourceClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: String,
    cursor: Option<i64>,
    requests_count: u32,
    requests_limit: u32,
}

impl SourceClient {
    pub fn new(settings: &SourceSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("failed to build source http client")?;
        Ok(Self {
            http,
            base_url: settings.base_url.clone(),
            auth_token: settings.auth_token.clone(),
            cursor: None,
            requests_count: 0,
            requests_limit: settings.rate_limit,
        })
    }

    /// Cursor of the last successfully parsed non-empty response.
    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    /// Requests issued in the current window.
    pub fn requests_count(&self) -> u32 {
        self.requests_count
    }

    /// Reset the window counter. Driven by the stage ticker.
    pub fn reset_window(&mut self) {
        self.requests_count = 0;
    }

    /// Fetch the next batch. Suppressed without a wire call when the window
    /// budget is spent; every issued request counts against the budget even
    /// when it fails in transit. The cursor only moves on a parsed non-empty
    /// 200 response.
    pub async fn fetch_batch(&mut self) -> std::result::Result<Vec<Message>, SourceError> {
        if self.requests_limit > 0 && self.requests_count >= self.requests_limit {
            return Err(SourceError::RateBudgetExhausted);
        }

        let url = match self.cursor {
            Some(cursor) => format!("{}/messages/{}", self.base_url, cursor),
            None => format!("{}/messages", self.base_url),
        };
        debug!(url = %url, "requesting message batch");

        self.requests_count += 1;
        let response = self
            .http
            .get(&url)
            .header(AUTH_HEADER, &self.auth_token)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(SourceError::Status { status, body });
        }

        let batch: MessageBatch = serde_json::from_str(&body)?;
        if batch.results.is_empty() {
            return Err(SourceError::EmptyResults);
        }

        self.cursor = batch.cursor;
        Ok(batch.results)
    }
}

/// Pull-loop stage feeding the processing pool. Owns the sole sender of the
/// batch channel, so returning from [`SourceStage::run`] closes it.
pub struct SourceStage {
    client: SourceClient,
    batches: mpsc::Sender<Vec<Message>>,
    rate_limit_period: Duration,
    throttle_backoff: Duration,
    error_wait: Duration,
    metrics: Option<PipelineMetrics>,
}

impl SourceStage {
    pub fn new(
        settings: SourceSettings,
        batches: mpsc::Sender<Vec<Message>>,
        metrics: Option<PipelineMetrics>,
    ) -> Result<Self> {
        let client = SourceClient::new(&settings)?;
        Ok(Self {
            client,
            batches,
            rate_limit_period: settings.rate_limit_period,
            throttle_backoff: settings.throttle_backoff,
            error_wait: settings.error_wait,
            metrics,
        })
    }

    /// Run the pull loop until the shutdown broadcast fires or the
    /// downstream goes away.
    ///
    /// The loop multiplexes three events: the window ticker resetting the
    /// request counter, the cancellation signal, and a send-capacity permit
    /// on the batch channel. Reserving capacity before fetching is what
    /// turns downstream saturation into backpressure: a busy processing pool
    /// stops the source from burning its request budget.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("source stage started");
        let mut window = tokio::time::interval(self.rate_limit_period);
        window.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = window.tick() => {
                    self.client.reset_window();
                }
                _ = shutdown.recv() => {
                    info!("source stage received shutdown signal; closing batch channel");
                    return;
                }
                permit = self.batches.reserve() => {
                    let Ok(permit) = permit else {
                        info!("batch channel closed downstream; source stage stopping");
                        return;
                    };
                    match self.client.fetch_batch().await {
                        Ok(batch) => {
                            if let Some(metrics) = &self.metrics {
                                metrics.record_batch(batch.len());
                            }
                            debug!(messages = batch.len(), cursor = ?self.client.cursor(), "batch fetched");
                            permit.send(batch);
                        }
                        Err(err) => {
                            if let Some(metrics) = &self.metrics {
                                metrics.inc_source_error(err.kind());
                            }
                            self.pause_after(&err).await;
                            // The held permit carries an empty batch so the
                            // hand-off slot is not leaked; workers skip it.
                            permit.send(Vec::new());
                        }
                    }
                }
            }
        }
    }

    /// Status-specific pacing: a 429 earns the long throttle backoff, every
    /// other failure the short error wait. The cursor is untouched on every
    /// path through here.
    async fn pause_after(&self, err: &SourceError) {
        if err.is_throttle() {
            warn!(error = %err, backoff = ?self.throttle_backoff, "source throttled; backing off");
            tokio::time::sleep(self.throttle_backoff).await;
        } else {
            warn!(error = %err, wait = ?self.error_wait, "source fetch failed");
            tokio::time::sleep(self.error_wait).await;
        }
    }
}
