//! ---
//! mce_section: "01-core-functionality"
//! mce_subsection: "module"
//! mce_type: "source"
//! mce_scope: "code"
//! mce_description: "Collection pipeline stages and lifecycle management."
//! mce_version: "v0.1.0"
//! mce_owner: "tbd"
//! ---
use reqwest::StatusCode;

/// Failures the source pull-loop classifies and recovers from locally.
/// None of these propagate past the stage.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The per-window request budget is spent; no wire call was made.
    #[error("request budget exhausted for the current rate-limit window")]
    RateBudgetExhausted,
    /// The source answered with a non-200 status.
    #[error("source api returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    /// Network-layer failure talking to the source.
    #[error("source transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    /// The response body could not be decoded into a message batch.
    #[error("could not decode source response: {0}")]
    Decode(#[from] serde_json::Error),
    /// The source answered 200 with an empty results array.
    #[error("source returned an empty results array")]
    EmptyResults,
}

impl SourceError {
    /// Stable classification label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::RateBudgetExhausted => "rate_budget",
            SourceError::Status { .. } => "status",
            SourceError::Transport(_) => "transport",
            SourceError::Decode(_) => "decode",
            SourceError::EmptyResults => "empty_results",
        }
    }

    /// Whether the source was told to slow down.
    pub fn is_throttle(&self) -> bool {
        matches!(self, SourceError::Status { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS)
    }
}

/// Failure talking to a downstream (processing or storage) API. Workers
/// convert these into retry tickets rather than propagating them.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The downstream answered outside its success set.
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    /// Network-layer failure.
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    /// The response body could not be decoded.
    #[error("could not decode response body: {0}")]
    Decode(#[from] serde_json::Error),
}
