//! ---
//! mce_section: "01-core-functionality"
//! mce_subsection: "module"
//! mce_type: "source"
//! mce_scope: "code"
//! mce_description: "Collection pipeline stages and lifecycle management."
//! mce_version: "v0.1.0"
//! mce_owner: "tbd"
//! ---
//! The collection pipeline core: a source pull-loop feeding worker pools
//! for enrichment and storage, with a single retry arbiter relieving both.
//!
//! All cross-stage coordination is channel traffic; no stage shares mutable
//! state with another. See [`pipeline::CollectionPipeline`] for the wiring.

pub mod error;
pub mod pipeline;
pub mod processing;
pub mod retry;
pub mod source;
pub mod storage;
pub mod types;

pub use error::{ClientError, SourceError};
pub use pipeline::{CollectionPipeline, PipelineConfig, PipelineHandle};
pub use processing::{ProcessingClient, ProcessingStage};
pub use retry::RetryStage;
pub use source::{SourceClient, SourceSettings, SourceStage, ERROR_WAIT, THROTTLE_BACKOFF};
pub use storage::{StorageClient, StorageStage};
pub use types::{
    Message, MessageBatch, ProcessedMessage, RetryPayload, RetryTicket, MAX_RETRY_ATTEMPTS,
};
