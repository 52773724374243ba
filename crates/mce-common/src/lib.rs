//! ---
//! mce_section: "01-core-functionality"
//! mce_subsection: "module"
//! mce_type: "source"
//! mce_scope: "code"
//! mce_description: "Shared configuration and logging bootstrap."
//! mce_version: "v0.1.0"
//! mce_owner: "tbd"
//! ---
//! Shared primitives for the MCE workspace: configuration loading and
//! tracing bootstrap consumed by the daemon and the engine tests.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, ProcessingApiConfig,
    SourceApiConfig, StorageApiConfig,
};
pub use logging::{init_tracing, LogFormat};
