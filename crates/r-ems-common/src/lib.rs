//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Configuration loading and tracing initialisation shared by the grid view crates.

pub mod config;
pub mod logging;

pub use config::{
    ApiConfig, AppConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, PollingConfig,
    ScopeConfig, SourceConfig,
};
pub use logging::{init_tracing, LogFormat};
