//! ---
//! cion_section: "01-core-functionality"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Shared primitives and utilities for the worker runtime."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
//! Shared primitives for the cion workspace.
//! This crate exposes daemon configuration loading and the tracing setup
//! consumed by every binary in the workspace.

pub mod config;
pub mod logging;

pub use config::{
    ApiConfig, AppConfig, FeedConfig, LoadedAppConfig, LoggingConfig, MetricsConfig,
    RoutingConfig, DEFAULT_GLOB,
};
pub use logging::{init_tracing, LogFormat};
