//! ---
//! cion_section: "01-core-functionality"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Shared primitives and utilities for the worker runtime."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "CION_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

/// Writer guards; dropping them would lose buffered lines.
static GUARDS: OnceCell<[WorkerGuard; 2]> = OnceCell::new();

/// Stdout rendering of log events. The rolling file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Install the global subscriber for `service_name`.
///
/// The filter comes from `CION_LOG`, then `RUST_LOG`, then `info`. Events
/// go to stdout in `config.format` and to a daily rolling JSON file named
/// after `file_prefix` (or the service) under `config.directory`. Calling
/// this twice keeps the first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    if GUARDS.get().is_some() {
        debug!(service = %service_name, "tracing already initialised");
        return Ok(());
    }
    let log_file = log_file(service_name, config);
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("unable to create log directory {}", config.directory.display())
    })?;

    let appender = tracing_appender::rolling::daily(&config.directory, &log_file);
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let installed = tracing_subscriber::registry()
        .with(env_filter(std::env::var(LOG_ENV).ok()))
        .with(stdout_layer(config.format, stdout_writer))
        .with(
            fmt::layer()
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .json()
                .with_writer(file_writer),
        )
        .try_init()
        .is_ok();
    let _ = GUARDS.set([file_guard, stdout_guard]);

    if installed {
        info!(
            service = %service_name,
            log_file = %config.directory.join(&log_file).display(),
            format = ?config.format,
            "tracing initialised"
        );
    }
    Ok(())
}

fn log_file(service_name: &str, config: &LoggingConfig) -> PathBuf {
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    PathBuf::from(format!("{prefix}.log"))
}

/// Filter from an explicit directive, falling back to `RUST_LOG` and `info`.
fn env_filter(directive: Option<String>) -> EnvFilter {
    match directive {
        Some(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive '{directive}' ({err}); using {DEFAULT_DIRECTIVE}");
            EnvFilter::new(DEFAULT_DIRECTIVE)
        }),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}

fn stdout_layer<S>(format: LogFormat, writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    let layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::StructuredJson => layer.with_target(false).json().boxed(),
        LogFormat::Pretty => layer.with_target(true).boxed(),
    }
}
