//! TreeSync - Watch a directory and publish its tree with batched change events
//!
//! This library provides the core functionality for TreeSync, organized around
//! trait-based dependency injection for testability.

pub mod commands;
pub mod traits;
pub mod mocks;
pub mod production;

pub mod config;
pub mod engine;
pub mod error;
pub mod queue;
pub mod sandbox;
pub mod state;
pub mod tree;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use config::{EngineConfig, EngineOptions, SwitchOptions};
pub use engine::TreeSyncEngine;
pub use error::EngineError;
pub use queue::{ChangeRecord, ChangeType};
pub use state::{TreeUpdate, UpdateSubscription};
pub use tree::{NodeKind, TreeNode};

/// Initialize logging to stdout, plus a daily rolling file when `log_dir` is given
///
/// Keep the returned guard alive for the lifetime of the process, dropping it
/// stops the file writer.
pub fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "treesync=info,treesync_lib=info".into()),
    );

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)?;
    let file_appender = rolling::daily(log_dir, "treesync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
        .try_init()?;

    Ok(Some(guard))
}
