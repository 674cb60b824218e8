use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use treesync_lib::commands::{dispatch, RemoteRequest};
use treesync_lib::production::{ChannelBroadcaster, NotifyWatcher, StaticRouteTable};
use treesync_lib::{init_logging, EngineConfig, SwitchOptions, TreeSyncEngine};

/// Watch a directory and stream its tree as JSON lines
///
/// Every published `{tree, events}` value is written to stdout. Commands such
/// as `{"reqId": 1, "action": "mkdir", "payload": {"pathname": "sub"}}` are
/// read from stdin, one per line, and answered on stdout.
#[derive(Debug, Parser)]
#[command(name = "treesync", version)]
struct Cli {
    /// Directory to watch, relative to the configured working root
    #[arg(long)]
    dirname: Option<String>,

    /// Url prefix the directory is served under
    #[arg(long)]
    public_path: Option<String>,

    /// Maximum watch and traversal depth
    #[arg(long)]
    depth: Option<usize>,

    /// JSON engine config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_logging(cli.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("treesync: failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "TreeSync exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => {
            let mut config = EngineConfig::default();
            config.apply_env();
            config
        }
    };

    tracing::info!(id = %config.id, cwd = %config.cwd.display(), "TreeSync starting up");

    let broadcaster = Arc::new(ChannelBroadcaster::new());
    let mut updates = broadcaster.subscribe();
    let engine = Arc::new(TreeSyncEngine::new(
        config,
        Arc::new(NotifyWatcher::new()),
        Arc::new(StaticRouteTable::new()),
        broadcaster,
    ));

    let printer = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(line) => println!("{line}"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Output fell behind, skipped tree updates");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    engine
        .switch(SwitchOptions {
            dirname: cli.dirname,
            public_path: cli.public_path.map(Some),
            depth: cli.depth.map(Some),
        })
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match RemoteRequest::parse(&line) {
                    Ok(request) => {
                        let engine = Arc::clone(&engine);
                        tokio::spawn(async move {
                            let reply = dispatch(&engine, request).await;
                            match serde_json::to_string(&reply) {
                                Ok(json) => println!("{json}"),
                                Err(e) => tracing::error!(error = %e, "Failed to serialize reply"),
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Ignoring malformed command"),
                },
                None => {
                    tracing::debug!("stdin closed, watching until interrupted");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Shutting down");
    engine.stop();
    printer.abort();
    Ok(())
}
