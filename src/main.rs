// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coedit::{config::AppConfig, daemon::DaemonHandle, logging, transport};
use std::path::PathBuf;
use tokio::signal;
use tracing::info;

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Verbose logging. `RUST_LOG` takes precedence when set.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a document to collaborating editors.
    Serve {
        /// TCP port to listen on.
        #[arg(long, env = "COEDIT_PORT")]
        port: Option<u16>,
        /// UNIX socket to listen on, in addition to TCP.
        #[arg(long)]
        socket: Option<PathBuf>,
        /// File providing the initial document content.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Configuration file supplying defaults for the flags above.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    let cli = Cli::parse();
    logging::initialize(cli.debug);

    match cli.command {
        Commands::Serve {
            port,
            socket,
            file,
            config,
        } => {
            let app_config_cli = AppConfig { port, socket, file };
            let app_config = match config {
                Some(path) => app_config_cli.merge(AppConfig::from_config_file(&path)),
                None => app_config_cli,
            };

            let initial_text = match &app_config.file {
                Some(path) => std::fs::read(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => vec![],
            };

            let document_handle = DaemonHandle::new(&initial_text);

            if let Some(socket_path) = app_config.socket {
                let handle = document_handle.clone();
                tokio::spawn(async move {
                    transport::listen_unix(&socket_path, handle)
                        .await
                        .expect("Failed to listen on UNIX socket");
                });
            }

            let port = app_config.port.unwrap_or(4242);
            let handle = document_handle.clone();
            tokio::spawn(async move {
                transport::listen_tcp(port, handle)
                    .await
                    .expect("Failed to listen on TCP port");
            });

            signal::ctrl_c()
                .await
                .context("Failed to listen for ctrl-c")?;
            info!("Shutting down.");
        }
    }

    Ok(())
}
