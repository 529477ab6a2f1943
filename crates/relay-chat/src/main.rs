//! # relay-chat
//!
//! Chat room server: mounts a [`ChatRoomHandler`] stream at `/events` and
//! optionally announces a greeting to the room on a fixed interval.

#![deny(unsafe_code)]

mod announce;
mod chat;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::config::{ServerConfig, load_config};
use relay_server::metrics::install_recorder;
use relay_server::{RelayServer, handler_factory};

use crate::chat::ChatRoomHandler;

/// Path the chat stream is mounted at.
const EVENTS_PATH: &str = "/events";

/// Chat room event-stream server.
#[derive(Parser, Debug)]
#[command(name = "relay-chat", about = "Chat room event-stream server")]
struct Cli {
    /// Host to bind (overrides config file and env).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config file and env).
    #[arg(long)]
    port: Option<u16>,

    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds between room announcements; 0 disables them.
    #[arg(long, default_value = "5")]
    announce_secs: u64,

    /// Default log level when `RUST_LOG` is unset.
    #[arg(long, default_value = relay_core::logging::DEFAULT_LEVEL)]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Command-line values win over file and env configuration.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }

    fn announce_period(&self) -> Option<Duration> {
        (self.announce_secs > 0).then(|| Duration::from_secs(self.announce_secs))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.json_logs {
        relay_core::logging::init_json_subscriber(&cli.log_level);
    } else {
        relay_core::logging::init_subscriber(&cli.log_level);
    }

    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config);

    let metrics = install_recorder().context("failed to install metrics recorder")?;
    let server = RelayServer::new(config).with_metrics(metrics);
    let hub = server.register_stream_endpoint(EVENTS_PATH, Some(handler_factory(ChatRoomHandler::new)));

    if let Some(period) = cli.announce_period() {
        let cancel = server.shutdown().token();
        let _ = server
            .shutdown()
            .spawn(announce::run(hub, announce::greeting(), period, cancel));
    }

    let (addr, handle) = server.listen().await.context("failed to bind listener")?;
    tracing::info!(%addr, path = EVENTS_PATH, "chat room ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    let _ = server.graceful_shutdown().await;
    let _ = handle.await;
    Ok(())
}
