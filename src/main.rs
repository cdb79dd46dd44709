//! Demo gateway process.
//!
//! Serves a fixed greeting for every request on the chosen scheme until
//! Ctrl+C or SIGTERM.

use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;

use server_gateway::config::{load_config, DispatchMode, GatewayConfig};
use server_gateway::lifecycle::shutdown_signal;
use server_gateway::observability::logging::init_logging;
use server_gateway::{Handler, Request, Response, Server, TransportRegistry};

#[derive(Debug, Parser)]
#[command(name = "server-gateway", version, about = "Serve a greeting through the gateway")]
struct Cli {
    /// Scheme to serve (http, scgi or fastcgi).
    #[arg(long, default_value = "http")]
    scheme: String,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind; repeat for several. Overrides the configuration.
    #[arg(long = "address")]
    addresses: Vec<String>,

    /// Dispatch mode override.
    #[arg(long, value_parser = parse_dispatch)]
    dispatch: Option<DispatchMode>,
}

fn parse_dispatch(value: &str) -> Result<DispatchMode, String> {
    match value.to_ascii_lowercase().as_str() {
        "sequential" => Ok(DispatchMode::Sequential),
        "concurrent" => Ok(DispatchMode::Concurrent),
        other => Err(format!("unknown dispatch mode {other:?}")),
    }
}

struct Greeting;

#[async_trait]
impl Handler for Greeting {
    async fn handle(&self, _request: &Request, response: &mut Response) -> bool {
        response.set_header("Content-Type", "text/plain; charset=utf-8");
        response.expand_utf8("Hello world!").await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    if !cli.addresses.is_empty() {
        config.listener.addresses = cli.addresses.clone();
    }
    if let Some(dispatch) = cli.dispatch {
        config.dispatch = dispatch;
    }

    init_logging(&config.observability);
    tracing::info!("server-gateway v{} starting", env!("CARGO_PKG_VERSION"));

    let listen_timeout = config.timeouts.listen();
    let registry = TransportRegistry::with_defaults();
    if registry.get(&cli.scheme).is_none() {
        let mut known: Vec<&str> = registry.schemes().collect();
        known.sort_unstable();
        tracing::error!(scheme = %cli.scheme, known = ?known, "Unknown scheme");
    }
    let server = Server::with_config(&cli.scheme, Greeting, config, &registry)?;
    server.listen_timeout(listen_timeout).await?;

    for uri in server.get_uris() {
        tracing::info!(uri = %uri, "Ready");
    }

    shutdown_signal().await;
    server.stop().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
