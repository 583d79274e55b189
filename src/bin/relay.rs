use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, Level};

use session_tunnel::{ports, relay};

#[derive(Parser, Debug)]
#[command(author, version, about = "Server-side tunnel daemon: dials requested targets and replays sessions to reconnecting keepers", long_about = None)]
struct Cli {
    /// Where to listen for incoming carriers (example 1.2.3.4:8080)
    #[arg(long, default_value = ":2020")]
    listen: String,

    /// Allowed destination ports
    #[arg(long, default_value = "1-65535")]
    allowed: String,

    /// Turn on verbosity
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let allowed = ports::parse_port_set(&cli.allowed).context("invalid --allowed spec")?;

    let listen = ports::listen_addr(&cli.listen);
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("error listening on {listen}"))?;
    info!("listening on {listen}");

    tokio::select! {
        res = relay::serve(listener, allowed) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
