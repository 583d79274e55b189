use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, Level};

use session_tunnel::{keeper, ports};

#[derive(Parser, Debug)]
#[command(author, version, about = "Client-side tunnel daemon: accepts HTTP CONNECT requests and keeps each session alive across carrier reconnects", long_about = None)]
struct Cli {
    /// Where to listen for incoming proxy connections (example 1.2.3.4:8080)
    #[arg(long, default_value = ":2222")]
    listen: String,

    /// Relay to carry sessions to
    #[arg(long, default_value = "localhost:2020")]
    target: String,

    /// Turn on verbosity
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let listen = ports::listen_addr(&cli.listen);
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("error listening on {listen}"))?;
    info!("listening on {listen}, carrying sessions to {}", cli.target);

    tokio::select! {
        res = keeper::serve(listener, cli.target) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
