use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroUsize,
    time::Duration,
};

use clap::Parser;
use greeter::{
    greet::{Config, Mode, Server},
    utils::BoxResult,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// handle one client at a time instead of one task per client
    #[arg(long)]
    sequential: bool,

    #[arg(long, default_value_t = 1024)]
    backlog: u32,

    /// maximum number of bytes read from a client
    #[arg(long, default_value = "1024")]
    max_read: NonZeroUsize,

    /// seconds given to open connections once ctrl-c is received
    #[arg(long, default_value_t = 5)]
    grace_secs: u64,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Config {
            addr: SocketAddr::new(cli.host, cli.port),
            mode: if cli.sequential {
                Mode::Sequential
            } else {
                Mode::Concurrent
            },
            backlog: cli.backlog,
            max_len: cli.max_read.get(),
            shutdown_grace: Duration::from_secs(cli.grace_secs),
        }
    }
}

#[tokio::main]
async fn main() -> BoxResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let server = Server::bind(cli.into()).await?;
    let token = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(token.clone()));
    server.run_until(token.cancelled_owned()).await?;

    tracing::info!("exiting");
    Ok(())
}

async fn cancel_on_ctrl_c(token: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("ctrl-c received, shutting down");
            token.cancel();
        }
        Err(err) => {
            tracing::error!("cannot listen for ctrl-c, only a kill will stop the server: {err}")
        }
    }
}
