//! Listen→dial front-end: plain port forwarding.
//!
//! Example: `l2d --listen 127.0.0.1:1201 --to-remote 127.0.0.1:1202 --network tcp`

use std::time::Duration;

use clap::{CommandFactory, Parser};

use conduit::{Config, Endpoint, L2d, Network};

#[derive(Debug, Parser)]
#[command(
    name = "l2d",
    version,
    about = "Forward every connection accepted on a local address to a remote"
)]
struct Cli {
    /// Network name: tcp/tcp4/tcp6 or udp/udp4/udp6.
    #[arg(long, default_value = "tcp")]
    network: String,

    /// Local listen address (e.g. "0.0.0.0:1201").
    #[arg(long)]
    listen: Option<String>,

    /// Source address for outgoing dials (host, port 0 is used).
    #[arg(long)]
    from_local: Option<String>,

    /// Remote address to forward to (e.g. "22.23.24.25:234").
    #[arg(long)]
    to_remote: Option<String>,

    /// Dial timeout.
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Cap on concurrently forwarded connections (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max_conn: usize,

    /// Copy buffer size per direction, in bytes.
    #[arg(long, default_value_t = 4096)]
    read_buf_size: usize,

    /// Log level: debug/info/warn/error.
    #[arg(long, default_value = "info", env = "CONDUIT_LOG")]
    log_level: String,

    /// Log output: stderr, stdout, discard, or a file path.
    #[arg(long, default_value = "stderr")]
    log_output: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().len() <= 1 {
        Cli::command().print_help()?;
        return Ok(());
    }
    let cli = Cli::parse();
    let _logging = conduit::logging::init(&cli.log_level, &cli.log_output)?;

    let (Some(listen), Some(to_remote)) = (cli.listen.clone(), cli.to_remote.clone()) else {
        tracing::error!(
            listen = ?cli.listen,
            to_remote = ?cli.to_remote,
            "both --listen and --to-remote are required"
        );
        return Ok(());
    };

    let network: Network = cli.network.parse()?;
    let listen_ep = Endpoint::listen(network.clone(), listen);
    let mut dial_ep = Endpoint::dial(network, to_remote);
    if let Some(source) = &cli.from_local {
        dial_ep = dial_ep.with_local(format!("{source}:0"));
    }

    let forwarder = L2d::new(Config {
        max_conn: cli.max_conn,
        read_buf_size: cli.read_buf_size,
        dial_timeout: Some(cli.timeout),
        ..Config::default()
    });
    let swap = forwarder.transport(&listen_ep, &dial_ep).await?;

    tokio::select! {
        res = swap.run() => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("l2d: shutting down");
            swap.close();
            forwarder.close();
        }
    }
    Ok(())
}
