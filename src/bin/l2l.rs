//! Listen↔listen front-end: bridge clients arriving on two local
//! addresses, typically two NATed peers dialing a public host.
//!
//! Example: `l2l --a-local 127.0.0.1:1201 --b-local 127.0.0.1:1202`

use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser};

use conduit::{Config, Endpoint, L2l, Network, TokenVerifier};

#[derive(Debug, Parser)]
#[command(
    name = "l2l",
    version,
    about = "Bridge connections accepted on two local addresses"
)]
struct Cli {
    /// Network name: tcp/tcp4/tcp6.
    #[arg(long, default_value = "tcp")]
    network: String,

    /// A-side listen address (e.g. "12.13.14.15:123").
    #[arg(long)]
    a_local: Option<String>,

    /// B-side listen address (e.g. "22.23.24.25:234").
    #[arg(long)]
    b_local: Option<String>,

    /// A-side verify token ("send|expect"; no '|' means both).
    #[arg(long)]
    a_verify: Option<String>,

    /// B-side verify token.
    #[arg(long)]
    b_verify: Option<String>,

    /// Cap on concurrently forwarded pairs (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max_conn: usize,

    /// Idle connections kept parked per side.
    #[arg(long, default_value_t = 2)]
    kept_idle_conn: usize,

    /// Idle parked-connection timeout (e.g. "30s"; unset = never).
    #[arg(long, value_parser = humantime::parse_duration)]
    idle_timeout: Option<Duration>,

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

    let (Some(a_local), Some(b_local)) = (cli.a_local.clone(), cli.b_local.clone()) else {
        tracing::error!(
            a_local = ?cli.a_local,
            b_local = ?cli.b_local,
            "both --a-local and --b-local are required"
        );
        return Ok(());
    };

    let network: Network = cli.network.parse()?;
    let forwarder = L2l::new(Config {
        max_conn: cli.max_conn,
        kept_idle_conn: cli.kept_idle_conn,
        idle_timeout: cli.idle_timeout,
        read_buf_size: cli.read_buf_size,
        verify_a: cli
            .a_verify
            .as_deref()
            .map(|t| Arc::new(TokenVerifier::new(t)) as Arc<dyn conduit::ConnVerifier>),
        verify_b: cli
            .b_verify
            .as_deref()
            .map(|t| Arc::new(TokenVerifier::new(t)) as Arc<dyn conduit::ConnVerifier>),
        ..Config::default()
    });

    let swap = forwarder
        .transport(
            &Endpoint::listen(network.clone(), a_local),
            &Endpoint::listen(network, b_local),
        )
        .await?;

    tokio::select! {
        res = swap.run() => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("l2l: shutting down");
            swap.close();
            forwarder.close();
        }
    }
    Ok(())
}
