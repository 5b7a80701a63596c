//! Dial↔dial front-end: bridge two remote endpoints from a host that
//! can only dial out (e.g. forwarding between two exposed ports from
//! inside a NAT).
//!
//! Example: `d2d --a-remote 127.0.0.1:1201 --b-remote 127.0.0.1:1202`

use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser};

use conduit::{Config, D2d, Endpoint, Network, PairTokenVerifier};

#[derive(Debug, Parser)]
#[command(
    name = "d2d",
    version,
    about = "Bridge two remote endpoints by dialing out to both"
)]
struct Cli {
    /// Network name: tcp/tcp4/tcp6.
    #[arg(long, default_value = "tcp")]
    network: String,

    /// A-side source address for outgoing dials (host, port 0 is used).
    #[arg(long)]
    a_local: Option<String>,

    /// A-side remote address (e.g. "12.13.14.15:123").
    #[arg(long)]
    a_remote: Option<String>,

    /// A-side verify token sent before the pair is spliced.
    #[arg(long)]
    a_verify: Option<String>,

    /// B-side source address for outgoing dials.
    #[arg(long)]
    b_local: Option<String>,

    /// B-side remote address (e.g. "22.23.24.25:234").
    #[arg(long)]
    b_remote: Option<String>,

    /// B-side verify token sent before the pair is spliced.
    #[arg(long)]
    b_verify: Option<String>,

    /// Redial cadence while a side is below its kept-idle target.
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    try_interval: Duration,

    /// Dial timeout.
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Cap on concurrently forwarded pairs (0 = default of 500).
    #[arg(long, default_value_t = 0)]
    max_conn: usize,

    /// Idle connections kept primed per side.
    #[arg(long, default_value_t = 2)]
    kept_idle_conn: usize,

    /// Idle pooled-connection timeout (e.g. "30s"; unset = never).
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

    let (Some(a_remote), Some(b_remote)) = (cli.a_remote.clone(), cli.b_remote.clone()) else {
        tracing::error!(
            a_remote = ?cli.a_remote,
            b_remote = ?cli.b_remote,
            "both --a-remote and --b-remote are required"
        );
        return Ok(());
    };

    let network: Network = cli.network.parse()?;
    let mut a = Endpoint::dial(network.clone(), a_remote);
    if let Some(source) = &cli.a_local {
        a = a.with_local(format!("{source}:0"));
    }
    let mut b = Endpoint::dial(network, b_remote);
    if let Some(source) = &cli.b_local {
        b = b.with_local(format!("{source}:0"));
    }

    let forwarder = D2d::new(Config {
        max_conn: cli.max_conn,
        kept_idle_conn: cli.kept_idle_conn,
        idle_timeout: cli.idle_timeout,
        try_interval: cli.try_interval,
        dial_timeout: Some(cli.timeout),
        read_buf_size: cli.read_buf_size,
        ..Config::default()
    });
    let swap = forwarder.transport(&a, &b).await?;

    if cli.a_verify.is_some() || cli.b_verify.is_some() {
        swap.set_verify(Arc::new(PairTokenVerifier::new(
            cli.a_verify.as_deref(),
            cli.b_verify.as_deref(),
        )));
    }

    tokio::select! {
        res = swap.run() => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("d2d: shutting down");
            swap.close();
            forwarder.close();
        }
    }
    Ok(())
}
