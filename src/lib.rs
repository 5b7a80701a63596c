//! Bidirectional TCP/UDP traffic bridge for crossing NAT and firewall
//! boundaries.
//!
//! Three forwarding primitives cover the three reachability cases:
//!
//! - [`L2d`]: listen on a public address, dial a fixed remote for every
//!   inbound connection (plain port forwarding).
//! - [`L2l`]: listen on two public addresses and bridge the clients that
//!   connect to each (both peers are dial-only).
//! - [`D2d`]: dial out to two remotes and bridge the results (this host
//!   is dial-only; both remotes are reachable).
//!
//! Each primitive pairs an A-side endpoint with a B-side endpoint. Once a
//! connection is available on both sides they are spliced: every byte one
//! side writes appears on the other. `transport()` opens the listeners or
//! starts the dial fillers and hands back a swap handle whose `run()`
//! drives the exchange until the handle or its parent is closed.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

pub mod d2d;
pub mod l2d;
pub mod l2l;
pub mod logging;
pub mod net;
mod pool;
pub mod splice;
pub mod verify;

pub use d2d::{D2d, D2dSwap};
pub use l2d::{L2d, L2dSwap};
pub use l2l::{L2l, L2lSwap};
pub use net::{Conn, Endpoint, Family, Network};
pub use splice::{AsyncStream, BoxedStream, ConnVerifier, PairVerifier};
pub use verify::{PairTokenVerifier, TokenVerifier};

/// Errors surfaced by the forwarding engine.
///
/// Everything transient (a failed dial attempt, a refused park, a
/// temporary accept error) is self-healed and reported through tracing
/// and the optional [`ErrorSink`]; only configuration and fatal listener
/// failures reach the caller as `Error`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `transport()` was called twice on the same forwarder.
    #[error("transport already started")]
    AlreadyStarted,

    /// `run()` was called while the swap handle was already running.
    #[error("swap is already running")]
    SwapRunning,

    /// The parent forwarder has been closed.
    #[error("forwarder is closed")]
    Closed,

    #[error("unknown network {0:?}")]
    UnknownNetwork(String),

    /// The network name parsed but this runtime cannot open it.
    #[error("network not supported: {0}")]
    Unsupported(&'static str),

    #[error("endpoint is missing its {0} address")]
    MissingAddress(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Sink for non-fatal diagnostics.
///
/// The engine keeps running after a failed dial, a rejected verify, or a
/// transient accept error; those events are logged and, when a sink is
/// configured, delivered here as well.
pub trait ErrorSink: Send + Sync {
    fn report(&self, err: &anyhow::Error);
}

/// Configuration shared by the three forwarders.
///
/// A forwarder snapshots its `Config` at `transport()`; mutating a copy
/// afterwards has no effect on a started instance.
#[derive(Clone, Default)]
pub struct Config {
    /// Cap on concurrently forwarded pairs. `0` means unlimited for
    /// [`L2d`]/[`L2l`] and 500 for [`D2d`].
    pub max_conn: usize,

    /// Idle connections each side's pool tries to hold. Clamped to at
    /// least 1.
    pub kept_idle_conn: usize,

    /// How long a parked connection may sit idle before it is discarded.
    /// `None` means never.
    pub idle_timeout: Option<Duration>,

    /// Redial cadence of the [`D2d`] fillers. Zero falls back to 1s.
    pub try_interval: Duration,

    /// Timeout for outgoing dials. `None` means no bound.
    pub dial_timeout: Option<Duration>,

    /// Copy buffer size per splice direction. Zero falls back to 4096.
    pub read_buf_size: usize,

    /// Optional sink for non-fatal diagnostics.
    pub error_sink: Option<Arc<dyn ErrorSink>>,

    /// Per-side hook run on an A-side connection before it is pooled or
    /// paired. Returning `Ok(false)` or `Err` closes the connection.
    pub verify_a: Option<Arc<dyn ConnVerifier>>,

    /// Like `verify_a`, for the B side.
    pub verify_b: Option<Arc<dyn ConnVerifier>>,

    /// Inherited cancellation root. Outgoing dials abort promptly when
    /// this flips to `true`.
    pub shutdown: Option<watch::Receiver<bool>>,
}

impl Config {
    pub(crate) fn buf_size(&self) -> usize {
        if self.read_buf_size == 0 {
            net::DEFAULT_READ_BUF_SIZE
        } else {
            self.read_buf_size
        }
    }

    pub(crate) fn kept_idle(&self) -> usize {
        self.kept_idle_conn.max(1)
    }

    pub(crate) fn interval(&self) -> Duration {
        if self.try_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.try_interval
        }
    }

    pub(crate) fn report(&self, err: anyhow::Error) {
        if let Some(sink) = &self.error_sink {
            sink.report(&err);
        }
    }
}
