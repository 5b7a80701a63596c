//! Dial↔dial forwarding: this host can reach both peers but neither can
//! reach us or each other. Two background fillers keep a small pool of
//! outbound connections primed to each remote; the swap loop pairs one
//! from each side and splices them.
//!
//! Pairs are never recycled after a splice: the peer behind the other
//! end is a live session in an unknown state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::time::{self, MissedTickBehavior};

use crate::net::{self, Backoff, Endpoint, Family};
use crate::pool::Pool;
use crate::splice::{BoxedStream, ConnVerifier, Core, PairSlots, PairTable, PairVerifier, RunState};
use crate::{Config, Error, Result};

const DEFAULT_MAX_CONN: usize = 500;

/// Dial-to-dial forwarder bridging two reachable remotes from a
/// dial-only host.
pub struct D2d {
    cfg: Config,
    core: Arc<Core>,
    inner: OnceLock<Arc<D2dInner>>,
}

impl D2d {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            core: Arc::new(Core::new()),
            inner: OnceLock::new(),
        }
    }

    /// Start the per-side fillers. Callable once per forwarder; stream
    /// networks only. No listener is ever allocated.
    pub async fn transport(&self, a: &Endpoint, b: &Endpoint) -> Result<D2dSwap> {
        self.core.start()?;
        if a.network.family() != Family::Stream || b.network.family() != Family::Stream {
            return Err(Error::Unsupported("datagram networks in dial-to-dial mode"));
        }
        a.remote_or_err()?;
        b.remote_or_err()?;

        let max_conn = if self.cfg.max_conn == 0 {
            DEFAULT_MAX_CONN
        } else {
            self.cfg.max_conn
        };
        let kept = self.cfg.kept_idle();

        let side_a = Arc::new(Side {
            endpoint: a.clone(),
            pool: Arc::new(Pool::new(max_conn, kept, self.cfg.idle_timeout)),
            key: a.remote.clone().unwrap_or_default(),
            filling: AtomicBool::new(false),
            verify: self.cfg.verify_a.clone(),
            name: "a",
        });
        let side_b = Arc::new(Side {
            endpoint: b.clone(),
            pool: Arc::new(Pool::new(max_conn, kept, self.cfg.idle_timeout)),
            key: b.remote.clone().unwrap_or_default(),
            filling: AtomicBool::new(false),
            verify: self.cfg.verify_b.clone(),
            name: "b",
        });

        let inner = Arc::new(D2dInner {
            cfg: self.cfg.clone(),
            max_conn,
            kept_idle: kept,
            core: self.core.clone(),
            run: RunState::new(),
            table: Arc::new(PairTable::new()),
            verify: std::sync::Mutex::new(None),
            a: side_a,
            b: side_b,
        });
        let _ = self.inner.set(inner.clone());

        tracing::info!(a = %inner.a.key, b = %inner.b.key, "d2d: priming pools");
        tokio::spawn(filler(inner.clone(), inner.a.clone()));
        tokio::spawn(filler(inner.clone(), inner.b.clone()));

        Ok(D2dSwap { inner })
    }

    /// Permanently stop the forwarder: both fillers and pools go down,
    /// and any blocked `run()` returns.
    pub fn close(&self) {
        self.core.close();
        if let Some(inner) = self.inner.get() {
            inner.a.pool.close();
            inner.b.pool.close();
        }
    }
}

struct Side {
    endpoint: Endpoint,
    pool: Arc<Pool>,
    key: String,
    filling: AtomicBool,
    verify: Option<Arc<dyn ConnVerifier>>,
    name: &'static str,
}

struct D2dInner {
    cfg: Config,
    max_conn: usize,
    kept_idle: usize,
    core: Arc<Core>,
    run: RunState,
    table: Arc<PairTable>,
    verify: std::sync::Mutex<Option<Arc<dyn PairVerifier>>>,
    a: Arc<Side>,
    b: Arc<Side>,
}

/// Restartable driver for a [`D2d`] transport.
pub struct D2dSwap {
    inner: Arc<D2dInner>,
}

impl D2dSwap {
    /// Install the pre-splice pair hook.
    pub fn set_verify(&self, verify: Arc<dyn PairVerifier>) {
        *self.inner.verify.lock().expect("verify poisoned") = Some(verify);
    }

    /// Number of pairs currently being forwarded.
    pub fn conn_num(&self) -> usize {
        self.inner.core.counter.pairs()
    }

    /// Pair and splice pooled connections until this handle or its
    /// parent is closed. Restartable after `close()` while the parent
    /// lives.
    pub async fn run(&self) -> Result<()> {
        if self.inner.core.is_closed() {
            return Err(Error::Closed);
        }
        let mut stopped = self.inner.run.begin()?;
        let mut backoff = Backoff::new(self.inner.cfg.interval());

        loop {
            if !self.inner.run.is_running() {
                return Ok(());
            }
            if self.inner.core.is_closed() {
                self.close();
                return Ok(());
            }

            let inner = &self.inner;
            // Wait while either side has nothing parked, or a filler is
            // mid-dial (its fresh connection must park first).
            let priming = inner.a.pool.idle_len() == 0
                || inner.b.pool.idle_len() == 0
                || inner.a.filling.load(Ordering::SeqCst)
                || inner.b.filling.load(Ordering::SeqCst);
            if priming {
                tokio::select! {
                    _ = stopped.changed() => {}
                    _ = backoff.sleep() => {}
                }
                continue;
            }

            inner.core.counter.add(1);
            let conn_a = match inner.a.pool.get(&inner.a.key) {
                Ok(Some(conn)) => conn,
                Ok(None) | Err(_) => {
                    inner.core.counter.add(-1);
                    continue;
                }
            };
            inner.core.counter.add(1);
            let conn_b = match inner.b.pool.get(&inner.b.key) {
                Ok(Some(conn)) => conn,
                Ok(None) | Err(_) => {
                    inner.core.counter.add(-2);
                    inner.a.pool.put_back(&inner.a.key, conn_a);
                    continue;
                }
            };
            backoff.reset();

            let slots = PairSlots::adopt(
                inner.core.clone(),
                [Some(inner.a.pool.clone()), Some(inner.b.pool.clone())],
            );
            crate::splice::spawn_pair(
                inner.table.clone(),
                inner.run.running_handle(),
                inner.verify.lock().expect("verify poisoned").clone(),
                inner.cfg.error_sink.clone(),
                inner.cfg.buf_size(),
                slots,
                async move {
                    Some((
                        Box::new(conn_a) as BoxedStream,
                        Box::new(conn_b) as BoxedStream,
                    ))
                },
            );
        }
    }

    /// Stop the current run and close every active pair. The fillers
    /// keep the pools primed for the next run.
    pub fn close(&self) {
        self.inner.run.stop();
        self.inner.table.close_all();
    }
}

/// Keep one side's pool primed: on every tick, dial the remote unless
/// the side is at capacity or already holds enough idle connections.
async fn filler(inner: Arc<D2dInner>, side: Arc<Side>) {
    let mut close_rx = inner.core.close_rx();
    let mut tick = time::interval(inner.cfg.interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = close_rx.wait_for(|closed| *closed) => return,
            _ = tick.tick() => {}
        }
        if inner.core.is_closed() {
            return;
        }
        if inner.core.counter.pairs() + side.pool.idle_len() >= inner.max_conn {
            continue;
        }
        if side.pool.idle_for(&side.key) >= inner.kept_idle {
            continue;
        }

        side.filling.store(true, Ordering::SeqCst);
        match net::dial_stream(
            &side.endpoint,
            inner.cfg.dial_timeout,
            inner.cfg.shutdown.as_ref(),
        )
        .await
        {
            Ok(mut conn) => {
                let accepted = match &side.verify {
                    Some(hook) => match hook.verify(&mut conn).await {
                        Ok(ok) => ok,
                        Err(err) => {
                            tracing::warn!(side = side.name, err = %err, "d2d: verify failed");
                            inner.cfg.report(err);
                            false
                        }
                    },
                    None => true,
                };
                if accepted
                    && let Err(refused) = side.pool.put_priority(&side.key, conn)
                {
                    // At capacity after all; the fresh dial is dropped.
                    drop(refused);
                }
            }
            Err(err) => {
                if !inner.core.is_closed() {
                    tracing::warn!(side = side.name, remote = %side.key, err = %err, "d2d: dial failed");
                    inner.cfg.report(anyhow::Error::msg(err.to_string()));
                }
            }
        }
        side.filling.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Network;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_echo() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = ln.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut rd, mut wr) = conn.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    fn fast_cfg(max_conn: usize, kept_idle: usize) -> Config {
        Config {
            max_conn,
            kept_idle_conn: kept_idle,
            try_interval: Duration::from_millis(5),
            dial_timeout: Some(Duration::from_secs(1)),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn pools_settle_at_kept_idle() {
        let echo_a = spawn_echo().await;
        let echo_b = spawn_echo().await;
        let fwd = D2d::new(fast_cfg(0, 4));
        let _swap = fwd
            .transport(
                &Endpoint::dial(Network::Tcp, echo_a.to_string()),
                &Endpoint::dial(Network::Tcp, echo_b.to_string()),
            )
            .await
            .unwrap();

        time::sleep(Duration::from_millis(400)).await;
        let inner = fwd.inner.get().unwrap();
        assert_eq!(inner.a.pool.idle_for(&inner.a.key), 4);
        assert_eq!(inner.b.pool.idle_for(&inner.b.key), 4);

        fwd.close();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(inner.a.pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn pair_count_climbs_to_cap() {
        let echo_a = spawn_echo().await;
        let echo_b = spawn_echo().await;
        let fwd = D2d::new(fast_cfg(8, 4));
        let swap = Arc::new(
            fwd.transport(
                &Endpoint::dial(Network::Tcp, echo_a.to_string()),
                &Endpoint::dial(Network::Tcp, echo_b.to_string()),
            )
            .await
            .unwrap(),
        );

        let runner = {
            let swap = swap.clone();
            tokio::spawn(async move { swap.run().await })
        };
        time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(swap.run().await, Err(Error::SwapRunning)));

        // Echo servers hold every bridged pair open, so the count rises
        // until max_conn stops the fillers.
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(swap.conn_num(), 8);

        swap.close();
        let res = time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(res.is_ok());
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(swap.conn_num(), 0);
        fwd.close();
    }

    #[tokio::test]
    async fn bridges_traffic_between_remotes() {
        // The A-side remote speaks first; the B-side remote echoes.
        let speaker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let speaker_addr = speaker.local_addr().unwrap();
        let probe = tokio::spawn(async move {
            let (mut conn, _) = speaker.accept().await.unwrap();
            conn.write_all(b"d2d-ping").await.unwrap();
            let mut got = [0u8; 8];
            conn.read_exact(&mut got).await.unwrap();
            got
        });
        let echo_b = spawn_echo().await;

        let fwd = D2d::new(fast_cfg(1, 1));
        let swap = Arc::new(
            fwd.transport(
                &Endpoint::dial(Network::Tcp, speaker_addr.to_string()),
                &Endpoint::dial(Network::Tcp, echo_b.to_string()),
            )
            .await
            .unwrap(),
        );
        let runner = {
            let swap = swap.clone();
            tokio::spawn(async move { swap.run().await })
        };

        let got = time::timeout(Duration::from_secs(3), probe)
            .await
            .expect("bridged round trip")
            .unwrap();
        assert_eq!(&got, b"d2d-ping");

        swap.close();
        let _ = time::timeout(Duration::from_secs(2), runner).await;
        fwd.close();
    }

    #[tokio::test]
    async fn swap_restarts_and_double_transport_rejected() {
        let echo_a = spawn_echo().await;
        let echo_b = spawn_echo().await;
        let fwd = D2d::new(fast_cfg(4, 2));
        let swap = Arc::new(
            fwd.transport(
                &Endpoint::dial(Network::Tcp, echo_a.to_string()),
                &Endpoint::dial(Network::Tcp, echo_b.to_string()),
            )
            .await
            .unwrap(),
        );
        assert!(matches!(
            fwd.transport(
                &Endpoint::dial(Network::Tcp, echo_a.to_string()),
                &Endpoint::dial(Network::Tcp, echo_b.to_string()),
            )
            .await,
            Err(Error::AlreadyStarted)
        ));

        for _ in 0..2 {
            let runner = {
                let swap = swap.clone();
                tokio::spawn(async move { swap.run().await })
            };
            time::sleep(Duration::from_millis(200)).await;
            assert!(swap.conn_num() > 0);

            swap.close();
            let res = time::timeout(Duration::from_secs(2), runner)
                .await
                .unwrap()
                .unwrap();
            assert!(res.is_ok());
        }

        fwd.close();
        assert!(matches!(swap.run().await, Err(Error::Closed)));
    }
}
