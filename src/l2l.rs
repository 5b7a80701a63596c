//! Listen↔listen forwarding: two public listeners, one per side, with
//! clients dialing in on both. Accepted connections park in per-side
//! pools; the swap loop pairs one from each pool and splices them, which
//! gives two dial-only peers a byte-level duplex path through this host.
//!
//! Datagram networks are not supported in this mode.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::net::{self, Backoff, Endpoint, Family, StreamListener};
use crate::pool::Pool;
use crate::splice::{BoxedStream, ConnVerifier, Core, PairSlots, PairTable, PairVerifier, RunState};
use crate::{Config, Error, Result};

/// Listen-to-listen forwarder for bridging two dial-only peers.
pub struct L2l {
    cfg: Config,
    core: Arc<Core>,
    inner: OnceLock<Arc<L2lInner>>,
}

impl L2l {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            core: Arc::new(Core::new()),
            inner: OnceLock::new(),
        }
    }

    /// Bind both listeners and start parking accepted connections.
    /// Callable once per forwarder; stream networks only.
    pub async fn transport(&self, a: &Endpoint, b: &Endpoint) -> Result<L2lSwap> {
        self.core.start()?;
        if a.network.family() != Family::Stream || b.network.family() != Family::Stream {
            return Err(Error::Unsupported(
                "datagram networks in listen-to-listen mode",
            ));
        }

        let ln_a = net::bind_stream(a).await?;
        let ln_b = net::bind_stream(b).await?;

        let kept = self.cfg.kept_idle();
        let side_a = Arc::new(Side {
            pool: Arc::new(Pool::new(self.cfg.max_conn, kept, self.cfg.idle_timeout)),
            key: ln_a.local_desc(),
            local: ln_a.local_socket_addr(),
            verify: self.cfg.verify_a.clone(),
            name: "a",
        });
        let side_b = Arc::new(Side {
            pool: Arc::new(Pool::new(self.cfg.max_conn, kept, self.cfg.idle_timeout)),
            key: ln_b.local_desc(),
            local: ln_b.local_socket_addr(),
            verify: self.cfg.verify_b.clone(),
            name: "b",
        });

        let inner = Arc::new(L2lInner {
            cfg: self.cfg.clone(),
            core: self.core.clone(),
            run: RunState::new(),
            table: Arc::new(PairTable::new()),
            verify: std::sync::Mutex::new(None),
            a: side_a,
            b: side_b,
        });
        let _ = self.inner.set(inner.clone());

        tracing::info!(a = %inner.a.key, b = %inner.b.key, "l2l: listening");
        tokio::spawn(accept_park_loop(inner.clone(), ln_a, inner.a.clone()));
        tokio::spawn(accept_park_loop(inner.clone(), ln_b, inner.b.clone()));

        Ok(L2lSwap { inner })
    }

    /// Permanently stop the forwarder: both listeners and both pools go
    /// down, and any blocked `run()` returns.
    pub fn close(&self) {
        self.core.close();
        if let Some(inner) = self.inner.get() {
            inner.a.pool.close();
            inner.b.pool.close();
        }
    }
}

struct Side {
    pool: Arc<Pool>,
    key: String,
    local: Option<SocketAddr>,
    verify: Option<Arc<dyn ConnVerifier>>,
    name: &'static str,
}

struct L2lInner {
    cfg: Config,
    core: Arc<Core>,
    run: RunState,
    table: Arc<PairTable>,
    verify: std::sync::Mutex<Option<Arc<dyn PairVerifier>>>,
    a: Arc<Side>,
    b: Arc<Side>,
}

impl L2lInner {
    fn over_cap(&self, side: &Side) -> bool {
        self.cfg.max_conn != 0
            && self.core.counter.pairs() + side.pool.idle_len() >= self.cfg.max_conn
    }
}

/// Restartable driver for an [`L2l`] transport.
pub struct L2lSwap {
    inner: Arc<L2lInner>,
}

impl L2lSwap {
    /// Install the pre-splice pair hook.
    pub fn set_verify(&self, verify: Arc<dyn PairVerifier>) {
        *self.inner.verify.lock().expect("verify poisoned") = Some(verify);
    }

    pub fn a_local_addr(&self) -> Option<SocketAddr> {
        self.inner.a.local
    }

    pub fn b_local_addr(&self) -> Option<SocketAddr> {
        self.inner.b.local
    }

    /// Number of pairs currently being forwarded.
    pub fn conn_num(&self) -> usize {
        self.inner.core.counter.pairs()
    }

    /// Pair and splice parked connections until this handle or its
    /// parent is closed. Restartable after `close()` while the parent
    /// lives.
    pub async fn run(&self) -> Result<()> {
        if self.inner.core.is_closed() {
            return Err(Error::Closed);
        }
        let mut stopped = self.inner.run.begin()?;
        let mut backoff = Backoff::new(Duration::from_secs(1));

        loop {
            if !self.inner.run.is_running() {
                return Ok(());
            }
            if self.inner.core.is_closed() {
                self.close();
                return Ok(());
            }

            let inner = &self.inner;
            if inner.a.pool.idle_len() == 0 || inner.b.pool.idle_len() == 0 {
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

    /// Stop the current run and close every active pair. Parked
    /// connections stay pooled for the next run.
    pub fn close(&self) {
        self.inner.run.stop();
        self.inner.table.close_all();
    }
}

async fn accept_park_loop(inner: Arc<L2lInner>, ln: StreamListener, side: Arc<Side>) {
    let mut close_rx = inner.core.close_rx();
    let mut backoff = Backoff::new(Duration::from_secs(1));

    loop {
        let conn = tokio::select! {
            _ = close_rx.changed() => return,
            res = ln.accept() => match res {
                Ok(conn) => conn,
                Err(err) => {
                    if inner.core.is_closed() {
                        return;
                    }
                    if net::is_transient(&err) {
                        if !backoff.in_streak() {
                            tracing::warn!(side = side.name, listen = %side.key, err = %err, "l2l: transient accept error");
                            inner.cfg.report(anyhow::Error::new(err));
                        }
                        backoff.sleep().await;
                        continue;
                    }
                    // Only this side's loop dies; the sibling keeps
                    // accepting until the parent closes.
                    tracing::error!(side = side.name, listen = %side.key, err = %err, "l2l: accept failed");
                    inner.cfg.report(anyhow::Error::new(err));
                    return;
                }
            }
        };
        backoff.reset();

        if inner.over_cap(&side) {
            drop(conn);
            continue;
        }

        match &side.verify {
            Some(hook) => {
                // Verification may do I/O; keep it off the accept path.
                let hook = hook.clone();
                let side = side.clone();
                let cfg = inner.cfg.clone();
                tokio::spawn(async move {
                    let mut conn = conn;
                    match hook.verify(&mut conn).await {
                        Ok(true) => {
                            if side.pool.put(&side.key, conn).is_err() {
                                tracing::debug!(side = side.name, "l2l: pool refused connection");
                            }
                        }
                        Ok(false) => {
                            tracing::debug!(side = side.name, "l2l: verify rejected connection");
                        }
                        Err(err) => {
                            tracing::warn!(side = side.name, err = %err, "l2l: verify failed");
                            cfg.report(err);
                        }
                    }
                });
            }
            None => {
                if side.pool.put(&side.key, conn).is_err() {
                    tracing::debug!(side = side.name, "l2l: pool refused connection");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Conn, Network};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::{self, Duration};

    fn forwarder(cfg: Config) -> L2l {
        L2l::new(cfg)
    }

    async fn start(
        fwd: &L2l,
    ) -> (Arc<L2lSwap>, SocketAddr, SocketAddr, tokio::task::JoinHandle<Result<()>>) {
        let swap = Arc::new(
            fwd.transport(
                &Endpoint::listen(Network::Tcp, "127.0.0.1:0"),
                &Endpoint::listen(Network::Tcp, "127.0.0.1:0"),
            )
            .await
            .unwrap(),
        );
        let a = swap.a_local_addr().unwrap();
        let b = swap.b_local_addr().unwrap();
        let runner = {
            let swap = swap.clone();
            tokio::spawn(async move { swap.run().await })
        };
        time::sleep(Duration::from_millis(50)).await;
        (swap, a, b, runner)
    }

    #[tokio::test]
    async fn datagram_networks_rejected() {
        let fwd = forwarder(Config::default());
        let got = fwd
            .transport(
                &Endpoint::listen(Network::Udp, "127.0.0.1:0"),
                &Endpoint::listen(Network::Udp, "127.0.0.1:0"),
            )
            .await;
        assert!(matches!(got, Err(Error::Unsupported(_))));
    }

    #[tokio::test]
    async fn pairs_bridge_both_sides() {
        let fwd = forwarder(Config {
            max_conn: 5,
            kept_idle_conn: 5,
            ..Config::default()
        });
        let (swap, a_addr, b_addr, runner) = start(&fwd).await;

        let mut a_clients = Vec::new();
        let mut b_clients = Vec::new();
        for i in 0..5u8 {
            let mut a = TcpStream::connect(a_addr).await.unwrap();
            a.write_all(&[i; 8]).await.unwrap();
            a_clients.push(a);
        }
        for _ in 0..5 {
            b_clients.push(TcpStream::connect(b_addr).await.unwrap());
        }

        // Every B client reads some A payload and echoes it; every A
        // client must get its own bytes back.
        for b in &mut b_clients {
            let mut got = [0u8; 8];
            time::timeout(Duration::from_secs(2), b.read_exact(&mut got))
                .await
                .expect("paired")
                .unwrap();
            b.write_all(&got).await.unwrap();
        }
        for (i, a) in a_clients.iter_mut().enumerate() {
            let mut got = [0u8; 8];
            time::timeout(Duration::from_secs(2), a.read_exact(&mut got))
                .await
                .expect("echo")
                .unwrap();
            assert_eq!(got, [i as u8; 8]);
        }
        assert_eq!(swap.conn_num(), 5);

        // The cap is reached: further A-side clients are shed at accept.
        for _ in 0..3 {
            let mut extra = TcpStream::connect(a_addr).await.unwrap();
            let mut got = [0u8; 1];
            let res = time::timeout(Duration::from_secs(2), extra.read(&mut got)).await;
            assert!(matches!(res, Ok(Ok(0)) | Ok(Err(_))));
        }

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

    struct RejectFirst(AtomicBool);

    #[async_trait]
    impl ConnVerifier for RejectFirst {
        async fn verify(&self, _conn: &mut Conn) -> anyhow::Result<bool> {
            Ok(self.0.swap(true, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn rejected_connection_is_never_paired() {
        let fwd = forwarder(Config {
            verify_a: Some(Arc::new(RejectFirst(AtomicBool::new(false)))),
            ..Config::default()
        });
        let (swap, a_addr, b_addr, runner) = start(&fwd).await;

        // First A-side client fails verification and is closed unpooled.
        let mut first = TcpStream::connect(a_addr).await.unwrap();
        let mut got = [0u8; 1];
        let res = time::timeout(Duration::from_secs(2), first.read(&mut got)).await;
        assert!(matches!(res, Ok(Ok(0)) | Ok(Err(_))));

        // The second passes and pairs with the B side.
        let mut second = TcpStream::connect(a_addr).await.unwrap();
        second.write_all(b"ok").await.unwrap();
        let mut b = TcpStream::connect(b_addr).await.unwrap();
        let mut got = [0u8; 2];
        time::timeout(Duration::from_secs(2), b.read_exact(&mut got))
            .await
            .expect("paired with surviving connection")
            .unwrap();
        assert_eq!(&got, b"ok");

        swap.close();
        let _ = time::timeout(Duration::from_secs(2), runner).await;
        fwd.close();
    }

    #[tokio::test]
    async fn transport_claimed_once() {
        let fwd = forwarder(Config::default());
        let _swap = fwd
            .transport(
                &Endpoint::listen(Network::Tcp, "127.0.0.1:0"),
                &Endpoint::listen(Network::Tcp, "127.0.0.1:0"),
            )
            .await
            .unwrap();
        assert!(matches!(
            fwd.transport(
                &Endpoint::listen(Network::Tcp, "127.0.0.1:0"),
                &Endpoint::listen(Network::Tcp, "127.0.0.1:0"),
            )
            .await,
            Err(Error::AlreadyStarted)
        ));
        fwd.close();
    }
}
