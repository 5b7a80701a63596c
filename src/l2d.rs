//! Listen→dial forwarding: accept inbound connections on the A side,
//! dial the configured B-side remote for each, splice.
//!
//! For datagram networks the "connection" is synthesised: each distinct
//! client source address gets a session owning one dialed B-side socket,
//! and datagrams are relayed in both directions until the B side goes
//! quiet past its read deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::net::{self, Backoff, Endpoint, Family, StreamListener};
use crate::splice::{BoxedStream, Core, PairSlots, PairTable, PairVerifier, RunState};
use crate::{Config, Error, Result};

/// Listen-to-dial forwarder: plain port forwarding, usable on either
/// side of a NAT when the remote is reachable.
pub struct L2d {
    cfg: Config,
    core: Arc<Core>,
}

impl L2d {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            core: Arc::new(Core::new()),
        }
    }

    /// Bind the A-side listener and start feeding accepted traffic into
    /// B-side dials. Callable once per forwarder.
    pub async fn transport(&self, listen: &Endpoint, dial: &Endpoint) -> Result<L2dSwap> {
        self.core.start()?;
        if listen.network.family() != dial.network.family() {
            return Err(Error::Unsupported("mixed stream/datagram endpoint pair"));
        }

        let inner = Arc::new(L2dInner {
            cfg: self.cfg.clone(),
            dial: dial.clone(),
            core: self.core.clone(),
            run: RunState::new(),
            table: Arc::new(PairTable::new()),
            sessions: DashMap::new(),
            fatal: std::sync::Mutex::new(None),
            verify: std::sync::Mutex::new(None),
            local: std::sync::Mutex::new(None),
        });

        match listen.network.family() {
            Family::Stream => {
                let ln = net::bind_stream(listen).await?;
                *inner.local.lock().expect("local addr poisoned") = ln.local_socket_addr();
                tracing::info!(listen = %ln.local_desc(), remote = ?dial.remote, "l2d: listening");
                tokio::spawn(accept_loop(inner.clone(), ln));
            }
            Family::Datagram => {
                let sock = net::bind_datagram(listen).await?;
                *inner.local.lock().expect("local addr poisoned") = sock.local_addr().ok();
                tracing::info!(listen = ?sock.local_addr().ok(), remote = ?dial.remote, "l2d: listening (datagram)");
                tokio::spawn(datagram_loop(inner.clone(), Arc::new(sock)));
            }
        }

        Ok(L2dSwap { inner })
    }

    /// Permanently stop the forwarder: the listener and all sessions go
    /// down, and any blocked `run()` returns.
    pub fn close(&self) {
        self.core.close();
    }
}

struct L2dInner {
    cfg: Config,
    dial: Endpoint,
    core: Arc<Core>,
    run: RunState,
    table: Arc<PairTable>,
    sessions: DashMap<SocketAddr, UdpSession>,
    fatal: std::sync::Mutex<Option<Error>>,
    verify: std::sync::Mutex<Option<Arc<dyn PairVerifier>>>,
    local: std::sync::Mutex<Option<SocketAddr>>,
}

impl L2dInner {
    fn over_cap(&self) -> bool {
        self.cfg.max_conn != 0 && self.core.counter.pairs() >= self.cfg.max_conn
    }

    fn pair_verify(&self) -> Option<Arc<dyn PairVerifier>> {
        self.verify.lock().expect("verify poisoned").clone()
    }

    fn stop_run(&self) {
        if self.run.stop() {
            self.table.close_all();
        }
    }

    fn fail(&self, err: Error) {
        let mut slot = self.fatal.lock().expect("fatal poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.run.stop();
        self.table.close_all();
    }
}

/// Restartable driver for an [`L2d`] transport.
pub struct L2dSwap {
    inner: Arc<L2dInner>,
}

impl L2dSwap {
    /// Install the pre-splice pair hook. Applies to pairs admitted from
    /// then on.
    pub fn set_verify(&self, verify: Arc<dyn PairVerifier>) {
        *self.inner.verify.lock().expect("verify poisoned") = Some(verify);
    }

    /// Address the A-side listener actually bound (useful with `:0`).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local.lock().expect("local addr poisoned")
    }

    /// Number of pairs (or datagram sessions) currently being forwarded.
    pub fn conn_num(&self) -> usize {
        self.inner.core.counter.pairs()
    }

    /// Forward until this handle or its parent is closed.
    ///
    /// Returns the fatal listener error if the accept loop died on one;
    /// `Ok(())` after a plain `close()`. The handle may run again after
    /// a close as long as the parent is still open.
    pub async fn run(&self) -> Result<()> {
        if self.inner.core.is_closed() {
            return Err(Error::Closed);
        }
        if let Some(err) = self.inner.fatal.lock().expect("fatal poisoned").take() {
            return Err(err);
        }
        let mut stopped = self.inner.run.begin()?;
        let _ = stopped.changed().await;
        if let Some(err) = self.inner.fatal.lock().expect("fatal poisoned").take() {
            return Err(err);
        }
        Ok(())
    }

    /// Stop the current run: every active pair and session is closed.
    /// The parent stays usable; `run()` may be called again.
    pub fn close(&self) {
        self.inner.stop_run();
    }
}

async fn accept_loop(inner: Arc<L2dInner>, ln: StreamListener) {
    let mut close_rx = inner.core.close_rx();
    let mut backoff = Backoff::new(Duration::from_secs(1));

    loop {
        let conn = tokio::select! {
            _ = close_rx.changed() => {
                inner.stop_run();
                return;
            }
            res = ln.accept() => match res {
                Ok(conn) => conn,
                Err(err) => {
                    if inner.core.is_closed() {
                        inner.stop_run();
                        return;
                    }
                    if net::is_transient(&err) {
                        if !backoff.in_streak() {
                            tracing::warn!(listen = %ln.local_desc(), err = %err, "l2d: transient accept error");
                            inner.cfg.report(anyhow::Error::new(err));
                        }
                        backoff.sleep().await;
                        continue;
                    }
                    tracing::error!(listen = %ln.local_desc(), err = %err, "l2d: accept failed");
                    let err = Error::Io(err);
                    inner.cfg.report(anyhow::Error::msg(err.to_string()));
                    inner.fail(err);
                    return;
                }
            }
        };
        backoff.reset();

        if inner.over_cap() || !inner.run.is_running() {
            drop(conn);
            continue;
        }

        // Reserve both halves up front so the cap stays exact while the
        // dial is in flight.
        let slots = PairSlots::reserve(inner.core.clone());
        let verify = inner.pair_verify();
        let task = inner.clone();
        crate::splice::spawn_pair(
            inner.table.clone(),
            inner.run.running_handle(),
            verify,
            inner.cfg.error_sink.clone(),
            inner.cfg.buf_size(),
            slots,
            async move {
                let mut a = conn;
                if let Some(hook) = &task.cfg.verify_a {
                    match hook.verify(&mut a).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::debug!("l2d: a-side verify rejected");
                            return None;
                        }
                        Err(err) => {
                            tracing::warn!(err = %err, "l2d: a-side verify failed");
                            task.cfg.report(err);
                            return None;
                        }
                    }
                }
                match net::dial_stream(&task.dial, task.cfg.dial_timeout, task.cfg.shutdown.as_ref())
                    .await
                {
                    Ok(b) => Some((Box::new(a) as BoxedStream, Box::new(b) as BoxedStream)),
                    Err(err) => {
                        tracing::warn!(remote = ?task.dial.remote, err = %err, "l2d: dial failed, dropping client");
                        task.cfg.report(anyhow::Error::new(err));
                        None
                    }
                }
            },
        );
    }
}

struct UdpSession {
    tx: mpsc::Sender<Vec<u8>>,
}

struct SessionGuard {
    inner: Arc<L2dInner>,
    src: SocketAddr,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.inner.sessions.remove(&self.src);
    }
}

async fn datagram_loop(inner: Arc<L2dInner>, sock: Arc<UdpSocket>) {
    let mut close_rx = inner.core.close_rx();
    let mut backoff = Backoff::new(Duration::from_secs(1));
    let mut buf = vec![0u8; inner.cfg.buf_size()];

    loop {
        let (len, src) = tokio::select! {
            _ = close_rx.changed() => {
                inner.stop_run();
                return;
            }
            res = sock.recv_from(&mut buf) => match res {
                Ok(got) => got,
                Err(err) => {
                    if inner.core.is_closed() {
                        inner.stop_run();
                        return;
                    }
                    if net::is_transient(&err) {
                        if !backoff.in_streak() {
                            tracing::warn!(err = %err, "l2d: transient datagram read error");
                            inner.cfg.report(anyhow::Error::new(err));
                        }
                        backoff.sleep().await;
                        continue;
                    }
                    tracing::error!(err = %err, "l2d: datagram listener failed");
                    let err = Error::Io(err);
                    inner.cfg.report(anyhow::Error::msg(err.to_string()));
                    inner.fail(err);
                    return;
                }
            }
        };
        backoff.reset();
        let payload = buf[..len].to_vec();

        // Established session: relay and move on.
        if let Some(session) = inner.sessions.get(&src) {
            let _ = session.tx.try_send(payload);
            continue;
        }

        if inner.over_cap() || !inner.run.is_running() {
            continue;
        }

        let slots = PairSlots::reserve(inner.core.clone());
        let remote = match net::dial_datagram(&inner.dial).await {
            Ok(remote) => remote,
            Err(err) => {
                tracing::warn!(remote = ?inner.dial.remote, err = %err, "l2d: datagram dial failed");
                inner.cfg.report(anyhow::Error::msg(err.to_string()));
                drop(slots);
                continue;
            }
        };

        let (tx, rx) = mpsc::channel::<Vec<u8>>(128);
        match inner.sessions.entry(src) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                // Lost the insert race; relay through the winner.
                let _ = existing.get().tx.try_send(payload);
                continue;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(UdpSession { tx: tx.clone() });
            }
        }

        let _ = tx.try_send(payload);
        let session_inner = inner.clone();
        let listener = sock.clone();
        crate::splice::spawn_tracked(inner.table.clone(), async move {
            let guard = SessionGuard {
                inner: session_inner,
                src,
            };
            session_loop(&guard.inner, listener, src, remote, rx, slots).await;
        });
    }
}

/// Relay datagrams for one client until the B side errors or stays
/// silent past the read deadline.
async fn session_loop(
    inner: &Arc<L2dInner>,
    listener: Arc<UdpSocket>,
    src: SocketAddr,
    remote: UdpSocket,
    mut rx: mpsc::Receiver<Vec<u8>>,
    slots: PairSlots,
) {
    let _slots = slots;
    let wait = inner
        .cfg
        .dial_timeout
        .unwrap_or(Duration::ZERO)
        .max(Duration::from_secs(60));
    let mut buf = vec![0u8; inner.cfg.buf_size()];
    let mut deadline = Instant::now() + wait;

    loop {
        tokio::select! {
            queued = rx.recv() => match queued {
                Some(payload) => {
                    if remote.send(&payload).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            res = remote.recv(&mut buf) => match res {
                Ok(len) => {
                    deadline = Instant::now() + wait;
                    let _ = listener.send_to(&buf[..len], src).await;
                }
                Err(err) => {
                    tracing::debug!(client = %src, err = %err, "l2d: session read failed");
                    break;
                }
            },
            _ = time::sleep_until(deadline) => {
                tracing::debug!(client = %src, "l2d: session expired");
                break;
            }
        }
    }
}
