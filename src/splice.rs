//! The splice primitive and the bookkeeping every forwarder shares: the
//! active-halves counter, the pair table used for bulk close, the verify
//! hook seams, and the task scaffold that drives one spliced pair from
//! admission to completion.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};

use crate::pool::Pool;
use crate::{Conn, Error, ErrorSink, Result};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto principal trait,
/// so `AsyncRead + AsyncWrite` is wrapped into one.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Per-side hook run on a single connection before it is pooled (D2D
/// fillers, L2L accept) or paired (L2D accept).
///
/// `Ok(false)` or `Err` rejects the connection; the caller closes it.
/// The hook may perform I/O on the connection (send a token, read a
/// reply, compare).
#[async_trait]
pub trait ConnVerifier: Send + Sync {
    async fn verify(&self, conn: &mut Conn) -> anyhow::Result<bool>;
}

/// Pre-splice hook over a matched pair.
///
/// Runs exactly once per pair on the task that will drive the splice.
/// On `Ok` the engine splices the returned pair, which may be wrapped
/// substitutes. On `Err` nothing is spliced: the hook owns the streams
/// it was given (dropping them closes them), the error is reported to
/// the sink, and the pair's counter slots are still released.
#[async_trait]
pub trait PairVerifier: Send + Sync {
    async fn verify(
        &self,
        a: BoxedStream,
        b: BoxedStream,
    ) -> anyhow::Result<(BoxedStream, BoxedStream)>;
}

/// Atomic count of splice halves: +2 when a pair is assigned, -2 in one
/// step when it completes. The published pair count rounds half-pairs
/// (a checkout still waiting for its partner) up.
#[derive(Default)]
pub(crate) struct ActiveHalves(AtomicI64);

impl ActiveHalves {
    pub(crate) fn add(&self, n: i64) {
        self.0.fetch_add(n, Ordering::SeqCst);
    }

    pub(crate) fn pairs(&self) -> usize {
        let halves = self.0.load(Ordering::SeqCst).max(0);
        ((halves + 1) / 2) as usize
    }
}

/// State common to the three forwarders: the one-shot transport guard,
/// the terminal closed flag with its broadcast, and the halves counter.
pub(crate) struct Core {
    pub(crate) counter: ActiveHalves,
    started: AtomicBool,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl Core {
    pub(crate) fn new() -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            counter: ActiveHalves::default(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_tx,
        }
    }

    /// Claim the single `transport()` call.
    pub(crate) fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        Ok(())
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_tx.send_replace(true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close_rx(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }
}

/// Run-state of a swap handle: `idle -> running -> idle`, any number of
/// cycles. Transitions are serialized so a `close()` racing a `run()`
/// cannot strand the runner.
pub(crate) struct RunState {
    lock: std::sync::Mutex<bool>,
    running: Arc<AtomicBool>,
    stop_tx: watch::Sender<u64>,
}

impl RunState {
    pub(crate) fn new() -> Self {
        let (stop_tx, _) = watch::channel(0);
        Self {
            lock: std::sync::Mutex::new(false),
            running: Arc::new(AtomicBool::new(false)),
            stop_tx,
        }
    }

    /// Enter the running state; the returned receiver fires on `stop`.
    pub(crate) fn begin(&self) -> Result<watch::Receiver<u64>> {
        let mut held = self.lock.lock().expect("run state poisoned");
        if *held {
            return Err(Error::SwapRunning);
        }
        *held = true;
        self.running.store(true, Ordering::SeqCst);
        Ok(self.stop_tx.subscribe())
    }

    /// Leave the running state. Returns false when it was already idle.
    pub(crate) fn stop(&self) -> bool {
        let mut held = self.lock.lock().expect("run state poisoned");
        if !*held {
            return false;
        }
        *held = false;
        self.running.store(false, Ordering::SeqCst);
        let seq = *self.stop_tx.borrow();
        self.stop_tx.send_replace(seq.wrapping_add(1));
        true
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn running_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }
}

/// In-flight pairs of one swap handle, for bulk close.
pub(crate) struct PairTable {
    pairs: DashMap<u64, tokio::task::AbortHandle>,
    next: AtomicU64,
}

impl PairTable {
    pub(crate) fn new() -> Self {
        Self {
            pairs: DashMap::new(),
            next: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Abort every recorded pair task; aborting drops both connections,
    /// which closes them and releases their counter slots.
    pub(crate) fn close_all(&self) {
        self.pairs.retain(|_, handle| {
            handle.abort();
            false
        });
    }
}

struct TableGuard {
    table: Arc<PairTable>,
    id: u64,
}

impl Drop for TableGuard {
    fn drop(&mut self) {
        self.table.pairs.remove(&self.id);
    }
}

/// Two reserved counter halves, released exactly once. Optionally tells
/// the side pools that their checkouts left engine custody.
pub(crate) struct PairSlots {
    core: Arc<Core>,
    pools: [Option<Arc<Pool>>; 2],
}

impl PairSlots {
    /// Reserve two fresh halves on the counter.
    pub(crate) fn reserve(core: Arc<Core>) -> Self {
        core.counter.add(2);
        Self::adopt(core, [None, None])
    }

    /// Adopt two halves the caller already counted during checkout.
    pub(crate) fn adopt(core: Arc<Core>, pools: [Option<Arc<Pool>>; 2]) -> Self {
        metrics::gauge!("conduit_active_pairs").increment(1.0);
        metrics::counter!("conduit_pairs_total").increment(1);
        Self { core, pools }
    }
}

impl Drop for PairSlots {
    fn drop(&mut self) {
        self.core.counter.add(-2);
        metrics::gauge!("conduit_active_pairs").decrement(1.0);
        for pool in self.pools.iter().flatten() {
            pool.release();
        }
    }
}

/// Copy both directions until each has failed or reached EOF, then shut
/// both sides down. Buffers are allocated per direction.
pub(crate) async fn splice(
    mut a: BoxedStream,
    mut b: BoxedStream,
    buf_size: usize,
) -> io::Result<(u64, u64)> {
    let size = buf_size.max(1);
    let res = tokio::io::copy_bidirectional_with_sizes(&mut *a, &mut *b, size, size).await;
    let _ = (&mut *a).shutdown().await;
    let _ = (&mut *b).shutdown().await;
    res
}

/// Verify (once) and splice one pair, accounting for traffic.
pub(crate) async fn run_pair(
    verify: Option<Arc<dyn PairVerifier>>,
    sink: Option<Arc<dyn ErrorSink>>,
    a: BoxedStream,
    b: BoxedStream,
    buf_size: usize,
) {
    let (a, b) = match verify {
        Some(hook) => match hook.verify(a, b).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(err = %err, "pair verify rejected");
                if let Some(sink) = &sink {
                    sink.report(&err);
                }
                return;
            }
        },
        None => (a, b),
    };

    match splice(a, b, buf_size).await {
        Ok((a_to_b, b_to_a)) => {
            metrics::counter!("conduit_bytes_a_to_b_total").increment(a_to_b);
            metrics::counter!("conduit_bytes_b_to_a_total").increment(b_to_a);
        }
        Err(err) => {
            tracing::debug!(err = %err, "splice ended");
        }
    }
}

/// Spawn the task that owns one pair from admission to completion.
///
/// `make` produces the two streams (for L2D it performs the B-side dial;
/// for the pool-backed primitives it just hands over the checkouts) and
/// returns `None` when the pair cannot be formed. The task is recorded
/// in the pair table before it is released to run, so a concurrent bulk
/// close can never miss it; a pair admitted after `stop()` observes the
/// running flag down and closes both streams without copying.
pub(crate) fn spawn_pair<F>(
    table: Arc<PairTable>,
    running: Arc<AtomicBool>,
    verify: Option<Arc<dyn PairVerifier>>,
    sink: Option<Arc<dyn ErrorSink>>,
    buf_size: usize,
    slots: PairSlots,
    make: F,
) where
    F: Future<Output = Option<(BoxedStream, BoxedStream)>> + Send + 'static,
{
    spawn_tracked(table, async move {
        let _slots = slots;
        let Some((a, b)) = make.await else {
            return;
        };
        if !running.load(Ordering::SeqCst) {
            return;
        }
        run_pair(verify, sink, a, b, buf_size).await;
    });
}

/// Run `fut` on a task recorded in the pair table. The task does not
/// start until its abort handle is registered, so a concurrent bulk
/// close can never miss it. Used for splice pairs and UDP sessions.
pub(crate) fn spawn_tracked<F>(table: Arc<PairTable>, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let id = table.next_id();
    let (go_tx, go_rx) = oneshot::channel::<()>();
    let guard_table = table.clone();

    let handle = tokio::spawn(async move {
        let _entry = TableGuard {
            table: guard_table,
            id,
        };
        // Wait until the abort handle is recorded.
        let _ = go_rx.await;
        fut.await;
    });

    table.pairs.insert(id, handle.abort_handle());
    let _ = go_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn halves_round_up_to_pairs() {
        let c = ActiveHalves::default();
        assert_eq!(c.pairs(), 0);
        c.add(1);
        assert_eq!(c.pairs(), 1);
        c.add(1);
        assert_eq!(c.pairs(), 1);
        c.add(2);
        assert_eq!(c.pairs(), 2);
        c.add(-4);
        assert_eq!(c.pairs(), 0);
    }

    #[test]
    fn transport_claimed_once() {
        let core = Core::new();
        assert!(core.start().is_ok());
        assert!(matches!(core.start(), Err(Error::AlreadyStarted)));
        core.close();
        assert!(core.is_closed());
    }

    #[test]
    fn run_state_cycles() {
        let rs = RunState::new();
        let _rx = rs.begin().unwrap();
        assert!(matches!(rs.begin(), Err(Error::SwapRunning)));
        assert!(rs.stop());
        assert!(!rs.stop());
        assert!(rs.begin().is_ok());
    }

    #[tokio::test]
    async fn splice_moves_bytes_both_ways() {
        let (mut client_a, engine_a) = tokio::io::duplex(64);
        let (mut client_b, engine_b) = tokio::io::duplex(64);

        let task = tokio::spawn(splice(Box::new(engine_a), Box::new(engine_b), 16));

        client_a.write_all(b"north").await.unwrap();
        let mut buf = [0u8; 5];
        client_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"north");

        client_b.write_all(b"south").await.unwrap();
        client_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"south");

        drop(client_a);
        drop(client_b);
        let (a_to_b, b_to_a) = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(a_to_b, 5);
        assert_eq!(b_to_a, 5);
    }

    struct CaptureSink(Mutex<Vec<String>>);

    impl ErrorSink for CaptureSink {
        fn report(&self, err: &anyhow::Error) {
            self.0.lock().unwrap().push(err.to_string());
        }
    }

    struct RejectAll;

    #[async_trait]
    impl PairVerifier for RejectAll {
        async fn verify(
            &self,
            _a: BoxedStream,
            _b: BoxedStream,
        ) -> anyhow::Result<(BoxedStream, BoxedStream)> {
            anyhow::bail!("token mismatch")
        }
    }

    #[tokio::test]
    async fn rejected_pair_reports_and_closes() {
        let (mut client_a, engine_a) = tokio::io::duplex(64);
        let (_client_b, engine_b) = tokio::io::duplex(64);
        let sink = Arc::new(CaptureSink(Mutex::new(Vec::new())));

        run_pair(
            Some(Arc::new(RejectAll)),
            Some(sink.clone()),
            Box::new(engine_a),
            Box::new(engine_b),
            1024,
        )
        .await;

        assert_eq!(sink.0.lock().unwrap().as_slice(), ["token mismatch"]);
        // The hook dropped the engine half, so the client sees EOF.
        let mut buf = [0u8; 1];
        let n = client_a.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
