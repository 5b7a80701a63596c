//! Per-side pool of idle connections, keyed by the peer address they
//! were opened to (D2D) or accepted from (L2L: the listener address).
//!
//! Parked connections wait in FIFO order. The pool tracks how many
//! connections are parked and how many are checked out; together they
//! never exceed `max_conn`. Dead and idle-expired entries are discarded
//! lazily on `get`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::{Conn, Error, Result};

struct Parked {
    conn: Conn,
    since: Instant,
}

struct Shelves {
    by_key: HashMap<String, VecDeque<Parked>>,
    in_pool: usize,
}

pub(crate) struct Pool {
    max_conn: usize,
    idle_conn: usize,
    idle_timeout: Option<Duration>,
    shelves: Mutex<Shelves>,
    outstanding: AtomicUsize,
    closed: AtomicBool,
}

impl Pool {
    /// `max_conn == 0` means uncapped. `idle_conn` is the normal parking
    /// bound per key; priority parking ignores it.
    pub(crate) fn new(max_conn: usize, idle_conn: usize, idle_timeout: Option<Duration>) -> Self {
        Self {
            max_conn,
            idle_conn: idle_conn.max(1),
            idle_timeout,
            shelves: Mutex::new(Shelves {
                by_key: HashMap::new(),
                in_pool: 0,
            }),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn park(&self, key: &str, conn: Conn, priority: bool) -> std::result::Result<(), Conn> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(conn);
        }
        let mut shelves = self.shelves.lock().expect("pool poisoned");
        if self.max_conn != 0
            && shelves.in_pool + self.outstanding.load(Ordering::SeqCst) >= self.max_conn
        {
            return Err(conn);
        }
        let shelf = shelves.by_key.entry(key.to_string()).or_default();
        if !priority && shelf.len() >= self.idle_conn {
            return Err(conn);
        }
        shelf.push_back(Parked {
            conn,
            since: Instant::now(),
        });
        shelves.in_pool += 1;
        Ok(())
    }

    /// Park an idle connection. Refused (handing the connection back to
    /// the caller, who closes it) when the pool is closed, the total
    /// would exceed `max_conn`, or the key already holds `idle_conn`
    /// parked entries.
    pub(crate) fn put(&self, key: &str, conn: Conn) -> std::result::Result<(), Conn> {
        self.park(key, conn, false)
    }

    /// Park bypassing the per-key idle bound; only `max_conn` applies.
    /// Used by the D2D fillers so a fresh dial is never dropped while
    /// overall capacity remains.
    pub(crate) fn put_priority(&self, key: &str, conn: Conn) -> std::result::Result<(), Conn> {
        self.park(key, conn, true)
    }

    /// Return a checkout that could not be used. Keeps the connection
    /// alive and re-parks it behind the surviving idle entries.
    pub(crate) fn put_back(&self, key: &str, conn: Conn) {
        self.release();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut shelves = self.shelves.lock().expect("pool poisoned");
        shelves.by_key.entry(key.to_string()).or_default().push_back(Parked {
            conn,
            since: Instant::now(),
        });
        shelves.in_pool += 1;
    }

    /// Check out the oldest live idle connection for `key`.
    ///
    /// Entries whose peer hung up and entries parked longer than the
    /// idle timeout are discarded on the way. `Ok(None)` means nothing
    /// is parked for the key right now.
    pub(crate) fn get(&self, key: &str) -> Result<Option<Conn>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let mut shelves = self.shelves.lock().expect("pool poisoned");
        let Shelves { by_key, in_pool } = &mut *shelves;
        let Some(shelf) = by_key.get_mut(key) else {
            return Ok(None);
        };
        while let Some(parked) = shelf.pop_front() {
            *in_pool -= 1;
            if let Some(limit) = self.idle_timeout
                && parked.since.elapsed() > limit
            {
                continue;
            }
            if parked.conn.is_stale() {
                continue;
            }
            self.outstanding.fetch_add(1, Ordering::SeqCst);
            return Ok(Some(parked.conn));
        }
        Ok(None)
    }

    /// A checkout was consumed (spliced and closed) by the engine.
    pub(crate) fn release(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub(crate) fn idle_len(&self) -> usize {
        self.shelves.lock().expect("pool poisoned").in_pool
    }

    pub(crate) fn idle_for(&self, key: &str) -> usize {
        self.shelves
            .lock()
            .expect("pool poisoned")
            .by_key
            .get(key)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Drop every parked connection and refuse all further traffic.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut shelves = self.shelves.lock().expect("pool poisoned");
        shelves.by_key.clear();
        shelves.in_pool = 0;
    }
}
