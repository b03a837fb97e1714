//! Connection pools: admission control, wait queue and worker queue.
//!
//! Each pool guards its substructures with separate locks to keep
//! contention low. Lock order when several are needed:
//! worker-queue -> wait-queue -> threads -> server pools -> stats.

pub mod conn;
pub mod worker;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::config::PoolSettings;
use crate::error::Status;
use crate::server::Server;
use crate::sock::Sock;

use self::conn::{Conn, flags};

// ============================================================================
// Substructures
// ============================================================================

#[derive(Debug)]
pub struct ThreadState {
    pub min: usize,
    pub max: usize,
    pub current: usize,
    pub idle: usize,
    pub creating: usize,
    pub nextid: u64,
    pub connsperthread: usize,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct WaitQueue {
    pub wait: VecDeque<Box<Conn>>,
    pub freelist: Vec<Box<Conn>>,
    pub lowwatermark: usize,
    pub highwatermark: usize,
    pub rejectoverrun: bool,
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub processed: u64,
    pub queued: u64,
    pub dropped: u64,
    pub spooled: u64,
    pub connthreads: u64,
}

#[derive(Debug)]
pub struct RateState {
    pub pool_limit: i64,
    pub default_connection_limit: i64,
    pub bytes_sent: i64,
    /// One slot per writer thread; aggregated for the pool rate.
    pub currentrates: Vec<i64>,
}

/// Worker-slot lifecycle. `Idle` is the only state in which the slot
/// appears on the worker queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Free,
    Initial,
    Warmup,
    Ready,
    Idle,
    Busy,
    Dead,
}

/// Snapshot of the request a worker is processing, for introspection.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub id: u64,
    pub peer: String,
    pub method: String,
    pub url: String,
    pub start: Instant,
}

impl ConnInfo {
    fn from_conn(conn: &Conn) -> Self {
        Self {
            id: conn.id,
            peer: conn
                .sock
                .as_ref()
                .map(|s| s.peer_addr().ip().to_string())
                .unwrap_or_default(),
            method: conn.method.clone(),
            url: conn.url.clone(),
            start: conn.request_queue_time.unwrap_or_else(Instant::now),
        }
    }

    fn as_value(&self, state: &str) -> Value {
        json!([
            self.id,
            self.peer,
            state,
            self.method,
            self.url,
            self.start.elapsed().as_secs_f64(),
        ])
    }
}

#[derive(Debug)]
pub struct SlotState {
    pub phase: SlotPhase,
    pub conn: Option<Box<Conn>>,
    /// What this worker currently runs, for `server active`.
    pub running: Option<ConnInfo>,
}

/// Per-worker argument slot: its own mutex and condvar carry the direct
/// handoff, so a signal cannot be lost between a null check and the wait.
#[derive(Debug)]
pub struct WorkerSlot {
    pub state: Mutex<SlotState>,
    pub cond: Condvar,
    pub join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl WorkerSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState { phase: SlotPhase::Free, conn: None, running: None }),
            cond: Condvar::new(),
            join: Mutex::new(None),
        })
    }
}

#[derive(Debug)]
pub struct ThreadQueue {
    /// Indices of slots advertising themselves as idle (LIFO).
    pub idle: Vec<usize>,
    pub slots: Vec<Arc<WorkerSlot>>,
}

// ============================================================================
// Pool
// ============================================================================

#[derive(Debug)]
pub struct Pool {
    pub name: String,
    pub threads: Mutex<ThreadState>,
    pub wqueue: Mutex<WaitQueue>,
    /// Shutdown rendezvous only.
    pub wqueue_cond: Condvar,
    pub tqueue: Mutex<ThreadQueue>,
    pub stats: Mutex<PoolStats>,
    pub rate: Mutex<RateState>,
}

impl Pool {
    pub fn new(name: &str, settings: &PoolSettings) -> Arc<Self> {
        let freelist = (0..settings.maxconnections)
            .map(|_| Box::new(Conn::default()))
            .collect();
        let slots = (0..settings.maxthreads).map(|_| WorkerSlot::new()).collect();
        Arc::new(Self {
            name: name.to_string(),
            threads: Mutex::new(ThreadState {
                min: settings.minthreads,
                max: settings.maxthreads,
                current: 0,
                idle: 0,
                creating: 0,
                nextid: 0,
                connsperthread: settings.connsperthread,
                timeout: settings.thread_timeout(),
            }),
            wqueue: Mutex::new(WaitQueue {
                wait: VecDeque::new(),
                freelist,
                lowwatermark: settings.lowwatermark,
                highwatermark: settings.highwatermark,
                rejectoverrun: settings.rejectoverrun,
            }),
            wqueue_cond: Condvar::new(),
            tqueue: Mutex::new(ThreadQueue { idle: Vec::new(), slots }),
            stats: Mutex::new(PoolStats::default()),
            rate: Mutex::new(RateState {
                pool_limit: settings.poolratelimit,
                default_connection_limit: settings.connectionratelimit,
                bytes_sent: 0,
                currentrates: Vec::new(),
            }),
        })
    }

    /// Thread-creation policy. Create a new worker iff no creation is in
    /// flight (or the backlog exceeds the high watermark), idle workers are
    /// scarce (or the backlog exceeds the low watermark), the maximum is
    /// not reached, and the server is not shutting down.
    fn needed_additional_threads(
        &self,
        threads: &ThreadState,
        wq: &WaitQueue,
        server: &Server,
    ) -> bool {
        let burst = wq.wait.len() > wq.highwatermark;
        let scarce = threads.current < threads.min || wq.wait.len() > wq.lowwatermark;
        if (threads.creating == 0 || burst) && scarce && threads.current < threads.max {
            !server.is_shutdown()
        } else {
            false
        }
    }

    // ------------------------------------------------------------------------
    // rates
    // ------------------------------------------------------------------------

    /// One-time slot allocation for a writer thread.
    pub fn allocate_rate_slot(&self) -> usize {
        let mut rate = self.rate.lock().unwrap();
        rate.currentrates.push(0);
        rate.currentrates.len() - 1
    }

    /// Update a writer's rate and return the pool total plus the number of
    /// active writers.
    pub fn total_rate(&self, slot: usize, rate_value: i64) -> (i64, usize) {
        let mut rate = self.rate.lock().unwrap();
        if let Some(entry) = rate.currentrates.get_mut(slot) {
            *entry = rate_value;
        }
        let total: i64 = rate.currentrates.iter().sum();
        let writers = rate.currentrates.iter().filter(|r| **r > 0).count();
        (total, writers)
    }

    pub fn add_bytes_sent(&self, bytes: i64) {
        self.rate.lock().unwrap().bytes_sent += bytes;
    }

    // ------------------------------------------------------------------------
    // introspection
    // ------------------------------------------------------------------------

    pub fn stats_value(&self) -> Value {
        let stats = self.stats.lock().unwrap();
        let rate = self.rate.lock().unwrap();
        json!({
            "pool": self.name,
            "processed": stats.processed,
            "queued": stats.queued,
            "dropped": stats.dropped,
            "spooled": stats.spooled,
            "connthreads": stats.connthreads,
            "sent": rate.bytes_sent,
        })
    }

    pub fn threads_value(&self) -> Value {
        let threads = self.threads.lock().unwrap();
        json!({
            "min": threads.min,
            "max": threads.max,
            "current": threads.current,
            "idle": threads.idle,
            "stopping": 0,
        })
    }

    /// Currently running requests.
    pub fn active_conns(&self) -> Vec<Value> {
        let tqueue = self.tqueue.lock().unwrap();
        tqueue
            .slots
            .iter()
            .filter_map(|slot| {
                let state = slot.state.lock().unwrap();
                state.running.as_ref().map(|info| info.as_value("running"))
            })
            .collect()
    }

    /// Requests sitting in the wait queue.
    pub fn queued_conns(&self) -> Vec<Value> {
        let wq = self.wqueue.lock().unwrap();
        wq.wait
            .iter()
            .map(|conn| ConnInfo::from_conn(conn).as_value("queued"))
            .collect()
    }

    pub fn waiting(&self) -> usize {
        self.wqueue.lock().unwrap().wait.len()
    }
}

// ============================================================================
// Enqueue
// ============================================================================

/// Outcome of an enqueue attempt. On saturation the socket travels back to
/// the caller for retry or rejection handling.
#[derive(Debug)]
pub enum QueueResult {
    Queued,
    /// Pool saturated; retry later.
    Timeout(Sock),
    /// Shutdown or overrun rejection.
    Rejected(Sock),
}

impl QueueResult {
    pub fn status(&self) -> Status {
        match self {
            QueueResult::Queued => Status::Ok,
            QueueResult::Timeout(_) => Status::Timeout,
            QueueResult::Rejected(_) => Status::Error,
        }
    }
}

/// Admit an accepted socket: pick the pool via URL-space routing, hand the
/// Conn directly to an idle worker or append it to the wait queue, and
/// apply the thread-creation policy.
pub fn queue_conn(server: &Arc<Server>, mut sock: Sock) -> QueueResult {
    if server.is_shutdown() {
        return QueueResult::Rejected(sock);
    }

    let pool = select_pool(server, &sock);

    let conn = pool.wqueue.lock().unwrap().freelist.pop();
    let Some(mut conn) = conn else {
        // Saturated. The waiting flag keeps repeated attempts for the same
        // socket from being counted more than once.
        if sock.flags & flags::SOCK_WAITING == 0 {
            sock.flags |= flags::SOCK_WAITING;
            let (waiting, idle, current) = {
                let wq = pool.wqueue.lock().unwrap();
                let threads = pool.threads.lock().unwrap();
                (wq.wait.len(), threads.idle, threads.current)
            };
            log::info!(
                "[pool {}] all available connections are used, waiting {waiting} \
                 idle {idle} current {current}",
                pool.name
            );
            if pool.wqueue.lock().unwrap().rejectoverrun {
                pool.stats.lock().unwrap().dropped += 1;
                return QueueResult::Rejected(sock);
            }
        }
        return QueueResult::Timeout(sock);
    };

    // Fill the slot and move ownership of the socket.
    conn.id = server.next_conn_id();
    pool.stats.lock().unwrap().processed += 1;
    let now = Instant::now();
    conn.request_queue_time = Some(now);
    conn.accept_time = Some(sock.accept_time);
    conn.flags = sock.flags;
    conn.rate_limit = pool.rate.lock().unwrap().default_connection_limit;
    if let Some(req) = sock.request.as_ref() {
        conn.method = req.method.clone();
        conn.url = req.url.clone();
        conn.request_line = req.line.clone();
    }
    sock.flags = 0;
    conn.sock = Some(sock);

    // Direct handoff to an advertised-idle worker when one exists.
    let handoff = {
        let mut tqueue = pool.tqueue.lock().unwrap();
        tqueue.idle.pop().map(|idx| tqueue.slots[idx].clone())
    };

    let mut conn = Some(conn);
    let mut create = false;
    if let Some(slot) = handoff {
        create = {
            let wq = pool.wqueue.lock().unwrap();
            let threads = pool.threads.lock().unwrap();
            pool.needed_additional_threads(&threads, &wq, server)
        };
        // Signalling holds the slot mutex so the wake-up cannot be lost
        // between the worker's null check and its wait.
        let mut state = slot.state.lock().unwrap();
        if state.phase == SlotPhase::Idle {
            state.conn = conn.take();
            slot.cond.notify_one();
        } else {
            // The worker timed out at the same moment; fall back to the
            // wait queue instead of stranding the request in a dead slot.
            log::debug!("direct handoff raced an idle timeout ({:?})", state.phase);
        }
    }

    if let Some(conn) = conn.take() {
        let mut wq = pool.wqueue.lock().unwrap();
        wq.wait.push_back(conn);
        let threads = pool.threads.lock().unwrap();
        pool.stats.lock().unwrap().queued += 1;
        create = pool.needed_additional_threads(&threads, &wq, server);
    }

    if create {
        {
            let mut threads = pool.threads.lock().unwrap();
            threads.current += 1;
            threads.creating += 1;
        }
        worker::create_conn_thread(server, &pool);
    }

    QueueResult::Queued
}

fn select_pool(server: &Arc<Server>, sock: &Sock) -> Arc<Pool> {
    if let Some(hint) = &sock.pool_hint {
        if let Some(pool) = server.pool(hint) {
            return pool;
        }
    }
    if let Some(req) = sock.request.as_ref() {
        let urlspace = server.urlspace.read().unwrap();
        if let Some(pool_name) = urlspace.lookup(&req.method, &req.url) {
            if let Some(pool) = server.pool(pool_name) {
                return pool;
            }
        }
    }
    server.default_pool()
}

/// Ensure the pool keeps at least its minimum of workers; typically called
/// from the driver and from exiting workers.
pub fn ensure_running_threads(server: &Arc<Server>, pool: &Arc<Pool>) {
    let create = {
        let wq = pool.wqueue.lock().unwrap();
        let mut threads = pool.threads.lock().unwrap();
        let create = pool.needed_additional_threads(&threads, &wq, server);
        if create {
            threads.current += 1;
            threads.creating += 1;
        }
        create
    };
    if create {
        log::info!(
            "ensure running connection threads: creating worker in pool {}",
            pool.name
        );
        worker::create_conn_thread(server, pool);
    }
}

/// Broadcast all worker-slot condvars, typically at shutdown.
pub fn wakeup_conn_threads(pool: &Arc<Pool>) {
    let slots: Vec<Arc<WorkerSlot>> = pool.tqueue.lock().unwrap().slots.clone();
    for slot in slots {
        let _guard = slot.state.lock().unwrap();
        slot.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(settings: PoolSettings) -> Arc<Pool> {
        Pool::new("default", &settings)
    }

    fn test_server() -> Arc<Server> {
        Server::build_for_tests()
    }

    #[test]
    fn test_policy_truth_table() {
        let server = test_server();
        let pool = test_pool(PoolSettings {
            minthreads: 2,
            maxthreads: 8,
            lowwatermark: 1,
            highwatermark: 4,
            ..Default::default()
        });

        let mut wq = pool.wqueue.lock().unwrap();
        let mut threads = pool.threads.lock().unwrap();

        // Below min threads, nothing queued: create.
        threads.current = 0;
        assert!(pool.needed_additional_threads(&threads, &wq, &server));

        // At min, queue below low watermark: no creation.
        threads.current = 2;
        assert!(!pool.needed_additional_threads(&threads, &wq, &server));

        // Backlog above low watermark: create.
        wq.wait.push_back(Box::new(Conn::default()));
        wq.wait.push_back(Box::new(Conn::default()));
        assert!(pool.needed_additional_threads(&threads, &wq, &server));

        // A creation in flight serializes, unless the backlog exceeds the
        // high watermark.
        threads.creating = 1;
        assert!(!pool.needed_additional_threads(&threads, &wq, &server));
        for _ in 0..3 {
            wq.wait.push_back(Box::new(Conn::default()));
        }
        assert!(pool.needed_additional_threads(&threads, &wq, &server));

        // Never beyond max threads.
        threads.current = 8;
        assert!(!pool.needed_additional_threads(&threads, &wq, &server));
    }

    #[test]
    fn test_rate_slots_aggregate() {
        let pool = test_pool(PoolSettings::default());
        let a = pool.allocate_rate_slot();
        let b = pool.allocate_rate_slot();
        assert_ne!(a, b);
        assert_eq!(pool.total_rate(a, 100), (100, 1));
        assert_eq!(pool.total_rate(b, 50), (150, 2));
        assert_eq!(pool.total_rate(a, 0), (50, 1));
    }

    #[test]
    fn test_freelist_preallocation() {
        let pool = test_pool(PoolSettings { maxconnections: 3, ..Default::default() });
        assert_eq!(pool.wqueue.lock().unwrap().freelist.len(), 3);
        assert_eq!(pool.tqueue.lock().unwrap().slots.len(), 10);
    }
}
