//! Worker threads: warmup, direct-handoff wait loop, request execution and
//! the exit/join protocol.

use std::sync::Arc;
use std::time::Instant;

use crate::runner;
use crate::server::Server;

use super::conn::{Conn, flags};
use super::{ConnInfo, Pool, SlotPhase, WorkerSlot};

/// Claim a free worker slot and spawn its thread. The caller has already
/// incremented `current` and `creating`; failure to claim rolls both back.
pub fn create_conn_thread(server: &Arc<Server>, pool: &Arc<Pool>) {
    let claimed = {
        let tqueue = pool.tqueue.lock().unwrap();
        let mut claimed = None;
        for (idx, slot) in tqueue.slots.iter().enumerate() {
            let mut state = slot.state.lock().unwrap();
            if state.phase == SlotPhase::Free {
                state.phase = SlotPhase::Initial;
                claimed = Some((idx, slot.clone()));
                break;
            }
        }
        claimed
    };

    let Some((slot_idx, slot)) = claimed else {
        let mut threads = pool.threads.lock().unwrap();
        threads.current -= 1;
        threads.creating -= 1;
        log::debug!(
            "cannot create additional connection thread in pool '{}', all slots running",
            pool.name
        );
        return;
    };

    pool.stats.lock().unwrap().connthreads += 1;

    let server = server.clone();
    let pool_ref = pool.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("-conn:{}:{}:{slot_idx}-", server.name(), pool.name))
        .spawn(move || conn_thread(server, pool_ref, slot_idx));
    match spawned {
        Ok(handle) => {
            *slot.join.lock().unwrap() = Some(handle);
        }
        Err(e) => {
            log::error!("cannot spawn connection thread: {e}");
            let mut threads = pool.threads.lock().unwrap();
            threads.current -= 1;
            threads.creating -= 1;
            slot.state.lock().unwrap().phase = SlotPhase::Free;
        }
    }
}

/// Worker main loop.
fn conn_thread(server: Arc<Server>, pool: Arc<Pool>, slot_idx: usize) {
    let slot: Arc<WorkerSlot> = pool.tqueue.lock().unwrap().slots[slot_idx].clone();

    slot.state.lock().unwrap().phase = SlotPhase::Warmup;

    let thread_id = {
        let mut threads = pool.threads.lock().unwrap();
        let id = threads.nextid;
        threads.nextid += 1;
        if threads.creating > 0 {
            threads.creating -= 1;
        }
        id
    };

    // Initialize the interpreter once up front so the first request does
    // not pay the warmup latency.
    let warmup_start = Instant::now();
    drop(server.engine().allocate());
    log::info!(
        "[{}:{thread_id}] thread initialized ({:.6} secs)",
        pool.name,
        warmup_start.elapsed().as_secs_f64()
    );
    slot.state.lock().unwrap().phase = SlotPhase::Ready;

    let (cpt, idle_timeout) = {
        let threads = pool.threads.lock().unwrap();
        (threads.connsperthread, threads.timeout)
    };
    let mut ncons = cpt;
    let exit_msg;

    loop {
        let mut conn: Option<Box<Conn>> = pool.wqueue.lock().unwrap().wait.pop_front();

        if conn.is_none() {
            // Nothing urgent: advertise this slot on the worker queue and
            // wait for a direct handoff.
            pool.threads.lock().unwrap().idle += 1;
            slot.state.lock().unwrap().phase = SlotPhase::Idle;
            pool.tqueue.lock().unwrap().idle.push(slot_idx);

            let mut timed_out = false;
            let mut guard = slot.state.lock().unwrap();
            let mut deadline = Instant::now() + idle_timeout;
            while guard.conn.is_none() && !server.is_shutdown() {
                let wait = deadline.saturating_duration_since(Instant::now());
                if wait.is_zero() {
                    // Deadline reached without work: exit if the pool can
                    // shrink, otherwise stay idle with a fresh deadline.
                    drop(guard);
                    let can_exit = {
                        let threads = pool.threads.lock().unwrap();
                        threads.current > threads.min
                    };
                    guard = slot.state.lock().unwrap();
                    if guard.conn.is_some() {
                        break;
                    }
                    if can_exit {
                        timed_out = true;
                        break;
                    }
                    deadline = Instant::now() + idle_timeout;
                    continue;
                }
                let (g, _) = slot.cond.wait_timeout(guard, wait).unwrap();
                guard = g;
            }
            conn = guard.conn.take();
            guard.phase = SlotPhase::Busy;
            drop(guard);

            if conn.is_none() {
                // Not signalled on purpose: dequeue ourselves, then accept
                // a handoff that may have landed in the meantime.
                pool.tqueue.lock().unwrap().idle.retain(|idx| *idx != slot_idx);
                conn = slot.state.lock().unwrap().conn.take();
            }
            pool.threads.lock().unwrap().idle -= 1;

            if conn.is_none() {
                if server.is_shutdown() {
                    exit_msg = "shutdown pending";
                    break;
                }
                if timed_out {
                    exit_msg = "idle thread terminates";
                    break;
                }
                slot.state.lock().unwrap().phase = SlotPhase::Ready;
                continue;
            }
        } else {
            slot.state.lock().unwrap().phase = SlotPhase::Busy;
        }

        let mut conn = conn.expect("worker woke with a connection");
        conn.request_dequeue_time = Some(Instant::now());
        slot.state.lock().unwrap().running = Some(ConnInfo::from_conn(&conn));

        if conn.sock.is_some() {
            runner::conn_run(&server, &pool, &mut conn);
        } else {
            log::warn!("connection {} has no socket, closing", conn.id_string());
        }

        // Reset under the worker-queue lock: introspection reads headers
        // and flags of running conns through the same lock.
        {
            let _tqueue = pool.tqueue.lock().unwrap();
            conn.flags &= !flags::CONFIGURED;
            conn.headers.truncate();
            let mut state = slot.state.lock().unwrap();
            state.running = None;
            state.phase = SlotPhase::Ready;
        }

        conn.reset();
        pool.wqueue.lock().unwrap().freelist.push(conn);

        if cpt != 0 {
            ncons = ncons.saturating_sub(1);
            let (waiting, lowwater, current) = {
                let wq = pool.wqueue.lock().unwrap();
                let threads = pool.threads.lock().unwrap();
                (wq.wait.len(), wq.lowwatermark, threads.current)
            };
            if waiting > 0 && (ncons > 0 || waiting > lowwater || current <= 1) {
                // Keep draining the backlog.
                continue;
            }
            if ncons == 0 {
                exit_msg = "exceeded max connections per thread";
                break;
            }
        } else if ncons == 0 {
            // connsperthread 0: serve a single connection, then exit.
            exit_msg = "exceeded max connections per thread";
            break;
        }
    }

    slot.state.lock().unwrap().phase = SlotPhase::Dead;

    let during_shutdown = server.is_shutdown();
    let wakeup = {
        let mut threads = pool.threads.lock().unwrap();
        threads.current -= 1;
        threads.current < threads.min
    };
    if wakeup && !during_shutdown {
        super::ensure_running_threads(&server, &pool);
    }

    if during_shutdown {
        // The main thread waits on the pool condvar for the drain.
        let _wq = pool.wqueue.lock().unwrap();
        pool.wqueue_cond.notify_all();
    }

    // Join any previously exited worker; this drains zombie threads
    // without a dedicated reaper.
    let my_handle = slot.join.lock().unwrap().take();
    let previous = server.swap_join_thread(my_handle);
    if let Some(handle) = previous {
        let _ = handle.join();
    }

    log::info!("[{}:{thread_id}] exiting: {exit_msg}", pool.name);
    slot.state.lock().unwrap().phase = SlotPhase::Free;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::pool::{QueueResult, queue_conn};
    use crate::sock::Sock;
    use std::time::Duration;

    fn queue_scripted(server: &Arc<Server>, pool_hint: Option<&str>) -> QueueResult {
        let mut sock = Sock::scripted(vec![], false);
        sock.pool_hint = pool_hint.map(|s| s.to_string());
        queue_conn(server, sock)
    }

    #[test]
    fn test_enqueue_spawns_and_processes() {
        let server = Server::build_for_tests_with_pool(PoolSettings {
            minthreads: 1,
            maxthreads: 2,
            ..Default::default()
        });
        let pool = server.default_pool();

        match queue_scripted(&server, None) {
            QueueResult::Queued => {}
            other => panic!("expected queued, got {other:?}"),
        }

        // The worker picks the conn up and returns the slot to the
        // free list.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let free = pool.wqueue.lock().unwrap().freelist.len();
            let waiting = pool.waiting();
            if waiting == 0 && free == pool_capacity(&pool) {
                break;
            }
            assert!(Instant::now() < deadline, "worker did not process the conn");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(pool.threads.lock().unwrap().current >= 1);

        server.stop();
        assert_eq!(server.wait_server(Duration::from_secs(5)), crate::error::Status::Ok);
    }

    fn pool_capacity(pool: &Arc<Pool>) -> usize {
        // All test pools are built with the default maxconnections.
        let _ = pool;
        PoolSettings::default().maxconnections
    }

    #[test]
    fn test_overrun_rejects_or_retries() {
        let server = Server::build_for_tests_with_pool(PoolSettings {
            minthreads: 0,
            maxthreads: 1,
            maxconnections: 0,
            rejectoverrun: true,
            ..Default::default()
        });
        match queue_scripted(&server, None) {
            QueueResult::Rejected(sock) => {
                assert!(sock.flags & flags::SOCK_WAITING != 0);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(server.default_pool().stats.lock().unwrap().dropped, 1);

        let server = Server::build_for_tests_with_pool(PoolSettings {
            minthreads: 0,
            maxthreads: 1,
            maxconnections: 0,
            rejectoverrun: false,
            ..Default::default()
        });
        match queue_scripted(&server, None) {
            QueueResult::Timeout(sock) => {
                // Retry attempts keep the waiting flag and are not counted
                // again.
                match queue_conn(&server, sock) {
                    QueueResult::Timeout(sock) => {
                        assert!(sock.flags & flags::SOCK_WAITING != 0);
                    }
                    other => panic!("expected timeout again, got {other:?}"),
                }
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(server.default_pool().stats.lock().unwrap().dropped, 0);
    }

    #[test]
    fn test_shutdown_rejects_enqueue() {
        let server = Server::build_for_tests();
        server.stop();
        match queue_scripted(&server, None) {
            QueueResult::Rejected(_) => {}
            other => panic!("expected rejection during shutdown, got {other:?}"),
        }
    }
}
