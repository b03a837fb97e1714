//! Readiness loop for channel callbacks.
//!
//! One thread polls the sockets of channels with registered callbacks and
//! dispatches firings. Cancellation is two-phase: callers enqueue a cancel
//! (or a deferred free carrying the channel) and the loop processes it
//! between dispatches, so no in-flight callback can observe a freed
//! channel.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::chan::ConnChan;

// ============================================================================
// When-mask
// ============================================================================

/// Event mask over {r, w, e, x}: readable, writable, exception, exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WhenMask(u8);

impl WhenMask {
    pub const RECV: u8 = 0x01;
    pub const SEND: u8 = 0x02;
    pub const EXCEPTION: u8 = 0x04;
    pub const EXIT: u8 = 0x08;

    pub fn parse(spec: &str) -> Option<Self> {
        let mut mask = 0u8;
        for c in spec.chars() {
            match c {
                'r' => mask |= Self::RECV,
                'w' => mask |= Self::SEND,
                'e' => mask |= Self::EXCEPTION,
                'x' => mask |= Self::EXIT,
                _ => return None,
            }
        }
        Some(Self(mask))
    }

    pub fn wants_recv(&self) -> bool {
        self.0 & Self::RECV != 0
    }

    pub fn wants_send(&self) -> bool {
        self.0 & Self::SEND != 0
    }

    pub fn wants_exception(&self) -> bool {
        self.0 & Self::EXCEPTION != 0
    }
}

impl std::fmt::Display for WhenMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 & Self::RECV != 0 {
            f.write_str("r")?;
        }
        if self.0 & Self::SEND != 0 {
            f.write_str("w")?;
        }
        if self.0 & Self::EXCEPTION != 0 {
            f.write_str("e")?;
        }
        if self.0 & Self::EXIT != 0 {
            f.write_str("x")?;
        }
        Ok(())
    }
}

// ============================================================================
// Poller
// ============================================================================

/// What the dispatcher decided after a callback fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Keep the callback registered.
    Keep,
    /// Unregister from the readiness loop but keep the channel alive.
    Suspend,
    /// The channel was (or is being) closed; drop the registration.
    Close,
}

/// Evaluates the callback of the named channel for a condition letter
/// (r/w/e/x/t) and reports the resulting registration state.
pub type CallbackDispatch = Arc<dyn Fn(&str, char) -> CallbackOutcome + Send + Sync>;

enum PollerMsg {
    Register {
        name: String,
        fd: RawFd,
        when: WhenMask,
        timeout: Option<Duration>,
    },
    /// Unregister; the channel object stays alive (suspend).
    Cancel { name: String },
    /// Unregister and drop the final reference safely on the loop thread.
    Free {
        name: String,
        chan: Arc<Mutex<ConnChan>>,
    },
    Shutdown,
}

struct Registration {
    fd: RawFd,
    when: WhenMask,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

pub struct Poller {
    tx: mpsc::Sender<PollerMsg>,
    wake_fd: RawFd,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Poller")
    }
}

impl Poller {
    pub fn start(dispatch: CallbackDispatch) -> std::io::Result<Self> {
        let mut pipe_fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let (read_fd, write_fd) = (pipe_fds[0], pipe_fds[1]);
        set_nonblocking(read_fd);

        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("-socks-".to_string())
            .spawn(move || poller_loop(rx, read_fd, dispatch))?;

        Ok(Self {
            tx,
            wake_fd: write_fd,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn send(&self, msg: PollerMsg) {
        if self.tx.send(msg).is_ok() {
            let byte = [1u8];
            unsafe {
                libc::write(self.wake_fd, byte.as_ptr().cast(), 1);
            }
        }
    }

    /// Register (or replace) the callback registration for a channel.
    pub fn register(&self, name: &str, fd: RawFd, when: WhenMask, timeout: Option<Duration>) {
        self.send(PollerMsg::Register {
            name: name.to_string(),
            fd,
            when,
            timeout,
        });
    }

    /// Stop watching without freeing (callback suspend).
    pub fn cancel(&self, name: &str) {
        self.send(PollerMsg::Cancel { name: name.to_string() });
    }

    /// Stop watching and drop the channel once no dispatch is in flight.
    pub fn cancel_and_free(&self, name: &str, chan: Arc<Mutex<ConnChan>>) {
        self.send(PollerMsg::Free { name: name.to_string(), chan });
    }

    /// Fire exit conditions and stop the loop thread.
    pub fn stop(&self) {
        self.send(PollerMsg::Shutdown);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // Idempotent: stop() may have run already.
        let _ = self.tx.send(PollerMsg::Shutdown);
        let byte = [1u8];
        unsafe {
            libc::write(self.wake_fd, byte.as_ptr().cast(), 1);
            libc::close(self.wake_fd);
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn poller_loop(rx: mpsc::Receiver<PollerMsg>, wake_fd: RawFd, dispatch: CallbackDispatch) {
    let mut registrations: HashMap<String, Registration> = HashMap::new();
    // Deferred frees processed after the current dispatch round.
    let mut graveyard: Vec<Arc<Mutex<ConnChan>>> = Vec::new();

    'outer: loop {
        // Drain control messages first.
        loop {
            match rx.try_recv() {
                Ok(PollerMsg::Register { name, fd, when, timeout }) => {
                    let deadline = timeout.map(|t| Instant::now() + t);
                    registrations.insert(name, Registration { fd, when, timeout, deadline });
                }
                Ok(PollerMsg::Cancel { name }) => {
                    registrations.remove(&name);
                }
                Ok(PollerMsg::Free { name, chan }) => {
                    registrations.remove(&name);
                    graveyard.push(chan);
                }
                Ok(PollerMsg::Shutdown) => break 'outer,
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => break 'outer,
            }
        }

        // No dispatch in flight here: safe point to release freed channels.
        graveyard.clear();

        let mut fds = Vec::with_capacity(registrations.len() + 1);
        fds.push(libc::pollfd { fd: wake_fd, events: libc::POLLIN, revents: 0 });
        let mut names: Vec<&String> = Vec::with_capacity(registrations.len());
        let now = Instant::now();
        let mut poll_ms: i64 = -1;
        for (name, reg) in &registrations {
            let mut events = 0i16;
            if reg.when.wants_recv() {
                events |= libc::POLLIN;
            }
            if reg.when.wants_send() {
                events |= libc::POLLOUT;
            }
            if reg.when.wants_exception() {
                events |= libc::POLLPRI;
            }
            fds.push(libc::pollfd { fd: reg.fd, events, revents: 0 });
            names.push(name);
            if let Some(deadline) = reg.deadline {
                let remaining = deadline.saturating_duration_since(now).as_millis() as i64;
                poll_ms = if poll_ms < 0 { remaining } else { poll_ms.min(remaining) };
            }
        }

        let rc = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                poll_ms.clamp(-1, i32::MAX as i64) as i32,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("sock callback poll failed: {err}");
            break;
        }

        if fds[0].revents != 0 {
            let mut sink = [0u8; 64];
            unsafe {
                while libc::read(wake_fd, sink.as_mut_ptr().cast(), sink.len()) > 0 {}
            }
        }

        // Collect firings first; dispatch mutates the registration table.
        let mut firings: Vec<(String, char)> = Vec::new();
        let now = Instant::now();
        for (i, name) in names.iter().enumerate() {
            let revents = fds[i + 1].revents;
            let reg = &registrations[*name];
            if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                firings.push(((*name).clone(), 'e'));
            } else if revents & libc::POLLIN != 0 {
                firings.push(((*name).clone(), 'r'));
            } else if revents & libc::POLLOUT != 0 {
                firings.push(((*name).clone(), 'w'));
            } else if revents & libc::POLLPRI != 0 {
                firings.push(((*name).clone(), 'e'));
            } else if reg.deadline.is_some_and(|d| d <= now) {
                firings.push(((*name).clone(), 't'));
            }
        }

        for (name, reason) in firings {
            if !registrations.contains_key(&name) {
                // Cancelled since the poll round; skip.
                continue;
            }
            match dispatch(&name, reason) {
                CallbackOutcome::Keep => {
                    if let Some(reg) = registrations.get_mut(&name) {
                        reg.deadline = reg.timeout.map(|t| Instant::now() + t);
                    }
                }
                CallbackOutcome::Suspend | CallbackOutcome::Close => {
                    registrations.remove(&name);
                }
            }
        }
    }

    // Exit: surviving registrations get their exit condition, then
    // everything is released.
    let names: Vec<String> = registrations.keys().cloned().collect();
    for name in names {
        dispatch(&name, 'x');
    }
    registrations.clear();
    graveyard.clear();
    unsafe {
        libc::close(wake_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_when_mask_parse_and_format() {
        let mask = WhenMask::parse("rwe").unwrap();
        assert!(mask.wants_recv());
        assert!(mask.wants_send());
        assert!(mask.wants_exception());
        assert_eq!(mask.to_string(), "rwe");

        assert_eq!(WhenMask::parse("rx").unwrap().to_string(), "rx");
        assert!(WhenMask::parse("rz").is_none());
        assert_eq!(WhenMask::parse("").unwrap().to_string(), "");
    }
}
