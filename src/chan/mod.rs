//! Connection channels: long-lived, scriptable handles to TLS or plaintext
//! sockets that survive the request that created them.
//!
//! The send path maintains two buffers. `send_buffer` is the stable buffer:
//! while a TLS send is rejected (`sock.send_rejected > 0`) its front holds
//! exactly the pinned bytes and is neither appended to nor compacted, so the
//! retry presents the identical region. New writes arriving meanwhile land
//! in `secondary_send_buffer`, preserving FIFO order.

pub mod poller;
pub mod ws;

use std::collections::HashMap;
use std::io::IoSlice;
use std::net::{IpAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::dispatch::ScriptEngine;
use crate::error::{Error, Result};
use crate::sock::{Sock, SockState, Waitable};
use crate::tls::verify::ExceptionStore;
use crate::tls::{ClientTlsOptions, create_client_config};

use self::poller::{CallbackOutcome, Poller, WhenMask};
use self::ws::{Frame, WsAssembler};

const READ_BUFFER_SIZE: usize = 16_384;

// ============================================================================
// Callback record
// ============================================================================

/// Script callback attached to a channel. The command-name prefix length is
/// kept for introspection, which must not log binary payload arguments.
#[derive(Debug, Clone)]
pub struct Callback {
    pub script: String,
    pub script_cmd_len: usize,
    pub when: WhenMask,
    pub thread_name: String,
}

impl Callback {
    fn new(script: String, when: WhenMask) -> Self {
        let script_cmd_len = script.find(' ').unwrap_or(0);
        Self {
            script,
            script_cmd_len,
            when,
            thread_name: "-socks-".to_string(),
        }
    }

    pub fn cmd_name(&self) -> &str {
        &self.script[..self.script_cmd_len]
    }
}

// ============================================================================
// ConnChan
// ============================================================================

/// One connection channel: an owned socket plus buffers and statistics.
#[derive(Debug)]
pub struct ConnChan {
    pub channel_name: String,
    pub sock: Sock,
    pub peer: String,
    pub binary: bool,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub w_bytes: u64,
    pub r_bytes: u64,
    /// Zero means "use the driver's receive wait".
    pub recv_timeout: Duration,
    pub send_timeout: Duration,
    pub callback: Option<Callback>,
    pub client_data: Option<String>,
    send_buffer: Vec<u8>,
    secondary_send_buffer: Vec<u8>,
    ws: WsAssembler,
}

impl ConnChan {
    fn new(channel_name: String, sock: Sock, peer: Option<String>, binary: bool) -> Self {
        sock.set_keepalive(true);
        let peer = peer.unwrap_or_else(|| sock.peer_addr().ip().to_string());
        Self {
            channel_name,
            sock,
            peer,
            binary,
            start_time: chrono::Utc::now(),
            w_bytes: 0,
            r_bytes: 0,
            recv_timeout: Duration::ZERO,
            send_timeout: Duration::ZERO,
            callback: None,
            client_data: None,
            send_buffer: Vec::new(),
            secondary_send_buffer: Vec::new(),
            ws: WsAssembler::new(),
        }
    }

    pub fn requires_stable_send_buffer(&self) -> bool {
        self.sock.requires_stable_send_buffer()
    }

    // ------------------------------------------------------------------------
    // send path
    // ------------------------------------------------------------------------

    /// Write bytes to the channel. Returns the number of bytes transmitted
    /// by this call; any unsent remainder is buffered in order.
    pub fn write(&mut self, msg: &[u8]) -> Result<usize> {
        let deadline = (self.send_timeout > Duration::ZERO)
            .then(|| Instant::now() + self.send_timeout);
        let require_stable = self.requires_stable_send_buffer();

        // Rejected retry: re-present the pinned region untouched; new data
        // goes to the secondary buffer for a later call.
        if self.sock.send_rejected > 0 {
            debug_assert!(require_stable);
            if !msg.is_empty() {
                self.secondary_send_buffer.extend_from_slice(msg);
            }
            let pinned = self.sock.send_rejected.min(self.send_buffer.len());
            let sent = drive_send(
                &mut self.sock,
                &self.send_buffer[..pinned],
                &[],
                deadline,
                require_stable,
            )
            .map_err(|e| self.map_send_err(e))?;
            self.send_buffer.drain(..sent);
            self.w_bytes += sent as u64;
            return Ok(sent);
        }

        // Absorb the secondary buffer: its contents plus the fresh bytes
        // become the message.
        let absorbed;
        let msg: &[u8] = if self.secondary_send_buffer.is_empty() {
            msg
        } else {
            self.secondary_send_buffer.extend_from_slice(msg);
            absorbed = std::mem::take(&mut self.secondary_send_buffer);
            &absorbed
        };

        let sent = if require_stable {
            // Stable transport: everything goes through the send buffer,
            // submitted as one region.
            self.send_buffer.extend_from_slice(msg);
            if self.send_buffer.is_empty() {
                return Ok(0);
            }
            let sent = drive_send(&mut self.sock, &self.send_buffer, &[], deadline, true)
                .map_err(|e| self.map_send_err(e))?;
            self.send_buffer.drain(..sent);
            sent
        } else {
            // Plaintext: gather previously buffered bytes and the new
            // message, then compact.
            if self.send_buffer.is_empty() && msg.is_empty() {
                return Ok(0);
            }
            let sent = drive_send(&mut self.sock, &self.send_buffer, msg, deadline, false)
                .map_err(|e| self.map_send_err(e))?;
            let old_len = self.send_buffer.len();
            if sent >= old_len {
                let consumed_new = sent - old_len;
                self.send_buffer.clear();
                if consumed_new < msg.len() {
                    self.send_buffer.extend_from_slice(&msg[consumed_new..]);
                }
            } else {
                self.send_buffer.drain(..sent);
                self.send_buffer.extend_from_slice(msg);
            }
            sent
        };
        self.w_bytes += sent as u64;
        Ok(sent)
    }

    fn map_send_err(&self, err: Error) -> Error {
        match err {
            Error::Timeout => Error::ChannelTimeout {
                channel: self.channel_name.clone(),
                op: "send",
            },
            other => other,
        }
    }

    // ------------------------------------------------------------------------
    // receive path
    // ------------------------------------------------------------------------

    fn effective_recv_timeout(&self) -> Duration {
        if self.recv_timeout > Duration::ZERO {
            self.recv_timeout
        } else {
            self.sock.recv_wait
        }
    }

    /// Read up to one buffer of bytes. Transient states are retried until
    /// the receive deadline; deadline expiry yields an empty read.
    fn read_buffer(&mut self, buf: &mut [u8]) -> Result<isize> {
        let deadline = Instant::now() + self.effective_recv_timeout();
        loop {
            let (n, state) = self.sock.recv(buf);
            match state {
                SockState::Read => return Ok(n),
                SockState::Done => return Ok(0),
                SockState::Again => match self.sock.wait_until(Waitable::Readable, deadline) {
                    Ok(()) => continue,
                    Err(Error::Timeout) => return Ok(0),
                    Err(e) => return Err(e),
                },
                SockState::Exception => {
                    return Err(Error::from_sock_errno(&self.sock.recv_errno));
                }
            }
        }
    }

    /// Plain read for the `read` command.
    pub fn read(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let n = self.read_buffer(&mut buf)?;
        buf.truncate(n.max(0) as usize);
        self.r_bytes += buf.len() as u64;
        Ok(buf)
    }

    /// WebSocket read: consult the frame buffer first, reading the socket
    /// only when more data is needed.
    pub fn read_websocket_frame(&mut self) -> Result<Frame> {
        if !self.ws.needs_data() {
            return Ok(self.ws.next_frame(&[], 0));
        }
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let n = self.read_buffer(&mut buf)?;
        self.r_bytes += n.max(0) as u64;
        Ok(self.ws.next_frame(&buf[..n.max(0) as usize], n))
    }

    // ------------------------------------------------------------------------
    // introspection
    // ------------------------------------------------------------------------

    pub fn list_entry(&self) -> Value {
        let (cb_cmd, cb_when) = match &self.callback {
            Some(cb) => (cb.cmd_name().to_string(), cb.when.to_string()),
            None => (String::new(), String::new()),
        };
        json!([
            self.channel_name,
            self.callback.as_ref().map(|cb| cb.thread_name.clone()).unwrap_or_default(),
            self.start_time.to_rfc3339(),
            self.sock.driver_name,
            self.peer,
            self.w_bytes,
            self.r_bytes,
            self.client_data.clone().unwrap_or_default(),
            cb_cmd,
            cb_when,
        ])
    }

    pub fn status_value(&self) -> Value {
        let mut status = json!({
            "start": self.start_time.to_rfc3339(),
            "driver": self.sock.driver_name,
            "peer": self.peer,
            "sent": self.w_bytes,
            "received": self.r_bytes,
            "framebuffer": self.ws.buffered(),
            "fragments": self.ws.fragments_len(),
            "sendbuffer": self.send_buffer.len(),
            "secondarysendbuffer": self.secondary_send_buffer.len(),
        });
        if let Some(cb) = &self.callback {
            status["callback"] = Value::String(cb.cmd_name().to_string());
            status["condition"] = Value::String(cb.when.to_string());
        }
        status
    }

    #[cfg(test)]
    pub fn send_buffer_len(&self) -> usize {
        self.send_buffer.len()
    }

    #[cfg(test)]
    pub fn secondary_len(&self) -> usize {
        self.secondary_send_buffer.len()
    }
}

/// Submit buffers to the transport, handling partial writes and the send
/// timeout. On a stable transport, a would-block records the remaining
/// pinned length on the socket before returning.
fn drive_send(
    sock: &mut Sock,
    first: &[u8],
    second: &[u8],
    deadline: Option<Instant>,
    require_stable: bool,
) -> Result<usize> {
    let total = first.len() + second.len();
    let mut sent_total = 0usize;

    while sent_total < total {
        let (a, b) = remaining(first, second, sent_total);
        let bufs: [IoSlice<'_>; 2] = [IoSlice::new(a), IoSlice::new(b)];
        let n_bufs = if b.is_empty() { 1 } else { 2 };
        let n = sock.send_bufs(&bufs[..n_bufs]);

        if n < 0 {
            return Err(Error::from_sock_errno(&sock.send_errno));
        }
        if n == 0 {
            if require_stable && sock.want_write {
                sock.send_rejected = total - sent_total;
            }
            match deadline {
                None => return Ok(sent_total),
                Some(d) => {
                    sock.wait_until(Waitable::Writable, d)?;
                    continue;
                }
            }
        }
        sent_total += n as usize;
    }
    Ok(sent_total)
}

fn remaining<'a>(first: &'a [u8], second: &'a [u8], sent: usize) -> (&'a [u8], &'a [u8]) {
    if sent < first.len() {
        (&first[sent..], second)
    } else {
        (&second[sent - first.len()..], &[])
    }
}

// ============================================================================
// Channel table and engine
// ============================================================================

struct TableInner {
    map: HashMap<String, Arc<Mutex<ConnChan>>>,
    counter: u64,
}

struct ListenerHandle {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// The server-wide channel registry plus the callback machinery.
///
/// The table lock is reader-writer: insert/delete write, list/status/get
/// read. It is never held across a script evaluation.
pub struct Channels {
    inner: RwLock<TableInner>,
    poller: OnceLock<Poller>,
    listeners: Mutex<HashMap<String, ListenerHandle>>,
    exceptions: Mutex<Option<Arc<ExceptionStore>>>,
    shutdown: AtomicBool,
}

impl std::fmt::Debug for Channels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channels({} open)", self.inner.read().unwrap().map.len())
    }
}

impl Default for Channels {
    fn default() -> Self {
        Self {
            inner: RwLock::new(TableInner { map: HashMap::new(), counter: 0 }),
            poller: OnceLock::new(),
            listeners: Mutex::new(HashMap::new()),
            exceptions: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        }
    }
}

impl Channels {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Configure the validation-exception store used for outbound TLS.
    pub fn set_validation_exceptions(&self, store: Arc<ExceptionStore>) {
        *self.exceptions.lock().unwrap() = Some(store);
    }

    fn client_exceptions(&self) -> Option<Arc<ExceptionStore>> {
        self.exceptions.lock().unwrap().clone()
    }

    /// Start the callback readiness loop. Callback scripts are evaluated
    /// through `engine` in a fresh context per firing.
    pub fn start_poller(self: &Arc<Self>, engine: Arc<dyn ScriptEngine>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let dispatch: poller::CallbackDispatch = Arc::new(move |name, reason| {
            match weak.upgrade() {
                Some(channels) => channels.fire_callback(&engine, name, reason),
                None => CallbackOutcome::Close,
            }
        });
        let poller = Poller::start(dispatch)?;
        self.poller
            .set(poller)
            .map_err(|_| Error::Command("callback loop already started".to_string()))?;
        Ok(())
    }

    fn poller(&self) -> Result<&Poller> {
        self.poller
            .get()
            .ok_or_else(|| Error::Command("callback loop not running".to_string()))
    }

    // ------------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------------

    /// Wrap a socket in a new channel. The counter-based name allocation
    /// runs under the table write lock to guarantee unique names.
    pub fn adopt(
        &self,
        sock: Sock,
        peer: Option<String>,
        binary: bool,
        client_data: Option<String>,
    ) -> String {
        let mut inner = self.inner.write().unwrap();
        let name = format!("conn{}", inner.counter);
        inner.counter += 1;
        let mut chan = ConnChan::new(name.clone(), sock, peer, binary);
        chan.client_data = client_data;
        inner.map.insert(name.clone(), Arc::new(Mutex::new(chan)));
        name
    }

    pub fn get(&self, name: &str) -> Result<Arc<Mutex<ConnChan>>> {
        self.inner
            .read()
            .unwrap()
            .map
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownChannel(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.read().unwrap().map.contains_key(name)
    }

    /// Close a channel: cancel any callback, release buffers, close the
    /// socket and remove the table entry. When a callback exists the final
    /// drop is deferred to the readiness loop so no in-flight dispatch can
    /// observe a freed channel.
    pub fn close(&self, name: &str) -> Result<()> {
        if self.stop_listener(name) {
            return Ok(());
        }
        let chan = {
            let mut inner = self.inner.write().unwrap();
            inner
                .map
                .remove(name)
                .ok_or_else(|| Error::UnknownChannel(name.to_string()))?
        };
        let had_callback = {
            let mut guard = chan.lock().unwrap();
            let had = guard.callback.take().is_some();
            guard.sock.close();
            had
        };
        if had_callback {
            if let Ok(poller) = self.poller() {
                poller.cancel_and_free(name, chan);
            }
        }
        Ok(())
    }

    fn channel_names(&self) -> Vec<String> {
        self.inner.read().unwrap().map.keys().cloned().collect()
    }

    /// Drain listeners, the callback loop and all channels.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let listeners: Vec<ListenerHandle> = {
            let mut map = self.listeners.lock().unwrap();
            map.drain().map(|(_, h)| h).collect()
        };
        for listener in listeners {
            listener.stop.store(true, Ordering::SeqCst);
            let _ = listener.handle.join();
        }
        if let Some(poller) = self.poller.get() {
            poller.stop();
        }
        for name in self.channel_names() {
            let _ = self.close(&name);
        }
    }

    // ------------------------------------------------------------------------
    // callbacks
    // ------------------------------------------------------------------------

    /// Register (replacing any previous) a callback for the channel.
    pub fn register_callback(
        &self,
        name: &str,
        script: &str,
        when: WhenMask,
        poll_timeout: Option<Duration>,
        recv_timeout: Option<Duration>,
        send_timeout: Option<Duration>,
    ) -> Result<()> {
        let chan = self.get(name)?;
        let fd = {
            let mut guard = chan.lock().unwrap();
            guard.callback = Some(Callback::new(script.to_string(), when));
            if let Some(t) = recv_timeout {
                guard.recv_timeout = t;
            }
            if let Some(t) = send_timeout {
                guard.send_timeout = t;
            }
            guard.sock.fd()
        };
        self.poller()?.register(name, fd, when, poll_timeout);
        Ok(())
    }

    /// Evaluate the callback of a channel for a fired condition. The table
    /// lock and the channel lock are both released during evaluation.
    fn fire_callback(
        &self,
        engine: &Arc<dyn ScriptEngine>,
        name: &str,
        reason: char,
    ) -> CallbackOutcome {
        if reason == 'x' {
            // Exit is treated like the error cases: free the channel
            // without evaluating the script.
            let _ = self.close(name);
            return CallbackOutcome::Close;
        }

        let Ok(chan) = self.get(name) else {
            // Deleted since the event was collected.
            log::debug!("callback fired on a probably deleted channel {name}");
            return CallbackOutcome::Close;
        };
        let script = {
            let guard = chan.lock().unwrap();
            match &guard.callback {
                Some(cb) => cb.script.clone(),
                None => return CallbackOutcome::Close,
            }
        };

        let mut ctx = engine.allocate();
        let reason_arg = reason.to_string();
        match ctx.eval(&script, &[&reason_arg]) {
            Err(err) => {
                log::error!("channel {name} callback error: {err}");
                let _ = self.close(name);
                CallbackOutcome::Close
            }
            Ok(result) => match result.trim().parse::<i64>() {
                Ok(0) => {
                    let _ = self.close(name);
                    CallbackOutcome::Close
                }
                Ok(1) => CallbackOutcome::Keep,
                Ok(2) => {
                    // Suspend: unregister from the readiness loop but keep
                    // the channel (and its callback record) alive.
                    CallbackOutcome::Suspend
                }
                _ => {
                    let cmd: String = script.chars().take_while(|c| *c != ' ').collect();
                    log::warn!(
                        "{name} callback <{cmd}> returned unhandled result '{result}' \
                         (must be 0, 1, or 2)"
                    );
                    let _ = self.close(name);
                    CallbackOutcome::Close
                }
            },
        }
    }

    // ------------------------------------------------------------------------
    // open / connect / listen
    // ------------------------------------------------------------------------

    /// Dial a raw transport, optionally TLS.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        use_tls: bool,
        tls_opts: &ClientTlsOptions,
        timeout: Duration,
    ) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let sock = self.dial(host, port, use_tls, tls_opts, None, deadline)?;
        Ok(self.adopt(sock, None, true, None))
    }

    /// Dial out per URL, optionally upgrading to TLS, and write the initial
    /// HTTP request line and headers.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &self,
        url_text: &str,
        method: &str,
        version: &str,
        headers: &[(String, String)],
        tls_opts: &ClientTlsOptions,
        sni_hostname: Option<&str>,
        timeout: Duration,
    ) -> Result<String> {
        let url = url::Url::parse(url_text)
            .map_err(|e| Error::Command(format!("invalid URL '{url_text}': {e}")))?;
        let use_tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(Error::Command(format!("unsupported scheme '{other}'"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::Command(format!("URL '{url_text}' has no host")))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        let deadline = Instant::now() + timeout;
        let sock = self.dial(&host, port, use_tls, tls_opts, sni_hostname, deadline)?;
        let name = self.adopt(sock, None, true, None);

        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        let mut head = format!("{method} {target} HTTP/{version}\r\n");
        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host")) {
            head.push_str(&format!("Host: {host}\r\n"));
        }
        for (key, value) in headers {
            head.push_str(&format!("{key}: {value}\r\n"));
        }
        head.push_str("\r\n");

        let chan = self.get(&name)?;
        let result = chan.lock().unwrap().write(head.as_bytes());
        if let Err(e) = result {
            let _ = self.close(&name);
            return Err(e);
        }
        log::debug!("connchan open {url_text} => {name}");
        Ok(name)
    }

    fn dial(
        &self,
        host: &str,
        port: u16,
        use_tls: bool,
        tls_opts: &ClientTlsOptions,
        sni_hostname: Option<&str>,
        deadline: Instant,
    ) -> Result<Sock> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Command(format!("cannot resolve {host}:{port}")))?;
        let timeout = deadline.saturating_duration_since(Instant::now());
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                Error::Timeout
            } else {
                Error::Io(e)
            }
        })?;

        if use_tls {
            // SNI: explicit hostname wins; otherwise derive from the URL
            // host (numeric addresses become IP-form server names).
            let sni = sni_hostname.unwrap_or(host).to_string();
            if sni_hostname.is_none() && host.parse::<IpAddr>().is_err() {
                log::debug!("automatically use SNI <{host}>");
            }
            let mut opts = tls_opts.clone();
            opts.peer = Some(addr.ip());
            let config = create_client_config(&opts, self.client_exceptions())?;
            let mut sock = Sock::tls_client(stream, addr, config, &sni)?;
            sock.driver_name = "nsssl".to_string();
            sock.complete_tls_handshake(deadline)?;
            Ok(sock)
        } else {
            let mut sock = Sock::plain(stream, addr)?;
            sock.driver_name = "nssock".to_string();
            Ok(sock)
        }
    }

    /// Install a listen callback: every accepted connection becomes a fresh
    /// channel and the script runs with the channel name appended. A false
    /// result closes the new channel.
    pub fn listen(
        self: &Arc<Self>,
        engine: Arc<dyn ScriptEngine>,
        addr: &str,
        port: u16,
        script: &str,
    ) -> Result<Value> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Command("server is shutting down".to_string()));
        }
        let listener = TcpListener::bind((addr, port))?;
        let local = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let fd = {
            use std::os::unix::io::AsRawFd;
            listener.as_raw_fd()
        };

        let name = {
            let mut inner = self.inner.write().unwrap();
            let name = format!("conn{}", inner.counter);
            inner.counter += 1;
            name
        };

        let stop = Arc::new(AtomicBool::new(false));
        let channels = self.clone();
        let script = script.to_string();
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("-listen:{port}-"))
            .spawn(move || listen_loop(channels, engine, listener, script, thread_stop))?;

        self.listeners
            .lock()
            .unwrap()
            .insert(name.clone(), ListenerHandle { stop, handle });

        Ok(json!({
            "channel": name,
            "port": local.port(),
            "sock": fd,
            "address": local.ip().to_string(),
        }))
    }

    fn stop_listener(&self, name: &str) -> bool {
        let handle = self.listeners.lock().unwrap().remove(name);
        match handle {
            Some(listener) => {
                listener.stop.store(true, Ordering::SeqCst);
                let _ = listener.handle.join();
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // data plane entry points
    // ------------------------------------------------------------------------

    pub fn write(&self, name: &str, msg: &[u8]) -> Result<usize> {
        let chan = self.get(name)?;
        let mut guard = chan.lock().unwrap();
        guard.write(msg)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let chan = self.get(name)?;
        let mut guard = chan.lock().unwrap();
        if !guard.binary {
            log::warn!("connchan: only binary channels are currently supported; {name} is not binary");
        }
        guard.read()
    }

    pub fn read_websocket(&self, name: &str) -> Result<Frame> {
        let chan = self.get(name)?;
        let mut guard = chan.lock().unwrap();
        guard.read_websocket_frame()
    }

    pub fn list(&self) -> Vec<Value> {
        let inner = self.inner.read().unwrap();
        let mut entries: Vec<(String, Value)> = inner
            .map
            .iter()
            .map(|(name, chan)| (name.clone(), chan.lock().unwrap().list_entry()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, v)| v).collect()
    }

    pub fn status(&self, name: &str) -> Result<Value> {
        let chan = self.get(name)?;
        let guard = chan.lock().unwrap();
        Ok(guard.status_value())
    }
}

/// Script-level boolean vocabulary, matched case-insensitively. Returns
/// None for anything outside it.
fn parse_script_boolean(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn listen_loop(
    channels: Arc<Channels>,
    engine: Arc<dyn ScriptEngine>,
    listener: TcpListener,
    script: String,
    stop: Arc<AtomicBool>,
) {
    use std::os::unix::io::AsRawFd;
    let fd = listener.as_raw_fd();
    while !stop.load(Ordering::SeqCst) {
        let mut fds = [libc::pollfd { fd, events: libc::POLLIN, revents: 0 }];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, 500) };
        if rc <= 0 {
            continue;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let sock = match Sock::plain(stream, peer) {
                    Ok(sock) => sock,
                    Err(e) => {
                        log::warn!("listen: cannot wrap accepted socket: {e}");
                        continue;
                    }
                };
                let name = channels.adopt(sock, None, true, None);
                log::info!("listen callback: new channel {name} from {peer}");

                let mut ctx = engine.allocate();
                let close = match ctx.eval(&script, &[&name]) {
                    // The result is interpreted as a boolean; explicit
                    // false and unparseable results both close.
                    Ok(result) => !parse_script_boolean(&result).unwrap_or(false),
                    Err(err) => {
                        log::error!("listen callback error for {name}: {err}");
                        true
                    }
                };
                if close {
                    let _ = channels.close(&name);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::warn!("listen accept error: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock::scripted::SendStep;

    fn scripted_chan(steps: Vec<SendStep>, stable: bool) -> ConnChan {
        ConnChan::new(
            "conn0".to_string(),
            Sock::scripted(steps, stable),
            Some("test-peer".to_string()),
            true,
        )
    }

    #[test]
    fn test_plain_write_all_sent() {
        let mut chan = scripted_chan(vec![SendStep::Accept(usize::MAX)], false);
        assert_eq!(chan.write(b"hello").unwrap(), 5);
        assert_eq!(chan.send_buffer_len(), 0);
        assert_eq!(chan.w_bytes, 5);
        assert_eq!(chan.sock.scripted_sent(), b"hello");
    }

    #[test]
    fn test_plain_partial_buffers_remainder() {
        // Transport takes 3 bytes then blocks: remainder is buffered, the
        // next write gathers buffered + fresh bytes in order.
        let mut chan = scripted_chan(vec![SendStep::Accept(3), SendStep::Block], false);
        assert_eq!(chan.write(b"abcdef").unwrap(), 3);
        assert_eq!(chan.send_buffer_len(), 3);

        chan.sock.scripted_push(&[SendStep::Accept(usize::MAX)]);
        assert_eq!(chan.write(b"ghi").unwrap(), 6);
        assert_eq!(chan.send_buffer_len(), 0);
        assert_eq!(chan.sock.scripted_sent(), b"abcdefghi");
    }

    #[test]
    fn test_stable_reject_pins_buffer_and_routes_new_bytes_secondary() {
        // TLS-like transport blocks immediately: the whole message is
        // pinned in the send buffer.
        let mut chan = scripted_chan(vec![SendStep::Block], true);
        assert_eq!(chan.write(b"ABCDEF").unwrap(), 0);
        assert_eq!(chan.sock.send_rejected, 6);
        assert_eq!(chan.send_buffer_len(), 6);

        // While rejected, new writes must not touch the pinned buffer.
        chan.sock.scripted_push(&[SendStep::Block]);
        assert_eq!(chan.write(b"xyz").unwrap(), 0);
        assert_eq!(chan.send_buffer_len(), 6);
        assert_eq!(chan.secondary_len(), 3);
        assert_eq!(chan.sock.send_rejected, 6);

        // Retry drains the pinned region: the exact rejected byte sequence
        // is what the transport observes.
        chan.sock.scripted_push(&[SendStep::Accept(usize::MAX)]);
        assert_eq!(chan.write(&[]).unwrap(), 6);
        assert_eq!(chan.sock.send_rejected, 0);
        assert_eq!(chan.send_buffer_len(), 0);
        assert_eq!(chan.sock.scripted_sent(), b"ABCDEF");

        // The secondary buffer goes out with the next write, in order.
        chan.sock.scripted_push(&[SendStep::Accept(usize::MAX)]);
        assert_eq!(chan.write(b"123").unwrap(), 6);
        assert_eq!(chan.sock.scripted_sent(), b"ABCDEFxyz123");
        assert_eq!(chan.secondary_len(), 0);
    }

    #[test]
    fn test_stable_partial_pins_remainder() {
        // Stable transport with partial progress before the block: the
        // unsent tail stays pinned at the buffer front and drains first.
        let mut chan = scripted_chan(vec![SendStep::Accept(4), SendStep::Block], true);
        assert_eq!(chan.write(b"ABCDEF").unwrap(), 4);
        assert_eq!(chan.send_buffer_len(), 2);
        assert_eq!(chan.sock.send_rejected, 2);

        // Pinned region drains; fresh bytes wait in the secondary buffer.
        chan.sock.scripted_push(&[SendStep::Accept(usize::MAX)]);
        assert_eq!(chan.write(b"GH").unwrap(), 2);
        assert_eq!(chan.secondary_len(), 2);

        chan.sock.scripted_push(&[SendStep::Accept(usize::MAX)]);
        assert_eq!(chan.write(&[]).unwrap(), 2);
        assert_eq!(chan.sock.scripted_sent(), b"ABCDEFGH");
    }

    #[test]
    fn test_write_ordering_invariant() {
        // Across blocks, partials and retries, the peer sees the bytes in
        // write order with no gaps or duplicates.
        let mut chan = scripted_chan(
            vec![
                SendStep::Block,
                SendStep::Accept(2),
                SendStep::Block,
                SendStep::Accept(usize::MAX),
                SendStep::Accept(usize::MAX),
            ],
            true,
        );
        let mut returned = 0usize;
        returned += chan.write(b"11").unwrap();
        returned += chan.write(b"22").unwrap();
        returned += chan.write(b"33").unwrap();
        returned += chan.write(&[]).unwrap();
        returned += chan.write(&[]).unwrap();
        assert_eq!(returned, 6);
        assert_eq!(chan.sock.scripted_sent(), b"112233");
    }

    #[test]
    fn test_send_error_propagates_and_keeps_buffers() {
        let mut chan = scripted_chan(vec![SendStep::Fail(libc::EPIPE)], false);
        let err = chan.write(b"doomed");
        assert!(err.is_err());
        assert_eq!(chan.w_bytes, 0);
    }

    #[test]
    fn test_script_boolean_vocabulary() {
        // Tcl-style booleans, any case; everything else is unparseable.
        for text in ["1", "true", "YES", "On", " true "] {
            assert_eq!(parse_script_boolean(text), Some(true), "{text}");
        }
        for text in ["0", "False", "NO", "OFF"] {
            assert_eq!(parse_script_boolean(text), Some(false), "{text}");
        }
        for text in ["banana", "2", "", "truthy"] {
            assert_eq!(parse_script_boolean(text), None, "{text}");
        }
    }

    #[test]
    fn test_adopt_and_close_lifecycle() {
        let channels = Channels::new();
        let sock = Sock::scripted(vec![], false);
        let name = channels.adopt(sock, None, true, None);
        assert_eq!(name, "conn0");
        assert!(channels.exists(&name));

        let second = channels.adopt(Sock::scripted(vec![], false), None, true, None);
        assert_eq!(second, "conn1");

        channels.close(&name).unwrap();
        assert!(!channels.exists(&name));
        assert!(matches!(channels.close(&name), Err(Error::UnknownChannel(_))));
        assert!(channels.exists(&second));
    }

    #[test]
    fn test_status_and_list() {
        let channels = Channels::new();
        let name = channels.adopt(
            Sock::scripted(vec![SendStep::Accept(usize::MAX)], false),
            Some("10.0.0.7".to_string()),
            true,
            None,
        );
        channels.write(&name, b"ping").unwrap();

        let status = channels.status(&name).unwrap();
        assert_eq!(status["sent"], 4);
        assert_eq!(status["received"], 0);
        assert_eq!(status["peer"], "10.0.0.7");

        let list = channels.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0][0], Value::String(name));
    }
}
