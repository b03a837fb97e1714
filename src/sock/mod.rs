//! Socket transport layer.
//!
//! `Sock` wraps a non-blocking TCP socket, optionally with a TLS session on
//! top, behind one `recv_bufs` / `send_bufs` contract. TLS retryable states
//! collapse into the common `SockState` enum; errors land on the socket as a
//! generalized errno covering both POSIX and TLS reasons.

pub mod sls;

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result, SockErrno};
use crate::headers::Headers;

use self::sls::SlsStore;

/// Unified recv-side condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SockState {
    /// Data was read; more may arrive.
    Read,
    /// Peer closed cleanly.
    Done,
    /// Transient, retry later.
    #[default]
    Again,
    /// Fatal; the error code is on the socket.
    Exception,
}

/// Readiness conditions for timed waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waitable {
    Readable,
    Writable,
}

/// Parsed request head produced by the driver's readahead, consumed by the
/// request runner.
#[derive(Debug, Default)]
pub struct RequestIngest {
    pub line: String,
    pub method: String,
    pub url: String,
    pub version: (u8, u8),
    pub headers: Headers,
    pub content_length: usize,
    pub body: Vec<u8>,
    pub leftover: Vec<u8>,
}

/// TLS session state on top of the raw stream.
pub struct TlsSession {
    conn: rustls::Connection,
}

// Cap plaintext buffered inside rustls so backpressure reaches the channel
// layer instead of growing an internal queue.
const TLS_BUFFER_LIMIT: usize = 64 * 1024;

enum FillOutcome {
    Bytes,
    Eof,
    Blocked,
}

impl TlsSession {
    pub fn server(config: Arc<rustls::ServerConfig>) -> Result<Self> {
        let mut conn = rustls::ServerConnection::new(config)?;
        conn.set_buffer_limit(Some(TLS_BUFFER_LIMIT));
        Ok(Self { conn: rustls::Connection::Server(conn) })
    }

    pub fn client(config: Arc<rustls::ClientConfig>, server_name: &str) -> Result<Self> {
        let name: rustls::pki_types::ServerName<'static> = server_name
            .to_string()
            .try_into()
            .map_err(|_| Error::Config(format!("invalid server name '{server_name}'")))?;
        let mut conn = rustls::ClientConnection::new(config, name)?;
        conn.set_buffer_limit(Some(TLS_BUFFER_LIMIT));
        Ok(Self { conn: rustls::Connection::Client(conn) })
    }

    /// Drain pending TLS records into the stream. Returns whether anything
    /// is still queued (socket would block).
    fn flush_tls(&mut self, stream: &mut TcpStream) -> io::Result<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(stream) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(self.conn.wants_write())
    }

    /// Read one round of TLS data from the stream into the session.
    fn fill_tls(&mut self, stream: &mut TcpStream) -> io::Result<FillOutcome> {
        match self.conn.read_tls(stream) {
            Ok(0) => Ok(FillOutcome::Eof),
            Ok(_) => Ok(FillOutcome::Bytes),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(FillOutcome::Blocked),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(FillOutcome::Blocked),
            Err(e) => Err(e),
        }
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    pub fn peer_certificates(&self) -> Option<&[rustls::pki_types::CertificateDer<'static>]> {
        self.conn.peer_certificates()
    }
}

#[cfg(test)]
pub mod scripted {
    //! Scripted send transport for exercising partial-write handling.

    use std::collections::VecDeque;
    use std::io::IoSlice;

    #[derive(Debug, Clone, Copy)]
    pub enum SendStep {
        /// Accept up to this many bytes.
        Accept(usize),
        /// Report would-block (0 bytes).
        Block,
        /// Report a hard error with this errno.
        Fail(i32),
    }

    #[derive(Debug, Default)]
    pub struct ScriptedTransport {
        pub steps: VecDeque<SendStep>,
        /// Every byte the "peer" observed, in order.
        pub sent: Vec<u8>,
    }

    impl ScriptedTransport {
        pub fn send(&mut self, bufs: &[IoSlice<'_>]) -> (isize, i32) {
            // An exhausted plan blocks, so tests see deterministic partials.
            let step = self.steps.pop_front().unwrap_or(SendStep::Block);
            match step {
                SendStep::Block => (0, libc::EWOULDBLOCK),
                SendStep::Fail(errno) => (-1, errno),
                SendStep::Accept(limit) => {
                    let mut budget = limit;
                    for buf in bufs {
                        if budget == 0 {
                            break;
                        }
                        let take = budget.min(buf.len());
                        self.sent.extend_from_slice(&buf[..take]);
                        budget -= take;
                    }
                    ((limit - budget) as isize, 0)
                }
            }
        }
    }
}

enum Transport {
    Plain,
    Tls(Box<TlsSession>),
    #[cfg(test)]
    Scripted(scripted::ScriptedTransport),
}

/// Raw transport state: one socket, owned by at most one of a Conn, a
/// ConnChan, or a driver at any time. Mutated only by its current owner.
pub struct Sock {
    stream: TcpStream,
    peer: SocketAddr,
    transport: Transport,
    pub client_addr: Option<IpAddr>,
    pub send_errno: SockErrno,
    pub recv_errno: SockErrno,
    pub recv_state: SockState,
    /// Length of the pinned region awaiting retransmission after a blocked
    /// TLS send. Non-zero implies the channel's send buffer holds exactly
    /// these bytes at its front, untouched until the retry drains.
    pub send_rejected: usize,
    /// Last send ended in a retryable would-block state.
    pub want_write: bool,
    pub accept_time: Instant,
    pub flags: u32,
    pub sls: SlsStore,
    pub driver_name: String,
    pub recv_wait: Duration,
    pub send_wait: Duration,
    pub pool_hint: Option<String>,
    pub request: Option<Box<RequestIngest>>,
    #[cfg(test)]
    force_stable: bool,
}

impl std::fmt::Debug for Sock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sock")
            .field("fd", &self.stream.as_raw_fd())
            .field("peer", &self.peer)
            .field("tls", &self.is_tls())
            .finish()
    }
}

impl Sock {
    fn from_stream(stream: TcpStream, peer: SocketAddr, transport: Transport) -> Self {
        Self {
            stream,
            peer,
            transport,
            client_addr: None,
            send_errno: SockErrno::Clear,
            recv_errno: SockErrno::Clear,
            recv_state: SockState::Again,
            send_rejected: 0,
            want_write: false,
            accept_time: Instant::now(),
            flags: 0,
            sls: SlsStore::new(),
            driver_name: String::new(),
            recv_wait: Duration::from_secs(30),
            send_wait: Duration::from_secs(30),
            pool_hint: None,
            request: None,
            #[cfg(test)]
            force_stable: false,
        }
    }

    /// Wrap an accepted or dialed plaintext socket.
    pub fn plain(stream: TcpStream, peer: SocketAddr) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::from_stream(stream, peer, Transport::Plain))
    }

    /// Wrap an accepted socket with a server-side TLS session.
    pub fn tls_server(
        stream: TcpStream,
        peer: SocketAddr,
        config: Arc<rustls::ServerConfig>,
    ) -> Result<Self> {
        stream.set_nonblocking(true)?;
        let session = TlsSession::server(config)?;
        Ok(Self::from_stream(stream, peer, Transport::Tls(Box::new(session))))
    }

    /// Wrap a dialed socket with a client-side TLS session.
    pub fn tls_client(
        stream: TcpStream,
        peer: SocketAddr,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> Result<Self> {
        stream.set_nonblocking(true)?;
        let session = TlsSession::client(config, server_name)?;
        Ok(Self::from_stream(stream, peer, Transport::Tls(Box::new(session))))
    }

    #[cfg(test)]
    pub fn scripted(steps: Vec<scripted::SendStep>, stable: bool) -> Self {
        use scripted::ScriptedTransport;
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        // Keep the listener's fd alive so the scripted stream stays connected.
        std::mem::forget(listener);
        let mut sock = Self::from_stream(
            stream,
            addr,
            Transport::Scripted(ScriptedTransport { steps: steps.into(), sent: Vec::new() }),
        );
        sock.force_stable = stable;
        sock
    }

    #[cfg(test)]
    pub fn scripted_sent(&self) -> &[u8] {
        match &self.transport {
            Transport::Scripted(t) => &t.sent,
            _ => &[],
        }
    }

    #[cfg(test)]
    pub fn scripted_push(&mut self, steps: &[scripted::SendStep]) {
        if let Transport::Scripted(t) = &mut self.transport {
            t.steps.extend(steps.iter().copied());
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Whether the transport pins partially-sent buffers (TLS).
    pub fn requires_stable_send_buffer(&self) -> bool {
        #[cfg(test)]
        if self.force_stable {
            return true;
        }
        matches!(self.transport, Transport::Tls(_))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    pub fn tls(&self) -> Option<&TlsSession> {
        match &self.transport {
            Transport::Tls(t) => Some(t),
            _ => None,
        }
    }

    pub fn set_keepalive(&self, on: bool) {
        let value: libc::c_int = i32::from(on);
        unsafe {
            libc::setsockopt(
                self.fd(),
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                std::ptr::addr_of!(value).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    // ========================================================================
    // recv
    // ========================================================================

    /// Read into the supplied buffers without blocking. Returns bytes read
    /// and the resulting sockstate; the caller owns all timing.
    pub fn recv_bufs(&mut self, bufs: &mut [IoSliceMut<'_>]) -> (isize, SockState) {
        self.recv_errno = SockErrno::Clear;
        let (n, state) = match &mut self.transport {
            Transport::Plain => Self::recv_plain(&mut self.stream, bufs, &mut self.recv_errno),
            Transport::Tls(session) => {
                Self::recv_tls(session, &mut self.stream, bufs, &mut self.recv_errno)
            }
            #[cfg(test)]
            Transport::Scripted(_) => (0, SockState::Again),
        };
        self.recv_state = state;
        (n, state)
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> (isize, SockState) {
        let mut bufs = [IoSliceMut::new(buf)];
        self.recv_bufs(&mut bufs)
    }

    fn recv_plain(
        stream: &mut TcpStream,
        bufs: &mut [IoSliceMut<'_>],
        errno: &mut SockErrno,
    ) -> (isize, SockState) {
        match stream.read_vectored(bufs) {
            Ok(0) => (0, SockState::Done),
            Ok(n) => (n as isize, SockState::Read),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                (0, SockState::Again)
            }
            Err(e) => {
                *errno = SockErrno::from_io(&e);
                (-1, SockState::Exception)
            }
        }
    }

    fn recv_tls(
        session: &mut TlsSession,
        stream: &mut TcpStream,
        bufs: &mut [IoSliceMut<'_>],
        errno: &mut SockErrno,
    ) -> (isize, SockState) {
        loop {
            // Handshake replies and queued records go out first.
            if let Err(e) = session.flush_tls(stream) {
                *errno = SockErrno::from_io(&e);
                return (-1, SockState::Exception);
            }

            match session.conn.reader().read_vectored(bufs) {
                Ok(0) => return (0, SockState::Done),
                Ok(n) => return (n as isize, SockState::Read),
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    // Peer vanished mid-session without close_notify.
                    return (0, SockState::Done);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match session.fill_tls(stream) {
                        Ok(FillOutcome::Bytes) => match session.conn.process_new_packets() {
                            Ok(_) => continue,
                            Err(e) => {
                                let _ = session.flush_tls(stream);
                                *errno = SockErrno::from_tls(&e);
                                return (-1, SockState::Exception);
                            }
                        },
                        Ok(FillOutcome::Eof) => return (0, SockState::Done),
                        Ok(FillOutcome::Blocked) => return (0, SockState::Again),
                        Err(e) => {
                            *errno = SockErrno::from_io(&e);
                            return (-1, SockState::Exception);
                        }
                    }
                }
                Err(e) => {
                    *errno = SockErrno::from_io(&e);
                    return (-1, SockState::Exception);
                }
            }
        }
    }

    // ========================================================================
    // send
    // ========================================================================

    /// Write the buffers without blocking. Returns bytes sent (0 meaning
    /// would-block, with `want_write` raised) or -1 with the error recorded
    /// in `send_errno`.
    ///
    /// The TLS path consumes plaintext only while the record queue is
    /// drained; once the socket pushes back, nothing further is accepted,
    /// so a 0 return leaves the caller's buffer exactly as presented.
    pub fn send_bufs(&mut self, bufs: &[IoSlice<'_>]) -> isize {
        self.send_errno = SockErrno::Clear;
        self.want_write = false;
        let sent = match &mut self.transport {
            Transport::Plain => {
                Self::send_plain(&mut self.stream, bufs, &mut self.send_errno, &mut self.want_write)
            }
            Transport::Tls(session) => Self::send_tls(
                session,
                &mut self.stream,
                bufs,
                &mut self.send_errno,
                &mut self.want_write,
            ),
            #[cfg(test)]
            Transport::Scripted(t) => {
                let (n, errno) = t.send(bufs);
                if n == 0 {
                    self.want_write = true;
                    self.send_errno = SockErrno::Posix(errno);
                } else if n < 0 {
                    self.send_errno = SockErrno::Posix(errno);
                }
                n
            }
        };
        if sent > 0 && self.send_rejected > 0 {
            self.send_rejected = 0;
        }
        sent
    }

    fn send_plain(
        stream: &mut TcpStream,
        bufs: &[IoSlice<'_>],
        errno: &mut SockErrno,
        want_write: &mut bool,
    ) -> isize {
        loop {
            match stream.write_vectored(bufs) {
                Ok(n) => return n as isize,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    *want_write = true;
                    *errno = SockErrno::Posix(libc::EWOULDBLOCK);
                    return 0;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    *errno = SockErrno::from_io(&e);
                    return -1;
                }
            }
        }
    }

    fn send_tls(
        session: &mut TlsSession,
        stream: &mut TcpStream,
        bufs: &[IoSlice<'_>],
        errno: &mut SockErrno,
        want_write: &mut bool,
    ) -> isize {
        // A previous record may still be queued; it must drain before any
        // new plaintext is accepted, else a 0 return would lie about the
        // caller's buffer state.
        if session.conn.wants_write() {
            match session.flush_tls(stream) {
                Ok(true) => {
                    *want_write = true;
                    *errno = SockErrno::Posix(libc::EWOULDBLOCK);
                    return 0;
                }
                Ok(false) => {}
                Err(e) => {
                    *errno = SockErrno::from_io(&e);
                    return -1;
                }
            }
        }

        let mut sent: usize = 0;
        for buf in bufs {
            if buf.is_empty() {
                continue;
            }
            let n = match session.conn.writer().write(buf) {
                Ok(n) => n,
                Err(e) => {
                    *errno = SockErrno::from_io(&e);
                    return -1;
                }
            };
            sent += n;

            match session.flush_tls(stream) {
                Ok(still_pending) => {
                    if still_pending || n < buf.len() {
                        // Retry resumes from here; report what was consumed.
                        if sent == 0 {
                            *want_write = true;
                            *errno = SockErrno::Posix(libc::EWOULDBLOCK);
                        }
                        return sent as isize;
                    }
                }
                Err(e) => {
                    *errno = SockErrno::from_io(&e);
                    return -1;
                }
            }
        }
        sent as isize
    }

    // ========================================================================
    // waits and handshakes
    // ========================================================================

    /// Timed wait for readability or writability via poll(2).
    pub fn wait_for(&self, cond: Waitable, timeout: Duration) -> Result<()> {
        let events = match cond {
            Waitable::Readable => libc::POLLIN,
            Waitable::Writable => libc::POLLOUT,
        };
        let mut fds = [libc::pollfd { fd: self.fd(), events, revents: 0 }];
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, millis) };
        match rc {
            0 => Err(Error::Timeout),
            n if n > 0 => Ok(()),
            _ => Err(Error::Io(io::Error::last_os_error())),
        }
    }

    /// Wait against an absolute deadline so retries cannot extend the total
    /// time.
    pub fn wait_until(&self, cond: Waitable, deadline: Instant) -> Result<()> {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout);
        }
        self.wait_for(cond, deadline - now)
    }

    /// Drive a client-side TLS handshake to completion within the deadline.
    pub fn complete_tls_handshake(&mut self, deadline: Instant) -> Result<()> {
        loop {
            let Transport::Tls(session) = &mut self.transport else {
                return Ok(());
            };
            if !session.conn.is_handshaking() {
                return Ok(());
            }
            if session.flush_tls(&mut self.stream)? {
                self.wait_until(Waitable::Writable, deadline)?;
                continue;
            }
            let Transport::Tls(session) = &mut self.transport else {
                unreachable!()
            };
            if session.conn.wants_read() {
                match session.fill_tls(&mut self.stream)? {
                    FillOutcome::Bytes => {
                        session.conn.process_new_packets().map_err(Error::Tls)?;
                    }
                    FillOutcome::Eof => {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed during TLS handshake",
                        )));
                    }
                    FillOutcome::Blocked => {
                        self.wait_until(Waitable::Readable, deadline)?;
                    }
                }
            }
        }
    }

    /// Graceful close: TLS close_notify (best effort), then shutdown.
    pub fn close(&mut self) {
        if let Transport::Tls(session) = &mut self.transport {
            session.conn.send_close_notify();
            let _ = session.flush_tls(&mut self.stream);
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl Drop for Sock {
    fn drop(&mut self) {
        self.sls.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pipe_pair() -> (Sock, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (Sock::plain(server, peer).unwrap(), client)
    }

    #[test]
    fn test_recv_states_plain() {
        let (mut sock, mut client) = pipe_pair();
        let mut buf = [0u8; 64];

        // Nothing written yet: transient.
        let (n, state) = sock.recv(&mut buf);
        assert_eq!((n, state), (0, SockState::Again));

        client.write_all(b"hello").unwrap();
        client.flush().unwrap();
        sock.wait_for(Waitable::Readable, Duration::from_secs(2)).unwrap();
        let (n, state) = sock.recv(&mut buf);
        assert_eq!(state, SockState::Read);
        assert_eq!(&buf[..n as usize], b"hello");

        drop(client);
        sock.wait_for(Waitable::Readable, Duration::from_secs(2)).unwrap();
        let (n, state) = sock.recv(&mut buf);
        assert_eq!((n, state), (0, SockState::Done));
    }

    #[test]
    fn test_send_vectored_plain() {
        let (mut sock, mut client) = pipe_pair();
        let bufs = [IoSlice::new(b"ab"), IoSlice::new(b"cd")];
        let sent = sock.send_bufs(&bufs);
        assert_eq!(sent, 4);
        assert!(sock.send_errno.is_clear());

        let mut got = [0u8; 4];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"abcd");
    }

    #[test]
    fn test_send_error_sets_errno() {
        let (mut sock, client) = pipe_pair();
        drop(client);
        // Give the kernel a moment to register the close, then write twice:
        // the first write may succeed into the buffer, the second fails.
        std::thread::sleep(Duration::from_millis(20));
        let bufs = [IoSlice::new(&[0u8; 8192])];
        let mut last = 0;
        for _ in 0..10 {
            last = sock.send_bufs(&bufs);
            if last < 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(last, -1);
        assert!(!sock.send_errno.is_clear());
    }

    #[test]
    fn test_wait_timeout() {
        let (sock, _client) = pipe_pair();
        let err = sock.wait_for(Waitable::Readable, Duration::from_millis(20));
        assert!(matches!(err, Err(Error::Timeout)));
    }

    #[test]
    fn test_scripted_transport_partial() {
        use scripted::SendStep;
        let mut sock = Sock::scripted(vec![SendStep::Accept(3), SendStep::Block], false);
        let bufs = [IoSlice::new(b"hello")];
        assert_eq!(sock.send_bufs(&bufs), 3);
        assert_eq!(sock.send_bufs(&[IoSlice::new(b"lo")]), 0);
        assert!(sock.want_write);
        assert_eq!(sock.scripted_sent(), b"hel");
    }
}
