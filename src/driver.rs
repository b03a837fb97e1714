//! Driver: accepts sockets, performs request readahead and feeds the pool
//! scheduler.
//!
//! One thread per configured driver. Accepted sockets sit in a readahead
//! list until a full request head (and body) is buffered, then go through
//! `queue_conn`; saturation results are retried until the pool drains or
//! rejected with 503 when the pool is configured to shed load.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::DriverSettings;
use crate::error::Result;
use crate::pool::{QueueResult, queue_conn};
use crate::server::Server;
use crate::sock::{RequestIngest, Sock, SockState};
use crate::tls::TlsDriverSetup;

const MAX_REQUEST_SIZE: usize = 1024 * 1024;
const MAX_HEADERS: usize = 64;

pub struct Driver {
    handle: thread::JoinHandle<()>,
}

impl Driver {
    /// Bind and start the accept loop; the thread runs until the server
    /// shuts down.
    pub fn start(server: Arc<Server>, settings: DriverSettings) -> Result<Self> {
        let listener = TcpListener::bind((settings.address.as_str(), settings.port))?;
        listener.set_nonblocking(true)?;
        log::info!(
            "driver {}: listening on {}:{}",
            settings.name,
            settings.address,
            settings.port
        );

        let tls_setup = match &settings.tls {
            Some(tls) => Some(
                server
                    .tls()
                    .driver_setup(tls, settings.port, &server.settings().logdir)?,
            ),
            None => None,
        };

        let name = format!("-driver:{}-", settings.name);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || driver_loop(server, settings, listener, tls_setup))?;
        Ok(Self { handle })
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

struct Readahead {
    sock: Sock,
    buf: Vec<u8>,
    deadline: Instant,
}

struct Retry {
    sock: Sock,
    next_attempt: Instant,
}

fn driver_loop(
    server: Arc<Server>,
    settings: DriverSettings,
    listener: TcpListener,
    tls_setup: Option<TlsDriverSetup>,
) {
    let base_config = match &tls_setup {
        Some(setup) => match setup.server_config(None) {
            Ok(config) => Some(config),
            Err(e) => {
                log::error!("driver {}: TLS setup failed: {e}", settings.name);
                return;
            }
        },
        None => None,
    };
    let verify_roots = settings.verify.then(|| load_verify_roots(&settings)).flatten();
    if settings.verify && verify_roots.is_none() {
        log::warn!(
            "driver {}: verify requested but no usable CA file; client certificates disabled",
            settings.name
        );
    }

    let listener_fd = listener.as_raw_fd();
    let mut readahead: VecDeque<Readahead> = VecDeque::new();
    let mut retries: VecDeque<Retry> = VecDeque::new();

    while !server.is_shutdown() {
        server.reload_certificates_if_requested();

        let mut fds = [libc::pollfd { fd: listener_fd, events: libc::POLLIN, revents: 0 }];
        let timeout = if readahead.is_empty() && retries.is_empty() { 250 } else { 10 };
        unsafe {
            libc::poll(fds.as_mut_ptr(), 1, timeout);
        }

        // Accept everything pending.
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let sock = match &tls_setup {
                        Some(setup) => {
                            let config = match (&verify_roots, server.exceptions()) {
                                (Some(roots), exceptions) => {
                                    match crate::tls::client_cert_verifier(
                                        roots.clone(),
                                        exceptions.clone(),
                                        peer.ip(),
                                    )
                                    .and_then(|verifier| setup.server_config(Some(verifier)))
                                    {
                                        Ok(config) => config,
                                        Err(e) => {
                                            log::warn!("per-connection TLS config failed: {e}");
                                            continue;
                                        }
                                    }
                                }
                                _ => base_config.clone().expect("TLS driver has a base config"),
                            };
                            Sock::tls_server(stream, peer, config)
                        }
                        None => Sock::plain(stream, peer),
                    };
                    match sock {
                        Ok(mut sock) => {
                            sock.driver_name = settings.name.clone();
                            sock.recv_wait = settings.recv_wait();
                            sock.send_wait = settings.send_wait();
                            readahead.push_back(Readahead {
                                sock,
                                buf: Vec::with_capacity(settings.bufsize),
                                deadline: Instant::now() + settings.recv_wait(),
                            });
                        }
                        Err(e) => log::warn!("driver {}: accept setup failed: {e}", settings.name),
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("driver {}: accept error: {e}", settings.name);
                    break;
                }
            }
        }

        // Drive the readahead list.
        let mut still_reading = VecDeque::new();
        while let Some(mut entry) = readahead.pop_front() {
            match pump_readahead(&mut entry, settings.bufsize) {
                ReadaheadState::NeedMore => {
                    if Instant::now() >= entry.deadline {
                        log::debug!("driver {}: readahead timed out", settings.name);
                    } else {
                        still_reading.push_back(entry);
                    }
                }
                ReadaheadState::Closed => {}
                ReadaheadState::Complete => {
                    dispatch_sock(&server, entry.sock, &mut retries);
                }
            }
        }
        readahead = still_reading;

        // Retry saturated enqueues.
        let now = Instant::now();
        let mut pending = VecDeque::new();
        while let Some(retry) = retries.pop_front() {
            if retry.next_attempt > now {
                pending.push_back(retry);
            } else {
                dispatch_sock(&server, retry.sock, &mut pending);
            }
        }
        retries = pending;
    }

    log::info!("driver {}: exiting", settings.name);
}

fn load_verify_roots(settings: &DriverSettings) -> Option<Arc<rustls::RootCertStore>> {
    let tls = settings.tls.as_ref()?;
    let cafile = tls.cafile.as_ref()?;
    let mut roots = rustls::RootCertStore::empty();
    match crate::tls::keys::load_certs(cafile) {
        Ok(certs) => {
            for cert in certs {
                if let Err(e) = roots.add(cert) {
                    log::warn!("bad CA certificate in {}: {e}", cafile.display());
                }
            }
        }
        Err(e) => {
            log::warn!("cannot load CA file {}: {e}", cafile.display());
            return None;
        }
    }
    (!roots.is_empty()).then(|| Arc::new(roots))
}

fn dispatch_sock(server: &Arc<Server>, sock: Sock, retries: &mut VecDeque<Retry>) {
    match queue_conn(server, sock) {
        QueueResult::Queued => {}
        QueueResult::Timeout(sock) => {
            retries.push_back(Retry {
                sock,
                next_attempt: Instant::now() + Duration::from_millis(50),
            });
        }
        QueueResult::Rejected(mut sock) => {
            let body = b"Service Unavailable";
            let head = format!(
                "HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/plain\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let bufs = [IoSlice::new(head.as_bytes()), IoSlice::new(body)];
            let _ = sock.send_bufs(&bufs);
            sock.close();
        }
    }
}

enum ReadaheadState {
    NeedMore,
    Complete,
    Closed,
}

fn pump_readahead(entry: &mut Readahead, bufsize: usize) -> ReadaheadState {
    let mut chunk = vec![0u8; bufsize.max(1024)];
    loop {
        let (n, state) = entry.sock.recv(&mut chunk);
        match state {
            SockState::Read => {
                entry.buf.extend_from_slice(&chunk[..n as usize]);
                if entry.buf.len() > MAX_REQUEST_SIZE {
                    log::warn!("request exceeds maximum size, closing");
                    entry.sock.close();
                    return ReadaheadState::Closed;
                }
                match parse_request(&entry.buf) {
                    ParseOutcome::Complete(ingest) => {
                        entry.sock.request = Some(Box::new(ingest));
                        return ReadaheadState::Complete;
                    }
                    ParseOutcome::Partial => continue,
                    ParseOutcome::Invalid => {
                        log::debug!("malformed request head, closing");
                        entry.sock.close();
                        return ReadaheadState::Closed;
                    }
                }
            }
            SockState::Again => return ReadaheadState::NeedMore,
            SockState::Done | SockState::Exception => {
                entry.sock.close();
                return ReadaheadState::Closed;
            }
        }
    }
}

enum ParseOutcome {
    Complete(RequestIngest),
    Partial,
    Invalid,
}

/// Parse a buffered request head plus body.
fn parse_request(buf: &[u8]) -> ParseOutcome {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return ParseOutcome::Partial,
        Err(_) => return ParseOutcome::Invalid,
    };

    let (Some(method), Some(path)) = (req.method, req.path) else {
        return ParseOutcome::Invalid;
    };
    let minor = req.version.unwrap_or(1);

    let mut ingest = RequestIngest {
        line: format!("{method} {path} HTTP/1.{minor}"),
        method: method.to_string(),
        url: path.to_string(),
        version: (1, minor),
        ..Default::default()
    };
    for header in req.headers.iter() {
        let value = String::from_utf8_lossy(header.value).into_owned();
        if header.name.eq_ignore_ascii_case("content-length") {
            ingest.content_length = value.trim().parse().unwrap_or(0);
        }
        ingest.headers.push(header.name, value);
    }

    if ingest.content_length > 0 {
        let body_end = head_len + ingest.content_length;
        if buf.len() < body_end {
            return ParseOutcome::Partial;
        }
        ingest.body = buf[head_len..body_end].to_vec();
        ingest.leftover = buf[body_end..].to_vec();
    } else {
        ingest.leftover = buf[head_len..].to_vec();
    }
    ParseOutcome::Complete(ingest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_head_and_body() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nabcd";
        match parse_request(raw) {
            ParseOutcome::Complete(ingest) => {
                assert_eq!(ingest.method, "POST");
                assert_eq!(ingest.url, "/submit");
                assert_eq!(ingest.version, (1, 1));
                assert_eq!(ingest.headers.get("host"), Some("x"));
                assert_eq!(ingest.content_length, 4);
                assert_eq!(ingest.body, b"abcd");
                assert!(ingest.leftover.is_empty());
            }
            _ => panic!("expected a complete request"),
        }
    }

    #[test]
    fn test_parse_request_partial_body() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        assert!(matches!(parse_request(raw), ParseOutcome::Partial));
        let raw = b"GET / HT";
        assert!(matches!(parse_request(raw), ParseOutcome::Partial));
    }

    #[test]
    fn test_parse_request_invalid() {
        let raw = b"\x00\x01garbage\r\n\r\n";
        assert!(matches!(parse_request(raw), ParseOutcome::Invalid));
    }

    #[test]
    fn test_parse_request_pipelined_leftover() {
        let raw = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        match parse_request(raw) {
            ParseOutcome::Complete(ingest) => {
                assert_eq!(ingest.url, "/a");
                assert!(ingest.leftover.starts_with(b"GET /b"));
            }
            _ => panic!("expected a complete request"),
        }
    }
}
