//! Request runner: the per-request lifecycle inside a worker thread.
//!
//! Filter phases run in order: pre-auth, authorize, post-auth, the request
//! handler itself, trace, void-trace. A phase observing that the socket is
//! gone (detached or closed by a filter) downgrades its result to
//! `FilterReturn`, so no further output is attempted.

use std::io::IoSlice;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::Status;
use crate::pool::Pool;
use crate::pool::conn::{Conn, flags};
use crate::server::Server;
use crate::sock::Waitable;

/// Filter phases in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterPhase {
    PreAuth,
    PostAuth,
    Trace,
    VoidTrace,
}

pub type FilterProc = Arc<dyn Fn(&Arc<Server>, &mut Conn) -> Status + Send + Sync>;
pub type AuthProc = Arc<dyn Fn(&Arc<Server>, &Conn) -> Status + Send + Sync>;
pub type TraceProc = Arc<dyn Fn(&Arc<Server>, &mut Conn) + Send + Sync>;
pub type CleanupProc = Arc<dyn Fn(&mut Conn) + Send + Sync>;

/// Registered request handler.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, server: &Arc<Server>, conn: &mut Conn) -> Status;
}

impl<F> RequestHandler for F
where
    F: Fn(&Arc<Server>, &mut Conn) -> Status + Send + Sync,
{
    fn handle(&self, server: &Arc<Server>, conn: &mut Conn) -> Status {
        self(server, conn)
    }
}

/// Run one request to completion and close the connection.
pub fn conn_run(server: &Arc<Server>, pool: &Arc<Pool>, conn: &mut Conn) {
    let Some(request) = conn.sock.as_mut().and_then(|s| s.request.take()) else {
        log::warn!("connection {} has no request, closing", conn.id_string());
        close_conn(conn);
        return;
    };

    // Move the parsed head into the Conn.
    conn.request_line = request.line;
    conn.method = request.method;
    conn.url = request.url;
    conn.headers = request.headers;
    conn.body = request.body;
    conn.content_length = request.content_length;

    let sock = conn.sock.as_ref().expect("socket present");
    conn.peer = Some(sock.client_addr.unwrap_or_else(|| sock.peer_addr().ip()));

    conn.flags |= flags::CONFIGURED;
    conn.response_status = 200;
    conn.compress = if server.settings().compressenable {
        server.settings().compresslevel
    } else {
        0
    };
    conn.output_encoding = server.settings().outputencoding.clone();
    conn.url_encoding = server.settings().urlencoding.clone();
    conn.output_headers.truncate();

    if request.version < (1, 0) {
        conn.flags |= flags::SKIPHDRS;
    }
    conn.headers.fold_case(server.settings().header_case());

    if let Some(auth) = conn.headers.get("authorization").map(|s| s.to_string()) {
        parse_auth(conn, &auth);
    }
    if conn.method == "HEAD" {
        conn.flags |= flags::SKIPBODY;
    }

    let mut status = run_filters(server, conn, FilterPhase::PreAuth);
    conn.filter_done_time = Some(Instant::now());

    if conn.sock.is_none() {
        // A filter closed or detached the connection; feedback through
        // this connection cannot work anymore.
        log::debug!("pre-auth filter closed connection, cancelling request processing");
        status = Status::FilterReturn;
    }

    if status == Status::Ok {
        status = authorize(server, conn);
        match status {
            Status::Ok => {
                status = run_filters(server, conn, FilterPhase::PostAuth);
                conn.filter_done_time = Some(Instant::now());
                if status == Status::Ok && conn.sock.is_some() {
                    status = run_request(server, conn);
                    if conn.sock.is_none() {
                        // The handler detached; skip output, run traces.
                        status = Status::FilterReturn;
                    }
                }
            }
            Status::Forbidden => {
                respond(conn, 403, "Forbidden", b"Forbidden");
            }
            Status::Unauthorized => {
                conn.output_headers
                    .update("WWW-Authenticate", "Basic realm=\"server\"");
                respond(conn, 401, "Unauthorized", b"Unauthorized");
            }
            Status::Continue
            | Status::Error
            | Status::FilterBreak
            | Status::FilterReturn
            | Status::Timeout => {
                try_internal_error(conn, status, "after authorize request");
            }
        }
    } else if status != Status::FilterReturn {
        // The pre-auth filter chain failed without sending a response.
        try_internal_error(conn, status, "after pre_auth filter");
        status = Status::FilterReturn;
    }

    if status == Status::Ok || status == Status::FilterReturn {
        let trace_status = run_filters(server, conn, FilterPhase::Trace);
        if trace_status == Status::Ok {
            run_filters(server, conn, FilterPhase::VoidTrace);
            for trace in server.traces() {
                trace(server, conn);
            }
        }
    } else {
        log::info!(
            "not running trace filters, status {status}, http status code {}: {}",
            conn.response_status,
            conn.url
        );
    }

    for cleanup in server.cleanups() {
        cleanup(conn);
    }

    if conn.n_content_sent > 0 {
        pool.add_bytes_sent(conn.n_content_sent as i64);
    }

    close_conn(conn);

    conn.output_headers.truncate();
    conn.auth_user = None;
    conn.auth_passwd = None;
    conn.request_line.clear();
}

/// Close the connection. A detached Conn has no socket anymore, in which
/// case this is a no-op with respect to the transport.
fn close_conn(conn: &mut Conn) {
    if let Some(mut sock) = conn.sock.take() {
        sock.close();
    }
    conn.flags |= flags::CLOSED;
}

fn run_filters(server: &Arc<Server>, conn: &mut Conn, phase: FilterPhase) -> Status {
    let mut status = Status::Ok;
    for filter in server.filters(phase) {
        status = filter(server, conn);
        if conn.sock.is_none() && status == Status::Ok {
            status = Status::FilterReturn;
        }
        match status {
            Status::Ok => continue,
            _ => break,
        }
    }
    status
}

fn authorize(server: &Arc<Server>, conn: &Conn) -> Status {
    let mut status = Status::Ok;
    for auth in server.authorizers() {
        status = auth(server, conn);
        if status != Status::Ok {
            break;
        }
    }
    status
}

fn run_request(server: &Arc<Server>, conn: &mut Conn) -> Status {
    let handler = {
        let procs = server.procs.read().unwrap();
        procs.lookup(&conn.method, &conn.url).cloned()
    };
    match handler {
        Some(handler) => handler.handle(server, conn),
        None => {
            respond(conn, 404, "Not Found", b"Not Found");
            Status::Ok
        }
    }
}

/// Parse the Authorization request header into the Conn's auth fields.
fn parse_auth(conn: &mut Conn, value: &str) {
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or("");
    let payload = parts.next().unwrap_or("").trim();
    if scheme.eq_ignore_ascii_case("basic") {
        if let Ok(decoded) = BASE64.decode(payload) {
            if let Ok(text) = String::from_utf8(decoded) {
                match text.split_once(':') {
                    Some((user, passwd)) => {
                        conn.auth_user = Some(user.to_string());
                        conn.auth_passwd = Some(passwd.to_string());
                    }
                    None => conn.auth_user = Some(text),
                }
            }
        }
    } else if scheme.eq_ignore_ascii_case("bearer") {
        conn.auth_user = None;
        conn.auth_passwd = Some(payload.to_string());
    }
}

/// Attempt an internal-error response, tolerating an already-closed
/// connection.
fn try_internal_error(conn: &mut Conn, status: Status, context: &str) {
    log::error!(
        "connection {}: internal error ({status}) {context}",
        conn.id_string()
    );
    if conn.sock.is_some() {
        respond(conn, 500, "Internal Server Error", b"Internal Server Error");
    }
}

/// Minimal response writer for canonical responses and simple handlers.
pub fn respond(conn: &mut Conn, status: u16, reason: &str, body: &[u8]) {
    conn.response_status = status;
    let Some(sock) = conn.sock.as_mut() else {
        return;
    };

    let mut buf = Vec::with_capacity(256 + body.len());
    if conn.flags & flags::SKIPHDRS == 0 {
        buf.extend_from_slice(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());
        for (name, value) in conn.output_headers.iter() {
            buf.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if conn.output_headers.get("content-type").is_none() {
            buf.extend_from_slice(b"Content-Type: text/plain\r\n");
        }
        buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        buf.extend_from_slice(b"Connection: close\r\n\r\n");
    }
    if conn.flags & flags::SKIPBODY == 0 {
        buf.extend_from_slice(body);
    }

    let deadline = Instant::now() + sock.send_wait;
    let mut off = 0usize;
    while off < buf.len() {
        let n = sock.send_bufs(&[IoSlice::new(&buf[off..])]);
        if n < 0 {
            log::debug!("response write failed: {}", sock.send_errno.reason());
            break;
        }
        if n == 0 {
            if sock.wait_until(Waitable::Writable, deadline).is_err() {
                log::debug!("response write timed out");
                break;
            }
            continue;
        }
        off += n as usize;
    }
    conn.n_content_sent += off;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock::scripted::SendStep;
    use crate::sock::{RequestIngest, Sock};

    fn conn_with_request(method: &str, url: &str, headers: &[(&str, &str)]) -> Conn {
        let mut sock = Sock::scripted(vec![SendStep::Accept(usize::MAX); 4], false);
        let mut ingest = RequestIngest {
            line: format!("{method} {url} HTTP/1.1"),
            method: method.to_string(),
            url: url.to_string(),
            version: (1, 1),
            ..Default::default()
        };
        for (name, value) in headers {
            ingest.headers.push(*name, *value);
        }
        sock.request = Some(Box::new(ingest));
        Conn { sock: Some(sock), ..Default::default() }
    }

    fn sent_text(conn: &Conn) -> String {
        String::from_utf8_lossy(conn.sock.as_ref().unwrap().scripted_sent()).into_owned()
    }

    #[test]
    fn test_unrouted_request_gets_404() {
        let server = Server::build_for_tests();
        let pool = server.default_pool();
        let mut conn = conn_with_request("GET", "/missing", &[]);

        // Peek at the response before close_conn drops the socket.
        let sock_probe = {
            conn.request_dequeue_time = Some(Instant::now());
            conn_run_probe(&server, &pool, &mut conn)
        };
        assert!(sock_probe.starts_with("HTTP/1.1 404 Not Found"));
        assert!(conn.is_closed());
    }

    // Run conn_run but capture what went over the wire before the socket
    // is dropped.
    fn conn_run_probe(server: &Arc<Server>, pool: &Arc<Pool>, conn: &mut Conn) -> String {
        let captured = Arc::new(std::sync::Mutex::new(String::new()));
        let captured_clone = captured.clone();
        server.register_cleanup(Arc::new(move |conn: &mut Conn| {
            if let Some(sock) = conn.sock.as_ref() {
                *captured_clone.lock().unwrap() =
                    String::from_utf8_lossy(sock.scripted_sent()).into_owned();
            }
        }));
        conn_run(server, pool, conn);
        let text = captured.lock().unwrap().clone();
        text
    }

    #[test]
    fn test_registered_handler_runs() {
        let server = Server::build_for_tests();
        let pool = server.default_pool();
        server.register_proc("GET", "/hello", Arc::new(
            |_server: &Arc<Server>, conn: &mut Conn| {
                respond(conn, 200, "OK", b"hello world");
                Status::Ok
            },
        ));

        let mut conn = conn_with_request("GET", "/hello", &[]);
        let wire = conn_run_probe(&server, &pool, &mut conn);
        assert!(wire.starts_with("HTTP/1.1 200 OK"));
        assert!(wire.ends_with("hello world"));
    }

    #[test]
    fn test_forbidden_and_unauthorized_paths() {
        let server = Server::build_for_tests();
        let pool = server.default_pool();
        server.register_authorizer(Arc::new(|_server: &Arc<Server>, conn: &Conn| {
            match conn.auth_user.as_deref() {
                Some("admin") => Status::Ok,
                Some(_) => Status::Forbidden,
                None => Status::Unauthorized,
            }
        }));

        let mut conn = conn_with_request("GET", "/x", &[]);
        let wire = conn_run_probe(&server, &pool, &mut conn);
        assert!(wire.starts_with("HTTP/1.1 401 Unauthorized"));
        assert!(wire.contains("WWW-Authenticate: Basic"));

        // guest:secret in base64.
        let creds = BASE64.encode("guest:secret");
        let header = format!("Basic {creds}");
        let mut conn = conn_with_request("GET", "/x", &[("Authorization", header.as_str())]);
        let wire = conn_run_probe(&server, &pool, &mut conn);
        assert!(wire.starts_with("HTTP/1.1 403 Forbidden"));
        assert_eq!(conn.auth_user.as_deref(), Some("guest"));
        assert_eq!(conn.auth_passwd.as_deref(), Some("secret"));
    }

    #[test]
    fn test_filter_break_short_circuits_handler() {
        let server = Server::build_for_tests();
        let pool = server.default_pool();
        let handler_ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let handler_flag = handler_ran.clone();

        server.register_filter(
            FilterPhase::PreAuth,
            Arc::new(|_server: &Arc<Server>, conn: &mut Conn| {
                respond(conn, 204, "No Content", b"");
                Status::FilterBreak
            }),
        );
        server.register_proc("GET", "/short", Arc::new(
            move |_server: &Arc<Server>, _conn: &mut Conn| {
                handler_flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Status::Ok
            },
        ));

        let mut conn = conn_with_request("GET", "/short", &[]);
        let wire = conn_run_probe(&server, &pool, &mut conn);
        // The filter already emitted the response; the handler never ran,
        // and the error path produced an internal error response.
        assert!(!handler_ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(wire.starts_with("HTTP/1.1 204 No Content"));
    }

    #[test]
    fn test_head_skips_body() {
        let server = Server::build_for_tests();
        let pool = server.default_pool();
        server.register_proc("HEAD", "/doc", Arc::new(
            |_server: &Arc<Server>, conn: &mut Conn| {
                respond(conn, 200, "OK", b"should not appear");
                Status::Ok
            },
        ));
        let mut conn = conn_with_request("HEAD", "/doc", &[]);
        let wire = conn_run_probe(&server, &pool, &mut conn);
        assert!(wire.starts_with("HTTP/1.1 200 OK"));
        assert!(!wire.contains("should not appear"));
    }

    #[test]
    fn test_header_case_folding_applied() {
        let server = Server::build_for_tests_with_hdrcase("tolower");
        let pool = server.default_pool();
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let seen_clone = seen.clone();
        server.register_proc("GET", "/fold", Arc::new(
            move |_server: &Arc<Server>, conn: &mut Conn| {
                let name = conn.headers.iter().next().map(|(n, _)| n.to_string());
                *seen_clone.lock().unwrap() = name.unwrap_or_default();
                respond(conn, 200, "OK", b"");
                Status::Ok
            },
        ));
        let mut conn = conn_with_request("GET", "/fold", &[("X-Mixed-Case", "v")]);
        conn_run(&server, &pool, &mut conn);
        assert_eq!(seen.lock().unwrap().as_str(), "x-mixed-case");
    }
}
