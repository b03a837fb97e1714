//! Cross-subsystem scenarios: pool burst behavior, detach plus callback
//! firing, the callback return-value protocol, and a full HTTP round trip
//! through the driver.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::chan::Channels;
use crate::chan::poller::WhenMask;
use crate::config::{Config, DriverSettings, PoolSettings};
use crate::dispatch::ClosureEngine;
use crate::error::Status;
use crate::pool::conn::Conn;
use crate::pool::{QueueResult, queue_conn};
use crate::runner::respond;
use crate::server::Server;
use crate::sock::scripted::SendStep;
use crate::sock::{RequestIngest, Sock};

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

fn request_sock(method: &str, url: &str) -> Sock {
    let mut sock = Sock::scripted(vec![SendStep::Accept(usize::MAX); 4], false);
    sock.request = Some(Box::new(RequestIngest {
        line: format!("{method} {url} HTTP/1.1"),
        method: method.to_string(),
        url: url.to_string(),
        version: (1, 1),
        ..Default::default()
    }));
    sock
}

// ============================================================================
// Pool burst (slow handlers, bounded growth, full drain)
// ============================================================================

#[test]
fn test_pool_burst_grows_to_max_and_drains() {
    let server = Server::build_for_tests_with_pool(PoolSettings {
        minthreads: 2,
        maxthreads: 8,
        lowwatermark: 1,
        highwatermark: 4,
        rejectoverrun: false,
        ..Default::default()
    });
    let pool = server.default_pool();

    server.register_proc("GET", "/burst", Arc::new(
        |_server: &Arc<Server>, conn: &mut Conn| {
            std::thread::sleep(Duration::from_millis(50));
            respond(conn, 200, "OK", b"done");
            Status::Ok
        },
    ));

    for _ in 0..20 {
        match queue_conn(&server, request_sock("GET", "/burst")) {
            QueueResult::Queued => {}
            other => panic!("burst enqueue failed: {other:?}"),
        }
        // The wait queue may grow but the thread count must stay bounded.
        assert!(pool.threads.lock().unwrap().current <= 8);
    }

    let drained = wait_until(Duration::from_secs(10), || {
        pool.stats.lock().unwrap().processed == 20 && pool.waiting() == 0
    });
    assert!(drained, "burst did not drain");
    assert!(pool.threads.lock().unwrap().current <= 8);
    assert!(pool.stats.lock().unwrap().connthreads >= 1);

    server.stop();
    assert_eq!(server.wait_server(Duration::from_secs(5)), Status::Ok);
    assert_eq!(pool.threads.lock().unwrap().current, 0);
}

#[test]
fn test_connsperthread_zero_serves_one_and_exits() {
    let server = Server::build_for_tests_with_pool(PoolSettings {
        minthreads: 0,
        maxthreads: 1,
        connsperthread: 0,
        lowwatermark: 0,
        ..Default::default()
    });
    let pool = server.default_pool();

    server.register_proc("GET", "/once", Arc::new(
        |_server: &Arc<Server>, conn: &mut Conn| {
            respond(conn, 200, "OK", b"once");
            Status::Ok
        },
    ));

    match queue_conn(&server, request_sock("GET", "/once")) {
        QueueResult::Queued => {}
        other => panic!("enqueue failed: {other:?}"),
    }

    // The worker serves its single connection and exits without shutdown.
    let exited = wait_until(Duration::from_secs(5), || {
        pool.stats.lock().unwrap().processed == 1 && pool.threads.lock().unwrap().current == 0
    });
    assert!(exited, "worker did not exit after its first connection");

    // A further request spawns a fresh worker.
    match queue_conn(&server, request_sock("GET", "/once")) {
        QueueResult::Queued => {}
        other => panic!("second enqueue failed: {other:?}"),
    }
    let again = wait_until(Duration::from_secs(5), || {
        pool.stats.lock().unwrap().processed == 2 && pool.threads.lock().unwrap().current == 0
    });
    assert!(again, "replacement worker did not serve the second connection");
    assert!(pool.stats.lock().unwrap().connthreads >= 2);

    server.stop();
    assert_eq!(server.wait_server(Duration::from_secs(5)), Status::Ok);
}

// ============================================================================
// Detach + callback firing
// ============================================================================

struct CallbackHarness {
    channels: Arc<Channels>,
    fired: Arc<AtomicUsize>,
    name: String,
    peer: TcpStream,
}

/// Build a channel over a real socket pair with a registered readable
/// callback whose script result is `result`; "consume" scripts drain the
/// channel before returning.
fn callback_harness(result: &'static str, consume: bool) -> CallbackHarness {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = TcpStream::connect(addr).unwrap();
    let (stream, peer_addr) = listener.accept().unwrap();

    let mut sock = Sock::plain(stream, peer_addr).unwrap();
    sock.recv_wait = Duration::from_millis(200);

    let channels = Channels::new();
    let name = channels.adopt(sock, None, true, None);

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = fired.clone();
    let channels_clone = channels.clone();
    let name_clone = name.clone();
    let engine = Arc::new(ClosureEngine::new(move |_script, args| {
        assert_eq!(args.len(), 1);
        fired_clone.fetch_add(1, Ordering::SeqCst);
        if consume {
            let _ = channels_clone.read(&name_clone);
        }
        Ok(result.to_string())
    }));
    channels.start_poller(engine).unwrap();
    channels
        .register_callback(&name, "consume chan", WhenMask::parse("r").unwrap(), None, None, None)
        .unwrap();

    CallbackHarness { channels, fired, name, peer }
}

#[test]
fn test_detach_then_callback_fires_once() {
    // A request handler detaches mid-request; afterwards the HTTP pipeline
    // no longer owns the socket and the channel callback sees the input.
    let mut conn = Conn {
        sock: Some(Sock::scripted(vec![], false)),
        ..Default::default()
    };
    let channels = Channels::new();
    let detached = conn.sock.take().unwrap();
    conn.flags |= crate::pool::conn::flags::CLOSED;
    let name = channels.adopt(detached, None, true, None);
    assert!(conn.is_closed());
    assert!(conn.sock.is_none());
    assert!(channels.exists(&name));

    // Full callback path over a real socket pair.
    let mut harness = callback_harness("1", true);
    harness.peer.write_all(b"trigger").unwrap();
    harness.peer.flush().unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            harness.fired.load(Ordering::SeqCst) == 1
        }),
        "callback did not fire"
    );
    // All input was consumed; no further firing.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(harness.fired.load(Ordering::SeqCst), 1);

    harness.channels.shutdown();
}

#[test]
fn test_callback_zero_closes_channel() {
    let mut harness = callback_harness("0", false);
    harness.peer.write_all(b"x").unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            !harness.channels.exists(&harness.name)
        }),
        "channel was not closed by the 0 result"
    );
    assert_eq!(harness.fired.load(Ordering::SeqCst), 1);
    harness.channels.shutdown();
}

#[test]
fn test_callback_suspend_keeps_channel_alive() {
    let mut harness = callback_harness("2", true);
    harness.peer.write_all(b"x").unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            harness.fired.load(Ordering::SeqCst) == 1
        }),
        "callback did not fire"
    );

    // Suspended: more input does not fire again, the channel stays.
    harness.peer.write_all(b"y").unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(harness.fired.load(Ordering::SeqCst), 1);
    assert!(harness.channels.exists(&harness.name));

    // A subsequent close still succeeds and releases the channel.
    harness.channels.close(&harness.name).unwrap();
    assert!(!harness.channels.exists(&harness.name));
    harness.channels.shutdown();
}

#[test]
fn test_callback_unhandled_result_closes() {
    let mut harness = callback_harness("surprise", false);
    harness.peer.write_all(b"x").unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            !harness.channels.exists(&harness.name)
        }),
        "channel should close on a non-numeric result"
    );
    harness.channels.shutdown();
}

// ============================================================================
// Listen callback result handling
// ============================================================================

fn listen_with_result(result: &'static str) -> (Arc<Channels>, u16) {
    let channels = Channels::new();
    let engine = Arc::new(ClosureEngine::constant(result));
    let dict = channels
        .listen(engine, "127.0.0.1", 0, "greet")
        .unwrap();
    let port = dict["port"].as_u64().unwrap() as u16;
    (channels, port)
}

#[test]
fn test_listen_callback_true_keeps_channel() {
    let (channels, port) = listen_with_result("1");
    let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || !channels.list().is_empty()),
        "accepted connection did not become a channel"
    );
    channels.shutdown();
}

#[test]
fn test_listen_callback_fails_closed() {
    // Explicit false and unparseable results both close the fresh channel.
    for result in ["0", "False", "banana"] {
        let (channels, port) = listen_with_result(result);
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        // The peer observes the close as EOF (or a reset).
        let mut buf = [0u8; 8];
        match client.read(&mut buf) {
            Ok(0) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
            Ok(n) => panic!("result {result:?} left the connection open ({n} bytes)"),
            Err(e) => panic!("result {result:?} left the connection open: {e}"),
        }
        assert!(
            wait_until(Duration::from_secs(3), || channels.list().is_empty()),
            "result {result:?} left the channel registered"
        );
        channels.shutdown();
    }
}

// ============================================================================
// TLS handshakes, reload, SNI
// ============================================================================

use crate::config::TlsSettings;
use crate::sock::{SockState, Waitable};
use crate::tls::{ClientTlsOptions, TlsRegistry, create_client_config};

struct CertFixture {
    dir: std::path::PathBuf,
    pem_path: std::path::PathBuf,
}

impl CertFixture {
    fn new(tag: &str) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "tidepool-tls-{}-{tag}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        Self { dir: dir.clone(), pem_path: dir.join("server.pem") }
    }

    /// Write a fresh self-signed certificate plus key for `host` and
    /// return its DER bytes.
    fn install(&self, host: &str) -> Vec<u8> {
        let generated = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        let pem = format!("{}{}", generated.cert.pem(), generated.key_pair.serialize_pem());
        std::fs::write(&self.pem_path, pem).unwrap();
        generated.cert.der().as_ref().to_vec()
    }

    fn settings(&self) -> TlsSettings {
        TlsSettings {
            certificate: self.pem_path.clone(),
            ..Default::default()
        }
    }
}

impl Drop for CertFixture {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

/// Run one TLS handshake against `config` and return the server
/// certificate the client saw, plus both sides of the live session.
fn tls_handshake(config: Arc<rustls::ServerConfig>, server_name: &str) -> (Sock, Sock, Vec<u8>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_side = std::thread::spawn(move || {
        let (stream, peer) = listener.accept().unwrap();
        let mut sock = Sock::tls_server(stream, peer, config).unwrap();
        // The handshake completes while waiting for the first bytes.
        let mut buf = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match sock.recv(&mut buf) {
                (n, SockState::Read) => return (sock, buf[..n as usize].to_vec()),
                (_, SockState::Again) => {
                    sock.wait_until(Waitable::Readable, deadline).unwrap();
                }
                other => panic!("server handshake failed: {other:?}"),
            }
        }
    });

    let client_config =
        create_client_config(&ClientTlsOptions { insecure: true, ..Default::default() }, None)
            .unwrap();
    let stream = TcpStream::connect(addr).unwrap();
    let mut client = Sock::tls_client(stream, addr, client_config, server_name).unwrap();
    client
        .complete_tls_handshake(Instant::now() + Duration::from_secs(5))
        .unwrap();

    let seen_cert = client
        .tls()
        .and_then(|tls| tls.peer_certificates())
        .and_then(|certs| certs.first())
        .map(|cert| cert.as_ref().to_vec())
        .expect("client saw a server certificate");

    assert_eq!(client.send_bufs(&[std::io::IoSlice::new(b"hi")]), 2);
    let (server, greeting) = server_side.join().unwrap();
    assert_eq!(greeting, b"hi");
    (server, client, seen_cert)
}

#[test]
fn test_certificate_reload_spares_live_connections() {
    let fixture = CertFixture::new("reload");
    let first_der = fixture.install("one.example");

    let registry = TlsRegistry::new();
    let setup = registry
        .driver_setup(&fixture.settings(), 8443, &fixture.dir)
        .unwrap();
    let config = setup.server_config(None).unwrap();

    let (mut server, mut client, seen) = tls_handshake(config.clone(), "one.example");
    assert_eq!(seen, first_der);

    // Swap the on-disk certificate and reload every registered context.
    let second_der = fixture.install("two.example");
    registry.reload();

    // The established session keeps working on the old certificate.
    assert_eq!(server.send_bufs(&[std::io::IoSlice::new(b"still-alive")]), 11);
    let mut buf = [0u8; 32];
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match client.recv(&mut buf) {
            (n, SockState::Read) => {
                assert_eq!(&buf[..n as usize], b"still-alive");
                break;
            }
            (_, SockState::Again) => client.wait_until(Waitable::Readable, deadline).unwrap(),
            other => panic!("client read failed: {other:?}"),
        }
    }

    // New handshakes see the reloaded certificate.
    let (_server, _client, seen) = tls_handshake(config, "two.example");
    assert_eq!(seen, second_der);
    assert_ne!(first_der, second_der);
}

#[test]
fn test_sni_selects_vhost_certificate() {
    let fixture = CertFixture::new("sni");
    let default_der = fixture.install("default.example");

    // A vhost directory with one per-host certificate.
    let vhost_dir = fixture.dir.join("vhosts");
    std::fs::create_dir_all(&vhost_dir).unwrap();
    let generated = rcgen::generate_simple_self_signed(vec!["vhost.example".to_string()]).unwrap();
    let vhost_der = generated.cert.der().as_ref().to_vec();
    std::fs::write(
        vhost_dir.join("vhost.example.pem"),
        format!("{}{}", generated.cert.pem(), generated.key_pair.serialize_pem()),
    )
    .unwrap();

    let mut settings = fixture.settings();
    settings.vhostcertificates = Some(vhost_dir);

    let registry = TlsRegistry::new();
    let setup = registry.driver_setup(&settings, 8443, &fixture.dir).unwrap();
    let config = setup.server_config(None).unwrap();

    // Registry lookup: hit and miss.
    assert!(registry.lookup_sni("vhost.example", 8443).is_some());
    assert!(registry.lookup_sni("vhost.example", 9999).is_none());
    assert!(registry.lookup_sni("other.example", 8443).is_none());

    // The client's server name steers certificate selection; unknown names
    // fall back to the default context.
    let (_s, _c, seen) = tls_handshake(config.clone(), "vhost.example");
    assert_eq!(seen, vhost_der);
    let (_s, _c, seen) = tls_handshake(config, "unknown.example");
    assert_eq!(seen, default_der);
}

// ============================================================================
// Driver round trip
// ============================================================================

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[test]
fn test_driver_http_round_trip() {
    let port = free_port();
    let mut config = Config::default();
    config.drivers.push(DriverSettings {
        name: "nssock".to_string(),
        address: "127.0.0.1".to_string(),
        port,
        ..Default::default()
    });
    let server = Server::build_for_tests_with_config(config);
    server.register_proc("GET", "/ping", Arc::new(
        |_server: &Arc<Server>, conn: &mut Conn| {
            respond(conn, 200, "OK", b"pong");
            Status::Ok
        },
    ));
    server.start().unwrap();

    let response = Arc::new(Mutex::new(String::new()));
    let ok = wait_until(Duration::from_secs(5), || {
        let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)) else {
            return false;
        };
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        if stream
            .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .is_err()
        {
            return false;
        }
        let mut text = String::new();
        let _ = stream.read_to_string(&mut text);
        if text.is_empty() {
            return false;
        }
        *response.lock().unwrap() = text;
        true
    });
    assert!(ok, "no response from driver");
    let text = response.lock().unwrap().clone();
    assert!(text.starts_with("HTTP/1.1 200 OK"), "unexpected response: {text}");
    assert!(text.ends_with("pong"));

    // Unrouted URLs produce the canonical 404.
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
        .write_all(b"GET /other HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let mut text = String::new();
    let _ = stream.read_to_string(&mut text);
    assert!(text.starts_with("HTTP/1.1 404 Not Found"), "unexpected response: {text}");

    server.stop();
    assert_eq!(server.wait_server(Duration::from_secs(5)), Status::Ok);
}
