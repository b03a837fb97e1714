//! Server binary: load the configuration, start the server and run until
//! SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tidepool::dispatch::ClosureEngine;
use tidepool::{Config, Server};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_sig: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::Relaxed);
}

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    if args.next().is_some() {
        eprintln!("usage: tidepool ?config.json?");
        std::process::exit(2);
    }

    let config = match config_path {
        Some(path) => match Config::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("cannot load configuration: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    // Without an embedded interpreter, callback scripts are logged and
    // kept alive; embedders supply their own engine.
    let engine = Arc::new(ClosureEngine::new(|script, args| {
        log::info!("script callback: {script} {args:?}");
        Ok("1".to_string())
    }));

    let server = match Server::new(config, engine) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("server setup failed: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = server.start() {
        eprintln!("server start failed: {e}");
        std::process::exit(1);
    }

    unsafe {
        libc::signal(libc::SIGINT, on_stop_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_stop_signal as libc::sighandler_t);
    }

    while !STOP_REQUESTED.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(250));
        server.reload_certificates_if_requested();
    }

    log::info!("shutdown requested");
    server.stop();
    let status = server.wait_server(server.settings().shutdown_timeout());
    log::info!("server exited: {status}");
}
