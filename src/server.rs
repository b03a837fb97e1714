//! Server: owns the pools, the channel table, the TLS registry and the
//! registration tables the request runner consults.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::chan::Channels;
use crate::config::Config;
use crate::dispatch::ScriptEngine;
use crate::driver::Driver;
use crate::error::{Result, Status};
use crate::pool::{Pool, wakeup_conn_threads};
use crate::runner::{AuthProc, CleanupProc, FilterPhase, FilterProc, RequestHandler, TraceProc};
use crate::tls::TlsRegistry;
use crate::tls::verify::ExceptionStore;
use crate::urlspace::{UrlSpace, parse_mapspec};

struct PoolsState {
    shutdown: bool,
    nextconnid: u64,
    join_thread: Option<JoinHandle<()>>,
}

pub struct Server {
    config: Config,
    pools: Vec<Arc<Pool>>,
    default_pool: Arc<Pool>,
    pools_state: Mutex<PoolsState>,
    pub urlspace: RwLock<UrlSpace<String>>,
    pub procs: RwLock<UrlSpace<Arc<dyn RequestHandler>>>,
    filters: RwLock<HashMap<FilterPhase, Vec<FilterProc>>>,
    authorizers: RwLock<Vec<AuthProc>>,
    cleanups: RwLock<Vec<CleanupProc>>,
    traces: RwLock<Vec<TraceProc>>,
    channels: Arc<Channels>,
    tls: TlsRegistry,
    exceptions: Arc<ExceptionStore>,
    engine: Arc<dyn ScriptEngine>,
    drivers: Mutex<Vec<Driver>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Server({})", self.config.server.name)
    }
}

impl Server {
    pub fn new(config: Config, engine: Arc<dyn ScriptEngine>) -> Result<Arc<Self>> {
        let default_name = config.server.defaultpool.clone();
        let mut pools = Vec::new();
        let mut default_pool = None;

        let mut pool_names: Vec<String> = config.pools.keys().cloned().collect();
        if !pool_names.contains(&default_name) {
            pool_names.push(default_name.clone());
        }
        pool_names.sort();

        for name in &pool_names {
            let pool = Pool::new(name, &config.pool(name));
            if *name == default_name {
                default_pool = Some(pool.clone());
            }
            pools.push(pool);
        }

        let exceptions = Arc::new(ExceptionStore::new(
            &config.server.validationexceptions,
            config.server.invalidcertificates.clone(),
        )?);

        let channels = Channels::new();
        channels.set_validation_exceptions(exceptions.clone());

        let server = Arc::new(Self {
            config,
            pools,
            default_pool: default_pool.expect("default pool exists"),
            pools_state: Mutex::new(PoolsState {
                shutdown: false,
                nextconnid: 0,
                join_thread: None,
            }),
            urlspace: RwLock::new(UrlSpace::new()),
            procs: RwLock::new(UrlSpace::new()),
            filters: RwLock::new(HashMap::new()),
            authorizers: RwLock::new(Vec::new()),
            cleanups: RwLock::new(Vec::new()),
            traces: RwLock::new(Vec::new()),
            channels,
            tls: TlsRegistry::new(),
            exceptions,
            engine,
            drivers: Mutex::new(Vec::new()),
        });

        // Apply configured pool mappings.
        {
            let mut urlspace = server.urlspace.write().unwrap();
            for pool in &server.pools {
                for spec in &server.config.pool(&pool.name).map {
                    match parse_mapspec(spec) {
                        Ok((method, url)) => {
                            log::info!("pool {}: mapped {method} {url}", pool.name);
                            urlspace.map(&method, &url, true, pool.name.clone());
                        }
                        Err(e) => log::warn!("pool {}: {e}", pool.name),
                    }
                }
            }
        }

        Ok(server)
    }

    // ------------------------------------------------------------------------
    // accessors
    // ------------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.config.server.name
    }

    pub fn settings(&self) -> &crate::config::ServerSettings {
        &self.config.server
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn ScriptEngine> {
        &self.engine
    }

    pub fn channels(&self) -> &Arc<Channels> {
        &self.channels
    }

    pub fn tls(&self) -> &TlsRegistry {
        &self.tls
    }

    pub fn exceptions(&self) -> &Arc<ExceptionStore> {
        &self.exceptions
    }

    pub fn pools(&self) -> &[Arc<Pool>] {
        &self.pools
    }

    pub fn pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools.iter().find(|p| p.name == name).cloned()
    }

    pub fn default_pool(&self) -> Arc<Pool> {
        self.default_pool.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.pools_state.lock().unwrap().shutdown
    }

    pub fn next_conn_id(&self) -> u64 {
        let mut state = self.pools_state.lock().unwrap();
        let id = state.nextconnid;
        state.nextconnid += 1;
        id
    }

    /// Exiting workers leave their join handle here and adopt the previous
    /// occupant; this drains zombie threads without a dedicated reaper.
    pub fn swap_join_thread(&self, handle: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        let mut state = self.pools_state.lock().unwrap();
        std::mem::replace(&mut state.join_thread, handle)
    }

    // ------------------------------------------------------------------------
    // registrations
    // ------------------------------------------------------------------------

    pub fn register_proc(&self, method: &str, url: &str, handler: Arc<dyn RequestHandler>) {
        self.procs.write().unwrap().map(method, url, true, handler);
    }

    pub fn register_filter(&self, phase: FilterPhase, filter: FilterProc) {
        self.filters.write().unwrap().entry(phase).or_default().push(filter);
    }

    pub fn register_authorizer(&self, auth: AuthProc) {
        self.authorizers.write().unwrap().push(auth);
    }

    pub fn register_cleanup(&self, cleanup: CleanupProc) {
        self.cleanups.write().unwrap().push(cleanup);
    }

    pub fn register_trace(&self, trace: TraceProc) {
        self.traces.write().unwrap().push(trace);
    }

    pub fn filters(&self, phase: FilterPhase) -> Vec<FilterProc> {
        self.filters.read().unwrap().get(&phase).cloned().unwrap_or_default()
    }

    pub fn authorizers(&self) -> Vec<AuthProc> {
        self.authorizers.read().unwrap().clone()
    }

    pub fn cleanups(&self) -> Vec<CleanupProc> {
        self.cleanups.read().unwrap().clone()
    }

    pub fn traces(&self) -> Vec<TraceProc> {
        self.traces.read().unwrap().clone()
    }

    // ------------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------------

    /// Start the callback loop, the configured drivers and the minimum
    /// worker threads of every pool.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.channels.start_poller(self.engine.clone())?;
        self.tls.install_sighup_handler();

        // Bring every pool straight to its minimum; the creation policy
        // only governs growth beyond that.
        for pool in &self.pools {
            let min = {
                let mut threads = pool.threads.lock().unwrap();
                threads.current += threads.min;
                threads.creating += threads.min;
                threads.min
            };
            for _ in 0..min {
                crate::pool::worker::create_conn_thread(self, pool);
            }
        }

        let driver_settings = self.config.drivers.clone();
        for settings in driver_settings {
            let driver = Driver::start(self.clone(), settings)?;
            self.drivers.lock().unwrap().push(driver);
        }
        log::info!("server {} started", self.name());
        Ok(())
    }

    /// Trigger shutdown: all idle workers are signalled; drivers and
    /// channels stop accepting work.
    pub fn stop(&self) {
        self.pools_state.lock().unwrap().shutdown = true;
        for pool in &self.pools {
            wakeup_conn_threads(pool);
        }
    }

    /// Wait for the drain: per pool until the wait queue is empty and no
    /// workers remain, bounded by the timeout; then join the last worker
    /// and release drivers and channels.
    pub fn wait_server(&self, timeout: Duration) -> Status {
        let deadline = Instant::now() + timeout;
        let mut status = Status::Ok;

        for pool in &self.pools {
            let mut wq = pool.wqueue.lock().unwrap();
            loop {
                let drained = wq.wait.is_empty() && pool.threads.lock().unwrap().current == 0;
                if drained {
                    break;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    status = Status::Timeout;
                    break;
                }
                // Re-check periodically; a notify sent before we started
                // waiting must not cost the full timeout.
                let interval = remaining.min(Duration::from_millis(100));
                let (guard, _result) = pool.wqueue_cond.wait_timeout(wq, interval).unwrap();
                wq = guard;
            }
        }

        if let Some(handle) = self.swap_join_thread(None) {
            let _ = handle.join();
        }

        let drivers: Vec<Driver> = self.drivers.lock().unwrap().drain(..).collect();
        for driver in drivers {
            driver.join();
        }
        self.channels.shutdown();

        if status == Status::Timeout {
            log::warn!("server {}: shutdown drain timed out", self.name());
        }
        status
    }

    /// Reload TLS contexts when a SIGHUP arrived since the last check.
    pub fn reload_certificates_if_requested(&self) {
        if self.tls.take_reload_request() {
            self.tls.reload();
        }
    }
}

// ============================================================================
// test support
// ============================================================================

#[cfg(test)]
impl Server {
    pub fn build_for_tests() -> Arc<Self> {
        Self::build_for_tests_with_config(Config::default())
    }

    pub fn build_for_tests_with_pool(settings: crate::config::PoolSettings) -> Arc<Self> {
        let mut config = Config::default();
        config.pools.insert("default".to_string(), settings);
        Self::build_for_tests_with_config(config)
    }

    pub fn build_for_tests_with_hdrcase(hdrcase: &str) -> Arc<Self> {
        let mut config = Config::default();
        config.server.hdrcase = hdrcase.to_string();
        Self::build_for_tests_with_config(config)
    }

    pub fn build_for_tests_with_config(config: Config) -> Arc<Self> {
        let engine = Arc::new(crate::dispatch::ClosureEngine::constant("1"));
        Self::new(config, engine).expect("test server")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_selection_setup() {
        let mut config = Config::default();
        config.pools.insert(
            "api".to_string(),
            crate::config::PoolSettings {
                map: vec!["GET /api".to_string()],
                ..Default::default()
            },
        );
        let server = Server::build_for_tests_with_config(config);

        assert!(server.pool("api").is_some());
        assert!(server.pool("absent").is_none());
        let urlspace = server.urlspace.read().unwrap();
        assert_eq!(urlspace.lookup("GET", "/api/v1/users"), Some(&"api".to_string()));
        assert_eq!(urlspace.lookup("GET", "/other"), None);
    }

    #[test]
    fn test_conn_ids_are_monotonic() {
        let server = Server::build_for_tests();
        let a = server.next_conn_id();
        let b = server.next_conn_id();
        assert!(b > a);
    }

    #[test]
    fn test_stop_sets_shutdown() {
        let server = Server::build_for_tests();
        assert!(!server.is_shutdown());
        server.stop();
        assert!(server.is_shutdown());
    }
}
