//! Command surface.
//!
//! The embedded scripting layer is an opaque collaborator: it evaluates
//! callback scripts through [`ScriptEngine`] and calls into the core
//! through [`dispatch`], which implements the `connchan`, `server`,
//! `certctl` and `sls` command families over JSON payloads.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use crate::chan::poller::WhenMask;
use crate::chan::ws;
use crate::error::{Error, Result};
use crate::pool::conn::{Conn, flags};
use crate::server::Server;
use crate::tls::ClientTlsOptions;

// ============================================================================
// Script engine boundary
// ============================================================================

/// Factory for script evaluation contexts. Callbacks run in a freshly
/// allocated context per firing.
pub trait ScriptEngine: Send + Sync {
    fn allocate(&self) -> Box<dyn ScriptContext>;
}

/// One interpreter instance. `eval` receives the script with appended
/// arguments and yields the script result or an error message.
pub trait ScriptContext: Send {
    fn eval(&mut self, script: &str, args: &[&str]) -> std::result::Result<String, String>;
}

/// Engine backed by a plain function; the embedder's integration point and
/// the test harness.
pub struct ClosureEngine {
    f: Arc<dyn Fn(&str, &[&str]) -> std::result::Result<String, String> + Send + Sync>,
}

impl ClosureEngine {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, &[&str]) -> std::result::Result<String, String> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Engine whose scripts always yield the given result.
    pub fn constant(result: &str) -> Self {
        let result = result.to_string();
        Self::new(move |_script, _args| Ok(result.clone()))
    }
}

impl ScriptEngine for ClosureEngine {
    fn allocate(&self) -> Box<dyn ScriptContext> {
        Box::new(ClosureContext { f: self.f.clone() })
    }
}

struct ClosureContext {
    f: Arc<dyn Fn(&str, &[&str]) -> std::result::Result<String, String> + Send + Sync>,
}

impl ScriptContext for ClosureContext {
    fn eval(&mut self, script: &str, args: &[&str]) -> std::result::Result<String, String> {
        (self.f)(script, args)
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Per-invocation context: commands like `connchan detach` and `sls`
/// operate on the current connection.
#[derive(Default)]
pub struct CommandCtx<'a> {
    pub conn: Option<&'a mut Conn>,
}

/// Entry point for the command families. Returns the command payload;
/// errors carry the structured code via [`Error::error_code`].
pub fn dispatch(server: &Arc<Server>, ctx: &mut CommandCtx<'_>, argv: &[&str]) -> Result<Value> {
    match argv {
        ["connchan", rest @ ..] => connchan_cmd(server, ctx, rest),
        ["server", rest @ ..] => server_cmd(server, rest),
        ["certctl", rest @ ..] => certctl_cmd(server, rest),
        ["sls", rest @ ..] => sls_cmd(ctx, rest),
        [unknown, ..] => Err(Error::Command(format!("unknown command \"{unknown}\""))),
        [] => Err(Error::Command("missing command".to_string())),
    }
}

fn bad_args(usage: &str) -> Error {
    Error::Command(format!("wrong # args: should be \"{usage}\""))
}

fn parse_secs(text: &str, what: &str) -> Result<Duration> {
    text.parse::<f64>()
        .map(Duration::from_secs_f64)
        .map_err(|_| Error::Command(format!("invalid {what} '{text}'")))
}

fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

// ============================================================================
// connchan
// ============================================================================

fn connchan_cmd(server: &Arc<Server>, ctx: &mut CommandCtx<'_>, argv: &[&str]) -> Result<Value> {
    let channels = server.channels();
    match argv {
        ["open", rest @ ..] => connchan_open(server, rest),
        ["connect", rest @ ..] => connchan_connect(server, rest),
        ["listen", rest @ ..] => connchan_listen(server, rest),
        ["detach"] => {
            let conn = ctx
                .conn
                .as_deref_mut()
                .ok_or_else(|| Error::Command("no current connection".to_string()))?;
            let sock = conn
                .sock
                .take()
                .ok_or_else(|| Error::Command("connection already closed".to_string()))?;
            conn.flags |= flags::CLOSED;
            let name = channels.adopt(sock, None, true, None);
            Ok(Value::String(name))
        }
        ["read", rest @ ..] => {
            let (mut websocket, mut name) = (false, None);
            for arg in rest {
                match *arg {
                    "-websocket" => websocket = true,
                    other if name.is_none() => name = Some(other),
                    _ => return Err(bad_args("connchan read ?-websocket? channel")),
                }
            }
            let name = name.ok_or_else(|| bad_args("connchan read ?-websocket? channel"))?;
            if websocket {
                let frame = channels.read_websocket(name)?;
                let mut dict = json!({
                    "frame": frame.status.as_str(),
                    "fin": frame.fin as i32,
                    "bytes": frame.bytes,
                    "unprocessed": frame.unprocessed,
                    "fragments": frame.fragments,
                    "havedata": frame.havedata as i32,
                });
                if let Some(opcode) = frame.opcode {
                    dict["opcode"] = json!(opcode);
                }
                if let Some(payload) = frame.payload {
                    dict["payload"] = Value::String(String::from_utf8_lossy(&payload).into_owned());
                }
                Ok(dict)
            } else {
                let bytes = channels.read(name)?;
                Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            }
        }
        ["write", name, data] => {
            let sent = channels.write(name, data.as_bytes())?;
            Ok(json!(sent))
        }
        ["callback", rest @ ..] => connchan_callback(server, rest),
        ["close", name] => {
            channels.close(name)?;
            Ok(Value::Null)
        }
        ["exists", name] => Ok(json!(channels.exists(name) as i32)),
        ["list", ..] => Ok(Value::Array(channels.list())),
        ["status", rest @ ..] => match rest {
            [name] | ["-server", _, name] => channels.status(name),
            _ => Err(bad_args("connchan status ?-server s? channel")),
        },
        ["wsencode", rest @ ..] => connchan_wsencode(rest),
        _ => Err(Error::Command(
            "connchan: expected open, connect, listen, detach, read, write, callback, \
             close, exists, list, status or wsencode"
                .to_string(),
        )),
    }
}

fn tls_opt(opts: &mut ClientTlsOptions, flag: &str, value: &str) -> bool {
    match flag {
        "-cafile" => opts.cafile = Some(PathBuf::from(value)),
        "-capath" => opts.capath = Some(PathBuf::from(value)),
        "-cert" => opts.cert = Some(PathBuf::from(value)),
        "-insecure" => opts.insecure = parse_bool(value).unwrap_or(true),
        _ => return false,
    }
    true
}

fn connchan_open(server: &Arc<Server>, argv: &[&str]) -> Result<Value> {
    let usage = "connchan open ?options? url";
    let mut method = "GET".to_string();
    let mut version = "1.0".to_string();
    let mut timeout = Duration::from_secs(1);
    let mut tls = ClientTlsOptions::default();
    let mut hostname = None;
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut url = None;

    let mut i = 0;
    while i < argv.len() {
        let arg = argv[i];
        let value = |i: usize| -> Result<&str> {
            argv.get(i + 1).copied().ok_or_else(|| bad_args(usage))
        };
        match arg {
            "-method" => {
                method = value(i)?.to_string();
                i += 2;
            }
            "-version" => {
                version = value(i)?.to_string();
                i += 2;
            }
            "-timeout" => {
                timeout = parse_secs(value(i)?, "timeout")?;
                i += 2;
            }
            "-hostname" => {
                hostname = Some(value(i)?.to_string());
                i += 2;
            }
            "-driver" => {
                i += 2; // accepted for compatibility; scheme selects TLS
            }
            "-unix_socket" => {
                return Err(Error::Command("unix domain sockets are not supported".to_string()));
            }
            "-headers" => {
                let parsed: Value = serde_json::from_str(value(i)?)
                    .map_err(|e| Error::Command(format!("invalid headers: {e}")))?;
                if let Value::Object(map) = parsed {
                    for (k, v) in map {
                        headers.push((k, v.as_str().unwrap_or_default().to_string()));
                    }
                }
                i += 2;
            }
            flag if flag.starts_with('-') => {
                let v = value(i)?;
                if !tls_opt(&mut tls, flag, v) {
                    return Err(Error::Command(format!("unknown option '{flag}'")));
                }
                i += 2;
            }
            _ if url.is_none() => {
                url = Some(arg);
                i += 1;
            }
            _ => return Err(bad_args(usage)),
        }
    }
    let url = url.ok_or_else(|| bad_args(usage))?;

    let name = server.channels().open(
        url,
        &method,
        &version,
        &headers,
        &tls,
        hostname.as_deref(),
        timeout,
    )?;
    Ok(Value::String(name))
}

fn connchan_connect(server: &Arc<Server>, argv: &[&str]) -> Result<Value> {
    let usage = "connchan connect ?options? host port";
    let mut use_tls = false;
    let mut timeout = Duration::from_secs(1);
    let mut tls = ClientTlsOptions::default();
    let mut hostname: Option<String> = None;
    let mut positional: Vec<&str> = Vec::new();

    let mut i = 0;
    while i < argv.len() {
        let arg = argv[i];
        let value = |i: usize| -> Result<&str> {
            argv.get(i + 1).copied().ok_or_else(|| bad_args(usage))
        };
        match arg {
            "-tls" => {
                use_tls = parse_bool(value(i)?).unwrap_or(false);
                i += 2;
            }
            "-timeout" => {
                timeout = parse_secs(value(i)?, "timeout")?;
                i += 2;
            }
            "-hostname" => {
                hostname = Some(value(i)?.to_string());
                i += 2;
            }
            flag if flag.starts_with('-') => {
                let v = value(i)?;
                if !tls_opt(&mut tls, flag, v) {
                    return Err(Error::Command(format!("unknown option '{flag}'")));
                }
                i += 2;
            }
            _ => {
                positional.push(arg);
                i += 1;
            }
        }
    }
    let [host, port] = positional[..] else {
        return Err(bad_args(usage));
    };
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Command(format!("invalid port '{port}'")))?;

    let name = if use_tls && hostname.is_some() {
        // SNI override requires the open-style dial path.
        server.channels().open(
            &format!("https://{host}:{port}/"),
            "GET",
            "1.0",
            &[],
            &tls,
            hostname.as_deref(),
            timeout,
        )?
    } else {
        server.channels().connect(host, port, use_tls, &tls, timeout)?
    };
    Ok(Value::String(name))
}

fn connchan_listen(server: &Arc<Server>, argv: &[&str]) -> Result<Value> {
    let usage = "connchan listen ?-driver d? ?-server s? ?-bind? addr port script";
    let mut positional: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < argv.len() {
        match argv[i] {
            "-driver" | "-server" => i += 2,
            "-bind" => i += 1,
            arg => {
                positional.push(arg);
                i += 1;
            }
        }
    }
    let [addr, port, script] = positional[..] else {
        return Err(bad_args(usage));
    };
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Command(format!("invalid port '{port}'")))?;
    server
        .channels()
        .listen(server.engine().clone(), addr, port, script)
}

fn connchan_callback(server: &Arc<Server>, argv: &[&str]) -> Result<Value> {
    let usage = "connchan callback ?-timeout t? ?-receivetimeout t? ?-sendtimeout t? \
                 channel script when";
    let mut poll_timeout = None;
    let mut recv_timeout = None;
    let mut send_timeout = None;
    let mut positional: Vec<&str> = Vec::new();

    let mut i = 0;
    while i < argv.len() {
        let value = |i: usize| -> Result<&str> {
            argv.get(i + 1).copied().ok_or_else(|| bad_args(usage))
        };
        match argv[i] {
            "-timeout" => {
                poll_timeout = Some(parse_secs(value(i)?, "timeout")?);
                i += 2;
            }
            "-receivetimeout" => {
                recv_timeout = Some(parse_secs(value(i)?, "receivetimeout")?);
                i += 2;
            }
            "-sendtimeout" => {
                send_timeout = Some(parse_secs(value(i)?, "sendtimeout")?);
                i += 2;
            }
            arg => {
                positional.push(arg);
                i += 1;
            }
        }
    }
    let [channel, script, when] = positional[..] else {
        return Err(bad_args(usage));
    };
    let when = WhenMask::parse(when)
        .ok_or_else(|| Error::Command(format!("invalid when specification '{when}'")))?;
    server.channels().register_callback(
        channel,
        script,
        when,
        poll_timeout,
        recv_timeout,
        send_timeout,
    )?;
    Ok(Value::Null)
}

fn connchan_wsencode(argv: &[&str]) -> Result<Value> {
    let usage = "connchan wsencode ?-binary? ?-fin 0|1? ?-mask? ?-opcode opcode? message";
    let mut fin = true;
    let mut mask = false;
    let mut opcode = ws::OPCODE_TEXT;
    let mut message = None;

    let mut i = 0;
    while i < argv.len() {
        match argv[i] {
            "-binary" => {
                opcode = ws::OPCODE_BINARY;
                i += 1;
            }
            "-fin" => {
                let v = argv.get(i + 1).copied().ok_or_else(|| bad_args(usage))?;
                fin = v == "1";
                i += 2;
            }
            "-mask" => {
                // Flag or explicit boolean value.
                match argv.get(i + 1).and_then(|v| parse_bool(v)) {
                    Some(value) => {
                        mask = value;
                        i += 2;
                    }
                    None => {
                        mask = true;
                        i += 1;
                    }
                }
            }
            "-opcode" => {
                let v = argv.get(i + 1).copied().ok_or_else(|| bad_args(usage))?;
                opcode = ws::opcode_from_name(v)
                    .ok_or_else(|| Error::Command(format!("invalid opcode '{v}'")))?;
                i += 2;
            }
            arg if message.is_none() => {
                message = Some(arg);
                i += 1;
            }
            _ => return Err(bad_args(usage)),
        }
    }
    let message = message.ok_or_else(|| bad_args(usage))?;
    let frame = ws::encode(message.as_bytes(), opcode, fin, mask);
    Ok(Value::String(BASE64.encode(frame)))
}

// ============================================================================
// server
// ============================================================================

fn server_cmd(server: &Arc<Server>, argv: &[&str]) -> Result<Value> {
    // Optional pool selector before the subcommand.
    let (pool, argv) = match argv {
        ["-pool", name, rest @ ..] => {
            let pool = server
                .pool(name)
                .ok_or_else(|| Error::Command(format!("no pool '{name}'")))?;
            (pool, rest)
        }
        _ => (server.default_pool(), argv),
    };

    match argv {
        ["pools"] => Ok(Value::Array(
            server
                .pools()
                .iter()
                .map(|p| Value::String(p.name.clone()))
                .collect(),
        )),
        ["maxthreads"] => Ok(json!(pool.threads.lock().unwrap().max)),
        ["maxthreads", v] => {
            let max: usize = v
                .parse()
                .map_err(|_| Error::Command(format!("invalid maxthreads '{v}'")))?;
            let mut threads = pool.threads.lock().unwrap();
            if max < threads.min {
                return Err(Error::Command(format!(
                    "maxthreads {max} must not be below minthreads {}",
                    threads.min
                )));
            }
            threads.max = max;
            Ok(json!(max))
        }
        ["minthreads"] => Ok(json!(pool.threads.lock().unwrap().min)),
        ["minthreads", v] => {
            let min: usize = v
                .parse()
                .map_err(|_| Error::Command(format!("invalid minthreads '{v}'")))?;
            let mut threads = pool.threads.lock().unwrap();
            if min > threads.max {
                return Err(Error::Command(format!(
                    "minthreads {min} must not exceed maxthreads {}",
                    threads.max
                )));
            }
            threads.min = min;
            Ok(json!(min))
        }
        ["active"] | ["active", "-checkforproxy"] => Ok(Value::Array(pool.active_conns())),
        ["queued"] => Ok(Value::Array(pool.queued_conns())),
        ["all"] | ["all", "-checkforproxy"] => {
            let mut all = pool.active_conns();
            all.extend(pool.queued_conns());
            Ok(Value::Array(all))
        }
        ["waiting"] => Ok(json!(pool.waiting())),
        ["stats"] => Ok(pool.stats_value()),
        ["threads"] => Ok(pool.threads_value()),
        ["connectionratelimit"] => Ok(json!(pool.rate.lock().unwrap().default_connection_limit)),
        ["connectionratelimit", v] => {
            let limit: i64 = v
                .parse()
                .map_err(|_| Error::Command(format!("invalid rate limit '{v}'")))?;
            pool.rate.lock().unwrap().default_connection_limit = limit;
            Ok(json!(limit))
        }
        ["poolratelimit"] => Ok(json!(pool.rate.lock().unwrap().pool_limit)),
        ["poolratelimit", v] => {
            let limit: i64 = v
                .parse()
                .map_err(|_| Error::Command(format!("invalid rate limit '{v}'")))?;
            pool.rate.lock().unwrap().pool_limit = limit;
            Ok(json!(limit))
        }
        ["map", rest @ ..] => {
            let (noinherit, spec) = match rest {
                ["-noinherit", spec] => (true, spec),
                [spec] => (false, spec),
                _ => return Err(bad_args("server map ?-noinherit? mapspec")),
            };
            let (method, url) = crate::urlspace::parse_mapspec(spec)?;
            server
                .urlspace
                .write()
                .unwrap()
                .map(&method, &url, !noinherit, pool.name.clone());
            Ok(Value::Null)
        }
        ["unmap", rest @ ..] => {
            let (noinherit, spec) = match rest {
                ["-noinherit", spec] => (true, spec),
                [spec] => (false, spec),
                _ => return Err(bad_args("server unmap ?-noinherit? mapspec")),
            };
            let (method, url) = crate::urlspace::parse_mapspec(spec)?;
            let existed = server.urlspace.write().unwrap().unmap(&method, &url, !noinherit);
            Ok(json!(existed as i32))
        }
        ["mapped", rest @ ..] => {
            let mut exact = false;
            let mut all = false;
            let mut noinherit = false;
            let mut spec = None;
            for arg in rest {
                match *arg {
                    "-exact" => exact = true,
                    "-all" => all = true,
                    "-noinherit" => noinherit = true,
                    other if spec.is_none() => spec = Some(other),
                    _ => return Err(bad_args("server mapped ?-exact? ?-all? ?-noinherit? mapspec")),
                }
            }
            let spec = spec.ok_or_else(|| bad_args("server mapped ?options? mapspec"))?;
            let (method, url) = crate::urlspace::parse_mapspec(spec)?;
            let urlspace = server.urlspace.read().unwrap();
            let hits = urlspace.mapped(&method, &url, exact, all, noinherit);
            Ok(Value::Array(
                hits.into_iter()
                    .map(|e| json!([e.method, e.path, e.inherit, e.data]))
                    .collect(),
            ))
        }
        _ => Err(Error::Command(
            "server: expected pools, maxthreads, minthreads, active, queued, all, waiting, \
             stats, threads, map, unmap, mapped, connectionratelimit or poolratelimit"
                .to_string(),
        )),
    }
}

// ============================================================================
// certctl / sls
// ============================================================================

fn certctl_cmd(server: &Arc<Server>, argv: &[&str]) -> Result<Value> {
    match argv {
        ["list"] => Ok(Value::Array(
            server.tls().list().into_iter().map(Value::String).collect(),
        )),
        ["reload"] => {
            server.tls().reload();
            Ok(Value::Null)
        }
        _ => Err(Error::Command("certctl: expected list or reload".to_string())),
    }
}

fn sls_cmd(ctx: &mut CommandCtx<'_>, argv: &[&str]) -> Result<Value> {
    let conn = ctx
        .conn
        .as_deref_mut()
        .ok_or_else(|| Error::Command("no current connection".to_string()))?;
    let sock = conn
        .sock
        .as_mut()
        .ok_or_else(|| Error::Command("connection already closed".to_string()))?;

    match argv {
        ["array"] => {
            let mut out = Vec::new();
            for (key, value) in sock.sls.keyed_pairs() {
                out.push(Value::String(key));
                out.push(Value::String(value));
            }
            Ok(Value::Array(out))
        }
        ["get", key] => match sock.sls.keyed_get(key) {
            Some(value) => Ok(Value::String(value.to_string())),
            None => Err(Error::Command(format!("key \"{key}\" does not exist"))),
        },
        ["get", key, default] => Ok(Value::String(
            sock.sls.keyed_get(key).unwrap_or(default).to_string(),
        )),
        ["set", key, value] => {
            sock.sls.keyed_set(key, value);
            Ok(Value::String((*value).to_string()))
        }
        ["unset", key] => {
            if !sock.sls.keyed_unset(key) {
                return Err(Error::Command(format!("key \"{key}\" does not exist")));
            }
            Ok(Value::Null)
        }
        _ => Err(Error::Command("sls: expected array, get, set or unset".to_string())),
    }
}
