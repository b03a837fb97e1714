//! tidepool: a multi-threaded, TLS-capable HTTP connection-server core.
//!
//! The crate couples a connection pool scheduler (bounded worker pools
//! with admission control and direct condvar handoff) with a
//! connection-channel engine (long-lived scriptable socket handles with
//! stable-buffer TLS retransmission and WebSocket framing). The embedded
//! scripting layer stays behind the [`dispatch::ScriptEngine`] trait; the
//! command surface lives in [`dispatch`].

pub mod chan;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod headers;
pub mod pool;
pub mod runner;
pub mod server;
pub mod sock;
pub mod tls;
pub mod urlspace;

#[cfg(test)]
mod tests;

pub use chan::{Channels, ConnChan};
pub use config::Config;
pub use dispatch::{ClosureEngine, CommandCtx, ScriptEngine, dispatch};
pub use error::{Error, Result, Status};
pub use headers::Headers;
pub use pool::conn::Conn;
pub use server::Server;
pub use sock::{Sock, SockState};
