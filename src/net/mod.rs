//! TCP networking on top of the event-loop core.
//!
//! # Architecture overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       User Application                       │
//! │  connection callback ──spawns──▶ session routine (async)     │
//! │                                  read/write/drain/….await    │
//! └───────────────┬─────────────────────────┬────────────────────┘
//!                 │                         │ suspension points
//!                 ▼                         ▼
//! ┌───────────────────────────┐  ┌──────────────────────────────┐
//! │         base loop         │  │       io loops (0..N)        │
//! │  Acceptor: accept().await │  │  TcpConnection ↔ Channel     │
//! │  TcpServer dispatch       │  │  buffers, timers, wakers     │
//! └───────────────┬───────────┘  └──────────────┬───────────────┘
//!                 │       round-robin           │
//!                 └───────── run_in_loop ───────┘
//!                 ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │         epoll (level-triggered) + timerfd + eventfd          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The base loop accepts; each accepted connection is pinned to one I/O
//! loop and only ever touched from that loop's thread. The session routine
//! supplied by the user suspends at the connection's await points and is
//! resumed by that loop's ticks.

pub(crate) mod acceptor;
pub mod config;
pub mod connection;
pub mod server;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use connection::{ConnectionCallback, InputBuf, TcpConnection};
pub use server::TcpServer;
