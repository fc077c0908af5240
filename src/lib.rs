//! coronet — a multi-reactor TCP server framework where every connection's
//! lifecycle is a user-written suspendable routine instead of a callback
//! chain.
//!
//! One base loop accepts; N I/O loops own disjoint sets of connections.
//! Inside a session routine the connection exposes a family of suspension
//! points — `read`, `read_with_timeout`, `drain`, `write`, `send_file` —
//! plus the free function [`sleep`]; each one registers the routine's waker
//! on the connection's channel and/or the loop's timer queue and is resumed
//! by the owning loop's next tick.
//!
//! ```no_run
//! use std::sync::Arc;
//! use coronet::{EventLoop, ServerConfig, TcpServer};
//!
//! fn main() -> coronet::Result<()> {
//!     let base = EventLoop::new()?;
//!     let server = TcpServer::new(
//!         &base,
//!         "0.0.0.0:8080".parse().unwrap(),
//!         "echo",
//!         ServerConfig::builder().thread_num(3).build(),
//!     )?;
//!     server.set_connection_callback(Arc::new(|conn| {
//!         if !conn.connected() {
//!             return;
//!         }
//!         let conn = conn.clone();
//!         coronet::spawn(async move {
//!             while conn.connected() {
//!                 let mut buf = conn.read().await;
//!                 if buf.readable_bytes() == 0 {
//!                     break;
//!                 }
//!                 let msg = buf.retrieve_all_as_bytes();
//!                 drop(buf);
//!                 conn.send(&msg);
//!             }
//!         });
//!     }));
//!     server.start()?;
//!     base.run();
//!     Ok(())
//! }
//! ```
//!
//! Linux-only: the core sits directly on level-triggered epoll, timerfd
//! and eventfd.

pub mod buffer;
mod channel;
pub mod error;
mod event_loop;
pub mod net;
mod poller;
mod pool;
mod task;
mod timer;

pub use buffer::{Buffer, FillResult};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle};
pub use net::{ConnectionCallback, InputBuf, ServerConfig, ServerConfigBuilder, TcpConnection, TcpServer};
pub use pool::EventLoopPool;
pub use task::{sleep, spawn, Sleep};
pub use timer::TimerId;
