//! Server lifecycle orchestration.
//!
//! The server owns the acceptor, the I/O loop pool and the map of live
//! connections (touched only from the base loop). One long-lived routine
//! on the base loop awaits `accept` forever; each accepted fd is wrapped
//! as a connection pinned to the next I/O loop round-robin and handed to
//! that loop to come up.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::SockRef;

use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::net::acceptor::Acceptor;
use crate::net::config::ServerConfig;
use crate::net::connection::{ConnectionCallback, TcpConnection};
use crate::pool::EventLoopPool;
use crate::task::{sleep, spawn};

/// Multi-reactor TCP server.
///
/// The user supplies a connection callback, invoked on the connection's
/// I/O loop both when it comes up and when it goes down; session routines
/// are typically spawned from the "up" invocation:
///
/// ```no_run
/// use std::sync::Arc;
/// use coronet::{EventLoop, ServerConfig, TcpServer};
///
/// let base = EventLoop::new().unwrap();
/// let server = TcpServer::new(
///     &base,
///     "127.0.0.1:8080".parse().unwrap(),
///     "echo",
///     ServerConfig::builder().thread_num(3).build(),
/// )
/// .unwrap();
/// server.set_connection_callback(Arc::new(|conn| {
///     if conn.connected() {
///         let conn = conn.clone();
///         coronet::spawn(async move {
///             while conn.connected() {
///                 let mut buf = conn.read().await;
///                 if buf.readable_bytes() == 0 {
///                     break;
///                 }
///                 let msg = buf.retrieve_all_as_bytes();
///                 drop(buf);
///                 conn.send(&msg);
///             }
///         });
///     }
/// }));
/// server.start().unwrap();
/// base.run();
/// ```
pub struct TcpServer {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    base: LoopHandle,
    acceptor: Acceptor,
    name: String,
    ip_port: String,
    config: ServerConfig,
    pool: Mutex<EventLoopPool>,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    connection_cb: Mutex<Option<ConnectionCallback>>,
}

impl TcpServer {
    /// Create a server listening on `addr`, accepting on `base`'s thread.
    ///
    /// The socket is bound (and, with `config.reuse_port`, SO_REUSEPORT'd)
    /// immediately so [`TcpServer::local_addr`] works before `start`.
    pub fn new(
        base: &EventLoop,
        addr: SocketAddr,
        name: &str,
        config: ServerConfig,
    ) -> Result<Self> {
        let base = base.handle();
        let acceptor = Acceptor::new(base.clone(), addr, config.reuse_port, config.backlog)?;
        let ip_port = acceptor.local_addr().to_string();
        let mut pool = EventLoopPool::new(base.clone(), name);
        pool.set_thread_num(config.thread_num);
        Ok(TcpServer {
            shared: Arc::new(ServerShared {
                base,
                acceptor,
                name: name.to_string(),
                ip_port,
                config,
                pool: Mutex::new(pool),
                connections: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                connection_cb: Mutex::new(None),
            }),
        })
    }

    /// Number of I/O loops; overrides the config value. Call before
    /// [`TcpServer::start`].
    pub fn set_thread_num(&self, num_threads: usize) {
        self.shared.pool.lock().unwrap().set_thread_num(num_threads);
    }

    /// Callback invoked on connect and disconnect. Call before
    /// [`TcpServer::start`].
    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.shared.connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.acceptor.local_addr()
    }

    /// Live connections. Consistent only from the base loop; elsewhere it
    /// is a snapshot.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }

    /// Start the I/O loops, begin listening, and spawn the acceptor
    /// routine on the base loop. Idempotent: later calls fail with
    /// [`Error::AlreadyStarted`].
    pub fn start(&self) -> Result<()> {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }
        self.shared.pool.lock().unwrap().start()?;

        let shared = self.shared.clone();
        self.shared.base.run_in_loop(move || {
            if let Err(e) = shared.acceptor.listen() {
                tracing::error!(error = %e, "listen failed");
                return;
            }
            tracing::info!(name = %shared.name, addr = %shared.ip_port, "server started");
            let accept_shared = shared.clone();
            spawn(accept_loop(accept_shared));
        });
        Ok(())
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        // Mirror of the accept path: every surviving connection is torn
        // down on its own loop before the pool joins its threads.
        let connections: Vec<Arc<TcpConnection>> = self
            .shared
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            let target = conn.owner_loop();
            target.run_in_loop(move || conn.connect_destroyed());
        }
    }
}

/// The acceptor loop coroutine: awaits `accept` forever, dispatching each
/// new fd. Backoff on fd exhaustion is a plain suspension on the loop's
/// own timer, so the base loop keeps serving while we wait.
async fn accept_loop(shared: Arc<ServerShared>) {
    loop {
        match shared.acceptor.accept().await {
            Ok((fd, peer)) => shared.new_connection(fd, peer),
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                tracing::error!("accept: out of file descriptors, backing off");
                sleep(Duration::from_secs(1)).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // Spurious readiness; go straight back to waiting.
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
            }
        }
    }
}

impl ServerShared {
    /// Runs on the base loop for every accepted fd.
    fn new_connection(self: &Arc<Self>, fd: OwnedFd, peer: SocketAddr) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}#{}", self.name, self.ip_port, id);

        let sock = SockRef::from(&fd);
        if let Err(e) = sock.set_nodelay(self.config.no_delay) {
            tracing::warn!(error = %e, "failed to set TCP_NODELAY");
        }
        if let Err(e) = sock.set_keepalive(self.config.keep_alive) {
            tracing::warn!(error = %e, "failed to set SO_KEEPALIVE");
        }
        let local = sock
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(peer);

        let io_loop = self.pool.lock().unwrap().get_next_loop();
        tracing::info!(name = %name, peer = %peer, "new connection");

        let conn = TcpConnection::new(io_loop.clone(), name.clone(), fd, local, peer);
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            conn.set_connection_callback(cb);
        }
        let server = Arc::downgrade(self);
        conn.set_close_callback(Box::new(move |closed| {
            if let Some(server) = server.upgrade() {
                server.remove_connection(closed);
            }
        }));

        self.connections.lock().unwrap().insert(name, conn.clone());
        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Invoked from the connection's close sequence on its I/O loop; the
    /// map entry is removed on the base loop, then final teardown is
    /// queued back on the connection's loop.
    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let shared = self.clone();
        let conn = conn.clone();
        self.base.run_in_loop(move || {
            tracing::debug!(name = %conn.name(), "removing connection");
            shared.connections.lock().unwrap().remove(conn.name());
            let io_loop = conn.owner_loop();
            let conn = conn.clone();
            io_loop.queue_in_loop(move || conn.connect_destroyed());
        });
    }
}
