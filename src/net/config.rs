//! Server configuration.

/// Configuration for [`crate::TcpServer`].
///
/// Controls the reactor fan-out and the socket options applied to the
/// listener and to accepted connections. Use [`ServerConfig::builder`] for
/// ergonomic construction.
///
/// ## Socket options
///
/// - `reuse_port`: SO_REUSEPORT on the listener, letting several server
///   processes share one port
/// - `no_delay`: disables Nagle's algorithm on accepted connections
///   (default on, for lower latency)
/// - `keep_alive`: SO_KEEPALIVE on accepted connections to detect dead
///   peers
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Number of I/O loops in addition to the base loop. Zero runs
    /// everything on the base loop.
    pub thread_num: usize,
    /// Enable SO_REUSEPORT on the listening socket.
    pub reuse_port: bool,
    /// Enable TCP_NODELAY on accepted connections.
    pub no_delay: bool,
    /// Enable SO_KEEPALIVE on accepted connections.
    pub keep_alive: bool,
    /// Listen backlog.
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            thread_num: 0,
            reuse_port: false,
            no_delay: true,
            keep_alive: true,
            backlog: 1024,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

/// Builder for [`ServerConfig`]. Unset fields take the defaults.
#[derive(Default)]
pub struct ServerConfigBuilder {
    thread_num: Option<usize>,
    reuse_port: Option<bool>,
    no_delay: Option<bool>,
    keep_alive: Option<bool>,
    backlog: Option<i32>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread_num(mut self, n: usize) -> Self {
        self.thread_num = Some(n);
        self
    }

    pub fn reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = Some(enabled);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = Some(enabled);
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            thread_num: self.thread_num.unwrap_or(default.thread_num),
            reuse_port: self.reuse_port.unwrap_or(default.reuse_port),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            keep_alive: self.keep_alive.unwrap_or(default.keep_alive),
            backlog: self.backlog.unwrap_or(default.backlog),
        }
    }
}
