//! Shared harness: run a server on its own base-loop thread and hand the
//! test the pieces it needs to poke it from outside.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use coronet::{ConnectionCallback, EventLoop, LoopHandle, ServerConfig, TcpServer};

pub struct TestServer {
    pub server: TcpServer,
    pub base: LoopHandle,
    thread: Option<JoinHandle<()>>,
}

pub fn start_server(name: &str, config: ServerConfig, cb: ConnectionCallback) -> TestServer {
    let name = name.to_string();
    let (tx, rx) = mpsc::channel();
    let thread = std::thread::spawn(move || {
        let base = EventLoop::new().unwrap();
        let server =
            TcpServer::new(&base, "127.0.0.1:0".parse().unwrap(), &name, config).unwrap();
        server.set_connection_callback(cb);
        server.start().unwrap();
        tx.send((server, base.handle())).unwrap();
        base.run();
    });
    let (server, base) = rx.recv().unwrap();
    TestServer {
        server,
        base,
        thread: Some(thread),
    }
}

impl TestServer {
    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.base.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spin until `predicate` holds or `deadline` elapses.
pub fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
