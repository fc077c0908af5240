//! Demo server: one session routine per connection, driven by line
//! commands. Everything in here is example user code on top of the
//! framework; the core contract is opaque byte streams.
//!
//! Commands:
//!   load            stream 16 MiB through send() + drain() flow control
//!   bigwrite        stream 10 MiB through the back-pressured write()
//!   sleep           suspend the session for a second, then answer
//!   timeout         wait up to 5 s for more data, report what happened
//!   file <path>     sendfile the given file to the client
//!   quit            server-side half close
//!   anything else   echoed back

use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use coronet::{EventLoop, ServerConfig, TcpConnection, TcpServer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const MIB: usize = 1024 * 1024;

fn session(conn: Arc<TcpConnection>) -> impl std::future::Future<Output = ()> {
    async move {
        tracing::info!(name = conn.name(), "session started");
        while conn.connected() {
            let mut buf = conn.read().await;
            if buf.readable_bytes() == 0 {
                if conn.disconnected() {
                    break;
                }
                continue;
            }
            let msg = buf.retrieve_all_as_string();
            drop(buf);
            let command = msg.trim_end();

            match command {
                "load" => {
                    // Flow control the original way: fire-and-forget sends,
                    // draining whenever the backlog passes 10 MiB.
                    let chunk = vec![b'X'; MIB];
                    for _ in 0..16 {
                        if !conn.connected() {
                            break;
                        }
                        conn.send(&chunk);
                        if conn.pending_output_bytes() > 10 * MIB {
                            conn.drain().await;
                        }
                    }
                    tracing::info!(name = conn.name(), "load finished");
                }
                "bigwrite" => {
                    // Flow control the framework way: the write suspension
                    // point throttles at the high-water mark.
                    let chunk = vec![b'Y'; MIB];
                    let mut total = 0usize;
                    for _ in 0..10 {
                        total += conn.write(&chunk, 2 * MIB).await;
                    }
                    tracing::info!(name = conn.name(), total, "bigwrite finished");
                }
                "sleep" => {
                    coronet::sleep(Duration::from_secs(1)).await;
                    conn.send(b"awake\n");
                }
                "timeout" => {
                    let (mut buf, timed_out) = conn.read_with_timeout(Duration::from_secs(5)).await;
                    if timed_out {
                        conn.send(b"timed out\n");
                    } else {
                        let late = buf.retrieve_all_as_string();
                        drop(buf);
                        conn.send(format!("got: {late}").as_bytes());
                    }
                }
                "quit" => {
                    conn.send(b"bye\n");
                    conn.shutdown();
                }
                _ if command.starts_with("file ") => {
                    let path = &command[5..];
                    match File::open(path) {
                        Ok(file) => {
                            let len = file.metadata().map(|m| m.len()).unwrap_or(0);
                            let sent = conn.send_file(&file, 0, len).await;
                            tracing::info!(name = conn.name(), path, sent, "file sent");
                        }
                        Err(e) => {
                            conn.send(format!("cannot open {path}: {e}\n").as_bytes());
                        }
                    }
                }
                _ => {
                    conn.send(msg.as_bytes());
                }
            }
        }
        tracing::info!(name = conn.name(), "session ended");
    }
}

fn main() -> coronet::Result<()> {
    // Log sink: non-blocking file appender behind the tracing pipeline,
    // flushed by the guard on exit.
    std::fs::create_dir_all("logs").ok();
    let file_appender = tracing_appender::rolling::never("logs", "coronet-demo.log");
    let (writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let base = EventLoop::new()?;
    let server = TcpServer::new(
        &base,
        format!("0.0.0.0:{port}").parse().unwrap(),
        "EchoServer",
        ServerConfig::builder().thread_num(3).build(),
    )?;
    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            tracing::info!(peer = %conn.peer_addr(), "connection up");
            let conn = conn.clone();
            coronet::spawn(session(conn));
        } else {
            tracing::info!(peer = %conn.peer_addr(), "connection down");
        }
    }));
    server.start()?;

    println!("coronet demo server listening on port {port}");
    base.run();
    Ok(())
}
