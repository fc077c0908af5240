//! Scenario: a session routine echoing opaque bytes.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use coronet::ServerConfig;

fn echo_callback() -> coronet::ConnectionCallback {
    Arc::new(|conn| {
        if !conn.connected() {
            return;
        }
        let conn = conn.clone();
        coronet::spawn(async move {
            while conn.connected() {
                let mut buf = conn.read().await;
                if buf.readable_bytes() == 0 {
                    break;
                }
                let msg = buf.retrieve_all_as_bytes();
                drop(buf);
                conn.send(&msg);
            }
        });
    })
}

#[test]
fn echo_single_message() {
    let server = common::start_server("echo", ServerConfig::default(), echo_callback());
    let mut client = TcpStream::connect(server.addr()).unwrap();
    client.write_all(b"hello").unwrap();

    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello");
}

#[test]
fn echo_many_messages_in_order() {
    let server = common::start_server("echo-seq", ServerConfig::default(), echo_callback());
    let mut client = TcpStream::connect(server.addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    for i in 0..50u32 {
        let msg = format!("message-{i}");
        client.write_all(msg.as_bytes()).unwrap();
        let mut reply = vec![0u8; msg.len()];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, msg.as_bytes());
    }
}

#[test]
fn echo_concurrent_clients_on_io_pool() {
    let server = common::start_server(
        "echo-pool",
        ServerConfig::builder().thread_num(2).build(),
        echo_callback(),
    );
    let addr = server.addr();

    let clients: Vec<_> = (0..8)
        .map(|i| {
            std::thread::spawn(move || {
                let mut client = TcpStream::connect(addr).unwrap();
                client
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                let msg = format!("client-{i}");
                client.write_all(msg.as_bytes()).unwrap();
                let mut reply = vec![0u8; msg.len()];
                client.read_exact(&mut reply).unwrap();
                assert_eq!(reply, msg.as_bytes());
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }
}
