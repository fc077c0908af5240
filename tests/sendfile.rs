//! Scenario: an in-kernel file transfer that never touches the output
//! buffer.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coronet::ServerConfig;

const FILE_SIZE: usize = 2 * 1024 * 1024;

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn temp_file(name: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("coronet-{}-{}", std::process::id(), name));
    std::fs::File::create(&path)
        .unwrap()
        .write_all(contents)
        .unwrap();
    path
}

#[test]
fn sendfile_transfers_exact_bytes() {
    let contents = patterned(FILE_SIZE);
    let path = temp_file("sendfile", &contents);

    let sent = Arc::new(AtomicU64::new(u64::MAX));
    let buffered = Arc::new(AtomicUsize::new(0));
    let sent2 = sent.clone();
    let buffered2 = buffered.clone();
    let path2 = path.clone();

    let server = common::start_server(
        "sendfile",
        ServerConfig::builder().thread_num(1).build(),
        Arc::new(move |conn| {
            if !conn.connected() {
                return;
            }
            let conn = conn.clone();
            let sent = sent2.clone();
            let buffered = buffered2.clone();
            let path = path2.clone();
            coronet::spawn(async move {
                let file = std::fs::File::open(&path).unwrap();
                let n = conn.send_file(&file, 0, FILE_SIZE as u64).await;
                buffered.fetch_max(conn.pending_output_bytes(), Ordering::SeqCst);
                sent.store(n, Ordering::SeqCst);
                conn.shutdown();
            });
        }),
    );

    let mut client = TcpStream::connect(server.addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();
    let mut received = Vec::with_capacity(FILE_SIZE);
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(e) => panic!("client read failed: {e}"),
        }
    }

    assert_eq!(received.len(), FILE_SIZE);
    assert_eq!(received, contents);
    assert_eq!(sent.load(Ordering::SeqCst), FILE_SIZE as u64);
    // In-kernel copy: nothing may pass through the application buffer.
    assert_eq!(buffered.load(Ordering::SeqCst), 0);

    std::fs::remove_file(path).ok();
}

#[test]
fn sendfile_with_offset_and_partial_count() {
    let contents = patterned(8192);
    let path = temp_file("sendfile-window", &contents);

    let server = common::start_server(
        "sendfile-window",
        ServerConfig::default(),
        Arc::new({
            let path = path.clone();
            move |conn| {
                if !conn.connected() {
                    return;
                }
                let conn = conn.clone();
                let path = path.clone();
                coronet::spawn(async move {
                    let file = std::fs::File::open(&path).unwrap();
                    let n = conn.send_file(&file, 1024, 4096).await;
                    assert_eq!(n, 4096);
                    conn.shutdown();
                });
            }
        }),
    );

    let mut client = TcpStream::connect(server.addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();
    assert_eq!(received, &contents[1024..1024 + 4096]);

    std::fs::remove_file(path).ok();
}

#[test]
fn sendfile_of_zero_bytes_completes_immediately() {
    let path = temp_file("sendfile-empty", b"irrelevant");

    let server = common::start_server(
        "sendfile-empty",
        ServerConfig::default(),
        Arc::new({
            let path = path.clone();
            move |conn| {
                if !conn.connected() {
                    return;
                }
                let conn = conn.clone();
                let path = path.clone();
                coronet::spawn(async move {
                    let file = std::fs::File::open(&path).unwrap();
                    let n = conn.send_file(&file, 0, 0).await;
                    assert_eq!(n, 0);
                    conn.shutdown();
                });
            }
        }),
    );

    let mut client = TcpStream::connect(server.addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();
    assert!(received.is_empty());

    std::fs::remove_file(path).ok();
}
