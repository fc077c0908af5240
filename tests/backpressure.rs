//! Scenario: a bulk writer throttled by the write suspension point.
//!
//! The session streams ten 1 MiB chunks with a 2 MiB high-water mark. The
//! sum of the returned counts must equal 10 MiB, the output buffer must
//! never hold more than the mark plus one chunk, and the client must see
//! every byte in order.

mod common;

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coronet::ServerConfig;

const MIB: usize = 1024 * 1024;
const CHUNKS: usize = 10;
const HIGH_WATER_MARK: usize = 2 * MIB;

#[test]
fn backpressured_write_delivers_everything_in_order() {
    let written_total = Arc::new(AtomicUsize::new(0));
    let max_pending = Arc::new(AtomicUsize::new(0));
    let written2 = written_total.clone();
    let max2 = max_pending.clone();

    let server = common::start_server(
        "bulk",
        ServerConfig::builder().thread_num(1).build(),
        Arc::new(move |conn| {
            if !conn.connected() {
                return;
            }
            let conn = conn.clone();
            let written = written2.clone();
            let max_pending = max2.clone();
            coronet::spawn(async move {
                for i in 0..CHUNKS {
                    let chunk = vec![b'A' + i as u8; MIB];
                    let n = conn.write(&chunk, HIGH_WATER_MARK).await;
                    written.fetch_add(n, Ordering::SeqCst);
                    max_pending.fetch_max(conn.pending_output_bytes(), Ordering::SeqCst);
                }
                conn.drain().await;
                conn.shutdown();
            });
        }),
    );

    let mut client = TcpStream::connect(server.addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();

    let mut received = Vec::with_capacity(CHUNKS * MIB);
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(e) => panic!("client read failed: {e}"),
        }
    }

    assert_eq!(received.len(), CHUNKS * MIB);
    for (i, window) in received.chunks(MIB).enumerate() {
        let expected = b'A' + i as u8;
        assert!(
            window.iter().all(|&b| b == expected),
            "chunk {i} out of order"
        );
    }

    assert_eq!(written_total.load(Ordering::SeqCst), CHUNKS * MIB);

    // Sampled right after each write resumed: at most the mark plus the
    // chunk that was just accepted.
    let observed = max_pending.load(Ordering::SeqCst);
    assert!(
        observed <= HIGH_WATER_MARK + MIB,
        "output buffer grew to {observed} bytes"
    );
}

#[test]
fn write_returns_zero_after_peer_vanishes() {
    let last_written = Arc::new(AtomicUsize::new(usize::MAX));
    let last2 = last_written.clone();

    let server = common::start_server(
        "bulk-gone",
        ServerConfig::default(),
        Arc::new(move |conn| {
            if !conn.connected() {
                return;
            }
            let conn = conn.clone();
            let last = last2.clone();
            coronet::spawn(async move {
                // Wait for the client to say hello, then for it to vanish.
                let mut buf = conn.read().await;
                buf.retrieve_all();
                drop(buf);
                let gone = conn.read().await;
                assert_eq!(gone.readable_bytes(), 0);
                drop(gone);
                let n = conn.write(b"too late", MIB).await;
                last.store(n, Ordering::SeqCst);
            });
        }),
    );

    let mut client = TcpStream::connect(server.addr()).unwrap();
    use std::io::Write;
    client.write_all(b"hi").unwrap();
    drop(client);

    assert!(
        common::wait_until(Duration::from_secs(5), || {
            last_written.load(Ordering::SeqCst) == 0
        }),
        "write on a dead connection must resolve to 0"
    );
}
