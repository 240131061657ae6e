//! Minimal duplex demo — a backend streams a greeting to the client while
//! the client pushes a reply back.
//!
//! Run with:
//!   cargo run --example echo

use byteduct::{duplex, DuplexConfig, ReadBuffer, TaskQueue, WriteBuffer};
use bytes::Bytes;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let tasks = TaskQueue::new();

    // Pull direction: the backend produces this payload as credit allows.
    let payload = b"hello from the backend".to_vec();
    let mut offset = 0usize;
    let producer = move |mut buf: WriteBuffer| {
        let n = (payload.len() - offset).min(buf.len());
        buf.as_mut_slice()[..n].copy_from_slice(&payload[offset..offset + n]);
        offset += n;
        buf.done(n);
    };

    // Push direction: the backend consumes whatever the client sends.
    let consumer = |buf: ReadBuffer| {
        eprintln!("backend got: {}", String::from_utf8_lossy(&buf));
        let n = buf.len();
        buf.done(n);
    };

    let (client, _backend) = duplex(
        &tasks,
        DuplexConfig::default(),
        producer,
        |code| eprintln!("backend source failed: {code}"),
        consumer,
    );

    client
        .receiver
        .receive(
            |buf| {
                eprintln!("client got: {}", String::from_utf8_lossy(&buf));
                let n = buf.len();
                buf.done(n);
            },
            |code| eprintln!("client receive failed: {code}"),
        )
        .expect("fresh connection accepts a receive");

    client
        .sender
        .send(
            Bytes::from_static(b"loud and clear"),
            |n| eprintln!("reply delivered, {n} bytes"),
            |n, code| eprintln!("reply failed after {n} bytes: {code}"),
        )
        .expect("fresh connection accepts a send");

    // Single-threaded: everything above happens during this pump.
    tasks.run_until_idle();
}
