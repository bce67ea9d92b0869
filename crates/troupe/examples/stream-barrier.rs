//! Synchronized stream demo — one publisher, two subscribers, in-process.
//!
//! Run with:
//!   cargo run --example stream-barrier
//!
//! The publisher blocks until both subscribers have handshaken and
//! announced themselves, then streams a few samples and ends the stream.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use troupe::coms::mem::{MemoryLessor, MemoryStore, StatusHub};
use troupe::coms::{AppIdentity, Context, PeerApp, Publisher, Subscriber};
use troupe::transport::Endpoint;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = MemoryStore::new();
    let lessor = MemoryLessor::ephemeral();
    let hub = Arc::new(StatusHub::new());

    let producer_ctx = Context::new(
        AppIdentity::new("producer", 1, Endpoint::new("127.0.0.1", 7000)),
        store.scoped(1),
        lessor.clone(),
        hub.clone(),
    );

    let mut publisher = Publisher::create(producer_ctx.clone(), "measurements", 2);
    publisher.init()?;
    eprintln!("publisher bound on port {:?}", publisher.port());

    let mut consumers = Vec::new();
    for id in 0..2u32 {
        let ctx = Context::new(
            AppIdentity::new("consumer", 10 + id, Endpoint::new("127.0.0.1", 7000)),
            store.scoped(10 + id),
            lessor.clone(),
            hub.clone(),
        );
        let peer = PeerApp::new(
            "producer",
            1,
            producer_ctx.app().endpoint.clone(),
            producer_ctx.directory().clone(),
        );
        consumers.push(thread::spawn(move || {
            let mut subscriber = Subscriber::create(ctx, peer, "measurements");
            subscriber.set_timeout(Some(Duration::from_secs(10)));
            subscriber.init().expect("subscriber init");
            while let Some(payload) = subscriber.receive().expect("receive") {
                eprintln!("consumer {id}: {}", String::from_utf8_lossy(&payload));
            }
            subscriber.terminate();
        }));
    }

    if !publisher.wait_for_subscribers() {
        eprintln!("canceled before both subscribers arrived");
        return Ok(());
    }
    eprintln!("both subscribers are in, streaming");

    for sample in ["3.2", "3.5", "2.9"] {
        publisher.send(sample.as_bytes())?;
    }
    publisher.send_end()?;

    for consumer in consumers {
        consumer.join().unwrap();
    }
    publisher.terminate();
    Ok(())
}
