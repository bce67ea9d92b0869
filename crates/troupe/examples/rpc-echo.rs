//! Request/reply demo — an echo responder and one requester, in-process.
//!
//! Run with:
//!   cargo run --example rpc-echo

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use troupe::coms::mem::{MemoryLessor, MemoryStore, StatusHub};
use troupe::coms::{AppIdentity, Context, PeerApp, Requester, Responder};
use troupe::transport::Endpoint;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = MemoryStore::new();
    let lessor = MemoryLessor::ephemeral();
    let hub = Arc::new(StatusHub::new());

    let server_ctx = Context::new(
        AppIdentity::new("server", 1, Endpoint::new("127.0.0.1", 7000)),
        store.scoped(1),
        lessor.clone(),
        hub.clone(),
    );

    let mut responder = Responder::create(server_ctx.clone(), "echo");
    responder.init()?;
    let server_cancel = responder.cancel_handle();

    let server = thread::spawn(move || {
        while let Some(mut request) = responder.receive().expect("receive") {
            eprintln!(
                "request from {} (id {}): {}",
                request.requester_name(),
                request.requester_id(),
                String::from_utf8_lossy(request.payload()),
            );
            let mut answer = request.payload().to_vec();
            answer.reverse();
            request.reply(&answer).expect("reply");
        }
        responder.terminate();
    });

    let client_ctx = Context::new(
        AppIdentity::new("client", 2, Endpoint::new("127.0.0.1", 7000)),
        store.scoped(2),
        lessor.clone(),
        hub.clone(),
    );
    let peer = PeerApp::new(
        "server",
        1,
        server_ctx.app().endpoint.clone(),
        server_ctx.directory().clone(),
    );

    let mut requester = Requester::create(client_ctx, peer, "echo");
    requester.set_timeout(Some(Duration::from_secs(5)));
    requester.init()?;

    requester.send(b"troupe")?;
    match requester.receive()? {
        Some(response) => eprintln!("response: {}", String::from_utf8_lossy(&response)),
        None => eprintln!("no response (timed out: {})", requester.has_timed_out()),
    }

    requester.terminate();
    server_cancel.cancel();
    server.join().unwrap();
    Ok(())
}
