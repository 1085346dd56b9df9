//! Minimal echo server: accepts one client on a Unix socket and serves the
//! echo service until it disconnects.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- call /tmp/rpcprims-echo-<pid>/echo.sock --data hello

use std::fs;
use std::os::unix::net::UnixListener;
use std::sync::Arc;

use rpcprims::codec::BasicCodecFactory;
use rpcprims::echo::EchoService;
use rpcprims::frame::{DynamicBufferFactory, FramedTransport};
use rpcprims::rpc::SimpleServer;
use rpcprims::transport::{ChannelId, StreamTransport};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("rpcprims-echo-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("echo.sock");
    let _ = fs::remove_file(&sock_path);

    let listener = UnixListener::bind(&sock_path)?;
    eprintln!("Listening on {}", sock_path.display());

    let (stream, _) = listener.accept()?;
    let server = SimpleServer::new(
        ChannelId::DEFAULT,
        Arc::new(FramedTransport::new(StreamTransport::from_unix(stream)?)),
        Arc::new(DynamicBufferFactory::new()),
        Arc::new(BasicCodecFactory::new()),
    );
    let service = Arc::new(EchoService::new());
    server.add_service(service.clone());
    eprintln!("Client connected");

    if let Err(e) = server.run() {
        eprintln!("Client disconnected: {e}");
    }
    eprintln!("Handled {} notifications", service.notifications());

    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}
