//! Two peers on one in-memory link, each serving and calling the other.
//!
//! The front peer serves `greet` on the "front" channel. Its handler calls
//! the back peer's echo service on the "back" channel before replying; that
//! inner call is waited for by the front server itself, which answers any
//! request arriving on "back" in the meantime.
//!
//! The outer caller on the back side frames the link on its own. A framed
//! transport serializes receives across channels, so sharing the back
//! server's would let the caller's wait on "front" block the server's
//! receive on "back".
//!
//! Run with:
//!   cargo run --example nested-call

use std::sync::Arc;
use std::thread;

use rpcprims::codec::{BasicCodecFactory, MethodId};
use rpcprims::echo::{EchoService, ECHO};
use rpcprims::frame::{DynamicBufferFactory, FramedTransport, MessageTransport};
use rpcprims::rpc::{ClientManager, Invocation, MethodRef, Service, SimpleServer};
use rpcprims::transport::{ChannelId, MemoryTransport};

const GREETER: u32 = 10;
const GREET: MethodRef = MethodRef::new(GREETER, MethodId::from_name("greet"));
const FRONT: ChannelId = ChannelId::from_name("front");
const BACK: ChannelId = ChannelId::from_name("back");

struct Greeter {
    back: Arc<ClientManager>,
}

impl Service for Greeter {
    fn service_id(&self) -> u32 {
        GREETER
    }

    fn handle_invocation(&self, invocation: &mut Invocation<'_>) -> rpcprims::rpc::Result<()> {
        let name = invocation.args().read_string()?;
        let echoed = self.back.call(
            BACK,
            ECHO,
            |args| args.write_string(&name),
            |reply| reply.read_string(),
        )?;
        invocation.reply()?.write_string(&format!("hello, {echoed}"))?;
        Ok(())
    }
}

fn framed(link: &Arc<MemoryTransport>) -> Arc<dyn MessageTransport> {
    Arc::new(FramedTransport::new(Arc::clone(link)))
}

fn client(transport: Arc<dyn MessageTransport>) -> ClientManager {
    ClientManager::new(
        transport,
        Arc::new(DynamicBufferFactory::new()),
        Arc::new(BasicCodecFactory::new()),
    )
}

fn server(transport: Arc<dyn MessageTransport>, serves: ChannelId) -> Arc<SimpleServer> {
    Arc::new(SimpleServer::new(
        serves,
        transport,
        Arc::new(DynamicBufferFactory::new()),
        Arc::new(BasicCodecFactory::new()),
    ))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (front_link, back_link) = MemoryTransport::pair();
    let (front_link, back_link) = (Arc::new(front_link), Arc::new(back_link));

    let front = framed(&front_link);
    let front_server = server(front.clone(), FRONT);
    let front_client = Arc::new(client(front).with_server(&front_server));
    front_server.add_service(Arc::new(Greeter { back: front_client }));

    let back_server = server(framed(&back_link), BACK);
    back_server.add_service(Arc::new(EchoService::new()));
    let caller = client(framed(&back_link));

    // Each server handles exactly one request.
    let serving = {
        let front_server = front_server.clone();
        thread::spawn(move || front_server.run_once())
    };
    let answering = {
        let back_server = back_server.clone();
        thread::spawn(move || back_server.run_once())
    };

    let greeting = caller.call(
        FRONT,
        GREET,
        |args| args.write_string("world"),
        |reply| reply.read_string(),
    )?;
    println!("{greeting}");

    serving.join().map_err(|_| "front server panicked")??;
    answering.join().map_err(|_| "back server panicked")??;
    Ok(())
}
