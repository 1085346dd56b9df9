use std::io::ErrorKind;
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use rpcprims::echo::EchoService;
use rpcprims_codec::BasicCodecFactory;
use rpcprims_frame::{DynamicBufferFactory, FramedTransport};
use rpcprims_rpc::{RpcConfig, ServerState, SimpleServer};
use rpcprims_transport::StreamTransport;
use tracing::{info, trace, warn};

use crate::cmd::{parse_channel, ServeArgs};
use crate::exit::{io_error, rpc_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Stop state shared with the Ctrl-C handler.
struct StopSignal {
    running: AtomicBool,
    session: Mutex<Option<(Arc<SimpleServer>, UnixStream)>>,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            session: Mutex::new(None),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn attach(&self, server: Arc<SimpleServer>, stream: UnixStream) {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_running() {
            interrupt(&server, &stream);
        }
        *session = Some((server, stream));
    }

    fn detach(&self) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn trigger(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some((server, stream)) = &*self.session.lock().unwrap_or_else(PoisonError::into_inner) {
            interrupt(server, stream);
        }
    }
}

/// Stop the server and unblock its pending receive.
fn interrupt(server: &SimpleServer, stream: &UnixStream) {
    server.stop();
    let _ = stream.shutdown(Shutdown::Both);
}

pub fn run(args: ServeArgs, config: &RpcConfig) -> CliResult<i32> {
    if args.path.exists() {
        std::fs::remove_file(&args.path).map_err(|err| io_error("removing stale socket", err))?;
    }
    let listener = UnixListener::bind(&args.path).map_err(|err| io_error("bind failed", err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| io_error("bind failed", err))?;

    let stop = Arc::new(StopSignal::new());
    install_ctrlc_handler(stop.clone())?;
    let service = Arc::new(EchoService::new());
    info!(path = %args.path.display(), poll = args.poll, "serving echo");

    let result = accept_loop(&listener, &args, config, &service, &stop);
    let _ = std::fs::remove_file(&args.path);
    info!(notifications = service.notifications(), "server shut down");
    result.map(|()| SUCCESS)
}

fn accept_loop(
    listener: &UnixListener,
    args: &ServeArgs,
    config: &RpcConfig,
    service: &Arc<EchoService>,
    stop: &StopSignal,
) -> CliResult<()> {
    while stop.is_running() {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(io_error("accept failed", err)),
        };
        stream
            .set_nonblocking(false)
            .map_err(|err| io_error("accept failed", err))?;
        serve_connection(stream, args, config, service, stop)?;
    }
    Ok(())
}

fn serve_connection(
    stream: UnixStream,
    args: &ServeArgs,
    config: &RpcConfig,
    service: &Arc<EchoService>,
    stop: &StopSignal,
) -> CliResult<()> {
    let control = stream
        .try_clone()
        .map_err(|err| io_error("accept failed", err))?;
    let transport =
        StreamTransport::from_unix(stream).map_err(|err| transport_error("accept failed", err))?;
    let server = Arc::new(
        SimpleServer::new(
            parse_channel(&args.channel),
            Arc::new(FramedTransport::with_config(transport, config.frame.clone())),
            Arc::new(DynamicBufferFactory::new()),
            Arc::new(BasicCodecFactory::new()),
        )
        .with_config(config),
    );
    server.add_service(service.clone());
    info!(channel = %server.channel(), "client connected");

    stop.attach(server.clone(), control);
    let outcome = if args.poll {
        drive(&server)
    } else {
        server.run()
    };
    stop.detach();

    match outcome {
        Ok(()) => Ok(()),
        Err(err) if err.is_disconnect() || !stop.is_running() => {
            info!("client disconnected");
            Ok(())
        }
        Err(err) => Err(rpc_error("serve failed", err)),
    }
}

/// Poll until the server is stopped or the channel closes.
fn drive(server: &SimpleServer) -> rpcprims_rpc::Result<()> {
    loop {
        match server.poll() {
            Ok(ServerState::SendDone) if !server.is_running() => return Ok(()),
            Ok(state) => trace!(?state, "polled"),
            Err(err) if err.is_disconnect() => return Err(err),
            Err(err) => warn!(status = ?err.status(), "request failed: {err}"),
        }
    }
}

fn install_ctrlc_handler(stop: Arc<StopSignal>) -> CliResult<()> {
    ctrlc::set_handler(move || stop.trigger()).map_err(|err| {
        CliError::new(INTERNAL, format!("signal handler setup failed: {err}"))
    })
}
