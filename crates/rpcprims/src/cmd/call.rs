use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rpcprims::echo::{ECHO, NOTIFY};
use rpcprims_codec::BasicCodecFactory;
use rpcprims_frame::{DynamicBufferFactory, FramedTransport};
use rpcprims_rpc::{ClientManager, RpcConfig};
use rpcprims_transport::StreamTransport;
use tracing::debug;

use crate::cmd::{parse_channel, CallArgs, CallMethod};
use crate::exit::{io_error, rpc_error, transport_error, CliResult, SUCCESS};
use crate::output::{print_call, CallOutput, OutputFormat};

pub fn run(args: CallArgs, config: &RpcConfig, format: OutputFormat) -> CliResult<i32> {
    let stream =
        UnixStream::connect(&args.path).map_err(|err| io_error("connect failed", err))?;
    stream
        .set_read_timeout(Some(Duration::from_millis(args.timeout_ms.max(1))))
        .map_err(|err| io_error("connect failed", err))?;
    let transport =
        StreamTransport::from_unix(stream).map_err(|err| transport_error("connect failed", err))?;

    // A read timeout is one idle transfer; the first one ends the call.
    let frame = config.frame.clone().with_max_idle_retries(0);
    let client = ClientManager::new(
        Arc::new(FramedTransport::with_config(transport, frame)),
        Arc::new(DynamicBufferFactory::new()),
        Arc::new(BasicCodecFactory::new()),
    )
    .with_config(config);
    client.set_error_handler(|status, method| debug!(?status, %method, "call failed"));

    let channel = parse_channel(&args.channel);
    let started = Instant::now();
    let (method, reply) = match args.method {
        CallMethod::Echo => {
            let reply = client
                .call(
                    channel,
                    ECHO,
                    |codec| codec.write_string(&args.data),
                    |codec| codec.read_string(),
                )
                .map_err(|err| rpc_error("call failed", err))?;
            ("echo", Some(reply))
        }
        CallMethod::Notify => {
            client
                .call_oneway(channel, NOTIFY, |codec| codec.write_string(&args.data))
                .map_err(|err| rpc_error("call failed", err))?;
            ("notify", None)
        }
    };

    print_call(
        &CallOutput {
            method,
            channel: channel.to_string(),
            oneway: reply.is_none(),
            reply,
            elapsed_us: started.elapsed().as_micros(),
        },
        format,
    );
    Ok(SUCCESS)
}
