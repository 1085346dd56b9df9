//! Buffer/codec pairing shared by clients and servers.

use std::sync::Arc;

use rpcprims_codec::{Codec, CodecFactory};
use rpcprims_frame::{MessageBufferFactory, MessageTransport};
use rpcprims_transport::ChannelId;

use crate::error::{Result, RpcError};

#[derive(Clone)]
pub(crate) struct Resources {
    pub(crate) buffers: Arc<dyn MessageBufferFactory>,
    pub(crate) codecs: Arc<dyn CodecFactory>,
}

impl Resources {
    /// A codec holding a fresh buffer. Nothing is kept on failure.
    pub(crate) fn allocate(&self) -> Result<Box<dyn Codec>> {
        let buffer = self
            .buffers
            .acquire()
            .ok_or(RpcError::Allocation("message buffer"))?;
        let Some(mut codec) = self.codecs.create() else {
            self.buffers.release(buffer);
            return Err(RpcError::Allocation("codec"));
        };
        codec.set_buffer(buffer);
        Ok(codec)
    }

    pub(crate) fn dispose(&self, mut codec: Box<dyn Codec>) {
        if let Some(buffer) = codec.take_buffer() {
            self.buffers.release(buffer);
        }
        self.codecs.dispose(codec);
    }
}

pub(crate) fn send_message(
    transport: &dyn MessageTransport,
    channel: ChannelId,
    codec: &dyn Codec,
) -> Result<()> {
    let buffer = codec
        .buffer()
        .ok_or(RpcError::Allocation("message buffer"))?;
    transport.send(channel, buffer)?;
    Ok(())
}

/// Receive one frame into the codec's own buffer.
pub(crate) fn receive_message(
    transport: &dyn MessageTransport,
    channel: ChannelId,
    codec: &mut dyn Codec,
) -> Result<()> {
    let mut buffer = codec
        .take_buffer()
        .ok_or(RpcError::Allocation("message buffer"))?;
    let received = transport.receive(channel, &mut buffer);
    codec.set_buffer(buffer);
    received?;
    Ok(())
}
