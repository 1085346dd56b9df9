use rpcprims_codec::{Codec, MessageHeader};

use crate::error::Result;

/// A group of methods dispatched by a [`SimpleServer`](crate::SimpleServer).
///
/// Handlers read arguments through [`Invocation::args`] and write results
/// through [`Invocation::reply`]. Returning an error drops the reply.
pub trait Service: Send + Sync {
    fn service_id(&self) -> u32;

    fn handle_invocation(&self, invocation: &mut Invocation<'_>) -> Result<()>;
}

/// One inbound call being dispatched.
pub struct Invocation<'a> {
    header: MessageHeader,
    codec: &'a mut dyn Codec,
    replied: bool,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(header: MessageHeader, codec: &'a mut dyn Codec) -> Self {
        Self {
            header,
            codec,
            replied: false,
        }
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn is_oneway(&self) -> bool {
        self.header.is_oneway()
    }

    /// Codec positioned after the envelope, for reading arguments.
    pub fn args(&mut self) -> &mut dyn Codec {
        &mut *self.codec
    }

    /// Codec for writing results.
    ///
    /// The first call replaces the request with the reply envelope, so all
    /// arguments must be read before it. Oneway calls never send the reply.
    pub fn reply(&mut self) -> Result<&mut dyn Codec> {
        if !self.replied {
            self.codec.start_write_message(&self.header.reply())?;
            self.replied = true;
        }
        Ok(&mut *self.codec)
    }

    pub(crate) fn has_replied(&self) -> bool {
        self.replied
    }
}
