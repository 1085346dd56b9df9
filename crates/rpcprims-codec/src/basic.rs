use rpcprims_frame::MessageBuffer;

use crate::codec::Codec;
use crate::envelope::{MessageHeader, MessageType, MethodId, CODEC_VERSION, ENVELOPE_SIZE};
use crate::error::{CodecError, Result};

/// Little-endian codec with a fixed 16-byte envelope.
///
/// ```text
/// ┌─────────┬──────┬──────────┬────────────┬───────────┬────────────┐
/// │ version │ type │ reserved │ service id │ method id │ sequence   │
/// │ u8 (=1) │ u8   │ u16      │ u32        │ u32       │ u32        │
/// └─────────┴──────┴──────────┴────────────┴───────────┴────────────┘
/// ```
#[derive(Debug, Default)]
pub struct BasicCodec {
    buffer: Option<MessageBuffer>,
    cursor: usize,
}

impl BasicCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec already holding `buffer`.
    pub fn with_buffer(buffer: MessageBuffer) -> Self {
        Self {
            buffer: Some(buffer),
            cursor: 0,
        }
    }
}

impl Codec for BasicCodec {
    fn set_buffer(&mut self, buffer: MessageBuffer) {
        self.buffer = Some(buffer);
        self.cursor = 0;
    }

    fn take_buffer(&mut self) -> Option<MessageBuffer> {
        self.cursor = 0;
        self.buffer.take()
    }

    fn buffer(&self) -> Option<&MessageBuffer> {
        self.buffer.as_ref()
    }

    fn start_write_message(&mut self, header: &MessageHeader) -> Result<()> {
        let buffer = self.buffer.as_mut().ok_or(CodecError::NoBuffer)?;
        buffer.clear();
        self.cursor = 0;

        let mut envelope = [0u8; ENVELOPE_SIZE];
        envelope[0] = CODEC_VERSION;
        envelope[1] = header.msg_type.as_u8();
        envelope[4..8].copy_from_slice(&header.service_id.to_le_bytes());
        envelope[8..12].copy_from_slice(&header.method_id.raw().to_le_bytes());
        envelope[12..16].copy_from_slice(&header.sequence.to_le_bytes());
        self.write_raw(&envelope)
    }

    fn start_read_message(&mut self) -> Result<MessageHeader> {
        self.cursor = 0;
        let mut envelope = [0u8; ENVELOPE_SIZE];
        self.read_raw(&mut envelope)?;

        if envelope[0] != CODEC_VERSION {
            return Err(CodecError::UnsupportedVersion(envelope[0]));
        }
        let msg_type = MessageType::try_from(envelope[1])?;
        let field = |at: usize| {
            u32::from_le_bytes([envelope[at], envelope[at + 1], envelope[at + 2], envelope[at + 3]])
        };
        Ok(MessageHeader {
            msg_type,
            service_id: field(4),
            method_id: MethodId::new(field(8)),
            sequence: field(12),
        })
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let buffer = self.buffer.as_mut().ok_or(CodecError::NoBuffer)?;
        if !buffer.put_slice(bytes) {
            return Err(CodecError::BufferOverrun {
                needed: bytes.len(),
                remaining: buffer.remaining(),
            });
        }
        Ok(())
    }

    fn read_raw(&mut self, out: &mut [u8]) -> Result<()> {
        let buffer = self.buffer.as_ref().ok_or(CodecError::NoBuffer)?;
        let available = buffer.len().saturating_sub(self.cursor);
        if out.len() > available {
            return Err(CodecError::Truncated {
                needed: out.len(),
                available,
            });
        }
        out.copy_from_slice(&buffer.as_slice()[self.cursor..self.cursor + out.len()]);
        self.cursor += out.len();
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.buffer
            .as_ref()
            .map_or(0, |buffer| buffer.len().saturating_sub(self.cursor))
    }
}
