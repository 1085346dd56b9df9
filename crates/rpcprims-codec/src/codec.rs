use rpcprims_frame::MessageBuffer;

use crate::envelope::MessageHeader;
use crate::error::{CodecError, Result};

/// Serializes an envelope and typed values into the buffer it holds.
///
/// Implementors provide buffer handling, the envelope format and raw byte
/// access; the typed helpers are little-endian, and `binary`/`string`
/// values carry a `u32` length prefix.
pub trait Codec: Send {
    /// Attach `buffer` and rewind the read cursor.
    fn set_buffer(&mut self, buffer: MessageBuffer);

    /// Detach and return the buffer, if any.
    fn take_buffer(&mut self) -> Option<MessageBuffer>;

    fn buffer(&self) -> Option<&MessageBuffer>;

    /// Clear the buffer and write `header` at its start.
    fn start_write_message(&mut self, header: &MessageHeader) -> Result<()>;

    /// Rewind and decode the envelope at the start of the buffer.
    fn start_read_message(&mut self) -> Result<MessageHeader>;

    /// Append raw bytes.
    fn write_raw(&mut self, bytes: &[u8]) -> Result<()>;

    /// Fill `out` from the read cursor.
    fn read_raw(&mut self, out: &mut [u8]) -> Result<()>;

    /// Bytes left between the read cursor and the end of the buffer.
    fn remaining(&self) -> usize;

    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_raw(&[value])
    }

    fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(u8::from(value))
    }

    fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    fn write_binary(&mut self, value: &[u8]) -> Result<()> {
        self.write_u32(value.len() as u32)?;
        self.write_raw(value)
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_binary(value.as_bytes())
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut out = [0u8; 1];
        self.read_raw(&mut out)?;
        Ok(out[0])
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut out = [0u8; 2];
        self.read_raw(&mut out)?;
        Ok(u16::from_le_bytes(out))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut out = [0u8; 4];
        self.read_raw(&mut out)?;
        Ok(u32::from_le_bytes(out))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut out = [0u8; 8];
        self.read_raw(&mut out)?;
        Ok(u64::from_le_bytes(out))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let mut out = [0u8; 4];
        self.read_raw(&mut out)?;
        Ok(i32::from_le_bytes(out))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let mut out = [0u8; 8];
        self.read_raw(&mut out)?;
        Ok(i64::from_le_bytes(out))
    }

    fn read_f32(&mut self) -> Result<f32> {
        let mut out = [0u8; 4];
        self.read_raw(&mut out)?;
        Ok(f32::from_le_bytes(out))
    }

    fn read_f64(&mut self) -> Result<f64> {
        let mut out = [0u8; 8];
        self.read_raw(&mut out)?;
        Ok(f64::from_le_bytes(out))
    }

    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        if len > self.remaining() {
            return Err(CodecError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let mut out = vec![0u8; len];
        self.read_raw(&mut out)?;
        Ok(out)
    }

    fn read_string(&mut self) -> Result<String> {
        Ok(String::from_utf8(self.read_binary()?)?)
    }
}
