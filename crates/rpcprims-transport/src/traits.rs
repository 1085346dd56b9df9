use std::io::{ErrorKind, Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::channel::ChannelId;
use crate::error::{Result, TransportError};

/// A raw byte channel.
///
/// Both directions may transfer fewer bytes than requested. A return of
/// `Ok(0)` means "nothing moved this time" and is not an error; callers
/// decide how long to keep trying. `Err(TransportError::Closed)` is final.
///
/// Implementations must allow one sender and one receiver to make progress
/// at the same time.
pub trait Transport: Send + Sync {
    /// Write up to `data.len()` bytes on `channel`, returning how many were taken.
    fn send(&self, channel: ChannelId, data: &[u8]) -> Result<usize>;

    /// Read up to `data.len()` bytes from `channel`, returning how many arrived.
    fn receive(&self, channel: ChannelId, data: &mut [u8]) -> Result<usize>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&self, channel: ChannelId, data: &[u8]) -> Result<usize> {
        (**self).send(channel, data)
    }

    fn receive(&self, channel: ChannelId, data: &mut [u8]) -> Result<usize> {
        (**self).receive(channel, data)
    }
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, channel: ChannelId, data: &[u8]) -> Result<usize> {
        (**self).send(channel, data)
    }

    fn receive(&self, channel: ChannelId, data: &mut [u8]) -> Result<usize> {
        (**self).receive(channel, data)
    }
}

/// Single-link transport over a reader half and a writer half.
///
/// The channel argument is ignored: everything travels on the one stream.
/// Reader and writer sit behind separate locks so a sender never waits on
/// a blocked receiver.
pub struct StreamTransport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
}

impl<R: Read, W: Write> StreamTransport<R, W> {
    /// Wrap a reader and a writer.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    /// Consume the transport and return both halves.
    pub fn into_inner(self) -> (R, W) {
        (
            self.reader
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner),
            self.writer
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

#[cfg(unix)]
impl StreamTransport<std::os::unix::net::UnixStream, std::os::unix::net::UnixStream> {
    /// Split a connected Unix stream into a transport.
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> Result<Self> {
        let reader = stream.try_clone()?;
        Ok(Self::new(reader, stream))
    }
}

impl StreamTransport<std::net::TcpStream, std::net::TcpStream> {
    /// Split a connected TCP stream into a transport.
    pub fn from_tcp(stream: std::net::TcpStream) -> Result<Self> {
        let reader = stream.try_clone()?;
        Ok(Self::new(reader, stream))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<R, W> Transport for StreamTransport<R, W>
where
    R: Read + Send,
    W: Write + Send,
{
    fn send(&self, channel: ChannelId, data: &[u8]) -> Result<usize> {
        let mut writer = lock(&self.writer);
        loop {
            match writer.write(data) {
                Ok(n) => {
                    if n == data.len() {
                        flush(&mut *writer)?;
                    }
                    trace!(%channel, requested = data.len(), written = n, "stream send");
                    return Ok(n);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
                {
                    return Ok(0)
                }
                Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                    return Err(TransportError::Closed)
                }
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }

    fn receive(&self, channel: ChannelId, data: &mut [u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut reader = lock(&self.reader);
        loop {
            match reader.read(data) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => {
                    trace!(%channel, requested = data.len(), read = n, "stream receive");
                    return Ok(n);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
                {
                    return Ok(0)
                }
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }
}

/// Flush after a complete write. A writer that cannot flush without
/// blocking is reported as an I/O error rather than spun on.
fn flush<W: Write + ?Sized>(writer: &mut W) -> Result<()> {
    loop {
        match writer.flush() {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn cursor_roundtrip() {
        let transport = StreamTransport::new(Cursor::new(b"hello".to_vec()), Vec::new());

        let sent = transport.send(ChannelId::DEFAULT, b"abc").unwrap();
        assert_eq!(sent, 3);

        let mut buf = [0u8; 8];
        let read = transport.receive(ChannelId::DEFAULT, &mut buf).unwrap();
        assert_eq!(&buf[..read], b"hello");

        let (_, writer) = transport.into_inner();
        assert_eq!(writer, b"abc");
    }

    #[test]
    fn eof_is_closed() {
        let transport = StreamTransport::new(Cursor::new(Vec::new()), Vec::new());
        let mut buf = [0u8; 4];
        let err = transport.receive(ChannelId::DEFAULT, &mut buf).unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(err.is_disconnect());
    }

    #[test]
    fn would_block_is_zero_transfer() {
        let transport = StreamTransport::new(WouldBlockReader, Vec::new());
        let mut buf = [0u8; 4];
        assert_eq!(transport.receive(ChannelId::DEFAULT, &mut buf).unwrap(), 0);
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = InterruptedThenData {
            interrupted: false,
            bytes: b"ok".to_vec(),
        };
        let transport = StreamTransport::new(reader, Vec::new());
        let mut buf = [0u8; 4];
        let read = transport.receive(ChannelId::DEFAULT, &mut buf).unwrap();
        assert_eq!(&buf[..read], b"ok");
    }

    #[test]
    fn short_writes_are_reported() {
        let transport = StreamTransport::new(Cursor::new(Vec::new()), OneByteWriter::default());
        assert_eq!(transport.send(ChannelId::DEFAULT, b"abc").unwrap(), 1);
    }

    #[test]
    #[cfg(unix)]
    fn unix_pair_roundtrip() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let a = StreamTransport::from_unix(left).unwrap();
        let b = StreamTransport::from_unix(right).unwrap();

        assert_eq!(a.send(ChannelId::DEFAULT, b"ping").unwrap(), 4);
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            got += b.receive(ChannelId::DEFAULT, &mut buf[got..]).unwrap();
        }
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn blocked_flush_is_io_error() {
        let transport = StreamTransport::new(Cursor::new(Vec::new()), StuckFlush::default());
        let err = transport.send(ChannelId::DEFAULT, b"abc").unwrap_err();
        assert!(matches!(&err, TransportError::Io(io) if io.kind() == ErrorKind::WouldBlock));
        assert!(!err.is_disconnect());

        let (_, writer) = transport.into_inner();
        assert_eq!(writer.data, b"abc");
        assert_eq!(writer.flushes, 1);
    }

    struct WouldBlockReader;

    impl Read for WouldBlockReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::WouldBlock))
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        bytes: Vec<u8>,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            let n = self.bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[..n]);
            self.bytes.drain(..n);
            Ok(n)
        }
    }

    #[derive(Default)]
    struct OneByteWriter {
        data: Vec<u8>,
    }

    impl Write for OneByteWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if buf.is_empty() {
                return Ok(0);
            }
            self.data.push(buf[0]);
            Ok(1)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Takes every write but never finishes a flush.
    #[derive(Default)]
    struct StuckFlush {
        data: Vec<u8>,
        flushes: usize,
    }

    impl Write for StuckFlush {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushes += 1;
            Err(std::io::Error::from(ErrorKind::WouldBlock))
        }
    }
}
