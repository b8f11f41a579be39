use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex as AsyncMutex;

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Reads newline-delimited frames from a server's stdout.
///
/// Frames are raw bytes; text decoding belongs to the codec, so a line that
/// is not UTF-8 is just another undecodable frame.
pub struct FrameReader {
    inner: BufReader<BoxedRead>,
    buf: Vec<u8>,
    closed: bool,
}

impl FrameReader {
    pub fn new(inner: BoxedRead) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            closed: false,
        }
    }

    /// Waits for the next non-empty frame.
    ///
    /// `Ok(None)` means the stream is closed. Closure is terminal: once it has
    /// been reported, every later call returns `Ok(None)` without touching the
    /// pipe again.
    pub async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            self.buf.clear();
            match self.inner.read_until(b'\n', &mut self.buf).await {
                Ok(0) => {
                    self.closed = true;
                    return Ok(None);
                }
                Ok(_) => {
                    let frame = self.buf.trim_ascii();
                    if frame.is_empty() {
                        continue;
                    }
                    return Ok(Some(frame.to_vec()));
                }
                Err(err) => {
                    self.closed = true;
                    return Err(err);
                }
            }
        }
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Serialized write half of a server's stdin.
///
/// Every frame is written and flushed while holding the lock, so concurrent
/// callers can never interleave bytes.
pub struct FrameWriter {
    inner: AsyncMutex<Option<BufWriter<BoxedWrite>>>,
}

impl FrameWriter {
    pub fn new(inner: BoxedWrite) -> Self {
        Self {
            inner: AsyncMutex::new(Some(BufWriter::new(inner))),
        }
    }

    pub async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut guard = self.inner.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "writer closed"))?;
        stream.write_all(frame).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await
    }

    /// Flushes and drops the write half, which the server observes as EOF.
    pub async fn close(&self) -> io::Result<()> {
        let taken = self.inner.lock().await.take();
        match taken {
            Some(mut stream) => stream.shutdown().await,
            None => Ok(()),
        }
    }
}
