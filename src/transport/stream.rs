//! Blocking-style reads and writes of protocol primitives.
//!
//! `WireReader` and `WireWriter` are split so the schema 5 listener task can
//! own the read half while callers share the write half behind a mutex.
//! `WireStream` joins them back together for the schema 4 protocol, whose
//! chunked string transfer interleaves reads and writes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::ServiceError;

/// Marks the end of every message and acknowledges success.
pub const SUCCESS_SENTINEL: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

/// Chunk size used by the schema 4 string transfer.
pub const CHUNK_SIZE: usize = 1024;

/// Maximum inbound payload (100MB) to prevent OOM from a desynced stream.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Acknowledgement value written between chunks.
const CHUNK_ACK: u32 = 0;

/// Read half of the daemon connection.
pub struct WireReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read exactly 4 bytes as a big-endian int.
    pub async fn read_int(&mut self) -> Result<u32, ServiceError> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Read exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if `len` exceeds [`MAX_MESSAGE_SIZE`].
    pub async fn read_buffer(&mut self, len: usize) -> Result<Vec<u8>, ServiceError> {
        if len > MAX_MESSAGE_SIZE {
            return Err(ServiceError::ProtocolViolation(format!(
                "Payload size {} exceeds maximum {} bytes",
                len, MAX_MESSAGE_SIZE
            )));
        }
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Read a length-prefixed UTF-8 string in one piece.
    pub async fn read_string(&mut self) -> Result<String, ServiceError> {
        let len = self.read_int().await? as usize;
        let bytes = self.read_buffer(len).await?;
        decode_utf8(bytes)
    }

    /// Read 4 bytes and fail unless they are the success sentinel.
    pub async fn read_and_assert_success(&mut self) -> Result<(), ServiceError> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf).await?;
        if buf != SUCCESS_SENTINEL {
            return Err(ServiceError::ProtocolViolation(format!(
                "Expected success sentinel, got {:02x?}",
                buf
            )));
        }
        Ok(())
    }
}

/// Write half of the daemon connection. Every write is flushed.
pub struct WireWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_int(&mut self, value: u32) -> Result<(), ServiceError> {
        self.inner.write_all(&value.to_be_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Raw passthrough, used for fully framed schema 5 messages.
    pub async fn write_buffer(&mut self, bytes: &[u8]) -> Result<(), ServiceError> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Write a length-prefixed UTF-8 string in one piece.
    pub async fn write_string(&mut self, value: &str) -> Result<(), ServiceError> {
        let bytes = value.as_bytes();
        self.inner.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_success(&mut self) -> Result<(), ServiceError> {
        self.write_buffer(&SUCCESS_SENTINEL).await
    }

    /// Shut down the write side, signalling end-of-stream to the daemon.
    pub async fn close(&mut self) -> Result<(), ServiceError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Both halves of a connection, for request/response protocols that own
/// the whole stream for each exchange.
pub struct WireStream<R, W> {
    pub reader: WireReader<R>,
    pub writer: WireWriter<W>,
}

impl<R, W> WireStream<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: WireReader::new(reader),
            writer: WireWriter::new(writer),
        }
    }

    /// Write a string as `len` followed by 1024-byte chunks, reading one
    /// acknowledgement int before each chunk after the first.
    pub async fn write_string_chunked(&mut self, value: &str) -> Result<(), ServiceError> {
        let bytes = value.as_bytes();
        self.writer.write_int(bytes.len() as u32).await?;

        for (index, chunk) in bytes.chunks(CHUNK_SIZE).enumerate() {
            if index > 0 {
                let ack = self.reader.read_int().await?;
                debug!("Chunk {} acknowledged ({})", index - 1, ack);
            }
            self.writer.write_buffer(chunk).await?;
        }
        Ok(())
    }

    /// Read a string sent as `len` followed by 1024-byte chunks, writing one
    /// acknowledgement int after every chunk except the last.
    pub async fn read_string_chunked(&mut self) -> Result<String, ServiceError> {
        let total = self.reader.read_int().await? as usize;
        if total > MAX_MESSAGE_SIZE {
            return Err(ServiceError::ProtocolViolation(format!(
                "String size {} exceeds maximum {} bytes",
                total, MAX_MESSAGE_SIZE
            )));
        }

        let mut bytes = Vec::with_capacity(total);
        while bytes.len() < total {
            if !bytes.is_empty() {
                self.writer.write_int(CHUNK_ACK).await?;
            }
            let len = CHUNK_SIZE.min(total - bytes.len());
            bytes.extend(self.reader.read_buffer(len).await?);
        }
        decode_utf8(bytes)
    }
}

fn decode_utf8(bytes: Vec<u8>) -> Result<String, ServiceError> {
    String::from_utf8(bytes)
        .map_err(|e| ServiceError::ProtocolViolation(format!("String is not valid UTF-8: {}", e)))
}
