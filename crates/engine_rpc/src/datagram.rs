//! Newline-delimited JSON framing over any async byte stream.
//!
//! Every message is a single JSON value followed by `\n`. The reader buffers
//! partial input until a delimiter arrives, so a value split across reads (or
//! several values delivered by a single read) come out exactly once each, in
//! order. Empty lines are skipped; a line that does not parse is logged and
//! dropped, and decoding resumes at the next delimiter.

use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::warn;

#[derive(Debug, Error)]
pub enum DatagramError {
    #[error("i/o error on datagram channel: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode datagram: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datagram channel is closed")]
    Closed,
}

/// `tokio_util` codec for newline-delimited JSON.
#[derive(Debug, Default, Clone)]
pub struct JsonDatagramCodec {
    // bytes of the current buffer already scanned for a delimiter
    scanned: usize,
}

impl JsonDatagramCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_line(line: &[u8]) -> Option<Value> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_slice::<Value>(line) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    error = %err,
                    line = %String::from_utf8_lossy(line),
                    "dropping datagram that does not parse as JSON"
                );
                None
            }
        }
    }
}

impl Decoder for JsonDatagramCodec {
    type Item = Value;
    type Error = DatagramError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Value>, DatagramError> {
        loop {
            let Some(offset) = buf[self.scanned..].iter().position(|b| *b == b'\n') else {
                self.scanned = buf.len();
                return Ok(None);
            };
            let line = buf.split_to(self.scanned + offset + 1);
            self.scanned = 0;
            if let Some(value) = Self::parse_line(&line[..line.len() - 1]) {
                return Ok(Some(value));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Value>, DatagramError> {
        if let Some(value) = self.decode(buf)? {
            return Ok(Some(value));
        }
        // trailing bytes without a delimiter get one last chance
        let rest = buf.split();
        self.scanned = 0;
        Ok(Self::parse_line(&rest))
    }
}

impl<T: Serialize> Encoder<T> for JsonDatagramCodec {
    type Error = DatagramError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), DatagramError> {
        let encoded = serde_json::to_vec(&item)?;
        dst.reserve(encoded.len() + 1);
        dst.put_slice(&encoded);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Receiving half of a datagram channel.
pub struct JsonDatagramReader<R> {
    inner: Option<FramedRead<R, JsonDatagramCodec>>,
}

impl<R: AsyncRead + Unpin> JsonDatagramReader<R> {
    pub fn new(reader: R) -> Self {
        Self { inner: Some(FramedRead::new(reader, JsonDatagramCodec::new())) }
    }

    /// Next complete message, or `None` once the stream has ended or been closed.
    pub async fn recv(&mut self) -> Option<Result<Value, DatagramError>> {
        let framed = self.inner.as_mut()?;
        let next = framed.next().await;
        if next.is_none() {
            self.inner = None;
        }
        next
    }

    pub fn close(&mut self) {
        self.inner = None;
    }
}

/// Sending half of a datagram channel. Writing after `end` fails with
/// [`DatagramError::Closed`].
pub struct JsonDatagramWriter<W> {
    inner: Option<FramedWrite<W, JsonDatagramCodec>>,
}

impl<W: AsyncWrite + Unpin> JsonDatagramWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: Some(FramedWrite::new(writer, JsonDatagramCodec::new())) }
    }

    pub async fn write<T: Serialize>(&mut self, msg: &T) -> Result<(), DatagramError> {
        let framed = self.inner.as_mut().ok_or(DatagramError::Closed)?;
        framed.send(msg).await
    }

    /// Flushes and shuts down the underlying writer.
    pub async fn end(&mut self) -> Result<(), DatagramError> {
        match self.inner.take() {
            Some(mut framed) => SinkExt::<Value>::close(&mut framed).await,
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

/// A reader/writer pair speaking newline-delimited JSON.
pub struct JsonDatagramSocket<R, W> {
    reader: JsonDatagramReader<R>,
    writer: JsonDatagramWriter<W>,
}

impl<R, W> JsonDatagramSocket<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: JsonDatagramReader::new(reader),
            writer: JsonDatagramWriter::new(writer),
        }
    }

    pub async fn recv(&mut self) -> Option<Result<Value, DatagramError>> {
        self.reader.recv().await
    }

    pub async fn write<T: Serialize>(&mut self, msg: &T) -> Result<(), DatagramError> {
        self.writer.write(msg).await
    }

    /// Closes both directions.
    pub async fn end(&mut self) -> Result<(), DatagramError> {
        self.reader.close();
        self.writer.end().await
    }

    pub fn split(self) -> (JsonDatagramReader<R>, JsonDatagramWriter<W>) {
        (self.reader, self.writer)
    }
}
