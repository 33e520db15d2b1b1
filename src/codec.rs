//! Length-prefixed wire codec for the internal RPC transport
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes.
//! A logical message is one header frame (a protobuf-encoded
//! [`RequestHeader`] or [`ResponseHeader`]) followed by one body frame. Bodies
//! are opaque: the codec copies them on and off the wire without looking at
//! them, so any producer of already-serialized bytes can use this format.

use bytes::{Bytes, BytesMut};
use prost::Message;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tokio::sync::Mutex;

use crate::error::CodecError;

/// Buffer size for both the read and write side of a connection
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

/// Largest frame accepted in either direction unless configured otherwise
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Header frame preceding every request body
#[derive(Clone, PartialEq, Message)]
pub struct RequestHeader {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(uint64, tag = "2")]
    pub seq: u64,
}

/// Header frame preceding every response body
#[derive(Clone, PartialEq, Message)]
pub struct ResponseHeader {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(uint64, tag = "2")]
    pub seq: u64,
    /// Empty on success
    #[prost(string, tag = "3")]
    pub error: String,
}

/// Shared framing over one byte stream: a locked buffered writer and a
/// locked buffered reader.
struct Framed<T> {
    // exclusive writer lock: header and body of one message go out together
    writer: Mutex<BufWriter<WriteHalf<T>>>,
    reader: Mutex<BufReader<ReadHalf<T>>>,
    max_frame_size: usize,
}

impl<T> Framed<T>
where
    T: AsyncRead + AsyncWrite + Send,
{
    fn new(io: T, max_frame_size: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            writer: Mutex::new(BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, write_half)),
            reader: Mutex::new(BufReader::with_capacity(DEFAULT_BUFFER_SIZE, read_half)),
            max_frame_size,
        }
    }

    fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_frame_size || size > u32::MAX as usize {
            return Err(CodecError::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        Ok(())
    }

    async fn write_message<M: Message>(&self, header: &M, body: &[u8]) -> Result<(), CodecError> {
        let header = header.encode_to_vec();

        // Reject before touching the stream so no partial message is written
        self.check_size(header.len())?;
        self.check_size(body.len())?;

        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &header).await?;
        write_frame(&mut *writer, body).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_header<M: Message + Default>(&self) -> Result<M, CodecError> {
        let mut reader = self.reader.lock().await;
        let frame = read_frame(&mut *reader, self.max_frame_size).await?;
        Ok(M::decode(frame)?)
    }

    async fn read_body(&self, dest: Option<&mut Bytes>) -> Result<(), CodecError> {
        let mut reader = self.reader.lock().await;
        match dest {
            Some(dest) => {
                *dest = read_frame(&mut *reader, self.max_frame_size).await?;
            }
            None => skip_frame(&mut *reader).await?,
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CodecError> {
        let mut writer = self.writer.lock().await;
        writer.flush().await?;
        writer.shutdown().await?;
        Ok(())
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(frame.len() as u32).await?;
    writer.write_all(frame).await?;
    Ok(())
}

async fn read_len<R>(reader: &mut R) -> Result<usize, CodecError>
where
    R: AsyncRead + Unpin,
{
    reader
        .read_u32()
        .await
        .map(|len| len as usize)
        .map_err(eof_as_closed)
}

async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Bytes, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = read_len(reader).await?;
    if len > limit {
        return Err(CodecError::FrameTooLarge { size: len, limit });
    }

    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await.map_err(eof_as_closed)?;
    Ok(buf.freeze())
}

async fn skip_frame<R>(reader: &mut R) -> Result<(), CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = read_len(reader).await? as u64;
    let skipped = tokio::io::copy(&mut reader.take(len), &mut tokio::io::sink()).await?;
    if skipped < len {
        return Err(CodecError::ConnectionClosed);
    }
    Ok(())
}

fn eof_as_closed(err: std::io::Error) -> CodecError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        CodecError::ConnectionClosed
    } else {
        CodecError::Io(err)
    }
}

/// Client side of the wire codec.
///
/// The client writes requests with [`write_request`](Self::write_request)
/// and reads responses with [`read_response_header`](Self::read_response_header)
/// and [`read_response_body`](Self::read_response_body) in pairs. Passing
/// `None` to `read_response_body` reads the body and throws it away, which is
/// how responses nobody is waiting for are skipped.
///
/// Writes from concurrent callers are serialized; reads are expected to come
/// from a single reader.
pub struct ClientCodec<T> {
    framed: Framed<T>,
}

impl<T> ClientCodec<T>
where
    T: AsyncRead + AsyncWrite + Send,
{
    pub fn new(io: T) -> Self {
        Self::with_max_frame_size(io, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(io: T, max_frame_size: usize) -> Self {
        Self {
            framed: Framed::new(io, max_frame_size),
        }
    }

    /// Write one request (header frame, body frame) and flush.
    ///
    /// Not cancel safe: dropping the future mid-write leaves the stream
    /// inside a frame.
    pub async fn write_request(&self, method: &str, seq: u64, body: &[u8]) -> Result<(), CodecError> {
        let header = RequestHeader {
            method: method.to_string(),
            seq,
        };
        self.framed.write_message(&header, body).await
    }

    /// Read the next response header
    pub async fn read_response_header(&self) -> Result<ResponseHeader, CodecError> {
        self.framed.read_header().await
    }

    /// Read the body following the last header into `dest`, or discard it
    pub async fn read_response_body(&self, dest: Option<&mut Bytes>) -> Result<(), CodecError> {
        self.framed.read_body(dest).await
    }

    /// Flush and shut down the write half
    pub async fn close(&self) -> Result<(), CodecError> {
        self.framed.close().await
    }
}

/// Server side of the wire codec, as spoken by services on the internal
/// transport.
pub struct ServerCodec<T> {
    framed: Framed<T>,
}

impl<T> ServerCodec<T>
where
    T: AsyncRead + AsyncWrite + Send,
{
    pub fn new(io: T) -> Self {
        Self::with_max_frame_size(io, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(io: T, max_frame_size: usize) -> Self {
        Self {
            framed: Framed::new(io, max_frame_size),
        }
    }

    pub async fn read_request_header(&self) -> Result<RequestHeader, CodecError> {
        self.framed.read_header().await
    }

    pub async fn read_request_body(&self, dest: Option<&mut Bytes>) -> Result<(), CodecError> {
        self.framed.read_body(dest).await
    }

    /// Write one response. An error response carries an empty body.
    pub async fn write_response(
        &self,
        method: &str,
        seq: u64,
        error: Option<&str>,
        body: &[u8],
    ) -> Result<(), CodecError> {
        let header = ResponseHeader {
            method: method.to_string(),
            seq,
            error: error.unwrap_or_default().to_string(),
        };
        let body = if error.is_some() { &[][..] } else { body };
        self.framed.write_message(&header, body).await
    }

    pub async fn close(&self) -> Result<(), CodecError> {
        self.framed.close().await
    }
}
