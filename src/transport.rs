//! Plaintext wire transport for crawl sessions.
//!
//! Frames messages with the standard 24-byte envelope: 4-byte network magic,
//! 12-byte command, 4-byte payload length, 4-byte checksum. Serialization is
//! delegated to the `bitcoin` consensus codec; commands the codec does not
//! recognize surface as [`NetworkMessage::Unknown`] so callers can skip them
//! and keep reading.

use bitcoin::consensus::encode;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::Magic;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Size of the message envelope in bytes.
const HEADER_SIZE: usize = 24;
/// Offset of the payload length field within the envelope.
const PAYLOAD_LENGTH_OFFSET: usize = 16;
/// Upper bound on a single payload. Nothing the crawler exchanges comes
/// close; larger claims indicate a broken or hostile peer.
const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// TCP connect timeout for crawl dials.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the framing layer.
#[derive(Debug)]
pub enum TransportError {
    /// IO error during read/write operations.
    Io(io::Error),
    /// Failed to deserialize a message.
    Deserialize(encode::Error),
    /// Network magic in the envelope doesn't match this network.
    MagicMismatch,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "IO error: {e}"),
            TransportError::Deserialize(e) => write!(f, "message deserialization error: {e}"),
            TransportError::MagicMismatch => write!(f, "network magic mismatch"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Deserialize(e) => Some(e),
            TransportError::MagicMismatch => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<encode::Error> for TransportError {
    fn from(e: encode::Error) -> Self {
        TransportError::Deserialize(e)
    }
}

/// A framed message stream keyed to one network's magic.
#[derive(Debug)]
pub struct Transport<R, W> {
    magic: Magic,
    reader: R,
    writer: W,
}

/// Transport over the halves of a tokio TCP stream, as used by crawl
/// workers.
pub type TcpTransport = Transport<OwnedReadHalf, OwnedWriteHalf>;

/// Dial an endpoint and wrap the stream in a [`Transport`].
///
/// The connect attempt is bounded by [`DIAL_TIMEOUT`]. Nagle's algorithm is
/// disabled since the session is a short exchange of small messages.
pub async fn connect(addr: SocketAddr, magic: Magic) -> Result<TcpTransport, io::Error> {
    let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection attempt timed out",
            ))
        }
    };
    stream.set_nodelay(true)?;

    let (reader, writer) = stream.into_split();
    Ok(Transport::new(magic, reader, writer))
}

impl<R, W> Transport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Create a transport over an established byte stream.
    pub fn new(magic: Magic, reader: R, writer: W) -> Self {
        Transport {
            magic,
            reader,
            writer,
        }
    }

    /// Serialize and write one message.
    pub async fn write(&mut self, message: NetworkMessage) -> Result<(), TransportError> {
        let raw = RawNetworkMessage::new(self.magic, message);
        let data = encode::serialize(&raw);

        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read one message off the stream.
    ///
    /// Reads the fixed envelope first, then exactly the advertised payload.
    /// A short read maps to `UnexpectedEof`.
    pub async fn read(&mut self) -> Result<NetworkMessage, TransportError> {
        let mut header = [0u8; HEADER_SIZE];
        self.reader.read_exact(&mut header).await?;

        let payload_len = u32::from_le_bytes([
            header[PAYLOAD_LENGTH_OFFSET],
            header[PAYLOAD_LENGTH_OFFSET + 1],
            header[PAYLOAD_LENGTH_OFFSET + 2],
            header[PAYLOAD_LENGTH_OFFSET + 3],
        ]) as usize;

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized message payload",
            )));
        }

        let mut buffer = vec![0u8; HEADER_SIZE + payload_len];
        buffer[..HEADER_SIZE].copy_from_slice(&header);
        self.reader.read_exact(&mut buffer[HEADER_SIZE..]).await?;

        let raw: RawNetworkMessage = encode::deserialize(&buffer)?;
        if raw.magic() != &self.magic {
            return Err(TransportError::MagicMismatch);
        }

        Ok(raw.payload().clone())
    }
}
