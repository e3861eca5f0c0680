//! Length-prefixed framing over any async byte stream

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::super::TorrentError;
use super::messages::{MAX_FRAME_LEN, MessageCodec};
use super::types::PeerMessage;

/// Reads whole peer-wire messages from a stream.
///
/// `read_message` is not cancel safe; run it in its own task or loop
/// rather than as one branch of a `select!`.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next message.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnection` - Stream closed or read failed
    /// - `TorrentError::ProtocolMismatch` - Oversized frame or malformed message
    pub async fn read_message(&mut self) -> Result<PeerMessage, TorrentError> {
        let mut length_buf = [0u8; 4];
        self.reader
            .read_exact(&mut length_buf)
            .await
            .map_err(|e| TorrentError::peer(format!("failed to read message length: {e}")))?;

        let length = u32::from_be_bytes(length_buf);
        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if length > MAX_FRAME_LEN {
            return Err(TorrentError::protocol(format!(
                "frame of {length} bytes exceeds limit"
            )));
        }

        let mut body = vec![0u8; length as usize];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(|e| TorrentError::peer(format!("failed to read message payload: {e}")))?;

        MessageCodec::decode_payload(Bytes::from(body))
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes peer-wire messages to a stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Sends one message, returning the number of bytes written.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnection` - Write failed
    pub async fn send(&mut self, message: &PeerMessage) -> Result<usize, TorrentError> {
        let frame = MessageCodec::serialize_message(message);
        self.writer
            .write_all(&frame)
            .await
            .map_err(|e| TorrentError::peer(format!("failed to send {}: {e}", message.kind())))?;
        self.writer
            .flush()
            .await
            .map_err(|e| TorrentError::peer(format!("failed to send {}: {e}", message.kind())))?;
        Ok(frame.len())
    }

    /// Shuts down the write side; errors are irrelevant at this point.
    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Opens a TCP connection with a deadline.
///
/// # Errors
/// - `TorrentError::PeerConnection` - Refused, unreachable or timed out
pub async fn connect_with_timeout(
    address: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream, TorrentError> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true).ok();
            Ok(stream)
        }
        Ok(Err(e)) => Err(TorrentError::peer(format!(
            "failed to connect to {address}: {e}"
        ))),
        Err(_) => Err(TorrentError::peer(format!(
            "connection to {address} timed out"
        ))),
    }
}
