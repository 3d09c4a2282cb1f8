//! Frame codec for the fabric's byte streams.
//!
//! Length-delimited framing over any AsyncWrite/AsyncRead pair, with the
//! frame body serialized as JSON. Decoupled from any concrete socket type
//! so the TCP and in-memory transports share it.

use crate::{Frame, TransportError};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Framed writer for sending [`Frame`]s over any AsyncWrite stream.
pub struct FrameSink<W: AsyncWrite + Send + Unpin> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Send + Unpin> FrameSink<W> {
    pub fn new(stream: W) -> Self {
        Self {
            inner: FramedWrite::new(stream, LengthDelimitedCodec::new()),
        }
    }

    /// Send one length-prefixed frame.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(frame).map_err(|e| TransportError::Codec(e.to_string()))?;
        self.inner
            .send(bytes.into())
            .await
            .map_err(|e| TransportError::Codec(e.to_string()))
    }
}

/// Framed reader for receiving [`Frame`]s from any AsyncRead stream.
pub struct FrameStream<R: AsyncRead + Send + Unpin> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Send + Unpin> FrameStream<R> {
    pub fn new(stream: R) -> Self {
        Self {
            inner: FramedRead::new(stream, LengthDelimitedCodec::new()),
        }
    }

    /// Receive the next frame, or None once the stream closes.
    pub async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.inner.next().await {
            Some(Ok(bytes)) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| TransportError::Codec(e.to_string())),
            Some(Err(e)) => Err(TransportError::Codec(e.to_string())),
            None => Ok(None),
        }
    }
}
