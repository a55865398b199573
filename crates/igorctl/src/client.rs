//! TCP client for igord's framed wire protocol (spec.md Section 4.3).
//!
//! Unlike `loopctl`'s HTTP client, igord has no HTTP surface: order
//! creators and subscribers speak the same terminator-framed JSON
//! protocol workers do (spec.md Section 6).

use igor_core::wire::{codec, FrameDecoder};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to igord at {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        source: std::io::Error,
    },
    #[error("connection to igord lost: {0}")]
    Io(#[from] std::io::Error),
    #[error("igord returned a malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
    #[error("igord rejected the request: {kind}: {message}")]
    Rejected { kind: String, message: String },
}

/// A short-lived connection to igord, speaking the server-direction
/// (`0x0B`-terminated) side of the protocol (spec.md Section 4.3).
pub struct Client {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl Client {
    pub async fn connect(host: &str, port: u16) -> Result<Self, ClientError> {
        let addr = format!("{host}:{port}");
        let stream =
            TcpStream::connect(&addr)
                .await
                .map_err(|source| ClientError::ConnectionFailed { addr, source })?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
        })
    }

    /// Send one command frame.
    pub async fn send(&mut self, command: &str, params: Value) -> Result<(), ClientError> {
        let frame = serde_json::json!({"command": command, "params": params});
        let payload = serde_json::to_vec(&frame)?;
        let framed = codec::encode_frame(&payload, codec::SERVER_DIRECTION_TERMINATOR);
        self.stream.write_all(&framed).await?;
        Ok(())
    }

    /// Read the next complete frame, blocking until one arrives.
    pub async fn read_frame(&mut self) -> Result<Value, ClientError> {
        loop {
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "igord closed the connection",
                )));
            }
            if let Some(frame) = self.decoder.feed(&buf[..n]).into_iter().next() {
                return Ok(serde_json::from_slice(&frame)?);
            }
        }
    }

    /// Read one frame if it arrives within `window`, otherwise `None`.
    /// Used after `OrderCreate` to surface an immediate `ParamError`
    /// without the short-lived order creator hanging forever waiting
    /// for a reply that may never come (spec.md Section 2: the order
    /// creator "sends one `OrderCreate`, and disconnects").
    pub async fn try_read_frame(&mut self, window: Duration) -> Option<Value> {
        timeout(window, self.read_frame()).await.ok()?.ok()
    }
}

/// Interpret a frame as an error, if it is one.
pub fn as_error(frame: &Value) -> Option<ClientError> {
    let kind = frame.get("error")?.as_str()?.to_string();
    let message = frame
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(ClientError::Rejected { kind, message })
}
