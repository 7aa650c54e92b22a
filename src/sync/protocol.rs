//! Wire messages and newline-delimited JSON framing.

use super::SyncStats;
use crate::error::{KeychainError, Result};
use crate::models::{Chain, ChainLink};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::debug;

/// Version spoken by this build. Peers with another version are refused.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame, newline included.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A single protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello { version: u32, peer: String },
    Snapshot {
        chains: Vec<Chain>,
        links: Vec<ChainLink>,
    },
    Done { stats: SyncStats },
    Error { message: String },
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Snapshot { .. } => "snapshot",
            Message::Done { .. } => "done",
            Message::Error { .. } => "error",
        }
    }
}

/// A framed, timed connection to a peer.
pub struct Connection<S> {
    stream: BufStream<S>,
    timeout: Duration,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream: BufStream::new(stream),
            timeout,
        }
    }

    /// Send one message.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let mut frame = serde_json::to_vec(message)?;
        if frame.len() >= MAX_FRAME_LEN {
            return Err(KeychainError::Protocol(format!(
                "{} frame of {} bytes exceeds the limit",
                message.kind(),
                frame.len()
            )));
        }
        frame.push(b'\n');

        let write = async {
            self.stream.write_all(&frame).await?;
            self.stream.flush().await
        };
        tokio::time::timeout(self.timeout, write)
            .await
            .map_err(|_| KeychainError::Timeout)??;

        debug!(kind = message.kind(), bytes = frame.len(), "Sent frame");
        Ok(())
    }

    /// Receive one message. A peer `Error` message is returned as
    /// [`KeychainError::Peer`].
    pub async fn recv(&mut self) -> Result<Message> {
        let mut frame = Vec::new();
        let read = async {
            let mut limited = (&mut self.stream).take(MAX_FRAME_LEN as u64);
            limited.read_until(b'\n', &mut frame).await
        };
        let read = tokio::time::timeout(self.timeout, read)
            .await
            .map_err(|_| KeychainError::Timeout)??;

        if read == 0 {
            return Err(KeychainError::Protocol("connection closed by peer".to_string()));
        }
        if frame.last() != Some(&b'\n') {
            return Err(KeychainError::Protocol(if frame.len() >= MAX_FRAME_LEN {
                "frame exceeds the size limit".to_string()
            } else {
                "connection closed mid-frame".to_string()
            }));
        }

        let message: Message = serde_json::from_slice(&frame)
            .map_err(|e| KeychainError::Protocol(format!("malformed frame: {e}")))?;
        debug!(kind = message.kind(), bytes = frame.len(), "Received frame");

        match message {
            Message::Error { message } => Err(KeychainError::Peer(message)),
            message => Ok(message),
        }
    }

    /// Best-effort error report to the peer.
    pub async fn send_error(&mut self, error: &KeychainError) {
        let message = Message::Error {
            message: error.to_string(),
        };
        if let Err(e) = self.send(&message).await {
            debug!(error = %e, "Could not report error to peer");
        }
    }
}

/// Check a peer's hello and return its name.
pub fn check_hello(message: Message) -> Result<String> {
    match message {
        Message::Hello { version, peer } if version == PROTOCOL_VERSION => Ok(peer),
        Message::Hello { version, .. } => Err(KeychainError::Protocol(format!(
            "unsupported protocol version {version}, expected {PROTOCOL_VERSION}"
        ))),
        other => Err(unexpected("hello", &other)),
    }
}

/// Error for a message arriving out of order.
pub fn unexpected(expected: &str, got: &Message) -> KeychainError {
    KeychainError::Protocol(format!("expected {expected}, got {}", got.kind()))
}
