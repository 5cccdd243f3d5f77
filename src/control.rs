//! Control channel
//!
//! Wraps the control stream together with the session's dialect flag and
//! read timeout. Sub-test engines borrow it for their message exchanges.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::codec::{self, CodecError, ReadError};
use crate::protocol::{Message, MessageType};

/// Failure of a single request/reply step on the control channel.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Write(#[from] CodecError),
    #[error("protocol error: expected {expected}, received {got}{}", server_detail(.got, .body))]
    Unexpected {
        expected: MessageType,
        got: MessageType,
        body: String,
    },
    #[error("protocol error: malformed {msg_type} body {body:?}")]
    Malformed { msg_type: MessageType, body: String },
}

fn server_detail(got: &MessageType, body: &str) -> String {
    if *got == MessageType::Error && !body.is_empty() {
        format!(" ({})", body)
    } else {
        String::new()
    }
}

pub struct ControlChannel<S> {
    stream: S,
    json: bool,
    read_timeout: Duration,
}

impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, json: bool, read_timeout: Duration) -> Self {
        Self {
            stream,
            json,
            read_timeout,
        }
    }

    pub fn json_mode(&self) -> bool {
        self.json
    }

    /// Switch to the legacy dialect. There is no way back.
    pub fn downgrade(&mut self) {
        self.json = false;
    }

    /// Send a message in the session's dialect.
    pub async fn send(&mut self, msg_type: MessageType, payload: &[u8]) -> Result<(), CodecError> {
        trace!("-> {} ({} bytes)", msg_type, payload.len());
        codec::write_message(&mut self.stream, msg_type, payload, self.json).await
    }

    /// Send a body that is already in its final wire form.
    pub async fn send_raw(&mut self, msg_type: MessageType, body: &[u8]) -> Result<(), CodecError> {
        trace!("-> {} raw ({} bytes)", msg_type, body.len());
        codec::write_message(&mut self.stream, msg_type, body, false).await
    }

    pub async fn recv(&mut self) -> Result<Message, ReadError> {
        let timeout = self.read_timeout;
        self.recv_timeout(timeout).await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Message, ReadError> {
        let json = self.json;
        let msg = tokio::time::timeout(timeout, codec::decode(&mut self.stream, json))
            .await
            .map_err(|_| ReadError::Timeout(timeout))??;
        trace!("<- {} ({} bytes)", msg.msg_type, msg.body.len());
        Ok(msg)
    }

    /// Receive a message and insist on its type.
    pub async fn expect(&mut self, expected: MessageType) -> Result<Message, ExchangeError> {
        let msg = self.recv().await?;
        check_type(msg, expected)
    }

    /// Read and discard the fixed-length compatibility preamble.
    pub async fn read_preamble(&mut self, len: usize, timeout: Duration) -> Result<(), ReadError> {
        let bytes = tokio::time::timeout(timeout, codec::read_exact(&mut self.stream, len))
            .await
            .map_err(|_| ReadError::Timeout(timeout))??;
        debug!("Discarded {} byte preamble", bytes.len());
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Control shutdown: {}", e);
        }
    }
}

fn check_type(msg: Message, expected: MessageType) -> Result<Message, ExchangeError> {
    if msg.msg_type == expected {
        Ok(msg)
    } else {
        Err(ExchangeError::Unexpected {
            expected,
            got: msg.msg_type,
            body: msg.body_str(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_expect_wrong_type_reports_server_error() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = ControlChannel::new(client, false, Duration::from_secs(1));
        let mut server = ControlChannel::new(server, false, Duration::from_secs(1));

        server.send(MessageType::Error, b"server overloaded").await.unwrap();
        let err = client.expect(MessageType::TestPrepare).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("TEST_PREPARE"));
        assert!(text.contains("server overloaded"));
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut client = ControlChannel::new(client, true, Duration::from_millis(20));
        assert!(matches!(client.recv().await, Err(ReadError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_downgrade_changes_framing() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut client = ControlChannel::new(client, true, Duration::from_secs(1));
        client.downgrade();
        assert!(!client.json_mode());
        client.send(MessageType::TestMsg, b"42").await.unwrap();
        let msg = codec::decode(&mut server, false).await.unwrap();
        assert_eq!(msg.body, b"42");
    }

    #[tokio::test]
    async fn test_read_preamble() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut client = ControlChannel::new(client, true, Duration::from_secs(1));
        server.write_all(b"123456 654321").await.unwrap();
        client
            .read_preamble(13, Duration::from_secs(1))
            .await
            .unwrap();
    }
}
