//! Sub-test engines
//!
//! Each engine drives one server-assigned test over the control channel
//! and, for the throughput tests, a data connection of its own. Engines
//! never fail the session: every error becomes an incomplete [`TestOutcome`].

pub mod c2s;
pub mod meta;
pub mod s2c;

use std::net::{IpAddr, SocketAddr};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::Timings;
use crate::control::{ControlChannel, ExchangeError};
use crate::net::Dialer;
use crate::protocol::{Message, MessageType};
use crate::stats::Progress;
use crate::tls::MaybeTlsStream;

pub use meta::MetaInfo;

/// Result of one sub-test.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestOutcome {
    pub completed: bool,
    pub error: Option<String>,
    /// Throughput measured on this side of the data connection
    pub local_mbps: f64,
    /// Throughput the server measured
    pub server_mbps: f64,
    /// Bytes moved over the data connection
    pub bytes: u64,
    /// S2C only: bytes still queued in the server's socket when it stopped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsent_bytes: Option<i32>,
    /// S2C only: total bytes the server reports having sent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_sent_bytes: Option<f64>,
    /// S2C only: server variable dumps received after the test
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl TestOutcome {
    pub(crate) fn finish(mut self, result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => self.completed = true,
            Err(e) => {
                self.completed = false;
                self.error = Some(format!("{:#}", e));
            }
        }
        self
    }
}

/// What an engine needs besides the control channel.
pub struct EngineContext<'a> {
    pub dialer: &'a Dialer,
    /// Peer of the control connection; data ports are opened on it
    pub server_ip: IpAddr,
    pub timings: &'a Timings,
    pub progress: &'a Progress,
    pub meta: &'a MetaInfo,
}

/// Receive TEST_PREPARE, connect to the advertised port and wait for TEST_START.
pub(crate) async fn open_data_connection<S>(
    control: &mut ControlChannel<S>,
    ctx: &EngineContext<'_>,
) -> anyhow::Result<MaybeTlsStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let prepare = control.expect(MessageType::TestPrepare).await?;
    let port = parse_port(&prepare)?;
    let addr = SocketAddr::new(ctx.server_ip, port);
    let stream = ctx
        .dialer
        .dial_addr(addr)
        .await
        .map_err(|e| anyhow::anyhow!("data connection to port {} failed: {:#}", port, e))?;
    tracing::debug!("Data connection open to {}", addr);
    control.expect(MessageType::TestStart).await?;
    Ok(stream)
}

fn parse_port(msg: &Message) -> Result<u16, ExchangeError> {
    // JSON servers may append extra tokens; the port comes first.
    let body = msg.body_str();
    let port = body.split_whitespace().next().and_then(|p| p.parse().ok());
    port.ok_or_else(|| ExchangeError::Malformed {
        msg_type: msg.msg_type,
        body: body.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::net::AddressFamily;

    #[test]
    fn test_parse_port() {
        let msg = Message::new(MessageType::TestPrepare, "3002");
        assert_eq!(parse_port(&msg).unwrap(), 3002);
        let msg = Message::new(MessageType::TestPrepare, "3003 1 0");
        assert_eq!(parse_port(&msg).unwrap(), 3003);
        let msg = Message::new(MessageType::TestPrepare, "port");
        assert!(parse_port(&msg).is_err());
    }

    #[test]
    fn test_finish_records_error() {
        let outcome = TestOutcome::default().finish(Err(anyhow::anyhow!("boom")));
        assert!(!outcome.completed);
        assert_eq!(outcome.error.as_deref(), Some("boom"));

        let outcome = TestOutcome::default().finish(Ok(()));
        assert!(outcome.completed);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_data_connection_uses_control_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (client, server) = tokio::io::duplex(4096);
        let mut client = ControlChannel::new(client, true, Duration::from_secs(2));
        let mut server = ControlChannel::new(server, true, Duration::from_secs(2));
        let script = tokio::spawn(async move {
            server
                .send(MessageType::TestPrepare, port.to_string().as_bytes())
                .await
                .unwrap();
            let (mut data, _) = listener.accept().await.unwrap();
            server.send(MessageType::TestStart, b"").await.unwrap();
            let mut buf = [0u8; 1];
            data.read(&mut buf).await.unwrap()
        });

        // The host name is never resolved for data ports
        let dialer = Dialer {
            host: "no-such-host.invalid".to_string(),
            family: AddressFamily::DualStack,
            bind_ip: None,
            tls: None,
            connect_timeout: Duration::from_secs(2),
        };
        let timings = Timings::default();
        let progress = Progress::default();
        let meta = MetaInfo {
            os_name: "Linux".to_string(),
            browser: "ndtc".to_string(),
            kernel_version: "6.1.0".to_string(),
            client_version: "3.7.0.2".to_string(),
            application: "ndtc".to_string(),
        };
        let ctx = EngineContext {
            dialer: &dialer,
            server_ip: Ipv4Addr::LOCALHOST.into(),
            timings: &timings,
            progress: &progress,
            meta: &meta,
        };

        let stream = open_data_connection(&mut client, &ctx).await.unwrap();
        drop(stream);
        assert_eq!(script.await.unwrap(), 0);
    }
}
