//! META test: client metadata as `key:value` TEST_MSG lines

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{EngineContext, TestOutcome};
use crate::control::ControlChannel;
use crate::protocol::{
    META_BROWSER_OS, META_CLIENT_APPLICATION, META_CLIENT_KERNEL_VERSION, META_CLIENT_OS,
    META_CLIENT_VERSION, MessageType,
};

/// Values reported to the server during the META test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaInfo {
    pub os_name: String,
    pub browser: String,
    pub kernel_version: String,
    pub client_version: String,
    pub application: String,
}

impl MetaInfo {
    pub fn detect(user_agent: Option<&str>, client_version: &str, application: &str) -> Self {
        Self {
            os_name: os_name(),
            browser: browser_name(user_agent.unwrap_or_default()),
            kernel_version: kernel_version(),
            client_version: client_version.to_string(),
            application: application.to_string(),
        }
    }

    pub fn pairs(&self) -> [(&'static str, &str); 5] {
        [
            (META_CLIENT_OS, &self.os_name),
            (META_BROWSER_OS, &self.browser),
            (META_CLIENT_KERNEL_VERSION, &self.kernel_version),
            (META_CLIENT_VERSION, &self.client_version),
            (META_CLIENT_APPLICATION, &self.application),
        ]
    }
}

fn os_name() -> String {
    match std::env::consts::OS {
        "linux" => "Linux".to_string(),
        "macos" => "Mac OS X".to_string(),
        "windows" => "Windows".to_string(),
        "freebsd" => "FreeBSD".to_string(),
        other => other.to_string(),
    }
}

fn kernel_version() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Best-effort browser name from a user-agent string. Order matters:
/// Chromium-based browsers also advertise "Chrome" and "Safari".
pub fn browser_name(user_agent: &str) -> String {
    const KNOWN: &[(&str, &str)] = &[
        ("Edg/", "Edge"),
        ("OPR/", "Opera"),
        ("Opera", "Opera"),
        ("Firefox/", "Firefox"),
        ("Chrome/", "Chrome"),
        ("Safari/", "Safari"),
        ("Trident/", "Internet Explorer"),
        ("MSIE", "Internet Explorer"),
    ];

    if let Some((_, name)) = KNOWN.iter().find(|(token, _)| user_agent.contains(token)) {
        return name.to_string();
    }

    // Otherwise the leading product token, e.g. "curl/8.0" -> "curl"
    user_agent
        .split_whitespace()
        .next()
        .and_then(|product| product.split('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("-")
        .to_string()
}

pub async fn run<S>(control: &mut ControlChannel<S>, ctx: &EngineContext<'_>) -> TestOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = exchange(control, ctx).await;
    if let Err(ref e) = result {
        warn!("META test incomplete: {:#}", e);
    }
    TestOutcome::default().finish(result)
}

async fn exchange<S>(control: &mut ControlChannel<S>, ctx: &EngineContext<'_>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    control.expect(MessageType::TestPrepare).await?;
    control.expect(MessageType::TestStart).await?;
    ctx.progress.status("Sending meta information").await;

    for (key, value) in ctx.meta.pairs() {
        debug!("META {}:{}", key, value);
        control
            .send(MessageType::TestMsg, format!("{}:{}", key, value).as_bytes())
            .await?;
    }
    // Empty TEST_MSG ends the list
    control.send(MessageType::TestMsg, b"").await?;

    control.expect(MessageType::TestFinalize).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use super::*;
    use crate::config::Timings;
    use crate::net::{AddressFamily, Dialer};
    use crate::stats::Progress;

    fn meta() -> MetaInfo {
        MetaInfo {
            os_name: "Linux".to_string(),
            browser: "ndtc".to_string(),
            kernel_version: "6.1.0".to_string(),
            client_version: "3.7.0.2".to_string(),
            application: "ndtc".to_string(),
        }
    }

    fn dialer() -> Dialer {
        Dialer {
            host: "127.0.0.1".to_string(),
            family: AddressFamily::V4Only,
            bind_ip: None,
            tls: None,
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_browser_name() {
        let chrome = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
        assert_eq!(browser_name(chrome), "Chrome");
        let edge = "Mozilla/5.0 (Windows NT 10.0) AppleWebKit/537.36 Chrome/120.0 Safari/537.36 Edg/120.0";
        assert_eq!(browser_name(edge), "Edge");
        assert_eq!(
            browser_name("Mozilla/5.0 (X11; rv:121.0) Gecko/20100101 Firefox/121.0"),
            "Firefox"
        );
        assert_eq!(browser_name("ndtc/0.1.0"), "ndtc");
        assert_eq!(browser_name(""), "-");
    }

    #[tokio::test]
    async fn test_meta_exchange() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = ControlChannel::new(client, true, Duration::from_secs(1));
        let mut server = ControlChannel::new(server, true, Duration::from_secs(1));

        let script = tokio::spawn(async move {
            server.send(MessageType::TestPrepare, b"").await.unwrap();
            server.send(MessageType::TestStart, b"").await.unwrap();
            let mut lines = Vec::new();
            loop {
                let msg = server.expect(MessageType::TestMsg).await.unwrap();
                if msg.body.is_empty() {
                    break;
                }
                lines.push(msg.body_str());
            }
            server.send(MessageType::TestFinalize, b"").await.unwrap();
            lines
        });

        let dialer = dialer();
        let timings = Timings::default();
        let progress = Progress::default();
        let meta = meta();
        let ctx = EngineContext {
            dialer: &dialer,
            server_ip: Ipv4Addr::LOCALHOST.into(),
            timings: &timings,
            progress: &progress,
            meta: &meta,
        };
        let outcome = run(&mut client, &ctx).await;
        assert!(outcome.completed, "{:?}", outcome.error);

        let lines = script.await.unwrap();
        assert_eq!(
            lines,
            vec![
                "client.os.name:Linux",
                "client.browser.name:ndtc",
                "client.kernel.version:6.1.0",
                "client.version:3.7.0.2",
                "client.application:ndtc",
            ]
        );
    }

    #[tokio::test]
    async fn test_meta_wrong_message_is_incomplete() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = ControlChannel::new(client, false, Duration::from_secs(1));
        let mut server = ControlChannel::new(server, false, Duration::from_secs(1));
        server.send(MessageType::TestStart, b"").await.unwrap();

        let dialer = dialer();
        let timings = Timings::default();
        let progress = Progress::default();
        let meta = meta();
        let ctx = EngineContext {
            dialer: &dialer,
            server_ip: Ipv4Addr::LOCALHOST.into(),
            timings: &timings,
            progress: &progress,
            meta: &meta,
        };
        let outcome = run(&mut client, &ctx).await;
        assert!(!outcome.completed);
        assert!(outcome.error.unwrap().contains("TEST_PREPARE"));
    }
}
