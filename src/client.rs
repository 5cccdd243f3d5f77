//! Client session
//!
//! Runs one NDT session against a server: login, queue negotiation, version
//! check, the server-assigned sub-tests, and the final results drain.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::codec::{CodecError, ReadError};
use crate::config::Timings;
use crate::control::ControlChannel;
use crate::net::{AddressFamily, Dialer};
use crate::protocol::{
    DEFAULT_PORT, DEFAULT_TLS_PORT, MessageType, PREAMBLE_LEN, PROTOCOL_VERSION, QueueStatus,
    STOPPED_BY_USER, ServerVersion, TestKind, TestSet, extended_login_body,
};
use crate::results::{DiagnosticCounters, DirectionalThroughput, LinkClassification};
use crate::stats::{Progress, ProgressEvent};
use crate::subtest::{self, EngineContext, MetaInfo, TestOutcome};
use crate::tls::{MaybeTlsStream, TlsClientConfig};

/// Reply some servers send instead of SRV_QUEUE when they reject the login outright.
const INVALID_LOGIN: &str = "Invalid login message.";

#[derive(Clone)]
pub struct ClientConfig {
    pub host: String,
    /// Control port; defaults to 3001, or 3010 with TLS
    pub port: Option<u16>,
    pub tls: TlsClientConfig,
    pub address_family: AddressFamily,
    /// Local address for the control and data connections
    pub bind_ip: Option<IpAddr>,
    pub tests: TestSet,
    pub client_version: String,
    /// Reported in the META test
    pub application: String,
    /// META browser name is derived from this
    pub user_agent: Option<String>,
    pub timings: Timings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            tls: TlsClientConfig::default(),
            address_family: AddressFamily::default(),
            bind_ip: None,
            tests: TestSet::default(),
            client_version: PROTOCOL_VERSION.to_string(),
            application: env!("CARGO_PKG_NAME").to_string(),
            user_agent: None,
            timings: Timings::default(),
        }
    }
}

impl ClientConfig {
    pub fn control_port(&self) -> u16 {
        self.port.unwrap_or(if self.tls.enabled {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        })
    }
}

/// Session states, in the order a successful session visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connecting,
    LoggingIn,
    Queued,
    Negotiating,
    Running,
    Draining,
    Closed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Connecting => write!(f, "connect"),
            Phase::LoggingIn => write!(f, "login"),
            Phase::Queued => write!(f, "queue negotiation"),
            Phase::Negotiating => write!(f, "test negotiation"),
            Phase::Running => write!(f, "tests"),
            Phase::Draining => write!(f, "results"),
            Phase::Closed => write!(f, "logout"),
        }
    }
}

impl Phase {
    /// Progress line announced on entering the phase.
    fn status_line(self) -> &'static str {
        match self {
            Phase::Connecting => "Connecting",
            Phase::LoggingIn => "Logging in",
            Phase::Queued => "Waiting for the server to start the test",
            Phase::Negotiating => "Negotiating tests",
            Phase::Running => "Running tests",
            Phase::Draining => "Receiving results",
            Phase::Closed => "Session complete",
        }
    }
}

async fn enter(progress: &Progress, phase: Phase) {
    debug!("Phase: {}", phase);
    progress.status(phase.status_line()).await;
}

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unable to connect to {target}: {message}")]
    Connect { target: String, message: String },
    #[error("server did not send the login preamble ({0}); client unsupported")]
    UnsupportedClient(ReadError),
    #[error("server rejected the login: {0}")]
    LoginRejected(String),
    #[error("server fault, test aborted")]
    ServerFault,
    #[error("server busy, try again later")]
    ServerBusy,
    #[error("server busy, retry in 60 seconds")]
    ServerBusyRetry,
    #[error("incompatible server version {0:?}")]
    IncompatibleVersion(String),
    #[error("protocol error during {phase}: expected {expected}, received {got}")]
    Unexpected {
        phase: Phase,
        expected: MessageType,
        got: MessageType,
    },
    #[error("protocol error during {phase}: malformed message body {body:?}")]
    Malformed { phase: Phase, body: String },
    #[error("unknown test ID {0} in negotiated test list")]
    UnknownTestId(i32),
    #[error("read failed during {phase}: {source}")]
    Read {
        phase: Phase,
        #[source]
        source: ReadError,
    },
    #[error(transparent)]
    Write(#[from] CodecError),
    #[error("stopped by user")]
    Stopped,
    #[error("a test session is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    Failed { message: String },
    Stopped,
}

/// Everything a session produced, whether or not it finished.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_addr: Option<SocketAddr>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: SessionStatus,
    /// Whether the server accepted the JSON dialect. Only set once the
    /// queue handshake completes.
    pub json_dialect: bool,
    pub tls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<ServerVersion>,
    pub requested_tests: TestSet,
    /// Requested tests minus the ones that did not complete
    pub tests: TestSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c2s: Option<TestOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s2c: Option<TestOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<TestOutcome>,
    /// Per-test failure messages, in the order they happened
    pub errors: Vec<String>,
    pub raw_results: String,
    pub counters: DiagnosticCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<LinkClassification>,
}

impl SessionReport {
    fn new(config: &ClientConfig) -> Self {
        Self {
            server: format!("{}:{}", config.host, config.control_port()),
            server_addr: None,
            started_at: Utc::now(),
            duration_ms: 0,
            status: SessionStatus::Completed,
            json_dialect: false,
            tls: config.tls.enabled,
            server_version: None,
            requested_tests: config.tests,
            tests: config.tests,
            c2s: None,
            s2c: None,
            meta: None,
            errors: Vec::new(),
            raw_results: String::new(),
            counters: DiagnosticCounters::default(),
            classification: None,
        }
    }

    fn record(&mut self, kind: TestKind, outcome: TestOutcome) {
        if !outcome.completed {
            self.tests.remove(kind.bit());
            let reason = outcome.error.as_deref().unwrap_or("unknown error");
            self.errors.push(format!("{} failed: {}", kind, reason));
        }
        match kind {
            TestKind::C2s => self.c2s = Some(outcome),
            TestKind::S2c => self.s2c = Some(outcome),
            TestKind::Meta => self.meta = Some(outcome),
        }
    }

    /// Throughput pairs for the directions that completed.
    fn measured_directions(&self) -> (Option<DirectionalThroughput>, Option<DirectionalThroughput>) {
        let c2s = self
            .c2s
            .as_ref()
            .filter(|_| self.tests.contains(TestSet::C2S))
            .map(|o| DirectionalThroughput {
                sender_mbps: o.local_mbps,
                receiver_mbps: o.server_mbps,
            });
        let s2c = self
            .s2c
            .as_ref()
            .filter(|_| self.tests.contains(TestSet::S2C))
            .map(|o| DirectionalThroughput {
                sender_mbps: o.server_mbps,
                receiver_mbps: o.local_mbps,
            });
        (c2s, s2c)
    }

    pub fn is_success(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

/// Clears the running flag when a session ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Client {
    config: ClientConfig,
    /// Polled between sub-tests
    cancel_tx: Arc<watch::Sender<bool>>,
    running: AtomicBool,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            config,
            cancel_tx: Arc::new(cancel_tx),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Ask the running session to stop before its next sub-test.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Run one session. Session failures are reported in the returned
    /// [`SessionReport`]; `Err` means the session never started.
    pub async fn run(
        &self,
        progress_tx: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<SessionReport, SessionError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let started = Instant::now();
        let progress = Progress::new(progress_tx);
        let cancel_rx = self.cancel_tx.subscribe();
        let mut report = SessionReport::new(&self.config);

        let result = self.run_session(&mut report, &progress, &cancel_rx).await;
        report.status = match result {
            Ok(()) => {
                info!("Session complete");
                SessionStatus::Completed
            }
            Err(SessionError::Stopped) => {
                warn!("Session stopped by user");
                SessionStatus::Stopped
            }
            Err(e) => {
                error!("Session failed: {}", e);
                progress.status(format!("Session failed: {}", e)).await;
                SessionStatus::Failed {
                    message: e.to_string(),
                }
            }
        };
        report.duration_ms = started.elapsed().as_millis() as u64;
        self.cancel_tx.send_replace(false);
        Ok(report)
    }

    async fn run_session(
        &self,
        report: &mut SessionReport,
        progress: &Progress,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        let config = &self.config;
        let port = config.control_port();
        let target = format!("{}:{}", config.host, port);

        let connector = config
            .tls
            .create_connector()
            .map_err(|e| SessionError::Connect {
                target: target.clone(),
                message: format!("{:#}", e),
            })?;
        let dialer = Dialer {
            host: config.host.clone(),
            family: config.address_family,
            bind_ip: config.bind_ip,
            tls: connector,
            connect_timeout: config.timings.connect_timeout,
        };

        debug!("Phase: {}", Phase::Connecting);
        info!("Connecting to {}...", target);
        progress.status(format!("Connecting to {}", target)).await;
        let (stream, addr) = connect_control(&dialer, port, &target).await?;
        report.server_addr = Some(addr);
        // Data ports are opened on the control peer
        let mut server_ip = addr.ip();

        let mut control = ControlChannel::new(stream, true, config.timings.control_timeout);
        enter(progress, Phase::LoggingIn).await;
        self.login(&mut control).await?;

        enter(progress, Phase::Queued).await;
        let mut retried = false;
        let mut waited = false;
        loop {
            let msg = control.recv().await.map_err(read_err(Phase::Queued))?;

            if msg.msg_type != MessageType::SrvQueue {
                let body = msg.body_str();
                if body == INVALID_LOGIN {
                    return Err(SessionError::LoginRejected(body));
                }
                if retried {
                    return Err(SessionError::Unexpected {
                        phase: Phase::LoggingIn,
                        expected: MessageType::SrvQueue,
                        got: msg.msg_type,
                    });
                }
                retried = true;
                warn!(
                    "Server answered extended login with {}, retrying with legacy login",
                    msg.msg_type
                );
                progress
                    .status("Server does not support extended login, retrying")
                    .await;
                control.shutdown().await;
                let (stream, addr) = connect_control(&dialer, port, &target).await?;
                report.server_addr = Some(addr);
                server_ip = addr.ip();
                control = ControlChannel::new(stream, false, config.timings.control_timeout);
                self.login(&mut control).await?;
                continue;
            }

            let code = msg.body_int().ok_or_else(|| SessionError::Malformed {
                phase: Phase::Queued,
                body: msg.body_str(),
            })?;
            match QueueStatus::from_code(code) {
                QueueStatus::StartNow => break,
                QueueStatus::ServerFault => return Err(SessionError::ServerFault),
                // Busy after having been queued means the server gave up on us
                QueueStatus::ServerBusy if waited => return Err(SessionError::ServerFault),
                QueueStatus::ServerBusy => return Err(SessionError::ServerBusy),
                QueueStatus::ServerBusyRetry => return Err(SessionError::ServerBusyRetry),
                QueueStatus::Heartbeat => {
                    debug!("Queue heartbeat");
                    let tests = config.tests.bits();
                    if control.json_mode() {
                        control
                            .send(MessageType::Waiting, tests.to_string().as_bytes())
                            .await?;
                    } else {
                        control.send(MessageType::Waiting, &[tests]).await?;
                    }
                }
                QueueStatus::Wait(minutes) => {
                    let wait_secs = (minutes.max(0) as u64) * 60;
                    info!("Queued behind other clients, about {} s", wait_secs);
                    progress.emit(ProgressEvent::Queued { wait_secs }).await;
                    waited = true;
                }
            }
        }
        report.json_dialect = control.json_mode();

        enter(progress, Phase::Negotiating).await;
        let msg = expect(&mut control, MessageType::Login, Phase::Negotiating).await?;
        let body = msg.body_str();
        let version = ServerVersion::parse(&body).ok_or(SessionError::IncompatibleVersion(body))?;
        info!(
            "Server version {} ({})",
            version.version, version.server_type
        );
        if !version.matches_client() {
            warn!("Server has a different version number ({})", version.version);
            progress
                .warning(format!(
                    "Server has a different version number ({})",
                    version.version
                ))
                .await;
        }
        progress
            .status(format!("Server version {}", version.raw))
            .await;
        report.server_version = Some(version);

        let msg = expect(&mut control, MessageType::Login, Phase::Negotiating).await?;
        let assigned = parse_test_ids(&msg.body_str())?;
        debug!("Server assigned tests {:?}", assigned);
        let names: Vec<String> = assigned.iter().map(ToString::to_string).collect();
        progress
            .status(if names.is_empty() {
                "Server assigned no tests".to_string()
            } else {
                format!("Server assigned tests: {}", names.join(", "))
            })
            .await;

        enter(progress, Phase::Running).await;
        let meta = MetaInfo::detect(
            config.user_agent.as_deref(),
            &config.client_version,
            &config.application,
        );
        let ctx = EngineContext {
            dialer: &dialer,
            server_ip,
            timings: &config.timings,
            progress,
            meta: &meta,
        };
        for kind in assigned {
            if *cancel_rx.borrow() {
                return Err(stop(&mut control).await);
            }
            info!("Starting {} test", kind);
            progress.status(format!("Running {} test", kind)).await;
            let outcome = match kind {
                TestKind::C2s => subtest::c2s::run(&mut control, &ctx).await,
                TestKind::S2c => subtest::s2c::run(&mut control, &ctx).await,
                TestKind::Meta => subtest::meta::run(&mut control, &ctx).await,
            };
            if let Some(ref e) = outcome.error {
                progress.warning(format!("{} failed: {}", kind, e)).await;
            }
            report.record(kind, outcome);
        }
        if *cancel_rx.borrow() {
            return Err(stop(&mut control).await);
        }

        enter(progress, Phase::Draining).await;
        let mut results = String::new();
        let mut received = 0;
        loop {
            let msg = control.recv().await.map_err(read_err(Phase::Draining))?;
            match msg.msg_type {
                MessageType::Logout => break,
                MessageType::Results => {
                    results.push_str(&msg.body_str());
                    received += 1;
                }
                got => {
                    return Err(SessionError::Unexpected {
                        phase: Phase::Draining,
                        expected: MessageType::Results,
                        got,
                    });
                }
            }
        }
        if received == 0 {
            warn!("No results received from server");
            progress.warning("No results received from server").await;
        }
        control.shutdown().await;

        let diagnostics = report.s2c.as_ref().and_then(|o| o.diagnostics.as_deref());
        report.raw_results = match diagnostics {
            Some(dump) => format!("{}\n{}", dump, results),
            None => results,
        };
        report.counters = DiagnosticCounters::parse(&report.raw_results);
        let (c2s, s2c) = report.measured_directions();
        report.classification = LinkClassification::derive(&report.counters, c2s, s2c);
        enter(progress, Phase::Closed).await;
        Ok(())
    }

    /// Send the login for the current dialect and swallow the preamble.
    async fn login(&self, control: &mut ControlChannel<MaybeTlsStream>) -> Result<(), SessionError> {
        let tests = self.config.tests;
        if control.json_mode() {
            let body = extended_login_body(&self.config.client_version, tests);
            control
                .send_raw(MessageType::ExtendedLogin, body.as_bytes())
                .await?;
        } else {
            control.send(MessageType::Login, &[tests.bits()]).await?;
        }
        control
            .read_preamble(PREAMBLE_LEN, self.config.timings.preamble_timeout)
            .await
            .map_err(SessionError::UnsupportedClient)
    }
}

async fn connect_control(
    dialer: &Dialer,
    port: u16,
    target: &str,
) -> Result<(MaybeTlsStream, SocketAddr), SessionError> {
    let (stream, addr) = dialer
        .dial(port)
        .await
        .map_err(|e| SessionError::Connect {
            target: target.to_string(),
            message: format!("{:#}", e),
        })?;
    if let Err(e) = stream.tcp().set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on control connection: {}", e);
    }
    Ok((stream, addr))
}

async fn expect(
    control: &mut ControlChannel<MaybeTlsStream>,
    expected: MessageType,
    phase: Phase,
) -> Result<crate::protocol::Message, SessionError> {
    let msg = control.recv().await.map_err(read_err(phase))?;
    if msg.msg_type != expected {
        return Err(SessionError::Unexpected {
            phase,
            expected,
            got: msg.msg_type,
        });
    }
    Ok(msg)
}

/// Tell the server the user gave up, then close the control connection.
async fn stop(control: &mut ControlChannel<MaybeTlsStream>) -> SessionError {
    info!("Stopping session at user request");
    if let Err(e) = control
        .send(MessageType::Error, STOPPED_BY_USER.as_bytes())
        .await
    {
        debug!("Failed to send stop notice: {}", e);
    }
    control.shutdown().await;
    SessionError::Stopped
}

fn read_err(phase: Phase) -> impl Fn(ReadError) -> SessionError {
    move |source| SessionError::Read { phase, source }
}

/// Parse the server's test list. Tokens that are not integers are skipped;
/// an integer without an engine fails the whole list, before any test runs.
pub fn parse_test_ids(body: &str) -> Result<Vec<TestKind>, SessionError> {
    let mut kinds = Vec::new();
    for token in body.split_whitespace() {
        let Ok(id) = token.parse::<i32>() else {
            warn!("Skipping malformed test ID {:?}", token);
            continue;
        };
        kinds.push(TestKind::from_id(id).ok_or(SessionError::UnknownTestId(id))?);
    }
    Ok(kinds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_port_defaults() {
        let mut config = ClientConfig::default();
        assert_eq!(config.control_port(), 3001);
        config.tls.enabled = true;
        assert_eq!(config.control_port(), 3010);
        config.port = Some(4000);
        assert_eq!(config.control_port(), 4000);
    }

    #[test]
    fn test_parse_test_ids() {
        assert_eq!(
            parse_test_ids("2 4 32").unwrap(),
            vec![TestKind::C2s, TestKind::S2c, TestKind::Meta]
        );
        assert_eq!(parse_test_ids("2 x 32").unwrap(), vec![TestKind::C2s, TestKind::Meta]);
        assert!(parse_test_ids("").unwrap().is_empty());
        assert!(matches!(
            parse_test_ids("2 64"),
            Err(SessionError::UnknownTestId(64))
        ));
    }

    #[test]
    fn test_record_failed_outcome_clears_bit() {
        let config = ClientConfig::default();
        let mut report = SessionReport::new(&config);
        let outcome = TestOutcome {
            completed: false,
            error: Some("data connection refused".to_string()),
            ..Default::default()
        };
        report.record(TestKind::C2s, outcome);
        assert!(!report.tests.contains(TestSet::C2S));
        assert!(report.requested_tests.contains(TestSet::C2S));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("data connection refused"));
        assert!(report.measured_directions().0.is_none());
    }

    #[tokio::test]
    async fn test_already_running() {
        let client = Client::new(ClientConfig::default());
        client.running.store(true, Ordering::SeqCst);
        assert!(matches!(
            client.run(None).await,
            Err(SessionError::AlreadyRunning)
        ));
    }
}
