//! NDT wire protocol definitions
//!
//! Message type codes, test identifiers, queue codes and the small JSON
//! envelope used by JSON-capable servers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client version announced in the extended login.
pub const PROTOCOL_VERSION: &str = "3.7.0.2";
pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_TLS_PORT: u16 = 3010;

/// Bytes the server writes right after login to kick off very old clients.
pub const PREAMBLE_LEN: usize = 13;

/// Header is type (1 byte) + big-endian length (2 bytes).
pub const HEADER_LEN: usize = 3;
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Body of the MSG_ERROR sent when the user aborts a session.
pub const STOPPED_BY_USER: &str = "Manually stopped by the user";

pub const META_CLIENT_OS: &str = "client.os.name";
pub const META_BROWSER_OS: &str = "client.browser.name";
pub const META_CLIENT_KERNEL_VERSION: &str = "client.kernel.version";
pub const META_CLIENT_VERSION: &str = "client.version";
pub const META_CLIENT_APPLICATION: &str = "client.application";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    CommFailure,
    SrvQueue,
    Login,
    TestPrepare,
    TestStart,
    TestMsg,
    TestFinalize,
    Error,
    Results,
    Logout,
    Waiting,
    ExtendedLogin,
    Unknown(u8),
}

impl MessageType {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => MessageType::CommFailure,
            1 => MessageType::SrvQueue,
            2 => MessageType::Login,
            3 => MessageType::TestPrepare,
            4 => MessageType::TestStart,
            5 => MessageType::TestMsg,
            6 => MessageType::TestFinalize,
            7 => MessageType::Error,
            8 => MessageType::Results,
            9 => MessageType::Logout,
            10 => MessageType::Waiting,
            11 => MessageType::ExtendedLogin,
            other => MessageType::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::CommFailure => 0,
            MessageType::SrvQueue => 1,
            MessageType::Login => 2,
            MessageType::TestPrepare => 3,
            MessageType::TestStart => 4,
            MessageType::TestMsg => 5,
            MessageType::TestFinalize => 6,
            MessageType::Error => 7,
            MessageType::Results => 8,
            MessageType::Logout => 9,
            MessageType::Waiting => 10,
            MessageType::ExtendedLogin => 11,
            MessageType::Unknown(code) => code,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::CommFailure => write!(f, "COMM_FAILURE"),
            MessageType::SrvQueue => write!(f, "SRV_QUEUE"),
            MessageType::Login => write!(f, "MSG_LOGIN"),
            MessageType::TestPrepare => write!(f, "TEST_PREPARE"),
            MessageType::TestStart => write!(f, "TEST_START"),
            MessageType::TestMsg => write!(f, "TEST_MSG"),
            MessageType::TestFinalize => write!(f, "TEST_FINALIZE"),
            MessageType::Error => write!(f, "MSG_ERROR"),
            MessageType::Results => write!(f, "MSG_RESULTS"),
            MessageType::Logout => write!(f, "MSG_LOGOUT"),
            MessageType::Waiting => write!(f, "MSG_WAITING"),
            MessageType::ExtendedLogin => write!(f, "MSG_EXTENDED_LOGIN"),
            MessageType::Unknown(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

/// One decoded protocol message. The body is already unwrapped from the
/// JSON envelope when the session speaks the JSON dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MessageType, body: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type,
            body: body.into(),
        }
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parse the body as a decimal integer, tolerating surrounding whitespace.
    pub fn body_int(&self) -> Option<i32> {
        self.body_str().trim().parse().ok()
    }
}

/// The set of sub-tests, as the bitmask sent at login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestSet(u8);

impl TestSet {
    pub const MID: TestSet = TestSet(1);
    pub const C2S: TestSet = TestSet(1 << 1);
    pub const S2C: TestSet = TestSet(1 << 2);
    pub const SFW: TestSet = TestSet(1 << 3);
    pub const STATUS: TestSet = TestSet(1 << 4);
    pub const META: TestSet = TestSet(1 << 5);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: TestSet) -> Self {
        TestSet(self.0 | other.0)
    }

    pub fn contains(self, other: TestSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: TestSet) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: TestSet) {
        self.0 &= !other.0;
    }
}

impl Default for TestSet {
    /// C2S, S2C and META, plus the STATUS bit servers expect from clients
    /// that understand the wait-queue heartbeat.
    fn default() -> Self {
        TestSet::C2S
            .union(TestSet::S2C)
            .union(TestSet::STATUS)
            .union(TestSet::META)
    }
}

impl std::str::FromStr for TestSet {
    type Err = String;

    /// Parse a comma separated list such as `c2s,s2c,meta`. STATUS is
    /// always added so heartbeats keep working.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = TestSet::STATUS;
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match name.to_lowercase().as_str() {
                "c2s" | "upload" => set.insert(TestSet::C2S),
                "s2c" | "download" => set.insert(TestSet::S2C),
                "meta" => set.insert(TestSet::META),
                "all" => set.insert(TestSet::default()),
                other => {
                    return Err(format!(
                        "Unknown test: {}. Valid options: c2s, s2c, meta, all",
                        other
                    ));
                }
            }
        }
        Ok(set)
    }
}

impl std::fmt::Display for TestSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = [
            (TestSet::MID, "mid"),
            (TestSet::C2S, "c2s"),
            (TestSet::S2C, "s2c"),
            (TestSet::SFW, "sfw"),
            (TestSet::STATUS, "status"),
            (TestSet::META, "meta"),
        ]
        .iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, name)| *name)
        .collect();
        write!(f, "{}", names.join(","))
    }
}

/// Sub-tests this client has an engine for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    C2s,
    S2c,
    Meta,
}

impl TestKind {
    /// Map a server-assigned test ID to an engine. IDs outside the set
    /// (including MID and SFW) return `None`.
    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            x if x == TestSet::C2S.bits() as i32 => Some(TestKind::C2s),
            x if x == TestSet::S2C.bits() as i32 => Some(TestKind::S2c),
            x if x == TestSet::META.bits() as i32 => Some(TestKind::Meta),
            _ => None,
        }
    }

    pub fn bit(self) -> TestSet {
        match self {
            TestKind::C2s => TestSet::C2S,
            TestKind::S2c => TestSet::S2C,
            TestKind::Meta => TestSet::META,
        }
    }
}

impl std::fmt::Display for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestKind::C2s => write!(f, "C2S throughput"),
            TestKind::S2c => write!(f, "S2C throughput"),
            TestKind::Meta => write!(f, "META"),
        }
    }
}

const SRV_QUEUE_TEST_STARTS_NOW: i32 = 0;
const SRV_QUEUE_SERVER_FAULT: i32 = 9977;
const SRV_QUEUE_SERVER_BUSY: i32 = 9988;
const SRV_QUEUE_HEARTBEAT: i32 = 9990;
const SRV_QUEUE_SERVER_BUSY_60S: i32 = 9999;

/// Decoded body of a SRV_QUEUE message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    StartNow,
    ServerFault,
    ServerBusy,
    ServerBusyRetry,
    Heartbeat,
    /// Estimated wait in minutes (one minute per queued client).
    Wait(i32),
}

impl QueueStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            SRV_QUEUE_TEST_STARTS_NOW => QueueStatus::StartNow,
            SRV_QUEUE_SERVER_FAULT => QueueStatus::ServerFault,
            SRV_QUEUE_SERVER_BUSY => QueueStatus::ServerBusy,
            SRV_QUEUE_SERVER_BUSY_60S => QueueStatus::ServerBusyRetry,
            SRV_QUEUE_HEARTBEAT => QueueStatus::Heartbeat,
            minutes => QueueStatus::Wait(minutes),
        }
    }
}

/// Server implementation flavour, taken from the version suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    #[default]
    Web100,
    Web10g,
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerType::Web100 => write!(f, "web100"),
            ServerType::Web10g => write!(f, "web10g"),
        }
    }
}

/// Parsed server version announcement, e.g. `v3.7.0.2-Web10G`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub raw: String,
    /// Version number without the leading `v` and flavour suffix.
    pub version: String,
    pub server_type: ServerType,
}

impl ServerVersion {
    /// Returns `None` when the body lacks the `v` marker.
    pub fn parse(body: &str) -> Option<Self> {
        let rest = body.strip_prefix('v')?;
        let has_suffix = body.ends_with("Web10G") || body.ends_with("Web100");
        let version = match rest.rfind('-') {
            Some(idx) if has_suffix => &rest[..idx],
            _ => rest,
        };
        Some(Self {
            raw: body.to_string(),
            version: version.to_string(),
            server_type: if body.ends_with("Web10G") {
                ServerType::Web10g
            } else {
                ServerType::Web100
            },
        })
    }

    pub fn matches_client(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

/// Extract the `msg` field of a JSON envelope. Returns `None` when the body
/// is not a JSON object with a `msg` field.
pub fn unwrap_json(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value.get("msg")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Look up a key of a JSON object body as a string, accepting both string
/// and numeric values.
pub fn json_field(body: &[u8], key: &str) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Body of the extended login: client version plus the requested tests.
pub fn extended_login_body(version: &str, tests: TestSet) -> String {
    serde_json::json!({
        "msg": version,
        "tests": tests.bits().to_string(),
    })
    .to_string()
}

/// Server-side S2C measurement: throughput (kbps), unsent queue depth and
/// total bytes the server wrote.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct S2cServerReport {
    pub throughput_kbps: f64,
    pub unsent_bytes: i32,
    pub total_sent_bytes: f64,
}

impl S2cServerReport {
    /// Parse either the JSON-keyed form or the legacy `"<tput> <unsent> <total>"` form.
    pub fn parse(body: &[u8]) -> Option<Self> {
        Self::parse_json(body).or_else(|| Self::parse_legacy(&String::from_utf8_lossy(body)))
    }

    fn parse_json(body: &[u8]) -> Option<Self> {
        Some(Self {
            throughput_kbps: json_field(body, "ThroughputValue")?.trim().parse().ok()?,
            unsent_bytes: json_field(body, "UnsentDataAmount")?.trim().parse().ok()?,
            total_sent_bytes: json_field(body, "TotalSentByte")?.trim().parse().ok()?,
        })
    }

    fn parse_legacy(body: &str) -> Option<Self> {
        let mut parts = body.trim().split(' ');
        let report = Self {
            throughput_kbps: parts.next()?.parse().ok()?,
            unsent_bytes: parts.next()?.parse().ok()?,
            total_sent_bytes: parts.next()?.parse().ok()?,
        };
        match parts.next() {
            None => Some(report),
            Some(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_codes() {
        for code in 0..=11u8 {
            assert_eq!(MessageType::from_u8(code).as_u8(), code);
        }
        assert_eq!(MessageType::from_u8(42), MessageType::Unknown(42));
        assert_eq!(MessageType::SrvQueue.as_u8(), 1);
        assert_eq!(MessageType::ExtendedLogin.as_u8(), 11);
    }

    #[test]
    fn test_default_test_set() {
        let set = TestSet::default();
        assert_eq!(set.bits(), 2 | 4 | 16 | 32);
        assert!(set.contains(TestSet::C2S));
        assert!(!set.contains(TestSet::MID));
    }

    #[test]
    fn test_test_set_parse() {
        let set: TestSet = "c2s,meta".parse().unwrap();
        assert!(set.contains(TestSet::C2S));
        assert!(set.contains(TestSet::META));
        assert!(set.contains(TestSet::STATUS));
        assert!(!set.contains(TestSet::S2C));
        assert!("c2s,bogus".parse::<TestSet>().is_err());
    }

    #[test]
    fn test_test_kind_from_id() {
        assert_eq!(TestKind::from_id(2), Some(TestKind::C2s));
        assert_eq!(TestKind::from_id(4), Some(TestKind::S2c));
        assert_eq!(TestKind::from_id(32), Some(TestKind::Meta));
        assert_eq!(TestKind::from_id(1), None);
        assert_eq!(TestKind::from_id(8), None);
        assert_eq!(TestKind::from_id(64), None);
    }

    #[test]
    fn test_queue_status() {
        assert_eq!(QueueStatus::from_code(0), QueueStatus::StartNow);
        assert_eq!(QueueStatus::from_code(9977), QueueStatus::ServerFault);
        assert_eq!(QueueStatus::from_code(9988), QueueStatus::ServerBusy);
        assert_eq!(QueueStatus::from_code(9990), QueueStatus::Heartbeat);
        assert_eq!(QueueStatus::from_code(9999), QueueStatus::ServerBusyRetry);
        assert_eq!(QueueStatus::from_code(3), QueueStatus::Wait(3));
    }

    #[test]
    fn test_server_version() {
        let v = ServerVersion::parse("v3.7.0.2-Web10G").unwrap();
        assert_eq!(v.version, "3.7.0.2");
        assert_eq!(v.server_type, ServerType::Web10g);
        assert!(v.matches_client());

        let v = ServerVersion::parse("v3.6.5-Web100").unwrap();
        assert_eq!(v.version, "3.6.5");
        assert_eq!(v.server_type, ServerType::Web100);
        assert!(!v.matches_client());

        let v = ServerVersion::parse("v3.7.0").unwrap();
        assert_eq!(v.version, "3.7.0");
        assert_eq!(v.server_type, ServerType::Web100);

        assert!(ServerVersion::parse("3.7.0").is_none());
    }

    #[test]
    fn test_json_envelope() {
        assert_eq!(
            unwrap_json(br#"{"msg":"hello \"world\""}"#).unwrap(),
            "hello \"world\""
        );
        assert_eq!(unwrap_json(br#"{"msg":9990}"#).unwrap(), "9990");
        assert!(unwrap_json(b"plain text").is_none());
        assert!(unwrap_json(br#"{"other":"x"}"#).is_none());
    }

    #[test]
    fn test_extended_login_body() {
        let body = extended_login_body("3.7.0.2", TestSet::default());
        assert_eq!(json_field(body.as_bytes(), "msg").unwrap(), "3.7.0.2");
        assert_eq!(json_field(body.as_bytes(), "tests").unwrap(), "54");
    }

    #[test]
    fn test_s2c_report_json() {
        let body = br#"{"ThroughputValue":"94000.5","UnsentDataAmount":"0","TotalSentByte":"117500000"}"#;
        let report = S2cServerReport::parse(body).unwrap();
        assert_eq!(report.throughput_kbps, 94000.5);
        assert_eq!(report.unsent_bytes, 0);
        assert_eq!(report.total_sent_bytes, 117_500_000.0);
    }

    #[test]
    fn test_s2c_report_legacy() {
        let report = S2cServerReport::parse(b"8000.25 12 10000000").unwrap();
        assert_eq!(report.throughput_kbps, 8000.25);
        assert_eq!(report.unsent_bytes, 12);
        assert_eq!(report.total_sent_bytes, 10_000_000.0);

        assert!(S2cServerReport::parse(b"8000.25 12").is_none());
        assert!(S2cServerReport::parse(b"fast slow 1").is_none());
    }
}
