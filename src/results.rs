//! Result interpretation
//!
//! The server finishes a session with a whitespace separated dump of
//! `key: value` pairs taken from its TCP instrumentation. This module turns
//! the recognised keys into [`DiagnosticCounters`] and derives a
//! [`LinkClassification`] from them.

use std::collections::BTreeMap;

use serde::{Serialize, Serializer};

/// Fraction of time a side must be limiting before it is reported.
const BUFFER_LIMITED: f64 = 0.15;
/// Congestion-window limited threshold.
const NETWORK_LIMITED: f64 = 0.005;
/// Queuing above this share of the sender's rate is flagged as excessive.
const QUEUING_TOLERANCE: f64 = 0.1;
/// Largest receive window representable without scaling.
const TCP_MAX_RECV_WIN_SIZE: i32 = 65535;
/// Window scale factors above this are treated as bogus.
const MAX_WINDOW_SCALE: i32 = 20;
const MAX_RCV_WIN_SCALE: i32 = 15;

macro_rules! counter_keys {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Server variables the interpreter keeps. Everything else in the dump is ignored.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum CounterKey {
            $($variant),+
        }

        impl CounterKey {
            pub const ALL: &'static [CounterKey] = &[$(CounterKey::$variant),+];

            pub fn name(self) -> &'static str {
                match self {
                    $(CounterKey::$variant => $name),+
                }
            }

            /// Look up a key, with or without the trailing colon the server sends.
            pub fn from_name(name: &str) -> Option<Self> {
                match name.strip_suffix(':').unwrap_or(name) {
                    $($name => Some(CounterKey::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

counter_keys! {
    Bw => "bw",
    Loss => "loss",
    AvgRtt => "avgrtt",
    WaitSec => "waitsec",
    TimeSec => "timesec",
    Order => "order",
    RwinTime => "rwintime",
    SendTime => "sendtime",
    CwndTime => "cwndtime",
    RttSec => "rttsec",
    Rwin => "rwin",
    Swin => "swin",
    Cwin => "cwin",
    Spd => "spd",
    Aspd => "aspd",
    DataBytesOut => "DataBytesOut",
    MssSent => "MSSSent",
    MssRcvd => "MSSRcvd",
    EcnEnabled => "ECNEnabled",
    NagleEnabled => "NagleEnabled",
    SackEnabled => "SACKEnabled",
    TimestampsEnabled => "TimestampsEnabled",
    WinScaleRcvd => "WinScaleRcvd",
    WinScaleSent => "WinScaleSent",
    SumRtt => "SumRTT",
    CountRtt => "CountRTT",
    CurMss => "CurMSS",
    Timeouts => "Timeouts",
    PktsRetrans => "PktsRetrans",
    SacksRcvd => "SACKsRcvd",
    DupAcksIn => "DupAcksIn",
    MaxRwinRcvd => "MaxRwinRcvd",
    MaxRwinSent => "MaxRwinSent",
    Sndbuf => "Sndbuf",
    Rcvbuf => "X_Rcvbuf",
    DataPktsOut => "DataPktsOut",
    FastRetran => "FastRetran",
    AckPktsOut => "AckPktsOut",
    SmoothedRtt => "SmoothedRTT",
    CurCwnd => "CurCwnd",
    MaxCwnd => "MaxCwnd",
    SndLimTimeRwin => "SndLimTimeRwin",
    SndLimTimeCwnd => "SndLimTimeCwnd",
    SndLimTimeSender => "SndLimTimeSender",
    AckPktsIn => "AckPktsIn",
    SndLimTransRwin => "SndLimTransRwin",
    SndLimTransCwnd => "SndLimTransCwnd",
    SndLimTransSender => "SndLimTransSender",
    MaxSsthresh => "MaxSsthresh",
    CurRto => "CurRTO",
    MaxRto => "MaxRTO",
    MinRto => "MinRTO",
    MinRtt => "MinRTT",
    MaxRtt => "MaxRTT",
    CurRwinRcvd => "CurRwinRcvd",
    C2sData => "c2sData",
    C2sAck => "c2sAck",
    S2cData => "s2cData",
    S2cAck => "s2cAck",
    PktsOut => "PktsOut",
    Mismatch => "mismatch",
    Congestion => "congestion",
    BadCable => "bad_cable",
    HalfDuplex => "half_duplex",
    CongestionSignals => "CongestionSignals",
    RcvWinScale => "RcvWinScale",
}

impl Serialize for CounterKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CounterValue {
    Int(i32),
    Long(i64),
    Float(f64),
}

impl CounterValue {
    pub fn as_f64(self) -> f64 {
        match self {
            CounterValue::Int(v) => v as f64,
            CounterValue::Long(v) => v as f64,
            CounterValue::Float(v) => v,
        }
    }
}

impl std::fmt::Display for CounterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterValue::Int(v) => write!(f, "{}", v),
            CounterValue::Long(v) => write!(f, "{}", v),
            CounterValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Typed view over the recognised keys of the server's results dump.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DiagnosticCounters {
    values: BTreeMap<CounterKey, CounterValue>,
}

impl DiagnosticCounters {
    /// Parse alternating key/value tokens. Unknown keys are skipped, a key
    /// without a value at the end of the text is ignored.
    ///
    /// Values containing a `.` are stored as floats (and dropped if they do
    /// not parse); everything else is an `i32`, with `-1` standing in for
    /// values that do not fit. `DataBytesOut` is always 64-bit.
    pub fn parse(text: &str) -> Self {
        let mut counters = Self::default();
        let mut tokens = text.split_whitespace();
        while let (Some(name), Some(raw)) = (tokens.next(), tokens.next()) {
            if let Some(key) = CounterKey::from_name(name) {
                if let Some(value) = parse_value(key, raw) {
                    counters.values.insert(key, value);
                }
            }
        }
        counters
    }

    pub fn get(&self, key: CounterKey) -> Option<CounterValue> {
        self.values.get(&key).copied()
    }

    /// Integer value of a key; floats are not converted.
    pub fn int(&self, key: CounterKey) -> Option<i64> {
        match self.get(key)? {
            CounterValue::Int(v) => Some(v as i64),
            CounterValue::Long(v) => Some(v),
            CounterValue::Float(_) => None,
        }
    }

    /// Any numeric value of a key as `f64`.
    pub fn float(&self, key: CounterKey) -> Option<f64> {
        self.get(key).map(CounterValue::as_f64)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// SumRTT / CountRTT in milliseconds, falling back to the server's `avgrtt`.
    pub fn average_rtt_ms(&self) -> Option<f64> {
        match (self.int(CounterKey::SumRtt), self.int(CounterKey::CountRtt)) {
            (Some(sum), Some(count)) if count > 0 => Some(sum as f64 / count as f64),
            _ => self.float(CounterKey::AvgRtt),
        }
    }
}

fn parse_value(key: CounterKey, raw: &str) -> Option<CounterValue> {
    if key == CounterKey::DataBytesOut {
        return Some(CounterValue::Long(raw.parse().unwrap_or(-1)));
    }
    if raw.contains('.') {
        return raw.parse().ok().map(CounterValue::Float);
    }
    let value: i32 = raw.parse().unwrap_or(-1);
    if key == CounterKey::RcvWinScale && value > MAX_RCV_WIN_SCALE {
        return Some(CounterValue::Int(0));
    }
    Some(CounterValue::Int(value))
}

/// Slowest link on the path, as estimated by the server (`c2sData`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkTier {
    InsufficientData,
    SystemFault,
    RttFailure,
    DialUp,
    CableDsl,
    Ethernet10M,
    T3,
    FastEthernet,
    Oc12,
    GigabitEthernet,
    Oc48,
    TenGigabitEthernet,
    Unknown(i32),
}

impl LinkTier {
    pub fn from_code(code: i32) -> Self {
        match code {
            -2 => LinkTier::InsufficientData,
            -1 => LinkTier::SystemFault,
            0 => LinkTier::RttFailure,
            1 => LinkTier::DialUp,
            2 => LinkTier::CableDsl,
            3 => LinkTier::Ethernet10M,
            4 => LinkTier::T3,
            5 => LinkTier::FastEthernet,
            6 => LinkTier::Oc12,
            7 => LinkTier::GigabitEthernet,
            8 => LinkTier::Oc48,
            9 => LinkTier::TenGigabitEthernet,
            other => LinkTier::Unknown(other),
        }
    }

    /// Nominal speed of the tier in Mbps.
    pub fn speed_mbps(self) -> Option<f64> {
        match self {
            LinkTier::DialUp => Some(0.064),
            LinkTier::CableDsl => Some(3.0),
            LinkTier::Ethernet10M => Some(10.0),
            LinkTier::T3 => Some(45.0),
            LinkTier::FastEthernet => Some(100.0),
            LinkTier::Oc12 => Some(622.0),
            LinkTier::GigabitEthernet => Some(1000.0),
            LinkTier::Oc48 => Some(2400.0),
            LinkTier::TenGigabitEthernet => Some(10000.0),
            _ => None,
        }
    }
}

impl std::fmt::Display for LinkTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkTier::InsufficientData => write!(f, "insufficient data"),
            LinkTier::SystemFault => write!(f, "system fault"),
            LinkTier::RttFailure => write!(f, "RTT measurement failed"),
            LinkTier::DialUp => write!(f, "dial-up modem"),
            LinkTier::CableDsl => write!(f, "cable/DSL modem"),
            LinkTier::Ethernet10M => write!(f, "10 Mbps Ethernet"),
            LinkTier::T3 => write!(f, "45 Mbps T3/DS3"),
            LinkTier::FastEthernet => write!(f, "100 Mbps Fast Ethernet"),
            LinkTier::Oc12 => write!(f, "622 Mbps OC-12"),
            LinkTier::GigabitEthernet => write!(f, "1 Gbps Gigabit Ethernet"),
            LinkTier::Oc48 => write!(f, "2.4 Gbps OC-48"),
            LinkTier::TenGigabitEthernet => write!(f, "10 Gbps Ethernet/OC-192"),
            LinkTier::Unknown(code) => write!(f, "unknown ({})", code),
        }
    }
}

/// Duplex mismatch verdict (`mismatch`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplexState {
    Ok,
    OldMismatch,
    SwitchFullHostHalf,
    SwitchHalfHostFull,
    PossibleSwitchFullHostHalf,
    PossibleSwitchHalfHostFull,
    SwitchHalfHostFullWarning,
    Unknown(i32),
}

impl DuplexState {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => DuplexState::Ok,
            1 => DuplexState::OldMismatch,
            2 => DuplexState::SwitchFullHostHalf,
            3 => DuplexState::SwitchHalfHostFull,
            4 => DuplexState::PossibleSwitchFullHostHalf,
            5 => DuplexState::PossibleSwitchHalfHostFull,
            7 => DuplexState::SwitchHalfHostFullWarning,
            other => DuplexState::Unknown(other),
        }
    }
}

impl std::fmt::Display for DuplexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DuplexState::Ok => write!(f, "ok"),
            DuplexState::OldMismatch => write!(f, "duplex mismatch"),
            DuplexState::SwitchFullHostHalf => write!(f, "switch full duplex, host half duplex"),
            DuplexState::SwitchHalfHostFull => write!(f, "switch half duplex, host full duplex"),
            DuplexState::PossibleSwitchFullHostHalf => {
                write!(f, "possible switch full duplex, host half duplex")
            }
            DuplexState::PossibleSwitchHalfHostFull => {
                write!(f, "possible switch half duplex, host full duplex")
            }
            DuplexState::SwitchHalfHostFullWarning => {
                write!(f, "warning: possible switch half duplex, host full duplex")
            }
            DuplexState::Unknown(code) => write!(f, "unknown ({})", code),
        }
    }
}

/// Negotiated TCP options. A counter is "on" when nonzero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TcpOptions {
    pub sack: bool,
    pub nagle: bool,
    pub ecn: bool,
    pub timestamps: bool,
    pub window_scaling: bool,
    pub server_window_scale: i32,
    pub client_window_scale: i32,
}

/// Throughput pair for one direction, used for packet queuing detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalThroughput {
    /// What the sending side measured
    pub sender_mbps: f64,
    /// What the receiving side measured
    pub receiver_mbps: f64,
}

impl DirectionalThroughput {
    /// Queuing seen on this direction, if the receiver measured less than
    /// was sent.
    pub fn queuing(&self) -> Option<PacketQueuing> {
        if self.sender_mbps <= 0.0 || self.receiver_mbps >= self.sender_mbps {
            return None;
        }
        Some(PacketQueuing {
            pct: 100.0 * (self.sender_mbps - self.receiver_mbps) / self.sender_mbps,
            excessive: self.receiver_mbps < self.sender_mbps * (1.0 - QUEUING_TOLERANCE),
        })
    }
}

/// Share of the sender's rate that never reached the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PacketQueuing {
    pub pct: f64,
    /// More than the tolerated difference between the two measurements
    pub excessive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkClassification {
    pub link: LinkTier,
    pub link_mbps: Option<f64>,
    pub duplex: DuplexState,
    pub half_duplex: bool,
    pub congestion: bool,
    pub bad_cable: bool,
    pub average_rtt_ms: Option<f64>,
    /// MaxRTT - MinRTT
    pub jitter_ms: Option<f64>,
    /// Time spent waiting on retransmission timeouts
    pub rto_wait_secs: Option<f64>,
    pub receiver_limited_pct: Option<f64>,
    pub sender_limited_pct: Option<f64>,
    pub network_limited_pct: Option<f64>,
    /// Share of the test the connection sat idle after losses
    pub idle_pct: Option<f64>,
    pub out_of_order_pct: Option<f64>,
    pub excessive_loss: bool,
    pub tcp_options: TcpOptions,
    /// Receive buffer (KB) that would let the link run at full speed
    pub recommended_rcvbuf_kb: Option<f64>,
    /// Send buffer (KB) to raise when the sender was the bottleneck
    pub recommended_sndbuf_kb: Option<f64>,
    pub c2s_queuing: Option<PacketQueuing>,
    pub s2c_queuing: Option<PacketQueuing>,
}

impl LinkClassification {
    /// Derive the classification. Returns `None` when the server reported
    /// no RTT samples, in which case none of the derived figures are meaningful.
    pub fn derive(
        counters: &DiagnosticCounters,
        c2s: Option<DirectionalThroughput>,
        s2c: Option<DirectionalThroughput>,
    ) -> Option<Self> {
        use CounterKey as K;

        if counters.int(K::CountRtt).unwrap_or(0) <= 0 {
            return None;
        }

        let int = |key| counters.int(key).unwrap_or(0);
        let float = |key| counters.float(key).unwrap_or(0.0);
        let fraction_pct = |value: f64, threshold: f64| (value > threshold).then(|| value * 100.0);

        let link = LinkTier::from_code(counters.int(K::C2sData).unwrap_or(-2) as i32);
        let link_mbps = link.speed_mbps();
        let duplex = DuplexState::from_code(int(K::Mismatch) as i32);

        let jitter_ms = match (counters.int(K::MaxRtt), counters.int(K::MinRtt)) {
            (Some(max), Some(min)) => Some((max - min) as f64),
            _ => None,
        };
        let rto_wait_secs = match (counters.int(K::CurRto), counters.int(K::Timeouts)) {
            (Some(rto), Some(timeouts)) => Some(rto as f64 * timeouts as f64 / 1000.0),
            _ => None,
        };

        let timesec = float(K::TimeSec);
        let idle_pct = (int(K::PktsRetrans) > 0 && timesec > 0.0)
            .then(|| float(K::WaitSec) / timesec * 100.0);
        let out_of_order_pct =
            (int(K::PktsRetrans) == 0 && int(K::DupAcksIn) > 0).then(|| float(K::Order) * 100.0);

        let max_rwin_rcvd = int(K::MaxRwinRcvd);
        let mut server_window_scale = int(K::WinScaleRcvd) as i32;
        if max_rwin_rcvd < TCP_MAX_RECV_WIN_SIZE as i64 {
            server_window_scale = 0;
        }
        let window_scaling = server_window_scale != 0 && server_window_scale <= MAX_WINDOW_SCALE;

        let tcp_options = TcpOptions {
            sack: int(K::SackEnabled) != 0,
            nagle: int(K::NagleEnabled) != 0,
            ecn: int(K::EcnEnabled) != 0,
            timestamps: int(K::TimestampsEnabled) != 0,
            window_scaling,
            server_window_scale,
            client_window_scale: int(K::WinScaleSent) as i32,
        };

        let average_rtt_ms = counters.average_rtt_ms();
        let recommended_rcvbuf_kb = if duplex == DuplexState::Ok {
            link_mbps.and_then(|link| {
                recommended_receive_buffer_kb(
                    link,
                    float(K::Rwin),
                    float(K::RttSec),
                    counters.float(K::AvgRtt).or(average_rtt_ms)?,
                    max_rwin_rcvd,
                )
            })
        } else {
            None
        };

        let sender_limited_pct = fraction_pct(float(K::SendTime), BUFFER_LIMITED);
        let recommended_sndbuf_kb = match (sender_limited_pct, link_mbps, counters.int(K::Sndbuf)) {
            (Some(_), Some(link), Some(sndbuf)) => {
                recommended_send_buffer_kb(link, float(K::Swin), float(K::RttSec), sndbuf)
            }
            _ => None,
        };

        Some(Self {
            link,
            link_mbps,
            duplex,
            half_duplex: int(K::HalfDuplex) != 0,
            congestion: int(K::Congestion) != 0,
            bad_cable: int(K::BadCable) != 0,
            average_rtt_ms,
            jitter_ms,
            rto_wait_secs,
            receiver_limited_pct: fraction_pct(float(K::RwinTime), BUFFER_LIMITED),
            sender_limited_pct,
            network_limited_pct: fraction_pct(float(K::CwndTime), NETWORK_LIMITED),
            idle_pct,
            out_of_order_pct,
            excessive_loss: float(K::Spd) < 4.0 && float(K::Loss) > 0.01,
            tcp_options,
            recommended_rcvbuf_kb,
            recommended_sndbuf_kb,
            c2s_queuing: c2s.and_then(|t| t.queuing()),
            s2c_queuing: s2c.and_then(|t| t.queuing()),
        })
    }
}

/// `rwin` is in Mbit and `rttsec` in seconds, so `2 * rwin / rttsec` is the
/// window-bound rate in Mbps. When that is below the link speed, the buffer
/// needed is `link * rtt` converted to KB; it is only reported when larger
/// than the receive window the client advertised.
fn recommended_receive_buffer_kb(
    link_mbps: f64,
    rwin_mbit: f64,
    rttsec: f64,
    avg_rtt_ms: f64,
    max_rwin_rcvd: i64,
) -> Option<f64> {
    if rttsec <= 0.0 || 2.0 * rwin_mbit / rttsec >= link_mbps {
        return None;
    }
    let kb = link_mbps * avg_rtt_ms * 1000.0 / 8.0 / 1024.0;
    (kb * 1024.0 > max_rwin_rcvd as f64).then_some(kb)
}

/// Same window-bound test against `swin`. The hint is half the server's
/// current `Sndbuf`, in KB.
fn recommended_send_buffer_kb(
    link_mbps: f64,
    swin_mbit: f64,
    rttsec: f64,
    sndbuf: i64,
) -> Option<f64> {
    if rttsec <= 0.0 || 2.0 * swin_mbit / rttsec >= link_mbps {
        return None;
    }
    Some(sndbuf as f64 / 2.0 / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_ints() {
        let counters = DiagnosticCounters::parse("SumRTT: 500 CountRTT: 10 MaxRwinRcvd: 64000");
        assert_eq!(counters.get(CounterKey::SumRtt), Some(CounterValue::Int(500)));
        assert_eq!(counters.get(CounterKey::CountRtt), Some(CounterValue::Int(10)));
        assert_eq!(
            counters.get(CounterKey::MaxRwinRcvd),
            Some(CounterValue::Int(64000))
        );
        assert_eq!(counters.average_rtt_ms(), Some(50.0));
    }

    #[test]
    fn test_parse_typing_rules() {
        let counters = DiagnosticCounters::parse(
            "loss: 0.000123 PktsOut: 99999999999 DataBytesOut: 12345678901 bogus: 7 Timeouts: abc",
        );
        assert_eq!(counters.get(CounterKey::Loss), Some(CounterValue::Float(0.000123)));
        assert_eq!(counters.get(CounterKey::PktsOut), Some(CounterValue::Int(-1)));
        assert_eq!(
            counters.get(CounterKey::DataBytesOut),
            Some(CounterValue::Long(12_345_678_901))
        );
        assert_eq!(counters.get(CounterKey::Timeouts), Some(CounterValue::Int(-1)));
        assert_eq!(counters.len(), 4);
    }

    #[test]
    fn test_parse_bad_float_dropped() {
        let counters = DiagnosticCounters::parse("avgrtt: 1.2.3 spd: 9.5");
        assert!(counters.get(CounterKey::AvgRtt).is_none());
        assert_eq!(counters.float(CounterKey::Spd), Some(9.5));
    }

    #[test]
    fn test_parse_trailing_key_ignored() {
        let counters = DiagnosticCounters::parse("CountRTT: 3 SumRTT:");
        assert_eq!(counters.len(), 1);
    }

    #[test]
    fn test_rcv_win_scale_clamped() {
        let counters = DiagnosticCounters::parse("RcvWinScale: 16");
        assert_eq!(counters.int(CounterKey::RcvWinScale), Some(0));
        let counters = DiagnosticCounters::parse("RcvWinScale: 7");
        assert_eq!(counters.int(CounterKey::RcvWinScale), Some(7));
    }

    #[test]
    fn test_no_classification_without_rtt_samples() {
        let counters = DiagnosticCounters::parse("c2sData: 7 CountRTT: 0");
        assert!(LinkClassification::derive(&counters, None, None).is_none());
    }

    #[test]
    fn test_classification() {
        let counters = DiagnosticCounters::parse(
            "c2sData: 5 CountRTT: 100 SumRTT: 2000 mismatch: 0 congestion: 1 bad_cable: 0 \
             half_duplex: 0 rwintime: 0.2500 sendtime: 0.0100 cwndtime: 0.0100 \
             SACKEnabled: 1 NagleEnabled: 1 ECNEnabled: 0 TimestampsEnabled: 1 \
             WinScaleRcvd: 7 WinScaleSent: 7 MaxRwinRcvd: 1048576 MaxRTT: 30 MinRTT: 10 \
             CurRTO: 200 Timeouts: 2 spd: 90.5 loss: 0.000001",
        );
        let c = LinkClassification::derive(&counters, None, None).unwrap();
        assert_eq!(c.link, LinkTier::FastEthernet);
        assert_eq!(c.link_mbps, Some(100.0));
        assert_eq!(c.duplex, DuplexState::Ok);
        assert!(c.congestion);
        assert!(!c.bad_cable);
        assert_eq!(c.average_rtt_ms, Some(20.0));
        assert_eq!(c.jitter_ms, Some(20.0));
        assert_eq!(c.rto_wait_secs, Some(0.4));
        assert_eq!(c.receiver_limited_pct, Some(25.0));
        assert!(c.sender_limited_pct.is_none());
        assert!((c.network_limited_pct.unwrap() - 1.0).abs() < 1e-9);
        assert!(!c.excessive_loss);
        assert!(c.tcp_options.sack);
        assert!(!c.tcp_options.ecn);
        assert!(c.tcp_options.window_scaling);
    }

    #[test]
    fn test_window_scaling_sanity_bounds() {
        let counters = DiagnosticCounters::parse("CountRTT: 1 MaxRwinRcvd: 1048576 WinScaleRcvd: 21");
        let c = LinkClassification::derive(&counters, None, None).unwrap();
        assert!(!c.tcp_options.window_scaling);

        let counters = DiagnosticCounters::parse("CountRTT: 1 MaxRwinRcvd: 32768 WinScaleRcvd: 7");
        let c = LinkClassification::derive(&counters, None, None).unwrap();
        assert!(!c.tcp_options.window_scaling);
        assert_eq!(c.tcp_options.server_window_scale, 0);
    }

    #[test]
    fn test_excessive_loss() {
        let counters = DiagnosticCounters::parse("CountRTT: 1 spd: 2.0 loss: 0.05");
        let c = LinkClassification::derive(&counters, None, None).unwrap();
        assert!(c.excessive_loss);
    }

    #[test]
    fn test_recommended_buffer() {
        // 100 Mbps link, window allows only 2 * 0.5 / 0.02 = 50 Mbps
        let counters = DiagnosticCounters::parse(
            "CountRTT: 1 c2sData: 5 mismatch: 0 rwin: 0.5 rttsec: 0.02 avgrtt: 20.0 MaxRwinRcvd: 65535",
        );
        let c = LinkClassification::derive(&counters, None, None).unwrap();
        let kb = c.recommended_rcvbuf_kb.unwrap();
        assert!((kb - 100.0 * 20.0 * 1000.0 / 8.0 / 1024.0).abs() < 1e-9);
    }

    #[test]
    fn test_packet_queuing() {
        let counters = DiagnosticCounters::parse("CountRTT: 1");
        let c2s = DirectionalThroughput {
            sender_mbps: 100.0,
            receiver_mbps: 50.0,
        };
        let s2c = DirectionalThroughput {
            sender_mbps: 100.0,
            receiver_mbps: 95.0,
        };
        let c = LinkClassification::derive(&counters, Some(c2s), Some(s2c)).unwrap();
        let up = c.c2s_queuing.unwrap();
        assert_eq!(up.pct, 50.0);
        assert!(up.excessive);
        let down = c.s2c_queuing.unwrap();
        assert_eq!(down.pct, 5.0);
        assert!(!down.excessive);
    }

    #[test]
    fn test_no_queuing_when_receiver_keeps_up() {
        let same = DirectionalThroughput {
            sender_mbps: 80.0,
            receiver_mbps: 80.0,
        };
        assert!(same.queuing().is_none());
        let faster = DirectionalThroughput {
            sender_mbps: 80.0,
            receiver_mbps: 81.0,
        };
        assert!(faster.queuing().is_none());
    }

    #[test]
    fn test_recommended_send_buffer() {
        // sender limited 40% of the time, window allows 2 * 0.5 / 0.02 = 50 Mbps on a 100 Mbps link
        let counters = DiagnosticCounters::parse(
            "CountRTT: 1 c2sData: 5 sendtime: 0.4000 swin: 0.5 rttsec: 0.02 Sndbuf: 262144",
        );
        let c = LinkClassification::derive(&counters, None, None).unwrap();
        assert_eq!(c.sender_limited_pct, Some(40.0));
        assert_eq!(c.recommended_sndbuf_kb, Some(128.0));

        // same window, but the sender was rarely the bottleneck
        let counters = DiagnosticCounters::parse(
            "CountRTT: 1 c2sData: 5 sendtime: 0.0100 swin: 0.5 rttsec: 0.02 Sndbuf: 262144",
        );
        let c = LinkClassification::derive(&counters, None, None).unwrap();
        assert!(c.recommended_sndbuf_kb.is_none());
    }

    #[test]
    fn test_unknown_codes() {
        assert_eq!(LinkTier::from_code(42), LinkTier::Unknown(42));
        assert_eq!(DuplexState::from_code(6), DuplexState::Unknown(6));
        assert_eq!(LinkTier::from_code(-2), LinkTier::InsufficientData);
    }

    #[test]
    fn test_counter_key_names() {
        for key in CounterKey::ALL {
            assert_eq!(CounterKey::from_name(key.name()), Some(*key));
            assert_eq!(CounterKey::from_name(&format!("{}:", key.name())), Some(*key));
        }
        assert!(CounterKey::from_name("Bad_cable:").is_none());
    }
}
