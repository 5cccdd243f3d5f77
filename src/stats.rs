use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::TestKind;

/// Events published to whoever is presenting the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Human-readable phase transition
    Status(String),
    /// Server queue estimate
    Queued { wait_secs: u64 },
    /// Live throughput sample during C2S or S2C
    Throughput { test: TestKind, mbps: f64 },
    /// Something worth reporting that does not fail the session
    Warning(String),
}

/// Optional sender for progress events. Send failures (receiver gone) are ignored.
#[derive(Clone, Default)]
pub struct Progress {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl Progress {
    pub fn new(tx: Option<mpsc::Sender<ProgressEvent>>) -> Self {
        Self { tx }
    }

    pub async fn emit(&self, event: ProgressEvent) {
        if let Some(ref tx) = self.tx {
            let _ = tx.send(event).await;
        }
    }

    pub async fn status(&self, message: impl Into<String>) {
        self.emit(ProgressEvent::Status(message.into())).await;
    }

    pub async fn warning(&self, message: impl Into<String>) {
        self.emit(ProgressEvent::Warning(message.into())).await;
    }
}

/// Counters shared between a transfer loop and its sampler.
pub struct TransferStats {
    pub bytes: AtomicU64,
    pub packets: AtomicU64,
    pub start_time: Instant,
    last_bytes: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            packets: AtomicU64::new(0),
            start_time: Instant::now(),
            last_bytes: AtomicU64::new(0),
        }
    }

    /// One successful write or read of `bytes`.
    pub fn add_packet(&self, bytes: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Elapsed time since start, never below 1 ms.
    pub fn elapsed_ms(&self) -> u64 {
        (self.start_time.elapsed().as_millis() as u64).max(1)
    }

    /// Throughput over the bytes counted since the previous call.
    pub fn sample_mbps(&self, interval: Duration) -> f64 {
        let total = self.bytes();
        let last = self.last_bytes.swap(total, Ordering::Relaxed);
        let ms = (interval.as_millis() as u64).max(1);
        throughput_mbps(total.saturating_sub(last), ms)
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// `8 * bytes / ms / 1000`: bits per millisecond scaled to Mbps.
pub fn throughput_mbps(bytes: u64, elapsed_ms: u64) -> f64 {
    let ms = elapsed_ms.max(1) as f64;
    8.0 * bytes as f64 / ms / 1000.0
}

/// Publish a throughput sample every `period` until the handle is aborted.
pub fn spawn_sampler(
    stats: Arc<TransferStats>,
    test: TestKind,
    period: Duration,
    progress: Progress,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // First tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mbps = stats.sample_mbps(period);
            progress
                .emit(ProgressEvent::Throughput { test, mbps })
                .await;
        }
    })
}

pub fn bytes_to_human(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn mbps_to_human(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else if mbps < 1.0 {
        format!("{:.0} kbps", mbps * 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}
