//! Data connection transfer loops
//!
//! The upload side writes a fixed pattern until a watchdog closes the
//! stream; the download side counts bytes until EOF, a timeout, or the
//! elapsed-time cap.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::stats::TransferStats;

pub const UPLOAD_BUFFER_SIZE: usize = 64 * 1024;
pub const DOWNLOAD_BUFFER_SIZE: usize = 8 * 1024;

/// Fill `buf` with ASCII cycling from '0' up to 'y', then wrapping to '0'.
pub fn fill_pattern(buf: &mut [u8]) {
    let mut c = b'0';
    for byte in buf.iter_mut() {
        if c == b'z' {
            c = b'0';
        }
        *byte = c;
        c += 1;
    }
}

/// Write the pattern buffer until `duration` elapses or a write fails.
///
/// A watchdog task flips a stop flag when the time is up; the pending write
/// is abandoned and the stream dropped, so a writer stuck on a full socket
/// cannot outlive the test. Returns the elapsed milliseconds.
pub async fn send_data<W>(mut stream: W, stats: Arc<TransferStats>, duration: Duration) -> u64
where
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; UPLOAD_BUFFER_SIZE];
    fill_pattern(&mut buffer);

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let watchdog = tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        let _ = stop_tx.send(true);
    });

    loop {
        tokio::select! {
            result = stream.write_all(&buffer) => {
                match result {
                    Ok(()) => stats.add_packet(buffer.len() as u64),
                    Err(e) => {
                        debug!("Upload write ended: {}", e);
                        break;
                    }
                }
            }
            _ = stop_rx.changed() => {
                debug!("Watchdog closed upload after {:?}", duration);
                break;
            }
        }
    }

    let elapsed_ms = stats.elapsed_ms();
    watchdog.abort();
    drop(stream);

    debug!(
        "Upload complete: {} packets, {} bytes in {} ms",
        stats.packets(),
        stats.bytes(),
        elapsed_ms
    );
    elapsed_ms
}

/// Read until EOF or until `max_elapsed` has passed. Each read is bounded
/// by `read_timeout`; a timeout or I/O error is returned as an error.
/// Returns the elapsed milliseconds.
pub async fn receive_data<R>(
    mut stream: R,
    stats: Arc<TransferStats>,
    read_timeout: Duration,
    max_elapsed: Duration,
) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; DOWNLOAD_BUFFER_SIZE];
    let start = Instant::now();

    loop {
        if start.elapsed() >= max_elapsed {
            debug!("Download capped at {:?}", max_elapsed);
            break;
        }

        let n = tokio::time::timeout(read_timeout, stream.read(&mut buffer))
            .await
            .map_err(|_| anyhow::anyhow!("Download read timed out after {:?}", read_timeout))??;
        if n == 0 {
            debug!("Download EOF");
            break;
        }
        stats.add_packet(n as u64);
    }

    let elapsed_ms = stats.elapsed_ms();
    debug!(
        "Download complete: {} bytes in {} ms",
        stats.bytes(),
        elapsed_ms
    );
    Ok(elapsed_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_pattern() {
        let mut buf = vec![0u8; 200];
        fill_pattern(&mut buf);
        assert_eq!(buf[0], b'0');
        assert_eq!(buf[73], b'y');
        assert_eq!(buf[74], b'0');
        assert!(buf.iter().all(|b| (b'0'..=b'y').contains(b)));
    }

    #[tokio::test]
    async fn test_send_stops_on_watchdog() {
        let (client, mut server) = tokio::io::duplex(256 * 1024);
        let drain = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            while let Ok(n) = server.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        let stats = Arc::new(TransferStats::new());
        let start = Instant::now();
        let elapsed = send_data(client, stats.clone(), Duration::from_millis(200)).await;
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(elapsed >= 200);
        assert!(stats.packets() > 0);
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_stops_when_reader_never_reads() {
        let (client, _server) = tokio::io::duplex(1024);
        let stats = Arc::new(TransferStats::new());
        let start = Instant::now();
        send_data(client, stats.clone(), Duration::from_millis(100)).await;
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(stats.packets(), 0);
    }

    #[tokio::test]
    async fn test_receive_counts_bytes() {
        let (mut server, client) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            server.write_all(&vec![7u8; 100_000]).await.unwrap();
        });
        let stats = Arc::new(TransferStats::new());
        receive_data(
            client,
            stats.clone(),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(stats.bytes(), 100_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_throughput_over_known_duration() {
        let (mut server, client) = tokio::io::duplex(64 * 1024);
        let stats = Arc::new(TransferStats::new());
        tokio::spawn(async move {
            server.write_all(&vec![7u8; 1_000_000]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2000)).await;
        });

        let elapsed_ms = receive_data(
            client,
            stats.clone(),
            Duration::from_secs(15),
            Duration::from_secs(14),
        )
        .await
        .unwrap();
        assert_eq!(stats.bytes(), 1_000_000);
        assert_eq!(elapsed_ms, 2000);
        // 8 * 1_000_000 bits over 2000 ms
        assert_eq!(crate::stats::throughput_mbps(stats.bytes(), elapsed_ms), 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_capped_at_max_elapsed() {
        let (mut server, client) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            loop {
                if server.write_all(&[1u8; 1000]).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        let stats = Arc::new(TransferStats::new());
        let elapsed_ms = receive_data(
            client,
            stats.clone(),
            Duration::from_secs(15),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(elapsed_ms, 1000);
        assert_eq!(stats.bytes(), 11_000);
    }

    #[tokio::test]
    async fn test_receive_timeout_is_error() {
        let (_server, client) = tokio::io::duplex(1024);
        let stats = Arc::new(TransferStats::new());
        let result = receive_data(
            client,
            stats,
            Duration::from_millis(50),
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_err());
    }
}
