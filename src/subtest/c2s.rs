//! Client-to-server throughput test

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::{EngineContext, TestOutcome, open_data_connection};
use crate::control::{ControlChannel, ExchangeError};
use crate::protocol::{MessageType, TestKind};
use crate::stats::{self, TransferStats};
use crate::tcp::{self, UPLOAD_BUFFER_SIZE};

pub async fn run<S>(control: &mut ControlChannel<S>, ctx: &EngineContext<'_>) -> TestOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut outcome = TestOutcome::default();
    let result = exchange(control, ctx, &mut outcome).await;
    if let Err(ref e) = result {
        warn!("C2S test incomplete: {:#}", e);
    }
    outcome.finish(result)
}

async fn exchange<S>(
    control: &mut ControlChannel<S>,
    ctx: &EngineContext<'_>,
    outcome: &mut TestOutcome,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let data = open_data_connection(control, ctx).await?;
    ctx.progress
        .status(format!(
            "Running {}s outbound test (client to server)",
            ctx.timings.c2s_duration.as_secs_f64()
        ))
        .await;

    let stats = Arc::new(TransferStats::new());
    let sampler = stats::spawn_sampler(
        stats.clone(),
        TestKind::C2s,
        ctx.timings.sample_interval,
        ctx.progress.clone(),
    );
    let elapsed_ms = tcp::send_data(data, stats.clone(), ctx.timings.c2s_duration).await;
    sampler.abort();

    outcome.bytes = stats.bytes();
    outcome.local_mbps =
        stats::throughput_mbps(stats.packets() * UPLOAD_BUFFER_SIZE as u64, elapsed_ms);
    debug!(
        "C2S local throughput {:.3} Mbps ({} packets)",
        outcome.local_mbps,
        stats.packets()
    );

    let msg = control.expect(MessageType::TestMsg).await?;
    let kbps: f64 = msg
        .body_str()
        .trim()
        .parse()
        .map_err(|_| ExchangeError::Malformed {
            msg_type: msg.msg_type,
            body: msg.body_str(),
        })?;
    outcome.server_mbps = kbps / 1000.0;
    info!(
        "C2S: client {:.2} Mbps, server {:.2} Mbps",
        outcome.local_mbps, outcome.server_mbps
    );

    control.expect(MessageType::TestFinalize).await?;
    Ok(())
}
