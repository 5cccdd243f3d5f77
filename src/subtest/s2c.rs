//! Server-to-client throughput test

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::{EngineContext, TestOutcome, open_data_connection};
use crate::control::{ControlChannel, ExchangeError};
use crate::protocol::{MessageType, S2cServerReport, TestKind};
use crate::stats::{self, TransferStats};
use crate::tcp;

pub async fn run<S>(control: &mut ControlChannel<S>, ctx: &EngineContext<'_>) -> TestOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut outcome = TestOutcome::default();
    let result = exchange(control, ctx, &mut outcome).await;
    if let Err(ref e) = result {
        warn!("S2C test incomplete: {:#}", e);
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
        .status("Running inbound test (server to client)")
        .await;

    let stats = Arc::new(TransferStats::new());
    let sampler = stats::spawn_sampler(
        stats.clone(),
        TestKind::S2c,
        ctx.timings.sample_interval,
        ctx.progress.clone(),
    );
    let received = tcp::receive_data(
        data,
        stats.clone(),
        ctx.timings.s2c_read_timeout,
        ctx.timings.s2c_max_elapsed,
    )
    .await;
    sampler.abort();
    outcome.bytes = stats.bytes();
    let elapsed_ms = received?;

    outcome.local_mbps = stats::throughput_mbps(stats.bytes(), elapsed_ms);
    debug!(
        "S2C local throughput {:.3} Mbps ({} bytes in {} ms)",
        outcome.local_mbps,
        stats.bytes(),
        elapsed_ms
    );

    let msg = control.expect(MessageType::TestMsg).await?;
    let report = S2cServerReport::parse(&msg.body).ok_or_else(|| ExchangeError::Malformed {
        msg_type: msg.msg_type,
        body: msg.body_str(),
    })?;
    outcome.server_mbps = report.throughput_kbps / 1000.0;
    outcome.unsent_bytes = Some(report.unsent_bytes);
    outcome.server_sent_bytes = Some(report.total_sent_bytes);

    let own_kbps = outcome.local_mbps * 1000.0;
    control
        .send(MessageType::TestMsg, own_kbps.to_string().as_bytes())
        .await?;
    info!(
        "S2C: client {:.2} Mbps, server {:.2} Mbps",
        outcome.local_mbps, outcome.server_mbps
    );

    let mut diagnostics = String::new();
    loop {
        let msg = control
            .recv_timeout(ctx.timings.s2c_diagnostics_timeout)
            .await?;
        match msg.msg_type {
            MessageType::TestMsg => diagnostics.push_str(&msg.body_str()),
            MessageType::TestFinalize => break,
            got => {
                return Err(ExchangeError::Unexpected {
                    expected: MessageType::TestFinalize,
                    got,
                    body: msg.body_str(),
                }
                .into());
            }
        }
    }
    if !diagnostics.is_empty() {
        outcome.diagnostics = Some(diagnostics);
    }
    Ok(())
}
