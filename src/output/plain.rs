//! Plain text output

use crate::client::{SessionReport, SessionStatus};
use crate::results::LinkClassification;
use crate::stats::{ProgressEvent, bytes_to_human, mbps_to_human};
use crate::subtest::TestOutcome;

pub fn output_plain(report: &SessionReport) -> String {
    let mut output = String::new();

    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push_str("  ndtc Test Results\n");
    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push('\n');

    output.push_str(&format!("  Server:      {}\n", report.server));
    if let Some(ref version) = report.server_version {
        output.push_str(&format!(
            "  Version:     {} ({})\n",
            version.version, version.server_type
        ));
    }
    output.push_str(&format!(
        "  Duration:    {:.2}s\n",
        report.duration_ms as f64 / 1000.0
    ));
    let status = match report.status {
        SessionStatus::Completed => "completed".to_string(),
        SessionStatus::Stopped => "stopped by user".to_string(),
        SessionStatus::Failed { ref message } => format!("failed: {}", message),
    };
    output.push_str(&format!("  Status:      {}\n", status));
    output.push('\n');

    if let Some(ref c2s) = report.c2s {
        push_throughput(&mut output, "Upload (C2S)", c2s, "client", "server");
    }
    if let Some(ref s2c) = report.s2c {
        push_throughput(&mut output, "Download (S2C)", s2c, "server", "client");
    }
    if report.meta.as_ref().is_some_and(|m| m.completed) {
        output.push_str("  META:        sent\n\n");
    }

    if !report.errors.is_empty() {
        output.push_str("  Errors:\n");
        for e in &report.errors {
            output.push_str(&format!("    {}\n", e));
        }
        output.push('\n');
    }

    if let Some(ref c) = report.classification {
        push_classification(&mut output, c);
    }

    output.push_str("─".repeat(60).as_str());
    output.push('\n');

    output
}

fn push_throughput(
    output: &mut String,
    title: &str,
    outcome: &TestOutcome,
    sender: &str,
    receiver: &str,
) {
    output.push_str(&format!("  {}:\n", title));
    if !outcome.completed {
        output.push_str(&format!(
            "    incomplete: {}\n\n",
            outcome.error.as_deref().unwrap_or("unknown error")
        ));
        return;
    }
    let (sent, received) = if sender == "client" {
        (outcome.local_mbps, outcome.server_mbps)
    } else {
        (outcome.server_mbps, outcome.local_mbps)
    };
    output.push_str(&format!("    Transfer:    {}\n", bytes_to_human(outcome.bytes)));
    output.push_str(&format!("    {:<12} {}\n", format!("{}:", sender), mbps_to_human(sent)));
    output.push_str(&format!(
        "    {:<12} {}\n",
        format!("{}:", receiver),
        mbps_to_human(received)
    ));
    output.push('\n');
}

fn push_classification(output: &mut String, c: &LinkClassification) {
    output.push_str("  Diagnosis:\n");
    output.push_str(&format!("    Link:        {}\n", c.link));
    output.push_str(&format!("    Duplex:      {}\n", c.duplex));
    if let Some(rtt) = c.average_rtt_ms {
        output.push_str(&format!("    RTT:         {:.2}ms\n", rtt));
    }
    if let Some(jitter) = c.jitter_ms {
        output.push_str(&format!("    Jitter:      {:.2}ms\n", jitter));
    }
    if let Some(pct) = c.out_of_order_pct {
        output.push_str(&format!("    Reordering:  {:.2}%\n", pct));
    }
    if let (Some(rcv), Some(snd), Some(net)) = (
        c.receiver_limited_pct,
        c.sender_limited_pct,
        c.network_limited_pct,
    ) {
        output.push_str(&format!(
            "    Limited by:  receiver {:.1}%, sender {:.1}%, network {:.1}%\n",
            rcv, snd, net
        ));
    }
    if c.half_duplex {
        output.push_str("    Warning: link appears to be half duplex\n");
    }
    if c.bad_cable {
        output.push_str("    Warning: possible bad cable or NIC\n");
    }
    if c.congestion {
        output.push_str("    Warning: other traffic is congesting the link\n");
    }
    if c.excessive_loss {
        output.push_str("    Warning: excessive packet loss\n");
    }
    if let Some(kb) = c.recommended_rcvbuf_kb {
        output.push_str(&format!(
            "    Receive buffer limits throughput; {:.0} KB would fill the link\n",
            kb
        ));
    }
    if let Some(kb) = c.recommended_sndbuf_kb {
        output.push_str(&format!(
            "    Send buffer limits throughput; raise it above {:.0} KB\n",
            kb
        ));
    }
    for (label, queuing) in [("Upload", c.c2s_queuing), ("Download", c.s2c_queuing)] {
        if let Some(q) = queuing {
            let marker = if q.excessive { " (excessive)" } else { "" };
            output.push_str(&format!("    {} queuing: {:.1}%{}\n", label, q.pct, marker));
        }
    }
    output.push('\n');
}

/// One line per progress event, for stderr.
pub fn output_event_plain(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::Status(message) => format!("{}\n", message),
        ProgressEvent::Queued { wait_secs } => {
            format!("Another client is testing, waiting about {}s\n", wait_secs)
        }
        ProgressEvent::Throughput { test, mbps } => {
            format!("  {}  {}\n", test, mbps_to_human(*mbps))
        }
        ProgressEvent::Warning(message) => format!("warning: {}\n", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TestKind;

    #[test]
    fn test_event_lines() {
        assert_eq!(
            output_event_plain(&ProgressEvent::Queued { wait_secs: 120 }),
            "Another client is testing, waiting about 120s\n"
        );
        let line = output_event_plain(&ProgressEvent::Throughput {
            test: TestKind::C2s,
            mbps: 94.3,
        });
        assert!(line.contains("C2S throughput"));
        assert!(line.contains("94.3 Mbps"));
    }
}
