//! ndtc - NDT network diagnostic client

use std::io::{self, Write};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ndtc::client::{Client, ClientConfig};
use ndtc::config::{Config, Timings};
use ndtc::net::AddressFamily;
use ndtc::output::{output_event_plain, output_json, output_plain};
use ndtc::protocol::{PROTOCOL_VERSION, TestSet};
use ndtc::stats::ProgressEvent;
use ndtc::tls::TlsClientConfig;

/// Initialize logging with optional file output
fn init_logging(log_file: Option<&str>, log_level: Option<&str>) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = log_level.unwrap_or("warn");
    let env_filter =
        EnvFilter::from_default_env().add_directive(format!("ndtc={}", level).parse()?);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time()
        .with_writer(io::stderr);

    if let Some(file_path) = log_file {
        // Expand tilde to home directory
        let expanded_path = if let Some(rest) = file_path.strip_prefix("~/") {
            dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(file_path))
        } else {
            PathBuf::from(file_path)
        };

        if let Some(parent) = expanded_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file_appender = tracing_appender::rolling::daily(
            expanded_path
                .parent()
                .unwrap_or_else(|| std::path::Path::new(".")),
            expanded_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("ndtc.log")),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Keep guard alive for the duration of the program
        std::mem::forget(guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "ndtc")]
#[command(author, version, about = "Network diagnostic throughput test client")]
struct Cli {
    /// NDT server host
    #[arg(value_name = "HOST", env = "NDTC_HOST")]
    host: Option<String>,

    /// Use a named server from the config file
    #[arg(short = 's', long)]
    server: Option<String>,

    /// Control port (default 3001, or 3010 with --tls)
    #[arg(short, long, env = "NDTC_PORT")]
    port: Option<u16>,

    /// Connect over TLS
    #[arg(long)]
    tls: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Extra CA bundle (PEM) for the server certificate
    #[arg(long)]
    tls_ca: Option<String>,

    /// Client certificate (PEM), for servers that require one
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<String>,

    /// Client private key (PEM)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<String>,

    /// Tests to request (c2s, s2c, meta, upload, download, all)
    #[arg(short = 'T', long, value_parser = parse_tests)]
    tests: Option<TestSet>,

    /// Use IPv4 only
    #[arg(short = '4', long, conflicts_with = "ipv6")]
    ipv4: bool,

    /// Use IPv6 only
    #[arg(short = '6', long)]
    ipv6: bool,

    /// Local address to bind outgoing connections to
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Upload test duration
    #[arg(long, value_parser = parse_duration)]
    upload_time: Option<Duration>,

    /// Connect timeout
    #[arg(long, value_parser = parse_duration)]
    connect_timeout: Option<Duration>,

    /// JSON output
    #[arg(long)]
    json: bool,

    /// Suppress progress output
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Also save the JSON report to this file
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// User-agent the META browser name is derived from
    #[arg(long, env = "NDTC_USER_AGENT")]
    user_agent: Option<String>,

    /// Application name reported in the META test
    #[arg(long)]
    application: Option<String>,

    /// Log file path (e.g., "~/.config/ndtc/ndtc.log")
    #[arg(long, env = "NDTC_LOG_FILE")]
    log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "NDTC_LOG_LEVEL")]
    log_level: Option<String>,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_tests(s: &str) -> Result<TestSet, String> {
    s.parse::<TestSet>()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config file (falls back to defaults if not found)
    let file_config = Config::load().unwrap_or_default();

    let log_file = cli
        .log_file
        .as_ref()
        .or(file_config.client.log_file.as_ref());
    let log_level = cli
        .log_level
        .as_ref()
        .or(file_config.client.log_level.as_ref());
    init_logging(log_file.map(|s| s.as_str()), log_level.map(|s| s.as_str()))?;

    let config = build_config(&cli, &file_config)?;
    let json_output = cli.json || file_config.client.json_output.unwrap_or(false);

    let client = Arc::new(Client::new(config));

    // Ctrl-C stops the session before its next sub-test
    let cancel_client = client.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping after the current test...");
            cancel_client.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(100);
    let quiet = cli.quiet;
    let print_handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if quiet {
                continue;
            }
            eprint!("{}", output_event_plain(&event));
            let _ = io::stderr().flush();
        }
    });

    let report = client.run(Some(tx)).await?;
    let _ = print_handle.await;

    let output_str = if json_output {
        output_json(&report)
    } else {
        output_plain(&report)
    };
    println!("{}", output_str);

    if let Some(path) = cli.output {
        ndtc::output::json::save_json(&report, &path)?;
        info!("Results saved to {}", path.display());
    }

    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Merge CLI flags over the selected server preset over the `[client]` table.
fn build_config(cli: &Cli, file_config: &Config) -> Result<ClientConfig> {
    let defaults = &file_config.client;
    let preset = match cli.server {
        Some(ref name) => Some(
            file_config
                .get_server(name)
                .with_context(|| format!("no server named '{}' in config file", name))?,
        ),
        None => None,
    };

    let host = cli
        .host
        .clone()
        .or_else(|| preset.map(|p| p.host.clone()))
        .or_else(|| defaults.host.clone())
        .context("no server host given")?;
    let port = cli
        .port
        .or_else(|| preset.and_then(|p| p.port))
        .or(defaults.port);

    let tls = TlsClientConfig {
        enabled: cli.tls || preset.and_then(|p| p.tls).or(defaults.tls).unwrap_or(false),
        ca_path: cli.tls_ca.clone().or_else(|| defaults.tls_ca.clone()),
        cert_path: cli.tls_cert.clone().or_else(|| defaults.tls_cert.clone()),
        key_path: cli.tls_key.clone().or_else(|| defaults.tls_key.clone()),
        insecure: cli.insecure || defaults.tls_insecure.unwrap_or(false),
    };

    let address_family = if cli.ipv4 {
        AddressFamily::V4Only
    } else if cli.ipv6 {
        AddressFamily::V6Only
    } else {
        match defaults.address_family {
            Some(ref s) => s
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid address family '{}'", s))?,
            None => AddressFamily::default(),
        }
    };

    let tests = match (cli.tests, defaults.tests.as_deref()) {
        (Some(tests), _) => tests,
        (None, Some(s)) => s.parse().map_err(anyhow::Error::msg)?,
        (None, None) => TestSet::default(),
    };

    let mut timings = Timings::default().with_overrides(&file_config.timings);
    if let Some(d) = cli.upload_time {
        timings.c2s_duration = d;
    }
    if let Some(d) = cli.connect_timeout {
        timings.connect_timeout = d;
    }

    Ok(ClientConfig {
        host,
        port,
        tls,
        address_family,
        bind_ip: cli.bind,
        tests,
        client_version: PROTOCOL_VERSION.to_string(),
        application: cli
            .application
            .clone()
            .or_else(|| defaults.application.clone())
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
        user_agent: cli
            .user_agent
            .clone()
            .or_else(|| defaults.user_agent.clone())
            .or_else(|| Some(format!("ndtc/{}", env!("CARGO_PKG_VERSION")))),
        timings,
    })
}
