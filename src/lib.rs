//! ndtc - NDT network diagnostic client
//!
//! Runs the client side of the NDT throughput test protocol: login and
//! queueing on the control connection, upload (C2S), download (S2C) and
//! META sub-tests, then interpretation of the server's diagnostic counters.
//!
//! # Library Usage
//!
//! ```ignore
//! use ndtc::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig {
//!         host: "ndt.example.net".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let client = Client::new(config);
//!     let report = client.run(None).await?;
//!
//!     if let Some(s2c) = report.s2c {
//!         println!("Download: {:.2} Mbps", s2c.local_mbps);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`client`] - Session state machine
//! - [`protocol`], [`codec`], [`control`] - Wire format and control channel
//! - [`subtest`] - C2S, S2C and META engines
//! - [`results`] - Diagnostic counter parsing and link classification
//! - [`net`], [`tls`], [`tcp`] - Connections and data transfer

pub mod client;
pub mod codec;
pub mod config;
pub mod control;
pub mod net;
pub mod output;
pub mod protocol;
pub mod results;
pub mod stats;
pub mod subtest;
pub mod tcp;
pub mod tls;

pub use client::{Client, ClientConfig, SessionError, SessionReport, SessionStatus};
pub use protocol::{Message, MessageType, TestKind, TestSet};
pub use results::{DiagnosticCounters, LinkClassification};
