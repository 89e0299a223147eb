//! dxhub - a real-time DX-cluster aggregation server.
//!
//! Ingests spot reports from heterogeneous upstream feeds (RBN-style
//! skimmer telnet, PSKReporter MQTT, DXSpider peering links, upstream human
//! clusters), normalizes them into a canonical [`spot::Spot`], runs a
//! multi-stage quality pipeline (dedup, consensus call correction,
//! harmonic suppression, frequency averaging), and broadcasts the
//! surviving stream to telnet subscribers.
//!
//! # Example
//!
//! ```rust
//! use dxhub::parser::extract_fields;
//!
//! let line = "DX de EA5WU-#:    7018.3  RW1M           CW    19 dB  18 WPM  CQ      2259Z";
//! let raw = extract_fields(line).expect("valid spot line");
//! assert_eq!(raw.dx_call, "RW1M");
//! assert_eq!(raw.report, Some(19));
//! ```

pub mod adaptive;
pub mod archive;
pub mod averager;
pub mod buffer;
pub mod callsign;
pub mod client;
pub mod config;
pub mod correction;
pub mod cty;
pub mod dedup;
pub mod filter;
pub mod harmonics;
pub mod known;
pub mod metrics;
pub mod mode;
pub mod mqtt;
pub mod parser;
pub mod peer;
pub mod pipeline;
pub mod server;
pub mod skew;
pub mod source;
pub mod spot;
pub mod stats;
pub mod uls;

pub use config::Config;
pub use dedup::Deduplicator;
pub use filter::Filter;
pub use parser::{extract_fields, looks_like_spot, ParseError, SpotParser};
pub use pipeline::Pipeline;
pub use server::BroadcastServer;
pub use spot::{CallMetadata, SourceType, Spot};
pub use stats::Tracker;
