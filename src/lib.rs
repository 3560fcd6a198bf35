//! dnswatch - A DNS sinkhole proxy with a live per-domain query table.
//!
//! Queries for blocklisted domains are answered locally with a configured
//! address, everything else is relayed to an upstream resolver. Every query
//! is tallied per domain, and a periodic view ranks the busiest domains.

pub mod dns;
pub mod error;
pub mod filter;
pub mod hits;
pub mod proxy;
pub mod resolver;
pub mod stats;
pub mod transport;
pub mod upstream;
pub mod view;

pub use error::{Error, Result};
pub use filter::Blocklist;
pub use hits::Telemetry;
pub use proxy::{Proxy, ProxyConfig, ProxyHandle};
