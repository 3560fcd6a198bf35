//! Transport layer implementations for the DNS sinkhole.
//!
//! Provides UDP and TCP transports for receiving DNS queries from clients.
//! Both hand every query to the shared [`Resolver`](crate::resolver::Resolver)
//! and write back whatever it answers.

pub mod tcp;
pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, info};

use crate::resolver::Resolution;

/// Transport protocol identifier for logging.
#[derive(Debug, Clone, Copy)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Logger for DNS query events.
#[derive(Debug, Clone, Copy)]
pub struct QueryLogger {
    protocol: Protocol,
}

impl QueryLogger {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    /// Log the outcome of one query.
    pub fn log(&self, resolution: &Resolution, client: SocketAddr, elapsed: Duration) {
        let total_ms = elapsed.as_secs_f64() * 1000.0;

        match resolution {
            Resolution::Answered { classification, .. } if classification.blocked => {
                self.blocked(&classification.domain, client, total_ms)
            }
            Resolution::Answered { classification, .. } if classification.upstream_failed => {
                self.unanswered(&classification.domain, client, total_ms)
            }
            Resolution::Answered { classification, .. } => self.forwarded(
                &classification.domain,
                client,
                total_ms,
                classification.answers.len(),
            ),
            Resolution::Rejected { reason, .. } => {
                debug!(protocol = self.protocol.as_str(), %client, %reason, "REJECTED")
            }
        }
    }

    pub fn blocked(&self, domain: &str, client: SocketAddr, total_ms: f64) {
        info!(
            protocol = self.protocol.as_str(),
            %client,
            domain,
            total_ms,
            "BLOCKED"
        );
    }

    pub fn forwarded(&self, domain: &str, client: SocketAddr, total_ms: f64, answers: usize) {
        debug!(
            protocol = self.protocol.as_str(),
            %client,
            domain,
            answers,
            total_ms,
            "FORWARDED"
        );
    }

    pub fn unanswered(&self, domain: &str, client: SocketAddr, total_ms: f64) {
        debug!(
            protocol = self.protocol.as_str(),
            %client,
            domain,
            total_ms,
            "UNANSWERED"
        );
    }
}
