//! Upstream forwarding.
//!
//! Each forwarded query gets its own ephemeral UDP socket connected to the
//! upstream, so replies are routed by the kernel rather than by a shared
//! pending-id table. One send, one bounded wait, no retries.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::dns::{DnsHeader, DnsQuery, ParseError, UpstreamReply};

/// Largest UDP payload; EDNS replies can exceed the inbound packet size.
const MAX_UDP_REPLY: usize = 65_535;

/// Why the upstream produced no usable answer.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed upstream reply: {0}")]
    Malformed(#[from] ParseError),
}

/// A single upstream resolver.
#[derive(Debug, Clone)]
pub struct Upstream {
    addr: SocketAddr,
    timeout: Duration,
}

impl Upstream {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send `packet` (the client's query, unmodified) and wait for the
    /// matching reply.
    ///
    /// The timeout bounds the whole exchange, including socket setup.
    pub async fn forward(
        &self,
        query: &DnsQuery,
        packet: &[u8],
    ) -> Result<UpstreamReply, ForwardError> {
        match tokio::time::timeout(self.timeout, self.exchange(query.id(), packet)).await {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Timeout(self.timeout)),
        }
    }

    async fn exchange(&self, id: u16, packet: &[u8]) -> Result<UpstreamReply, ForwardError> {
        let local: SocketAddr = if self.addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.addr).await?;
        socket.send(packet).await?;

        let mut buf = vec![0u8; MAX_UDP_REPLY];
        loop {
            let len = socket.recv(&mut buf).await?;
            let response = &buf[..len];

            match DnsHeader::parse(response) {
                Ok(header) if header.id == id => return Ok(UpstreamReply::parse(response)?),
                _ => debug!(upstream = %self.addr, len, "ignoring unmatched upstream datagram"),
            }
        }
    }
}
